use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use dialer::Dialer;
use hickory_proto::op::Message;

use crate::{DnsHandler, ResolveError};

/// Plain DNS over UDP against a user-supplied upstream. The last resort when
/// the covert path is down; answers may be tampered with on the wire.
pub struct UdpHandler {
    upstream: SocketAddr,
    timeout: Duration,
    dialer: Dialer,
}

impl UdpHandler {
    pub fn new(upstream: SocketAddr, timeout: Duration, dialer: Dialer) -> Self {
        Self {
            upstream,
            timeout,
            dialer,
        }
    }
}

#[async_trait]
impl DnsHandler for UdpHandler {
    async fn lookup(&self, query: &Message) -> Result<Message, ResolveError> {
        let payload = query
            .to_vec()
            .map_err(|e| ResolveError::Upstream(format!("failed to encode query: {e}")))?;

        let exchange = async {
            let socket = self
                .dialer
                .connect_udp(self.upstream)
                .await
                .map_err(|e| ResolveError::Upstream(e.to_string()))?;

            socket
                .send(&payload)
                .await
                .map_err(|e| ResolveError::Upstream(e.to_string()))?;

            let mut buf = vec![0u8; 2000];
            loop {
                let len = socket
                    .recv(&mut buf)
                    .await
                    .map_err(|e| ResolveError::Upstream(e.to_string()))?;

                match Message::from_vec(&buf[..len]) {
                    Ok(answer) if answer.id() == query.id() => return Ok(answer),
                    Ok(_) | Err(_) => continue, // stray datagram
                }
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_elapsed| {
                ResolveError::Upstream(format!("no answer from {} in time", self.upstream))
            })?
    }

    fn name(&self) -> String {
        format!("UDP[upstream: {}, timeout: {:?}]", self.upstream, self.timeout)
    }
}
