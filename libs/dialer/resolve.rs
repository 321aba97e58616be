use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::Dialer;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves `host` with a plain UDP query against `upstream`.
///
/// The relay hostname has to be resolvable before the covert resolver chain
/// exists, so this deliberately bypasses it.
pub async fn lookup_host_via(
    upstream: SocketAddr,
    host: &str,
    dialer: &Dialer,
) -> io::Result<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }

    let name = Name::from_utf8(host).map_err(io::Error::other)?;

    let mut query = Message::new();
    query.set_id(rand::random());
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(name, RecordType::A));

    let payload = query.to_vec().map_err(io::Error::other)?;

    let socket = dialer.connect_udp(upstream).await?;
    socket.send(&payload).await?;

    let response = tokio::time::timeout(LOOKUP_TIMEOUT, async {
        let mut buf = vec![0u8; 2000];

        loop {
            let len = socket.recv(&mut buf).await?;

            match Message::from_vec(&buf[..len]) {
                Ok(response) if response.id() == query.id() => return io::Result::Ok(response),
                Ok(_) | Err(_) => continue, // stray datagram
            }
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream DNS timed out"))??;

    response
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .ok_or_else(|| io::Error::other(format!("no address records for `{host}`")))
}
