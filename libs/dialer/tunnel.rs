use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio_rustls::TlsConnector;

use crate::{Connection, DialError, Dialer, Network, ProxyClient, TargetAddr, lookup_host_via};

pub const HEADER_SECRET: &str = "Misha-Secret";
pub const HEADER_NETWORK: &str = "Network";

/// What the relay's other visitors look like.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/87.0.4280.88 Safari/537.36";

/// Reaches targets through the relay: TLS to the relay, then an HTTP/1.1
/// `CONNECT` dressed up as ordinary browser traffic, with the shared secret
/// and the requested transport in headers.
pub struct HttpsTunnel {
    server_host: String,
    server_port: u16,
    secret: String,
    dns_upstream: SocketAddr,
    dialer: Dialer,
    tls: TlsConnector,
}

impl HttpsTunnel {
    pub fn new(
        server_addr: &str,
        secret: impl Into<String>,
        dns_upstream: SocketAddr,
        dialer: Dialer,
    ) -> Result<Self, DialError> {
        let (server_host, server_port) = split_host_port(server_addr, 443)?;

        Ok(Self {
            server_host,
            server_port,
            secret: secret.into(),
            dns_upstream,
            dialer,
            tls: TlsConnector::from(Arc::new(client_tls_config())),
        })
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    pub async fn dial_with_headers(
        &self,
        network: Network,
        target: TargetAddr,
        extra: &HeaderMap,
    ) -> Result<Connection, DialError> {
        let relay_ip = lookup_host_via(self.dns_upstream, &self.server_host, &self.dialer)
            .await
            .map_err(|source| DialError::RelayResolve {
                host: self.server_host.clone(),
                source,
            })?;

        let tcp = self
            .dialer
            .connect_tcp(SocketAddr::new(relay_ip, self.server_port))
            .await?;
        let local = tcp.local_addr().ok();

        let server_name = ServerName::try_from(self.server_host.clone())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut tls = self.tls.connect(server_name, tcp).await?;

        let leftover = self.handshake(&mut tls, network, &target, extra).await?;

        // Anything the relay already relayed behind the `200 OK` belongs to
        // the target and must be replayed.
        let stream: crate::BoxConn = if leftover.is_empty() {
            Box::new(tls)
        } else {
            Box::new(crate::Prefixed::new(leftover, tls))
        };

        Ok(Connection {
            stream,
            local,
            remote: target,
        })
    }

    async fn handshake<S>(
        &self,
        conn: &mut S,
        network: Network,
        target: &TargetAddr,
        extra: &HeaderMap,
    ) -> Result<bytes::Bytes, DialError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\n");
        request.push_str(&format!("Host: {}:{}\r\n", self.server_host, self.server_port));
        request.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
        request.push_str("Proxy-Connection: keep-alive\r\n");
        request.push_str("Connection: keep-alive\r\n");
        request.push_str(&format!("{HEADER_SECRET}: {}\r\n", self.secret));
        request.push_str(&format!("{HEADER_NETWORK}: {network}\r\n"));
        for (name, value) in extra {
            if let Ok(value) = value.to_str() {
                request.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        request.push_str("\r\n");

        conn.write_all(request.as_bytes()).await?;
        conn.flush().await?;

        // Hand-rolled HTTP/1.1 status parse; hyper does the same for CONNECT.
        let mut buf = [0u8; 8192];
        let mut pos = 0;
        loop {
            let n = conn.read(&mut buf[pos..]).await?;
            if n == 0 {
                return Err(DialError::BadResponse);
            }
            pos += n;

            let received = &buf[..pos];
            if let Some(head_end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = &received[..head_end];

                if head.starts_with(b"HTTP/1.1 200") || head.starts_with(b"HTTP/1.0 200") {
                    return Ok(bytes::Bytes::copy_from_slice(&received[head_end + 4..]));
                }

                let status_line = head.split(|&b| b == b'\r').next().unwrap_or_default();
                return Err(DialError::Refused(
                    String::from_utf8_lossy(status_line).into_owned(),
                ));
            }

            if pos == buf.len() {
                return Err(DialError::BadResponse);
            }
        }
    }
}

#[async_trait]
impl ProxyClient for HttpsTunnel {
    async fn dial(&self, network: Network, target: TargetAddr) -> Result<Connection, DialError> {
        self.dial_with_headers(network, target, &HeaderMap::new())
            .await
    }

    fn via(&self) -> &'static str {
        "HTTPS"
    }
}

pub(crate) fn client_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), DialError> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || (host.starts_with('[') && host.ends_with(']')) => {
            let port = port
                .parse()
                .map_err(|_| DialError::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;

            Ok((host.trim_matches(['[', ']']).to_owned(), port))
        }
        _ => Ok((addr.to_owned(), default_port)),
    }
}
