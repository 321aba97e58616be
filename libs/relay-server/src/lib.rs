//! The relay: an HTTPS origin that tunnels for clients carrying the shared
//! secret and impersonates a decoy website for everyone else.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod limit;

pub use limit::RateLimited;

use std::convert::Infallible;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use dialer::{HEADER_NETWORK, HEADER_SECRET, Network, UdpStream, exchange};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt as _, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use url::Url;

/// Idle cutoff for tunnelled UDP targets, which never signal EOF.
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(30);

type Body = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type DecoyClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>;

pub struct RelayServer {
    inner: Arc<Inner>,
}

struct Inner {
    secret: String,
    decoy: Url,
    rate_limit: Option<u64>,
    decoy_client: DecoyClient,
}

impl RelayServer {
    /// `rate_limit` caps the decoy's egress in bytes per second; `None`
    /// serves the decoy unthrottled.
    pub fn new(secret: impl Into<String>, decoy: Url, rate_limit: Option<u64>) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            inner: Arc::new(Inner {
                secret: secret.into(),
                decoy,
                rate_limit,
                decoy_client: Client::builder(TokioExecutor::new()).build(https),
            }),
        }
    }

    /// Accept loop: TLS handshake, then one HTTP/1.1 connection each.
    pub async fn run(&self, listener: TcpListener, tls: TlsAcceptor) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept")?;

            let tls = tls.clone();
            let server = self.clone();
            tokio::spawn(async move {
                let stream = match tls.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(%peer, "TLS handshake failed: {e}");
                        return;
                    }
                };

                server.serve_stream(stream, peer).await;
            });
        }
    }

    /// Serves one already-established connection. Split out of [`Self::run`]
    /// so tests can drive the server over any duplex stream.
    pub async fn serve_stream<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = self.inner.clone();
        let service = service_fn(move |req| {
            let inner = inner.clone();
            async move { Ok::<_, Infallible>(inner.handle(req, peer).await) }
        });

        let connection = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        if let Err(e) = connection.await {
            tracing::debug!(%peer, "Connection error: {e}");
        }
    }
}

impl Clone for RelayServer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Inner {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Body> {
        let authorized = req
            .headers()
            .get(HEADER_SECRET)
            .is_some_and(|secret| secret.as_bytes() == self.secret.as_bytes());

        if authorized {
            self.tunnel(req, peer).await
        } else {
            self.decoy(req, peer).await
        }
    }

    /// Tunnel mode: dial the target named by the request and splice.
    async fn tunnel(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<Body> {
        req.headers_mut().remove(HEADER_SECRET);
        let network = req
            .headers_mut()
            .remove(HEADER_NETWORK)
            .and_then(|value| value.to_str().ok()?.parse::<Network>().ok())
            .unwrap_or(Network::Tcp);

        let Some((host, port)) = target_of(&req) else {
            return status_page(StatusCode::BAD_REQUEST, "missing target host");
        };

        tracing::info!(%peer, %network, target = %format!("{host}:{port}"), "Tunnel dial");

        let target = match resolve_target(&host, port, network).await {
            Ok(target) => target,
            Err(e) => {
                tracing::info!(%peer, %host, "Failed to resolve target: {e}");
                return status_page(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            }
        };

        if network.is_udp() {
            let socket = match dialer::Dialer::default().connect_udp(target).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::info!(%peer, %target, "Failed to dial UDP target: {e}");
                    return status_page(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
                }
            };

            return splice_upgrade(req, UdpStream::new(socket), Some(UDP_READ_TIMEOUT));
        }

        let stream = match dialer::Dialer::default().connect_tcp(target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::info!(%peer, %target, "Failed to dial TCP target: {e}");
                return status_page(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            }
        };

        if req.method() == Method::CONNECT {
            return splice_upgrade(req, stream, None);
        }

        // A plain proxy request with the secret: one HTTP exchange with the
        // target over the connection we just dialed.
        self.forward(req, stream, peer).await
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Response<Body> {
        let handshake = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await;
        let (mut sender, connection) = match handshake {
            Ok(parts) => parts,
            Err(e) => {
                tracing::info!(%peer, "Target handshake failed: {e}");
                return status_page(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            }
        };
        tokio::spawn(async move {
            let _ = connection.await;
        });

        match sender.send_request(req).await {
            Ok(response) => response.map(|body| body.map_err(into_boxed_error).boxed()),
            Err(e) => {
                tracing::info!(%peer, "Forwarding request failed: {e}");
                status_page(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
            }
        }
    }

    /// Decoy mode: impersonate the configured website.
    async fn decoy(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<Body> {
        tracing::info!(%peer, decoy = %self.decoy, "Serving decoy content");

        req.headers_mut().remove(HEADER_SECRET);
        req.headers_mut().remove(HEADER_NETWORK);
        // The decoy client derives the Host header from the rewritten URI.
        req.headers_mut().remove(http::header::HOST);

        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(match self.decoy.scheme() {
            "https" => http::uri::Scheme::HTTPS,
            _ => http::uri::Scheme::HTTP,
        });
        let authority = self.decoy.authority().parse();
        parts.authority = match authority {
            Ok(authority) => Some(authority),
            Err(e) => {
                tracing::error!(decoy = %self.decoy, "Invalid decoy authority: {e}");
                return status_page(StatusCode::BAD_GATEWAY, "bad decoy origin");
            }
        };
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        *req.uri_mut() = match Uri::from_parts(parts) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::debug!(%peer, "Failed to rewrite request URI: {e}");
                return status_page(StatusCode::BAD_REQUEST, "bad request URI");
            }
        };

        match self.decoy_client.request(req).await {
            Ok(response) => response.map(|body| match self.rate_limit {
                Some(rate) => RateLimited::new(body, rate)
                    .map_err(into_boxed_error)
                    .boxed(),
                None => body.map_err(into_boxed_error).boxed(),
            }),
            Err(e) => {
                tracing::warn!(%peer, decoy = %self.decoy, "Decoy fetch failed: {e}");
                status_page(StatusCode::BAD_GATEWAY, "upstream unavailable")
            }
        }
    }
}

/// Answers `200 OK` and splices the upgraded connection with `target`.
fn splice_upgrade<T>(req: Request<Incoming>, target: T, idle_timeout: Option<Duration>) -> Response<Body>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::debug!("Upgrade failed: {e}");
                return;
            }
        };

        if let Err(e) = exchange(target, TokioIo::new(upgraded), idle_timeout).await {
            tracing::debug!("Tunnel closed with error: {e}");
        }
    });

    Response::new(empty_body())
}

/// The ultimate target: for CONNECT the authority form, otherwise the Host
/// with a port implied by the scheme.
fn target_of(req: &Request<Incoming>) -> Option<(String, u16)> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => req.headers().get(http::header::HOST)?.to_str().ok()?.to_owned(),
    };

    let default_port = if req.uri().scheme() == Some(&http::uri::Scheme::HTTPS) {
        443
    } else {
        80
    };

    match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => {
            Some((host.trim_matches(['[', ']']).to_owned(), port.parse().ok()?))
        }
        _ => Some((authority.trim_matches(['[', ']']).to_owned(), default_port)),
    }
}

async fn resolve_target(host: &str, port: u16, network: Network) -> std::io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;

    addrs
        .find(|addr| match network {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            Network::Tcp | Network::Udp => true,
        })
        .ok_or_else(|| std::io::Error::other(format!("no suitable address for `{host}`")))
}

fn status_page(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(
        Full::new(Bytes::from(message.to_owned()))
            .map_err(into_boxed_error)
            .boxed(),
    );
    *response.status_mut() = status;

    response
}

fn empty_body() -> Body {
    Empty::<Bytes>::new().map_err(into_boxed_error).boxed()
}

fn into_boxed_error<E>(error: E) -> Box<dyn std::error::Error + Send + Sync>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(error)
}

/// Loads the relay's certificate chain and private key from PEM files.
pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_file)
            .with_context(|| format!("Failed to open `{}`", cert_file.display()))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()
    .context("Failed to parse certificate chain")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(key_file)
            .with_context(|| format!("Failed to open `{}`", key_file.display()))?,
    ))
    .context("Failed to parse private key")?
    .context("No private key found")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid certificate/key pair")?;

    Ok(config)
}
