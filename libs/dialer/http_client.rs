use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::{BodyExt as _, Full};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::tunnel::client_tls_config;
use crate::{BoxConn, DialError, HttpsTunnel, Network, ProxyClient as _, TargetAddr, USER_AGENT};

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to parse URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("URL has no host")]
    NoHost,
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] http::Error),
    #[error("request timed out")]
    Timeout,
}

/// An HTTP client whose every request rides a fresh CONNECT tunnel through
/// the relay, so the fetch itself cannot be blocked.
///
/// Serves the DoH handler and the geo-DB refresher.
pub struct TunnelHttpClient {
    tunnel: Arc<HttpsTunnel>,
    timeout: Duration,
    tls: TlsConnector,
}

impl TunnelHttpClient {
    pub fn new(tunnel: Arc<HttpsTunnel>, timeout: Duration) -> Self {
        Self {
            tunnel,
            timeout,
            tls: TlsConnector::from(Arc::new(client_tls_config())),
        }
    }

    pub async fn get(&self, url: &str) -> Result<Response<Bytes>, HttpError> {
        self.request(Method::GET, url, &[], Bytes::new()).await
    }

    pub async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<Response<Bytes>, HttpError> {
        self.request(Method::POST, url, headers, body).await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<Response<Bytes>, HttpError> {
        let url = Url::parse(url)?;

        tokio::time::timeout(self.timeout, self.request_inner(method, &url, headers, body))
            .await
            .map_err(|_elapsed| HttpError::Timeout)?
    }

    async fn request_inner(
        &self,
        method: Method,
        url: &Url,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<Response<Bytes>, HttpError> {
        let host = url.host_str().ok_or(HttpError::NoHost)?.to_owned();
        let https = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });

        let connection = self
            .tunnel
            .dial(Network::Tcp, TargetAddr::from_name(host.clone(), port))
            .await?;

        let stream: BoxConn = if https {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

            Box::new(self.tls.connect(server_name, connection.stream).await?)
        } else {
            connection.stream
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Tunnelled HTTP connection error: {e}");
            }
        });

        let path_and_query = &url[url::Position::BeforePath..url::Position::AfterQuery];
        let mut request = Request::builder()
            .method(method)
            .uri(if path_and_query.is_empty() {
                "/"
            } else {
                path_and_query
            })
            .header(http::header::HOST, host_header(&host, port, https))
            .header(http::header::USER_AGENT, USER_AGENT);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = sender.send_request(request.body(Full::new(body))?).await?;

        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}

fn host_header(host: &str, port: u16, https: bool) -> String {
    let default_port = if https { 443 } else { 80 };

    if port == default_port {
        host.to_owned()
    } else {
        format!("{host}:{port}")
    }
}
