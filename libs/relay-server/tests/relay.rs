use std::net::SocketAddr;
use std::sync::Arc;

use relay_server::RelayServer;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use url::Url;

const SECRET: &str = "open sesame";

/// Runs a relay over plain TCP (the TLS accept loop is exercised separately).
async fn start_relay(decoy: &str, rate_limit: Option<u64>) -> SocketAddr {
    let server = RelayServer::new(SECRET, Url::parse(decoy).unwrap(), rate_limit);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, peer) = listener.accept().await.unwrap();
            let server = server.clone();
            tokio::spawn(async move { server.serve_stream(stream, peer).await });
        }
    });

    addr
}

async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&buf[..n]).await.unwrap();
                }
            });
        }
    });

    addr
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&buf[..n], from).await.unwrap();
        }
    });

    addr
}

/// A bare-bones HTTP origin that records each request head and serves a fixed
/// body.
async fn decoy_origin(heads: mpsc::UnboundedSender<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let heads = heads.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                heads.send(head).unwrap();

                stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 15\r\nConnection: close\r\n\r\ndecoy body data",
                    )
                    .await
                    .unwrap();
            });
        }
    });

    addr
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }

    String::from_utf8(head).unwrap()
}

async fn send_connect(
    relay: SocketAddr,
    target: SocketAddr,
    secret: Option<&str>,
    network: &str,
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(relay).await.unwrap();

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: relay.test:443\r\n");
    if let Some(secret) = secret {
        request.push_str(&format!("Misha-Secret: {secret}\r\n"));
    }
    request.push_str(&format!("Network: {network}\r\n\r\n"));

    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;

    (stream, head)
}

#[tokio::test]
async fn connect_with_secret_tunnels_tcp_bytes_both_ways() {
    let target = tcp_echo_server().await;
    let relay = start_relay("http://127.0.0.1:9/", None).await;

    let (mut stream, head) = send_connect(relay, target, Some(SECRET), "tcp").await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    stream.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();

    assert_eq!(&buf, b"PING");
}

#[tokio::test]
async fn connect_with_secret_tunnels_udp_datagrams() {
    let target = udp_echo_server().await;
    let relay = start_relay("http://127.0.0.1:9/", None).await;

    let (mut stream, head) = send_connect(relay, target, Some(SECRET), "udp").await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    stream.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();

    assert_eq!(&buf, b"PING");
}

#[tokio::test]
async fn connect_to_dead_target_is_refused() {
    let relay = start_relay("http://127.0.0.1:9/", None).await;

    // Port 9 (discard) is almost certainly closed.
    let (_stream, head) =
        send_connect(relay, "127.0.0.1:9".parse().unwrap(), Some(SECRET), "tcp").await;

    assert!(head.starts_with("HTTP/1.1 503"), "got: {head}");
}

#[tokio::test]
async fn request_without_secret_is_served_decoy_content() {
    let (heads_tx, mut heads_rx) = mpsc::unbounded_channel();
    let origin = decoy_origin(heads_tx).await;
    let relay = start_relay(&format!("http://{origin}/"), None).await;

    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream
        .write_all(
            b"GET /index.html HTTP/1.1\r\nHost: relay.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("decoy body data"), "got: {response}");

    // The origin saw the original path but none of the covert headers.
    let head = heads_rx.recv().await.unwrap();
    assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"), "got: {head}");
    assert!(!head.contains("Misha-Secret"), "got: {head}");
    assert!(!head.to_lowercase().contains("network:"), "got: {head}");
    assert!(head.contains(&format!("host: {origin}")) || head.contains(&format!("Host: {origin}")), "got: {head}");
}

#[tokio::test]
async fn wrong_secret_never_reveals_tunnel_behavior() {
    let target = tcp_echo_server().await;
    let relay = start_relay("http://127.0.0.1:9/", None).await;

    let (_stream, head) = send_connect(relay, target, Some("wrong secret"), "tcp").await;

    assert!(!head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert!(!head.to_lowercase().contains("network"), "got: {head}");
}

#[tokio::test]
async fn tls_front_door_serves_the_tunnel() {
    use rustls_pki_types::ServerName;

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_owned()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_file = dir.path().join("cert.pem");
    let key_file = dir.path().join("key.pem");
    std::fs::write(&cert_file, cert.pem()).unwrap();
    std::fs::write(&key_file, key_pair.serialize_pem()).unwrap();

    let tls_config = relay_server::load_tls_config(&cert_file, &key_file).unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let server = RelayServer::new(SECRET, Url::parse("http://127.0.0.1:9/").unwrap(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = listener.local_addr().unwrap();
    tokio::spawn(async move { server.run(listener, acceptor).await });

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let target = tcp_echo_server().await;

    let tcp = TcpStream::connect(relay).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    tls.write_all(
        format!(
            "CONNECT {target} HTTP/1.1\r\nHost: localhost:443\r\nMisha-Secret: {SECRET}\r\nNetwork: tcp\r\n\r\n"
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let head = read_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    tls.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.unwrap();

    assert_eq!(&buf, b"PING");
}
