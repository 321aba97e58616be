//! misha: a transparent split-tunnel client and its HTTPS-disguised relay in
//! one dual-mode binary.

mod client;
mod geo;
mod platform;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use relay_server::RelayServer;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run as the relay instead of the TUN client.
    #[arg(long, default_value_t = false)]
    server_mode: bool,

    /// The relay to connect to.
    #[arg(long, default_value = "yourdomain.com:443")]
    server_addr: String,

    /// Address the relay listens on.
    #[arg(long, default_value = ":443")]
    listen_addr: String,

    /// PEM certificate chain presented by the relay.
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// PEM private key matching the certificate.
    #[arg(long)]
    private_key_file: Option<PathBuf>,

    /// Shared secret that opens the tunnel.
    #[arg(long, default_value = "secret key")]
    secret_key: String,

    /// Decoy origin served to visitors without the secret.
    #[arg(long, default_value = "http://mirror.siena.edu/ubuntu/")]
    reversed_website: Url,

    /// Fixed TTL in seconds applied to DoH answers.
    #[arg(long, default_value_t = 86400)]
    static_doh_ttl: u32,

    /// Decoy egress cap in bytes per second; 0 disables the limiter.
    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    rate_limit_bytes_per_second: u64,

    /// Plain DNS upstream, also used to bootstrap the relay hostname.
    #[arg(long, default_value = "1.1.1.1:53")]
    dns_upstream: SocketAddr,

    /// Local address the internal DNS server listens on.
    #[arg(long, default_value = "127.0.0.1:53")]
    dns_listen_addr: SocketAddr,

    /// Physical interface outbound sockets bind to.
    #[arg(long, default_value = "en0")]
    outbound_iface: String,

    /// Network service name used for OS DNS reconfiguration.
    #[arg(long, default_value = "Wi-Fi")]
    nic: String,

    /// Fall back to plain UDP DNS when the covert resolver fails.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_dns_fallback: bool,

    /// Intercept port-53 traffic on the TUN.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    hijack_dns: bool,

    /// One of TRACE, DEBUG, INFO, WARN, ERROR, FATAL or PANIC.
    #[arg(long, default_value = "INFO")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(parse_level(&cli.log_level).into())
                .from_env_lossy(),
        )
        .init();

    if cli.server_mode {
        run_relay(cli).await
    } else {
        client::run(cli).await
    }
}

async fn run_relay(cli: Cli) -> Result<()> {
    let cert_file = cli
        .cert_file
        .as_deref()
        .context("`--cert-file` is required in server mode")?;
    let key_file = cli
        .private_key_file
        .as_deref()
        .context("`--private-key-file` is required in server mode")?;

    let tls_config = relay_server::load_tls_config(cert_file, key_file)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let listen_addr = parse_listen_addr(&cli.listen_addr)?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {listen_addr}"))?;

    let rate_limit = (cli.rate_limit_bytes_per_second > 0).then_some(cli.rate_limit_bytes_per_second);
    let server = RelayServer::new(cli.secret_key, cli.reversed_website.clone(), rate_limit);

    tracing::info!(%listen_addr, decoy = %cli.reversed_website, ?rate_limit, "Relay is up");

    tokio::select! {
        result = server.run(listener, acceptor) => result,
        () = shutdown_signal() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

/// Accepts Go-style listen addresses such as `:443`.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    if let Some(port) = addr.strip_prefix(':') {
        let port = port.parse().with_context(|| format!("Bad port in `{addr}`"))?;

        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    addr.parse()
        .with_context(|| format!("Failed to parse listen address `{addr}`"))
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "WARN" => LevelFilter::WARN,
        // tracing has no levels above ERROR.
        "ERROR" | "FATAL" | "PANIC" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_style_listen_addr() {
        assert_eq!(
            parse_listen_addr(":443").unwrap(),
            "0.0.0.0:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:8443").unwrap(),
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }

    #[test]
    fn unknown_log_levels_default_to_info() {
        assert_eq!(parse_level("TRACE"), LevelFilter::TRACE);
        assert_eq!(parse_level("panic"), LevelFilter::ERROR);
        assert_eq!(parse_level("whatever"), LevelFilter::INFO);
    }
}
