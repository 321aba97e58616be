//! Client mode: own the TUN, recover hostnames from fake IPs, classify each
//! flow and splice it DIRECT or through the relay.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dialer::{
    Dialer, DirectClient, HttpsTunnel, Network, ProxyClient, TargetAddr, TunnelHttpClient, exchange,
};
use dns_resolver::{
    CachingResolver, DEFAULT_DOH_PROVIDER, DnsHandler, DohHandler, ResolveError, UdpHandler,
    resolve_host,
};
use etc_hosts::Hosts;
use fake_dns::Hijacker;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tun_listener::{TcpFlow, TunListener, UdpFlow};

use crate::geo;
use crate::platform;
use crate::Cli;

/// Fake IPs live here; the host routes point this whole /16 at the TUN.
const FAKE_IP_RANGE: &str = "198.18.0.0/16";

const TUN_MTU: u16 = 1500;
const DOH_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// DNS the OS is pointed at while hijacking; real resolution happens on the
/// TUN anyway.
const PLACEHOLDER_DNS: &str = "1.1.1.1";

pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!(server = %cli.server_addr, iface = %cli.outbound_iface, nic = %cli.nic,
        dns_upstream = %cli.dns_upstream, hijack_dns = cli.hijack_dns,
        dns_fallback = cli.enable_dns_fallback, "Client mode");

    let dialer = Dialer::bound(&cli.outbound_iface);

    let hosts = match Hosts::load() {
        Ok(hosts) => hosts,
        Err(e) => {
            tracing::warn!("Proceeding without hosts file: {e:#}");
            Hosts::default()
        }
    };

    let hijacker =
        Arc::new(Hijacker::new(FAKE_IP_RANGE, hosts).context("Failed to build DNS hijacker")?);

    let tunnel = Arc::new(
        HttpsTunnel::new(
            &cli.server_addr,
            &cli.secret_key,
            cli.dns_upstream,
            dialer.clone(),
        )
        .context("Failed to set up the HTTPS tunnel client")?,
    );

    let mut upstreams: Vec<Arc<dyn DnsHandler>> = vec![Arc::new(DohHandler::new(
        DEFAULT_DOH_PROVIDER,
        TunnelHttpClient::new(tunnel.clone(), DOH_TIMEOUT),
        (cli.static_doh_ttl > 0).then_some(cli.static_doh_ttl),
    ))];
    if cli.enable_dns_fallback {
        upstreams.push(Arc::new(UdpHandler::new(
            cli.dns_upstream,
            DNS_FALLBACK_TIMEOUT,
            dialer.clone(),
        )));
    }
    let resolver = CachingResolver::new(upstreams);

    let original_dns = platform::get_dns(&cli.nic)
        .await
        .context("Failed to read current DNS servers")?;
    tracing::debug!(?original_dns, "Saved original DNS configuration");

    let mut listener = TunListener::new(TUN_MTU).context("Failed to set up the TUN listener")?;
    tracing::info!(tun = %listener.name(), "TUN device is up");

    let engine = Arc::new(Engine {
        hijacker,
        resolver: resolver.clone(),
        tunnel: tunnel.clone(),
        direct: DirectClient::new(dialer),
        hijack_dns: cli.hijack_dns,
    });

    let dns_server = dns_resolver::Server::bind(cli.dns_listen_addr, Arc::new(resolver))
        .await
        .context("Failed to bind internal DNS server")?;

    let result = serve(&cli, &mut listener, engine, dns_server).await;

    teardown(&cli.nic, &original_dns).await;
    drop(listener);

    result
}

/// Applies the system configuration and runs until a shutdown signal.
async fn serve(
    cli: &Cli,
    listener: &mut TunListener,
    engine: Arc<Engine>,
    dns_server: dns_resolver::Server,
) -> Result<()> {
    platform::bring_up(listener.name())
        .await
        .context("Failed to bring up the TUN interface")?;
    platform::set_dns(&cli.nic, &[PLACEHOLDER_DNS.to_owned()])
        .await
        .context("Failed to point the system resolver at the TUN")?;
    platform::install_routes()
        .await
        .context("Failed to install host routes")?;

    tokio::spawn(geo::refresh_loop(TunnelHttpClient::new(
        engine.tunnel.clone(),
        geo::REFRESH_TIMEOUT,
    )));

    tokio::spawn(async move {
        if let Err(e) = dns_server.run().await {
            tracing::error!("Internal DNS server died: {e}");
        }
    });

    let accept = async {
        let (tcp_rx, udp_rx) = listener.split();

        loop {
            tokio::select! {
                flow = tcp_rx.recv() => {
                    let Some(flow) = flow else { break };
                    let engine = engine.clone();
                    tokio::spawn(async move { engine.handle_tcp(flow).await });
                }
                flow = udp_rx.recv() => {
                    let Some(flow) = flow else { break };
                    let engine = engine.clone();
                    tokio::spawn(async move { engine.handle_udp(flow).await });
                }
            }
        }
    };

    tokio::select! {
        () = accept => Err(anyhow::anyhow!("TUN listener closed unexpectedly")),
        () = crate::shutdown_signal() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

async fn teardown(nic: &str, original_dns: &[String]) {
    if let Err(e) = platform::uninstall_routes().await {
        tracing::warn!("Failed to remove host routes: {e:#}");
    }
    if let Err(e) = platform::set_dns(nic, original_dns).await {
        tracing::warn!("Failed to restore DNS configuration: {e:#}");
    }
}

struct Engine {
    hijacker: Arc<Hijacker>,
    resolver: CachingResolver,
    tunnel: Arc<HttpsTunnel>,
    direct: DirectClient,
    hijack_dns: bool,
}

impl Engine {
    async fn handle_tcp(&self, flow: TcpFlow) {
        let local = flow.local;

        match self.outbound_target(flow.remote).await {
            Ok((target, domain)) => {
                self.splice(flow.stream, local, target, domain, Network::Tcp)
                    .await;
            }
            Err(e) => {
                tracing::warn!(%local, remote = %flow.remote, "Closing flow: {e}");
            }
        }
    }

    async fn handle_udp(&self, mut flow: UdpFlow) {
        let local = flow.local;

        if self.hijack_dns && flow.remote.port() == 53 {
            match self.try_hijack(&mut flow).await {
                Ok(true) => return, // answered inline
                Ok(false) => {}     // not DNS, already replayed
                Err(e) => {
                    tracing::warn!(%local, remote = %flow.remote, "Hijack failed: {e}");
                    return;
                }
            }
        }

        match self.outbound_target(flow.remote).await {
            Ok((target, domain)) => {
                self.splice(flow, local, target, domain, Network::Udp).await;
            }
            Err(e) => {
                tracing::warn!(%local, remote = %flow.remote, "Closing flow: {e}");
            }
        }
    }

    /// Answers a DNS query on the flow; `Ok(false)` means the payload was not
    /// DNS and has been pushed back for ordinary forwarding.
    async fn try_hijack(&self, flow: &mut UdpFlow) -> std::io::Result<bool> {
        // DNS over UDP fits 512 bytes.
        let mut buf = [0u8; 512];
        let len = flow.read(&mut buf).await?;

        match self.hijacker.try_answer(&buf[..len]) {
            Some(response) => {
                flow.write_all(&response).await?;

                Ok(true)
            }
            None => {
                flow.unread(buf[..len].to_vec());

                Ok(false)
            }
        }
    }

    /// Recovers the logical target of a flow: fake IPs turn back into
    /// hostnames and resolve over the covert chain.
    async fn outbound_target(
        &self,
        remote: SocketAddr,
    ) -> Result<(TargetAddr, Option<String>), ResolveError> {
        let port = remote.port();

        let host = match remote.ip() {
            IpAddr::V4(ip) if self.hijacker.pool().contains(IpAddr::V4(ip)) => {
                match self.hijacker.reverse_lookup(ip) {
                    Some(host) => host,
                    // A fake IP nothing asked for; pass it through untouched.
                    None => return Ok((TargetAddr::from_ip(remote.ip(), port), None)),
                }
            }
            ip => return Ok((TargetAddr::from_ip(ip, port), None)),
        };

        match resolve_host(&self.resolver, &host).await {
            Ok(ip) => Ok((TargetAddr::from_ip(ip, port), Some(host))),
            Err(ResolveError::NoSuchHost) => {
                // Let the relay resolve it on the far side.
                Ok((TargetAddr::from_name(host.clone(), port), Some(host)))
            }
            Err(e) => Err(e),
        }
    }

    async fn splice<S>(
        &self,
        flow: S,
        local: SocketAddr,
        target: TargetAddr,
        domain: Option<String>,
        network: Network,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        let client: &dyn ProxyClient = if is_domestic(&target) {
            &self.direct
        } else {
            self.tunnel.as_ref()
        };

        let domain = domain.unwrap_or_default();
        let via = client.via();

        tracing::info!(%local, remote = %target, %domain, %via, "Dialing");

        let connection = match client.dial(network, target.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(%local, remote = %target, %domain, %via, "Dial failed: {e}");
                return;
            }
        };

        tracing::debug!(%local, remote = %target, %domain, %via, "Exchanging data");

        let idle_timeout = network.is_udp().then_some(UDP_IDLE_TIMEOUT);
        if let Err(e) = exchange(flow, connection.stream, idle_timeout).await {
            tracing::debug!(%local, remote = %target, %domain, %via, "Flow closed: {e}");
        }
    }
}

/// DIRECT for anything private or domestic; everything else goes through the
/// relay. Name-only targets are already a relay decision.
fn is_domestic(target: &TargetAddr) -> bool {
    match target.ip() {
        Some(ip) => ip_range_db::PRIVATE.contains(ip) || ip_range_db::CHINA.contains(ip),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_china_targets_stay_direct() {
        assert!(is_domestic(&TargetAddr::from_ip(
            "10.0.0.1".parse().unwrap(),
            443
        )));
        assert!(is_domestic(&TargetAddr::from_ip(
            "180.101.49.11".parse().unwrap(),
            443
        )));
    }

    #[test]
    fn foreign_and_name_targets_go_through_the_relay() {
        assert!(!is_domestic(&TargetAddr::from_ip(
            "93.184.216.34".parse().unwrap(),
            443
        )));
        assert!(!is_domestic(&TargetAddr::from_name("example.com", 443)));
    }
}
