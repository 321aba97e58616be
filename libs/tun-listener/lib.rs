//! Owns the TUN device and the userspace network stack behind it, and hands
//! out accepted TCP streams and UDP sessions as bidirectional flows.
//!
//! The stack itself is a black box: raw IP packets go in on one side, accepted
//! transport endpoints come out on the other. We pump packets between it and
//! the TUN device and demultiplex what it accepts onto two flow channels.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod udp;

pub use udp::UdpFlow;

use std::net::SocketAddr;

use anyhow::{Context as _, Result, anyhow};
use futures::{SinkExt as _, StreamExt as _};
use netstack_smoltcp::StackBuilder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tun::AbstractDevice as _;

/// An accepted TCP connection from the stack.
///
/// `local` is the application's source address, `remote` the destination the
/// application dialed (a fake IP, for hijacked hostnames).
pub struct TcpFlow {
    pub stream: netstack_smoltcp::TcpStream,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

pub struct TunListener {
    name: String,
    tcp_rx: mpsc::Receiver<TcpFlow>,
    udp_rx: mpsc::Receiver<UdpFlow>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunListener {
    /// Creates the TUN device and wires it into a fresh userspace stack.
    ///
    /// The device is up but unconfigured; assigning its address and the
    /// routes that steer traffic onto it is the platform glue's business.
    pub fn new(mtu: u16) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config.mtu(mtu).up();

        let device = tun::create_as_async(&config).context("Failed to create TUN device")?;
        let name = device
            .tun_name()
            .context("Failed to read TUN device name")?;

        let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
            .enable_tcp(true)
            .enable_udp(true)
            .build()
            .map_err(|e| anyhow!("Failed to build userspace network stack: {e}"))?;
        let mut tcp_listener = tcp_listener.context("Stack did not produce a TCP listener")?;
        let udp_socket = udp_socket.context("Stack did not produce a UDP socket")?;

        let mut tasks = Vec::new();

        if let Some(runner) = runner {
            tasks.push(tokio::spawn(async move {
                let _ = runner.await;
                tracing::debug!("Userspace network stack exited");
            }));
        }

        let (mut tun_sink, mut tun_stream) = device.into_framed().split();
        let (mut stack_sink, mut stack_stream) = stack.split();

        // Stack-produced packets go back out the TUN.
        tasks.push(tokio::spawn(async move {
            while let Some(packet) = stack_stream.next().await {
                match packet {
                    Ok(packet) => {
                        if let Err(e) = tun_sink.send(packet).await {
                            tracing::warn!("Failed to write packet to TUN: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read packet from stack: {e}");
                        break;
                    }
                }
            }
        }));

        // TUN-delivered packets feed the stack.
        tasks.push(tokio::spawn(async move {
            while let Some(packet) = tun_stream.next().await {
                match packet {
                    Ok(packet) => {
                        if let Err(e) = stack_sink.send(packet).await {
                            tracing::warn!("Failed to write packet to stack: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read packet from TUN: {e}");
                        break;
                    }
                }
            }
        }));

        let (tcp_tx, tcp_rx) = mpsc::channel(64);
        tasks.push(tokio::spawn(async move {
            while let Some((stream, local, remote)) = tcp_listener.next().await {
                let flow = TcpFlow {
                    stream,
                    local,
                    remote,
                };

                if tcp_tx.send(flow).await.is_err() {
                    break;
                }
            }
        }));

        let (udp_rx, udp_tasks) = udp::demultiplex(udp_socket);
        tasks.extend(udp_tasks);

        Ok(Self {
            name,
            tcp_rx,
            udp_rx,
            tasks,
        })
    }

    /// The OS name of the TUN device, e.g. `utun3`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The next accepted TCP flow; `None` once the listener is closed.
    pub async fn accept_tcp(&mut self) -> Option<TcpFlow> {
        self.tcp_rx.recv().await
    }

    /// The next accepted UDP session; `None` once the listener is closed.
    pub async fn accept_udp(&mut self) -> Option<UdpFlow> {
        self.udp_rx.recv().await
    }

    /// Both accept channels at once, for callers multiplexing them in one
    /// loop.
    pub fn split(&mut self) -> (&mut mpsc::Receiver<TcpFlow>, &mut mpsc::Receiver<UdpFlow>) {
        (&mut self.tcp_rx, &mut self.udp_rx)
    }
}

impl Drop for TunListener {
    fn drop(&mut self) {
        // Tears down the pump tasks and with them the device and the stack;
        // in-flight flows see EOF and unwind through their splices.
        for task in &self.tasks {
            task.abort();
        }
    }
}
