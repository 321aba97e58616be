//! Outbound connection plumbing: an interface-bound dialer, the DIRECT and
//! HTTPS-tunnel proxy clients, and the byte-exchange helpers flows are spliced
//! with.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod http_client;
mod io;
mod resolve;
mod tunnel;

pub use http_client::{HttpError, TunnelHttpClient};
pub use io::{Prefixed, exchange};
pub use resolve::lookup_host_via;
pub use tunnel::{HEADER_NETWORK, HEADER_SECRET, HttpsTunnel, USER_AGENT};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

/// The transport a flow runs over, as named on the wire in the `Network`
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(DialError::UnknownNetwork(other.to_owned())),
        }
    }
}

/// A dial target: a port plus either a resolved IP or a hostname (the
/// no-such-host fallback dials the relay by name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ip(IpAddr),
    Name(String),
}

impl TargetAddr {
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: TargetHost::Ip(ip),
            port,
        }
    }

    pub fn from_name(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: TargetHost::Name(name.into()),
            port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            TargetHost::Ip(ip) => Some(*ip),
            TargetHost::Name(_) => None,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            TargetHost::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            TargetHost::Name(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),
    #[error("direct dial requires a resolved IP, got name `{0}`")]
    NameNotSupported(String),
    #[error("failed to resolve relay host `{host}`")]
    RelayResolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel not established: relay answered `{0}`")]
    Refused(String),
    #[error("tunnel not established: malformed relay response")]
    BadResponse,
}

/// Byte streams a flow can be spliced over.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// An established outbound connection plus the logical endpoints downstream
/// logging should report.
pub struct Connection {
    pub stream: BoxConn,
    pub local: Option<SocketAddr>,
    pub remote: TargetAddr,
}

/// Something that can reach a target: DIRECT or via the HTTPS relay.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn dial(&self, network: Network, target: TargetAddr) -> Result<Connection, DialError>;

    /// Short tag for the `via` field on flow events.
    fn via(&self) -> &'static str;
}

/// Dials with sockets optionally bound to a physical interface, so that
/// outbound traffic cannot loop back onto the TUN.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    iface: Option<String>,
}

impl Dialer {
    pub fn bound(iface: impl Into<String>) -> Self {
        Self {
            iface: Some(iface.into()),
        }
    }

    pub async fn connect_tcp(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_nodelay(true)?;

        if let Some(iface) = &self.iface {
            bind_to_interface(&socket, iface, addr.is_ipv6())?;
        }

        socket.connect(addr).await
    }

    pub async fn connect_udp(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await?;

        if let Some(iface) = &self.iface {
            bind_to_interface(&socket, iface, addr.is_ipv6())?;
        }

        socket.connect(addr).await?;

        Ok(socket)
    }
}

#[cfg(target_os = "linux")]
fn bind_to_interface<S>(socket: &S, iface: &str, _v6: bool) -> std::io::Result<()>
where
    S: std::os::fd::AsFd,
{
    socket2::SockRef::from(socket).bind_device(Some(iface.as_bytes()))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn bind_to_interface<S>(socket: &S, iface: &str, v6: bool) -> std::io::Result<()>
where
    S: std::os::fd::AsFd,
{
    let iface = std::ffi::CString::new(iface)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    let index = std::num::NonZeroU32::new(unsafe { libc::if_nametoindex(iface.as_ptr()) })
        .ok_or_else(std::io::Error::last_os_error)?;

    let socket = socket2::SockRef::from(socket);
    if v6 {
        socket.bind_device_by_index_v6(Some(index))
    } else {
        socket.bind_device_by_index_v4(Some(index))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn bind_to_interface<S>(_socket: &S, _iface: &str, _v6: bool) -> std::io::Result<()> {
    Ok(())
}

/// Reaches the target directly over the physical interface.
pub struct DirectClient {
    dialer: Dialer,
}

impl DirectClient {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl ProxyClient for DirectClient {
    async fn dial(&self, network: Network, target: TargetAddr) -> Result<Connection, DialError> {
        let ip = match &target.host {
            TargetHost::Ip(ip) => *ip,
            TargetHost::Name(name) => return Err(DialError::NameNotSupported(name.clone())),
        };
        let addr = SocketAddr::new(ip, target.port);

        if network.is_udp() {
            let socket = self.dialer.connect_udp(addr).await?;
            let local = socket.local_addr().ok();

            return Ok(Connection {
                stream: Box::new(UdpStream { socket }),
                local,
                remote: target,
            });
        }

        let stream = self.dialer.connect_tcp(addr).await?;
        let local = stream.local_addr().ok();

        Ok(Connection {
            stream: Box::new(stream),
            local,
            remote: target,
        })
    }

    fn via(&self) -> &'static str {
        "DIRECT"
    }
}

/// A connected UDP socket presented as a byte stream: one datagram per read,
/// one datagram per write.
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
