use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

/// One datagram as it travels through the stack: payload, source, destination.
type Datagram = (Vec<u8>, SocketAddr, SocketAddr);

type SessionKey = (SocketAddr, SocketAddr);
type SessionMap = Arc<Mutex<HashMap<SessionKey, mpsc::Sender<Vec<u8>>>>>;

const SESSION_QUEUE: usize = 64;

/// An accepted UDP session, keyed by (source, destination).
///
/// Reads yield one inbound datagram payload at a time; writes send one
/// datagram back to the application. Sessions carry no EOF, so the dial side
/// reaps them with an idle timeout.
pub struct UdpFlow {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    pending: Bytes,
    outbound: PollSender<Datagram>,
    sessions: Weak<Mutex<HashMap<SessionKey, mpsc::Sender<Vec<u8>>>>>,
}

impl UdpFlow {
    /// Puts `payload` back in front of anything still unread.
    ///
    /// Used by the DNS hijacker to replay bytes it consumed from a flow that
    /// turned out not to be DNS.
    pub fn unread(&mut self, mut payload: Vec<u8>) {
        payload.extend_from_slice(&self.pending);
        self.pending = Bytes::from(payload);
    }
}

impl AsyncRead for UdpFlow {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.inbound.poll_recv(cx)) {
                Some(payload) => self.pending = Bytes::from(payload),
                None => return Poll::Ready(Ok(())), // session torn down, EOF
            }
        }

        let n = usize::min(self.pending.len(), buf.remaining());
        buf.put_slice(&self.pending.split_to(n));

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpFlow {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        ready!(self.outbound.poll_reserve(cx))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;

        // Answer datagrams travel from the flow's destination back to the
        // application's source.
        let datagram = (buf.to_vec(), self.remote, self.local);
        self.outbound
            .send_item(datagram)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.lock().remove(&(self.local, self.remote));
        }
    }
}

/// Splits the stack's single UDP socket into per-(source, destination)
/// sessions published on the returned channel.
pub(crate) fn demultiplex(
    udp_socket: netstack_smoltcp::UdpSocket,
) -> (mpsc::Receiver<UdpFlow>, Vec<JoinHandle<()>>) {
    let (mut udp_stream, mut udp_sink) = udp_socket.split();
    let (flow_tx, flow_rx) = mpsc::channel(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Datagram>(SESSION_QUEUE);
    let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                datagram = outbound_rx.recv() => {
                    let Some(datagram) = datagram else {
                        break;
                    };
                    if let Err(e) = udp_sink.send(datagram).await {
                        tracing::warn!("Failed to send UDP datagram to stack: {e}");
                        break;
                    }
                }
                next = udp_stream.next() => {
                    let Some((payload, src, dst)) = next else {
                        break;
                    };

                    accept_datagram(
                        payload,
                        src,
                        dst,
                        &sessions,
                        &flow_tx,
                        &outbound_tx,
                    )
                    .await;
                }
            }
        }
    });

    (flow_rx, vec![task])
}

async fn accept_datagram(
    payload: Vec<u8>,
    src: SocketAddr,
    dst: SocketAddr,
    sessions: &SessionMap,
    flow_tx: &mpsc::Sender<UdpFlow>,
    outbound_tx: &mpsc::Sender<Datagram>,
) {
    let key = (src, dst);

    let inbound = sessions.lock().get(&key).cloned();
    let inbound = match inbound {
        Some(inbound) => inbound,
        None => {
            let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_QUEUE);
            let flow = UdpFlow {
                local: src,
                remote: dst,
                inbound: inbound_rx,
                pending: Bytes::new(),
                outbound: PollSender::new(outbound_tx.clone()),
                sessions: Arc::downgrade(sessions),
            };

            if flow_tx.send(flow).await.is_err() {
                return; // listener closed
            }

            sessions.lock().insert(key, inbound_tx.clone());
            inbound_tx
        }
    };

    match inbound.try_send(payload) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            // Flow handler is gone; a later packet starts a fresh session.
            sessions.lock().remove(&key);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::trace!(%src, %dst, "UDP session queue full, dropping datagram");
        }
    }
}
