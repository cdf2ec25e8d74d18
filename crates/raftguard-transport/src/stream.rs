// Connection type handed to the Raft transport

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::{Accept, client, server};
use tracing::warn;

/// A peer connection, plain or TLS
#[derive(Debug)]
pub enum PeerStream {
    Plain(TcpStream),
    TlsClient(Box<client::TlsStream<TcpStream>>),
    TlsServer(Box<ServerTlsStream>),
}

impl PeerStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            PeerStream::Plain(s) => s.peer_addr(),
            PeerStream::TlsClient(s) => s.get_ref().0.peer_addr(),
            PeerStream::TlsServer(s) => Ok(s.peer),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            PeerStream::Plain(s) => s.local_addr(),
            PeerStream::TlsClient(s) => s.get_ref().0.local_addr(),
            PeerStream::TlsServer(s) => Ok(s.local),
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, PeerStream::Plain(_))
    }
}

enum ServerState {
    Handshaking {
        accept: Accept<TcpStream>,
        deadline: Pin<Box<Sleep>>,
    },
    Ready(server::TlsStream<TcpStream>),
    Failed,
}

/// Inbound TLS connection whose server handshake runs on first use.
///
/// `accept` hands the stream out as soon as TCP is established; the handshake
/// is driven by the first read or write and fails with `TimedOut` once the
/// deadline passes.
pub struct ServerTlsStream {
    peer: SocketAddr,
    local: SocketAddr,
    state: ServerState,
}

impl ServerTlsStream {
    pub(crate) fn new(
        accept: Accept<TcpStream>,
        peer: SocketAddr,
        local: SocketAddr,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            peer,
            local,
            state: ServerState::Handshaking {
                accept,
                deadline: Box::pin(tokio::time::sleep(handshake_timeout)),
            },
        }
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, ServerState::Handshaking { .. })
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let outcome = match &mut self.state {
            ServerState::Ready(_) => return Poll::Ready(Ok(())),
            ServerState::Failed => return Poll::Ready(Err(handshake_failed())),
            ServerState::Handshaking { accept, deadline } => match Pin::new(accept).poll(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => {
                    if deadline.as_mut().poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "TLS handshake timed out",
                    ))
                }
            },
        };

        match outcome {
            Ok(stream) => {
                self.state = ServerState::Ready(stream);
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                warn!("TLS handshake with {} failed: {}", self.peer, e);
                self.state = ServerState::Failed;
                Poll::Ready(Err(e))
            }
        }
    }

    fn established(&mut self) -> io::Result<Pin<&mut server::TlsStream<TcpStream>>> {
        match &mut self.state {
            ServerState::Ready(stream) => Ok(Pin::new(stream)),
            _ => Err(handshake_failed()),
        }
    }
}

fn handshake_failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake did not complete")
}

impl fmt::Debug for ServerTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ServerState::Handshaking { .. } => "handshaking",
            ServerState::Ready(_) => "ready",
            ServerState::Failed => "failed",
        };
        f.debug_struct("ServerTlsStream")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("state", &state)
            .finish()
    }
}

impl AsyncRead for ServerTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.established()?.poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.established()?.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            ServerState::Ready(stream) => Pin::new(stream).poll_flush(cx),
            // nothing has been written by the application yet
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let ServerState::Ready(stream) = &mut this.state {
            return Pin::new(stream).poll_shutdown(cx);
        }
        // dropping a pending handshake closes the socket
        this.state = ServerState::Failed;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            PeerStream::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            PeerStream::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            PeerStream::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            PeerStream::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
