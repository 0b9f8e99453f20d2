//! Websocket-framed byte-stream adapter.
//!
//! Presents a bidirectional reliable byte stream over a single websocket
//! connection, for the consensus transport to carry its frames on:
//!
//! - a read returns bytes from the current inbound message; when the
//!   message is exhausted the next *binary* message becomes the source,
//!   and a short read signals the reader to reissue the read for the
//!   next frame;
//! - a write sends exactly one binary message per call;
//! - non-binary data messages are a protocol error.
//!
//! The adapter wraps either side of an upgrade: the server half handed
//! over by the HTTP layer, or the client half produced by dialing a
//! peer.  Addresses are recorded at construction; deadlines are applied
//! by callers with `tokio::time::timeout`, which is where tokio puts
//! them.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws::{Message as ServerMessage, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as ClientMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Either half of an upgraded websocket.
pub enum WsSocket {
    /// Inbound connection upgraded by the HTTP layer.
    Server(WebSocket),
    /// Outbound connection from dialing a peer.
    Client(WebSocketStream<MaybeTlsStream<TcpStream>>),
}

/// A byte stream riding on one websocket: one binary message per frame.
pub struct WsByteStream {
    socket: WsSocket,
    /// Unread remainder of the current inbound message.
    current: Bytes,
    local_addr: String,
    remote_addr: String,
}

impl WsByteStream {
    /// Wrap an upgraded websocket, recording the two endpoint addresses.
    pub fn new(socket: WsSocket, local_addr: String, remote_addr: String) -> Self {
        Self {
            socket,
            current: Bytes::new(),
            local_addr,
            remote_addr,
        }
    }

    /// Address of the local endpoint, as `host:port`.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Address of the remote endpoint, as `host:port`.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

fn protocol_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "non-binary message on raft websocket",
    )
}

fn broken(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl WsSocket {
    /// Poll for the next binary message.  Control frames are skipped;
    /// close and end-of-stream map to `None`.
    fn poll_next_binary(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        loop {
            match self {
                WsSocket::Server(ws) => match ready!(Pin::new(ws).poll_next(cx)) {
                    Some(Ok(ServerMessage::Binary(data))) => {
                        return Poll::Ready(Some(Ok(Bytes::from(data))))
                    }
                    Some(Ok(ServerMessage::Ping(_) | ServerMessage::Pong(_))) => continue,
                    Some(Ok(ServerMessage::Close(_))) | None => return Poll::Ready(None),
                    Some(Ok(ServerMessage::Text(_))) => {
                        return Poll::Ready(Some(Err(protocol_error())))
                    }
                    Some(Err(err)) => return Poll::Ready(Some(Err(broken(err)))),
                },
                WsSocket::Client(ws) => match ready!(Pin::new(ws).poll_next(cx)) {
                    Some(Ok(ClientMessage::Binary(data))) => {
                        return Poll::Ready(Some(Ok(Bytes::from(data))))
                    }
                    Some(Ok(
                        ClientMessage::Ping(_) | ClientMessage::Pong(_) | ClientMessage::Frame(_),
                    )) => continue,
                    Some(Ok(ClientMessage::Close(_))) | None => return Poll::Ready(None),
                    Some(Ok(ClientMessage::Text(_))) => {
                        return Poll::Ready(Some(Err(protocol_error())))
                    }
                    Some(Err(err)) => return Poll::Ready(Some(Err(broken(err)))),
                },
            }
        }
    }

    fn poll_send_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            WsSocket::Server(ws) => Pin::new(ws).poll_ready(cx).map_err(broken),
            WsSocket::Client(ws) => Pin::new(ws).poll_ready(cx).map_err(broken),
        }
    }

    fn start_send_binary(&mut self, data: Vec<u8>) -> io::Result<()> {
        match self {
            WsSocket::Server(ws) => Pin::new(ws)
                .start_send(ServerMessage::Binary(data))
                .map_err(broken),
            WsSocket::Client(ws) => Pin::new(ws)
                .start_send(ClientMessage::Binary(data))
                .map_err(broken),
        }
    }

    fn poll_send_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            WsSocket::Server(ws) => Pin::new(ws).poll_flush(cx).map_err(broken),
            WsSocket::Client(ws) => Pin::new(ws).poll_flush(cx).map_err(broken),
        }
    }

    fn poll_send_close(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            WsSocket::Server(ws) => Pin::new(ws).poll_close(cx).map_err(broken),
            WsSocket::Client(ws) => Pin::new(ws).poll_close(cx).map_err(broken),
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.current.is_empty() {
            match ready!(this.socket.poll_next_binary(cx)) {
                Some(Ok(data)) => this.current = data,
                Some(Err(err)) => return Poll::Ready(Err(err)),
                // Peer closed: surface EOF.
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = this.current.len().min(buf.remaining());
        buf.put_slice(&this.current.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.socket.poll_send_ready(cx))?;
        this.socket.start_send_binary(buf.to_vec())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().socket.poll_send_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().socket.poll_send_close(cx)
    }
}
