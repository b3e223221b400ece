//! Byte pump between a PTY and a WebSocket.
//!
//! Two loops run concurrently: PTY→socket on a spawned task and socket→PTY on
//! the caller's task. Every read and write in either loop is raced against a
//! shared halt token, so when one side ends the other stops at its next
//! suspension point, even if it is parked on a write.

use std::{fmt::Display, time::Duration};

use axum::{body::Bytes, extract::ws::Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound on the close handshake once the bridge is done.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BridgeEnd {
    /// The shell side reached EOF.
    PtyClosed,
    PtyError,
    /// The client sent a close frame or the stream ended.
    SocketClosed,
    SocketError,
    /// The parent shutdown token fired.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BridgeOutcome {
    pub end: BridgeEnd,
    pub pty_to_socket_bytes: u64,
    pub socket_to_pty_bytes: u64,
}

/// Runs until either side ends or `shutdown` is cancelled.
///
/// Both endpoints are consumed; they are closed and dropped before this
/// returns.
pub(crate) async fn run<P, S, E>(
    pty: P,
    socket: S,
    chunk_size: usize,
    shutdown: &CancellationToken,
) -> BridgeOutcome
where
    P: AsyncRead + AsyncWrite + Send + 'static,
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Display + Send,
    E: Display + Send + 'static,
{
    let (pty_reader, pty_writer) = tokio::io::split(pty);
    let (socket_tx, socket_rx) = socket.split();
    let halt = shutdown.child_token();

    let outbound = tokio::spawn(pump_pty_to_socket(
        pty_reader,
        socket_tx,
        chunk_size.max(1),
        halt.clone(),
    ));
    let (inbound_end, socket_to_pty_bytes) = pump_socket_to_pty(socket_rx, pty_writer, &halt).await;
    halt.cancel();

    let (outbound_end, pty_to_socket_bytes) = match outbound.await {
        Ok(result) => result,
        Err(error) => {
            debug!(%error, "pty reader task failed");
            (Some(BridgeEnd::PtyError), 0)
        }
    };

    let end = outbound_end
        .or(inbound_end)
        .unwrap_or(BridgeEnd::Cancelled);

    BridgeOutcome {
        end,
        pty_to_socket_bytes,
        socket_to_pty_bytes,
    }
}

/// Returns `None` when stopped by the halt token.
async fn pump_pty_to_socket<R, W>(
    mut pty: R,
    mut socket: W,
    chunk_size: usize,
    halt: CancellationToken,
) -> (Option<BridgeEnd>, u64)
where
    R: AsyncRead + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut buf = vec![0u8; chunk_size];
    let mut forwarded = 0u64;

    let end = loop {
        let read = tokio::select! {
            _ = halt.cancelled() => break None,
            read = pty.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break Some(BridgeEnd::PtyClosed),
            Ok(n) => n,
            Err(error) => {
                debug!(%error, "pty read failed");
                break Some(BridgeEnd::PtyError);
            }
        };

        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        let sent = tokio::select! {
            _ = halt.cancelled() => break None,
            sent = socket.send(frame) => sent,
        };
        if let Err(error) = sent {
            debug!(%error, "websocket write failed");
            break Some(BridgeEnd::SocketError);
        }

        forwarded += n as u64;
        trace!(bytes = n, "pty -> socket");
    };

    // Wake the inbound loop before the close handshake can stall.
    halt.cancel();
    if timeout(CLOSE_GRACE, socket.close()).await.is_err() {
        debug!("websocket close timed out");
    }

    (end, forwarded)
}

/// Returns `None` when stopped by the halt token.
async fn pump_socket_to_pty<R, W, E>(
    mut socket: R,
    mut pty: W,
    halt: &CancellationToken,
) -> (Option<BridgeEnd>, u64)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    W: AsyncWrite + Unpin,
    E: Display,
{
    let mut received = 0u64;

    let end = loop {
        let next = tokio::select! {
            _ = halt.cancelled() => break None,
            next = socket.next() => next,
        };

        match next {
            None | Some(Ok(Message::Close(_))) => break Some(BridgeEnd::SocketClosed),
            Some(Ok(Message::Binary(payload))) => {
                let written = tokio::select! {
                    _ = halt.cancelled() => break None,
                    written = pty.write_all(&payload) => written,
                };
                if let Err(error) = written {
                    debug!(%error, "pty write failed");
                    break Some(BridgeEnd::PtyError);
                }
                received += payload.len() as u64;
                trace!(bytes = payload.len(), "socket -> pty");
            }
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "ignoring text frame");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break Some(BridgeEnd::SocketError);
            }
        }
    };

    halt.cancel();
    (end, received)
}
