//! Per-connection tasks for every broker endpoint.
//!
//! Each accepted TCP connection gets one reader task and one writer task:
//!
//! - The reader performs the identity handshake, assigns the connection its
//!   [`Address`], then forwards every inbound frame to the owning loop (router
//!   or event proxy) as a [`LinkEvent`].
//! - The writer drains a bounded channel into the socket. Its sender is handed
//!   to the owning loop in [`LinkEvent::Attached`], so only that loop ever
//!   writes to the connection.
//!
//! Dropping the sender (the owning loop detaching the connection) lets the
//! writer flush and close the socket.

use bytes::Bytes;
use core::{fmt, time::Duration};
use futures::{SinkExt, StreamExt};
use mtrelay_core::{Address, Error, Result, wire};
use portable_atomic::{AtomicU64, Ordering};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Time a freshly accepted peer has to send its identity frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered per connection before further writes are dropped.
pub const WRITE_BUFFER: usize = 256;

/// Delay before rebinding an endpoint whose listener failed.
const REBIND_DELAY: Duration = Duration::from_secs(1);

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// A change on one connection, reported to the loop that owns the endpoint.
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake completed. `writer` feeds the connection's socket.
    Attached {
        address: Address,
        writer: mpsc::Sender<Bytes>,
    },
    Frame {
        address: Address,
        frame: Bytes,
    },
    /// The peer closed the connection or the transport failed.
    Detached { address: Address },
}

/// Accepts connections until `token` is cancelled.
///
/// Every event is tagged with `side` so one loop can own several endpoints.
/// Connection tasks are spawned on `tracker`, so shutdown can wait for their
/// writers to flush.
///
/// # Errors
///
/// Returns [`Error::Io`] when the listener itself fails. Connections already
/// accepted keep running.
pub async fn accept_loop<S>(
    listener: TcpListener,
    side: S,
    events: mpsc::Sender<(S, LinkEvent)>,
    tracker: TaskTracker,
    token: CancellationToken,
) -> Result<()>
where
    S: Copy + fmt::Display + Send + 'static,
{
    let mut incoming = TcpListenerStream::new(listener);
    loop {
        tokio::select! {
            () = token.cancelled() => return Ok(()),
            next = incoming.next() => match next {
                Some(Ok(stream)) => {
                    tracker.spawn(serve_connection(
                        stream,
                        side,
                        events.clone(),
                        tracker.clone(),
                        token.child_token(),
                    ));
                }
                Some(Err(e)) if is_transient(&e) => {
                    tracing::debug!("{side} endpoint: transient accept error: {e}");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

/// Runs [`accept_loop`] and rebinds `addr` whenever the listener fails, until
/// `token` is cancelled.
pub async fn serve_endpoint<S>(
    listener: TcpListener,
    side: S,
    events: mpsc::Sender<(S, LinkEvent)>,
    tracker: TaskTracker,
    token: CancellationToken,
) where
    S: Copy + fmt::Display + Send + 'static,
{
    let mut listener = listener;
    loop {
        let addr = listener.local_addr().ok();
        let Err(e) = accept_loop(listener, side, events.clone(), tracker.clone(), token.clone()).await else {
            return;
        };
        tracing::error!("{side} endpoint failed: {e}; restarting");

        listener = loop {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(REBIND_DELAY) => {}
            }
            let Some(addr) = addr else {
                tracing::error!("{side} endpoint has no local address to rebind");
                return;
            };
            match TcpListener::bind(addr).await {
                Ok(rebound) => break rebound,
                Err(e) => tracing::warn!("Rebinding {side} endpoint on {addr} failed: {e}"),
            }
        };
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::{ConnectionAborted, ConnectionReset, Interrupted, WouldBlock};
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(side = %side)))]
async fn serve_connection<S>(
    stream: TcpStream,
    side: S,
    events: mpsc::Sender<(S, LinkEvent)>,
    tracker: TaskTracker,
    token: CancellationToken,
) where
    S: Copy + fmt::Display + Send + 'static,
{
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |a: SocketAddr| a.to_string());
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {peer}: {e}");
    }

    let mut conn = wire::framed(stream);
    let identity = match timeout(HANDSHAKE_TIMEOUT, wire::read_identity(&mut conn)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            tracing::debug!("{side} handshake from {peer} failed: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!("{side} handshake from {peer} timed out");
            return;
        }
    };

    let address = Address::new(identity, NEXT_CONN.fetch_add(1, Ordering::Relaxed));
    let (writer, mut outbox) = mpsc::channel::<Bytes>(WRITE_BUFFER);
    let (mut sink, mut frames) = conn.split();

    let attached = LinkEvent::Attached {
        address: address.clone(),
        writer,
    };
    if events.send((side, attached)).await.is_err() {
        return;
    }
    tracing::debug!("{side} {address} connected from {peer}");

    let writer = async move {
        while let Some(frame) = outbox.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Write to {peer} failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    };
    #[cfg(feature = "tracing")]
    let writer = {
        use tracing::Instrument;
        writer.instrument(tracing::info_span!("writer", address = %address))
    };
    tracker.spawn(writer);

    loop {
        let frame = tokio::select! {
            () = token.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                let event = LinkEvent::Frame {
                    address: address.clone(),
                    frame: frame.freeze(),
                };
                if events.send((side, event)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("{side} {address}: {}", Error::from(e));
                break;
            }
            None => break,
        }
    }

    tracing::debug!("{side} {address} disconnected");
    let _ = events.send((side, LinkEvent::Detached { address })).await;
}
