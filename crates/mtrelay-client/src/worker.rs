//! Backend side of the broker protocol.
//!
//! [`WorkerSession`] lets a backend serve requests: it announces `READY`,
//! echoes the broker's heartbeats, runs a handler for each request and sends
//! the reply, and says `CLOSE` on the way out. [`EventPublisher`] sends
//! `{TOPIC} {data}` frames to the broker's publisher endpoint.

use core::future::Future;
use futures::SinkExt;
use mtrelay_core::{
    Error, Result,
    wire::{self, Event, FrameStream, Reply, RequestFrame, WorkerSignal},
};
use tokio_util::sync::CancellationToken;

pub struct WorkerSession {
    addr: String,
    identity: String,
}

impl WorkerSession {
    pub fn new(addr: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            identity: identity.into(),
        }
    }

    /// Serves requests until `token` is cancelled, then sends `CLOSE`.
    ///
    /// Requests are handled strictly one at a time. A frame that is not a
    /// well-formed request is answered with a `KO` reply without reaching the
    /// handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection cannot be established or is
    /// lost.
    pub async fn run<F, Fut>(self, mut handler: F, token: CancellationToken) -> Result<()>
    where
        F: FnMut(RequestFrame) -> Fut,
        Fut: Future<Output = Reply>,
    {
        let mut conn = wire::connect(self.addr.as_str(), self.identity.as_bytes()).await?;
        send_signal(&mut conn, WorkerSignal::Ready).await?;
        tracing::info!("Worker {} ready on {}", self.identity, self.addr);

        loop {
            let frame = tokio::select! {
                () = token.cancelled() => break,
                frame = wire::recv(&mut conn) => frame?,
            };
            let Some(frame) = frame else {
                return Err(Error::Io {
                    context: "worker connection closed by broker".to_string(),
                });
            };

            if WorkerSignal::classify(&frame) == WorkerSignal::Ping {
                send_signal(&mut conn, WorkerSignal::Ping).await?;
                continue;
            }

            let reply = match RequestFrame::parse(&frame) {
                Ok(request) => {
                    tracing::debug!("Worker {} handling {request}", self.identity);
                    handler(request).await
                }
                Err(e) => Reply::ko(e.to_string()),
            };
            conn.send(reply.encode()).await?;
        }

        send_signal(&mut conn, WorkerSignal::Close).await?;
        tracing::info!("Worker {} closed", self.identity);
        Ok(())
    }
}

async fn send_signal(conn: &mut FrameStream, signal: WorkerSignal) -> Result<()> {
    if let Some(frame) = signal.frame() {
        conn.send(frame).await?;
    }
    Ok(())
}

/// Publishes events to the broker's publisher endpoint.
pub struct EventPublisher {
    conn: FrameStream,
}

impl EventPublisher {
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection cannot be established.
    pub async fn connect(addr: &str, identity: &str) -> Result<Self> {
        Ok(Self {
            conn: wire::connect(addr, identity.as_bytes()).await?,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection is lost.
    pub async fn publish(&mut self, event: &Event) -> Result<()> {
        self.conn.send(event.encode()).await?;
        Ok(())
    }
}
