//! One request channel: a persistent broker connection serving one request at
//! a time.
//!
//! The channel loop takes a slot from the shared queue, sends it, and waits
//! for the reply until the slot's deadline. A connection that missed a reply
//! is unusable (the late reply would be taken for the next request's), so on
//! timeout the slot resolves to `KO|Request expired` and the channel
//! reconnects under the same identity before taking more work.

use super::reply::Slot;
use core::time::Duration;
use futures::SinkExt;
use mtrelay_core::{
    types::REQUEST_EXPIRED_DETAIL,
    wire::{self, FrameStream, Reply},
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Submission queue shared by every channel of a pool.
pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<Slot>>>;

/// How a served slot left the connection.
enum Outcome {
    Healthy,
    Broken,
}

pub(crate) struct Channel {
    pub identity: String,
    pub addr: String,
    pub queue: SharedQueue,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub token: CancellationToken,
}

impl Channel {
    pub async fn run(self) {
        let mut respawns = 0u64;
        loop {
            let Some(mut conn) = self.connect().await else {
                return;
            };
            tracing::debug!("Channel {} connected to {}", self.identity, self.addr);

            loop {
                let slot = tokio::select! {
                    () = self.token.cancelled() => return,
                    slot = next_slot(&self.queue) => slot,
                };
                let Some(slot) = slot else {
                    tracing::debug!("Channel {} stopping: pool dropped", self.identity);
                    return;
                };
                if let Outcome::Broken = self.serve(&mut conn, slot).await {
                    break;
                }
            }

            respawns += 1;
            tracing::info!(
                "Respawning channel {} (respawn #{respawns})",
                self.identity
            );
        }
    }

    async fn serve(&self, conn: &mut FrameStream, slot: Slot) -> Outcome {
        if slot.is_abandoned() {
            return Outcome::Healthy;
        }

        let remaining = slot.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Never sent, so the connection is still in step.
            slot.resolve(Reply::ko(REQUEST_EXPIRED_DETAIL).to_string());
            return Outcome::Healthy;
        }

        if let Err(e) = conn.send(slot.frame.clone()).await {
            tracing::warn!("Channel {} lost its connection: {e}", self.identity);
            slot.resolve(Reply::ko(format!("Connection lost: {e}")).to_string());
            return Outcome::Broken;
        }

        match timeout(remaining, wire::recv(conn)).await {
            Ok(Ok(Some(frame))) => {
                slot.resolve(String::from_utf8_lossy(&frame).into_owned());
                Outcome::Healthy
            }
            Ok(Ok(None)) => {
                tracing::warn!("Broker closed channel {}", self.identity);
                slot.resolve(Reply::ko("Connection lost: closed by broker").to_string());
                Outcome::Broken
            }
            Ok(Err(e)) => {
                tracing::warn!("Channel {} failed: {e}", self.identity);
                slot.resolve(Reply::ko(format!("Connection lost: {e}")).to_string());
                Outcome::Broken
            }
            Err(_) => {
                tracing::warn!(
                    "Channel {} stalled after {remaining:?}, request expired",
                    self.identity
                );
                slot.resolve(Reply::ko(REQUEST_EXPIRED_DETAIL).to_string());
                Outcome::Broken
            }
        }
    }

    /// Connects with doubling backoff. Returns `None` once cancelled.
    async fn connect(&self) -> Option<FrameStream> {
        let mut delay = self.reconnect_min;
        loop {
            let attempt = tokio::select! {
                () = self.token.cancelled() => return None,
                attempt = wire::connect(self.addr.as_str(), self.identity.as_bytes()) => attempt,
            };
            match attempt {
                Ok(conn) => return Some(conn),
                Err(e) => tracing::debug!(
                    "Channel {} cannot reach {}: {e}; retrying in {delay:?}",
                    self.identity,
                    self.addr
                ),
            }
            tokio::select! {
                () = self.token.cancelled() => return None,
                () = sleep(delay) => {}
            }
            delay = (delay * 2).min(self.reconnect_max);
        }
    }
}

async fn next_slot(queue: &SharedQueue) -> Option<Slot> {
    queue.lock().await.recv().await
}
