//! Client connection pool.
//!
//! A [`ConnectionPool`] runs `pool_size` independent request channels, each
//! owning one persistent broker connection and serving exactly one request at
//! a time. Submissions go through one bounded queue that every channel pulls
//! from, so work lands on whichever channel frees up first.
//!
//! - [`channel`] - The per-channel loop and its self-healing reconnect.
//! - [`reply`] - Submission slots and the [`PendingReply`] future.

mod channel;
mod reply;

pub use reply::PendingReply;

use crate::config::ClientConfig;
use bytes::Bytes;
use channel::Channel;
use core::time::Duration;
use mtrelay_core::{
    Error, Result,
    wire::{Reply, RequestFrame},
};
use rand::{Rng, distr::Alphanumeric};
use reply::Slot;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Length of generated request ids.
pub const REQUEST_ID_LEN: usize = 6;

/// Reply wait used in place of an unrepresentable timeout (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct ConnectionPool {
    submit: mpsc::Sender<Slot>,
    shutdown: CancellationToken,
    size: usize,
}

impl ConnectionPool {
    /// Spawns the channels. They connect in the background and keep
    /// reconnecting until the pool is shut down or dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &ClientConfig) -> Self {
        let size = config.pool_size.max(1);
        let (submit, queue) = mpsc::channel(config.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(queue));
        let shutdown = CancellationToken::new();

        for n in 0..size {
            let channel = Channel {
                identity: format!("Client-{n}"),
                addr: config.request_addr.clone(),
                queue: Arc::clone(&queue),
                reconnect_min: config.reconnect_min,
                reconnect_max: config.reconnect_max,
                token: shutdown.child_token(),
            };
            tokio::spawn(channel.run());
        }

        Self {
            submit,
            shutdown,
            size,
        }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Queues `frame` and returns a future for its raw reply.
    ///
    /// The caller is never blocked: the request waits in the shared queue
    /// until a channel is free, and the reply wait ends at `now + timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolSaturated`] if the submission queue is full. Back off and
    ///   resubmit.
    /// - [`Error::ServiceShutdown`] if the pool has been shut down.
    pub fn submit(&self, frame: impl Into<Bytes>, timeout: Duration) -> Result<PendingReply> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        let (slot, pending) = Slot::new(frame.into(), deadline_after(timeout));
        match self.submit.try_send(slot) {
            Ok(()) => Ok(pending),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::PoolSaturated),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ServiceShutdown),
        }
    }

    /// Stops every channel. Queued and in-flight requests resolve as
    /// shutting down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Request/reply client on top of a [`ConnectionPool`].
pub struct Client {
    pool: ConnectionPool,
    timeout: Duration,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            pool: ConnectionPool::new(config),
            timeout: config.request_timeout,
        }
    }

    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Sends `action;{id};{params joined by ';'}` and waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] carrying the detail of a `KO` reply, including
    ///   broker-generated ones such as `Expired`.
    /// - The errors of [`ConnectionPool::submit`].
    pub async fn request(&self, action: &str, params: &[&str]) -> Result<String> {
        self.request_with_timeout(action, params, self.timeout).await
    }

    /// [`request`](Self::request) with an explicit reply timeout.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        action: &str,
        params: &[&str],
        timeout: Duration,
    ) -> Result<String> {
        let frame = RequestFrame::new(action, request_id(), params.join(";"));
        tracing::debug!("Requesting {}", frame.action);
        let raw = self.pool.submit(frame.encode(), timeout)?.await;
        Reply::parse(raw.as_bytes()).into_result()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Deadline `timeout` from now. Timeouts past what `Instant` can represent
/// are clamped to [`FAR_FUTURE`] from now.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A random alphanumeric request id. It only labels log lines; routing never
/// depends on it.
pub fn request_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_short_alphanumeric() {
        let id = request_id();
        assert_eq!(id.len(), REQUEST_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn saturated_queue_fails_fast() {
        // Nothing listens on this port, so channels never take work.
        let config = ClientConfig::default()
            .with_request_addr("127.0.0.1:9")
            .with_pool_size(1)
            .with_queue_capacity(2)
            .with_reconnect_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let pool = ConnectionPool::new(&config);

        let timeout = Duration::from_secs(30);
        let _a = pool.submit("TIME;a;", timeout).unwrap();
        let _b = pool.submit("TIME;b;", timeout).unwrap();
        assert!(matches!(
            pool.submit("TIME;c;", timeout),
            Err(Error::PoolSaturated)
        ));

        pool.shutdown();
        assert!(matches!(
            pool.submit("TIME;d;", timeout),
            Err(Error::ServiceShutdown)
        ));
    }

    #[tokio::test]
    async fn unbounded_timeout_is_accepted() {
        let config = ClientConfig::default()
            .with_request_addr("127.0.0.1:9")
            .with_pool_size(1)
            .with_reconnect_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let pool = ConnectionPool::new(&config);

        let pending = pool.submit("TIME;a;", Duration::MAX).unwrap();
        pool.shutdown();
        // Queued behind a channel that never connected; shutdown resolves it.
        let reply = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap();
        assert_eq!(reply, "KO|Service shutting down");
    }

    #[tokio::test]
    async fn deadline_after_clamps_overflow() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(86_400 * 365));
        assert!(deadline_after(Duration::from_secs(1)) <= Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unserved_request_resolves_at_its_deadline() {
        let config = ClientConfig::default()
            .with_request_addr("127.0.0.1:9")
            .with_pool_size(1);
        let pool = ConnectionPool::new(&config);

        let reply = pool
            .submit("TIME;a;", Duration::from_millis(50))
            .unwrap()
            .await;
        assert_eq!(reply, "KO|Request expired");
    }
}
