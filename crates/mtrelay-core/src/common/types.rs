//! # Shared Types and Constants
//!
//! This module defines the connection identity type and the protocol-level
//! constants shared by the broker, its clients and its workers. Keeping them in
//! one place enforces a consistent contract for the text frame grammar.
//!
//! ## Overview
//!
//! - [`Address`] - The broker-side identity of one accepted connection
//! - Control tokens exchanged with workers ([`READY`], [`PING`], [`CLOSE`])
//! - Reply status tokens and the payloads of broker-generated replies
//! - Default tunables for endpoints, heartbeats and queues

use bytes::Bytes;
use core::fmt;
use core::time::Duration;

/// Worker announces it can take work.
pub const READY: &str = "READY";

/// Heartbeat, sent by the broker to ready workers and echoed back.
pub const PING: &str = "PING";

/// Worker disconnects gracefully.
pub const CLOSE: &str = "CLOSE";

/// Successful reply status.
pub const OK: &str = "OK";

/// Failed reply status.
pub const KO: &str = "KO";

/// Field separator inside request and reply frames.
pub const FIELD_SEPARATOR: char = ';';

/// Separator between the status and the detail of a broker-generated reply.
pub const STATUS_SEPARATOR: char = '|';

/// Payload of the `KO` reply sent when neither a worker nor a queue slot was
/// available. The spelling is part of the wire contract.
pub const NO_WORKER_DETAIL: &str = "Timout waiting for worker";

/// Payload of the `KO` reply sent when a queued or dispatched request expired.
pub const EXPIRED_DETAIL: &str = "Expired";

/// Payload of the client-side sentinel reply used when a channel's reply wait
/// elapses.
pub const REQUEST_EXPIRED_DETAIL: &str = "Request expired";

/// Payload of the `KO` reply sent to requests still pending at shutdown.
pub const SHUTDOWN_DETAIL: &str = "Service shutting down";

/// Maximum size of a single frame on any connection (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default bind address for client request channels.
pub const DEFAULT_CLIENT_ADDR: &str = "127.0.0.1:27027";

/// Default bind address for worker request channels.
pub const DEFAULT_WORKER_ADDR: &str = "0.0.0.0:28028";

/// Default bind address for event subscribers.
pub const DEFAULT_CLIENT_EVENTS_ADDR: &str = "127.0.0.1:27028";

/// Default bind address for event publishers.
pub const DEFAULT_WORKER_EVENTS_ADDR: &str = "0.0.0.0:28029";

/// Default number of client request channels.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default capacity of the client-side submission queue.
pub const DEFAULT_SUBMIT_QUEUE_CAPACITY: usize = 100;

/// Default client-side reply timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default broker heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of heartbeat intervals a worker may stay silent.
pub const DEFAULT_HEARTBEAT_LIVENESS: u32 = 10;

/// Default time a request may wait in the broker queue.
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);

/// Default capacity of each broker request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// The broker-side identity of one accepted connection.
///
/// `identity` is whatever the peer announced in its handshake frame (for
/// example `Client-3`). `conn` is assigned by the broker and never reused, so
/// two peers announcing the same identity, or one peer reconnecting, always
/// get distinct addresses.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    identity: Bytes,
    conn: u64,
}

impl Address {
    pub fn new(identity: impl Into<Bytes>, conn: u64) -> Self {
        Self {
            identity: identity.into(),
            conn,
        }
    }

    /// The identity the peer announced.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    /// The broker-assigned connection id.
    pub const fn conn(&self) -> u64 {
        self.conn
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", String::from_utf8_lossy(&self.identity), self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_on_distinct_connections_is_distinct() {
        let a = Address::new("Client-0", 1);
        let b = Address::new("Client-0", 2);
        assert_ne!(a, b);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.to_string(), "Client-0#1");
    }
}
