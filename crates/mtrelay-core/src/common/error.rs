//! Error types for the broker and its clients.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure in the system. Broker-side variants are
//! never allowed to unwind the routing loop; they are turned into `KO` reply
//! frames via [`Error::reply_detail`] or logged.
//!
//! ## Error Cases
//! - `NoWorkerAvailable`: The worker pool is exhausted; the request is queued.
//! - `RequestExpired`: A queued request outlived its TTL.
//! - `WorkerTimeout`: A dispatched request's worker never replied.
//! - `QueueFull`: Both the pool and the request queue are exhausted.
//! - `PoolSaturated`: The client-side submission queue is full.
//! - `ConnectionStalled`: A client channel's reply wait elapsed.
//! - `Remote`: The broker or a worker answered with a `KO` reply.
//! - `InvalidFrame`: A frame did not follow the wire grammar.
//! - `ChannelError`: An internal task channel closed unexpectedly.
//! - `Io`: A transport-level failure.
//! - `ServiceShutdown`: The broker or client is shutting down.

use crate::types::{EXPIRED_DETAIL, NO_WORKER_DETAIL, REQUEST_EXPIRED_DETAIL, SHUTDOWN_DETAIL};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the broker, its clients and workers.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// No ready worker could take the request.
    #[error("No worker available")]
    NoWorkerAvailable,

    /// A queued request's deadline elapsed before a worker became free.
    #[error("Request expired before a worker became available")]
    RequestExpired,

    /// A dispatched request's worker did not reply within its liveness window.
    #[error("Worker timed out waiting for a reply")]
    WorkerTimeout,

    /// The broker-side request queue is at capacity.
    #[error("Request queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// The client-side submission queue is at capacity.
    #[error("Client pool saturated; back off and resubmit")]
    PoolSaturated,

    /// A client channel gave up waiting for a reply.
    #[error("Connection stalled waiting for a reply")]
    ConnectionStalled,

    /// The remote side answered with a `KO` reply.
    #[error("Remote error: {detail}")]
    Remote { detail: String },

    /// A frame could not be parsed.
    #[error("Invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// Transport failure.
    #[error("I/O error: {context}")]
    Io { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// The human-readable payload carried by a synthetic `KO` reply for this
    /// error.
    pub fn reply_detail(&self) -> String {
        match self {
            Self::NoWorkerAvailable | Self::QueueFull { .. } => NO_WORKER_DETAIL.to_string(),
            Self::RequestExpired | Self::WorkerTimeout => EXPIRED_DETAIL.to_string(),
            Self::ConnectionStalled => REQUEST_EXPIRED_DETAIL.to_string(),
            Self::ServiceShutdown => SHUTDOWN_DETAIL.to_string(),
            Self::Remote { detail } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_details_match_wire_strings() {
        assert_eq!(
            Error::NoWorkerAvailable.reply_detail(),
            "Timout waiting for worker"
        );
        assert_eq!(
            Error::QueueFull { capacity: 3 }.reply_detail(),
            "Timout waiting for worker"
        );
        assert_eq!(Error::RequestExpired.reply_detail(), "Expired");
        assert_eq!(Error::WorkerTimeout.reply_detail(), "Expired");
        assert_eq!(
            Error::ConnectionStalled.reply_detail(),
            "Request expired"
        );
        assert_eq!(
            Error::Remote {
                detail: "Invalid symbol".into()
            }
            .reply_detail(),
            "Invalid symbol"
        );
    }

    #[test]
    fn io_errors_keep_their_message() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.to_string(), "I/O error: reset");
    }
}
