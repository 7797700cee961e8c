//! Request routing between clients and workers.
//!
//! - [`request`] - Tracked requests and their subscription classification.
//! - [`queue`] - Bounded, expiring FIFO for requests awaiting a worker.
//! - [`router`] - The routing state machine and its event loop.

pub mod queue;
pub mod request;
pub mod router;
