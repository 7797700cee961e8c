//! Worker bookkeeping.
//!
//! - [`worker`] - Per-worker record: address, expiry and in-flight slot.
//! - [`manager`] - The pool of ready and waiting workers (`WorkerPool`).

pub mod manager;
pub mod worker;
