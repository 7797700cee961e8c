//! Broker service wiring and connection handling.
//!
//! ## Structure
//!
//! - [`handler`] - Endpoint binding and task lifecycle (`BrokerService`).
//! - [`connection`] - Per-connection handshake, reader and writer tasks.

pub mod connection;
pub mod handler;
