#![doc = include_str!("../README.md")]

pub mod config;
pub mod events;
pub mod pool;
pub mod worker;

pub use config::ClientConfig;
pub use events::EventListener;
pub use pool::{Client, ConnectionPool, PendingReply, request_id};
pub use worker::{EventPublisher, WorkerSession};
