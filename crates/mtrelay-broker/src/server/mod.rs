pub mod config;
pub mod outbound;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod service;
pub mod telemetry;
