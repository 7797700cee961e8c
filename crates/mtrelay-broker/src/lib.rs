#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    config::{BrokerConfig, CliArgs},
    pool::manager::AffinityMiss,
    service::handler::{BrokerAddrs, BrokerService},
    telemetry::{TelemetryProviders, init_telemetry},
};
