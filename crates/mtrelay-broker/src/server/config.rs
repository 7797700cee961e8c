use crate::server::pool::manager::AffinityMiss;
use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use mtrelay_core::types::{
    DEFAULT_CLIENT_ADDR, DEFAULT_CLIENT_EVENTS_ADDR, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_LIVENESS, DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_TTL, DEFAULT_WORKER_ADDR,
    DEFAULT_WORKER_EVENTS_ADDR,
};
use std::net::SocketAddr;

/// Runtime configuration for the `mtrelay-broker` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first), with defaults that match a single-host deployment
/// next to the trading terminals.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mtrelay-broker",
    version,
    about = "Load-balancing RPC broker and event proxy for trading-terminal workers"
)]
pub struct CliArgs {
    /// Endpoint client request channels connect to.
    ///
    /// Environment variable: `CLIENT_ADDR`
    #[arg(long, env = "CLIENT_ADDR", default_value_t = String::from(DEFAULT_CLIENT_ADDR))]
    pub client_addr: String,

    /// Endpoint workers connect to.
    ///
    /// Environment variable: `WORKER_ADDR`
    #[arg(long, env = "WORKER_ADDR", default_value_t = String::from(DEFAULT_WORKER_ADDR))]
    pub worker_addr: String,

    /// Endpoint event subscribers connect to.
    ///
    /// Environment variable: `CLIENT_EVENTS_ADDR`
    #[arg(long, env = "CLIENT_EVENTS_ADDR", default_value_t = String::from(DEFAULT_CLIENT_EVENTS_ADDR))]
    pub client_events_addr: String,

    /// Endpoint event publishers connect to.
    ///
    /// Environment variable: `WORKER_EVENTS_ADDR`
    #[arg(long, env = "WORKER_EVENTS_ADDR", default_value_t = String::from(DEFAULT_WORKER_EVENTS_ADDR))]
    pub worker_events_addr: String,

    /// Milliseconds between heartbeat ticks.
    ///
    /// Each tick purges expired requests and workers, then pings every idle
    /// worker.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_MS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64)]
    pub heartbeat_interval_ms: u64,

    /// Number of heartbeat intervals a worker may stay silent before it is
    /// presumed dead. Also bounds how long a dispatched request may go
    /// unanswered.
    ///
    /// Environment variable: `HEARTBEAT_LIVENESS`
    #[arg(long, env = "HEARTBEAT_LIVENESS", default_value_t = DEFAULT_HEARTBEAT_LIVENESS)]
    pub heartbeat_liveness: u32,

    /// Milliseconds a request may wait in a queue for a worker.
    ///
    /// Environment variable: `REQUEST_TTL_MS`
    #[arg(long, env = "REQUEST_TTL_MS", default_value_t = DEFAULT_REQUEST_TTL.as_millis() as u64)]
    pub request_ttl_ms: u64,

    /// Capacity of each request queue (ordinary and subscription). A request
    /// arriving at a full queue is answered with `KO` immediately.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// What a subscription command does when the publisher worker is gone:
    /// `wait` queues it for the next publisher, `substitute` sends it to any
    /// idle worker.
    ///
    /// Environment variable: `AFFINITY_MISS`
    #[arg(long, env = "AFFINITY_MISS", value_enum, default_value_t = AffinityMissArg::Wait)]
    pub affinity_miss: AffinityMissArg,

    /// Comma-separated action prefixes routed to the publisher worker.
    ///
    /// Environment variable: `SUBSCRIBE_PREFIXES`
    #[arg(long, env = "SUBSCRIBE_PREFIXES", value_delimiter = ',', default_value = "SUB_,UNSUB_")]
    pub subscribe_prefixes: Vec<String>,

    /// Seconds to wait for tasks to finish after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMissArg {
    Wait,
    Substitute,
}

impl From<AffinityMissArg> for AffinityMiss {
    fn from(arg: AffinityMissArg) -> Self {
        match arg {
            AffinityMissArg::Wait => Self::Wait,
            AffinityMissArg::Substitute => Self::Substitute,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub client_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    pub client_events_addr: SocketAddr,
    pub worker_events_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub heartbeat_liveness: u32,
    pub request_ttl: Duration,
    pub queue_capacity: usize,
    pub affinity_miss: AffinityMiss,
    pub subscribe_prefixes: Vec<String>,
    pub shutdown_timeout: Duration,
}

impl BrokerConfig {
    /// How long a worker may stay silent, and how long a dispatched request
    /// may go unanswered.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_liveness)
    }

    /// A configuration with every endpoint on an ephemeral loopback port.
    pub fn loopback() -> Self {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            client_addr: any,
            worker_addr: any,
            client_events_addr: any,
            worker_events_addr: any,
            ..Self::default()
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let parse = |addr: &str| addr.parse().unwrap_or(SocketAddr::from(([127, 0, 0, 1], 0)));
        Self {
            client_addr: parse(DEFAULT_CLIENT_ADDR),
            worker_addr: parse(DEFAULT_WORKER_ADDR),
            client_events_addr: parse(DEFAULT_CLIENT_EVENTS_ADDR),
            worker_events_addr: parse(DEFAULT_WORKER_EVENTS_ADDR),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_liveness: DEFAULT_HEARTBEAT_LIVENESS,
            request_ttl: DEFAULT_REQUEST_TTL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            affinity_miss: AffinityMiss::default(),
            subscribe_prefixes: vec!["SUB_".to_string(), "UNSUB_".to_string()],
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TryFrom<CliArgs> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.heartbeat_interval_ms == 0 {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than 0");
        }
        if args.heartbeat_liveness == 0 {
            bail!("HEARTBEAT_LIVENESS must be greater than 0");
        }
        if args.request_ttl_ms == 0 {
            bail!("REQUEST_TTL_MS must be greater than 0");
        }
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        let endpoint = |name: &str, raw: &str| -> anyhow::Result<SocketAddr> {
            raw.parse()
                .with_context(|| format!("{name} ({raw}) is not a socket address"))
        };

        let subscribe_prefixes: Vec<String> = args
            .subscribe_prefixes
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Ok(Self {
            client_addr: endpoint("CLIENT_ADDR", &args.client_addr)?,
            worker_addr: endpoint("WORKER_ADDR", &args.worker_addr)?,
            client_events_addr: endpoint("CLIENT_EVENTS_ADDR", &args.client_events_addr)?,
            worker_events_addr: endpoint("WORKER_EVENTS_ADDR", &args.worker_events_addr)?,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            heartbeat_liveness: args.heartbeat_liveness,
            request_ttl: Duration::from_millis(args.request_ttl_ms),
            queue_capacity: args.queue_capacity,
            affinity_miss: args.affinity_miss.into(),
            subscribe_prefixes,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
