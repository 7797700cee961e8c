//! Broker service: endpoint binding, task wiring and graceful shutdown.
//!
//! [`BrokerService`] owns the four listeners and spawns:
//!
//! - one connection supervisor per endpoint ([`serve_endpoint`]),
//! - the router loop ([`run_router`]) fed by the client and worker endpoints,
//! - the event proxy loop ([`run_proxy`]) fed by the two event endpoints.
//!
//! The router and the proxy share nothing; each owns its state outright and
//! learns about connections only through its own event channel.

use crate::server::{
    config::BrokerConfig,
    proxy::{ProxySide, run_proxy},
    routing::router::{Router, Side, run_router},
    service::connection::serve_endpoint,
};
use anyhow::Context;
use std::net::SocketAddr;
use tokio::{net::TcpListener, sync::mpsc, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Capacity of the channel from connection tasks to the router or proxy.
const EVENT_BUFFER: usize = 4096;

/// Bound addresses of a running broker. With port `0` in the configuration
/// these are the ports the OS picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerAddrs {
    pub client: SocketAddr,
    pub worker: SocketAddr,
    pub client_events: SocketAddr,
    pub worker_events: SocketAddr,
}

pub struct BrokerService {
    config: BrokerConfig,
    client: TcpListener,
    worker: TcpListener,
    client_events: TcpListener,
    worker_events: TcpListener,
    shutdown: CancellationToken,
}

impl BrokerService {
    /// Binds every endpoint.
    ///
    /// # Errors
    ///
    /// Fails if any endpoint cannot be bound. Nothing is spawned in that case.
    pub async fn bind(config: BrokerConfig) -> anyhow::Result<Self> {
        async fn listen(name: &str, addr: SocketAddr) -> anyhow::Result<TcpListener> {
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {name} endpoint on {addr}"))
        }

        Ok(Self {
            client: listen("client", config.client_addr).await?,
            worker: listen("worker", config.worker_addr).await?,
            client_events: listen("client events", config.client_events_addr).await?,
            worker_events: listen("worker events", config.worker_events_addr).await?,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// # Errors
    ///
    /// Fails if a listener's local address cannot be read.
    pub fn local_addrs(&self) -> anyhow::Result<BrokerAddrs> {
        Ok(BrokerAddrs {
            client: self.client.local_addr()?,
            worker: self.worker.local_addr()?,
            client_events: self.client_events.local_addr()?,
            worker_events: self.worker_events.local_addr()?,
        })
    }

    /// Token that stops the service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops a service that is running on another task. Same as cancelling
    /// [`shutdown_token`](Self::shutdown_token).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Runs until the shutdown token is cancelled, then waits up to
    /// `shutdown_timeout` for the router to answer pending requests and for
    /// every connection task to flush its writes.
    ///
    /// # Errors
    ///
    /// Fails only if a core task panicked.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            client,
            worker,
            client_events,
            worker_events,
            shutdown,
        } = self;

        let mut tasks = JoinSet::new();
        let connections = TaskTracker::new();

        let (router_tx, router_rx) = mpsc::channel(EVENT_BUFFER);
        tasks.spawn(serve_endpoint(
            client,
            Side::Client,
            router_tx.clone(),
            connections.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(serve_endpoint(
            worker,
            Side::Worker,
            router_tx,
            connections.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(run_router(
            Router::new(&config),
            router_rx,
            config.heartbeat_interval,
            shutdown.clone(),
        ));

        let (proxy_tx, proxy_rx) = mpsc::channel(EVENT_BUFFER);
        tasks.spawn(serve_endpoint(
            worker_events,
            ProxySide::Publisher,
            proxy_tx.clone(),
            connections.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(serve_endpoint(
            client_events,
            ProxySide::Subscriber,
            proxy_tx,
            connections.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(run_proxy(proxy_rx, shutdown.clone()));

        tracing::info!(
            "Broker running: clients {}, workers {}, liveness {:?}, request TTL {:?}",
            config.client_addr,
            config.worker_addr,
            config.liveness_window(),
            config.request_ttl
        );

        shutdown.cancelled().await;
        tracing::info!("Shutting down broker...");

        // Core tasks first: the router answers pending requests and releases
        // the writers, then the connection tasks flush and exit.
        connections.close();
        let drain = async {
            while let Some(res) = tasks.join_next().await {
                res.context("broker task panicked")?;
            }
            connections.wait().await;
            anyhow::Ok(())
        };
        let drained = tokio::time::timeout(config.shutdown_timeout, drain).await;
        match drained {
            Ok(res) => res?,
            Err(_) => {
                tracing::warn!(
                    "Broker tasks did not finish within {:?}, aborting",
                    config.shutdown_timeout
                );
                tasks.abort_all();
                tracing::warn!("{} connection tasks still running", connections.len());
            }
        }

        tracing::info!("Broker shut down");
        Ok(())
    }
}
