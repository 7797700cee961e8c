//! End-to-end demo against a running broker.
//!
//! Starts one worker that answers `TIME` and publishes a `TICK` event every
//! poll, an event listener that logs what it receives, and a client that polls
//! `TIME` until Ctrl+C.

use clap::Parser;
use core::time::Duration;
use mtrelay_client::{Client, ClientConfig, EventListener, EventPublisher, WorkerSession};
use mtrelay_core::{
    Error,
    types::{DEFAULT_WORKER_ADDR, DEFAULT_WORKER_EVENTS_ADDR},
    wire::{Event, Reply},
};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "mtrelay end-to-end demo")]
struct DemoArgs {
    /// Broker client endpoint
    #[arg(long, env = "CLIENT_ADDR", default_value_t = ClientConfig::default().request_addr)]
    client_addr: String,

    /// Broker worker endpoint
    #[arg(long, env = "WORKER_CONNECT_ADDR", default_value_t = loopback(DEFAULT_WORKER_ADDR))]
    worker_addr: String,

    /// Broker subscriber endpoint
    #[arg(long, env = "CLIENT_EVENTS_ADDR", default_value_t = ClientConfig::default().events_addr)]
    client_events_addr: String,

    /// Broker publisher endpoint
    #[arg(long, env = "WORKER_EVENTS_CONNECT_ADDR", default_value_t = loopback(DEFAULT_WORKER_EVENTS_ADDR))]
    worker_events_addr: String,

    /// Delay between two `TIME` requests
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 2_000)]
    poll_interval_ms: u64,
}

/// Broker listen addresses bind every interface; the demo dials loopback.
fn loopback(listen: &str) -> String {
    listen.replacen("0.0.0.0", "127.0.0.1", 1)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = DemoArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let token = CancellationToken::new();
    let config = ClientConfig::default()
        .with_request_addr(args.client_addr)
        .with_events_addr(args.client_events_addr);

    let worker = WorkerSession::new(args.worker_addr, "demo-worker");
    let worker_task = tokio::spawn(worker.run(
        |request| async move {
            match request.action.as_str() {
                "TIME" => Reply::ok(request.request_id, unix_seconds().to_string()),
                other => Reply::ko(format!("Unknown action {other}")),
            }
        },
        token.child_token(),
    ));

    let listener = EventListener::new(&config);
    let listener_task = tokio::spawn(listener.run(
        |event: Event| async move {
            tracing::info!("Event {}: {}", event.topic, event.data_lossy());
        },
        token.child_token(),
    ));

    let mut publisher = EventPublisher::connect(&args.worker_events_addr, "demo-publisher").await?;
    let client = Client::new(&config);
    let mut poll = tokio::time::interval(Duration::from_millis(args.poll_interval_ms));

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
            _ = poll.tick() => {}
        }

        match client.request("TIME", &[]).await {
            Ok(time) => tracing::info!("Server time: {time}"),
            Err(Error::Remote { detail }) => tracing::warn!("Request failed: {detail}"),
            Err(e) => tracing::error!("Request failed: {e}"),
        }
        let tick = Event::new("TICK", unix_seconds().to_string());
        if let Err(e) = publisher.publish(&tick).await {
            tracing::warn!("Publish failed: {e}");
        }
    }

    tracing::info!("Shutting down demo");
    token.cancel();
    client.shutdown();
    worker_task.await??;
    listener_task.await??;
    Ok(())
}
