use clap::Parser;
use mtrelay_broker::{BrokerConfig, BrokerService, CliArgs, init_telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Many short-lived frames cross task boundaries; mimalloc keeps allocation
// cheap under that churn, notably on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = BrokerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let service = BrokerService::bind(config).await?;
    tokio::spawn(shutdown_signal(service.shutdown_token()));
    let res = service.run().await;

    providers.shutdown();
    res
}

fn log_startup_info(config: &BrokerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting broker with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting broker: clients on {}, workers on {}, events {} -> {}",
            config.client_addr,
            config.worker_addr,
            config.worker_events_addr,
            config.client_events_addr
        );
    }
}

async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = token.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    token.cancel();
}
