//! Permafrost CLI: continuous backup of IPFS DAGs to S3.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use permafrost::metrics::{self, HealthState};
use permafrost::signal::shutdown_signal;
use permafrost::{Config, init_tracing, pipeline};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let metrics_addr = match config.metrics_socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let health = HealthState::new(config.health_grace_period());
    if let Err(e) = metrics::init_global(metrics_addr, health.clone()) {
        eprintln!("Failed to start metrics server: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    info!(
        bucket = %config.s3_bucket_name,
        start_date = %config.start_date,
        concurrency = config.concurrency,
        "starting backup run"
    );

    match pipeline::run(config, shutdown, health).await {
        Ok(totals) => {
            info!(
                processed = totals.processed,
                successful = totals.successful,
                skipped = totals.skipped,
                failed = totals.failed(),
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Backup run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
