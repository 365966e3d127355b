//! Process entry point: loads configuration, wires up the collector and its two
//! network-facing collaborators (ingress decoder, scrape dispatcher), and waits for a
//! shutdown signal.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use prom_aggregator::collector::Collector;
use prom_aggregator::config::Config;
use prom_aggregator::registry_index::RegistryIndex;
use prom_aggregator::selfmetrics::SelfMetrics;
use prom_aggregator::{ingress, scrape};

/// Bound on how long `Stop` waits for the folding and expiration tasks to exit.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.as_tracing_level())
        .init();

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if config.max_procs != 0 {
        runtime_builder.worker_threads(config.max_procs);
    }
    let runtime = match runtime_builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let index = Arc::new(RegistryIndex::new());
    let self_metrics = Arc::new(SelfMetrics::new());
    let collector = Arc::new(Collector::new(
        Arc::clone(&index),
        Arc::clone(&self_metrics),
        config.ingress_queue_size,
        config.expiration_time,
        config.expiration_tick(),
    ));
    collector.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut ingress_task = tokio::spawn(ingress::run(
        config.tcp_addr,
        config.tcp_buffer_size,
        Arc::clone(&collector),
        Arc::clone(&self_metrics),
        shutdown_rx.clone(),
    ));
    let mut scrape_task = tokio::spawn(scrape::run(config.metrics_addr, Arc::clone(&collector), shutdown_rx.clone()));

    info!(tcp_addr = %config.tcp_addr, metrics_addr = %config.metrics_addr, "aggregator started");

    // Either collaborator exiting on its own (e.g. a bind error surfacing after an
    // accept-loop `?`) is treated the same as a startup failure: both are fatal per the
    // spec's "Bind failure" error class, just observed after the fact instead of before.
    let exit_code = tokio::select! {
        () = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            ExitCode::SUCCESS
        }
        result = &mut ingress_task => {
            error!(?result, "ingress listener exited unexpectedly");
            ExitCode::FAILURE
        }
        result = &mut scrape_task => {
            error!(?result, "scrape listener exited unexpectedly");
            ExitCode::FAILURE
        }
    };

    let _ = shutdown_tx.send(true);
    ingress_task.abort();
    scrape_task.abort();

    if let Err(err) = collector.stop(SHUTDOWN_WINDOW).await {
        error!(error = %err, "collector did not shut down within the shutdown window");
        return ExitCode::FAILURE;
    }

    exit_code
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
