//! Foreground service entry point: assembles the Scan Cache, Coordinator,
//! Scheduler, Request Handler, Notification Manager and Watchdog around
//! two adapter instances (scan-side, connect-side), then runs the IPC
//! server until SIGINT/SIGTERM.
//!
//! A single entry point with no subcommands: `#[derive(Parser)]` for
//! argument parsing plus `tracing_subscriber::fmt()` with an `EnvFilter`
//! for logging, initialized once at startup.

mod server;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ble_orchestrator_adapter::{BtleplugAdapter, ProcessHostControl};
use ble_orchestrator_core::coordinator::Coordinator;
use ble_orchestrator_core::handler::RequestHandler;
use ble_orchestrator_core::notification::NotificationManager;
use ble_orchestrator_core::scanner::{Scanner, ScannerHandle};
use ble_orchestrator_core::scheduler::Scheduler;
use ble_orchestrator_core::watchdog::{FailureLedger, Watchdog};
use ble_orchestrator_core::Config;
use clap::Parser;
use tokio::sync::{watch, RwLock};

const SERIAL_LANE_WATERMARK: usize = 100;
const PARALLEL_LANE_QUEUE_CAPACITY: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the orchestrator in the foreground. All configuration comes from
/// the environment; there are no flags beyond `--help`/`--version`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _args = Args::parse();

    let config = Config::from_env().context("loading configuration from the environment")?;
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let scan_adapter = Arc::new(
        BtleplugAdapter::named(&config.scan_adapter)
            .await
            .with_context(|| format!("opening scan adapter {}", config.scan_adapter))?,
    );
    let connect_adapter = Arc::new(
        BtleplugAdapter::named(&config.connect_adapter)
            .await
            .with_context(|| format!("opening connect adapter {}", config.connect_adapter))?,
    );

    let cache = Arc::new(RwLock::new(ble_orchestrator_domain::ScanCache::new(config.scan_cache_ttl)));
    let coordinator = Coordinator::new(config.exclusive_control_enabled, config.exclusive_control_timeout);
    let ledger = FailureLedger::new();
    let scanner_handle = ScannerHandle::new();
    let notifications = NotificationManager::new(connect_adapter.clone(), coordinator.clone(), config.ble_connect_timeout);
    let handler = RequestHandler::new(
        connect_adapter.clone(),
        cache.clone(),
        coordinator.clone(),
        ledger.clone(),
        notifications.clone(),
        config.ble_connect_timeout,
        config.ble_retry_count,
        config.ble_retry_interval,
    );
    let scheduler = Scheduler::new(
        handler.clone(),
        config.scan_command_parallel_workers,
        PARALLEL_LANE_QUEUE_CAPACITY,
        SERIAL_LANE_WATERMARK,
        config.skip_old_requests,
        config.request_max_age,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scanner = Scanner::new(scan_adapter, cache.clone(), coordinator.clone(), scanner_handle.clone(), ledger.clone());
    let scanner_task = tokio::spawn(scanner.run(shutdown_rx.clone()));

    let watchdog = Watchdog::new(
        Arc::new(ProcessHostControl::new()),
        ledger,
        coordinator,
        scanner_handle,
        config.connect_adapter.clone(),
        config.watchdog_check_interval,
        config.consecutive_failures_threshold,
    );
    let watchdog_task = tokio::spawn(watchdog.run(shutdown_rx.clone()));

    let sweep_notifications = notifications.clone();
    let sweep_cache = cache.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        return;
                    }
                }
            }
            sweep_cache.write().await.sweep();
            sweep_notifications.sweep_idle().await;
        }
    });

    let server_task = tokio::spawn(server::run(config, scheduler, handler, shutdown_rx));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
    shutdown_tx.send(true).ok();

    let _ = scanner_task.await;
    let _ = watchdog_task.await;
    sweep_task.abort();
    server_task
        .await
        .context("ipc server task panicked")?
        .context("ipc server exited with an error")?;

    Ok(())
}
