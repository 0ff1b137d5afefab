//! Drives the scan-side adapter continuously, feeding every observed
//! advertisement into the Scan Cache, and yields to the Coordinator
//! whenever a Handler needs exclusive access to BLE hardware.
//!
//! Runs the familiar start_scan / sleep / drain peripherals / stop_scan
//! cycle as a long-running task rather than a one-shot call, with a
//! stall watchdog and recreate-on-stall fallback for an adapter that
//! stops reporting advertisements without erroring.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ble_orchestrator_adapter::AdapterFacade;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::watchdog::FailureLedger;
use crate::SharedScanCache;

const TICK_PERIOD: Duration = Duration::from_millis(500);
const STALL_THRESHOLD: Duration = Duration::from_secs(90);
const MIN_RECREATE_INTERVAL: Duration = Duration::from_secs(180);
const EPOCH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Counts a scanner recreation as progress for the Watchdog, same as a
/// freshly ingested advertisement would.
pub struct ScannerHandle {
    pub recreations: std::sync::atomic::AtomicU64,
}

impl ScannerHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recreations: std::sync::atomic::AtomicU64::new(0),
        })
    }
}

pub struct Scanner<A: AdapterFacade + ?Sized> {
    adapter: Arc<A>,
    cache: SharedScanCache,
    coordinator: Arc<Coordinator>,
    handle: Arc<ScannerHandle>,
    ledger: Arc<FailureLedger>,
    last_ingest: Instant,
    last_recreate: Instant,
}

impl<A: AdapterFacade + ?Sized + 'static> Scanner<A> {
    pub fn new(
        adapter: Arc<A>,
        cache: SharedScanCache,
        coordinator: Arc<Coordinator>,
        handle: Arc<ScannerHandle>,
        ledger: Arc<FailureLedger>,
    ) -> Self {
        let now = Instant::now();
        Self {
            adapter,
            cache,
            coordinator,
            handle,
            ledger,
            last_ingest: now,
            last_recreate: now,
        }
    }

    /// Runs until `shutdown` resolves. Intended to be spawned as its own
    /// task by the binary crate.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = BACKOFF_START;
        if let Err(e) = self.adapter.start_scan().await {
            error!(error = %e, "initial scan start failed");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_PERIOD) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.adapter.stop_scan().await;
                        info!("scanner shutting down");
                        return;
                    }
                }
            }

            if self.coordinator.is_epoch_open().await {
                self.yield_to_client().await;
                continue;
            }

            match self.drain_and_ingest().await {
                Ok(count) if count > 0 => {
                    self.last_ingest = Instant::now();
                    backoff = BACKOFF_START;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, ?backoff, "scan tick failed, backing off");
                    if backoff > BACKOFF_START {
                        // Not the first consecutive failure: the backoff
                        // ladder has already escalated once, so this is
                        // the "repeated failure" §4.2 requires raising to
                        // the Watchdog.
                        self.ledger.signal_stall();
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            }

            self.maybe_recreate().await;
        }
    }

    async fn drain_and_ingest(&self) -> Result<usize, ble_orchestrator_adapter::AdapterError> {
        let records = self.adapter.drain_discovered().await?;
        let count = records.len();
        let mut cache = self.cache.write().await;
        for record in records {
            cache.ingest(record);
        }
        cache.sweep();
        Ok(count)
    }

    async fn yield_to_client(&mut self) {
        info!("coordinator epoch open, pausing scan for exclusive client access");
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "stop_scan failed while yielding to client");
        }
        self.coordinator.signal_scan_stopped().await;
        self.coordinator.await_client_completed(CLIENT_WAIT_TIMEOUT).await;
        if let Err(e) = self.adapter.start_scan().await {
            error!(error = %e, "failed to resume scan after client epoch");
        }
        self.last_ingest = Instant::now();
    }

    async fn maybe_recreate(&mut self) {
        let stalled = self.last_ingest.elapsed() > STALL_THRESHOLD;
        let eligible = self.last_recreate.elapsed() > MIN_RECREATE_INTERVAL;
        if stalled && eligible {
            warn!("no advertisements observed recently, recreating scan session");
            self.ledger.signal_stall();
            let _ = self.adapter.stop_scan().await;
            if let Err(e) = self.adapter.start_scan().await {
                error!(error = %e, "scan recreation failed");
            }
            self.last_recreate = Instant::now();
            self.last_ingest = Instant::now();
            self.handle
                .recreations
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Exposed for the "epoch duration recorded under the deadlock threshold" property test:
    /// lets a test assert the epoch-wait timeout used by the Handler
    /// side matches this module's constant.
    pub fn epoch_wait_timeout() -> Duration {
        EPOCH_WAIT_TIMEOUT
    }
}
