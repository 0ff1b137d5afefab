//! Failure Ledger plus the Watchdog's recovery ladder. The ledger has
//! many writers (every Handler connect attempt) and one reader (the
//! Watchdog); writes are commutative counters, so a couple of atomics
//! suffice without a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ble_orchestrator_adapter::HostControl;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::scanner::ScannerHandle;

const LIGHTWEIGHT_RESET_SETTLE: Duration = Duration::from_secs(2);
const FULL_RESET_SETTLE: Duration = Duration::from_secs(5);
const STACK_RESTART_SETTLE: Duration = Duration::from_secs(10);
const STEP_COOLDOWN: Duration = Duration::from_secs(60);

/// Shared between every Handler (writer) and the Watchdog (reader).
#[derive(Default)]
pub struct FailureLedger {
    consecutive_connect_failures: AtomicU32,
    stall_signal: AtomicBool,
}

impl FailureLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_connect_failure(&self) -> u32 {
        self.consecutive_connect_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_connect_success(&self) {
        self.consecutive_connect_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_connect_failures(&self) -> u32 {
        self.consecutive_connect_failures.load(Ordering::SeqCst)
    }

    pub fn signal_stall(&self) {
        self.stall_signal.store(true, Ordering::SeqCst);
    }

    fn take_stall_signal(&self) -> bool {
        self.stall_signal.swap(false, Ordering::SeqCst)
    }
}

/// One rung of the recovery ladder. Escalates forward on failure and
/// holds at `StackRestart`, the last rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryRung {
    Lightweight,
    Full,
    StackRestart,
}

impl RecoveryRung {
    fn escalate(self) -> Self {
        match self {
            RecoveryRung::Lightweight => RecoveryRung::Full,
            RecoveryRung::Full => RecoveryRung::StackRestart,
            RecoveryRung::StackRestart => RecoveryRung::StackRestart,
        }
    }
}

/// Periodic check (default every 30s) plus event-driven wakeup on a
/// failure signal. Advances one rung of the recovery ladder per
/// eligible tick, stopping (and resetting to the first rung) as soon as
/// a rung reports success; a failed rung is retried (at the next,
/// escalated rung) only after the cooldown since the last attempt has
/// elapsed.
pub struct Watchdog<H: HostControl + ?Sized> {
    host_control: Arc<H>,
    ledger: Arc<FailureLedger>,
    coordinator: Arc<Coordinator>,
    scanner_handle: Arc<ScannerHandle>,
    connect_adapter: String,
    check_interval: Duration,
    failure_threshold: u32,
    last_attempt: Option<std::time::Instant>,
    pending_rung: Option<RecoveryRung>,
}

impl<H: HostControl + ?Sized + 'static> Watchdog<H> {
    pub fn new(
        host_control: Arc<H>,
        ledger: Arc<FailureLedger>,
        coordinator: Arc<Coordinator>,
        scanner_handle: Arc<ScannerHandle>,
        connect_adapter: String,
        check_interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            host_control,
            ledger,
            coordinator,
            scanner_handle,
            connect_adapter,
            check_interval,
            failure_threshold,
            last_attempt: None,
            pending_rung: None,
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("watchdog shutting down");
                        return;
                    }
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        if self.coordinator.probe_deadlock().await {
            warn!("watchdog observed an epoch past the deadlock threshold, forcing reset");
            self.coordinator.force_reset().await;
        }

        let stalled = self.ledger.take_stall_signal();
        let failures = self.ledger.consecutive_connect_failures();
        let ladder_active = self.pending_rung.is_some();
        if failures < self.failure_threshold && !stalled && !ladder_active {
            return;
        }

        if let Some(last) = self.last_attempt {
            if last.elapsed() < STEP_COOLDOWN {
                return;
            }
        }
        self.last_attempt = Some(std::time::Instant::now());

        let rung = self.pending_rung.unwrap_or(RecoveryRung::Lightweight);
        warn!(failures, stalled, ?rung, "watchdog advancing recovery ladder");

        self.coordinator.request_pause().await;
        self.coordinator.signal_scan_stopped().await;

        let recovered = match rung {
            RecoveryRung::Lightweight => self.lightweight_reset().await,
            RecoveryRung::Full => self.full_reset().await,
            RecoveryRung::StackRestart => self.stack_restart().await,
        };

        self.pending_rung = if recovered {
            None
        } else {
            error!(?rung, "recovery ladder rung failed, will escalate after cooldown");
            Some(rung.escalate())
        };

        self.coordinator.notify_done().await;
    }

    async fn lightweight_reset(&self) -> bool {
        info!(adapter = %self.connect_adapter, "watchdog: lightweight adapter reset");
        if !self.host_control.cycle_adapter(&self.connect_adapter).await {
            error!("lightweight reset unavailable or failed, escalating");
            return false;
        }
        tokio::time::sleep(LIGHTWEIGHT_RESET_SETTLE).await;
        true
    }

    async fn full_reset(&self) -> bool {
        info!(adapter = %self.connect_adapter, "watchdog: full adapter reset");
        if !self.host_control.reset_adapter(&self.connect_adapter).await {
            error!("full adapter reset unavailable or failed, escalating");
            return false;
        }
        tokio::time::sleep(FULL_RESET_SETTLE).await;
        true
    }

    async fn stack_restart(&self) -> bool {
        info!("watchdog: restarting host BLE stack");
        if !self.host_control.restart_stack().await {
            error!("stack restart unavailable or failed");
            return false;
        }
        tokio::time::sleep(STACK_RESTART_SETTLE).await;
        self.ledger.record_connect_success();
        self.scanner_handle
            .recreations
            .fetch_add(1, Ordering::Relaxed);
        true
    }
}
