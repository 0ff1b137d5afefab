//! Exclusive-control coordinator: the Scanner and the Handler/Notification
//! Manager must never touch the connect-side adapter at the same moment
//! as the scan-side one is mutated by the Scanner, so every connect
//! operation runs inside a Coordinator "epoch" the Scanner yields to.
//!
//! This replaces a module-scope lock-plus-three-events design with one
//! owned state value so the epoch machine is testable in isolation and
//! so a test can construct more than one Coordinator in the same process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    StopRequested,
    ClientActive,
}

struct Inner {
    state: State,
    epoch_start: Option<Instant>,
}

/// Owned by both the Scanner and the Handler (via `Arc`); `request_pause`
/// is safe to call from any worker and multiple concurrent callers
/// funnel through one mutex so only one epoch opens at a time.
pub struct Coordinator {
    enabled: bool,
    deadlock_threshold: Duration,
    inner: Mutex<Inner>,
    scan_stopped: Notify,
    client_completed: Notify,
    scan_ready: Notify,
}

impl Coordinator {
    pub fn new(enabled: bool, deadlock_threshold: Duration) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            deadlock_threshold,
            inner: Mutex::new(Inner {
                state: State::Idle,
                epoch_start: None,
            }),
            scan_stopped: Notify::new(),
            client_completed: Notify::new(),
            scan_ready: Notify::new(),
        })
    }

    /// Called by a Handler before it needs exclusive access to the
    /// connect-side adapter. Idempotent within a single epoch: a second
    /// caller observes the epoch already open and simply waits on the
    /// same `scan_stopped` notification.
    pub async fn request_pause(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.state == State::Idle {
            inner.state = State::StopRequested;
            inner.epoch_start = Some(Instant::now());
        }
    }

    /// Called by the Scanner once it has actually stopped scanning in
    /// response to a pending `StopRequested` epoch.
    pub async fn signal_scan_stopped(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.state == State::StopRequested {
            inner.state = State::ClientActive;
        }
        self.scan_stopped.notify_waiters();
    }

    /// A Handler waits up to `timeout` for the Scanner's `scan_stopped`
    /// signal; exclusive control is advisory, so on timeout the
    /// Handler proceeds anyway and logs a warning rather than failing
    /// the request.
    pub async fn await_scan_stopped(&self, timeout: Duration) {
        if !self.enabled {
            return;
        }
        if tokio::time::timeout(timeout, self.scan_stopped.notified())
            .await
            .is_err()
        {
            warn!(?timeout, "scan_stopped wait timed out, proceeding without exclusive control");
        }
    }

    /// Called by the Handler once its BLE operation has finished,
    /// regardless of outcome — every exit path from the Handler must
    /// reach this call so no epoch is left open.
    pub async fn notify_done(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.state = State::Idle;
        inner.epoch_start = None;
        self.client_completed.notify_waiters();
        self.scan_ready.notify_waiters();
    }

    /// The Scanner waits up to `timeout` for `client_completed` before
    /// resuming scanning unconditionally and leaving the epoch open for
    /// deadlock probing.
    pub async fn await_client_completed(&self, timeout: Duration) {
        if !self.enabled {
            return;
        }
        if tokio::time::timeout(timeout, self.client_completed.notified())
            .await
            .is_err()
        {
            warn!(?timeout, "client_completed wait timed out, resuming scan anyway");
        }
    }

    /// True once an open epoch has outlasted the deadlock threshold.
    pub async fn probe_deadlock(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let inner = self.inner.lock().await;
        match inner.epoch_start {
            Some(start) => start.elapsed() > self.deadlock_threshold,
            None => false,
        }
    }

    /// Recovery action, not a routine one: clears all flags and releases
    /// both terminal waiters as if `notify_done` had been called.
    pub async fn force_reset(&self) {
        error!("coordinator force_reset invoked, an epoch exceeded the deadlock threshold");
        let mut inner = self.inner.lock().await;
        inner.state = State::Idle;
        inner.epoch_start = None;
        self.scan_stopped.notify_waiters();
        self.client_completed.notify_waiters();
        self.scan_ready.notify_waiters();
    }

    pub async fn is_epoch_open(&self) -> bool {
        self.inner.lock().await.state != State::Idle
    }
}
