//! Serial-lane [`Executor`]: resolves a `mac`, takes exclusive control of
//! the connect-side adapter, performs one BLE operation, and always
//! releases control on every exit path. CacheLookup and
//! Subscribe/Unsubscribe are also routed through here so the Scheduler
//! stays ignorant of how any particular kind of work actually happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_adapter::AdapterFacade;
use ble_orchestrator_domain::request::{CharacteristicRef, RequestKind};
use ble_orchestrator_domain::{MacAddress, OrchestratorError, Request, SessionId};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::coordinator::Coordinator;
use crate::notification::{NotificationFrame, NotificationManager};
use crate::scanner::Scanner;
use crate::scheduler::{Executor, Outcome};
use crate::watchdog::FailureLedger;
use crate::SharedScanCache;

pub struct RequestHandler<A: AdapterFacade + ?Sized> {
    adapter: Arc<A>,
    cache: SharedScanCache,
    coordinator: Arc<Coordinator>,
    ledger: Arc<FailureLedger>,
    notifications: Arc<NotificationManager<A>>,
    connect_timeout: Duration,
    retry_count: u32,
    retry_interval: Duration,
    /// Prevents two concurrent connect attempts even if lane rules were
    /// somehow bypassed — the serial lane already guarantees this, this
    /// is a belt-and-braces invariant.
    single_op: Mutex<()>,
    pending_subscribes: Mutex<HashMap<String, (SessionId, Option<Duration>, mpsc::Sender<NotificationFrame>)>>,
}

impl<A: AdapterFacade + ?Sized + 'static> RequestHandler<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<A>,
        cache: SharedScanCache,
        coordinator: Arc<Coordinator>,
        ledger: Arc<FailureLedger>,
        notifications: Arc<NotificationManager<A>>,
        connect_timeout: Duration,
        retry_count: u32,
        retry_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            cache,
            coordinator,
            ledger,
            notifications,
            connect_timeout,
            retry_count,
            retry_interval,
            single_op: Mutex::new(()),
            pending_subscribes: Mutex::new(HashMap::new()),
        })
    }

    /// Called by the IPC layer before submitting a Subscribe request to
    /// the Scheduler, since the Scheduler's `Executor` contract carries
    /// only the typed `Request` and a subscription needs a session's
    /// outbound channel to fan notifications into.
    pub async fn register_subscribe_sink(
        &self,
        request_id: String,
        session: SessionId,
        notification_timeout: Option<Duration>,
        sink: mpsc::Sender<NotificationFrame>,
    ) {
        self.pending_subscribes
            .lock()
            .await
            .insert(request_id, (session, notification_timeout, sink));
    }

    pub fn notifications(&self) -> Arc<NotificationManager<A>> {
        self.notifications.clone()
    }

    pub fn cache(&self) -> SharedScanCache {
        self.cache.clone()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn failure_ledger(&self) -> Arc<FailureLedger> {
        self.ledger.clone()
    }

    async fn known(&self, mac: MacAddress) -> bool {
        self.cache.read().await.lookup(mac).is_some()
    }

    async fn cache_lookup(&self, mac: MacAddress) -> Result<Outcome, OrchestratorError> {
        let mut cache = self.cache.write().await;
        cache
            .lookup(mac)
            .map(Outcome::Advertisement)
            .ok_or(OrchestratorError::DeviceNotFound)
    }

    /// `cancel` fires once the Scheduler's per-request deadline elapses.
    /// It is checked at the two suspension points that matter — the
    /// connect attempt and the operation itself — so a cancelled request
    /// still disconnects and closes the Coordinator epoch instead of
    /// being abandoned mid-flight.
    async fn with_connection<F, Fut, T>(
        &self,
        mac: MacAddress,
        remaining: Duration,
        cancel: CancellationToken,
        op: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(ble_orchestrator_adapter::ConnectionHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T, ble_orchestrator_adapter::AdapterError>>,
    {
        if !self.known(mac).await {
            return Err(OrchestratorError::DeviceNotFound);
        }

        let _guard = self.single_op.lock().await;
        self.coordinator.request_pause().await;
        self.coordinator
            .await_scan_stopped(Scanner::<A>::epoch_wait_timeout())
            .await;

        let handle = tokio::select! {
            result = self.connect_with_retry(mac, remaining) => match result {
                Ok(handle) => handle,
                Err(e) => {
                    self.coordinator.notify_done().await;
                    return Err(e);
                }
            },
            _ = cancel.cancelled() => {
                self.coordinator.notify_done().await;
                return Err(OrchestratorError::Timeout);
            }
        };

        let op_result = tokio::select! {
            result = op(handle) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let disconnect_result = self.adapter.disconnect(handle).await;
        if let Err(e) = disconnect_result {
            warn!(%mac, error = %e, "disconnect after operation reported an error");
        }
        self.coordinator.notify_done().await;

        match op_result {
            None => {
                warn!(%mac, "operation cancelled past its deadline");
                Err(OrchestratorError::Timeout)
            }
            Some(Ok(value)) => {
                self.ledger.record_connect_success();
                Ok(value)
            }
            Some(Err(e)) => {
                warn!(%mac, error = %e, "BLE operation failed");
                Err(OrchestratorError::OperationFailed)
            }
        }
    }

    async fn connect_with_retry(
        &self,
        mac: MacAddress,
        remaining: Duration,
    ) -> Result<ble_orchestrator_adapter::ConnectionHandle, OrchestratorError> {
        let attempts = self.retry_count + 1;
        for attempt in 0..attempts {
            let timeout = self.connect_timeout.min(remaining);
            match self.adapter.connect(mac, timeout).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    let failures = self.ledger.record_connect_failure();
                    warn!(%mac, attempt, error = %e, failures, "connect attempt failed");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(OrchestratorError::ConnectionFailed)
    }

    async fn read(
        &self,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        remaining: Duration,
        cancel: CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        self.with_connection(mac, remaining, cancel, |handle| async move {
            self.adapter.read(handle, characteristic).await
        })
        .await
        .map(Outcome::ReadValue)
    }

    async fn write(
        &self,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        payload: &[u8],
        wants_response: bool,
        remaining: Duration,
        cancel: CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        let payload = payload.to_vec();
        self.with_connection(mac, remaining, cancel, |handle| async move {
            self.adapter.write(handle, characteristic, &payload, wants_response).await
        })
        .await
        .map(|_| Outcome::Written)
    }

    async fn subscribe(
        &self,
        request_id: &str,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        callback_id: ble_orchestrator_domain::CallbackId,
    ) -> Result<Outcome, OrchestratorError> {
        let Some((session, idle_timeout, sink)) = self.pending_subscribes.lock().await.remove(request_id) else {
            return Err(OrchestratorError::InvalidRequest);
        };
        self.notifications
            .subscribe(mac, characteristic, callback_id, session, idle_timeout, sink)
            .await
            .map(|_| Outcome::Subscribed)
    }

    async fn unsubscribe(&self, callback_id: &ble_orchestrator_domain::CallbackId) -> Result<Outcome, OrchestratorError> {
        self.notifications.unsubscribe(callback_id).await.map(|_| Outcome::Unsubscribed)
    }
}

#[async_trait]
impl<A: AdapterFacade + ?Sized + 'static> Executor for RequestHandler<A> {
    async fn execute(&self, request: &Request, remaining: Duration, cancel: CancellationToken) -> Result<Outcome, OrchestratorError> {
        match request.kind.clone() {
            RequestKind::CacheLookup { mac } => self.cache_lookup(mac).await,
            RequestKind::Read { mac, characteristic } => self.read(mac, characteristic, remaining, cancel).await,
            RequestKind::Write { mac, characteristic, payload, wants_response } => {
                self.write(mac, characteristic, &payload, wants_response, remaining, cancel).await
            }
            RequestKind::Subscribe { mac, characteristic, callback_id, .. } => {
                self.subscribe(&request.request_id, mac, characteristic, callback_id).await
            }
            RequestKind::Unsubscribe { callback_id } => self.unsubscribe(&callback_id).await,
        }
    }
}
