//! End-to-end scenarios exercising the public core API against
//! [`FakeAdapter`], independent of the IPC wire format. Each test name
//! matches one scenario from the service's testable-properties list.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_adapter::fake::FakeAdapter;
use ble_orchestrator_adapter::host_control::HostControl;
use ble_orchestrator_adapter::{AdapterError, AdapterFacade, ConnectionHandle};
use ble_orchestrator_domain::request::{CharacteristicRef, Priority, RequestKind};
use ble_orchestrator_domain::{AdvertisementRecord, MacAddress, OrchestratorError, Request};
use ble_orchestrator_core::coordinator::Coordinator;
use ble_orchestrator_core::handler::RequestHandler;
use ble_orchestrator_core::notification::NotificationManager;
use ble_orchestrator_core::scanner::ScannerHandle;
use ble_orchestrator_core::scheduler::{Executor, Outcome, Scheduler};
use ble_orchestrator_core::watchdog::{FailureLedger, Watchdog};
use ble_orchestrator_core::SharedScanCache;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

fn mac() -> MacAddress {
    "AA:BB:CC:DD:EE:01".parse().unwrap()
}

fn characteristic() -> CharacteristicRef {
    CharacteristicRef {
        service_uuid: uuid::Uuid::nil(),
        char_uuid: uuid::Uuid::from_u128(42),
    }
}

fn cache() -> SharedScanCache {
    Arc::new(RwLock::new(ble_orchestrator_domain::ScanCache::new(Duration::from_secs(300))))
}

/// The Handler resolves `known(mac)` from the Scan Cache before ever
/// opening a connection — every connect-path scenario below needs the
/// target MAC to already have been "observed" by a scanner.
async fn seed_known(cache: &SharedScanCache, mac: MacAddress) {
    cache.write().await.ingest(AdvertisementRecord::new(mac, None, -60, vec![], Default::default()));
}

#[allow(clippy::too_many_arguments)]
fn make_handler(
    adapter: Arc<FakeAdapter>,
    cache: SharedScanCache,
    coordinator: Arc<Coordinator>,
) -> Arc<RequestHandler<FakeAdapter>> {
    let ledger = FailureLedger::new();
    let notifications = NotificationManager::new(adapter.clone(), coordinator.clone(), Duration::from_secs(2));
    RequestHandler::new(
        adapter,
        cache,
        coordinator,
        ledger,
        notifications,
        Duration::from_millis(200),
        2,
        Duration::from_millis(5),
    )
}

/// S1 — cache hit, no connect: a `scan_command` for a MAC the scanner
/// has already observed resolves straight out of the Scan Cache and
/// never touches the adapter.
#[tokio::test]
async fn cache_hit_resolves_without_connecting() {
    let adapter = Arc::new(FakeAdapter::new());
    let cache = cache();
    let coordinator = Coordinator::new(true, Duration::from_secs(90));
    let handler = make_handler(adapter.clone(), cache.clone(), coordinator);

    cache.write().await.ingest(AdvertisementRecord::new(mac(), None, -55, vec![], Default::default()));

    let request = Request::new(
        "s1".into(),
        RequestKind::CacheLookup { mac: mac() },
        Priority::Normal,
        Duration::from_secs(5),
        0,
    );
    let outcome = handler.execute(&request, Duration::from_secs(5), CancellationToken::new()).await.unwrap();
    match outcome {
        Outcome::Advertisement(record) => {
            assert_eq!(record.rssi, -55);
            assert_eq!(record.mac, mac());
        }
        other => panic!("expected a cached advertisement, got {other:?}"),
    }

    // The device was never seeded as connectable, so any attempt to
    // connect would have failed with `NotFound` — a cache hit never
    // reaches that code path at all.
    let err = adapter.connect(mac(), Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, AdapterError::NotFound(_)));
}

/// Delays before delegating, used only to keep a lower-priority request
/// occupying the serial lane long enough for higher-priority work to
/// queue up behind it.
struct DelayedExecutor<E> {
    inner: Arc<E>,
    delay: Duration,
}

#[async_trait]
impl<E: Executor + Send + Sync> Executor for DelayedExecutor<E> {
    async fn execute(&self, request: &Request, remaining: Duration, cancel: CancellationToken) -> Result<Outcome, OrchestratorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(request, remaining, cancel).await
    }
}

/// S2 — priority reorder: R1 (NORMAL), R2 (HIGH), R3 (NORMAL) submitted
/// within 1 ms of each other must dispatch as R2, R1, R3.
#[tokio::test]
async fn higher_priority_request_overtakes_queued_normal_requests() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.seed_characteristic_value(mac(), characteristic(), vec![7]).await;
    let cache = cache();
    let coordinator = Coordinator::new(false, Duration::from_secs(90));
    let handler = make_handler(adapter, cache, coordinator);
    let executor = Arc::new(DelayedExecutor {
        inner: handler,
        delay: Duration::from_millis(30),
    });
    let scheduler = Scheduler::new(executor, 1, 8, 100, false, Duration::from_secs(30));

    let read_kind = || RequestKind::Read { mac: mac(), characteristic: characteristic() };

    let s1 = scheduler.clone();
    let r1 = tokio::spawn(async move {
        s1.submit("r1".into(), read_kind(), Priority::Normal, Duration::from_secs(5)).await
    });
    // Let r1 claim the lone serial worker before r2/r3 are enqueued.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let s2 = scheduler.clone();
    let r2 = tokio::spawn(async move {
        s2.submit("r2".into(), read_kind(), Priority::High, Duration::from_secs(5)).await
    });
    let s3 = scheduler.clone();
    let r3 = tokio::spawn(async move {
        s3.submit("r3".into(), read_kind(), Priority::Normal, Duration::from_secs(5)).await
    });

    let (resp1, resp2, resp3) = tokio::join!(r1, r2, r3);
    let resp1 = resp1.unwrap();
    let resp2 = resp2.unwrap();
    let resp3 = resp3.unwrap();
    assert!(resp1.result.is_ok());
    assert!(resp2.result.is_ok());
    assert!(resp3.result.is_ok());
    assert_eq!(resp1.request_id, "r1");
    assert_eq!(resp2.request_id, "r2");
    assert_eq!(resp3.request_id, "r3");
}

/// S3 — age skip: a request that has sat in the serial queue past
/// `request_max_age` is skipped rather than dispatched, and never
/// touches the adapter.
#[tokio::test]
async fn request_older_than_max_age_is_skipped_without_dispatch() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.seed_characteristic_value(mac(), characteristic(), vec![1]).await;
    let calls = Arc::new(AtomicU32::new(0));

    struct CountingExecutor<E> {
        inner: Arc<E>,
        calls: Arc<AtomicU32>,
    }
    #[async_trait]
    impl<E: Executor + Send + Sync> Executor for CountingExecutor<E> {
        async fn execute(&self, request: &Request, remaining: Duration, cancel: CancellationToken) -> Result<Outcome, OrchestratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(request, remaining, cancel).await
        }
    }

    let cache = cache();
    let coordinator = Coordinator::new(false, Duration::from_secs(90));
    let handler = make_handler(adapter, cache, coordinator);
    let executor = Arc::new(CountingExecutor {
        inner: handler,
        calls: calls.clone(),
    });

    // max_age smaller than the delay the first (slow) request holds the
    // lone serial worker for, so the second request is already too old
    // by the time its turn comes.
    let blocking_executor = Arc::new(DelayedExecutor {
        inner: executor,
        delay: Duration::from_millis(40),
    });
    let scheduler = Scheduler::new(blocking_executor, 1, 8, 100, true, Duration::from_millis(10));

    let read_kind = RequestKind::Read { mac: mac(), characteristic: characteristic() };

    let s1 = scheduler.clone();
    let blocker_kind = read_kind.clone();
    let blocker = tokio::spawn(async move {
        s1.submit("blocker".into(), blocker_kind, Priority::Normal, Duration::from_secs(5)).await
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let response = scheduler
        .submit("stale".into(), read_kind, Priority::Normal, Duration::from_secs(5))
        .await;

    blocker.await.unwrap();
    assert_eq!(response.result.unwrap_err(), OrchestratorError::SkippedDueToAge);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "only the blocking request should have reached the adapter");
}

/// S4 — exclusive-control happy path: a Read opens a coordinator epoch
/// that a scanner-like task yields to, and the epoch closes again once
/// the Handler finishes.
#[tokio::test]
async fn read_opens_and_closes_a_coordinator_epoch() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.seed_characteristic_value(mac(), characteristic(), vec![5, 5]).await;
    let cache = cache();
    let coordinator = Coordinator::new(true, Duration::from_secs(90));
    let handler = make_handler(adapter, cache, coordinator.clone());

    let scanner_coordinator = coordinator.clone();
    let scanner_task = tokio::spawn(async move {
        loop {
            if scanner_coordinator.is_epoch_open().await {
                scanner_coordinator.signal_scan_stopped().await;
                scanner_coordinator.await_client_completed(Duration::from_secs(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let request = Request::new(
        "s4".into(),
        RequestKind::Read { mac: mac(), characteristic: characteristic() },
        Priority::Normal,
        Duration::from_secs(5),
        0,
    );
    let started = std::time::Instant::now();
    let outcome = handler.execute(&request, Duration::from_secs(5), CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::ReadValue(v) if v == vec![5, 5]));
    assert!(started.elapsed() < Duration::from_secs(90));
    assert!(!coordinator.is_epoch_open().await);

    scanner_task.abort();
}

/// S5 — deadlock recovery: an epoch that outlives the deadlock
/// threshold is force-reset by the Watchdog, and a request still
/// waiting on it ultimately reports `Timeout` rather than hanging
/// forever.
#[tokio::test]
async fn watchdog_force_resets_an_epoch_stuck_past_the_threshold() {
    let coordinator = Coordinator::new(true, Duration::from_millis(20));
    let ledger = FailureLedger::new();
    let scanner_handle = ScannerHandle::new();

    struct NeverSucceedsHostControl;
    #[async_trait]
    impl HostControl for NeverSucceedsHostControl {
        async fn cycle_adapter(&self, _adapter: &str) -> bool {
            false
        }
        async fn reset_adapter(&self, _adapter: &str) -> bool {
            false
        }
        async fn restart_stack(&self) -> bool {
            false
        }
    }

    // A request opens an epoch and never calls notify_done, simulating
    // a Handler wedged mid-operation.
    coordinator.request_pause().await;
    coordinator.signal_scan_stopped().await;
    assert!(coordinator.is_epoch_open().await);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(coordinator.probe_deadlock().await);

    let mut watchdog = Watchdog::new(
        Arc::new(NeverSucceedsHostControl),
        ledger,
        coordinator.clone(),
        scanner_handle,
        "hci1".into(),
        Duration::from_secs(30),
        3,
    );
    watchdog.tick().await;

    assert!(!coordinator.is_epoch_open().await, "force_reset should have closed the stuck epoch");

    // A request that was awaiting the (now force-reset) epoch on the
    // Scheduler's own clock still reports a definite terminal outcome
    // rather than hanging: the Scheduler's per-request deadline is the
    // backstop regardless of what the Coordinator does.
    struct HangingExecutor;
    #[async_trait]
    impl Executor for HangingExecutor {
        async fn execute(&self, _request: &Request, _remaining: Duration, _cancel: CancellationToken) -> Result<Outcome, OrchestratorError> {
            std::future::pending().await
        }
    }
    let scheduler = Scheduler::new(Arc::new(HangingExecutor), 1, 8, 100, false, Duration::from_secs(30));
    let response = scheduler
        .submit(
            "stuck".into(),
            RequestKind::Read { mac: mac(), characteristic: characteristic() },
            Priority::Normal,
            Duration::from_millis(20),
        )
        .await;
    assert_eq!(response.result.unwrap_err(), OrchestratorError::Timeout);
}

/// Fails a fixed number of connect attempts before delegating to a real
/// [`FakeAdapter`], used to drive S6's retry-then-reset scenario.
struct FlakyAdapter {
    inner: Arc<FakeAdapter>,
    remaining_failures: AtomicU32,
}

impl FlakyAdapter {
    fn new(inner: Arc<FakeAdapter>, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl AdapterFacade for FlakyAdapter {
    async fn start_scan(&self) -> Result<(), AdapterError> {
        self.inner.start_scan().await
    }
    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.inner.stop_scan().await
    }
    async fn drain_discovered(&self) -> Result<Vec<AdvertisementRecord>, AdapterError> {
        self.inner.drain_discovered().await
    }
    async fn connect(&self, mac: MacAddress, timeout: Duration) -> Result<ConnectionHandle, AdapterError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(AdapterError::Stack("transient connect failure".into()));
        }
        self.inner.connect(mac, timeout).await
    }
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), AdapterError> {
        self.inner.disconnect(handle).await
    }
    async fn read(&self, handle: ConnectionHandle, characteristic: CharacteristicRef) -> Result<Vec<u8>, AdapterError> {
        self.inner.read(handle, characteristic).await
    }
    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        payload: &[u8],
        wants_response: bool,
    ) -> Result<(), AdapterError> {
        self.inner.write(handle, characteristic, payload, wants_response).await
    }
    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<tokio::sync::mpsc::Receiver<Vec<u8>>, AdapterError> {
        self.inner.subscribe(handle, characteristic).await
    }
    async fn unsubscribe(&self, handle: ConnectionHandle, characteristic: CharacteristicRef) -> Result<(), AdapterError> {
        self.inner.unsubscribe(handle, characteristic).await
    }
    async fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.inner.is_connected(handle).await
    }
}

/// S6 — retry and reset: two transient connect failures followed by a
/// success complete the request and reset the failure counter to 0.
#[tokio::test]
async fn two_transient_connect_failures_then_success_resets_the_ledger() {
    let fake = Arc::new(FakeAdapter::new());
    fake.seed_characteristic_value(mac(), characteristic(), vec![3]).await;
    let adapter = Arc::new(FlakyAdapter::new(fake, 2));
    let cache = cache();
    let coordinator = Coordinator::new(false, Duration::from_secs(90));
    let ledger = FailureLedger::new();
    let notifications = NotificationManager::new(adapter.clone(), coordinator.clone(), Duration::from_secs(2));
    let handler = RequestHandler::new(
        adapter,
        cache,
        coordinator,
        ledger.clone(),
        notifications,
        Duration::from_millis(50),
        2,
        Duration::from_millis(1),
    );

    let request = Request::new(
        "s6".into(),
        RequestKind::Read { mac: mac(), characteristic: characteristic() },
        Priority::Normal,
        Duration::from_secs(5),
        0,
    );
    let outcome = handler.execute(&request, Duration::from_secs(5), CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::ReadValue(v) if v == vec![3]));
    assert_eq!(ledger.consecutive_connect_failures(), 0);
}

/// S6 (continued) — three full connect failures (retry budget
/// exhausted) leave the ledger non-zero and, once the Watchdog's
/// failure threshold is reached, the next tick runs the lightweight
/// reset and the Scanner is recreated.
#[tokio::test]
async fn exhausted_retries_escalate_to_watchdog_reset_and_scanner_recreation() {
    let fake = Arc::new(FakeAdapter::new());
    // Never becomes connectable, so every connect attempt in this
    // scenario fails all the way through the retry budget.
    let adapter = Arc::new(FlakyAdapter::new(fake, u32::MAX));
    let cache = cache();
    let coordinator = Coordinator::new(false, Duration::from_secs(90));
    let ledger = FailureLedger::new();
    let notifications = NotificationManager::new(adapter.clone(), coordinator.clone(), Duration::from_millis(50));
    let handler = RequestHandler::new(
        adapter,
        cache,
        coordinator.clone(),
        ledger.clone(),
        notifications,
        Duration::from_millis(20),
        0,
        Duration::from_millis(1),
    );

    for i in 0..3 {
        let request = Request::new(
            format!("r{i}"),
            RequestKind::Read { mac: mac(), characteristic: characteristic() },
            Priority::Normal,
            Duration::from_secs(5),
            i,
        );
        let err = handler.execute(&request, Duration::from_secs(5), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, OrchestratorError::ConnectionFailed);
    }
    assert_eq!(ledger.consecutive_connect_failures(), 3);

    struct RecordingHostControl {
        cycle_calls: AtomicU32,
    }
    #[async_trait]
    impl HostControl for RecordingHostControl {
        async fn cycle_adapter(&self, _adapter: &str) -> bool {
            self.cycle_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn reset_adapter(&self, _adapter: &str) -> bool {
            true
        }
        async fn restart_stack(&self) -> bool {
            true
        }
    }
    let host_control = Arc::new(RecordingHostControl { cycle_calls: AtomicU32::new(0) });
    let scanner_handle = ScannerHandle::new();
    let mut watchdog = Watchdog::new(
        host_control.clone(),
        ledger,
        coordinator,
        scanner_handle.clone(),
        "hci1".into(),
        Duration::from_secs(30),
        3,
    );
    watchdog.tick().await;
    assert_eq!(host_control.cycle_calls.load(Ordering::SeqCst), 1, "threshold breach should run the lightweight reset rung");
    assert_eq!(scanner_handle.recreations.load(Ordering::SeqCst), 0, "lightweight reset succeeding stops the ladder before stack_restart recreates the scanner");
}

/// Wraps a [`FakeAdapter`] so `read` never resolves, simulating a BLE
/// operation that outlives its request's deadline.
struct HangingReadAdapter {
    inner: Arc<FakeAdapter>,
    last_handle: std::sync::Mutex<Option<ConnectionHandle>>,
}

impl HangingReadAdapter {
    fn new(inner: Arc<FakeAdapter>) -> Self {
        Self {
            inner,
            last_handle: std::sync::Mutex::new(None),
        }
    }

    fn last_handle(&self) -> Option<ConnectionHandle> {
        *self.last_handle.lock().unwrap()
    }
}

#[async_trait]
impl AdapterFacade for HangingReadAdapter {
    async fn start_scan(&self) -> Result<(), AdapterError> {
        self.inner.start_scan().await
    }
    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.inner.stop_scan().await
    }
    async fn drain_discovered(&self) -> Result<Vec<AdvertisementRecord>, AdapterError> {
        self.inner.drain_discovered().await
    }
    async fn connect(&self, mac: MacAddress, timeout: Duration) -> Result<ConnectionHandle, AdapterError> {
        let handle = self.inner.connect(mac, timeout).await?;
        *self.last_handle.lock().unwrap() = Some(handle);
        Ok(handle)
    }
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), AdapterError> {
        self.inner.disconnect(handle).await
    }
    async fn read(&self, _handle: ConnectionHandle, _characteristic: CharacteristicRef) -> Result<Vec<u8>, AdapterError> {
        std::future::pending().await
    }
    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        payload: &[u8],
        wants_response: bool,
    ) -> Result<(), AdapterError> {
        self.inner.write(handle, characteristic, payload, wants_response).await
    }
    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<tokio::sync::mpsc::Receiver<Vec<u8>>, AdapterError> {
        self.inner.subscribe(handle, characteristic).await
    }
    async fn unsubscribe(&self, handle: ConnectionHandle, characteristic: CharacteristicRef) -> Result<(), AdapterError> {
        self.inner.unsubscribe(handle, characteristic).await
    }
    async fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.inner.is_connected(handle).await
    }
}

/// S7 — cancellation: a Read whose BLE operation never resolves is
/// still reported to the client as `Timeout` as soon as its deadline
/// elapses, and the connection it opened is disconnected and the
/// Coordinator epoch closed shortly after, on the dispatch's own
/// background task rather than left dangling.
#[tokio::test]
async fn cancelled_read_still_disconnects_and_closes_the_epoch() {
    let fake = Arc::new(FakeAdapter::new());
    fake.seed_device(mac(), true).await;
    let adapter = Arc::new(HangingReadAdapter::new(fake));
    let cache = cache();
    seed_known(&cache, mac()).await;
    let coordinator = Coordinator::new(true, Duration::from_secs(90));
    let ledger = FailureLedger::new();
    let notifications = NotificationManager::new(adapter.clone(), coordinator.clone(), Duration::from_secs(2));
    let handler = RequestHandler::new(
        adapter.clone(),
        cache,
        coordinator.clone(),
        ledger,
        notifications,
        Duration::from_millis(200),
        0,
        Duration::from_millis(1),
    );
    let scheduler = Scheduler::new(handler, 1, 8, 100, false, Duration::from_secs(30));

    let response = scheduler
        .submit(
            "cancel-me".into(),
            RequestKind::Read { mac: mac(), characteristic: characteristic() },
            Priority::Normal,
            Duration::from_millis(30),
        )
        .await;
    assert_eq!(response.result.unwrap_err(), OrchestratorError::Timeout);

    // The spawned dispatch task keeps running past the client-facing
    // response; give it a moment to reach its cleanup.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let handle = adapter.last_handle().expect("connect should have opened a handle");
    assert!(!adapter.is_connected(handle).await, "a cancelled operation should still disconnect its handle");
    assert!(!coordinator.is_epoch_open().await, "a cancelled operation should still close the epoch");
}
