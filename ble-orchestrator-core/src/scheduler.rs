//! Two execution lanes fed by one `submit` entry point: a serial lane
//! for Read/Write/Subscribe/Unsubscribe ordered by `DispatchKey`, and a
//! fixed-size parallel lane for CacheLookup. Both lanes terminate every
//! request they accept with exactly one [`Response`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ble_orchestrator_domain::request::{DispatchKey, Priority, Request, RequestKind};
use ble_orchestrator_domain::{AdvertisementRecord, OrchestratorError};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const PARALLEL_LANE_DEADLINE: Duration = Duration::from_secs(5);

/// The successful result of one executed request. `get_service_status`
/// is handled directly by the IPC layer (it never touches a lane) and so
/// has no variant here.
#[derive(Debug, Clone)]
pub enum Outcome {
    Advertisement(AdvertisementRecord),
    ReadValue(Vec<u8>),
    Written,
    Subscribed,
    Unsubscribed,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: String,
    pub result: Result<Outcome, OrchestratorError>,
}

/// Anything that can actually carry out a dispatched request. Implemented
/// by the Request Handler, which internally also covers CacheLookup (a
/// plain Scan Cache read) and Subscribe/Unsubscribe (delegated to the
/// Notification Manager) so the Scheduler stays ignorant of how any
/// particular kind of work gets done.
#[async_trait]
pub trait Executor: Send + Sync {
    /// `cancel` fires once the Scheduler's own deadline elapses, checked
    /// by the implementation at its suspension points so a cancelled
    /// dispatch still reaches its cleanup instead of being torn down by
    /// the runtime mid-operation.
    async fn execute(&self, request: &Request, remaining: Duration, cancel: CancellationToken) -> Result<Outcome, OrchestratorError>;
}

struct Pending {
    request: Request,
    respond_to: oneshot::Sender<Response>,
    cancel: CancellationToken,
}

struct Ready {
    key: DispatchKey,
    pending: Pending,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Ready {}
impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

pub struct Scheduler<E: Executor + ?Sized> {
    executor: Arc<E>,
    epoch: Instant,
    sequence: AtomicU64,
    serial_queue: Mutex<BinaryHeap<Reverse<Ready>>>,
    serial_notify: Notify,
    serial_watermark: usize,
    parallel_tx: mpsc::Sender<Pending>,
    skip_old_requests: bool,
    request_max_age: Duration,
}

impl<E: Executor + ?Sized + 'static> Scheduler<E> {
    pub fn new(
        executor: Arc<E>,
        parallel_workers: usize,
        parallel_queue_capacity: usize,
        serial_watermark: usize,
        skip_old_requests: bool,
        request_max_age: Duration,
    ) -> Arc<Self> {
        let (parallel_tx, parallel_rx) = mpsc::channel(parallel_queue_capacity);
        let scheduler = Arc::new(Self {
            executor: executor.clone(),
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
            serial_queue: Mutex::new(BinaryHeap::new()),
            serial_notify: Notify::new(),
            serial_watermark,
            parallel_tx,
            skip_old_requests,
            request_max_age,
        });

        let parallel_rx = Arc::new(Mutex::new(parallel_rx));
        for _ in 0..parallel_workers {
            let executor = executor.clone();
            let parallel_rx = parallel_rx.clone();
            tokio::spawn(async move {
                loop {
                    let pending = {
                        let mut rx = parallel_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(pending) = pending else { break };
                    Self::run_one(&executor, pending, PARALLEL_LANE_DEADLINE).await;
                }
            });
        }

        {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.serial_worker().await;
            });
        }

        scheduler
    }

    /// Accepts a request into whichever lane `kind` belongs to. Returns
    /// the terminal response once dispatched and executed, or
    /// immediately if backpressure rejects it outright.
    pub async fn submit(
        &self,
        request_id: String,
        kind: RequestKind,
        priority: Priority,
        timeout: Duration,
    ) -> Response {
        if !kind.is_cache_lookup()
            && priority == Priority::Low
            && self.serial_len().await >= self.serial_watermark
        {
            return Response {
                request_id,
                result: Err(OrchestratorError::QueueFull),
            };
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(request_id.clone(), kind.clone(), priority, timeout, sequence);
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            request: request.clone(),
            respond_to: tx,
            cancel: CancellationToken::new(),
        };

        if kind.is_cache_lookup() {
            if self.parallel_tx.send(pending).await.is_err() {
                return Response {
                    request_id,
                    result: Err(OrchestratorError::Unavailable),
                };
            }
        } else {
            let key = DispatchKey::of(&request, self.epoch);
            let mut queue = self.serial_queue.lock().await;
            queue.push(Reverse(Ready { key, pending }));
            drop(queue);
            self.serial_notify.notify_one();
        }

        match tokio::time::timeout_at(request.deadline.into(), rx).await {
            Ok(Ok(response)) => response,
            _ => Response {
                request_id,
                result: Err(OrchestratorError::Timeout),
            },
        }
    }

    async fn serial_len(&self) -> usize {
        self.serial_queue.lock().await.len()
    }

    async fn serial_worker(&self) {
        loop {
            let pending = loop {
                let mut queue = self.serial_queue.lock().await;
                if let Some(Reverse(ready)) = queue.pop() {
                    break ready.pending;
                }
                drop(queue);
                self.serial_notify.notified().await;
            };
            Self::run_dispatch(&self.executor, pending, self.skip_old_requests, self.request_max_age).await;
        }
    }

    async fn run_dispatch(executor: &Arc<E>, pending: Pending, skip_old: bool, max_age: Duration) {
        if skip_old && pending.request.age() > max_age {
            warn!(request_id = %pending.request.request_id, "skipping request past max age");
            let _ = pending.respond_to.send(Response {
                request_id: pending.request.request_id,
                result: Err(OrchestratorError::SkippedDueToAge),
            });
            return;
        }
        let remaining = pending.request.remaining();
        Self::run_one(executor, pending, remaining).await;
    }

    /// Races the executor against `deadline` without dropping it on
    /// elapse: the call runs on its own task so a cancelled dispatch still
    /// reaches its own cleanup (disconnect, `Coordinator.notify_done()`)
    /// instead of being torn down mid-await by a wrapping `timeout`. The
    /// client-facing response is sent the moment either side resolves;
    /// the background task, if still running, is left to finish on its
    /// own and its result is discarded.
    async fn run_one(executor: &Arc<E>, pending: Pending, deadline: Duration) {
        let Pending { request, respond_to, cancel } = pending;
        let request_id = request.request_id.clone();
        let exec = executor.clone();
        let exec_cancel = cancel.clone();
        let task = tokio::spawn(async move { exec.execute(&request, deadline, exec_cancel).await });

        let result = tokio::select! {
            joined = task => match joined {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Unavailable),
            },
            _ = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(OrchestratorError::Timeout)
            }
        };
        let _ = respond_to.send(Response { request_id, result });
    }
}
