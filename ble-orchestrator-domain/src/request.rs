use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

/// Default per-request timeout when a frame does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatch priority. Numerically lower sorts first — `HIGH` is `0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A GATT characteristic, named by its owning service UUID and its own
/// UUID. Plain 128-bit UUIDs, not BLE's 16-bit shorthand — the IPC layer
/// is responsible for any alias expansion before constructing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service_uuid: uuid::Uuid,
    pub char_uuid: uuid::Uuid,
}

/// Opaque client-assigned or server-generated subscription handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub String);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of operations the scheduler dispatches. Decoding an IPC
/// frame into one of these variants (or rejecting it as `InvalidRequest`)
/// is the IPC server's entire job — nothing downstream ever sees an
/// untyped payload.
#[derive(Clone, Debug)]
pub enum RequestKind {
    CacheLookup {
        mac: MacAddress,
    },
    Read {
        mac: MacAddress,
        characteristic: CharacteristicRef,
    },
    Write {
        mac: MacAddress,
        characteristic: CharacteristicRef,
        payload: Vec<u8>,
        wants_response: bool,
    },
    Subscribe {
        mac: MacAddress,
        characteristic: CharacteristicRef,
        callback_id: CallbackId,
        notification_timeout: Option<Duration>,
    },
    Unsubscribe {
        callback_id: CallbackId,
    },
}

impl RequestKind {
    /// `CacheLookup` is the only kind dispatched to the parallel lane;
    /// everything else goes through the serial lane.
    pub fn is_cache_lookup(&self) -> bool {
        matches!(self, RequestKind::CacheLookup { .. })
    }
}

/// A single terminal or in-flight request tracked by the scheduler.
#[derive(Clone, Debug)]
pub struct Request {
    pub request_id: String,
    pub kind: RequestKind,
    pub priority: Priority,
    pub created_at: Instant,
    pub deadline: Instant,
    /// Monotonic tiebreaker assigned at enqueue time so that two requests
    /// with identical priority and (due to timer granularity) identical
    /// `created_at` still dispatch in submission order.
    pub sequence: u64,
}

impl Request {
    pub fn new(
        request_id: String,
        kind: RequestKind,
        priority: Priority,
        timeout: Duration,
        sequence: u64,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            request_id,
            kind,
            priority,
            created_at,
            deadline: created_at + timeout,
            sequence,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Ordering for the serial lane's ready queue: lower `Priority` first,
/// then earlier `created_at`, then insertion `sequence` as the final
/// tiebreaker. `std::collections::BinaryHeap` is a max-heap, so the
/// queue wraps requests in `std::cmp::Reverse` at the call site to get
/// "smallest dispatches first" semantics out of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchKey {
    pub priority: Priority,
    pub created_at_nanos: u128,
    pub sequence: u64,
}

impl DispatchKey {
    pub fn of(request: &Request, epoch: Instant) -> Self {
        Self {
            priority: request.priority,
            created_at_nanos: request.created_at.duration_since(epoch).as_nanos(),
            sequence: request.sequence,
        }
    }
}

impl PartialOrd for DispatchKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.created_at_nanos.cmp(&other.created_at_nanos))
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Status progresses strictly PENDING -> PROCESSING -> terminal; terminal
/// states (`Completed`/`Failed`/`Timeout`) are final and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Timeout
        )
    }

    /// Validates a transition per the strict PENDING -> PROCESSING ->
    /// terminal chain; used by the scheduler/handler to assert they never
    /// regress or mutate a terminal state.
    pub fn can_transition_to(&self, next: &RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Pending, Completed | Failed | Timeout) => true,
            (Processing, Completed | Failed | Timeout) => true,
            _ => false,
        }
    }
}
