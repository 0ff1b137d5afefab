use std::time::{Duration, Instant};

use crate::mac::MacAddress;
use crate::request::{CallbackId, CharacteristicRef};

/// An opaque handle identifying the client session a subscription
/// belongs to, used only for sweeping subscriptions on disconnect —
/// the Notification Manager never interprets it otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// One client's standing interest in a device's characteristic value
/// pushes. Lifecycle: created on Subscribe, torn down on explicit
/// Unsubscribe, client disconnect, or (if `idle_timeout` is set) inactivity.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub callback_id: CallbackId,
    pub mac: MacAddress,
    pub characteristic: CharacteristicRef,
    pub session: SessionId,
    pub idle_timeout: Option<Duration>,
    pub last_seen: Instant,
}

impl Subscription {
    pub fn new(
        callback_id: CallbackId,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        session: SessionId,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            callback_id,
            mac,
            characteristic,
            session,
            idle_timeout,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// True once `idle_timeout` has elapsed since the last value push.
    /// A `None` timeout never expires ("no timeout, teardown only on
    /// explicit Unsubscribe or session close").
    pub fn is_idle_expired(&self) -> bool {
        match self.idle_timeout {
            Some(timeout) => self.last_seen.elapsed() > timeout,
            None => false,
        }
    }
}
