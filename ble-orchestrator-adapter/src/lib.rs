//! The only crate in this workspace allowed to name a `btleplug` type.
//! Everything above this layer talks to BLE hardware through
//! [`AdapterFacade`] and [`HostControl`], so the core crate's tests can
//! run against [`fake::FakeAdapter`] without a real controller.

pub mod btleplug_adapter;
pub mod fake;
pub mod host_control;

use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::request::CharacteristicRef;
use ble_orchestrator_domain::{AdvertisementRecord, MacAddress};
use thiserror::Error;
use tokio::sync::mpsc;

pub use btleplug_adapter::BtleplugAdapter;
pub use host_control::{HostControl, ProcessHostControl};

/// Internal plumbing error from a BLE operation. Never shown to a client
/// verbatim — the Handler/Scheduler map this onto the closed
/// `OrchestratorError` taxonomy at the component boundary.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no such adapter: {0}")]
    NoSuchAdapter(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("device not found during connect: {0}")]
    NotFound(MacAddress),
    #[error("stack-level error: {0}")]
    Stack(String),
    #[error("already disconnected")]
    NotConnected,
}

/// Opaque handle to a live GATT connection. Carries no behavior; the
/// facade implementation is free to key its internal connection table
/// however it likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Contract wrapping scan-start/stop, connect, read/write, and
/// notify-subscribe against a single adapter identified by host-level
/// name (e.g. `hci0`). One facade instance mediates exactly one adapter;
/// the service constructs two (scan-side, connect-side).
#[async_trait]
pub trait AdapterFacade: Send + Sync {
    /// Starts continuous scan mode. Idempotent if already scanning.
    async fn start_scan(&self) -> Result<(), AdapterError>;

    /// Stops scan mode. Idempotent if not scanning.
    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Drains advertisement records observed since the last call.
    async fn drain_discovered(&self) -> Result<Vec<AdvertisementRecord>, AdapterError>;

    /// Opens a GATT connection to `mac`, failing after `timeout` if the
    /// device cannot be reached.
    async fn connect(
        &self,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<ConnectionHandle, AdapterError>;

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), AdapterError>;

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<Vec<u8>, AdapterError>;

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        payload: &[u8],
        wants_response: bool,
    ) -> Result<(), AdapterError>;

    /// Installs a stack-level notify handler; values arrive on the
    /// returned channel until `unsubscribe` is called or the connection
    /// drops. The Notification Manager owns draining the receiver.
    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError>;

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), AdapterError>;

    /// True while `handle` is still reported connected by the underlying
    /// stack; used by the Notification Manager to detect a stack-reported
    /// disconnect that should trigger reconnect-with-backoff.
    async fn is_connected(&self, handle: ConnectionHandle) -> bool;
}
