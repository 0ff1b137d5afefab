pub mod config;
pub mod coordinator;
pub mod handler;
pub mod notification;
pub mod scanner;
pub mod scheduler;
pub mod watchdog;

use std::sync::Arc;

use ble_orchestrator_domain::ScanCache;
use tokio::sync::RwLock;

pub use config::{Config, IpcTransport};
pub use coordinator::Coordinator;

/// The Scan Cache has one writer (the scanner) and many readers (the
/// Handler resolving a `mac`, the IPC server's `CacheLookup` lane,
/// `get_service_status`); a `RwLock` is the natural concurrency wrapper
/// around the plain domain type.
pub type SharedScanCache = Arc<RwLock<ScanCache>>;
