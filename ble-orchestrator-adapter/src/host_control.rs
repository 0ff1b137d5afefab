//! Host administrative commands the Watchdog's recovery ladder needs
//! (adapter down/up, adapter reset, BLE stack service restart) behind a
//! trait, so the ladder's escalation logic is unit-testable without a
//! real adapter or root privileges.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, warn};

#[async_trait]
pub trait HostControl: Send + Sync {
    /// Brings `adapter` down then back up (`hciconfig <adapter> down/up`
    /// equivalent). The lightest rung of the recovery ladder.
    async fn cycle_adapter(&self, adapter: &str) -> bool;

    /// A harder reset of the named adapter (`hciconfig <adapter> reset`
    /// equivalent, or a USB-level reset where the platform exposes one).
    async fn reset_adapter(&self, adapter: &str) -> bool;

    /// Restarts the host's BLE stack service (e.g. `bluetooth.service`).
    /// The top rung; only tried after repeated adapter-level resets fail.
    async fn restart_stack(&self) -> bool;
}

/// Shells out to the usual Linux BlueZ tooling. A missing binary or a
/// non-zero exit is logged and reported as a failed step, never a panic
/// — the Watchdog treats "couldn't run the command" the same as "ran
/// the command and it didn't help" and moves to the next rung.
pub struct ProcessHostControl;

impl ProcessHostControl {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> bool {
        match Command::new(program).args(args).status().await {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(program, ?args, code = ?status.code(), "host control command exited non-zero");
                false
            }
            Err(e) => {
                error!(program, ?args, error = %e, "failed to spawn host control command");
                false
            }
        }
    }
}

impl Default for ProcessHostControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostControl for ProcessHostControl {
    async fn cycle_adapter(&self, adapter: &str) -> bool {
        let down = Self::run("hciconfig", &[adapter, "down"]).await;
        let up = Self::run("hciconfig", &[adapter, "up"]).await;
        down && up
    }

    async fn reset_adapter(&self, adapter: &str) -> bool {
        Self::run("hciconfig", &[adapter, "reset"]).await
    }

    async fn restart_stack(&self) -> bool {
        Self::run("systemctl", &["restart", "bluetooth"]).await
    }
}
