//! Typed configuration assembled once from the environment at startup.
//! Every field here corresponds to one of the environment variables the
//! service reads; nothing downstream holds a `String` and re-parses it.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which transport the IPC server binds. Both a Unix domain
/// socket (the default) and loopback TCP are valid front doors; `Unix` is
/// chosen unless `IPC_TRANSPORT=tcp` is set, since the socket path has a
/// usable default and TCP does not need an explicit opt-in beyond that.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcTransport {
    Unix,
    Tcp,
}

/// Assembled once in `main` and handed by reference or clone to every
/// task; there is no global config cell and nothing re-reads the
/// environment after startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub ipc_transport: IpcTransport,
    pub socket_path: String,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub scan_adapter: String,
    pub connect_adapter: String,
    pub scan_cache_ttl: Duration,
    pub ble_connect_timeout: Duration,
    pub ble_retry_count: u32,
    pub ble_retry_interval: Duration,
    pub request_max_age: Duration,
    pub skip_old_requests: bool,
    pub exclusive_control_enabled: bool,
    pub exclusive_control_timeout: Duration,
    pub watchdog_check_interval: Duration,
    pub consecutive_failures_threshold: u32,
    pub scan_command_parallel_workers: usize,
    pub max_sessions: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ipc_transport: match env_string("IPC_TRANSPORT", "unix").to_ascii_lowercase().as_str() {
                "tcp" => IpcTransport::Tcp,
                _ => IpcTransport::Unix,
            },
            socket_path: env_string("SOCKET", "/tmp/ble-orchestrator.sock"),
            tcp_host: env_string("HOST", "127.0.0.1"),
            tcp_port: env_parse("PORT", 8378)?,
            scan_adapter: env_string("SCAN_ADAPTER", "hci0"),
            connect_adapter: env_string("CONNECT_ADAPTER", "hci1"),
            scan_cache_ttl: env_secs("SCAN_CACHE_TTL_SEC", 300)?,
            ble_connect_timeout: env_secs("BLE_CONNECT_TIMEOUT_SEC", 10)?,
            ble_retry_count: env_parse("BLE_RETRY_COUNT", 2)?,
            ble_retry_interval: env_secs("BLE_RETRY_INTERVAL_SEC", 1)?,
            request_max_age: env_secs("REQUEST_MAX_AGE_SEC", 30)?,
            skip_old_requests: env_bool("SKIP_OLD_REQUESTS", true)?,
            exclusive_control_enabled: env_bool("EXCLUSIVE_CONTROL_ENABLED", true)?,
            exclusive_control_timeout: env_secs("EXCLUSIVE_CONTROL_TIMEOUT_SEC", 90)?,
            watchdog_check_interval: env_secs("WATCHDOG_CHECK_INTERVAL_SEC", 30)?,
            consecutive_failures_threshold: env_parse("CONSECUTIVE_FAILURES_THRESHOLD", 3)?,
            scan_command_parallel_workers: env_parse("SCAN_COMMAND_PARALLEL_WORKERS", 3)?,
            max_sessions: env_parse("MAX_SESSIONS", 10)?,
        })
    }
}

fn env_string(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = env_parse(name, default_secs)?;
    Ok(Duration::from_secs(secs))
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected one of true/false/1/0/yes/no".into(),
            }),
        },
        Err(_) => Ok(default),
    }
}
