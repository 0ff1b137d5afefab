//! IPC accept loop and per-session dispatch. One task per connected
//! client owns a line-delimited read half and a write half fed by an
//! `mpsc` channel shared between the response path and the notification
//! fan-out path, so a slow client backpressures only its own notification
//! producer, never another session's dispatch.
//!
//! The usual `accept()` -> spawn -> independent read/write halves
//! listener shape, generalized from a single control connection to many
//! concurrent sessions sharing one Scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ble_orchestrator_adapter::AdapterFacade;
use ble_orchestrator_core::handler::RequestHandler;
use ble_orchestrator_core::scheduler::{Outcome, Scheduler};
use ble_orchestrator_core::{Config, IpcTransport};
use ble_orchestrator_domain::request::RequestKind;
use ble_orchestrator_domain::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use crate::wire::{decode_line, FrameBody, OutgoingFrame};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Drives the accept loop for whichever transport `config.ipc_transport`
/// selects, until `shutdown` fires. Each accepted connection is handed
/// off to its own task; `max_sessions` is enforced with a semaphore so a
/// burst of clients queues at `accept()` rather than spawning unbounded
/// per-session state.
pub async fn run<A: AdapterFacade + ?Sized + 'static>(
    config: Config,
    scheduler: Arc<Scheduler<RequestHandler<A>>>,
    handler: Arc<RequestHandler<A>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sessions = Arc::new(Semaphore::new(config.max_sessions));
    let next_session_id = Arc::new(AtomicU64::new(1));

    match config.ipc_transport {
        IpcTransport::Unix => {
            let _ = std::fs::remove_file(&config.socket_path);
            let listener = UnixListener::bind(&config.socket_path)?;
            info!(path = %config.socket_path, "listening on unix domain socket");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _addr) = accepted?;
                        spawn_session(stream, &scheduler, &handler, &sessions, &next_session_id);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("ipc server shutting down");
                            let _ = std::fs::remove_file(&config.socket_path);
                            return Ok(());
                        }
                    }
                }
            }
        }
        IpcTransport::Tcp => {
            let addr = format!("{}:{}", config.tcp_host, config.tcp_port);
            let listener = TcpListener::bind(&addr).await?;
            info!(%addr, "listening on tcp");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _addr) = accepted?;
                        spawn_session(stream, &scheduler, &handler, &sessions, &next_session_id);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("ipc server shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

fn spawn_session<A, S>(
    stream: S,
    scheduler: &Arc<Scheduler<RequestHandler<A>>>,
    handler: &Arc<RequestHandler<A>>,
    sessions: &Arc<Semaphore>,
    next_session_id: &Arc<AtomicU64>,
) where
    A: AdapterFacade + ?Sized + 'static,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let scheduler = scheduler.clone();
    let handler = handler.clone();
    let sessions = sessions.clone();
    let session_id = SessionId(next_session_id.fetch_add(1, Ordering::Relaxed));

    tokio::spawn(async move {
        let Ok(permit) = sessions.acquire_owned().await else {
            return;
        };
        info!(session = session_id.0, "session accepted");
        run_session(stream, session_id, scheduler, handler).await;
        info!(session = session_id.0, "session closed");
        drop(permit);
    });
}

async fn run_session<A, S>(
    stream: S,
    session_id: SessionId,
    scheduler: Arc<Scheduler<RequestHandler<A>>>,
    handler: Arc<RequestHandler<A>>,
) where
    A: AdapterFacade + ?Sized + 'static,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let (notif_tx, mut notif_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
    let notif_outbound = outbound_tx.clone();
    let notify_task = tokio::spawn(async move {
        while let Some(frame) = notif_rx.recv().await {
            let outgoing = OutgoingFrame::Notification {
                kind: "notification",
                callback_id: frame.callback_id.to_string(),
                mac_address: frame.mac.to_string(),
                characteristic_uuid: frame.characteristic.char_uuid.to_string(),
                value: frame.value,
                timestamp: frame.timestamp.timestamp_millis() as f64 / 1000.0,
            };
            if notif_outbound.send(outgoing.to_line()).await.is_err() {
                break;
            }
        }
    });

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(session = session_id.0, error = %e, "session read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_line(&line) {
            Ok(frame) => {
                let outgoing = match frame.body {
                    FrameBody::ServiceStatus => service_status(frame.request_id.clone(), &handler).await,
                    FrameBody::Dispatch(kind) => {
                        if let RequestKind::Subscribe { notification_timeout, .. } = &kind {
                            handler
                                .register_subscribe_sink(
                                    frame.request_id.clone(),
                                    session_id,
                                    *notification_timeout,
                                    notif_tx.clone(),
                                )
                                .await;
                        }
                        let response = scheduler
                            .submit(frame.request_id.clone(), kind, frame.priority, frame.timeout)
                            .await;
                        match response.result {
                            Ok(outcome) => OutgoingFrame::success(response.request_id, outcome_to_json(outcome)),
                            Err(e) => OutgoingFrame::error(response.request_id, e),
                        }
                    }
                };
                if outbound_tx.send(outgoing.to_line()).await.is_err() {
                    break;
                }
            }
            Err((request_id_hint, err)) => {
                let had_hint = request_id_hint.is_some();
                let outgoing = OutgoingFrame::error(request_id_hint.unwrap_or_default(), err);
                let _ = outbound_tx.send(outgoing.to_line()).await;
                if !had_hint {
                    break;
                }
            }
        }
    }

    handler.notifications().sweep_session(session_id).await;
    drop(outbound_tx);
    notify_task.abort();
    let _ = writer_task.await;
}

async fn service_status<A: AdapterFacade + ?Sized + 'static>(
    request_id: String,
    handler: &Arc<RequestHandler<A>>,
) -> OutgoingFrame {
    let cache_size = handler.cache().read().await.len();
    let epoch_open = handler.coordinator().is_epoch_open().await;
    let consecutive_failures = handler.failure_ledger().consecutive_connect_failures();
    let active_subscriptions = handler.notifications().subscription_count().await;

    OutgoingFrame::success(
        request_id,
        serde_json::json!({
            "scan_cache_size": cache_size,
            "exclusive_control_epoch_open": epoch_open,
            "consecutive_connect_failures": consecutive_failures,
            "active_subscriptions": active_subscriptions,
        }),
    )
}

fn outcome_to_json(outcome: Outcome) -> serde_json::Value {
    match outcome {
        Outcome::Advertisement(record) => serde_json::json!({
            "address": record.mac.to_string(),
            "mac_address": record.mac.to_string(),
            "rssi": record.rssi,
            "local_name": record.local_name,
            "age_seconds": record.observed_at.elapsed().as_secs_f64(),
        }),
        Outcome::ReadValue(bytes) => serde_json::json!({ "value": bytes }),
        Outcome::Written => serde_json::json!({ "written": true }),
        Outcome::Subscribed => serde_json::json!({ "subscribed": true }),
        Outcome::Unsubscribed => serde_json::json!({ "unsubscribed": true }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ble_orchestrator_adapter::fake::FakeAdapter;
    use ble_orchestrator_core::coordinator::Coordinator;
    use ble_orchestrator_core::notification::NotificationManager;
    use ble_orchestrator_core::watchdog::FailureLedger;
    use ble_orchestrator_domain::ScanCache;
    use std::time::Duration;
    use tokio::io::duplex;

    fn make_handler() -> Arc<RequestHandler<FakeAdapter>> {
        let adapter = Arc::new(FakeAdapter::new());
        let cache = Arc::new(tokio::sync::RwLock::new(ScanCache::new(Duration::from_secs(300))));
        let coordinator = Coordinator::new(false, Duration::from_secs(90));
        let ledger = FailureLedger::new();
        let notifications = NotificationManager::new(adapter.clone(), coordinator.clone(), Duration::from_secs(5));
        RequestHandler::new(
            adapter,
            cache,
            coordinator,
            ledger,
            notifications,
            Duration::from_secs(5),
            1,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn unknown_mac_scan_command_returns_error_response() {
        let handler = make_handler();
        let scheduler = Scheduler::new(handler.clone(), 2, 8, 100, false, Duration::from_secs(30));
        let (client, server) = duplex(4096);

        let session = tokio::spawn(run_session(server, SessionId(1), scheduler, handler));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"{\"command\":\"scan_command\",\"mac_address\":\"AA:BB:CC:DD:EE:01\",\"request_id\":\"r1\"}\n")
            .await
            .unwrap();
        drop(write_half);

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"status\":\"error\""));
        assert!(line.contains("DeviceNotFound"));

        session.abort();
    }

    #[tokio::test]
    async fn malformed_frame_without_id_hint_closes_session() {
        let handler = make_handler();
        let scheduler = Scheduler::new(handler.clone(), 1, 8, 100, false, Duration::from_secs(30));
        let (client, server) = duplex(4096);

        let session = tokio::spawn(run_session(server, SessionId(1), scheduler, handler));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"not json\n").await.unwrap();
        drop(write_half);

        let mut lines = BufReader::new(read_half).lines();
        let first = lines.next_line().await.unwrap();
        assert!(first.is_some());
        let next = lines.next_line().await.unwrap();
        assert!(next.is_none(), "session should close after an unhinted malformed frame");

        let _ = session.await;
    }

    #[tokio::test]
    async fn get_service_status_reports_counters() {
        let handler = make_handler();
        let scheduler = Scheduler::new(handler.clone(), 1, 8, 100, false, Duration::from_secs(30));
        let (client, server) = duplex(4096);

        let session = tokio::spawn(run_session(server, SessionId(1), scheduler, handler));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"{\"command\":\"get_service_status\",\"request_id\":\"r1\"}\n")
            .await
            .unwrap();
        drop(write_half);

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"status\":\"success\""));
        assert!(line.contains("\"request_id\":\"r1\""));
        assert!(line.contains("scan_cache_size"));

        session.abort();
    }
}
