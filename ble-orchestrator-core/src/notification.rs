//! Per-MAC connection reuse across subscribers, stack-notify fan-out,
//! idle-subscription sweep, and reconnect-with-backoff. Grounded in the
//! teacher's `MoteScanner` connection-table pattern (`HashMap<PeripheralId,
//! ConnectedPeripheral>`), generalized from "one connection feeding one
//! scan cycle" to "one connection feeding N standing subscriptions".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ble_orchestrator_adapter::{AdapterFacade, ConnectionHandle};
use ble_orchestrator_domain::request::CharacteristicRef;
use ble_orchestrator_domain::{CallbackId, MacAddress, OrchestratorError, SessionId, Subscription};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::coordinator::Coordinator;

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const STACK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct NotificationFrame {
    pub callback_id: CallbackId,
    pub mac: MacAddress,
    pub characteristic: CharacteristicRef,
    pub value: Vec<u8>,
    pub timestamp: chrono::DateTime<Utc>,
}

struct SubscriberEntry {
    subscription: Subscription,
    sink: mpsc::Sender<NotificationFrame>,
}

struct ConnectionState {
    handle: ConnectionHandle,
    subscriptions: HashMap<CharacteristicRef, Vec<SubscriberEntry>>,
}

pub struct NotificationManager<A: AdapterFacade + ?Sized> {
    adapter: Arc<A>,
    coordinator: Arc<Coordinator>,
    connect_timeout: Duration,
    connections: Mutex<HashMap<MacAddress, ConnectionState>>,
}

impl<A: AdapterFacade + ?Sized + 'static> NotificationManager<A> {
    pub fn new(adapter: Arc<A>, coordinator: Arc<Coordinator>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            coordinator,
            connect_timeout,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub async fn subscribe(
        self: &Arc<Self>,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        callback_id: CallbackId,
        session: SessionId,
        idle_timeout: Option<Duration>,
        sink: mpsc::Sender<NotificationFrame>,
    ) -> Result<(), OrchestratorError> {
        let handle = self.handle_for(mac).await?;

        let mut connections = self.connections.lock().await;
        let Some(state) = connections.get_mut(&mac) else {
            return Err(OrchestratorError::ConnectionFailed);
        };
        let is_new_characteristic = !state.subscriptions.contains_key(&characteristic);
        let subscription = Subscription::new(callback_id, mac, characteristic, session, idle_timeout);
        state
            .subscriptions
            .entry(characteristic)
            .or_default()
            .push(SubscriberEntry { subscription, sink });
        drop(connections);

        if is_new_characteristic {
            self.spawn_fanout(mac, handle, characteristic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, callback_id: &CallbackId) -> Result<(), OrchestratorError> {
        let mut connections = self.connections.lock().await;
        let mut found = false;
        let mut emptied_macs = Vec::new();

        for (mac, state) in connections.iter_mut() {
            for (characteristic, subscribers) in state.subscriptions.iter_mut() {
                let before = subscribers.len();
                subscribers.retain(|entry| &entry.subscription.callback_id != callback_id);
                if subscribers.len() != before {
                    found = true;
                }
                let _ = characteristic;
            }
            state.subscriptions.retain(|_, subs| !subs.is_empty());
            if state.subscriptions.is_empty() {
                emptied_macs.push(*mac);
            }
        }

        for mac in emptied_macs {
            if let Some(state) = connections.remove(&mac) {
                drop(connections);
                if let Err(e) = self.adapter.disconnect(state.handle).await {
                    warn!(%mac, error = %e, "disconnect after last unsubscribe failed");
                }
                connections = self.connections.lock().await;
            }
        }

        if found {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidRequest)
        }
    }

    /// Removes every subscription belonging to `session`, e.g. because
    /// the IPC client disconnected.
    pub async fn sweep_session(&self, session: SessionId) {
        let mut connections = self.connections.lock().await;
        let mut emptied = Vec::new();
        for (mac, state) in connections.iter_mut() {
            for subs in state.subscriptions.values_mut() {
                subs.retain(|e| e.subscription.session != session);
            }
            state.subscriptions.retain(|_, subs| !subs.is_empty());
            if state.subscriptions.is_empty() {
                emptied.push(*mac);
            }
        }
        for mac in emptied {
            if let Some(state) = connections.remove(&mac) {
                let _ = self.adapter.disconnect(state.handle).await;
            }
        }
    }

    /// Tears down any subscription whose idle timeout has elapsed since
    /// its last delivered value, exactly as an explicit Unsubscribe
    /// would. Intended to be called on the same cadence as the Scan
    /// Cache's TTL sweep.
    pub async fn sweep_idle(&self) {
        let mut connections = self.connections.lock().await;
        let mut emptied = Vec::new();
        for (mac, state) in connections.iter_mut() {
            for subs in state.subscriptions.values_mut() {
                subs.retain(|e| !e.subscription.is_idle_expired());
            }
            state.subscriptions.retain(|_, subs| !subs.is_empty());
            if state.subscriptions.is_empty() {
                emptied.push(*mac);
            }
        }
        for mac in emptied {
            if let Some(state) = connections.remove(&mac) {
                let _ = self.adapter.disconnect(state.handle).await;
            }
        }
    }

    /// Total live subscriptions across every connection, for
    /// `get_service_status` reporting.
    pub async fn subscription_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .flat_map(|state| state.subscriptions.values())
            .map(|subs| subs.len())
            .sum()
    }

    async fn handle_for(&self, mac: MacAddress) -> Result<ConnectionHandle, OrchestratorError> {
        {
            let connections = self.connections.lock().await;
            if let Some(state) = connections.get(&mac) {
                return Ok(state.handle);
            }
        }
        self.open_connection(mac).await
    }

    async fn open_connection(&self, mac: MacAddress) -> Result<ConnectionHandle, OrchestratorError> {
        self.coordinator.request_pause().await;
        self.coordinator
            .await_scan_stopped(crate::scanner::Scanner::<A>::epoch_wait_timeout())
            .await;
        let result = self.adapter.connect(mac, self.connect_timeout).await;
        self.coordinator.notify_done().await;

        let handle = result.map_err(|e| {
            warn!(%mac, error = %e, "notification connect failed");
            OrchestratorError::ConnectionFailed
        })?;

        let mut connections = self.connections.lock().await;
        connections.insert(
            mac,
            ConnectionState {
                handle,
                subscriptions: HashMap::new(),
            },
        );
        Ok(handle)
    }

    /// Installs the stack-level notify handler for one characteristic and
    /// forwards every value to all current subscribers of it, retrying
    /// the connection with exponential backoff on a stack-reported drop
    /// for as long as at least one subscription remains.
    fn spawn_fanout(self: &Arc<Self>, mac: MacAddress, handle: ConnectionHandle, characteristic: CharacteristicRef) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut handle = handle;
            let mut backoff = RECONNECT_BACKOFF_START;
            loop {
                let mut rx = match manager.adapter.subscribe(handle, characteristic).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(%mac, error = %e, "subscribe install failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                        continue;
                    }
                };
                backoff = RECONNECT_BACKOFF_START;

                loop {
                    tokio::select! {
                        value = rx.recv() => {
                            match value {
                                Some(bytes) => manager.fan_out(mac, characteristic, bytes).await,
                                None => break,
                            }
                        }
                        _ = tokio::time::sleep(STACK_POLL_INTERVAL) => {
                            if !manager.adapter.is_connected(handle).await {
                                warn!(%mac, "stack reported disconnect, will reconnect");
                                break;
                            }
                        }
                    }
                    if !manager.has_subscribers(mac, characteristic).await {
                        info!(%mac, "no subscribers remain for characteristic, stopping fan-out");
                        return;
                    }
                }

                if !manager.has_subscribers(mac, characteristic).await {
                    return;
                }
                match manager.open_connection(mac).await {
                    Ok(new_handle) => handle = new_handle,
                    Err(_) => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    }
                }
            }
        });
    }

    async fn has_subscribers(&self, mac: MacAddress, characteristic: CharacteristicRef) -> bool {
        let connections = self.connections.lock().await;
        connections
            .get(&mac)
            .and_then(|s| s.subscriptions.get(&characteristic))
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    async fn fan_out(&self, mac: MacAddress, characteristic: CharacteristicRef, value: Vec<u8>) {
        let connections = self.connections.lock().await;
        let Some(state) = connections.get(&mac) else { return };
        let Some(subscribers) = state.subscriptions.get(&characteristic) else { return };
        let frame_base = NotificationFrame {
            callback_id: CallbackId(String::new()),
            mac,
            characteristic,
            value,
            timestamp: Utc::now(),
        };
        for entry in subscribers {
            let frame = NotificationFrame {
                callback_id: entry.subscription.callback_id.clone(),
                ..frame_base.clone()
            };
            if entry.sink.try_send(frame).is_err() {
                warn!(%mac, callback_id = %entry.subscription.callback_id, "dropped a notification frame, session backpressured");
            }
        }
    }
}
