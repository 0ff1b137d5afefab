//! In-memory [`AdapterFacade`] used by the core crate's unit and
//! scenario tests. No test in this workspace is allowed to touch a real
//! adapter, so this is the only implementation those tests construct.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::request::CharacteristicRef;
use ble_orchestrator_domain::{AdvertisementRecord, MacAddress};
use tokio::sync::{mpsc, Mutex};

use crate::{AdapterError, AdapterFacade, ConnectionHandle};

#[derive(Default, Clone)]
struct FakeDevice {
    connectable: bool,
    values: HashMap<CharacteristicRef, Vec<u8>>,
    notifiable: Vec<CharacteristicRef>,
}

struct Inner {
    devices: HashMap<MacAddress, FakeDevice>,
    pending_advertisements: Vec<AdvertisementRecord>,
    connections: HashMap<ConnectionHandle, MacAddress>,
    connected_flags: HashMap<ConnectionHandle, bool>,
    notify_senders: HashMap<(ConnectionHandle, CharacteristicRef), mpsc::Sender<Vec<u8>>>,
}

/// Scriptable fake over a small set of devices, addressed by MAC.
/// Scenario tests call [`FakeAdapter::seed_device`] and
/// [`FakeAdapter::push_advertisement`] to set up world state, then drive
/// it through the same `AdapterFacade` trait the service code uses.
pub struct FakeAdapter {
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
    scanning: std::sync::atomic::AtomicBool,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                pending_advertisements: Vec::new(),
                connections: HashMap::new(),
                connected_flags: HashMap::new(),
                notify_senders: HashMap::new(),
            }),
            next_handle: AtomicU64::new(1),
            scanning: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn seed_device(&self, mac: MacAddress, connectable: bool) {
        let mut inner = self.inner.lock().await;
        inner.devices.entry(mac).or_default().connectable = connectable;
    }

    pub async fn seed_characteristic_value(
        &self,
        mac: MacAddress,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    ) {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.entry(mac).or_default();
        device.connectable = true;
        device.values.insert(characteristic, value);
    }

    pub async fn allow_notify(&self, mac: MacAddress, characteristic: CharacteristicRef) {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.entry(mac).or_default();
        device.connectable = true;
        device.notifiable.push(characteristic);
    }

    pub async fn push_advertisement(&self, record: AdvertisementRecord) {
        self.inner.lock().await.pending_advertisements.push(record);
    }

    /// Delivers one notification value on behalf of the production
    /// stack, as if the remote peripheral had pushed it.
    pub async fn emit_notification(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    ) -> bool {
        let sender = {
            let inner = self.inner.lock().await;
            inner.notify_senders.get(&(handle, characteristic)).cloned()
        };
        match sender {
            Some(tx) => tx.send(value).await.is_ok(),
            None => false,
        }
    }

    /// Simulates a stack-reported disconnect without an explicit
    /// `disconnect` call, for reconnect-with-backoff tests.
    pub async fn force_disconnect(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().await;
        inner.connected_flags.insert(handle, false);
    }

    pub async fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdapterFacade for FakeAdapter {
    async fn start_scan(&self) -> Result<(), AdapterError> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn drain_discovered(&self) -> Result<Vec<AdvertisementRecord>, AdapterError> {
        let mut inner = self.inner.lock().await;
        Ok(std::mem::take(&mut inner.pending_advertisements))
    }

    async fn connect(
        &self,
        mac: MacAddress,
        _timeout: Duration,
    ) -> Result<ConnectionHandle, AdapterError> {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.get(&mac).cloned();
        match device {
            Some(device) if device.connectable => {
                let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
                inner.connections.insert(handle, mac);
                inner.connected_flags.insert(handle, true);
                Ok(handle)
            }
            Some(_) => Err(AdapterError::Stack(format!("{mac} refuses connections in this scenario"))),
            None => Err(AdapterError::NotFound(mac)),
        }
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), AdapterError> {
        let mut inner = self.inner.lock().await;
        if inner.connections.remove(&handle).is_none() {
            return Err(AdapterError::NotConnected);
        }
        inner.connected_flags.insert(handle, false);
        Ok(())
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<Vec<u8>, AdapterError> {
        let inner = self.inner.lock().await;
        let mac = inner.connections.get(&handle).ok_or(AdapterError::NotConnected)?;
        let device = inner.devices.get(mac).ok_or(AdapterError::NotConnected)?;
        device
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| AdapterError::Stack("characteristic has no seeded value".into()))
    }

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        payload: &[u8],
        _wants_response: bool,
    ) -> Result<(), AdapterError> {
        let mut inner = self.inner.lock().await;
        let mac = *inner.connections.get(&handle).ok_or(AdapterError::NotConnected)?;
        let device = inner.devices.get_mut(&mac).ok_or(AdapterError::NotConnected)?;
        device.values.insert(characteristic, payload.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
        let mut inner = self.inner.lock().await;
        let mac = *inner.connections.get(&handle).ok_or(AdapterError::NotConnected)?;
        let device = inner.devices.get(&mac).ok_or(AdapterError::NotConnected)?;
        if !device.notifiable.contains(&characteristic) {
            return Err(AdapterError::Stack(format!(
                "{mac} did not opt {:?} into notify in this scenario",
                characteristic
            )));
        }
        let (tx, rx) = mpsc::channel(32);
        inner.notify_senders.insert((handle, characteristic), tx);
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), AdapterError> {
        let mut inner = self.inner.lock().await;
        inner.notify_senders.remove(&(handle, characteristic));
        Ok(())
    }

    async fn is_connected(&self, handle: ConnectionHandle) -> bool {
        let inner = self.inner.lock().await;
        inner.connected_flags.get(&handle).copied().unwrap_or(false)
    }
}
