//! Real `btleplug`-backed [`AdapterFacade`]. Runs the usual connect /
//! discover-services / read / write sequence, but keeps a live
//! connection table so the Handler and Notification Manager can issue
//! many operations against one already-open GATT connection instead of
//! reconnecting per request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use ble_orchestrator_domain::request::CharacteristicRef;
use ble_orchestrator_domain::{AdvertisementRecord, MacAddress};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{AdapterError, AdapterFacade, ConnectionHandle};

struct Live {
    peripheral: Peripheral,
    mac: MacAddress,
}

/// Wraps one `btleplug::platform::Adapter`. One facade instance mediates
/// exactly one adapter; the service layer decides whether scan and
/// connect run against the same physical radio or two.
pub struct BtleplugAdapter {
    adapter: Adapter,
    next_handle: AtomicU64,
    live: Mutex<HashMap<ConnectionHandle, Live>>,
}

impl BtleplugAdapter {
    /// Picks the first adapter the host reports.
    pub async fn first_available() -> Result<Self, AdapterError> {
        let manager = Manager::new()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        let mut adapters = manager
            .adapters()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        if adapters.is_empty() {
            return Err(AdapterError::NoSuchAdapter("<none found on host>".into()));
        }
        let adapter = adapters.remove(0);
        Ok(Self::from_adapter(adapter))
    }

    /// Picks the adapter whose `adapter_info()` contains `id` (e.g.
    /// `hci0`), matching the `SCAN_ADAPTER`/`CONNECT_ADAPTER` host-level
    /// names the binary crate reads from the environment. A host with a
    /// single controller still benefits from this rather than
    /// `first_available` whenever the configured name doesn't match —
    /// a misconfiguration should fail loudly rather than silently bind
    /// the wrong radio.
    pub async fn named(id: &str) -> Result<Self, AdapterError> {
        let manager = Manager::new()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        for adapter in adapters {
            let info = adapter
                .adapter_info()
                .await
                .map_err(|e| AdapterError::Stack(e.to_string()))?;
            if info.contains(id) {
                return Ok(Self::from_adapter(adapter));
            }
        }
        Err(AdapterError::NoSuchAdapter(id.to_string()))
    }

    fn from_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    async fn find_characteristic(
        peripheral: &Peripheral,
        reference: CharacteristicRef,
    ) -> Result<Characteristic, AdapterError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == reference.char_uuid && c.service_uuid == reference.service_uuid)
            .ok_or_else(|| {
                AdapterError::Stack(format!(
                    "characteristic {} not present under service {}",
                    reference.char_uuid, reference.service_uuid
                ))
            })
    }

    async fn peripheral_for_mac(&self, mac: MacAddress) -> Result<Peripheral, AdapterError> {
        for peripheral in self
            .adapter
            .peripherals()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?
        {
            let Some(properties) = peripheral
                .properties()
                .await
                .map_err(|e| AdapterError::Stack(e.to_string()))?
            else {
                continue;
            };
            if properties.address.to_string().eq_ignore_ascii_case(&mac.to_string()) {
                return Ok(peripheral);
            }
        }
        Err(AdapterError::NotFound(mac))
    }
}

#[async_trait]
impl AdapterFacade for BtleplugAdapter {
    async fn start_scan(&self) -> Result<(), AdapterError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))
    }

    async fn drain_discovered(&self) -> Result<Vec<AdvertisementRecord>, AdapterError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        let mut records = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let Some(properties) = peripheral
                .properties()
                .await
                .map_err(|e| AdapterError::Stack(e.to_string()))?
            else {
                continue;
            };
            let Ok(mac) = properties.address.to_string().parse::<MacAddress>() else {
                continue;
            };
            let Some(rssi) = properties.rssi else {
                continue;
            };
            records.push(AdvertisementRecord::new(
                mac,
                properties.local_name,
                rssi,
                Vec::new(),
                properties.manufacturer_data,
            ));
        }
        Ok(records)
    }

    async fn connect(
        &self,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<ConnectionHandle, AdapterError> {
        let peripheral = self.peripheral_for_mac(mac).await?;
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| AdapterError::ConnectTimeout(timeout))?
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        let handle = self.allocate_handle();
        self.live.lock().await.insert(handle, Live { peripheral, mac });
        debug!(%mac, ?handle, "connected");
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), AdapterError> {
        let Some(live) = self.live.lock().await.remove(&handle) else {
            return Err(AdapterError::NotConnected);
        };
        if let Err(e) = live.peripheral.disconnect().await {
            warn!(mac = %live.mac, error = %e, "disconnect reported an error, dropping handle anyway");
        }
        Ok(())
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<Vec<u8>, AdapterError> {
        let live = self.live.lock().await;
        let live = live.get(&handle).ok_or(AdapterError::NotConnected)?;
        let ch = Self::find_characteristic(&live.peripheral, characteristic).await?;
        live.peripheral
            .read(&ch)
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))
    }

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        payload: &[u8],
        wants_response: bool,
    ) -> Result<(), AdapterError> {
        let live = self.live.lock().await;
        let live = live.get(&handle).ok_or(AdapterError::NotConnected)?;
        let ch = Self::find_characteristic(&live.peripheral, characteristic).await?;
        let write_type = if wants_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        live.peripheral
            .write(&ch, payload, write_type)
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
        let peripheral = {
            let live = self.live.lock().await;
            let live = live.get(&handle).ok_or(AdapterError::NotConnected)?;
            live.peripheral.clone()
        };
        let ch = Self::find_characteristic(&peripheral, characteristic).await?;
        if !ch.properties.contains(CharPropFlags::NOTIFY) && !ch.properties.contains(CharPropFlags::INDICATE) {
            return Err(AdapterError::Stack(format!(
                "characteristic {} does not support notify/indicate",
                characteristic.char_uuid
            )));
        }
        peripheral
            .subscribe(&ch)
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))?;
        let want_uuid = ch.uuid;
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(event) = notifications.next().await {
                if event.uuid != want_uuid {
                    continue;
                }
                if tx.send(event.value).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), AdapterError> {
        let live = self.live.lock().await;
        let live = live.get(&handle).ok_or(AdapterError::NotConnected)?;
        let ch = Self::find_characteristic(&live.peripheral, characteristic).await?;
        live.peripheral
            .unsubscribe(&ch)
            .await
            .map_err(|e| AdapterError::Stack(e.to_string()))
    }

    async fn is_connected(&self, handle: ConnectionHandle) -> bool {
        let live = self.live.lock().await;
        let Some(live) = live.get(&handle) else {
            return false;
        };
        live.peripheral.is_connected().await.unwrap_or(false)
    }
}
