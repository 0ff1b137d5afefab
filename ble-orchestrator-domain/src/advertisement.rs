use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::mac::MacAddress;

/// Per-MAC history is capped at this many entries; the oldest is dropped
/// on overflow. Mirrors the "last 10 observations" contract in the data model.
const MAX_HISTORY: usize = 10;

/// One scan observation for a single device. Immutable once constructed;
/// `observed_at` is a monotonic instant, never a wall-clock value, so TTL
/// comparisons are unaffected by clock adjustments.
#[derive(Clone, Debug)]
pub struct AdvertisementRecord {
    pub mac: MacAddress,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub payload: Vec<u8>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub observed_at: Instant,
}

impl AdvertisementRecord {
    pub fn new(
        mac: MacAddress,
        local_name: Option<String>,
        rssi: i16,
        payload: Vec<u8>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
    ) -> Self {
        Self {
            mac,
            local_name,
            rssi,
            payload,
            manufacturer_data,
            observed_at: Instant::now(),
        }
    }
}

/// Ordered, bounded sequence of observations for one MAC, newest last.
/// Owned exclusively by `ScanCache`; mutated only by the scan callback path.
#[derive(Debug, Default)]
pub struct DeviceHistory {
    records: VecDeque<AdvertisementRecord>,
}

impl DeviceHistory {
    pub fn push(&mut self, record: AdvertisementRecord) {
        if let Some(newest) = self.records.back() {
            debug_assert!(
                record.observed_at >= newest.observed_at,
                "advertisement records must be ingested in non-decreasing timestamp order"
            );
        }
        if self.records.len() >= MAX_HISTORY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn newest(&self) -> Option<&AdvertisementRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdvertisementRecord> {
        self.records.iter()
    }
}
