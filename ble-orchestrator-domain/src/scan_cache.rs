use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::advertisement::{AdvertisementRecord, DeviceHistory};
use crate::mac::MacAddress;

/// Bounded, TTL-indexed map from MAC address to recent advertisement
/// history. The only writer is the scan callback path (`ingest`); lookups
/// and the status snapshot (`list`) may run concurrently with each other.
pub struct ScanCache {
    ttl: Duration,
    entries: HashMap<MacAddress, DeviceHistory>,
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Appends an observation, evicting the oldest entry in that MAC's
    /// history once it exceeds the 10-entry cap. O(1) amortized.
    pub fn ingest(&mut self, record: AdvertisementRecord) {
        self.entries.entry(record.mac).or_default().push(record);
    }

    /// Returns the newest record for `mac` if it is still within TTL;
    /// otherwise prunes the entry and returns `None`.
    pub fn lookup(&mut self, mac: MacAddress) -> Option<AdvertisementRecord> {
        let expired = match self.entries.get(&mac) {
            Some(history) => match history.newest() {
                Some(newest) => newest.observed_at.elapsed() > self.ttl,
                None => true,
            },
            None => return None,
        };
        if expired {
            self.entries.remove(&mac);
            return None;
        }
        self.entries
            .get(&mac)
            .and_then(|h| h.newest())
            .cloned()
    }

    /// Snapshot of (mac, newest record) for every live entry, for
    /// `get_service_status` reporting. Does not prune.
    pub fn list(&self) -> Vec<(MacAddress, AdvertisementRecord)> {
        self.entries
            .iter()
            .filter_map(|(mac, history)| history.newest().map(|r| (*mac, r.clone())))
            .collect()
    }

    /// Drops every entry whose newest observation is older than TTL.
    pub fn sweep(&mut self) {
        self.entries.retain(|_, history| match history.newest() {
            Some(newest) => newest.observed_at.elapsed() <= self.ttl,
            None => false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap as Map;
    use std::thread::sleep;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn record(mac: MacAddress, rssi: i16) -> AdvertisementRecord {
        AdvertisementRecord::new(mac, None, rssi, vec![], Map::new())
    }

    #[test]
    fn lookup_returns_newest_within_ttl() {
        let mut cache = ScanCache::new(Duration::from_secs(300));
        let m = mac("AA:BB:CC:DD:EE:01");
        cache.ingest(record(m, -55));
        let found = cache.lookup(m).unwrap();
        assert_eq!(found.rssi, -55);
    }

    #[test]
    fn lookup_prunes_expired_entry() {
        let mut cache = ScanCache::new(Duration::from_millis(1));
        let m = mac("AA:BB:CC:DD:EE:01");
        cache.ingest(record(m, -55));
        sleep(Duration::from_millis(5));
        assert!(cache.lookup(m).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_unknown_mac_returns_none_without_panicking() {
        let mut cache = ScanCache::new(Duration::from_secs(300));
        assert!(cache.lookup(mac("11:22:33:44:55:66")).is_none());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let mut cache = ScanCache::new(Duration::from_millis(5));
        let fresh = mac("AA:BB:CC:DD:EE:01");
        let stale = mac("AA:BB:CC:DD:EE:02");
        cache.ingest(record(stale, -60));
        sleep(Duration::from_millis(10));
        cache.ingest(record(fresh, -50));
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(fresh).is_some());
    }

    #[test]
    fn list_does_not_prune() {
        let mut cache = ScanCache::new(Duration::from_millis(1));
        cache.ingest(record(mac("AA:BB:CC:DD:EE:01"), -55));
        sleep(Duration::from_millis(5));
        assert_eq!(cache.list().len(), 1);
    }
}
