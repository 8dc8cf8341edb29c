use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, trace};

use crate::channel::{Channel, ChannelId};
use crate::storage::{self, KeyValueStore};
use crate::time::millis_to_secs;

pub const DEFAULT_CAP: usize = 1000;

pub fn events_key(id: &ChannelId) -> String {
    format!("channel-events-{id}")
}

/// Per-channel arrival timestamps, used to derive unread counts against
/// each channel's read marker.
///
/// Arrivals are recorded by timestamp rather than id: two different
/// events with the same `created_at` count once.
pub struct UnreadTracker {
    cap: usize,
    timestamps: HashMap<ChannelId, VecDeque<u64>>,
    dirty: HashSet<ChannelId>,
    refresh_every: Duration,
    last_refresh: Option<Instant>,
    tracked_since_refresh: bool,
}

impl Default for UnreadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAP, Duration::from_secs(10))
    }
}

impl UnreadTracker {
    pub fn new(cap: usize, refresh_every: Duration) -> Self {
        Self {
            cap,
            timestamps: HashMap::new(),
            dirty: HashSet::new(),
            refresh_every,
            last_refresh: None,
            tracked_since_refresh: false,
        }
    }

    fn loaded(&mut self, store: &dyn KeyValueStore, id: &ChannelId) -> &mut VecDeque<u64> {
        self.timestamps.entry(id.clone()).or_insert_with(|| {
            let stored: Vec<u64> = storage::load(store, &events_key(id)).unwrap_or_default();
            VecDeque::from(stored)
        })
    }

    /// Record an arrival. Returns false when the timestamp was already
    /// known for this channel.
    pub fn track(&mut self, store: &dyn KeyValueStore, id: &ChannelId, created_at: u64) -> bool {
        let cap = self.cap;
        let seen = self.loaded(store, id);
        if seen.contains(&created_at) {
            return false;
        }

        seen.push_back(created_at);
        while seen.len() > cap {
            seen.pop_front();
        }
        trace!("tracked {created_at} for {} ({} kept)", id.short(), seen.len());

        self.dirty.insert(id.clone());
        self.tracked_since_refresh = true;
        true
    }

    /// Tracked timestamps strictly newer than the read marker.
    pub fn unread_count(&self, id: &ChannelId, last_read_at_ms: u64) -> u32 {
        let read_secs = millis_to_secs(last_read_at_ms);
        self.timestamps
            .get(id)
            .map(|seen| seen.iter().filter(|ts| **ts > read_secs).count() as u32)
            .unwrap_or(0)
    }

    pub fn tracked(&self, id: &ChannelId) -> usize {
        self.timestamps.get(id).map_or(0, VecDeque::len)
    }

    /// Due when something was tracked since the last pass or the refresh
    /// interval elapsed.
    pub fn should_refresh(&self, now: Instant) -> bool {
        if self.tracked_since_refresh {
            return true;
        }

        match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_every,
        }
    }

    /// Recompute every channel's count and return only those that differ
    /// from the channel's current value. Changed timestamp lists are
    /// flushed to the store.
    pub fn recompute(
        &mut self,
        store: &mut dyn KeyValueStore,
        channels: &[Channel],
        now: Instant,
    ) -> Vec<(ChannelId, u32)> {
        let mut changed = Vec::new();
        for channel in channels {
            self.loaded(store, &channel.id);
            let count = self.unread_count(&channel.id, channel.read_marker());
            if count != channel.unread_count {
                changed.push((channel.id.clone(), count));
            }
        }

        self.flush(store);
        self.last_refresh = Some(now);
        self.tracked_since_refresh = false;

        if !changed.is_empty() {
            debug!("unread counts changed for {} channels", changed.len());
        }
        changed
    }

    pub fn flush(&mut self, store: &mut dyn KeyValueStore) {
        for id in self.dirty.drain() {
            if let Some(seen) = self.timestamps.get(&id) {
                storage::save(store, &events_key(&id), seen);
            }
        }
    }

    /// Drop everything tracked for a deleted channel.
    pub fn forget(&mut self, store: &mut dyn KeyValueStore, id: &ChannelId) {
        self.timestamps.remove(id);
        self.dirty.remove(id);
        if let Err(err) = store.remove(&events_key(id)) {
            error!("could not remove unread data for {id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelInput;
    use crate::storage::MemoryKeyValueStore;

    #[test]
    fn counts_timestamps_newer_than_read_marker() {
        let kv = MemoryKeyValueStore::new();
        let mut unread = UnreadTracker::default();
        let ch1 = ChannelId::new("ch1");

        unread.track(&kv, &ch1, 500);
        unread.track(&kv, &ch1, 600);

        assert_eq!(unread.unread_count(&ch1, 550 * 1000), 1);
        assert_eq!(unread.unread_count(&ch1, 550 * 1000 + 999), 1);
        assert_eq!(unread.unread_count(&ch1, 600 * 1000), 0);
        assert_eq!(unread.unread_count(&"other".into(), 0), 0);
    }

    #[test]
    fn duplicate_timestamps_count_once() {
        let kv = MemoryKeyValueStore::new();
        let mut unread = UnreadTracker::default();
        let id = ChannelId::new("c");

        assert!(unread.track(&kv, &id, 700));
        assert!(!unread.track(&kv, &id, 700));
        assert_eq!(unread.unread_count(&id, 0), 1);
    }

    #[test]
    fn evicts_oldest_tracked_first() {
        let kv = MemoryKeyValueStore::new();
        let mut unread = UnreadTracker::new(3, Duration::from_secs(10));
        let id = ChannelId::new("c");

        for ts in [10, 40, 20, 30] {
            unread.track(&kv, &id, ts);
        }

        assert_eq!(unread.tracked(&id), 3);
        // 10 went first even though 20 is older than 40
        assert_eq!(unread.unread_count(&id, 15_000), 3);
        assert_eq!(unread.unread_count(&id, 25_000), 2);
    }

    #[test]
    fn recompute_reports_changes_and_persists() {
        let mut kv = MemoryKeyValueStore::new();
        let mut unread = UnreadTracker::default();
        let start = Instant::now();

        let mut ch = ChannelInput::new("a", ["a"]).into_channel(0, 0).unwrap();
        ch.last_read_at = Some(1_000_000);

        unread.track(&kv, &ch.id, 999);
        unread.track(&kv, &ch.id, 1001);
        assert!(unread.should_refresh(start));

        let changed = unread.recompute(&mut kv, std::slice::from_ref(&ch), start);
        assert_eq!(changed, vec![(ch.id.clone(), 1)]);
        assert!(!unread.should_refresh(start + Duration::from_secs(1)));
        assert!(unread.should_refresh(start + Duration::from_secs(10)));

        ch.unread_count = 1;
        let changed = unread.recompute(&mut kv, std::slice::from_ref(&ch), start);
        assert!(changed.is_empty());

        // a fresh tracker picks the timestamps up from the store
        let fresh = {
            let mut t = UnreadTracker::default();
            t.recompute(&mut kv, &[Channel { unread_count: 0, ..ch.clone() }], start)
        };
        assert_eq!(fresh, vec![(ch.id.clone(), 1)]);

        unread.forget(&mut kv, &ch.id);
        assert!(!kv.contains_key(&events_key(&ch.id)));
        assert_eq!(unread.tracked(&ch.id), 0);
    }
}
