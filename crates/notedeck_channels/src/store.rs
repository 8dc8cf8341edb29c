//! The channel registry.
//!
//! The list lives in a [`tokio::sync::watch`] channel as an
//! `Arc<Vec<Channel>>`. Every mutation clones the current list, edits the
//! clone and publishes it whole, so readers only ever see complete
//! snapshots. Unchanged results are not published.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelId, ChannelInput, ChannelUpdate};
use crate::storage::{self, KeyValueStore};
use crate::{Error, Result};

pub const CHANNELS_KEY: &str = "channels";
pub const DISMISSED_KEY: &str = "dismissed-hashtags";

pub type ChannelList = Arc<Vec<Channel>>;

/// hashtag -> unix seconds of the deletion
pub type Dismissals = BTreeMap<String, u64>;

pub fn activity_key(id: &ChannelId) -> String {
    format!("channel-activity-{id}")
}

pub struct ChannelStore {
    channels: watch::Sender<ChannelList>,
    dismissed: Dismissals,
    active: Option<ChannelId>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::with_channels(vec![])
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<Channel>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(channels));
        Self {
            channels: tx,
            dismissed: Dismissals::new(),
            active: None,
        }
    }

    pub fn load(store: &dyn KeyValueStore) -> Self {
        let channels: Vec<Channel> = storage::load(store, CHANNELS_KEY).unwrap_or_default();
        let dismissed: Dismissals = storage::load(store, DISMISSED_KEY).unwrap_or_default();
        info!(
            "loaded {} channels, {} dismissed hashtags",
            channels.len(),
            dismissed.len()
        );

        let mut registry = Self::with_channels(channels);
        registry.dismissed = dismissed;
        registry
    }

    pub fn snapshot(&self) -> ChannelList {
        self.channels.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelList> {
        self.channels.subscribe()
    }

    pub fn get(&self, id: &ChannelId) -> Option<Channel> {
        self.channels.borrow().iter().find(|c| c.id == *id).cloned()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.borrow().iter().any(|c| c.id == *id)
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    pub fn active_id(&self) -> Option<&ChannelId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<Channel> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    pub fn dismissals(&self) -> &Dismissals {
        &self.dismissed
    }

    pub fn dismissed_at(&self, hashtag: &str) -> Option<u64> {
        self.dismissed.get(hashtag).copied()
    }

    /// Manual channels by `order`, then auto-discovered ones by
    /// popularity.
    pub fn sorted(&self) -> Vec<Channel> {
        let mut channels = (*self.snapshot()).clone();
        channels.sort_by(display_order);
        channels
    }

    /// Read-modify-write of the whole list. `f` returns the replacement
    /// or `None` to leave the list alone. Returns whether a new list was
    /// published.
    pub fn replace_with(
        &mut self,
        store: &mut dyn KeyValueStore,
        f: impl FnOnce(&[Channel]) -> Option<Vec<Channel>>,
    ) -> bool {
        let changed = self.channels.send_if_modified(|list| match f(list.as_slice()) {
            Some(next) if next != **list => {
                *list = Arc::new(next);
                true
            }
            _ => false,
        });

        if changed {
            self.save(store);
        }
        changed
    }

    /// Like [`Self::replace_with`] for edits that can fail or produce a
    /// value. `f` edits a copy and reports whether it changed anything.
    fn modify<T>(
        &mut self,
        store: &mut dyn KeyValueStore,
        f: impl FnOnce(&mut Vec<Channel>) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut result: Result<T> = Err(Error::Generic("channel list unavailable".to_owned()));

        let changed = self.channels.send_if_modified(|list| {
            let mut next = (**list).clone();
            match f(&mut next) {
                Ok((value, changed)) => {
                    result = Ok(value);
                    if changed {
                        *list = Arc::new(next);
                    }
                    changed
                }
                Err(err) => {
                    result = Err(err);
                    false
                }
            }
        });

        if changed {
            self.save(store);
        }
        result
    }

    fn save(&self, store: &mut dyn KeyValueStore) {
        storage::save(store, CHANNELS_KEY, &**self.channels.borrow());
    }

    pub fn create(
        &mut self,
        store: &mut dyn KeyValueStore,
        input: ChannelInput,
        now_ms: u64,
    ) -> Result<Channel> {
        let channel = self.modify(store, |list| {
            let channel = input.into_channel(list.len() as u32, now_ms)?;
            list.push(channel.clone());
            Ok((channel, true))
        })?;

        info!("created channel '{}' ({})", channel.name, channel.id.short());
        Ok(channel)
    }

    pub fn update(
        &mut self,
        store: &mut dyn KeyValueStore,
        id: &ChannelId,
        update: ChannelUpdate,
        now_ms: u64,
    ) -> Result<Channel> {
        self.modify(store, |list| {
            let channel = list
                .iter_mut()
                .find(|c| c.id == *id)
                .ok_or_else(|| Error::not_found(id.as_str()))?;
            update.apply(channel, now_ms)?;
            Ok((channel.clone(), true))
        })
    }

    /// Remove a channel and record a dismissal for each of its hashtags so
    /// discovery does not bring it straight back.
    pub fn delete(
        &mut self,
        store: &mut dyn KeyValueStore,
        id: &ChannelId,
        now_secs: u64,
    ) -> Result<Channel> {
        let removed = self.modify(store, |list| {
            let idx = list
                .iter()
                .position(|c| c.id == *id)
                .ok_or_else(|| Error::not_found(id.as_str()))?;
            Ok((list.remove(idx), true))
        })?;

        self.dismiss(store, &removed.hashtags, now_secs);

        if self.active.as_ref() == Some(id) {
            self.active = None;
        }

        info!("deleted channel '{}' ({})", removed.name, id.short());
        Ok(removed)
    }

    pub fn dismiss(
        &mut self,
        store: &mut dyn KeyValueStore,
        hashtags: &[String],
        at_secs: u64,
    ) {
        if hashtags.is_empty() {
            return;
        }

        for tag in hashtags {
            self.dismissed.insert(tag.to_lowercase(), at_secs);
        }
        storage::save(store, DISMISSED_KEY, &self.dismissed);
    }

    /// Promote an auto-discovered channel to a manual one. Unknown and
    /// manual channels are left alone.
    pub fn keep(&mut self, store: &mut dyn KeyValueStore, id: &ChannelId, now_ms: u64) -> bool {
        let kept = self.replace_with(store, |list| {
            let idx = list.iter().position(|c| c.id == *id && c.auto_discovered)?;
            let manual = list.iter().filter(|c| !c.auto_discovered).count();

            let mut next = list.to_vec();
            let channel = &mut next[idx];
            channel.auto_discovered = false;
            channel.event_count = None;
            channel.order = manual as u32;
            channel.updated_at = now_ms;
            Some(next)
        });

        if kept {
            info!("kept discovered channel {}", id.short());
        }
        kept
    }

    /// Rebuild the list in the given order. Unknown ids are skipped and
    /// channels not named are dropped.
    pub fn reorder(&mut self, store: &mut dyn KeyValueStore, ids: &[ChannelId]) -> bool {
        self.replace_with(store, |list| {
            let next = ids
                .iter()
                .filter_map(|id| list.iter().find(|c| c.id == *id))
                .enumerate()
                .map(|(order, channel)| Channel {
                    order: order as u32,
                    ..channel.clone()
                })
                .collect();
            Some(next)
        })
    }

    /// Make `id` the active channel and mark it read. Unknown ids are
    /// ignored.
    pub fn set_active(
        &mut self,
        store: &mut dyn KeyValueStore,
        id: &ChannelId,
        now_ms: u64,
    ) -> bool {
        if !self.contains(id) {
            warn!("channel {id} not found");
            return false;
        }

        self.active = Some(id.clone());
        self.mark_read(store, id, now_ms);
        debug!("active channel is now {}", id.short());
        true
    }

    pub fn mark_read(
        &mut self,
        store: &mut dyn KeyValueStore,
        id: &ChannelId,
        now_ms: u64,
    ) -> bool {
        self.replace_with(store, |list| {
            let idx = list.iter().position(|c| c.id == *id)?;
            let mut next = list.to_vec();
            next[idx].last_read_at = Some(now_ms);
            next[idx].unread_count = 0;
            Some(next)
        })
    }

    /// Apply recomputed unread counts in one replacement. Counts equal to
    /// the current value are ignored.
    pub fn apply_unread_counts(
        &mut self,
        store: &mut dyn KeyValueStore,
        counts: &[(ChannelId, u32)],
    ) -> bool {
        if counts.is_empty() {
            return false;
        }

        self.replace_with(store, |list| {
            let mut next = list.to_vec();
            let mut changed = false;
            for channel in next.iter_mut() {
                let Some((_, count)) = counts.iter().find(|(id, _)| *id == channel.id) else {
                    continue;
                };
                if channel.unread_count != *count {
                    channel.unread_count = *count;
                    changed = true;
                }
            }
            changed.then_some(next)
        })
    }
}

/// Manual channels first by `order`, then auto-discovered ones by
/// descending `event_count`.
pub fn display_order(a: &Channel, b: &Channel) -> Ordering {
    match (a.auto_discovered, b.auto_discovered) {
        (false, false) => a.order.cmp(&b.order),
        (true, true) => b
            .event_count
            .unwrap_or(0)
            .cmp(&a.event_count.unwrap_or(0))
            .then_with(|| a.order.cmp(&b.order)),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
    }
}

/// Stamp the channel's last activity with `now_ms`.
pub fn record_activity(store: &mut dyn KeyValueStore, id: &ChannelId, now_ms: u64) {
    storage::save(store, &activity_key(id), &now_ms);
}

/// Unix millis of the last arrival on the channel's feed, 0 if none.
pub fn last_activity(store: &dyn KeyValueStore, id: &ChannelId) -> u64 {
    storage::load(store, &activity_key(id)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::storage::MemoryKeyValueStore;
    use pretty_assertions::assert_eq;

    fn names(list: &[Channel]) -> Vec<&str> {
        list.iter().map(|c| c.name.as_str()).collect()
    }

    fn discovered(tag: &str, count: u64, order: u32) -> Channel {
        let mut ch = ChannelInput::new(tag, [tag]).into_channel(order, 0).unwrap();
        ch.auto_discovered = true;
        ch.event_count = Some(count);
        ch
    }

    #[test]
    fn create_assigns_order_and_persists() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let mut rx = registry.subscribe();

        let a = registry
            .create(&mut kv, ChannelInput::new("a", ["#A"]), 100)
            .unwrap();
        let b = registry
            .create(&mut kv, ChannelInput::new("b", ["b"]), 200)
            .unwrap();

        assert_eq!((a.order, b.order), (0, 1));
        assert_eq!(a.hashtags, vec!["a"]);
        assert_eq!(a.last_read_at, Some(100));
        assert!(rx.has_changed().unwrap());
        assert_eq!(names(&rx.borrow_and_update()), vec!["a", "b"]);

        let reloaded = ChannelStore::load(&kv);
        assert_eq!(*reloaded.snapshot(), *registry.snapshot());
    }

    #[test]
    fn invalid_create_publishes_nothing() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let rx = registry.subscribe();

        let err = registry
            .create(&mut kv, ChannelInput::new("none", ["#"]), 0)
            .unwrap_err();

        assert!(matches!(err, Error::Channel(ChannelError::EmptyHashtags)));
        assert!(!rx.has_changed().unwrap());
        assert!(!kv.contains_key(CHANNELS_KEY));
    }

    #[test]
    fn update_unknown_is_not_found() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let err = registry
            .update(&mut kv, &"nope".into(), ChannelUpdate::default(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Channel(ChannelError::NotFound(_))));
    }

    #[test]
    fn delete_records_dismissals_and_clears_active() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let ch = registry
            .create(&mut kv, ChannelInput::new("btc", ["btc", "bitcoin"]), 0)
            .unwrap();
        assert!(registry.set_active(&mut kv, &ch.id, 10));

        registry.delete(&mut kv, &ch.id, 1200).unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.active_id(), None);
        assert_eq!(registry.dismissed_at("btc"), Some(1200));
        assert_eq!(registry.dismissed_at("bitcoin"), Some(1200));
        assert_eq!(ChannelStore::load(&kv).dismissed_at("btc"), Some(1200));

        assert!(registry.delete(&mut kv, &ch.id, 1300).is_err());
    }

    #[test]
    fn keep_promotes_discovered_channel() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        registry
            .create(&mut kv, ChannelInput::new("manual", ["m"]), 0)
            .unwrap();
        let auto = discovered("nostr", 9, 1);
        registry.replace_with(&mut kv, |list| {
            let mut next = list.to_vec();
            next.push(auto.clone());
            Some(next)
        });

        assert!(registry.keep(&mut kv, &auto.id, 50));
        let kept = registry.get(&auto.id).unwrap();
        assert!(!kept.auto_discovered);
        assert_eq!(kept.event_count, None);
        assert_eq!(kept.order, 1);
        assert_eq!(kept.updated_at, 50);

        // already manual
        assert!(!registry.keep(&mut kv, &auto.id, 60));
    }

    #[test]
    fn reorder_drops_unnamed_channels() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let ids: Vec<ChannelId> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                let input = ChannelInput::new(*n, [*n]);
                registry.create(&mut kv, input, 0).unwrap().id
            })
            .collect();

        registry.reorder(&mut kv, &[ids[2].clone(), "ghost".into(), ids[0].clone()]);

        let list = registry.snapshot();
        assert_eq!(names(&list), vec!["c", "a"]);
        assert_eq!(list.iter().map(|c| c.order).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn set_active_marks_read_and_ignores_unknown() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let ch = registry
            .create(&mut kv, ChannelInput::new("a", ["a"]), 0)
            .unwrap();
        registry.apply_unread_counts(&mut kv, &[(ch.id.clone(), 4)]);
        assert_eq!(registry.get(&ch.id).unwrap().unread_count, 4);

        assert!(!registry.set_active(&mut kv, &"ghost".into(), 99));
        assert_eq!(registry.active_id(), None);

        assert!(registry.set_active(&mut kv, &ch.id, 99));
        let ch = registry.get(&ch.id).unwrap();
        assert_eq!(ch.unread_count, 0);
        assert_eq!(ch.last_read_at, Some(99));
    }

    #[test]
    fn unchanged_counts_do_not_publish() {
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let ch = registry
            .create(&mut kv, ChannelInput::new("a", ["a"]), 0)
            .unwrap();
        let rx = registry.subscribe();

        assert!(!registry.apply_unread_counts(&mut kv, &[(ch.id.clone(), 0)]));
        assert!(!rx.has_changed().unwrap());

        assert!(registry.apply_unread_counts(&mut kv, &[(ch.id, 2)]));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn sorted_puts_manual_first_then_popular() {
        let manual_b = ChannelInput::new("b", ["b"]).into_channel(1, 0).unwrap();
        let manual_a = ChannelInput::new("a", ["a"]).into_channel(0, 0).unwrap();

        let registry = ChannelStore::with_channels(vec![
            discovered("rare", 1, 2),
            manual_b,
            discovered("hot", 50, 3),
            manual_a,
        ]);

        assert_eq!(names(&registry.sorted()), vec!["a", "b", "hot", "rare"]);
    }

    #[test]
    fn activity_marker_roundtrip() {
        let mut kv = MemoryKeyValueStore::new();
        let id = ChannelId::new("abc");
        assert_eq!(last_activity(&kv, &id), 0);
        record_activity(&mut kv, &id, 1_700_000_000_000);
        assert_eq!(last_activity(&kv, &id), 1_700_000_000_000);
    }
}
