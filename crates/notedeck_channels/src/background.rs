//! Unread watches for every channel except the active one.
//!
//! [`BackgroundPool::sync`] is a full reconciliation pass, run whenever
//! the channel list or the active channel may have changed. It is
//! idempotent: running it twice in a row opens and closes nothing the
//! second time.

use enostr::{Note, RelayTransport, SubId, SubMailbox, SubscriptionListener};
use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::channel::{channel_filter, effective_relays, Channel, ChannelId};
use crate::config::ChannelsConfig;
use crate::feed::is_benign_close;
use crate::ledger::{SubOwner, SubscriptionLedger};
use crate::storage::KeyValueStore;
use crate::unread::UnreadTracker;

/// What a watch was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Watch {
    sub_id: SubId,
    name: String,
    hashtags: Vec<String>,
    relays: Vec<String>,
}

impl Watch {
    fn is_for(&self, channel: &Channel, relays: &[String]) -> bool {
        self.hashtags == channel.hashtags && self.relays == relays
    }
}

#[derive(Default)]
pub struct BackgroundPool {
    mailbox: SubMailbox,
    watches: HashMap<ChannelId, Watch>,
}

impl BackgroundPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn is_watching(&self, id: &ChannelId) -> bool {
        self.watches.contains_key(id)
    }

    fn unwatch(&mut self, ledger: &mut SubscriptionLedger, id: &ChannelId) {
        if let Some(watch) = self.watches.remove(id) {
            ledger.release(id, SubOwner::Background);
            debug!("stopped watching '{}' ({})", watch.name, watch.sub_id);
        }
    }

    /// Make the set of watched channels equal to `channels` minus
    /// `active`.
    pub fn sync(
        &mut self,
        transport: &dyn RelayTransport,
        ledger: &mut SubscriptionLedger,
        config: &ChannelsConfig,
        channels: &[Channel],
        active: Option<&ChannelId>,
    ) {
        // channels that are gone
        let gone: Vec<ChannelId> = self
            .watches
            .keys()
            .filter(|id| !channels.iter().any(|c| c.id == **id))
            .cloned()
            .collect();
        for id in &gone {
            info!("closing watch for removed channel {}", id.short());
            self.unwatch(ledger, id);
        }

        // the active channel belongs to the feed
        if let Some(active) = active {
            if self.watches.contains_key(active) {
                info!("closing watch for now active channel {}", active.short());
                self.unwatch(ledger, active);
            }
        }

        for channel in channels {
            if Some(&channel.id) == active {
                continue;
            }

            let relays = effective_relays(channel, &config.default_relays);

            match self.watches.get(&channel.id) {
                Some(watch) if watch.is_for(channel, relays) => continue,
                Some(_) => {
                    debug!("'{}' changed, rewatching", channel.name);
                    self.unwatch(ledger, &channel.id);
                }
                None => {}
            }

            if relays.is_empty() {
                trace!("no relays for '{}'", channel.name);
                continue;
            }

            self.watch(transport, ledger, config, channel, relays);
        }
    }

    fn watch(
        &mut self,
        transport: &dyn RelayTransport,
        ledger: &mut SubscriptionLedger,
        config: &ChannelsConfig,
        channel: &Channel,
        relays: &[String],
    ) {
        let filter = match channel_filter(
            channel,
            &config.channel_kinds,
            Some(config.background_limit),
            None,
            None,
        ) {
            Ok(filter) => filter,
            Err(err) => {
                warn!("not watching '{}': {err}", channel.name);
                return;
            }
        };

        let sub_id = SubId::next();
        let handle = match transport.subscribe(relays, filter, self.mailbox.sink(sub_id)) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("could not watch '{}': {err}", channel.name);
                return;
            }
        };

        debug!("watching '{}' on {:?} ({sub_id})", channel.name, relays);
        ledger.install(channel.id.clone(), SubOwner::Background, handle);
        self.watches.insert(
            channel.id.clone(),
            Watch {
                sub_id,
                name: channel.name.clone(),
                hashtags: channel.hashtags.clone(),
                relays: relays.to_vec(),
            },
        );
    }

    /// Forward arrivals to the unread tracker. Returns how many new
    /// timestamps were tracked.
    pub fn poll(&mut self, unread: &mut UnreadTracker, storage: &dyn KeyValueStore) -> usize {
        let mut tracked = 0;

        for msg in self.mailbox.try_iter() {
            let Some((id, watch)) = self
                .watches
                .iter()
                .find(|(_, w)| w.sub_id == msg.sub_id)
            else {
                trace!("dropping message for closed watch {}", msg.sub_id);
                continue;
            };

            let mut arrivals = Arrivals {
                id,
                name: &watch.name,
                unread: &mut *unread,
                storage,
                tracked: 0,
            };
            msg.event.dispatch(&mut arrivals);
            tracked += arrivals.tracked;
        }

        tracked
    }

    /// Close every watch.
    pub fn close_all(&mut self, ledger: &mut SubscriptionLedger) {
        if self.watches.is_empty() {
            return;
        }

        info!("closing {} background watches", self.watches.len());
        for (id, _) in self.watches.drain() {
            ledger.release(&id, SubOwner::Background);
        }
    }
}

/// Timestamps only: nothing is kept for display.
struct Arrivals<'a> {
    id: &'a ChannelId,
    name: &'a str,
    unread: &'a mut UnreadTracker,
    storage: &'a dyn KeyValueStore,
    tracked: usize,
}

impl Arrivals<'_> {
    fn track(&mut self, note: &Note) {
        if self.unread.track(self.storage, self.id, note.created_at) {
            self.tracked += 1;
        }
    }
}

impl SubscriptionListener for Arrivals<'_> {
    fn on_batch(&mut self, events: Vec<Note>, eosed: bool) {
        for note in &events {
            self.track(note);
        }
        if eosed {
            debug!("EOSE for '{}'", self.name);
        }
    }

    fn on_item(&mut self, note: Note) {
        self.track(&note);
    }

    fn on_closed(&mut self, relay: &str, reason: &str) {
        if !is_benign_close(reason) {
            info!("watch for '{}' closed by {relay}: {reason}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelInput;
    use crate::storage::MemoryKeyValueStore;
    use enostr::{MockTransport, RelayEvent};

    fn channel(name: &str, relays: &[&str]) -> Channel {
        ChannelInput::new(name, [name])
            .relays(relays.iter().copied())
            .into_channel(0, 0)
            .unwrap()
    }

    fn config() -> ChannelsConfig {
        ChannelsConfig {
            default_relays: vec!["wss://default".to_owned()],
            ..Default::default()
        }
    }

    fn tagged(id: &str, created_at: u64, tag: &str) -> Note {
        Note::new(id, "pk", created_at, 1, vec![vec!["t".to_owned(), tag.to_owned()]], "")
    }

    #[test]
    fn watches_everything_but_the_active_channel() {
        let transport = MockTransport::new();
        let mut ledger = SubscriptionLedger::new();
        let mut pool = BackgroundPool::new();
        let config = config();
        let (a, b, c) = (channel("a", &[]), channel("b", &["wss://b"]), channel("c", &[]));
        let channels = vec![a.clone(), b.clone(), c];

        pool.sync(&transport, &mut ledger, &config, &channels, Some(&a.id));
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_watching(&a.id));
        assert_eq!(ledger.owner(&b.id), Some(SubOwner::Background));
        assert_eq!(ledger.relays(&b.id), Some(&["wss://b".to_owned()][..]));
        assert_eq!(transport.subs()[0].filter.limit, Some(50));

        // idempotent
        pool.sync(&transport, &mut ledger, &config, &channels, Some(&a.id));
        assert_eq!(transport.subs().len(), 2);

        // b becomes active, a goes to the background
        pool.sync(&transport, &mut ledger, &config, &channels, Some(&b.id));
        assert!(!pool.is_watching(&b.id));
        assert!(pool.is_watching(&a.id));
        assert_eq!(ledger.owner(&b.id), None);
        assert_eq!(transport.open_subs().len(), 2);

        // a and c deleted
        pool.sync(&transport, &mut ledger, &config, &[b.clone()], Some(&b.id));
        assert!(pool.is_empty());
        assert!(transport.open_subs().is_empty());
    }

    #[test]
    fn skips_channels_without_relays_and_failing_relays() {
        let transport = MockTransport::new();
        transport.fail_subscribe_on("wss://down");
        let mut ledger = SubscriptionLedger::new();
        let mut pool = BackgroundPool::new();
        let config = ChannelsConfig::default();

        let channels = vec![
            channel("norelay", &[]),
            channel("down", &["wss://down"]),
            channel("up", &["wss://up"]),
        ];
        pool.sync(&transport, &mut ledger, &config, &channels, None);

        assert_eq!(pool.len(), 1);
        assert!(pool.is_watching(&channels[2].id));
    }

    #[test]
    fn edited_channel_is_rewatched() {
        let transport = MockTransport::new();
        let mut ledger = SubscriptionLedger::new();
        let mut pool = BackgroundPool::new();
        let config = config();
        let mut ch = channel("a", &[]);

        pool.sync(&transport, &mut ledger, &config, std::slice::from_ref(&ch), None);
        ch.hashtags.push("b".to_owned());
        pool.sync(&transport, &mut ledger, &config, std::slice::from_ref(&ch), None);

        let subs = transport.subs();
        assert_eq!(subs.len(), 2);
        assert!(!subs[0].is_open());
        assert_eq!(
            subs[1].filter.hashtags,
            Some(vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn arrivals_only_feed_unread() {
        let transport = MockTransport::new();
        let mut ledger = SubscriptionLedger::new();
        let mut pool = BackgroundPool::new();
        let mut unread = UnreadTracker::default();
        let storage = MemoryKeyValueStore::new();
        let config = config();
        let ch = channel("a", &[]);

        pool.sync(&transport, &mut ledger, &config, std::slice::from_ref(&ch), None);
        transport.publish(&tagged("x", 100, "a"));
        transport.publish(&tagged("y", 200, "a"));
        transport.publish(&tagged("z", 200, "a"));
        transport.publish(&tagged("other", 300, "b"));
        let sub_id = transport.subs()[0].sub_id;
        transport.eose(sub_id);
        transport.send(
            sub_id,
            RelayEvent::Closed {
                relay: "wss://default".to_owned(),
                reason: "closed by caller".to_owned(),
            },
        );

        assert_eq!(pool.poll(&mut unread, &storage), 2);
        assert_eq!(unread.unread_count(&ch.id, 0), 2);

        pool.close_all(&mut ledger);
        assert!(transport.open_subs().is_empty());
        transport.send(sub_id, RelayEvent::Item(tagged("late", 400, "a")));
        assert_eq!(pool.poll(&mut unread, &storage), 0);
    }
}
