//! Passive channel discovery.
//!
//! One firehose subscription on the discovery relay feeds a tally of
//! `t` tags. Once the relay has sent its stored events the tally is
//! turned into auto-discovered channels; after that, new tagged
//! arrivals are coalesced with a [`DebounceTimer`] so a burst produces a
//! single pass over the registry.

use std::time::{Duration, Instant};

use enostr::{
    Filter, Note, RelayTransport, SubId, SubMailbox, SubscriptionHandle, SubscriptionListener,
};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, trace, warn};

use crate::channel::{extract_hashtags, Channel, ChannelInput};
use crate::config::DiscoveryConfig;
use crate::debouncer::DebounceTimer;
use crate::feed::is_benign_close;
use crate::storage::KeyValueStore;
use crate::store::{ChannelStore, Dismissals};
use crate::Result;

/// Occurrences and newest timestamp per lowercase hashtag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashtagTally {
    counts: HashMap<String, u64>,
    latest: HashMap<String, u64>,
}

impl HashtagTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every `t` tag on the note, falling back to inline `#tags`
    /// in the content when it has none. Returns whether it had any.
    pub fn record(&mut self, note: &Note) -> bool {
        let mut tags: Vec<String> = note.hashtags().map(str::to_lowercase).collect();
        if tags.is_empty() {
            tags = extract_hashtags(&note.content);
        }

        let mut tagged = false;
        for tag in tags {
            let latest = self.latest.entry(tag.clone()).or_insert(0);
            if note.created_at > *latest {
                *latest = note.created_at;
            }
            *self.counts.entry(tag).or_insert(0) += 1;
            tagged = true;
        }
        tagged
    }

    pub fn count(&self, tag: &str) -> Option<u64> {
        self.counts.get(tag).copied()
    }

    pub fn latest(&self, tag: &str) -> u64 {
        self.latest.get(tag).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.latest.clear();
    }

    /// Most seen first, ties by name.
    pub fn by_popularity(&self) -> Vec<(&str, u64)> {
        let mut tags: Vec<(&str, u64)> = self
            .counts
            .iter()
            .map(|(tag, count)| (tag.as_str(), *count))
            .collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        tags
    }
}

/// Fold the tally into the channel list.
///
/// Existing auto-discovered channels get their `event_count` refreshed.
/// Tags no channel covers become new auto-discovered channels on
/// `relay`, unless they were dismissed and nothing newer than the
/// dismissal has been seen. Returns `None` when nothing changed.
pub fn sync_channels(
    current: &[Channel],
    tally: &HashtagTally,
    dismissed: &Dismissals,
    relay: &str,
    now_ms: u64,
) -> Option<Vec<Channel>> {
    if tally.is_empty() {
        return None;
    }

    let mut covered: HashSet<String> = current
        .iter()
        .flat_map(|c| c.hashtags.iter().map(|h| h.to_lowercase()))
        .collect();

    let mut changed = false;
    let mut next: Vec<Channel> = current
        .iter()
        .map(|channel| {
            let count = channel
                .discovered_hashtag()
                .and_then(|tag| tally.count(&tag));
            match count {
                Some(count) if channel.event_count != Some(count) => {
                    changed = true;
                    Channel {
                        event_count: Some(count),
                        ..channel.clone()
                    }
                }
                _ => channel.clone(),
            }
        })
        .collect();

    for (tag, count) in tally.by_popularity() {
        if covered.contains(tag) {
            continue;
        }

        if let Some(dismissed_at) = dismissed.get(tag) {
            if tally.latest(tag) <= *dismissed_at {
                trace!("#{tag} stays dismissed");
                continue;
            }
        }

        let channel = match ChannelInput::new(tag, [tag])
            .relays([relay])
            .into_channel(next.len() as u32, now_ms)
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("skipping #{tag}: {err}");
                continue;
            }
        };

        info!("discovered #{tag} ({count} events)");
        next.push(Channel {
            auto_discovered: true,
            event_count: Some(count),
            ..channel
        });
        covered.insert(tag.to_owned());
        changed = true;
    }

    changed.then_some(next)
}

pub struct HashtagDiscovery {
    config: DiscoveryConfig,
    mailbox: SubMailbox,
    sub: Option<SubscriptionHandle>,
    tally: HashtagTally,
    eosed: bool,
    debounce: DebounceTimer,
}

impl HashtagDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let debounce = DebounceTimer::new(Duration::from_millis(config.quiet_period_ms));
        Self {
            config,
            mailbox: SubMailbox::new(),
            sub: None,
            tally: HashtagTally::new(),
            eosed: false,
            debounce,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn tally(&self) -> &HashtagTally {
        &self.tally
    }

    pub fn is_running(&self) -> bool {
        self.sub.is_some()
    }

    pub fn is_eosed(&self) -> bool {
        self.eosed
    }

    pub fn sub_id(&self) -> Option<SubId> {
        self.sub.as_ref().map(SubscriptionHandle::sub_id)
    }

    /// Open the firehose subscription, replacing any previous one. The
    /// tally starts over.
    pub fn start(&mut self, transport: &dyn RelayTransport) -> Result<()> {
        self.stop();
        self.tally.clear();
        self.eosed = false;

        if self.config.relay.is_empty() {
            warn!("discovery has no relay configured");
            return Ok(());
        }

        let filter = Filter::new()
            .kinds(self.config.kinds.iter().copied())
            .limit(self.config.limit);
        let relays = [self.config.relay.clone()];
        let sub_id = SubId::next();
        let handle = transport.subscribe(&relays, filter, self.mailbox.sink(sub_id))?;

        info!("discovery started on {} ({sub_id})", self.config.relay);
        self.sub = Some(handle);
        Ok(())
    }

    pub fn restart(
        &mut self,
        transport: &dyn RelayTransport,
        config: DiscoveryConfig,
    ) -> Result<()> {
        self.debounce = DebounceTimer::new(Duration::from_millis(config.quiet_period_ms));
        self.config = config;
        self.start(transport)
    }

    pub fn stop(&mut self) {
        self.debounce.cancel();
        if let Some(mut sub) = self.sub.take() {
            info!("discovery stopped ({})", sub.sub_id());
            sub.close();
        }
    }

    /// Drain arrivals and run a sync when one is due. Returns whether
    /// the registry changed.
    pub fn poll(
        &mut self,
        registry: &mut ChannelStore,
        storage: &mut dyn KeyValueStore,
        now: Instant,
        now_ms: u64,
    ) -> bool {
        let current = self.sub_id();
        let mut intake = Tally {
            tally: &mut self.tally,
            eosed: &mut self.eosed,
            sync_now: false,
            tagged_after_eose: false,
        };

        for msg in self.mailbox.try_iter() {
            if Some(msg.sub_id) != current {
                trace!("dropping discovery message for {}", msg.sub_id);
                continue;
            }
            msg.event.dispatch(&mut intake);
        }

        let Tally {
            sync_now,
            tagged_after_eose,
            ..
        } = intake;

        if sync_now {
            self.debounce.cancel();
        } else if tagged_after_eose {
            self.debounce.schedule(now);
        }

        if sync_now || self.debounce.fire_if_due(now) {
            return self.sync(registry, storage, now_ms);
        }
        false
    }

    fn sync(
        &self,
        registry: &mut ChannelStore,
        storage: &mut dyn KeyValueStore,
        now_ms: u64,
    ) -> bool {
        let dismissed = registry.dismissals().clone();
        let relay = &self.config.relay;
        let tally = &self.tally;

        let changed = registry.replace_with(storage, |current| {
            sync_channels(current, tally, &dismissed, relay, now_ms)
        });
        debug!("discovery sync over {} hashtags, changed: {changed}", tally.len());
        changed
    }
}

struct Tally<'a> {
    tally: &'a mut HashtagTally,
    eosed: &'a mut bool,
    sync_now: bool,
    tagged_after_eose: bool,
}

impl Tally<'_> {
    fn record(&mut self, note: &Note) {
        if self.tally.record(note) && *self.eosed {
            self.tagged_after_eose = true;
        }
    }
}

impl SubscriptionListener for Tally<'_> {
    fn on_batch(&mut self, events: Vec<Note>, eosed: bool) {
        for note in &events {
            self.record(note);
        }

        if eosed && !*self.eosed {
            debug!("discovery backfill done, {} hashtags", self.tally.len());
            *self.eosed = true;
            self.sync_now = true;
        }
    }

    fn on_item(&mut self, note: Note) {
        self.record(&note);
    }

    fn on_closed(&mut self, relay: &str, reason: &str) {
        if !is_benign_close(reason) {
            warn!("discovery subscription closed by {relay}: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use enostr::MockTransport;
    use pretty_assertions::assert_eq;

    const RELAY: &str = "wss://discovery";

    fn note(id: &str, created_at: u64, tags: &[&str]) -> Note {
        let tags = tags
            .iter()
            .map(|t| vec!["t".to_owned(), (*t).to_owned()])
            .collect();
        Note::new(id, "pk", created_at, 1, tags, "")
    }

    fn tally(notes: &[Note]) -> HashtagTally {
        let mut tally = HashtagTally::new();
        for n in notes {
            tally.record(n);
        }
        tally
    }

    #[test]
    fn tally_counts_lowercased_tags() {
        let t = tally(&[
            note("a", 10, &["BTC"]),
            note("b", 30, &["btc", "nostr"]),
            note("c", 20, &["btc"]),
        ]);

        assert_eq!(t.count("btc"), Some(3));
        assert_eq!(t.latest("btc"), 30);
        assert_eq!(t.by_popularity(), vec![("btc", 3), ("nostr", 1)]);
    }

    #[test]
    fn untagged_notes_fall_back_to_content() {
        let mut t = HashtagTally::new();
        assert!(t.record(&Note::new("a", "pk", 10, 1, vec![], "gm #Nostr #zaps #nostr")));
        assert!(!t.record(&Note::new("b", "pk", 20, 1, vec![], "no tags here")));

        // t tags win over content
        let tagged = Note::new(
            "c",
            "pk",
            30,
            1,
            vec![vec!["t".to_owned(), "btc".to_owned()]],
            "#nostr",
        );
        assert!(t.record(&tagged));

        assert_eq!(t.by_popularity(), vec![("btc", 1), ("nostr", 1), ("zaps", 1)]);
        assert_eq!(t.latest("nostr"), 10);
    }

    #[test]
    fn synthesizes_uncovered_tags() {
        let t = tally(&[
            note("a", 400, &["btc"]),
            note("b", 1000, &["btc"]),
            note("c", 900, &["btc"]),
        ]);

        let next = sync_channels(&[], &t, &Dismissals::new(), RELAY, 5).unwrap();
        assert_eq!(next.len(), 1);

        let btc = &next[0];
        assert_eq!(btc.hashtags, vec!["btc"]);
        assert_eq!(btc.name, "btc");
        assert_eq!(btc.event_count, Some(3));
        assert_eq!(btc.relay_urls, vec![RELAY]);
        assert!(btc.auto_discovered);
        assert_eq!(btc.order, 0);
    }

    #[test]
    fn dismissal_holds_until_something_newer() {
        let dismissed = Dismissals::from([("btc".to_owned(), 1200)]);

        let old = tally(&[note("a", 1100, &["btc"])]);
        assert_eq!(sync_channels(&[], &old, &dismissed, RELAY, 0), None);

        let newer = tally(&[note("a", 1100, &["btc"]), note("b", 1300, &["btc"])]);
        let next = sync_channels(&[], &newer, &dismissed, RELAY, 0).unwrap();
        assert_eq!(next[0].hashtags, vec!["btc"]);
    }

    #[test]
    fn covered_tags_refresh_counts_only() {
        let manual = ChannelInput::new("Bitcoin", ["BTC", "bitcoin"])
            .into_channel(0, 0)
            .unwrap();
        let mut found = ChannelInput::new("nostr", ["nostr"])
            .relays([RELAY])
            .into_channel(1, 0)
            .unwrap();
        found.auto_discovered = true;
        found.event_count = Some(1);

        let current = vec![manual.clone(), found.clone()];
        let t = tally(&[
            note("a", 1, &["btc", "nostr"]),
            note("b", 2, &["Nostr", "bitcoin"]),
        ]);

        let next = sync_channels(&current, &t, &Dismissals::new(), RELAY, 0).unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], manual);
        assert_eq!(next[1].event_count, Some(2));

        // nothing left to do
        assert_eq!(sync_channels(&next, &t, &Dismissals::new(), RELAY, 0), None);
    }

    #[test]
    fn one_channel_per_tag_per_pass() {
        let t = tally(&[note("a", 1, &["Rust", "rust", "zig"])]);
        let next = sync_channels(&[], &t, &Dismissals::new(), RELAY, 0).unwrap();

        let tags: Vec<&str> = next.iter().map(|c| c.hashtags[0].as_str()).collect();
        assert_eq!(tags, vec!["rust", "zig"]);
        assert_eq!(next[1].order, 1);
    }

    #[test]
    fn syncs_on_eose_then_debounces() {
        let transport = MockTransport::new();
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let mut discovery = HashtagDiscovery::new(DiscoveryConfig::new(RELAY));
        let start = Instant::now();

        discovery.start(&transport).unwrap();
        let sub = transport.subs()[0].clone();
        assert_eq!(sub.relays, vec![RELAY]);
        assert_eq!(sub.filter.limit, Some(500));
        assert_eq!(sub.filter.hashtags, None);

        transport.publish(&note("a", 10, &["btc"]));
        transport.publish(&note("b", 11, &["btc"]));
        assert!(!discovery.poll(&mut registry, &mut kv, start, 0));
        assert!(registry.is_empty());

        transport.eose(sub.sub_id);
        assert!(discovery.poll(&mut registry, &mut kv, start, 0));
        assert_eq!(registry.snapshot()[0].event_count, Some(2));

        // live arrivals wait for a quiet period
        transport.publish(&note("c", 20, &["zig"]));
        assert!(!discovery.poll(&mut registry, &mut kv, start, 0));
        let later = start + Duration::from_millis(1500);
        transport.publish(&note("d", 21, &["zig"]));
        assert!(!discovery.poll(&mut registry, &mut kv, later, 0));
        assert!(!discovery.poll(&mut registry, &mut kv, start + Duration::from_millis(2500), 0));

        assert!(discovery.poll(&mut registry, &mut kv, later + Duration::from_millis(2000), 0));
        let tags: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|c| c.hashtags[0].clone())
            .collect();
        assert_eq!(tags, vec!["btc", "zig"]);
    }

    #[test]
    fn restart_resets_tally_and_drops_old_messages() {
        let transport = MockTransport::new();
        let mut kv = MemoryKeyValueStore::new();
        let mut registry = ChannelStore::new();
        let mut discovery = HashtagDiscovery::new(DiscoveryConfig::new(RELAY));
        let now = Instant::now();

        discovery.start(&transport).unwrap();
        let old = transport.subs()[0].sub_id;
        transport.publish(&note("a", 10, &["btc"]));
        discovery.poll(&mut registry, &mut kv, now, 0);
        assert_eq!(discovery.tally().count("btc"), Some(1));

        discovery
            .restart(&transport, DiscoveryConfig::new("wss://other"))
            .unwrap();
        assert!(!transport.sub(old).unwrap().is_open());
        assert!(discovery.tally().is_empty());
        assert!(!discovery.is_eosed());

        transport.eose(old);
        assert!(!discovery.poll(&mut registry, &mut kv, now, 0));
        assert!(!discovery.is_eosed());

        discovery.stop();
        assert!(!discovery.is_running());
        assert!(transport.open_subs().is_empty());
    }
}
