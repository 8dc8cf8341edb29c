use std::sync::Arc;
use std::time::{Duration, Instant};

use enostr::RelayTransport;
use tokio::sync::watch;
use tracing::{error, info};

use crate::background::BackgroundPool;
use crate::channel::{Channel, ChannelId, ChannelInput, ChannelUpdate};
use crate::config::{ChannelsConfig, DiscoveryConfig};
use crate::discovery::HashtagDiscovery;
use crate::feed::{ChannelFeed, FeedContext, FeedState};
use crate::ledger::SubscriptionLedger;
use crate::storage::KeyValueStore;
use crate::store::{last_activity, ChannelList, ChannelStore};
use crate::time::{millis_to_secs, unix_time_millis};
use crate::unread::UnreadTracker;
use crate::Result;

/// The channel engine: registry, the active channel's feed, background
/// unread watches and hashtag discovery, driven by [`Channels::update`]
/// once per frame.
pub struct Channels {
    config: ChannelsConfig,
    storage: Box<dyn KeyValueStore>,
    registry: ChannelStore,
    ledger: SubscriptionLedger,
    unread: UnreadTracker,
    feed: ChannelFeed,
    background: BackgroundPool,
    discovery: Option<HashtagDiscovery>,
    started: bool,
}

impl Channels {
    pub fn new(config: ChannelsConfig, storage: Box<dyn KeyValueStore>) -> Self {
        let registry = ChannelStore::load(storage.as_ref());
        let unread = UnreadTracker::new(
            config.unread_cap,
            Duration::from_secs(config.unread_refresh_secs),
        );
        let discovery = config.discovery.clone().map(HashtagDiscovery::new);

        Self {
            config,
            storage,
            registry,
            ledger: SubscriptionLedger::new(),
            unread,
            feed: ChannelFeed::new(),
            background: BackgroundPool::new(),
            discovery,
            started: false,
        }
    }

    /// Build from the settings saved in `storage`.
    pub fn load(storage: Box<dyn KeyValueStore>) -> Self {
        let config = ChannelsConfig::load(storage.as_ref());
        Self::new(config, storage)
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelStore {
        &self.registry
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    pub fn background(&self) -> &BackgroundPool {
        &self.background
    }

    pub fn discovery(&self) -> Option<&HashtagDiscovery> {
        self.discovery.as_ref()
    }

    pub fn storage(&self) -> &dyn KeyValueStore {
        self.storage.as_ref()
    }

    pub fn channels(&self) -> ChannelList {
        self.registry.snapshot()
    }

    pub fn sorted(&self) -> Vec<Channel> {
        self.registry.sorted()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelList> {
        self.registry.subscribe()
    }

    pub fn get(&self, id: &ChannelId) -> Option<Channel> {
        self.registry.get(id)
    }

    pub fn active(&self) -> Option<Channel> {
        self.registry.active()
    }

    pub fn feed_state(&self) -> Arc<FeedState> {
        self.feed.state()
    }

    pub fn last_activity(&self, id: &ChannelId) -> u64 {
        last_activity(self.storage.as_ref(), id)
    }

    pub fn create(&mut self, input: ChannelInput) -> Result<Channel> {
        self.registry
            .create(self.storage.as_mut(), input, unix_time_millis())
    }

    pub fn update_channel(&mut self, id: &ChannelId, update: ChannelUpdate) -> Result<Channel> {
        self.registry
            .update(self.storage.as_mut(), id, update, unix_time_millis())
    }

    /// Delete a channel along with its unread data. Its hashtags are
    /// dismissed from discovery as of now.
    pub fn delete(&mut self, id: &ChannelId) -> Result<Channel> {
        let now_secs = millis_to_secs(unix_time_millis());
        let removed = self.registry.delete(self.storage.as_mut(), id, now_secs)?;
        self.unread.forget(self.storage.as_mut(), id);
        Ok(removed)
    }

    pub fn keep(&mut self, id: &ChannelId) -> bool {
        self.registry
            .keep(self.storage.as_mut(), id, unix_time_millis())
    }

    pub fn reorder(&mut self, ids: &[ChannelId]) -> bool {
        self.registry.reorder(self.storage.as_mut(), ids)
    }

    /// The feed follows on the next [`Channels::update`].
    pub fn set_active(&mut self, id: &ChannelId) -> bool {
        self.registry
            .set_active(self.storage.as_mut(), id, unix_time_millis())
    }

    pub fn mark_read(&mut self, id: &ChannelId) -> bool {
        self.registry
            .mark_read(self.storage.as_mut(), id, unix_time_millis())
    }

    fn with_feed<R>(
        &mut self,
        transport: &dyn RelayTransport,
        now_ms: u64,
        f: impl FnOnce(&mut ChannelFeed, &mut FeedContext<'_>) -> R,
    ) -> R {
        let mut ctx = FeedContext {
            transport,
            ledger: &mut self.ledger,
            unread: &mut self.unread,
            storage: self.storage.as_mut(),
            config: &self.config,
            now_ms,
        };
        f(&mut self.feed, &mut ctx)
    }

    pub fn refresh(&mut self, transport: &dyn RelayTransport) {
        self.with_feed(transport, unix_time_millis(), |feed, ctx| feed.refresh(ctx));
    }

    pub fn load_more(&mut self, transport: &dyn RelayTransport) -> bool {
        self.with_feed(transport, unix_time_millis(), |feed, ctx| feed.load_more(ctx))
    }

    pub fn clear_new_events(&mut self) {
        self.feed.clear_new_events();
    }

    /// Replace the settings. Discovery is restarted when its settings
    /// changed; feeds and watches pick up relay changes on the next
    /// [`Channels::update`].
    pub fn set_config(&mut self, transport: &dyn RelayTransport, config: ChannelsConfig) {
        config.save(self.storage.as_mut());

        if config.discovery != self.config.discovery {
            self.reconfigure_discovery(transport, config.discovery.clone());
        }

        self.config = config;
    }

    fn reconfigure_discovery(
        &mut self,
        transport: &dyn RelayTransport,
        next: Option<DiscoveryConfig>,
    ) {
        let Some(next) = next else {
            if let Some(mut discovery) = self.discovery.take() {
                discovery.stop();
            }
            return;
        };

        if let Some(discovery) = self.discovery.as_mut() {
            if let Err(err) = discovery.restart(transport, next) {
                error!("could not restart discovery: {err}");
            }
            return;
        }

        let mut discovery = HashtagDiscovery::new(next);
        if self.started {
            if let Err(err) = discovery.start(transport) {
                error!("could not start discovery: {err}");
            }
        }
        self.discovery = Some(discovery);
    }

    fn start(&mut self, transport: &dyn RelayTransport) {
        self.started = true;
        info!("starting with {} channels", self.registry.len());

        if let Some(discovery) = self.discovery.as_mut() {
            if let Err(err) = discovery.start(transport) {
                error!("could not start discovery: {err}");
            }
        }
    }

    /// Advance the engine by one frame.
    pub fn update(&mut self, transport: &dyn RelayTransport, now: Instant) {
        let now_ms = unix_time_millis();

        if !self.started {
            self.start(transport);
        }

        if self.registry.active_id().is_none() {
            let first = self.registry.snapshot().first().map(|c| c.id.clone());
            if let Some(first) = first {
                self.registry
                    .set_active(self.storage.as_mut(), &first, now_ms);
            }
        }

        let active = self.registry.active();
        self.with_feed(transport, now_ms, |feed, ctx| feed.set_channel(ctx, active));

        let channels = self.registry.snapshot();
        self.background.sync(
            transport,
            &mut self.ledger,
            &self.config,
            &channels,
            self.registry.active_id(),
        );

        self.with_feed(transport, now_ms, |feed, ctx| feed.poll(ctx));
        self.background
            .poll(&mut self.unread, self.storage.as_ref());

        if let Some(discovery) = self.discovery.as_mut() {
            discovery.poll(&mut self.registry, self.storage.as_mut(), now, now_ms);
        }

        if self.unread.should_refresh(now) {
            let channels = self.registry.snapshot();
            let changed = self
                .unread
                .recompute(self.storage.as_mut(), &channels, now);
            self.registry
                .apply_unread_counts(self.storage.as_mut(), &changed);
        }
    }

    /// Close every subscription and flush unread data.
    pub fn shutdown(&mut self) {
        info!("shutting down channels");
        self.feed.teardown(&mut self.ledger);
        self.background.close_all(&mut self.ledger);
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop();
        }
        self.unread.flush(self.storage.as_mut());
        self.started = false;
    }
}

impl Drop for Channels {
    fn drop(&mut self) {
        if self.started {
            self.shutdown();
        }
    }
}
