//! The live feed of the active channel.
//!
//! `Idle -> Loading -> Ready`, with `Error` reachable from any
//! asynchronous step and left only through [`ChannelFeed::refresh`].
//! Subscription establishment and page fetches are promises polled every
//! frame. Each subscription gets a fresh [`SubId`]; results and messages
//! tagged with any other id belong to a superseded subscription and are
//! dropped.

use std::sync::Arc;

use enostr::{
    Note, RelayTransport, SubId, SubMailbox, SubscriptionListener, TimelineOptions,
    TimelineRequest, TimelineSubscription,
};
use poll_promise::Promise;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{channel_filter, effective_relays, Channel, ChannelId};
use crate::config::ChannelsConfig;
use crate::ledger::{SubOwner, SubscriptionLedger};
use crate::storage::KeyValueStore;
use crate::store::record_activity;
use crate::timeline::reconcile;
use crate::unread::UnreadTracker;

/// Close reasons that are part of normal operation.
pub const BENIGN_CLOSE_REASONS: [&str; 2] = ["closed by caller", "relay connection closed by us"];

pub fn is_benign_close(reason: &str) -> bool {
    BENIGN_CLOSE_REASONS.contains(&reason)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub events: Vec<Arc<Note>>,
    /// Live arrivals since the last [`ChannelFeed::clear_new_events`].
    pub new_events: Vec<Arc<Note>>,
    pub loading: bool,
    pub error: Option<String>,
    pub has_more: bool,
    pub phase: FeedPhase,
}

impl FeedState {
    fn loading() -> Self {
        Self {
            loading: true,
            has_more: true,
            phase: FeedPhase::Loading,
            ..Default::default()
        }
    }

    fn empty_ready() -> Self {
        Self {
            phase: FeedPhase::Ready,
            ..Default::default()
        }
    }

    fn failed(mut self, cause: String) -> Self {
        self.loading = false;
        self.error = Some(cause);
        self.phase = FeedPhase::Error;
        self
    }
}

/// What the feed needs from the rest of the engine for one call.
pub struct FeedContext<'a> {
    pub transport: &'a dyn RelayTransport,
    pub ledger: &'a mut SubscriptionLedger,
    pub unread: &'a mut UnreadTracker,
    pub storage: &'a mut dyn KeyValueStore,
    pub config: &'a ChannelsConfig,
    /// Unix millis
    pub now_ms: u64,
}

type TimelinePromise = Promise<enostr::Result<TimelineSubscription>>;
type PagePromise = Promise<enostr::Result<Vec<Note>>>;

struct PendingPage {
    sub_id: SubId,
    promise: PagePromise,
}

/// Hashtags and relays a subscription was opened with. A channel edit
/// that changes either needs a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    id: ChannelId,
    hashtags: Vec<String>,
    relays: Vec<String>,
}

impl Target {
    fn new(channel: &Channel, defaults: &[String]) -> Self {
        Self {
            id: channel.id.clone(),
            hashtags: channel.hashtags.clone(),
            relays: effective_relays(channel, defaults).to_vec(),
        }
    }
}

/// Take the value out of a finished promise, leaving pending ones alone.
fn take_ready<T: Send>(slot: &mut Option<Promise<T>>) -> Option<T> {
    let promise = slot.take()?;
    match promise.try_take() {
        Ok(value) => Some(value),
        Err(promise) => {
            *slot = Some(promise);
            None
        }
    }
}

#[derive(Default)]
pub struct ChannelFeed {
    channel: Option<Channel>,
    target: Option<Target>,
    mailbox: SubMailbox,
    /// Id of the current subscription. Anything else is stale.
    generation: Option<SubId>,
    pending: Option<TimelinePromise>,
    timeline_key: Option<String>,
    page: Option<PendingPage>,
    state: Arc<FeedState>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<FeedState> {
        self.state.clone()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn sub_id(&self) -> Option<SubId> {
        self.generation
    }

    pub fn timeline_key(&self) -> Option<&str> {
        self.timeline_key.as_deref()
    }

    pub fn is_subscribed(&self) -> bool {
        self.timeline_key.is_some()
    }

    fn set_state(&mut self, state: FeedState) {
        self.state = Arc::new(state);
    }

    /// Publish an edited copy of the current state.
    fn update_state(&mut self, f: impl FnOnce(&mut FeedState)) {
        let mut next = (*self.state).clone();
        f(&mut next);
        self.state = Arc::new(next);
    }

    /// Point the feed at a channel. Resubscribes only when the channel,
    /// its hashtags or its relays changed.
    pub fn set_channel(&mut self, ctx: &mut FeedContext<'_>, channel: Option<Channel>) {
        let Some(channel) = channel else {
            self.channel = None;
            if self.target.is_some() || self.state.phase != FeedPhase::Idle {
                self.teardown(ctx.ledger);
                self.set_state(FeedState::default());
            }
            return;
        };

        let unchanged = self.target == Some(Target::new(&channel, &ctx.config.default_relays));
        self.channel = Some(channel);

        if !unchanged {
            self.open(ctx);
        }
    }

    /// Close whatever is open, clear the state and subscribe again.
    pub fn refresh(&mut self, ctx: &mut FeedContext<'_>) {
        if self.channel.is_none() {
            return;
        }
        info!("refreshing {:?}", self.channel.as_ref().map(|c| &c.name));
        self.open(ctx);
    }

    fn open(&mut self, ctx: &mut FeedContext<'_>) {
        self.teardown(ctx.ledger);

        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let target = Target::new(channel, &ctx.config.default_relays);
        self.target = Some(target.clone());

        if target.hashtags.is_empty() || target.relays.is_empty() {
            debug!(
                "channel '{}' has no hashtags or relays, nothing to load",
                channel.name
            );
            self.set_state(FeedState::empty_ready());
            return;
        }

        let filter = match channel_filter(
            channel,
            &ctx.config.channel_kinds,
            Some(ctx.config.feed_limit),
            None,
            None,
        ) {
            Ok(filter) => filter,
            Err(err) => {
                error!("could not build filter for '{}': {err}", channel.name);
                self.set_state(FeedState::default().failed(err.to_string()));
                return;
            }
        };

        let sub_id = SubId::next();
        info!(
            "subscribing to '{}' {:?} on {:?} ({sub_id})",
            channel.name, target.hashtags, target.relays
        );

        let requests = vec![TimelineRequest {
            urls: target.relays,
            filter,
        }];
        let promise = ctx.transport.subscribe_timeline(
            requests,
            self.mailbox.sink(sub_id),
            TimelineOptions { need_sort: true },
        );

        self.generation = Some(sub_id);
        self.pending = Some(promise);
        self.set_state(FeedState::loading());
    }

    /// Close the subscription and forget pending work. Safe to call any
    /// number of times.
    pub fn teardown(&mut self, ledger: &mut SubscriptionLedger) {
        if let Some(target) = &self.target {
            ledger.release(&target.id, SubOwner::Foreground);
        }

        if let Some(sub_id) = self.generation.take() {
            debug!("feed {sub_id} torn down");
        }
        // a pending subscription is dropped with its promise; the handle it
        // eventually carries closes itself
        self.pending = None;
        self.page = None;
        self.timeline_key = None;
        self.target = None;

        if self.state.loading {
            self.update_state(|s| s.loading = false);
        }
    }

    pub fn clear_new_events(&mut self) {
        if !self.state.new_events.is_empty() {
            self.update_state(|s| s.new_events.clear());
        }
    }

    /// Fetch the page older than everything we hold. Returns false when
    /// a page is not available right now.
    pub fn load_more(&mut self, ctx: &mut FeedContext<'_>) -> bool {
        let (Some(channel), Some(target), Some(sub_id)) =
            (self.channel.as_ref(), self.target.as_ref(), self.generation)
        else {
            return false;
        };

        if self.state.loading || !self.state.has_more || self.timeline_key.is_none() {
            return false;
        }

        // only refresh leaves the error state
        if self.state.phase == FeedPhase::Error {
            return false;
        }

        let Some(oldest) = self.state.events.last() else {
            return false;
        };
        let until = oldest.created_at.saturating_sub(1);

        let filter = match channel_filter(
            channel,
            &ctx.config.channel_kinds,
            Some(ctx.config.page_limit),
            None,
            Some(until),
        ) {
            Ok(filter) => filter,
            Err(err) => {
                error!("could not build page filter for '{}': {err}", channel.name);
                return false;
            }
        };

        debug!("loading page until {until} for '{}'", channel.name);
        let promise = ctx.transport.fetch_events(&target.relays, filter);
        self.page = Some(PendingPage { sub_id, promise });
        self.update_state(|s| {
            s.loading = true;
            s.phase = FeedPhase::Loading;
        });
        true
    }

    /// Apply whatever finished since the last frame.
    pub fn poll(&mut self, ctx: &mut FeedContext<'_>) {
        self.poll_subscription(ctx);
        self.poll_messages(ctx);
        self.poll_page(ctx);
    }

    fn poll_subscription(&mut self, ctx: &mut FeedContext<'_>) {
        let Some(result) = take_ready(&mut self.pending) else {
            return;
        };

        match result {
            Ok(sub) => {
                let sub_id = sub.handle.sub_id();
                if self.generation != Some(sub_id) {
                    // superseded while we waited; dropping closes it
                    debug!("discarding stale subscription {sub_id}");
                    return;
                }
                let Some(target) = self.target.as_ref() else {
                    return;
                };

                debug!("feed {sub_id} established as {}", sub.timeline_key);
                self.timeline_key = Some(sub.timeline_key);
                ctx.ledger
                    .install(target.id.clone(), SubOwner::Foreground, sub.handle);
            }
            Err(err) => {
                warn!("channel subscription failed: {err}");
                let cause = err.to_string();
                self.update_state(|s| *s = std::mem::take(s).failed(cause));
            }
        }
    }

    fn poll_messages(&mut self, ctx: &mut FeedContext<'_>) {
        if self.mailbox.is_empty() {
            return;
        }

        let Some(channel) = self.channel.clone() else {
            // drain
            for _ in self.mailbox.try_iter() {}
            return;
        };

        let mut intake = Intake {
            channel: &channel,
            ctx,
            state: (*self.state).clone(),
            changed: false,
        };

        for msg in self.mailbox.try_iter() {
            if Some(msg.sub_id) != self.generation {
                trace!("dropping message for stale {}", msg.sub_id);
                continue;
            }
            msg.event.dispatch(&mut intake);
        }

        if intake.changed {
            self.state = Arc::new(intake.state);
        }
    }

    fn poll_page(&mut self, ctx: &mut FeedContext<'_>) {
        let Some(mut page) = self.page.take() else {
            return;
        };

        let result = match page.promise.try_take() {
            Ok(result) => result,
            Err(promise) => {
                page.promise = promise;
                self.page = Some(page);
                return;
            }
        };

        if self.generation != Some(page.sub_id) {
            debug!("discarding page for superseded {}", page.sub_id);
            return;
        }

        match result {
            Ok(notes) => {
                let shown: Vec<Arc<Note>> = notes
                    .into_iter()
                    .filter(|n| ctx.config.shows_kind(n.kind))
                    .map(Arc::new)
                    .collect();
                let full = shown.len() as u64 >= ctx.config.page_limit;
                debug!("page brought {} events, more: {full}", shown.len());

                self.update_state(|s| {
                    let (events, _) = reconcile(&s.events, &shown, None);
                    s.events = events;
                    s.has_more = full;
                    s.loading = false;
                    s.error = None;
                    s.phase = FeedPhase::Ready;
                });
            }
            Err(err) => {
                warn!("loading more failed: {err}");
                let cause = err.to_string();
                self.update_state(|s| *s = std::mem::take(s).failed(cause));
            }
        }
    }
}

/// Folds subscription callbacks into a working copy of the feed state.
struct Intake<'a, 'c> {
    channel: &'a Channel,
    ctx: &'a mut FeedContext<'c>,
    state: FeedState,
    changed: bool,
}

impl Intake<'_, '_> {
    fn note_arrivals<'n>(&mut self, notes: impl Iterator<Item = &'n Note>) {
        let mut any = false;
        for note in notes {
            any = true;
            self.ctx
                .unread
                .track(&*self.ctx.storage, &self.channel.id, note.created_at);
        }

        if any {
            record_activity(self.ctx.storage, &self.channel.id, self.ctx.now_ms);
        }
    }
}

impl SubscriptionListener for Intake<'_, '_> {
    fn on_batch(&mut self, events: Vec<Note>, eosed: bool) {
        self.note_arrivals(events.iter());

        let config = self.ctx.config;
        let shown: Vec<Arc<Note>> = events
            .into_iter()
            .filter(|n| config.shows_kind(n.kind))
            .map(Arc::new)
            .collect();

        let (set, _) = reconcile(&[], &shown, Some(config.feed_limit as usize));
        self.state.has_more = shown.len() as u64 >= config.feed_limit;
        self.state.events = set;

        if eosed || self.state.phase == FeedPhase::Ready {
            self.state.phase = FeedPhase::Ready;
            self.state.loading = false;
        } else {
            self.state.loading = true;
        }
        self.changed = true;
    }

    fn on_item(&mut self, note: Note) {
        self.note_arrivals(std::iter::once(&note));

        if !self.ctx.config.shows_kind(note.kind) || !self.channel.matches(&note) {
            trace!("ignoring {} for '{}'", note.id, self.channel.name);
            return;
        }

        // never evict pages that load_more brought in
        let held = self.state.events.len() + 1;
        let limit = Some(held.max(self.ctx.config.feed_limit as usize));
        let note = [Arc::new(note)];
        let (events, _) = reconcile(&self.state.events, &note, limit);
        let (new_events, _) = reconcile(&self.state.new_events, &note, None);
        self.state.events = events;
        self.state.new_events = new_events;
        self.changed = true;
    }

    fn on_closed(&mut self, relay: &str, reason: &str) {
        if !is_benign_close(reason) {
            warn!(
                "feed for '{}' closed by {relay}: {reason}",
                self.channel.name
            );
        }
    }
}
