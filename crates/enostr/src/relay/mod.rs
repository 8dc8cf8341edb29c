use poll_promise::Promise;

use crate::{Filter, Note, Result};

pub mod mock;
pub mod subscription;

pub use subscription::{
    RelayEvent, SubId, SubMailbox, SubMessage, SubSink, SubscriptionHandle, SubscriptionListener,
};

/// One relay target of a timeline subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRequest {
    pub urls: Vec<String>,
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineOptions {
    /// Ask the transport to sort batches before delivering them.
    pub need_sort: bool,
}

/// An established timeline subscription.
#[derive(Debug)]
pub struct TimelineSubscription {
    pub handle: SubscriptionHandle,
    pub timeline_key: String,
}

/// The relay transport, consumed through this seam only. Connection
/// management, reconnection and message framing live behind it.
///
/// Callbacks are never invoked synchronously on the caller: they are
/// queued on the [`SubSink`] and drained by the owner.
pub trait RelayTransport {
    /// Raw subscription. Stored and live events arrive as
    /// [`RelayEvent::Item`]; EOSE arrives as an empty batch.
    fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
        sink: SubSink,
    ) -> Result<SubscriptionHandle>;

    /// Aggregates several relay targets into one ordered stream:
    /// [`RelayEvent::Batch`] until steady state, then [`RelayEvent::Item`].
    fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        sink: SubSink,
        options: TimelineOptions,
    ) -> Promise<Result<TimelineSubscription>>;

    /// One-shot historical query.
    fn fetch_events(&self, relays: &[String], filter: Filter) -> Promise<Result<Vec<Note>>>;
}
