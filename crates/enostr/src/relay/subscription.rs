use crossbeam_channel::{Receiver, Sender, TryIter};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::{Filter, Note};

/// Process-unique id for one live query. Owners use it to tell the
/// messages of their current subscription apart from stale ones.
#[derive(Debug, Hash, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubId(u64);

impl SubId {
    pub fn next() -> Self {
        static UIDS: AtomicU64 = AtomicU64::new(0);
        SubId(UIDS.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubId({})", self.0)
    }
}

/// Everything a subscription can tell its owner.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Pre-steady-state results. `eosed` is set once at least one relay
    /// reached end of stored events. Raw subscriptions deliver stored
    /// events as [`RelayEvent::Item`] and signal EOSE with an empty batch.
    Batch { events: Vec<Note>, eosed: bool },

    /// A single arrival.
    Item(Note),

    /// A relay closed the query.
    Closed { relay: String, reason: String },
}

impl RelayEvent {
    pub fn eose() -> Self {
        RelayEvent::Batch {
            events: Vec::new(),
            eosed: true,
        }
    }

    pub fn dispatch<L: SubscriptionListener + ?Sized>(self, listener: &mut L) {
        match self {
            RelayEvent::Batch { events, eosed } => listener.on_batch(events, eosed),
            RelayEvent::Item(note) => listener.on_item(note),
            RelayEvent::Closed { relay, reason } => listener.on_closed(&relay, &reason),
        }
    }
}

/// Implemented by each kind of subscription owner.
pub trait SubscriptionListener {
    fn on_batch(&mut self, events: Vec<Note>, eosed: bool);
    fn on_item(&mut self, note: Note);
    fn on_closed(&mut self, _relay: &str, _reason: &str) {}
}

#[derive(Debug, Clone)]
pub struct SubMessage {
    pub sub_id: SubId,
    pub event: RelayEvent,
}

/// Transport-side half of a subscription: where a relay transport
/// delivers the callbacks for one [`SubId`].
#[derive(Clone)]
pub struct SubSink {
    sub_id: SubId,
    tx: Sender<SubMessage>,
}

impl fmt::Debug for SubSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubSink")
            .field("sub_id", &self.sub_id)
            .finish()
    }
}

impl SubSink {
    pub fn sub_id(&self) -> SubId {
        self.sub_id
    }

    /// Returns false once the owner's mailbox is gone.
    pub fn send(&self, event: RelayEvent) -> bool {
        let sent = self
            .tx
            .send(SubMessage {
                sub_id: self.sub_id,
                event,
            })
            .is_ok();

        if !sent {
            trace!("dropping event for {}: owner is gone", self.sub_id);
        }

        sent
    }
}

/// Owner-side queue. One mailbox can multiplex many subscriptions;
/// messages are drained on the owner's own tick, never re-entrantly.
pub struct SubMailbox {
    tx: Sender<SubMessage>,
    rx: Receiver<SubMessage>,
}

impl Default for SubMailbox {
    fn default() -> Self {
        SubMailbox::new()
    }
}

impl SubMailbox {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn sink(&self, sub_id: SubId) -> SubSink {
        SubSink {
            sub_id,
            tx: self.tx.clone(),
        }
    }

    pub fn try_iter(&self) -> TryIter<'_, SubMessage> {
        self.rx.try_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

type Closer = Box<dyn FnOnce() + Send + 'static>;

/// An open query against a set of relays. Exclusively owned by whoever
/// opened it. Closing is idempotent and also happens on drop.
pub struct SubscriptionHandle {
    sub_id: SubId,
    relays: Vec<String>,
    filter: Filter,
    closer: Option<Closer>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("sub_id", &self.sub_id)
            .field("relays", &self.relays)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn new(
        sub_id: SubId,
        relays: Vec<String>,
        filter: Filter,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sub_id,
            relays,
            filter,
            closer: Some(Box::new(closer)),
        }
    }

    pub fn sub_id(&self) -> SubId {
        self.sub_id
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn is_open(&self) -> bool {
        self.closer.is_some()
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            debug!("closing {} on {:?}", self.sub_id, self.relays);
            closer();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
