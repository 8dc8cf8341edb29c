//! In-memory [`RelayTransport`] for tests and offline use.
//!
//! Every subscription is recorded. Tests drive callbacks explicitly
//! with [`MockTransport::send`], [`MockTransport::publish`] and
//! [`MockTransport::eose`], and can defer or fail establishment and
//! page fetches to exercise the asynchronous paths.

use poll_promise::{Promise, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::relay::{
    RelayEvent, RelayTransport, SubId, SubSink, SubscriptionHandle, TimelineOptions,
    TimelineRequest, TimelineSubscription,
};
use crate::{Error, Filter, Note, Result};

/// What the mock knows about one subscription.
#[derive(Debug, Clone)]
pub struct MockSub {
    pub sub_id: SubId,
    pub relays: Vec<String>,
    pub filter: Filter,
    pub timeline: bool,
    open: Arc<AtomicBool>,
}

impl MockSub {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub relays: Vec<String>,
    pub filter: Filter,
}

type TimelineSender = Sender<Result<TimelineSubscription>>;

#[derive(Default)]
struct MockState {
    subs: Vec<(MockSub, SubSink)>,
    fetches: Vec<FetchRequest>,
    fetch_results: VecDeque<Result<Vec<Note>>>,
    deferred_fetches: Vec<Sender<Result<Vec<Note>>>>,
    defer_fetches: bool,
    deferred_timelines: Vec<(TimelineSender, TimelineSubscription)>,
    defer_timelines: bool,
    fail_timelines: Option<String>,
    fail_subscribe: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        relays: &[String],
        filter: Filter,
        sink: SubSink,
        timeline: bool,
    ) -> SubscriptionHandle {
        let open = Arc::new(AtomicBool::new(true));
        let sub = MockSub {
            sub_id: sink.sub_id(),
            relays: relays.to_vec(),
            filter: filter.clone(),
            timeline,
            open: open.clone(),
        };
        debug!("mock: opened {} on {:?}", sub.sub_id, relays);
        self.state().subs.push((sub, sink.clone()));

        SubscriptionHandle::new(sink.sub_id(), relays.to_vec(), filter, move || {
            open.store(false, Ordering::SeqCst);
        })
    }

    /// All subscriptions ever opened, in order.
    pub fn subs(&self) -> Vec<MockSub> {
        self.state().subs.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn open_subs(&self) -> Vec<MockSub> {
        self.subs().into_iter().filter(|s| s.is_open()).collect()
    }

    pub fn sub(&self, sub_id: SubId) -> Option<MockSub> {
        self.subs().into_iter().find(|s| s.sub_id == sub_id)
    }

    /// Deliver an event to one subscription, open or not.
    pub fn send(&self, sub_id: SubId, event: RelayEvent) -> bool {
        let sink = self
            .state()
            .subs
            .iter()
            .find(|(s, _)| s.sub_id == sub_id)
            .map(|(_, sink)| sink.clone());

        sink.is_some_and(|sink| sink.send(event))
    }

    pub fn eose(&self, sub_id: SubId) -> bool {
        self.send(sub_id, RelayEvent::eose())
    }

    /// Deliver `note` as a live arrival to every open subscription whose
    /// filter matches it. Returns how many received it.
    pub fn publish(&self, note: &Note) -> usize {
        let sinks: Vec<SubSink> = self
            .state()
            .subs
            .iter()
            .filter(|(s, _)| s.is_open() && s.filter.matches(note))
            .map(|(_, sink)| sink.clone())
            .collect();

        sinks
            .into_iter()
            .filter(|sink| sink.send(RelayEvent::Item(note.clone())))
            .count()
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.state().fetches.clone()
    }

    pub fn push_fetch_result(&self, result: Result<Vec<Note>>) {
        self.state().fetch_results.push_back(result);
    }

    pub fn set_defer_fetches(&self, defer: bool) {
        self.state().defer_fetches = defer;
    }

    /// Resolve deferred fetches in order with the queued results.
    pub fn resolve_fetches(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.deferred_fetches);
        for sender in pending {
            let result = state.fetch_results.pop_front().unwrap_or_else(|| Ok(vec![]));
            sender.send(result);
        }
    }

    pub fn set_defer_timelines(&self, defer: bool) {
        self.state().defer_timelines = defer;
    }

    pub fn resolve_timelines(&self) {
        let pending = std::mem::take(&mut self.state().deferred_timelines);
        for (sender, sub) in pending {
            sender.send(Ok(sub));
        }
    }

    pub fn fail_timelines(&self, reason: Option<&str>) {
        self.state().fail_timelines = reason.map(str::to_owned);
    }

    /// Reject raw subscriptions that target `relay`.
    pub fn fail_subscribe_on(&self, relay: &str) {
        self.state().fail_subscribe.push(relay.to_owned());
    }
}

impl RelayTransport for MockTransport {
    fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
        sink: SubSink,
    ) -> Result<SubscriptionHandle> {
        let rejected = {
            let state = self.state();
            relays.iter().find(|r| state.fail_subscribe.contains(r)).cloned()
        };

        if let Some(relay) = rejected {
            return Err(Error::transport(format!("could not reach {relay}")));
        }

        Ok(self.register(relays, filter, sink, false))
    }

    fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        sink: SubSink,
        _options: TimelineOptions,
    ) -> Promise<Result<TimelineSubscription>> {
        if let Some(reason) = self.state().fail_timelines.clone() {
            return Promise::from_ready(Err(Error::Transport(reason)));
        }

        let mut relays: Vec<String> = Vec::new();
        for url in requests.iter().flat_map(|r| r.urls.iter()) {
            if !relays.contains(url) {
                relays.push(url.clone());
            }
        }
        let filter = requests
            .first()
            .map(|r| r.filter.clone())
            .unwrap_or_default();

        let timeline_key = format!("timeline-{}", sink.sub_id().as_u64());
        let handle = self.register(&relays, filter, sink, true);
        let sub = TimelineSubscription {
            handle,
            timeline_key,
        };

        let mut state = self.state();
        if state.defer_timelines {
            let (sender, promise) = Promise::new();
            state.deferred_timelines.push((sender, sub));
            promise
        } else {
            Promise::from_ready(Ok(sub))
        }
    }

    fn fetch_events(&self, relays: &[String], filter: Filter) -> Promise<Result<Vec<Note>>> {
        let mut state = self.state();
        state.fetches.push(FetchRequest {
            relays: relays.to_vec(),
            filter,
        });

        if state.defer_fetches {
            let (sender, promise) = Promise::new();
            state.deferred_fetches.push(sender);
            return promise;
        }

        let result = state.fetch_results.pop_front().unwrap_or_else(|| Ok(vec![]));
        Promise::from_ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{SubMailbox, SubscriptionListener};

    #[derive(Default)]
    struct Items(Vec<String>);

    impl SubscriptionListener for Items {
        fn on_batch(&mut self, _events: Vec<Note>, _eosed: bool) {}

        fn on_item(&mut self, note: Note) {
            self.0.push(note.id.to_string());
        }
    }

    fn tagged(id: &str, tag: &str) -> Note {
        Note::new(id, "pk", 10, 1, vec![vec!["t".to_owned(), tag.to_owned()]], "")
    }

    #[test]
    fn publish_routes_by_filter_and_respects_close() {
        let transport = MockTransport::new();
        let mailbox = SubMailbox::new();
        let relays = vec!["wss://relay.example".to_owned()];

        let rust_id = SubId::next();
        let mut rust = transport
            .subscribe(
                &relays,
                Filter::new().hashtags(["rust".to_owned()]),
                mailbox.sink(rust_id),
            )
            .unwrap();
        let _zig = transport
            .subscribe(
                &relays,
                Filter::new().hashtags(["zig".to_owned()]),
                mailbox.sink(SubId::next()),
            )
            .unwrap();

        assert_eq!(transport.publish(&tagged("a", "rust")), 1);
        rust.close();
        assert_eq!(transport.publish(&tagged("b", "rust")), 0);
        assert!(!transport.sub(rust_id).unwrap().is_open());

        let mut items = Items::default();
        for msg in mailbox.try_iter() {
            msg.event.dispatch(&mut items);
        }
        assert_eq!(items.0, vec!["a"]);
    }

    #[test]
    fn deferred_fetch_resolves_with_queued_result() {
        let transport = MockTransport::new();
        transport.set_defer_fetches(true);
        transport.push_fetch_result(Ok(vec![tagged("x", "t")]));

        let promise = transport.fetch_events(&[], Filter::new());
        assert!(promise.ready().is_none());

        transport.resolve_fetches();
        let notes = promise.block_and_take().unwrap();
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn rejects_subscribe_on_failing_relay() {
        let transport = MockTransport::new();
        transport.fail_subscribe_on("wss://down");
        let mailbox = SubMailbox::new();
        let res = transport.subscribe(
            &["wss://down".to_owned()],
            Filter::new(),
            mailbox.sink(SubId::next()),
        );
        assert!(matches!(res, Err(Error::Transport(_))));
    }
}
