mod error;
mod filter;
mod note;
mod relay;

pub use error::Error;
pub use filter::Filter;
pub use note::{Note, NoteId};
pub use relay::mock::{FetchRequest, MockSub, MockTransport};
pub use relay::{
    RelayEvent, RelayTransport, SubId, SubMailbox, SubMessage, SubSink, SubscriptionHandle,
    SubscriptionListener, TimelineOptions, TimelineRequest, TimelineSubscription,
};

pub use poll_promise;

pub type Result<T> = std::result::Result<T, error::Error>;
