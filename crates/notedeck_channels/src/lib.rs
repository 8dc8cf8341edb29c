mod background;
mod channel;
mod channels;
pub mod config;
pub mod debouncer;
mod discovery;
mod error;
mod feed;
mod ledger;
pub mod storage;
mod store;
pub mod time;
pub mod timeline;
mod unread;

pub use background::BackgroundPool;
pub use channel::{
    channel_filter, effective_relays, extract_hashtags, normalize_hashtags, Channel, ChannelId,
    ChannelInput, ChannelUpdate,
};
pub use channels::Channels;
pub use config::{ChannelsConfig, DiscoveryConfig, SETTINGS_KEY};
pub use discovery::{sync_channels, HashtagDiscovery, HashtagTally};
pub use error::{ChannelError, Error, FilterError};
pub use feed::{
    is_benign_close, ChannelFeed, FeedContext, FeedPhase, FeedState, BENIGN_CLOSE_REASONS,
};
pub use ledger::{SubOwner, SubscriptionLedger};
pub use storage::{DataPath, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use store::{
    activity_key, display_order, last_activity, record_activity, ChannelList, ChannelStore,
    Dismissals, CHANNELS_KEY, DISMISSED_KEY,
};
pub use timeline::{reconcile, MergeKind, TimelineItem};
pub use unread::{events_key, UnreadTracker};

pub type Result<T> = std::result::Result<T, error::Error>;
