use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{self, KeyValueStore};

pub const SETTINGS_KEY: &str = "channels-settings";

fn default_kinds() -> Vec<u64> {
    vec![1, 42, 6, 7]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Used for channels that have no relays of their own.
    pub default_relays: Vec<String>,

    /// Consumer-side kind filter applied to everything shown in a feed.
    pub show_kinds: Vec<u64>,

    /// Kinds requested from relays for channel feeds.
    pub channel_kinds: Vec<u64>,

    pub feed_limit: u64,
    pub page_limit: u64,
    pub background_limit: u64,

    pub unread_refresh_secs: u64,
    pub unread_cap: usize,

    pub discovery: Option<DiscoveryConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            default_relays: vec![],
            show_kinds: default_kinds(),
            channel_kinds: default_kinds(),
            feed_limit: 200,
            page_limit: 100,
            background_limit: 50,
            unread_refresh_secs: 10,
            unread_cap: 1000,
            discovery: None,
        }
    }
}

impl ChannelsConfig {
    /// Load from the settings key, falling back to defaults when the
    /// stored value is missing or invalid.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match storage::load::<Self>(store, SETTINGS_KEY) {
            Some(config) => config,
            None => {
                warn!("no usable channel settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) {
        storage::save(store, SETTINGS_KEY, self);
    }

    pub fn shows_kind(&self, kind: u64) -> bool {
        self.show_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub relay: String,
    pub kinds: Vec<u64>,
    pub limit: u64,
    pub quiet_period_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            relay: String::new(),
            kinds: vec![1, 42],
            limit: 500,
            quiet_period_ms: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn new(relay: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            ..Default::default()
        }
    }
}
