use std::fmt;

use enostr::{Filter, Note};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, FilterError};

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A named feed over one or more hashtags.
///
/// Field names follow the persisted layout: camelCase except for the two
/// record timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Lowercase, without `#`, OR-matched.
    pub hashtags: Vec<String>,

    /// Empty means "use the default relays".
    #[serde(default)]
    pub relay_urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// Unix millis
    #[serde(rename = "created_at")]
    pub created_at: u64,

    /// Unix millis
    #[serde(rename = "updated_at")]
    pub updated_at: u64,

    #[serde(default)]
    pub order: u32,

    #[serde(default)]
    pub unread_count: u32,

    /// Unix millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<u64>,

    #[serde(default)]
    pub muted: bool,

    #[serde(default)]
    pub auto_discovered: bool,

    /// Occurrences seen by discovery. Only set on auto-discovered
    /// channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_count: Option<u64>,
}

impl Channel {
    /// Read marker in unix millis. Channels never opened count from
    /// their creation.
    pub fn read_marker(&self) -> u64 {
        self.last_read_at.unwrap_or(self.created_at)
    }

    /// Case-insensitive OR match between the note's `t` tags and ours.
    pub fn matches(&self, note: &Note) -> bool {
        note.hashtags().any(|tag| {
            self.hashtags
                .iter()
                .any(|ours| ours.eq_ignore_ascii_case(tag))
        })
    }

    /// The single hashtag an auto-discovered channel was made for.
    pub fn discovered_hashtag(&self) -> Option<String> {
        if !self.auto_discovered {
            return None;
        }
        self.hashtags.first().map(|h| h.to_lowercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInput {
    pub name: String,
    pub description: Option<String>,
    pub hashtags: Vec<String>,
    pub relay_urls: Vec<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub muted: bool,
}

impl ChannelInput {
    pub fn new(
        name: impl Into<String>,
        hashtags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            hashtags: hashtags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn relays(mut self, relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relay_urls = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn into_channel(self, order: u32, now_ms: u64) -> Result<Channel, ChannelError> {
        let hashtags = normalize_hashtags(&self.hashtags);
        if hashtags.is_empty() {
            return Err(ChannelError::EmptyHashtags);
        }

        Ok(Channel {
            id: ChannelId::generate(),
            name: self.name,
            description: self.description,
            hashtags,
            relay_urls: self.relay_urls,
            icon: self.icon,
            color: self.color,
            created_at: now_ms,
            updated_at: now_ms,
            order,
            unread_count: 0,
            last_read_at: Some(now_ms),
            muted: self.muted,
            auto_discovered: false,
            event_count: None,
        })
    }
}

/// A partial edit. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub hashtags: Option<Vec<String>>,
    pub relay_urls: Option<Vec<String>>,
    pub icon: Option<Option<String>>,
    pub color: Option<Option<String>>,
    pub muted: Option<bool>,
    pub last_read_at: Option<u64>,
}

impl ChannelUpdate {
    pub(crate) fn apply(self, channel: &mut Channel, now_ms: u64) -> Result<(), ChannelError> {
        if let Some(hashtags) = &self.hashtags {
            let hashtags = normalize_hashtags(hashtags);
            if hashtags.is_empty() {
                return Err(ChannelError::EmptyHashtags);
            }
            channel.hashtags = hashtags;
        }

        if let Some(name) = self.name {
            channel.name = name;
        }
        if let Some(description) = self.description {
            channel.description = description;
        }
        if let Some(relay_urls) = self.relay_urls {
            channel.relay_urls = relay_urls;
        }
        if let Some(icon) = self.icon {
            channel.icon = icon;
        }
        if let Some(color) = self.color {
            channel.color = color;
        }
        if let Some(muted) = self.muted {
            channel.muted = muted;
        }
        if let Some(last_read_at) = self.last_read_at {
            channel.last_read_at = Some(last_read_at);
        }

        channel.updated_at = now_ms;
        Ok(())
    }
}

/// Trim, drop one leading `#`, lowercase, drop empties, dedupe keeping
/// the first occurrence.
pub fn normalize_hashtags<S: AsRef<str>>(hashtags: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hashtags.len());
    for tag in hashtags {
        let tag = tag.as_ref().trim();
        let tag = tag.strip_prefix('#').unwrap_or(tag).to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

pub fn effective_relays<'a>(channel: &'a Channel, defaults: &'a [String]) -> &'a [String] {
    if channel.relay_urls.is_empty() {
        defaults
    } else {
        &channel.relay_urls
    }
}

pub fn channel_filter(
    channel: &Channel,
    kinds: &[u64],
    limit: Option<u64>,
    since: Option<u64>,
    until: Option<u64>,
) -> Result<Filter, FilterError> {
    if channel.hashtags.is_empty() {
        return Err(FilterError::EmptyHashtags);
    }

    let mut filter = Filter::new()
        .hashtags(channel.hashtags.iter().cloned())
        .kinds(kinds.iter().copied());

    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    if let Some(since) = since {
        filter = filter.since(since);
    }
    if let Some(until) = until {
        filter = filter.until(until);
    }

    Ok(filter)
}

static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([a-zA-Z0-9_]+)").expect("hashtag pattern"));

/// Inline `#tags` in note content, lowercased, in order of first
/// appearance.
pub fn extract_hashtags(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in HASHTAG_RE.captures_iter(content) {
        let tag = cap[1].to_lowercase();
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel(hashtags: &[&str], relays: &[&str]) -> Channel {
        ChannelInput::new("test", hashtags.iter().copied())
            .relays(relays.iter().copied())
            .into_channel(0, 1_000)
            .unwrap()
    }

    #[test]
    fn normalizes_hashtags() {
        let tags = normalize_hashtags(&[" #Bitcoin", "nostr", "#bitcoin", "", "#", "##x"]);
        assert_eq!(tags, vec!["bitcoin", "nostr", "#x"]);
    }

    #[test]
    fn input_without_hashtags_is_rejected() {
        let err = ChannelInput::new("empty", ["#", "  "])
            .into_channel(0, 0)
            .unwrap_err();
        assert_eq!(err, ChannelError::EmptyHashtags);
    }

    #[test]
    fn update_keeps_hashtags_non_empty() {
        let mut ch = channel(&["rust"], &[]);
        let update = ChannelUpdate {
            hashtags: Some(vec!["#".to_owned()]),
            name: Some("renamed".to_owned()),
            ..Default::default()
        };

        assert_eq!(update.apply(&mut ch, 2_000), Err(ChannelError::EmptyHashtags));
        assert_eq!(ch.name, "test");
        assert_eq!(ch.updated_at, 1_000);
    }

    #[test]
    fn effective_relays_fall_back_to_defaults() {
        let defaults = vec!["wss://default".to_owned()];
        let own = channel(&["rust"], &["wss://own"]);
        let none = channel(&["rust"], &[]);

        assert_eq!(effective_relays(&own, &defaults), ["wss://own".to_owned()]);
        assert_eq!(effective_relays(&none, &defaults), defaults.as_slice());
    }

    #[test]
    fn filter_uses_hashtags_and_kinds() {
        let ch = channel(&["bitcoin", "btc"], &[]);
        let filter = channel_filter(&ch, &[1, 42], Some(200), None, Some(99)).unwrap();
        assert_eq!(
            filter.json().unwrap(),
            r##"{"kinds":[1,42],"#t":["bitcoin","btc"],"until":99,"limit":200}"##
        );

        let mut empty = ch.clone();
        empty.hashtags.clear();
        assert_eq!(
            channel_filter(&empty, &[1], None, None, None),
            Err(FilterError::EmptyHashtags)
        );
    }

    #[test]
    fn matches_tags_case_insensitively() {
        let ch = channel(&["nostr"], &[]);
        let tagged = |tag: &str| {
            Note::new("id", "pk", 1, 1, vec![vec!["t".to_owned(), tag.to_owned()]], "")
        };

        assert!(ch.matches(&tagged("NOSTR")));
        assert!(!ch.matches(&tagged("nostrich")));
        assert!(!ch.matches(&Note::new("id", "pk", 1, 1, vec![], "#nostr")));
    }

    #[test]
    fn extracts_inline_hashtags() {
        assert_eq!(
            extract_hashtags("gm #Nostr and #bitcoin, again #nostr #_x1 # no"),
            vec!["nostr", "bitcoin", "_x1"]
        );
    }

    #[test]
    fn persisted_layout() {
        let ch = channel(&["rust"], &[]);
        let json = serde_json::to_value(&ch).unwrap();

        assert_eq!(json["created_at"], 1_000);
        assert_eq!(json["lastReadAt"], 1_000);
        assert_eq!(json["relayUrls"], serde_json::json!([]));
        assert!(json.get("eventCount").is_none());

        let back: Channel = serde_json::from_value(json).unwrap();
        assert_eq!(back, ch);
    }
}
