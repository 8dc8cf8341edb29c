use enostr::{SubId, SubscriptionHandle};
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::channel::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubOwner {
    /// The feed of the active channel.
    Foreground,
    /// Unread watch of an inactive channel.
    Background,
}

#[derive(Debug)]
struct Entry {
    owner: SubOwner,
    handle: SubscriptionHandle,
}

/// Every live channel subscription, keyed by channel. At most one
/// handle per channel exists at a time: installing a new one closes
/// whatever was there, whoever owned it.
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    entries: HashMap<ChannelId, Entry>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the owner of the handle that was displaced, if any.
    pub fn install(
        &mut self,
        channel: ChannelId,
        owner: SubOwner,
        handle: SubscriptionHandle,
    ) -> Option<SubOwner> {
        debug!(
            "{:?} {} installed for channel {}",
            owner,
            handle.sub_id(),
            channel.short()
        );

        let previous = self.entries.insert(channel.clone(), Entry { owner, handle });
        previous.map(|mut prev| {
            if prev.owner != owner {
                info!(
                    "closing {:?} subscription for channel {}: taken over by {:?}",
                    prev.owner,
                    channel.short(),
                    owner
                );
            }
            prev.handle.close();
            prev.owner
        })
    }

    /// Close the channel's subscription if `owner` holds it.
    pub fn release(&mut self, channel: &ChannelId, owner: SubOwner) -> bool {
        if self.owner(channel) != Some(owner) {
            return false;
        }

        if let Some(mut entry) = self.entries.remove(channel) {
            debug!(
                "{:?} {} released for channel {}",
                owner,
                entry.handle.sub_id(),
                channel.short()
            );
            entry.handle.close();
        }
        true
    }

    /// Close every subscription held by `owner`.
    pub fn release_all(&mut self, owner: SubOwner) -> usize {
        let channels = self.channels(owner);
        for channel in &channels {
            self.release(channel, owner);
        }
        channels.len()
    }

    pub fn owner(&self, channel: &ChannelId) -> Option<SubOwner> {
        self.entries.get(channel).map(|e| e.owner)
    }

    pub fn sub_id(&self, channel: &ChannelId) -> Option<SubId> {
        self.entries.get(channel).map(|e| e.handle.sub_id())
    }

    pub fn relays(&self, channel: &ChannelId) -> Option<&[String]> {
        self.entries.get(channel).map(|e| e.handle.relays())
    }

    /// Which channel a live subscription belongs to.
    pub fn channel_for(&self, sub_id: SubId) -> Option<(&ChannelId, SubOwner)> {
        self.entries
            .iter()
            .find(|(_, e)| e.handle.sub_id() == sub_id)
            .map(|(id, e)| (id, e.owner))
    }

    pub fn channels(&self, owner: SubOwner) -> Vec<ChannelId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self, owner: SubOwner) -> usize {
        self.entries.values().filter(|e| e.owner == owner).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
