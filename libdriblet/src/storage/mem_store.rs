use crate::channel_id::ChannelId;
use crate::records::ChannelRecord;
use crate::storage::traits::ChannelStore;
use std::collections::HashMap;

/// An in-memory channel store for tests and ephemeral hosts.
pub struct MemoryStore<R> {
    channels: HashMap<ChannelId, R>,
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> MemoryStore<R> {
    pub fn new() -> Self {
        Self { channels: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl<R> ChannelStore<R> for MemoryStore<R>
where
    R: ChannelRecord + Clone,
{
    fn add_channel(&mut self, record: &R) -> Result<(), anyhow::Error> {
        if self.channels.contains_key(record.channel_id()) {
            anyhow::bail!("channel {} is already stored", record.record_name());
        }
        self.channels.insert(*record.channel_id(), record.clone());
        Ok(())
    }

    fn update_channel(&mut self, record: &R) -> Result<(), anyhow::Error> {
        match self.channels.get_mut(record.channel_id()) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => anyhow::bail!("channel {} is not stored", record.record_name()),
        }
    }

    fn remove_channel(&mut self, id: &ChannelId) -> Result<(), anyhow::Error> {
        self.channels
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("channel {} is not stored", id.name()))
    }

    fn load_channel(&self, id: &ChannelId) -> Result<R, anyhow::Error> {
        self.channels
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("channel {} is not stored", id.name()))
    }

    fn channel_ids(&self) -> Result<Vec<ChannelId>, anyhow::Error> {
        Ok(self.channels.keys().copied().collect())
    }
}
