use crate::channel_id::ChannelId;
use crate::records::ChannelRecord;

/// Persistent mapping from channel id to its record.
///
/// Adding is distinct from updating so a store can refuse to silently overwrite a channel it
/// has never seen. Expiry handling is layered on top (see [`crate::watcher`]); the store itself
/// only persists.
pub trait ChannelStore<R: ChannelRecord> {
    fn add_channel(&mut self, record: &R) -> Result<(), anyhow::Error>;
    fn update_channel(&mut self, record: &R) -> Result<(), anyhow::Error>;
    fn remove_channel(&mut self, id: &ChannelId) -> Result<(), anyhow::Error>;
    fn load_channel(&self, id: &ChannelId) -> Result<R, anyhow::Error>;
    fn channel_ids(&self) -> Result<Vec<ChannelId>, anyhow::Error>;
}
