use crate::channel_id::ChannelId;
use crate::records::ChannelRecord;
use crate::storage::traits::ChannelStore;
use anyhow::Context;
use ron::ser::PrettyConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;

/// A file-based channel store.
///
/// Each channel is saved in a file named after the hex encoded channel id, e.g.
/// `6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000.ron`
pub struct FileStore<R> {
    path: PathBuf,
    _record: PhantomData<R>,
}

impl<R> FileStore<R> {
    /// Creates a new file store rooted at `path`, creating the directory if needed.
    pub fn new(path: PathBuf) -> Result<Self, std::io::Error> {
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(Self { path, _record: PhantomData })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn file_for(&self, id: &ChannelId) -> PathBuf {
        self.path.join(format!("{}.ron", hex::encode(id.as_bytes())))
    }
}

impl<R> FileStore<R>
where
    R: ChannelRecord + Serialize,
{
    fn write(&self, record: &R) -> Result<(), anyhow::Error> {
        let file_path = self.file_for(record.channel_id());
        let config = PrettyConfig::new();
        let val = ron::ser::to_string_pretty(record, config)?;
        fs::write(&file_path, &val)
            .with_context(|| format!("writing channel record {}", record.record_name()))?;
        Ok(())
    }
}

impl<R> ChannelStore<R> for FileStore<R>
where
    R: ChannelRecord + Serialize + DeserializeOwned,
{
    fn add_channel(&mut self, record: &R) -> Result<(), anyhow::Error> {
        if self.file_for(record.channel_id()).exists() {
            anyhow::bail!("channel {} is already stored", record.record_name());
        }
        self.write(record)
    }

    fn update_channel(&mut self, record: &R) -> Result<(), anyhow::Error> {
        if !self.file_for(record.channel_id()).exists() {
            anyhow::bail!("channel {} is not stored", record.record_name());
        }
        self.write(record)
    }

    fn remove_channel(&mut self, id: &ChannelId) -> Result<(), anyhow::Error> {
        fs::remove_file(self.file_for(id))
            .with_context(|| format!("removing channel record {}", id.name()))
    }

    fn load_channel(&self, id: &ChannelId) -> Result<R, anyhow::Error> {
        let val = fs::read_to_string(self.file_for(id))
            .with_context(|| format!("reading channel record {}", id.name()))?;
        let record: R = ron::de::from_str(&val)?;
        Ok(record)
    }

    fn channel_ids(&self) -> Result<Vec<ChannelId>, anyhow::Error> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let mut bytes = [0u8; 32];
            if hex::decode_to_slice(stem, &mut bytes).is_ok() {
                ids.push(ChannelId::from_bytes(bytes));
            }
        }
        Ok(ids)
    }
}
