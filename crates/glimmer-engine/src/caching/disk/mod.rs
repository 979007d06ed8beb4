use std::fmt;
use std::io::{self, Write};

use bytes::Bytes;

use crate::key::SourceId;

mod cleanup;
mod fs;
mod key;

pub use cleanup::CleanupStats;
pub use fs::FsDiskCache;
pub use key::{DiskCacheKey, DiskCacheKeyBuilder};

/// The two disk tiers, which only differ in what their entries contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskTier {
    /// Original, undecoded source bytes.
    Data,
    /// Decoded and transformed resources in encoded form.
    Resource,
}

impl DiskTier {
    pub const ALL: [DiskTier; 2] = [DiskTier::Data, DiskTier::Resource];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskTier::Data => "data",
            DiskTier::Resource => "resource",
        }
    }
}

impl AsRef<str> for DiskTier {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for DiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistent store for encoded resources and source bytes.
///
/// Implementations are called from decode workers, potentially concurrently for different keys.
/// A failing `get` is treated like a miss, a failing `put` is logged and otherwise ignored.
pub trait DiskCacheProvider: Send + Sync {
    /// Reads the entry for `key`, if there is one.
    fn get(&self, key: &DiskCacheKey) -> io::Result<Option<Bytes>>;

    /// Stores a new entry for `key`, replacing any previous one.
    ///
    /// The `writer` callback produces the entry contents. Readers must never observe a partially
    /// written entry.
    fn put(
        &self,
        key: &DiskCacheKey,
        writer: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>,
    ) -> io::Result<()>;

    /// Removes the entry for `key`.
    fn delete(&self, _key: &DiskCacheKey) -> io::Result<()> {
        Ok(())
    }
}

/// A [`DiskCacheProvider`] that never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiskCache;

impl DiskCacheProvider for NoDiskCache {
    fn get(&self, _key: &DiskCacheKey) -> io::Result<Option<Bytes>> {
        Ok(None)
    }

    fn put(
        &self,
        _key: &DiskCacheKey,
        _writer: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// Decides which disk tiers a single load reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskCacheStrategy {
    /// Reads both tiers. Writes source bytes of remote sources, and every transformed resource.
    All,
    /// Never touches the disk.
    None,
    /// Only reads and writes the source bytes.
    Data,
    /// Only reads and writes the transformed resource.
    Resource,
    /// Reads both tiers. Writes source bytes of remote sources, and transformed resources of
    /// local sources.
    #[default]
    Automatic,
}

impl DiskCacheStrategy {
    pub fn reads_data(&self) -> bool {
        matches!(self, Self::All | Self::Data | Self::Automatic)
    }

    pub fn reads_resource(&self) -> bool {
        matches!(self, Self::All | Self::Resource | Self::Automatic)
    }

    /// Whether bytes fetched from `source` are persisted to the data tier.
    pub fn writes_data(&self, source: &SourceId) -> bool {
        match self {
            Self::All | Self::Automatic => !source.is_local(),
            Self::Data => true,
            Self::None | Self::Resource => false,
        }
    }

    /// Whether a resource decoded from `source` is persisted to the resource tier.
    pub fn writes_resource(&self, source: &SourceId) -> bool {
        match self {
            Self::All | Self::Resource => true,
            Self::Automatic => source.is_local(),
            Self::None | Self::Data => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy() {
        let local = SourceId::new("file:///cat.png");
        let remote = SourceId::new("https://cdn.example/cat.png");

        let auto = DiskCacheStrategy::Automatic;
        assert!(auto.reads_data() && auto.reads_resource());
        assert!(auto.writes_data(&remote));
        assert!(!auto.writes_data(&local));
        assert!(auto.writes_resource(&local));
        assert!(!auto.writes_resource(&remote));

        let all = DiskCacheStrategy::All;
        assert!(all.writes_resource(&remote) && all.writes_data(&remote));
        assert!(!all.writes_data(&local));

        let none = DiskCacheStrategy::None;
        assert!(!none.reads_data() && !none.reads_resource());
        assert!(!none.writes_data(&remote) && !none.writes_resource(&local));

        let data = DiskCacheStrategy::Data;
        assert!(data.reads_data() && !data.reads_resource());
        assert!(data.writes_data(&local) && !data.writes_resource(&local));

        let resource = DiskCacheStrategy::Resource;
        assert!(!resource.reads_data() && resource.reads_resource());
        assert!(!resource.writes_data(&remote) && resource.writes_resource(&remote));
    }
}
