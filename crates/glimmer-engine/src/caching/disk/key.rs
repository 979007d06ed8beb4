use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::key::ResourceKey;

use super::DiskTier;

/// The key of an entry in a [`DiskCacheProvider`](super::DiskCacheProvider).
///
/// The key is derived from human-readable (but not necessarily machine-readable) metadata that
/// describes what the entry contains. That metadata is SHA-256 hashed, and equality, hashing and
/// the on-disk path are all based on that hash.
#[derive(Debug, Clone, Eq)]
pub struct DiskCacheKey {
    tier: DiskTier,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for DiskCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.cache_path(1))
    }
}

impl PartialEq for DiskCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for DiskCacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl DiskCacheKey {
    /// The key of the undecoded source bytes for `key`.
    ///
    /// Only the source and the signature contribute, so every size and transformation of the
    /// same source shares one entry.
    pub fn for_data(key: &ResourceKey) -> Self {
        let mut builder = DiskCacheKeyBuilder::new(DiskTier::Data);
        builder.write_source(key);
        builder.build()
    }

    /// The key of the decoded and transformed resource for `key`.
    pub fn for_resource(key: &ResourceKey) -> Self {
        let mut builder = DiskCacheKeyBuilder::new(DiskTier::Resource);
        builder.write_source(key);
        builder.write_variant(key);
        builder.build()
    }

    pub fn tier(&self) -> DiskTier {
        self.tier
    }

    /// Returns the human-readable metadata that forms the basis of the [`DiskCacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(tier: DiskTier, metadata: &str) -> Self {
        let mut builder = DiskCacheKeyBuilder::new(tier);
        builder.metadata.push_str(metadata);
        builder.build()
    }
}

/// A builder for [`DiskCacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
pub struct DiskCacheKeyBuilder {
    tier: DiskTier,
    metadata: String,
}

impl DiskCacheKeyBuilder {
    pub fn new(tier: DiskTier) -> Self {
        Self {
            tier,
            metadata: format!("tier: {tier}\n"),
        }
    }

    /// Writes the source identity of `key`.
    pub fn write_source(&mut self, key: &ResourceKey) {
        self.metadata.push_str("source: ");
        self.metadata.push_str(key.source().as_str());
        self.metadata.push('\n');
        if let Some(signature) = key.signature() {
            self.metadata.push_str("signature: ");
            self.metadata.push_str(signature);
            self.metadata.push('\n');
        }
    }

    /// Writes everything that distinguishes one decoded variant of a source from another.
    pub fn write_variant(&mut self, key: &ResourceKey) {
        let _ = writeln!(self.metadata, "size: {}", key.size());
        let _ = writeln!(self.metadata, "resize: {}", key.resize().as_str());
        let _ = writeln!(self.metadata, "class: {}", key.resource_class());
        for transformation in key.transformations() {
            let _ = writeln!(self.metadata, "transformation: {transformation}");
        }
    }

    /// Finalize the [`DiskCacheKey`].
    pub fn build(self) -> DiskCacheKey {
        let hash = Sha256::digest(&self.metadata);
        DiskCacheKey {
            tier: self.tier,
            metadata: self.metadata.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Write for DiskCacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata() {
        let key = ResourceKey::builder("https://cdn.example/cat.png")
            .size(64, 64)
            .transform("grayscale")
            .transform("rounded")
            .signature("v3")
            .build();

        insta::assert_snapshot!(DiskCacheKey::for_resource(&key).metadata(), @r"
        tier: resource
        source: https://cdn.example/cat.png
        signature: v3
        size: 64x64
        resize: center_outside
        class: image
        transformation: grayscale
        transformation: rounded
        ");
        insta::assert_snapshot!(DiskCacheKey::for_data(&key).metadata(), @r"
        tier: data
        source: https://cdn.example/cat.png
        signature: v3
        ");
    }

    #[test]
    fn test_data_key_is_shared_between_variants() {
        let small = ResourceKey::builder("file:///cat.png").size(10, 10).build();
        let large = ResourceKey::builder("file:///cat.png")
            .size(100, 100)
            .transform("blur")
            .build();

        assert_eq!(DiskCacheKey::for_data(&small), DiskCacheKey::for_data(&large));
        assert_ne!(
            DiskCacheKey::for_resource(&small),
            DiskCacheKey::for_resource(&large)
        );
        assert_ne!(
            DiskCacheKey::for_data(&small),
            DiskCacheKey::for_resource(&small)
        );
    }

    #[test]
    fn test_cache_path_layout() {
        let key = DiskCacheKey::for_testing(DiskTier::Data, "source: a\n");
        let path = key.cache_path(1);
        let segments: Vec<_> = path.split('/').collect();

        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], "v1");
        assert_eq!(segments[1].len(), 2);
        assert_eq!(segments[2].len(), 6);
        assert_eq!(segments[3].len(), 56);
    }
}
