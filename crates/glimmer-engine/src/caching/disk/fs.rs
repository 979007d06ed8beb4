use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig};

use super::{DiskCacheKey, DiskCacheProvider, DiskTier};

/// The version of the on-disk layout.
///
/// Entries written with a different version are never read and are removed by
/// [`cleanup`](FsDiskCache::cleanup) once they expire.
pub(super) const CACHE_VERSION: u32 = 1;

/// The interval in which cache entries should be touched.
///
/// Entries use a "time to idle" instead of "time to live" mode. We thus need to regularly
/// "touch" the files to signal that they are still in use. This is being debounced to once
/// every hour to not have to touch them on every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// The cleanup process could potentially remove the parent directories we are operating in,
/// so fs operations are retried this many times.
const MAX_RETRIES: usize = 2;

/// A [`DiskCacheProvider`] that stores each entry as a file below a cache directory.
///
/// The layout is `<cache_dir>/<tier>/v<version>/aa/bbccdd/eeff...`, see
/// [`DiskCacheKey::cache_path`]. New entries are written to a temporary file in
/// `<cache_dir>/tmp` first and then atomically moved into place.
#[derive(Debug, Clone)]
pub struct FsDiskCache {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    pub(super) config: DiskCacheConfig,
}

impl FsDiskCache {
    pub fn new(cache_dir: impl Into<PathBuf>, config: DiskCacheConfig) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        let tmp_dir = cache_dir.join("tmp");

        for tier in DiskTier::ALL {
            fs::create_dir_all(cache_dir.join(tier.as_str()))?;
        }
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            config,
        })
    }

    /// Creates the disk cache configured in `config`, if a cache directory is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match config.cache_dir {
            Some(ref dir) => Self::new(dir, config.caches.disk).map(Some),
            None => Ok(None),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub(super) fn tier_dir(&self, tier: DiskTier) -> PathBuf {
        self.cache_dir.join(tier.as_str())
    }

    /// The absolute path of the file backing `key`.
    pub fn path_for(&self, key: &DiskCacheKey) -> PathBuf {
        self.tier_dir(key.tier()).join(key.cache_path(CACHE_VERSION))
    }

    /// Clear the temporary files.
    ///
    /// This should be done on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Whether an entry last used at `mtime` is past its retention.
    pub(super) fn is_expired(&self, mtime: SystemTime) -> bool {
        let max_unused_for = self.config.max_unused_for.unwrap_or(Duration::MAX);
        mtime.elapsed().unwrap_or_default() > max_unused_for
    }

    fn read_entry(&self, path: &Path) -> io::Result<Bytes> {
        // We use `mtime` to keep track of "cache last used", because literally every other
        // filesystem attribute is unreliable.
        let metadata = path.metadata()?;
        let mtime = metadata.modified()?;
        if self.is_expired(mtime) {
            return Err(io::ErrorKind::NotFound.into());
        }

        let contents = fs::read(path)?;
        tracing::trace!("File `{}` length: {}", path.display(), contents.len());

        if mtime.elapsed().unwrap_or_default() >= TOUCH_EVERY {
            filetime::set_file_mtime(path, FileTime::now())?;
        }

        Ok(Bytes::from(contents))
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create cache directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp_dir) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create cache file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl DiskCacheProvider for FsDiskCache {
    fn get(&self, key: &DiskCacheKey) -> io::Result<Option<Bytes>> {
        let path = self.path_for(key);
        // `NotFound` can be returned from multiple locations, all of those indicate a cache miss
        // as cleanup can run in between.
        let entry = catch_not_found(|| self.read_entry(&path))?;

        match entry {
            Some(_) => metric!(counter("caches.disk.hit") += 1, "tier" => key.tier().as_str()),
            None => metric!(counter("caches.disk.miss") += 1, "tier" => key.tier().as_str()),
        }
        Ok(entry)
    }

    fn put(
        &self,
        key: &DiskCacheKey,
        writer: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut temp_file = self.tempfile()?;
        {
            let mut file = BufWriter::new(temp_file.as_file_mut());
            writer(&mut file)?;
            file.flush()?;
        }

        let path = self.path_for(key);
        persist_tempfile(temp_file, &path)?;

        tracing::trace!(%key, path = %path.display(), "Persisted disk cache entry");
        metric!(counter("caches.disk.write") += 1, "tier" => key.tier().as_str());
        Ok(())
    }

    fn delete(&self, key: &DiskCacheKey) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.path_for(key)))?;
        Ok(())
    }
}

/// Moves a fully written temp file to its final location, creating parent directories.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "Failed to persist cache file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
