use std::fs::{read_dir, remove_dir, remove_file};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;

use super::fs::catch_not_found;
use super::{DiskTier, FsDiskCache};

/// What a [`FsDiskCache::cleanup`] run removed and retained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl AddAssign for CleanupStats {
    fn add_assign(&mut self, other: Self) {
        self.removed_dirs += other.removed_dirs;
        self.removed_files += other.removed_files;
        self.removed_bytes += other.removed_bytes;
        self.retained_dirs += other.retained_dirs;
        self.retained_files += other.retained_files;
        self.retained_bytes += other.retained_bytes;
    }
}

/// A file that survived the expiry pass and is a candidate for the size budget.
struct RetainedFile {
    path: PathBuf,
    mtime: SystemTime,
    size: u64,
}

impl FsDiskCache {
    /// Cleans up both disk tiers based on configured retention.
    ///
    /// Entries not used for longer than `max_unused_for` are removed first. If a tier still
    /// exceeds `max_size` afterwards, its least recently used entries are removed until it fits.
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        let mut total = CleanupStats::default();
        let mut first_error = None;

        // Collect errors so we can fail the entire function, but attempt to clean up every tier.
        for tier in DiskTier::ALL {
            match self.cleanup_tier(tier, dry_run) {
                Ok(stats) => total += stats,
                Err(err) => {
                    let stderr: &dyn std::error::Error = &*err;
                    tracing::error!(stderr, %tier, "Failed to cleanup disk cache tier");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    fn cleanup_tier(&self, tier: DiskTier, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up `{tier}` disk cache");
        let mut stats = CleanupStats::default();
        let mut retained = Vec::new();
        self.cleanup_directory_recursive(&self.tier_dir(tier), &mut stats, &mut retained, dry_run)?;

        if let Some(max_size) = self.config.max_size {
            enforce_max_size(max_size, retained, &mut stats, dry_run);
        }

        tracing::info!("Cleaning up `{tier}` complete");
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.disk.size.files") = stats.retained_files as u64, "tier" => tier.as_str());
        metric!(gauge("caches.disk.size.bytes") = stats.retained_bytes, "tier" => tier.as_str());
        metric!(counter("caches.disk.size.files_removed") += stats.removed_files as i64, "tier" => tier.as_str());
        metric!(counter("caches.disk.size.bytes_removed") += stats.removed_bytes as i64, "tier" => tier.as_str());

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        retained: &mut Vec<RetainedFile>,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty =
                    self.cleanup_directory_recursive(&path, stats, retained, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            tracing::error!(
                                error = &e as &dyn std::error::Error,
                                path = %path.display(),
                                "Failed to clean cache directory",
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, retained, dry_run) {
                    Err(e) => {
                        let stderr: &dyn std::error::Error = &*e;
                        tracing::error!(stderr, path = %path.display(), "Failed to clean cache file");
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        retained: &mut Vec<RetainedFile>,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();
        let mtime = metadata.modified()?;

        if self.is_expired(mtime) {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }

        stats.retained_bytes += size;
        stats.retained_files += 1;
        retained.push(RetainedFile {
            path: path.to_owned(),
            mtime,
            size,
        });

        Ok(false)
    }
}

/// Removes least recently used files until the retained bytes fit into `max_size`.
///
/// Directories emptied by this are left in place, the next cleanup run removes them.
fn enforce_max_size(
    max_size: u64,
    mut retained: Vec<RetainedFile>,
    stats: &mut CleanupStats,
    dry_run: bool,
) {
    if stats.retained_bytes <= max_size {
        return;
    }
    retained.sort_by_key(|file| file.mtime);

    for file in retained {
        if stats.retained_bytes <= max_size {
            break;
        }
        tracing::debug!("Removing file `{}` to fit size budget", file.path.display());
        if !dry_run {
            if let Err(e) = catch_not_found(|| remove_file(&file.path)) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %file.path.display(),
                    "Failed to clean cache file",
                );
                continue;
            }
        }
        stats.retained_bytes -= file.size;
        stats.retained_files -= 1;
        stats.removed_bytes += file.size;
        stats.removed_files += 1;
    }
}
