//! Memory cache of raw source bytes
//!
//! Building several sizes or rotations of one picture reads the same file
//! repeatedly. Entries are keyed by path and revalidated against the file's
//! size and modification time on every lookup, so an edited source is re-read.

use crate::cache::{CacheStats, SourceSignature};
use crate::lru::LruCache;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone)]
struct CachedBytes {
    signature: SourceSignature,
    bytes: Arc<[u8]>,
}

/// Bounded LRU of whole source files.
pub struct SourceBytesCache {
    entries: LruCache<PathBuf, CachedBytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SourceBytesCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::new(max_entries, max_bytes),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Contents of `path`, from memory when the file is unchanged.
    pub fn read(&self, path: &Path) -> io::Result<Arc<[u8]>> {
        let signature = SourceSignature::of(path)?;
        let key = path.to_path_buf();

        if let Some(cached) = self.entries.get(&key) {
            if cached.signature == signature {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(?path, "source bytes hit");
                return Ok(cached.bytes);
            }
            trace!(?path, "source changed on disk, re-reading");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let bytes: Arc<[u8]> = fs::read(path)?.into();
        // a file larger than the whole budget would only evict everything else
        if !bytes.is_empty() && bytes.len() <= self.entries.max_bytes() {
            let cached = CachedBytes {
                signature,
                bytes: Arc::clone(&bytes),
            };
            self.entries.insert(key, cached, bytes.len());
        }
        Ok(bytes)
    }

    /// Forget `path`. Returns whether it was cached.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.remove(&path.to_path_buf()).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.entries.max_entries(),
            bytes: self.entries.total_bytes(),
            max_bytes: self.entries.max_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SourceBytesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBytesCache")
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn test_repeated_reads_hit_memory() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.bin");
        fs::write(&path, b"first contents")?;
        let cache = SourceBytesCache::new(4, 1024);

        let first = cache.read(&path)?;
        let second = cache.read(&path)?;
        assert_eq!(&*first, b"first contents");
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.bytes, 14);
        Ok(())
    }

    #[test]
    fn test_modified_file_is_reread() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.bin");
        fs::write(&path, b"old")?;
        let cache = SourceBytesCache::new(4, 1024);
        cache.read(&path)?;

        fs::write(&path, b"new")?;
        // same length, so only the timestamp tells the versions apart
        File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now() + Duration::from_secs(5))?;

        assert_eq!(&*cache.read(&path)?, b"new");
        assert_eq!(cache.stats().misses, 2);
        Ok(())
    }

    #[test]
    fn test_oversized_files_are_not_kept() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let small = temp_dir.path().join("small.bin");
        let large = temp_dir.path().join("large.bin");
        fs::write(&small, [1u8; 8])?;
        fs::write(&large, [2u8; 64])?;
        let cache = SourceBytesCache::new(4, 32);

        cache.read(&small)?;
        assert_eq!(cache.read(&large)?.len(), 64);
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.invalidate(&small));
        assert!(!cache.invalidate(&large));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let cache = SourceBytesCache::new(4, 32);
        let err = cache.read(&temp_dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
