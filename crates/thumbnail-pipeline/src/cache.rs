//! Result cache for finished thumbnails
//!
//! Thumbnails are keyed by source path, source signature (size + mtime),
//! rotation and requested bound. The memory layer is an LRU bounded by entry
//! count and bytes; the optional disk layer stores one JPEG per key under a
//! per-source directory so a whole source can be invalidated at once:
//!
//! ```text
//! <cache_dir>/<hash(source path)>/<hash(full key)>.jpg
//! ```
//!
//! Unreadable disk entries are deleted and treated as misses.

use crate::config::PipelineConfig;
use crate::error::{Result, ThumbnailError};
use crate::group::GroupLayout;
use crate::lru::LruCache;
use crate::scale::{self, Bound, OutputFormat};
use crate::source::{self, Rotation};
use crate::thumbnail::Thumbnail;
use anyhow::Context;
use image::ImageFormat;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, trace, warn};

const GROUP_PREFIX: &str = "group:";

/// Size and modification time of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSignature {
    pub len: u64,
    pub modified_ms: u128,
}

impl SourceSignature {
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified_ms = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Ok(Self {
            len: metadata.len(),
            modified_ms,
        })
    }
}

/// Hashable form of a [`Rotation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationKey {
    Auto,
    /// Normalized into [0, 360) and stored in thousandths of a degree.
    MilliDegrees(i64),
}

impl From<Rotation> for RotationKey {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::FromExif => RotationKey::Auto,
            Rotation::Degrees(d) if d.is_finite() => {
                RotationKey::MilliDegrees((d.rem_euclid(360.0) * 1000.0).round() as i64 % 360_000)
            }
            Rotation::Degrees(_) => RotationKey::MilliDegrees(0),
        }
    }
}

/// Everything that determines a thumbnail's pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: PathBuf,
    pub signature: SourceSignature,
    pub rotation: RotationKey,
    pub bound: Bound,
}

impl CacheKey {
    /// Build a key for the current state of `source` on disk.
    pub fn for_source(source: &Path, rotation: Rotation, bound: Bound) -> Result<Self> {
        let path = source::resolve_origin(source);
        let canonical = path
            .canonicalize()
            .map_err(|e| ThumbnailError::unreadable(source, e))?;
        let signature =
            SourceSignature::of(&canonical).map_err(|e| ThumbnailError::unreadable(source, e))?;
        Ok(Self {
            source: canonical,
            signature,
            rotation: rotation.into(),
            bound: bound.or_fallback(),
        })
    }

    /// Key for a folder thumbnail of `members` drawn with `layout`.
    ///
    /// Only members that fit on the canvas count. Any of them changing on
    /// disk changes the key, so an outdated folder thumbnail is never found.
    /// Invalidating a single member source does not drop folders holding it.
    pub fn for_group(members: &[(PathBuf, Rotation)], layout: &GroupLayout) -> Result<Self> {
        let shown = &members[..members.len().min(layout.capacity())];
        let mut hasher = Sha256::new();
        let mut newest = 0;
        for (path, rotation) in shown {
            let member = Self::for_source(path, *rotation, layout.mini)?;
            hasher.update(member.digest().as_bytes());
            newest = newest.max(member.signature.modified_ms);
        }
        let GroupLayout {
            canvas,
            mini,
            left_margin,
            top_margin,
            margin,
        } = *layout;
        for value in [
            canvas.width,
            canvas.height,
            mini.width,
            mini.height,
            left_margin,
            top_margin,
            margin,
        ] {
            hasher.update(value.to_le_bytes());
        }

        Ok(Self {
            source: PathBuf::from(format!("{GROUP_PREFIX}{}", hex::encode(&hasher.finalize()[..16]))),
            signature: SourceSignature {
                len: shown.len() as u64,
                modified_ms: newest,
            },
            rotation: RotationKey::Auto,
            bound: canvas.or_fallback(),
        })
    }

    /// Whether this key names a folder thumbnail rather than a single file.
    pub fn is_group(&self) -> bool {
        self.source.to_string_lossy().starts_with(GROUP_PREFIX)
    }

    /// Hex digest identifying the source alone.
    pub fn source_digest(&self) -> String {
        digest_path(&self.source)
    }

    /// Hex digest identifying the whole key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.to_string_lossy().as_bytes());
        hasher.update(self.signature.len.to_le_bytes());
        hasher.update(self.signature.modified_ms.to_le_bytes());
        match self.rotation {
            RotationKey::Auto => hasher.update(b"auto"),
            RotationKey::MilliDegrees(m) => hasher.update(m.to_le_bytes()),
        }
        hasher.update(self.bound.width.to_le_bytes());
        hasher.update(self.bound.height.to_le_bytes());
        // first 16 bytes (32 hex chars) are plenty for file names
        hex::encode(&hasher.finalize()[..16])
    }
}

fn digest_path(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..16])
}

/// Cache counters for monitoring and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    pub fn memory_usage_percent(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            (self.bytes as f64 / self.max_bytes as f64) * 100.0
        }
    }
}

/// Memory + optional disk cache of finished thumbnails.
pub struct ResultCache {
    memory: LruCache<CacheKey, Thumbnail>,
    disk_dir: Option<PathBuf>,
    jpeg_quality: u8,
    hits: AtomicU64,
    misses: AtomicU64,
    building: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl ResultCache {
    /// Create a cache from `config`, creating the disk directory if persistence is on
    pub fn new(config: &PipelineConfig) -> anyhow::Result<Self> {
        let disk_dir = config.resolved_cache_dir();
        if let Some(dir) = &disk_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        }
        Ok(Self::build(config, disk_dir))
    }

    /// Memory-only cache with the limits from `config`
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: &PipelineConfig, disk_dir: Option<PathBuf>) -> Self {
        Self {
            memory: LruCache::new(config.cache_entries, config.memory_budget_bytes),
            disk_dir,
            jpeg_quality: config.jpeg_quality,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            building: Mutex::new(HashMap::new()),
        }
    }

    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk_dir.as_deref()
    }

    /// Where `key` is persisted, if the disk layer is enabled.
    pub fn disk_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let dir = self.disk_dir.as_ref()?;
        Some(dir.join(key.source_digest()).join(format!("{}.jpg", key.digest())))
    }

    /// Look up `key`, memory first, then disk.
    pub fn get(&self, key: &CacheKey) -> Option<Thumbnail> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn lookup(&self, key: &CacheKey) -> Option<Thumbnail> {
        if let Some(thumbnail) = self.memory.get(key) {
            trace!(source = ?key.source, "memory hit");
            return Some(thumbnail);
        }

        let path = self.disk_path(key)?;
        match self.read_disk(&path) {
            Ok(Some(thumbnail)) => {
                trace!(?path, "disk hit");
                self.memory
                    .insert(key.clone(), thumbnail.clone(), thumbnail.byte_size());
                Some(thumbnail)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "discarding cache entry");
                if let Err(e) = fs::remove_file(&path) {
                    debug!(?path, error = %e, "failed to remove corrupt cache entry");
                }
                None
            }
        }
    }

    fn read_disk(&self, path: &Path) -> Result<Option<Thumbnail>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ThumbnailError::CacheCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };
        let raster = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
            .map_err(|e| ThumbnailError::CacheCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        Ok(Some(Thumbnail::from_raster(raster)))
    }

    /// Store `thumbnail` in memory and, if enabled, on disk.
    ///
    /// The memory layer is always updated; an error means only the disk
    /// write failed.
    pub fn put(&self, key: CacheKey, thumbnail: Thumbnail) -> Result<()> {
        let disk_path = self.disk_path(&key);
        let evicted = self
            .memory
            .insert(key, thumbnail.clone(), thumbnail.byte_size());
        if !evicted.is_empty() {
            trace!(count = evicted.len(), "evicted from memory");
        }

        if let Some(path) = disk_path {
            let format = OutputFormat::Jpeg {
                quality: self.jpeg_quality,
            };
            let data = thumbnail.encode(format)?;
            scale::write_atomic(&path, &data)?;
        }
        Ok(())
    }

    /// Return the cached thumbnail for `key`, or build and store it.
    ///
    /// Concurrent callers for the same key run `build` once; the others wait
    /// and then read the stored result.
    pub fn get_or_build<F>(&self, key: CacheKey, build: F) -> Result<Thumbnail>
    where
        F: FnOnce() -> Result<Thumbnail>,
    {
        if let Some(thumbnail) = self.get(&key) {
            return Ok(thumbnail);
        }
        self.build_exclusive(key, build, true)
    }

    /// Build unconditionally and replace whatever is stored for `key`.
    pub fn rebuild<F>(&self, key: CacheKey, build: F) -> Result<Thumbnail>
    where
        F: FnOnce() -> Result<Thumbnail>,
    {
        self.build_exclusive(key, build, false)
    }

    fn build_exclusive<F>(&self, key: CacheKey, build: F, reuse: bool) -> Result<Thumbnail>
    where
        F: FnOnce() -> Result<Thumbnail>,
    {
        let gate = Arc::clone(self.building.lock().entry(key.clone()).or_default());
        let result = {
            let _guard = gate.lock();
            match self.memory.get(&key).filter(|_| reuse) {
                Some(thumbnail) => Ok(thumbnail),
                None => build().map(|thumbnail| {
                    if let Err(e) = self.put(key.clone(), thumbnail.clone()) {
                        warn!(error = %e, "failed to persist thumbnail");
                    }
                    thumbnail
                }),
            }
        };

        let mut building = self.building.lock();
        if building.get(&key).is_some_and(|g| Arc::ptr_eq(g, &gate)) && Arc::strong_count(&gate) <= 2 {
            building.remove(&key);
        }
        result
    }

    /// Drop every cached thumbnail of `source`. Returns the number of memory
    /// entries removed.
    pub fn invalidate(&self, source: &Path) -> usize {
        let path = source::resolve_origin(source);
        let canonical = path.canonicalize().unwrap_or(path);
        let removed = self.memory.remove_where(|key| key.source == canonical);

        if let Some(dir) = &self.disk_dir {
            let source_dir = dir.join(digest_path(&canonical));
            match fs::remove_dir_all(&source_dir) {
                Ok(()) => debug!(?source_dir, "removed persisted thumbnails"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(?source_dir, error = %e, "failed to remove persisted thumbnails"),
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.memory.len(),
            max_entries: self.memory.max_entries(),
            bytes: self.memory.total_bytes(),
            max_bytes: self.memory.max_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Clear memory and delete every persisted thumbnail
    pub fn clear_all(&self) -> anyhow::Result<()> {
        self.clear_memory();
        if let Some(dir) = &self.disk_dir {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .with_context(|| format!("Failed to remove cache directory: {}", dir.display()))?;
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to recreate cache directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("memory", &self.memory)
            .field("disk_dir", &self.disk_dir)
            .finish()
    }
}
