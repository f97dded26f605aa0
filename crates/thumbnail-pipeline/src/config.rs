//! Pipeline configuration
//!
//! Worker pool size, cache capacity and scaling defaults. Values can be loaded
//! from a JSON file; anything missing falls back to [`PipelineConfig::default`].

use crate::group::GroupLayout;
use crate::scale::{Bound, ScaleQuality};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

/// Upper limit for the worker pool.
pub const MAX_WORKERS: usize = 64;

/// Thumbnail edge used when a caller does not ask for a specific size.
pub const DEFAULT_THUMBNAIL_EDGE: u32 = 350;

const APP_DIR_NAME: &str = "thumbnailer";

/// Configuration for the whole thumbnail pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of scheduler worker threads.
    pub workers: usize,
    /// Maximum number of thumbnails held in memory.
    pub cache_entries: usize,
    /// Maximum decoded bytes held in memory.
    pub memory_budget_bytes: usize,
    /// Persist thumbnails to disk between runs.
    pub disk_cache: bool,
    /// Disk cache location. `None` uses the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub default_bound: Bound,
    pub jpeg_quality: u8,
    pub scale_quality: ScaleQuality,
    /// Never scale images up beyond their natural size.
    pub dont_enlarge: bool,
    /// Maximum number of source files kept in memory as raw bytes.
    pub source_cache_entries: usize,
    /// Byte budget for raw source files. Zero turns the source cache off.
    pub source_cache_bytes: usize,
    /// Canvas and grid of folder thumbnails.
    pub group_layout: GroupLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cache_entries: 500,
            memory_budget_bytes: 150 * 1024 * 1024, // 150MB
            disk_cache: true,
            cache_dir: None,
            default_bound: Bound::square(DEFAULT_THUMBNAIL_EDGE),
            jpeg_quality: 80,
            scale_quality: ScaleQuality::default(),
            dont_enlarge: false,
            source_cache_entries: 20,
            source_cache_bytes: 64 * 1024 * 1024, // 64MB
            group_layout: GroupLayout::default(),
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(MAX_WORKERS)
}

impl PipelineConfig {
    /// Load a configuration from a JSON file and normalize it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config.normalized())
    }

    /// Clamp out-of-range values into something the pipeline can run with
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.cache_entries = self.cache_entries.max(1);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.default_bound = self.default_bound.or_fallback();
        self.source_cache_entries = self.source_cache_entries.max(1);
        self.group_layout.canvas = self.group_layout.canvas.or_fallback();
        self.group_layout.mini = self.group_layout.mini.or_fallback();
        self
    }

    /// Whether raw source bytes are cached between loads
    pub fn source_cache_enabled(&self) -> bool {
        self.source_cache_bytes > 0
    }

    /// Directory the disk cache lives in, or `None` when persistence is off
    /// or no platform cache directory exists.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        if !self.disk_cache {
            return None;
        }
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join(APP_DIR_NAME).join("thumbnails")))
    }

    /// Memory-only configuration, handy for tests and short-lived tools
    pub fn in_memory() -> Self {
        Self {
            disk_cache: false,
            ..Self::default()
        }
    }
}
