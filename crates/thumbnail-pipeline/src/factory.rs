//! Worker-side build step: cache lookup, load, rotate, scale, store

use crate::cache::{CacheKey, ResultCache};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::group::GroupLayout;
use crate::request::ThumbnailRequest;
use crate::scale::{scale_factor_to_fit, Bound, Scaler};
use crate::source::{ImageLoader, Rotation};
use crate::source_cache::SourceBytesCache;
use crate::thumbnail::Thumbnail;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns a source path into a cached thumbnail.
#[derive(Debug)]
pub struct ThumbnailFactory {
    loader: ImageLoader,
    scaler: Scaler,
    cache: Arc<ResultCache>,
}

impl ThumbnailFactory {
    pub fn new(loader: ImageLoader, scaler: Scaler, cache: Arc<ResultCache>) -> Self {
        Self {
            loader,
            scaler,
            cache,
        }
    }

    /// Factory with the default codecs and the scaling options from `config`
    pub fn from_config(config: &PipelineConfig, cache: Arc<ResultCache>) -> Self {
        Self::with_loader(config, ImageLoader::default(), cache)
    }

    /// Factory around `loader`, adding the source cache `config` asks for
    pub fn with_loader(config: &PipelineConfig, loader: ImageLoader, cache: Arc<ResultCache>) -> Self {
        let scaler = Scaler::new(config.scale_quality).dont_enlarge(config.dont_enlarge);
        let loader = if config.source_cache_enabled() && loader.source_cache().is_none() {
            let source_cache = SourceBytesCache::new(config.source_cache_entries, config.source_cache_bytes);
            loader.with_source_cache(Arc::new(source_cache))
        } else {
            loader
        };
        Self::new(loader, scaler, cache)
    }

    pub fn loader(&self) -> &ImageLoader {
        &self.loader
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Build the thumbnail for a scheduled request.
    pub fn produce(&self, request: &ThumbnailRequest) -> Result<Thumbnail> {
        self.build(
            request.source(),
            request.rotation(),
            request.bound(),
            request.is_force_rebuild(),
        )
    }

    /// Build (or fetch) the thumbnail of `source` fitted into `bound`.
    pub fn build(&self, source: &Path, rotation: Rotation, bound: Bound, force: bool) -> Result<Thumbnail> {
        let key = CacheKey::for_source(source, rotation, bound)?;
        let render = || self.render(source, rotation, bound);

        if force {
            self.cache.rebuild(key, render)
        } else {
            self.cache.get_or_build(key, render)
        }
    }

    fn render(&self, source: &Path, rotation: Rotation, bound: Bound) -> Result<Thumbnail> {
        debug!(?source, ?rotation, %bound, "rendering thumbnail");
        let image = Arc::new(self.loader.load_with(source, rotation)?);
        Ok(self.scaler.scale_to_fit(&image, bound).into_thumbnail())
    }

    /// Build (or fetch) the folder thumbnail showing the first members that
    /// fit `layout`, in the given order.
    ///
    /// Members are rendered in parallel straight from their sources. One that
    /// fails to decode is drawn as the broken placeholder; one that cannot be
    /// read at all fails the whole folder.
    pub fn build_group(&self, members: &[(PathBuf, Rotation)], layout: &GroupLayout) -> Result<Thumbnail> {
        let key = CacheKey::for_group(members, layout)?;
        self.cache.get_or_build(key, || {
            let shown = &members[..members.len().min(layout.capacity())];
            debug!(members = shown.len(), canvas = %layout.canvas, "composing folder thumbnail");
            let minis: Vec<RgbImage> = shown
                .par_iter()
                .map(|(source, rotation)| self.mini(source, *rotation, layout.mini))
                .collect();
            Ok(Thumbnail::from_raster(layout.compose(&minis)))
        })
    }

    fn mini(&self, source: &Path, rotation: Rotation, bound: Bound) -> RgbImage {
        match self.render(source, rotation, bound) {
            Ok(thumbnail) => thumbnail.raster().clone(),
            Err(e) => {
                warn!(?source, error = %e, "folder member drawn as broken");
                let broken = Thumbnail::broken();
                let factor = scale_factor_to_fit(broken.width(), broken.height(), bound);
                let width = ((broken.width() as f64 * factor).round() as u32).max(1);
                let height = ((broken.height() as f64 * factor).round() as u32).max(1);
                imageops::resize(broken.raster(), width, height, FilterType::Triangle)
            }
        }
    }

    /// Build many thumbnails in parallel on the rayon pool, bypassing the
    /// scheduler. `progress` is called with (completed, total).
    pub fn build_batch<F>(
        &self,
        sources: &[PathBuf],
        rotation: Rotation,
        bound: Bound,
        progress: F,
    ) -> Vec<(PathBuf, Result<Thumbnail>)>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let total = sources.len();
        let completed = AtomicUsize::new(0);

        sources
            .par_iter()
            .map(|source| {
                let result = self.build(source, rotation, bound, false);
                let current = completed.fetch_add(1, Ordering::Relaxed) + 1;
                progress(current, total);
                (source.clone(), result)
            })
            .collect()
    }
}
