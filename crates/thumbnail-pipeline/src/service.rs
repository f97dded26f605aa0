//! UI-facing entry point
//!
//! [`ThumbnailService`] answers from the cache when it can and otherwise hands
//! the request to the scheduler. A cache hit is returned synchronously and the
//! request's callback is not invoked for it. The hit also supersedes whatever
//! the scheduler still holds for the same target, so no older result arrives
//! after it.

use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::codec::CodecRegistry;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::factory::ThumbnailFactory;
use crate::group::GroupLayout;
use crate::queue::SubmitOutcome;
use crate::request::{TargetId, ThumbnailRequest};
use crate::scale::Bound;
use crate::scheduler::ThumbnailScheduler;
use crate::source::{self, ImageLoader, Rotation};
use crate::thumbnail::Thumbnail;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of [`ThumbnailService::request`].
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Served from the cache; no callback will follow.
    Ready(Thumbnail),
    /// Handed to the scheduler; the callback fires when done.
    Scheduled(SubmitOutcome),
}

/// Cache + scheduler facade.
#[derive(Debug)]
pub struct ThumbnailService {
    config: PipelineConfig,
    cache: Arc<ResultCache>,
    factory: Arc<ThumbnailFactory>,
    scheduler: ThumbnailScheduler,
}

impl ThumbnailService {
    /// Start a service with the default codecs
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        Self::with_registry(config, CodecRegistry::with_default_codecs())
    }

    /// Start a service decoding through `registry`
    pub fn with_registry(config: PipelineConfig, registry: CodecRegistry) -> anyhow::Result<Self> {
        let config = config.normalized();
        let cache = Arc::new(ResultCache::new(&config)?);
        let loader = ImageLoader::new(Arc::new(registry));
        let factory = Arc::new(ThumbnailFactory::with_loader(&config, loader, Arc::clone(&cache)));
        let scheduler = ThumbnailScheduler::new(Arc::clone(&factory), config.workers)?;

        debug!(
            workers = config.workers,
            cache_entries = config.cache_entries,
            disk_cache = ?cache.disk_dir(),
            source_cache_bytes = config.source_cache_bytes,
            "thumbnail service ready"
        );
        Ok(Self {
            config,
            cache,
            factory,
            scheduler,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn default_bound(&self) -> Bound {
        self.config.default_bound
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &ThumbnailScheduler {
        &self.scheduler
    }

    pub fn factory(&self) -> &Arc<ThumbnailFactory> {
        &self.factory
    }

    pub fn loader(&self) -> &ImageLoader {
        self.factory.loader()
    }

    /// Serve `request` from the cache, or schedule it.
    pub fn request(&self, request: ThumbnailRequest) -> RequestOutcome {
        if !request.is_force_rebuild() {
            // a source we cannot stat is left to the worker, which reports the error
            if let Ok(key) = CacheKey::for_source(request.source(), request.rotation(), request.bound()) {
                if let Some(thumbnail) = self.cache.get(&key) {
                    if self.scheduler.withdraw(request.target()) {
                        debug!(target_id = %request.target(), "cache hit supersedes pending request");
                    }
                    trace!(target_id = %request.target(), "served from cache");
                    return RequestOutcome::Ready(thumbnail);
                }
            }
        }
        RequestOutcome::Scheduled(self.scheduler.submit(request))
    }

    /// Build synchronously on the calling thread, bypassing the scheduler.
    pub fn build_now(&self, source: &Path, rotation: Rotation, bound: Bound) -> Result<Thumbnail> {
        self.factory.build(source, rotation, bound, false)
    }

    /// Folder thumbnail of `members` with the configured layout, built on
    /// the calling thread.
    pub fn group_thumbnail(&self, members: &[(PathBuf, Rotation)]) -> Result<Thumbnail> {
        self.group_thumbnail_with(members, &self.config.group_layout)
    }

    pub fn group_thumbnail_with(&self, members: &[(PathBuf, Rotation)], layout: &GroupLayout) -> Result<Thumbnail> {
        self.factory.build_group(members, layout)
    }

    pub fn withdraw(&self, target: &TargetId) -> bool {
        self.scheduler.withdraw(target)
    }

    pub fn withdraw_all(&self) -> usize {
        self.scheduler.withdraw_all()
    }

    /// Forget every cached thumbnail of `source`, and its raw bytes.
    pub fn invalidate(&self, source: &Path) -> usize {
        if let Some(source_cache) = self.loader().source_cache() {
            source_cache.invalidate(&source::resolve_origin(source));
        }
        self.cache.invalidate(source)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Counters of the raw source cache, when it is enabled.
    pub fn source_cache_stats(&self) -> Option<CacheStats> {
        self.loader().source_cache().map(|cache| cache.stats())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{registry_with_held, HELD_MAGIC};
    use crate::delivery::ChannelDelivery;
    use std::fs;
    use crate::request::Priority;
    use crate::source::tests::write_png;
    use std::time::Duration;
    use tempfile::tempdir;

    fn service(cache_dir: &Path) -> ThumbnailService {
        let config = PipelineConfig {
            workers: 2,
            cache_dir: Some(cache_dir.to_path_buf()),
            ..PipelineConfig::default()
        };
        ThumbnailService::new(config).unwrap()
    }

    #[test]
    fn test_miss_schedules_then_hit_is_synchronous() {
        let temp_dir = tempdir().unwrap();
        let photo = temp_dir.path().join("photo.png");
        write_png(&photo, 200, 100);
        let service = service(&temp_dir.path().join("cache"));
        let delivery = ChannelDelivery::new();

        let request = || {
            ThumbnailRequest::new("photo", &photo, Bound::square(400), delivery.callback())
                .with_rotation(Rotation::Degrees(0.0))
                .with_priority(Priority::Highest)
        };

        assert!(matches!(
            service.request(request()),
            RequestOutcome::Scheduled(SubmitOutcome::Enqueued)
        ));
        let ready = delivery.recv_timeout(Duration::from_secs(10)).unwrap();
        let built = ready.result.unwrap();
        assert_eq!((built.width(), built.height()), (400, 200));

        match service.request(request()) {
            RequestOutcome::Ready(thumb) => assert_eq!(thumb, built),
            other => panic!("expected cache hit, got {other:?}"),
        }
        assert!(delivery.recv_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_cache_hit_withdraws_pending_request_for_target() {
        let temp_dir = tempdir().unwrap();
        let photo = temp_dir.path().join("photo.png");
        let held = temp_dir.path().join("held.bin");
        write_png(&photo, 240, 120);
        fs::write(&held, HELD_MAGIC).unwrap();

        let (registry, started, release) = registry_with_held();
        let config = PipelineConfig {
            workers: 1,
            cache_dir: Some(temp_dir.path().join("cache")),
            ..PipelineConfig::default()
        };
        let service = ThumbnailService::with_registry(config, registry).unwrap();
        service
            .build_now(&photo, Rotation::Degrees(0.0), Bound::square(120))
            .unwrap();

        let busy = ChannelDelivery::new();
        service.request(ThumbnailRequest::new("busy", &held, Bound::square(8), busy.callback()));
        started.recv_timeout(Duration::from_secs(10)).unwrap();

        let row = ChannelDelivery::new();
        let small = ThumbnailRequest::new("row", &photo, Bound::square(50), row.callback())
            .with_rotation(Rotation::Degrees(0.0));
        assert!(matches!(service.request(small), RequestOutcome::Scheduled(SubmitOutcome::Enqueued)));

        let large = ThumbnailRequest::new("row", &photo, Bound::square(120), row.callback())
            .with_rotation(Rotation::Degrees(0.0));
        match service.request(large) {
            RequestOutcome::Ready(thumb) => assert_eq!(thumb.width(), 120),
            other => panic!("expected cache hit, got {other:?}"),
        }
        assert_eq!(service.scheduler().state_of(&TargetId::from("row")), None);

        release.send(()).unwrap();
        assert!(busy.recv_timeout(Duration::from_secs(10)).is_some());
        assert!(row.recv_timeout(Duration::from_millis(300)).is_none());
        assert!(service.scheduler().is_idle());
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let temp_dir = tempdir().unwrap();
        let photo = temp_dir.path().join("photo.png");
        write_png(&photo, 50, 50);
        let service = service(&temp_dir.path().join("cache"));

        service
            .build_now(&photo, Rotation::FromExif, Bound::square(25))
            .unwrap();
        assert_eq!(service.invalidate(&photo), 1);

        let delivery = ChannelDelivery::new();
        let outcome = service.request(ThumbnailRequest::new("p", &photo, Bound::square(25), delivery.callback()));
        assert!(matches!(outcome, RequestOutcome::Scheduled(_)));
        assert!(delivery.recv_timeout(Duration::from_secs(10)).unwrap().result.is_ok());
    }

    #[test]
    fn test_missing_source_is_scheduled_and_fails() {
        let temp_dir = tempdir().unwrap();
        let service = service(&temp_dir.path().join("cache"));
        let delivery = ChannelDelivery::new();

        let outcome = service.request(ThumbnailRequest::new(
            "gone",
            temp_dir.path().join("gone.png"),
            Bound::square(25),
            delivery.callback(),
        ));
        assert!(matches!(outcome, RequestOutcome::Scheduled(SubmitOutcome::Enqueued)));
        let (target, thumb) = delivery
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .into_thumbnail_or_broken();
        assert_eq!(target, TargetId::from("gone"));
        assert!(thumb.is_broken());
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let temp_dir = tempdir().unwrap();
        let photo = temp_dir.path().join("photo.png");
        write_png(&photo, 10, 10);
        let service = service(&temp_dir.path().join("cache"));
        service.shutdown();

        let outcome = service.request(ThumbnailRequest::new(
            "p",
            &photo,
            Bound::square(5),
            ChannelDelivery::new().callback(),
        ));
        assert!(matches!(outcome, RequestOutcome::Scheduled(SubmitOutcome::Rejected)));
    }

    #[test]
    fn test_group_thumbnail_persists_across_services() {
        let temp_dir = tempdir().unwrap();
        let cache_dir = temp_dir.path().join("cache");
        let members: Vec<_> = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|name| {
                let path = temp_dir.path().join(name);
                write_png(&path, 80, 60);
                (path, Rotation::FromExif)
            })
            .collect();

        let first = service(&cache_dir);
        let folder = first.group_thumbnail(&members).unwrap();
        assert_eq!((folder.width(), folder.height()), (350, 350));
        first.shutdown();

        let second = service(&cache_dir);
        let cached = second.group_thumbnail(&members).unwrap();
        assert_eq!((cached.width(), cached.height()), (350, 350));
        assert_eq!(second.cache_stats().hits, 1);
        assert_eq!(second.source_cache_stats().unwrap().misses, 0);
    }

    #[test]
    fn test_invalidate_drops_source_bytes() {
        let temp_dir = tempdir().unwrap();
        let photo = temp_dir.path().join("photo.png");
        write_png(&photo, 30, 30);
        let service = service(&temp_dir.path().join("cache"));

        service.build_now(&photo, Rotation::FromExif, Bound::square(10)).unwrap();
        service.build_now(&photo, Rotation::Degrees(90.0), Bound::square(10)).unwrap();
        let stats = service.source_cache_stats().unwrap();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));

        service.invalidate(&photo);
        assert_eq!(service.source_cache_stats().unwrap().entries, 0);
    }

    #[test]
    fn test_source_cache_can_be_disabled() {
        let config = PipelineConfig {
            source_cache_bytes: 0,
            ..PipelineConfig::in_memory()
        };
        let service = ThumbnailService::new(config).unwrap();
        assert!(service.source_cache_stats().is_none());
    }
}
