//! Worker pool draining the request queue
//!
//! Workers sleep on a condition variable until a request is queued, take the
//! highest priority one, build it through the [`ThumbnailFactory`] and invoke
//! the request's callback on the worker thread, outside the queue lock.

use crate::config::MAX_WORKERS;
use crate::error::ThumbnailError;
use crate::factory::ThumbnailFactory;
use crate::queue::{Completion, RequestQueue, SubmitOutcome};
use crate::request::{Priority, RequestState, TargetId, ThumbnailRequest};
use crate::source::panic_message;
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

struct Shared {
    queue: Mutex<RequestQueue>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size pool of thumbnail workers.
pub struct ThumbnailScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThumbnailScheduler {
    /// Start `workers` threads (clamped to `1..=MAX_WORKERS`)
    pub fn new(factory: Arc<ThumbnailFactory>, workers: usize) -> Result<Self> {
        let num_workers = workers.clamp(1, MAX_WORKERS);
        let shared = Arc::new(Shared {
            queue: Mutex::new(RequestQueue::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let scheduler = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for worker_id in 0..num_workers {
            let shared = Arc::clone(&scheduler.shared);
            let factory = Arc::clone(&factory);
            let handle = thread::Builder::new()
                .name(format!("thumb-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, shared, factory))
                .with_context(|| format!("Failed to spawn thumbnail worker {}", worker_id))?;
            scheduler.workers.lock().push(handle);
        }

        debug!(num_workers, "started thumbnail scheduler");
        Ok(scheduler)
    }

    /// Queue a request. Duplicates for the same target are merged.
    pub fn submit(&self, request: ThumbnailRequest) -> SubmitOutcome {
        let mut queue = self.shared.queue.lock();
        // shutdown() sets the flag while holding the queue lock
        if self.is_shut_down() {
            drop(queue);
            warn!(target_id = %request.target(), "scheduler is shut down, dropping request");
            return SubmitOutcome::Rejected;
        }
        let outcome = queue.submit(request);
        drop(queue);
        if outcome.wakes_worker() {
            self.shared.available.notify_one();
        }
        outcome
    }

    /// Cancel the request for `target`; its callback will not fire.
    pub fn withdraw(&self, target: &TargetId) -> bool {
        self.shared.queue.lock().withdraw(target)
    }

    pub fn withdraw_all(&self) -> usize {
        self.shared.queue.lock().withdraw_all()
    }

    pub fn state_of(&self, target: &TargetId) -> Option<RequestState> {
        self.shared.queue.lock().state_of(target)
    }

    pub fn priority_of(&self, target: &TargetId) -> Option<Priority> {
        self.shared.queue.lock().priority_of(target)
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().queued_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.queue.lock().in_flight_len()
    }

    /// True when nothing is queued or being built.
    pub fn is_idle(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers once their current build finishes. Queued requests
    /// are dropped without callbacks.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            let dropped = queue.withdraw_all();
            if dropped > 0 {
                debug!(dropped, "dropping pending thumbnail requests");
            }
        }
        self.shared.available.notify_all();

        let current = thread::current().id();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            // a callback may drop the last handle from inside a worker
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("thumbnail worker panicked");
            }
        }
    }
}

impl Drop for ThumbnailScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThumbnailScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailScheduler")
            .field("workers", &self.worker_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn next_request(shared: &Shared) -> Option<ThumbnailRequest> {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
        if let Some(request) = queue.pop_next() {
            return Some(request);
        }
        shared.available.wait(&mut queue);
    }
}

fn worker_loop(worker_id: usize, shared: Arc<Shared>, factory: Arc<ThumbnailFactory>) {
    trace!(worker_id, "thumbnail worker started");

    while let Some(request) = next_request(&shared) {
        trace!(worker_id, target_id = %request.target(), priority = %request.priority(), "building");

        let result = panic::catch_unwind(AssertUnwindSafe(|| factory.produce(&request)))
            .unwrap_or_else(|payload| {
                Err(ThumbnailError::decode(
                    request.source(),
                    panic_message(payload.as_ref()),
                ))
            });
        if let Err(e) = &result {
            debug!(worker_id, source = ?request.source(), kind = e.kind(), error = %e, "thumbnail failed");
        }

        let completion = shared.queue.lock().complete(request.target());
        match completion {
            Completion::Deliver(owner) => {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| owner.deliver(result)));
                if delivered.is_err() {
                    error!(worker_id, target_id = %owner.target(), "thumbnail callback panicked");
                }
            }
            Completion::Requeued => {
                trace!(worker_id, target_id = %request.target(), "superseded, discarding result");
                shared.available.notify_one();
            }
            Completion::Discard => {
                trace!(worker_id, target_id = %request.target(), "withdrawn, discarding result");
            }
        }
    }

    trace!(worker_id, "thumbnail worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::codec::tests::{registry_with_held, HELD_MAGIC};
    use crate::codec::CodecRegistry;
    use crate::request::ThumbnailCallback;
    use crate::scale::Scaler;
    use crate::source::ImageLoader;
    use crate::config::PipelineConfig;
    use crate::delivery::ChannelDelivery;
    use crate::request::ThumbnailReady;
    use crate::scale::Bound;
    use crate::source::tests::write_png;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn scheduler(workers: usize) -> ThumbnailScheduler {
        let config = PipelineConfig::in_memory();
        let cache = Arc::new(ResultCache::in_memory(&config));
        let factory = Arc::new(ThumbnailFactory::from_config(&config, cache));
        ThumbnailScheduler::new(factory, workers).unwrap()
    }

    fn scheduler_with(registry: CodecRegistry, workers: usize) -> ThumbnailScheduler {
        let config = PipelineConfig::in_memory();
        let cache = Arc::new(ResultCache::in_memory(&config));
        let loader = ImageLoader::new(Arc::new(registry));
        let factory = Arc::new(ThumbnailFactory::new(loader, Scaler::default(), cache));
        ThumbnailScheduler::new(factory, workers).unwrap()
    }

    #[test]
    fn test_revived_request_delivers_only_to_new_owner() {
        let temp_dir = tempdir().unwrap();
        let held = temp_dir.path().join("held.bin");
        fs::write(&held, HELD_MAGIC).unwrap();
        let (registry, started, release) = registry_with_held();
        let scheduler = scheduler_with(registry, 1);

        let fired = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = flume::unbounded();
        let owner = |name: &'static str| -> ThumbnailCallback {
            let fired = Arc::clone(&fired);
            let done = done_tx.clone();
            Arc::new(move |_ready: ThumbnailReady| {
                fired.lock().push(name);
                let _ = done.send(());
            })
        };

        scheduler.submit(ThumbnailRequest::new("t", &held, Bound::square(4), owner("old")));
        started.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(scheduler.withdraw(&TargetId::from("t")));
        let outcome = scheduler.submit(ThumbnailRequest::new("t", &held, Bound::square(4), owner("new")));
        assert_eq!(outcome, SubmitOutcome::AlreadyInFlight);

        release.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(*fired.lock(), ["new"]);
    }

    #[test]
    fn test_submit_racing_shutdown_never_strands_requests() {
        for _ in 0..20 {
            let scheduler = Arc::new(scheduler(2));
            let submitters: Vec<_> = (0..4)
                .map(|t| {
                    let scheduler = Arc::clone(&scheduler);
                    thread::spawn(move || {
                        for i in 0..50 {
                            scheduler.submit(ThumbnailRequest::new(
                                format!("{t}-{i}"),
                                "missing.png",
                                Bound::square(10),
                                Arc::new(|_ready: ThumbnailReady| {}),
                            ));
                        }
                    })
                })
                .collect();
            scheduler.shutdown();
            for submitter in submitters {
                submitter.join().unwrap();
            }
            assert_eq!(scheduler.queued_len(), 0);
        }
    }

    #[test]
    fn test_failure_does_not_block_other_requests() {
        let temp_dir = tempdir().unwrap();
        let garbage = temp_dir.path().join("garbage.jpg");
        let good = temp_dir.path().join("good.png");
        fs::write(&garbage, b"not an image at all").unwrap();
        write_png(&good, 120, 80);

        let scheduler = scheduler(1);
        let delivery = ChannelDelivery::new();
        scheduler.submit(ThumbnailRequest::new("bad", &garbage, Bound::square(60), delivery.callback()));
        scheduler.submit(ThumbnailRequest::new("good", &good, Bound::square(60), delivery.callback()));

        let mut results = Vec::new();
        for _ in 0..2 {
            results.push(delivery.recv_timeout(Duration::from_secs(10)).expect("delivery"));
        }
        results.sort_by(|a, b| a.target.cmp(&b.target));

        assert_eq!(results[0].target, TargetId::from("bad"));
        assert!(matches!(results[0].result, Err(ThumbnailError::NoDecoderFound { .. })));
        let thumb = results[1].result.as_ref().unwrap();
        assert_eq!((thumb.width(), thumb.height()), (60, 40));
    }

    #[test]
    fn test_missing_source_is_reported() {
        let temp_dir = tempdir().unwrap();
        let scheduler = scheduler(2);
        let delivery = ChannelDelivery::new();
        scheduler.submit(ThumbnailRequest::new(
            "missing",
            temp_dir.path().join("nope.png"),
            Bound::square(60),
            delivery.callback(),
        ));

        let ready = delivery.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(ready.result, Err(ThumbnailError::SourceUnreadable { .. })));
        assert!(ready.into_thumbnail_or_broken().1.is_broken());
    }

    #[test]
    fn test_callback_runs_off_caller_thread() {
        let temp_dir = tempdir().unwrap();
        let good = temp_dir.path().join("good.png");
        write_png(&good, 10, 10);

        let scheduler = scheduler(1);
        let (tx, rx) = flume::unbounded();
        let callback = Arc::new(move |_ready: ThumbnailReady| {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });
        scheduler.submit(ThumbnailRequest::new("t", &good, Bound::square(5), callback));

        let name = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(name.as_deref(), Some("thumb-worker-0"));
    }

    #[test]
    fn test_shutdown_stops_workers() {
        let scheduler = scheduler(3);
        assert_eq!(scheduler.worker_count(), 3);
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.worker_count(), 0);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let scheduler = scheduler(1);
        scheduler.shutdown();
        let outcome = scheduler.submit(ThumbnailRequest::new(
            "late",
            "late.png",
            Bound::square(10),
            ChannelDelivery::new().callback(),
        ));
        assert_eq!(outcome, SubmitOutcome::Rejected);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let scheduler = scheduler(0);
        assert_eq!(scheduler.worker_count(), 1);
    }
}
