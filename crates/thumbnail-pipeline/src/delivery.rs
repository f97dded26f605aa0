//! Marshalling worker callbacks onto the caller's thread
//!
//! Workers invoke callbacks on their own threads. A UI that must touch its
//! widgets from one thread hands [`ChannelDelivery::callback`] to its requests
//! and drains the results with [`ChannelDelivery::poll`] from its event loop.

use crate::request::{ThumbnailCallback, ThumbnailReady};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Channel-backed completion sink.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    tx: Sender<ThumbnailReady>,
    rx: Receiver<ThumbnailReady>,
}

impl Default for ChannelDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDelivery {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// A callback that forwards every result into this channel.
    pub fn callback(&self) -> ThumbnailCallback {
        let tx = self.tx.clone();
        Arc::new(move |ready: ThumbnailReady| {
            if let Err(e) = tx.send(ready) {
                trace!(target_id = %e.0.target, "receiver gone, dropping thumbnail");
            }
        })
    }

    /// Everything delivered so far (non-blocking).
    pub fn poll(&self) -> Vec<ThumbnailReady> {
        self.rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ThumbnailReady> {
        match self.rx.recv_timeout(timeout) {
            Ok(ready) => Some(ready),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of results waiting to be drained.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TargetId;
    use crate::thumbnail::Thumbnail;
    use std::thread;

    #[test]
    fn test_results_cross_threads() {
        let delivery = ChannelDelivery::new();
        let callback = delivery.callback();

        let worker = thread::spawn(move || {
            for i in 0..3 {
                callback(ThumbnailReady {
                    target: TargetId::new(format!("t{i}")),
                    result: Ok(Thumbnail::broken()),
                });
            }
        });
        worker.join().unwrap();

        assert_eq!(delivery.pending(), 3);
        let drained = delivery.poll();
        let targets: Vec<_> = drained.iter().map(|r| r.target.to_string()).collect();
        assert_eq!(targets, ["t0", "t1", "t2"]);
        assert!(delivery.poll().is_empty());
    }

    #[test]
    fn test_recv_timeout_when_empty() {
        let delivery = ChannelDelivery::new();
        assert!(delivery.recv_timeout(Duration::from_millis(10)).is_none());
    }
}
