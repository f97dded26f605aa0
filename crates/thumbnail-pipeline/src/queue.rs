//! Deduplicating priority queue of thumbnail requests
//!
//! Pure bookkeeping with no threads: the scheduler wraps it in a mutex. The
//! heap may hold stale entries left behind by promotions or withdrawals;
//! they are skipped when popped and compacted away once they outnumber the
//! live slots, so the heap stays within `2 * slots + COMPACT_SLACK` entries.
//! The slot map is authoritative.
//!
//! Ordering is strictly by priority, then by arrival within a priority.

use crate::request::{Priority, RequestState, TargetId, ThumbnailRequest};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// Stale heap entries tolerated on top of twice the live slot count.
const COMPACT_SLACK: usize = 32;

/// What `submit` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New target, queued.
    Enqueued,
    /// Already queued with the same parameters; priority was raised.
    Promoted,
    /// Already queued with the same parameters at an equal or higher priority.
    AlreadyQueued,
    /// Already being built with the same parameters.
    AlreadyInFlight,
    /// Same target, different parameters: the new request takes over.
    Replaced,
    /// The scheduler is shut down and accepts no more work.
    Rejected,
}

impl SubmitOutcome {
    /// Whether a worker may now have something new to pick up.
    pub fn wakes_worker(self) -> bool {
        matches!(self, SubmitOutcome::Enqueued | SubmitOutcome::Promoted | SubmitOutcome::Replaced)
    }
}

/// What a worker should do with a finished build.
#[derive(Debug)]
pub enum Completion {
    /// Hand the result to this request's callback. It may differ from the
    /// copy the worker popped when the owner re-asked while in flight.
    Deliver(ThumbnailRequest),
    /// Withdrawn while in flight.
    Discard,
    /// Superseded while in flight; the replacement is now queued.
    Requeued,
}

#[derive(Debug)]
struct Slot {
    request: ThumbnailRequest,
    state: RequestState,
    seq: u64,
    withdrawn: bool,
    replacement: Option<ThumbnailRequest>,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: Priority,
    seq: Reverse<u64>,
    target: TargetId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.target.cmp(&other.target))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue with at most one live request per target.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: BinaryHeap<HeapEntry>,
    slots: HashMap<TargetId, Slot>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request`, merging it with any live request for the same target.
    pub fn submit(&mut self, mut request: ThumbnailRequest) -> SubmitOutcome {
        let target = request.target().clone();
        let Some(slot) = self.slots.get_mut(&target) else {
            self.enqueue(request);
            return SubmitOutcome::Enqueued;
        };

        match slot.state {
            RequestState::Queued if slot.request.same_parameters(&request) => {
                if slot.request.increase_priority_to(request.priority()) {
                    let entry = HeapEntry {
                        priority: slot.request.priority(),
                        seq: Reverse(slot.seq),
                        target,
                    };
                    self.heap.push(entry);
                    self.compact_if_bloated();
                    SubmitOutcome::Promoted
                } else {
                    SubmitOutcome::AlreadyQueued
                }
            }
            RequestState::Queued => {
                let previous = slot.request.priority();
                request.increase_priority_to(previous);
                let priority = request.priority();
                slot.request = request;
                if priority > previous {
                    let entry = HeapEntry {
                        priority,
                        seq: Reverse(slot.seq),
                        target,
                    };
                    self.heap.push(entry);
                    self.compact_if_bloated();
                }
                SubmitOutcome::Replaced
            }
            _ => {
                if let Some(pending) = slot.replacement.as_mut() {
                    if pending.same_parameters(&request) {
                        return if pending.increase_priority_to(request.priority()) {
                            SubmitOutcome::Promoted
                        } else {
                            SubmitOutcome::AlreadyQueued
                        };
                    }
                    request.increase_priority_to(pending.priority());
                    slot.replacement = Some(request);
                    return SubmitOutcome::Replaced;
                }

                if slot.request.same_parameters(&request) {
                    // re-asking for a withdrawn build revives it with the new callback
                    if slot.withdrawn {
                        slot.withdrawn = false;
                        slot.request = request;
                    }
                    SubmitOutcome::AlreadyInFlight
                } else {
                    slot.replacement = Some(request);
                    SubmitOutcome::Replaced
                }
            }
        }
    }

    fn enqueue(&mut self, request: ThumbnailRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let target = request.target().clone();
        self.heap.push(HeapEntry {
            priority: request.priority(),
            seq: Reverse(seq),
            target: target.clone(),
        });
        self.slots.insert(
            target,
            Slot {
                request,
                state: RequestState::Queued,
                seq,
                withdrawn: false,
                replacement: None,
            },
        );
    }

    /// Take the highest priority queued request and mark it in progress.
    pub fn pop_next(&mut self) -> Option<ThumbnailRequest> {
        while let Some(entry) = self.heap.pop() {
            let Some(slot) = self.slots.get_mut(&entry.target) else {
                continue;
            };
            if !is_current(slot, &entry) {
                continue;
            }
            slot.state = RequestState::InProgress;
            return Some(slot.request.clone());
        }
        None
    }

    /// Record that the in-flight build for `target` finished.
    pub fn complete(&mut self, target: &TargetId) -> Completion {
        let Some(slot) = self.slots.remove(target) else {
            return Completion::Discard;
        };
        if let Some(replacement) = slot.replacement {
            self.enqueue(replacement);
            return Completion::Requeued;
        }
        if slot.withdrawn {
            Completion::Discard
        } else {
            Completion::Deliver(slot.request)
        }
    }

    /// Cancel the request for `target`. A queued request is dropped; an
    /// in-flight one finishes but its callback is suppressed.
    /// Returns false if nothing was live for `target`.
    pub fn withdraw(&mut self, target: &TargetId) -> bool {
        let Some(slot) = self.slots.get_mut(target) else {
            return false;
        };
        match slot.state {
            RequestState::Queued => {
                self.slots.remove(target);
                self.compact_if_bloated();
            }
            _ => {
                slot.withdrawn = true;
                slot.replacement = None;
            }
        }
        true
    }

    /// Drop heap entries that no longer match a queued slot once they
    /// clearly outnumber the live ones.
    fn compact_if_bloated(&mut self) {
        if self.heap.len() <= 2 * self.slots.len() + COMPACT_SLACK {
            return;
        }
        let slots = &self.slots;
        self.heap
            .retain(|entry| slots.get(&entry.target).is_some_and(|slot| is_current(slot, entry)));
    }

    /// Withdraw everything. Returns how many targets were affected.
    pub fn withdraw_all(&mut self) -> usize {
        let targets: Vec<TargetId> = self.slots.keys().cloned().collect();
        let count = targets.len();
        for target in &targets {
            self.withdraw(target);
        }
        self.heap.clear();
        count
    }

    pub fn state_of(&self, target: &TargetId) -> Option<RequestState> {
        self.slots.get(target).map(|slot| {
            if slot.withdrawn {
                RequestState::Cancelled
            } else {
                slot.state
            }
        })
    }

    /// Priority of the live request for `target`, preferring a pending replacement.
    pub fn priority_of(&self, target: &TargetId) -> Option<Priority> {
        self.slots.get(target).map(|slot| {
            slot.replacement
                .as_ref()
                .unwrap_or(&slot.request)
                .priority()
        })
    }

    pub fn queued_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state == RequestState::Queued)
            .count()
    }

    pub fn in_flight_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state == RequestState::InProgress)
            .count()
    }

    pub fn has_queued(&self) -> bool {
        self.queued_len() > 0
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn is_current(slot: &Slot, entry: &HeapEntry) -> bool {
    slot.state == RequestState::Queued
        && slot.seq == entry.seq.0
        && slot.request.priority() == entry.priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::request;
    use crate::request::{ThumbnailCallback, ThumbnailReady};
    use crate::scale::Bound;
    use crate::source::Rotation;
    use crate::thumbnail::Thumbnail;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn target(id: &str) -> TargetId {
        TargetId::from(id)
    }

    fn drain(queue: &mut RequestQueue) -> Vec<String> {
        let mut order = Vec::new();
        while let Some(req) = queue.pop_next() {
            order.push(req.target().to_string());
        }
        order
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.submit(request("b", "b.png", Priority::High));
        queue.submit(request("c", "c.png", Priority::Low));
        queue.submit(request("d", "d.png", Priority::Highest));
        queue.submit(request("e", "e.png", Priority::High));

        assert_eq!(drain(&mut queue), ["d", "b", "e", "a", "c"]);
        assert_eq!(queue.in_flight_len(), 5);
    }

    #[test]
    fn test_duplicate_submission_promotes() {
        let mut queue = RequestQueue::new();
        assert_eq!(queue.submit(request("a", "a.png", Priority::Low)), SubmitOutcome::Enqueued);
        queue.submit(request("b", "b.png", Priority::Medium));
        assert_eq!(queue.submit(request("a", "a.png", Priority::High)), SubmitOutcome::Promoted);
        assert_eq!(
            queue.submit(request("a", "a.png", Priority::Lowest)),
            SubmitOutcome::AlreadyQueued
        );

        assert_eq!(queue.queued_len(), 2);
        assert_eq!(queue.priority_of(&target("a")), Some(Priority::High));
        // stale heap entry for the old priority must not produce a second pop
        assert_eq!(drain(&mut queue), ["a", "b"]);
    }

    #[test]
    fn test_promotion_keeps_arrival_order_within_level() {
        let mut queue = RequestQueue::new();
        queue.submit(request("first", "1.png", Priority::Low));
        queue.submit(request("second", "2.png", Priority::High));
        queue.submit(request("first", "1.png", Priority::High));

        assert_eq!(drain(&mut queue), ["first", "second"]);
    }

    #[test]
    fn test_different_parameters_replace_queued_request() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "old.png", Priority::High));
        let outcome = queue.submit(request("a", "new.png", Priority::Low));

        assert_eq!(outcome, SubmitOutcome::Replaced);
        assert_eq!(queue.queued_len(), 1);
        let next = queue.pop_next().unwrap();
        assert_eq!(next.source().to_str(), Some("new.png"));
        assert_eq!(next.priority(), Priority::High);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_in_flight_duplicate_is_not_requeued() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.pop_next().unwrap();

        assert_eq!(queue.submit(request("a", "a.png", Priority::Highest)), SubmitOutcome::AlreadyInFlight);
        assert!(queue.pop_next().is_none());
        assert_eq!(queue.state_of(&target("a")), Some(RequestState::InProgress));
        assert!(matches!(queue.complete(&target("a")), Completion::Deliver(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_in_flight_replacement_requeues() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.pop_next().unwrap();

        let rotated = request("a", "a.png", Priority::Medium).with_rotation(Rotation::Degrees(90.0));
        assert_eq!(queue.submit(rotated), SubmitOutcome::Replaced);
        assert!(queue.pop_next().is_none());
        assert_eq!(queue.priority_of(&target("a")), Some(Priority::Medium));

        assert!(matches!(queue.complete(&target("a")), Completion::Requeued));
        let next = queue.pop_next().unwrap();
        assert_eq!(next.rotation(), Rotation::Degrees(90.0));
        assert!(matches!(queue.complete(&target("a")), Completion::Deliver(_)));
    }

    #[test]
    fn test_withdraw_queued_and_in_flight() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.submit(request("b", "b.png", Priority::High));

        let b = queue.pop_next().unwrap();
        assert!(queue.withdraw(&target("a")));
        assert!(queue.withdraw(b.target()));
        assert!(!queue.withdraw(&target("missing")));

        assert!(queue.pop_next().is_none());
        assert_eq!(queue.state_of(&target("a")), None);
        assert_eq!(queue.state_of(&target("b")), Some(RequestState::Cancelled));
        assert!(matches!(queue.complete(&target("b")), Completion::Discard));
    }

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> ThumbnailCallback {
        let log = Arc::clone(log);
        Arc::new(move |_ready: ThumbnailReady| log.lock().push(name))
    }

    #[test]
    fn test_resubmit_after_withdraw_in_flight_delivers_to_new_owner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = RequestQueue::new();
        queue.submit(ThumbnailRequest::new("a", "a.png", Bound::square(100), recording("old", &log)));
        let popped = queue.pop_next().unwrap();
        queue.withdraw(&target("a"));

        let revived = ThumbnailRequest::new("a", "a.png", Bound::square(100), recording("new", &log));
        assert_eq!(queue.submit(revived), SubmitOutcome::AlreadyInFlight);
        assert_eq!(queue.state_of(&target("a")), Some(RequestState::InProgress));

        match queue.complete(popped.target()) {
            Completion::Deliver(owner) => owner.deliver(Ok(Thumbnail::broken())),
            other => panic!("expected delivery, got {other:?}"),
        }
        assert_eq!(*log.lock(), ["new"]);
    }

    #[test]
    fn test_withdraw_churn_keeps_heap_bounded() {
        let mut queue = RequestQueue::new();
        queue.submit(request("steady", "s.png", Priority::Low));
        for i in 0..500 {
            let id = format!("flicker-{}", i % 3);
            queue.submit(request(&id, "f.png", Priority::Medium));
            queue.withdraw(&target(&id));
        }

        assert_eq!(queue.queued_len(), 1);
        assert!(queue.heap.len() <= 2 * queue.slots.len() + COMPACT_SLACK);
        assert_eq!(drain(&mut queue), ["steady"]);
    }

    #[test]
    fn test_promotion_churn_keeps_heap_bounded() {
        let mut queue = RequestQueue::new();
        for _ in 0..100 {
            queue.submit(request("a", "a.png", Priority::Lowest));
            queue.submit(request("a", "a.png", Priority::Highest));
            queue.withdraw(&target("a"));
        }
        queue.submit(request("a", "a.png", Priority::Low));
        assert!(queue.heap.len() <= 2 * queue.slots.len() + COMPACT_SLACK);
        assert_eq!(drain(&mut queue), ["a"]);
    }

    #[test]
    fn test_resubmit_after_completion_is_new() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.pop_next().unwrap();
        queue.complete(&target("a"));

        assert_eq!(queue.submit(request("a", "a.png", Priority::Low)), SubmitOutcome::Enqueued);
        assert_eq!(drain(&mut queue), ["a"]);
    }

    #[test]
    fn test_withdraw_all() {
        let mut queue = RequestQueue::new();
        queue.submit(request("a", "a.png", Priority::Low));
        queue.submit(request("b", "b.png", Priority::Low));
        queue.submit(request("c", "c.png", Priority::Low));
        queue.pop_next().unwrap();

        assert_eq!(queue.withdraw_all(), 3);
        assert_eq!(queue.queued_len(), 0);
        assert_eq!(queue.in_flight_len(), 1);
        assert!(queue.pop_next().is_none());
    }
}
