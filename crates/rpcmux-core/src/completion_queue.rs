//! Completion queue
//!
//! Work is submitted against a queue with an opaque `Tag`; the transport
//! posts one completion per submission. Consumers either take whatever
//! arrives first (`next`) or wait for one specific tag (`pluck`).
//!
//! Lifecycle:
//!
//! ```text
//! ACTIVE --shutdown()--> SHUTTING_DOWN --(outstanding == 0, list empty)--> SHUTDOWN
//! ```
//!
//! Every submission is bracketed by `begin_op` (before handing work to the
//! transport) and `end_op` (when the transport reports completion). The
//! queue reaches SHUTDOWN only after every begun op has ended and every
//! posted completion has been claimed.
//!
//! A completion may carry a `CompletionHandler`. The thread that claims the
//! completion runs it outside the queue lock; the handler decides the final
//! `ok` flag and may hide the completion from the caller altogether.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::CallError;
use crate::tag::Tag;
use crate::Deadline;

/// Default cap on threads plucking one queue at the same time.
pub const DEFAULT_MAX_PLUCKERS: usize = 6;

/// Result of `next` / `pluck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A completion was claimed.
    Op { tag: Tag, ok: bool },
    /// The deadline passed with nothing claimable.
    Timeout,
    /// The queue is shut down and fully drained.
    Shutdown,
}

impl Event {
    /// `ok` of an `Op` event; `false` for `Timeout` and `Shutdown`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Event::Op { ok: true, .. })
    }
}

/// Observable queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    ShuttingDown,
    Shutdown,
}

/// Finisher attached to a completion.
pub trait CompletionHandler: Send {
    /// Runs once, on the thread that claimed the completion, with the
    /// transport-reported `ok`. Returns the flag to surface, or `None` if
    /// the completion must not be surfaced to the caller.
    fn finalize(self: Box<Self>, ok: bool) -> Option<bool>;
}

struct Completion {
    tag: Tag,
    ok: bool,
    handler: Option<Box<dyn CompletionHandler>>,
}

impl Completion {
    /// Run the handler. `None` when the completion is hidden.
    fn finish(self) -> Option<Event> {
        let ok = match self.handler {
            Some(handler) => handler.finalize(self.ok)?,
            None => self.ok,
        };
        Some(Event::Op { tag: self.tag, ok })
    }
}

struct Shared {
    completions: VecDeque<Completion>,
    /// Ops begun but not yet ended.
    outstanding: usize,
    shutdown_called: bool,
    /// Threads currently inside `pluck`.
    pluckers: usize,
}

impl Shared {
    #[inline]
    fn is_drained(&self) -> bool {
        self.shutdown_called && self.outstanding == 0 && self.completions.is_empty()
    }
}

struct Inner {
    shared: Mutex<Shared>,
    cond: Condvar,
    max_pluckers: usize,
}

/// Shared handle to a completion queue.
///
/// Cloning is cheap; every call and every in-flight batch holds a clone.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<Inner>,
}

impl CompletionQueue {
    pub fn create() -> Self {
        Self::with_max_pluckers(DEFAULT_MAX_PLUCKERS)
    }

    /// Queue allowing at most `max_pluckers` concurrent `pluck` callers.
    pub fn with_max_pluckers(max_pluckers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    completions: VecDeque::new(),
                    outstanding: 0,
                    shutdown_called: false,
                    pluckers: 0,
                }),
                cond: Condvar::new(),
                max_pluckers: max_pluckers.max(1),
            }),
        }
    }

    /// Register an op that will later be ended with `end_op`.
    pub fn begin_op(&self, tag: Tag) -> Result<(), CallError> {
        let mut shared = self.lock();
        if shared.shutdown_called {
            log::debug!("begin_op({tag}) rejected: queue shut down");
            return Err(CallError::QueueShutdown);
        }
        shared.outstanding += 1;
        Ok(())
    }

    /// Post the completion of an op started with `begin_op`.
    ///
    /// # Panics
    ///
    /// If no op is outstanding.
    pub fn end_op(&self, tag: Tag, ok: bool, handler: Option<Box<dyn CompletionHandler>>) {
        {
            let mut shared = self.lock();
            assert!(shared.outstanding > 0, "end_op({tag}) without a matching begin_op");
            shared.outstanding -= 1;
            shared.completions.push_back(Completion { tag, ok, handler });
        }
        log::trace!("completion posted: {tag} ok={ok}");
        // Pluckers wait for specific tags, so everyone re-checks.
        self.inner.cond.notify_all();
    }

    /// Wait for any completion.
    pub fn next(&self, deadline: Deadline) -> Event {
        loop {
            let completion = {
                let mut shared = self.lock();
                loop {
                    if let Some(c) = shared.completions.pop_front() {
                        self.notify_if_drained(&shared);
                        break c;
                    }
                    if shared.is_drained() {
                        return Event::Shutdown;
                    }
                    let (guard, expired) = self.wait(shared, deadline);
                    shared = guard;
                    if expired && shared.completions.is_empty() && !shared.is_drained() {
                        return Event::Timeout;
                    }
                }
            };

            if let Some(event) = completion.finish() {
                return event;
            }
        }
    }

    /// Wait for the completion of `tag`.
    ///
    /// Completions for other tags stay queued, in order, for other callers.
    pub fn pluck(&self, tag: Tag, deadline: Deadline) -> Event {
        loop {
            let completion = {
                let mut shared = self.lock();
                if shared.pluckers >= self.inner.max_pluckers {
                    log::error!(
                        "pluck({tag}): too many concurrent pluckers (max {})",
                        self.inner.max_pluckers
                    );
                    return Event::Timeout;
                }
                shared.pluckers += 1;

                let claimed = loop {
                    let pos = shared.completions.iter().position(|c| c.tag == tag);
                    if let Some(c) = pos.and_then(|p| shared.completions.remove(p)) {
                        self.notify_if_drained(&shared);
                        break Ok(c);
                    }
                    if shared.is_drained() {
                        break Err(Event::Shutdown);
                    }
                    let (guard, expired) = self.wait(shared, deadline);
                    shared = guard;
                    if expired && !shared.completions.iter().any(|c| c.tag == tag) {
                        break Err(Event::Timeout);
                    }
                };

                shared.pluckers -= 1;
                match claimed {
                    Ok(c) => c,
                    Err(event) => return event,
                }
            };

            // A hidden completion for this tag is consumed; keep waiting
            // until the deadline or shutdown settles the call.
            if let Some(event) = completion.finish() {
                return event;
            }
        }
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        let mut shared = self.lock();
        if shared.shutdown_called {
            return;
        }
        shared.shutdown_called = true;
        log::debug!(
            "completion queue shutting down: {} outstanding, {} unclaimed",
            shared.outstanding,
            shared.completions.len()
        );
        drop(shared);
        self.inner.cond.notify_all();
    }

    /// Release this handle.
    ///
    /// # Panics
    ///
    /// If the queue has not reached SHUTDOWN.
    pub fn destroy(self) {
        let state = self.state();
        assert!(
            state == QueueState::Shutdown,
            "completion queue destroyed in state {state:?}"
        );
    }

    pub fn state(&self) -> QueueState {
        let shared = self.lock();
        if shared.is_drained() {
            QueueState::Shutdown
        } else if shared.shutdown_called {
            QueueState::ShuttingDown
        } else {
            QueueState::Active
        }
    }

    /// Ops begun and not yet ended.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Posted completions not yet claimed.
    pub fn unclaimed(&self) -> usize {
        self.lock().completions.len()
    }

    pub fn max_pluckers(&self) -> usize {
        self.inner.max_pluckers
    }

    /// Same underlying queue.
    pub fn ptr_eq(&self, other: &CompletionQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_if_drained(&self, shared: &Shared) {
        if shared.is_drained() {
            self.inner.cond.notify_all();
        }
    }

    /// Block until notified or `deadline`. The flag is true once the
    /// deadline has passed.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Shared>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, Shared>, bool) {
        match deadline {
            None => {
                let guard = self
                    .inner
                    .cond
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return (guard, true);
                }
                let (guard, _) = self
                    .inner
                    .cond
                    .wait_timeout(guard, at - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, Instant::now() >= at)
            }
        }
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock();
        f.debug_struct("CompletionQueue")
            .field("outstanding", &shared.outstanding)
            .field("unclaimed", &shared.completions.len())
            .field("shutdown_called", &shared.shutdown_called)
            .finish()
    }
}

// ============================================================================
// Batch completion handle
// ============================================================================

/// Marks one direction (send or receive) of a call as busy.
///
/// Released when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// Claim `flag`; `None` if it is already claimed.
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Completion handle a transport receives with each batch.
///
/// The submitter has already called `begin_op`. `complete` posts the
/// completion exactly once; dropping the handle without completing posts
/// `ok = false`, so a submitted tag always completes.
pub struct BatchDone {
    cq: CompletionQueue,
    tag: Tag,
    handler: Option<Box<dyn CompletionHandler>>,
    guards: Vec<InFlightGuard>,
    completed: bool,
}

impl BatchDone {
    pub fn new(cq: CompletionQueue, tag: Tag, handler: Option<Box<dyn CompletionHandler>>) -> Self {
        Self {
            cq,
            tag,
            handler,
            guards: Vec::new(),
            completed: false,
        }
    }

    /// Hold `guard` until the batch completes.
    pub fn with_guard(mut self, guard: InFlightGuard) -> Self {
        self.guards.push(guard);
        self
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn complete(mut self, ok: bool) {
        self.post(ok);
    }

    fn post(&mut self, ok: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        // Free the call's direction before anyone can observe the tag.
        self.guards.clear();
        let handler = self.handler.take();
        self.cq.end_op(self.tag, ok, handler);
    }
}

impl Drop for BatchDone {
    fn drop(&mut self) {
        if !self.completed {
            log::warn!("batch {} dropped by transport without completion", self.tag);
            self.post(false);
        }
    }
}

impl fmt::Debug for BatchDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDone")
            .field("tag", &self.tag)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn soon(ms: u64) -> Deadline {
        crate::deadline_after(Duration::from_millis(ms))
    }

    fn post(cq: &CompletionQueue, tag: u64, ok: bool) {
        cq.begin_op(Tag(tag)).unwrap();
        cq.end_op(Tag(tag), ok, None);
    }

    struct Flip;
    impl CompletionHandler for Flip {
        fn finalize(self: Box<Self>, ok: bool) -> Option<bool> {
            Some(!ok)
        }
    }

    struct Hidden;
    impl CompletionHandler for Hidden {
        fn finalize(self: Box<Self>, _ok: bool) -> Option<bool> {
            None
        }
    }

    #[test]
    fn test_next_returns_in_arrival_order() {
        let cq = CompletionQueue::create();
        post(&cq, 1, true);
        post(&cq, 2, false);
        assert_eq!(cq.next(None), Event::Op { tag: Tag(1), ok: true });
        assert_eq!(cq.next(None), Event::Op { tag: Tag(2), ok: false });
        assert_eq!(cq.next(soon(10)), Event::Timeout);
    }

    #[test]
    fn test_past_deadline_still_claims_available() {
        let cq = CompletionQueue::create();
        post(&cq, 9, true);
        let past = Some(Instant::now() - Duration::from_millis(5));
        assert!(cq.next(past).is_ok());
        assert_eq!(cq.next(past), Event::Timeout);
    }

    #[test]
    fn test_pluck_leaves_other_tags_queued() {
        let cq = CompletionQueue::create();
        post(&cq, 1, true);
        post(&cq, 2, true);
        post(&cq, 3, true);

        assert_eq!(cq.pluck(Tag(2), None), Event::Op { tag: Tag(2), ok: true });
        assert_eq!(cq.pluck(Tag(2), soon(10)), Event::Timeout);
        assert_eq!(cq.next(None), Event::Op { tag: Tag(1), ok: true });
        assert_eq!(cq.next(None), Event::Op { tag: Tag(3), ok: true });
    }

    #[test]
    fn test_pluck_waits_for_late_completion() {
        let cq = CompletionQueue::create();
        cq.begin_op(Tag(7)).unwrap();
        let poster = cq.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            poster.end_op(Tag(7), true, None);
        });
        assert_eq!(cq.pluck(Tag(7), soon(5_000)), Event::Op { tag: Tag(7), ok: true });
        h.join().unwrap();
    }

    #[test]
    fn test_disjoint_pluckers_both_succeed() {
        let cq = CompletionQueue::create();
        cq.begin_op(Tag(10)).unwrap();
        cq.begin_op(Tag(20)).unwrap();

        let waiters: Vec<_> = [10u64, 20]
            .into_iter()
            .map(|t| {
                let cq = cq.clone();
                thread::spawn(move || cq.pluck(Tag(t), soon(5_000)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        cq.end_op(Tag(20), true, None);
        cq.end_op(Tag(10), true, None);

        let results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], Event::Op { tag: Tag(10), ok: true });
        assert_eq!(results[1], Event::Op { tag: Tag(20), ok: true });
    }

    #[test]
    fn test_concurrent_next_gets_distinct_events() {
        let cq = CompletionQueue::create();
        let takers: Vec<_> = (0..4)
            .map(|_| {
                let cq = cq.clone();
                thread::spawn(move || cq.next(soon(5_000)))
            })
            .collect();
        for t in 0..4 {
            post(&cq, t, true);
        }
        let mut tags: Vec<u64> = takers
            .into_iter()
            .map(|h| match h.join().unwrap() {
                Event::Op { tag, .. } => tag.0,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_shutdown_drains_then_reports() {
        let cq = CompletionQueue::create();
        post(&cq, 1, true);
        cq.begin_op(Tag(2)).unwrap();
        cq.shutdown();

        assert_eq!(cq.state(), QueueState::ShuttingDown);
        assert_eq!(cq.begin_op(Tag(3)), Err(CallError::QueueShutdown));
        assert!(cq.next(None).is_ok());

        let poster = cq.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.end_op(Tag(2), true, None);
        });
        assert_eq!(cq.next(None), Event::Op { tag: Tag(2), ok: true });
        assert_eq!(cq.next(None), Event::Shutdown);
        assert_eq!(cq.pluck(Tag(2), None), Event::Shutdown);
        h.join().unwrap();
        cq.destroy();
    }

    #[test]
    fn test_shutdown_wakes_blocked_waiter() {
        let cq = CompletionQueue::create();
        let waiter = cq.clone();
        let h = thread::spawn(move || waiter.next(None));
        thread::sleep(Duration::from_millis(20));
        cq.shutdown();
        assert_eq!(h.join().unwrap(), Event::Shutdown);
    }

    #[test]
    #[should_panic(expected = "destroyed in state Active")]
    fn test_destroy_before_shutdown_panics() {
        CompletionQueue::create().destroy();
    }

    #[test]
    fn test_handler_decides_ok_and_visibility() {
        let cq = CompletionQueue::create();
        cq.begin_op(Tag(1)).unwrap();
        cq.end_op(Tag(1), true, Some(Box::new(Hidden)));
        cq.begin_op(Tag(2)).unwrap();
        cq.end_op(Tag(2), true, Some(Box::new(Flip)));

        assert_eq!(cq.next(None), Event::Op { tag: Tag(2), ok: false });
        assert_eq!(cq.unclaimed(), 0);
        assert_eq!(cq.next(soon(10)), Event::Timeout);
    }

    #[test]
    fn test_too_many_pluckers() {
        let cq = CompletionQueue::with_max_pluckers(1);
        assert_eq!(cq.max_pluckers(), 1);
        assert_eq!(CompletionQueue::with_max_pluckers(0).max_pluckers(), 1);
        cq.begin_op(Tag(1)).unwrap();
        let busy = cq.clone();
        let h = thread::spawn(move || busy.pluck(Tag(1), soon(5_000)));
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        assert_eq!(cq.pluck(Tag(2), soon(5_000)), Event::Timeout);
        assert!(start.elapsed() < Duration::from_secs(1));

        cq.end_op(Tag(1), true, None);
        assert!(h.join().unwrap().is_ok());
    }

    #[test]
    fn test_dropped_batch_done_posts_failure() {
        let cq = CompletionQueue::create();
        let flag = Arc::new(AtomicBool::new(false));
        cq.begin_op(Tag(5)).unwrap();
        let guard = InFlightGuard::try_acquire(&flag).unwrap();
        assert!(InFlightGuard::try_acquire(&flag).is_none());

        drop(BatchDone::new(cq.clone(), Tag(5), None).with_guard(guard));

        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(cq.pluck(Tag(5), None), Event::Op { tag: Tag(5), ok: false });
    }
}
