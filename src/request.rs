// src/request.rs
//! Stream requests and the multi-priority staging queue.
//!
//! Requests are owned values: they sit in exactly one priority sub-queue
//! until a worker unlinks them, then live on that worker's stack until
//! installed or failed. Status travels separately through a shared,
//! cloneable [`RequestHandle`] so callers can poll or wait without touching
//! the queue again.
//!
//! Five priority classes, strict ordering across classes, FIFO within one.
//! Each class has its own lock; `pop_next` holds a class lock only long
//! enough to unlink the oldest element.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

// ============================================================================
// Priorities
// ============================================================================

/// Request urgency, most urgent first. `Critical` is for assets the current
/// frame cannot present without; `Low` is opportunistic filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Prefetch,
    Low,
}

pub const PRIORITY_COUNT: usize = 5;

impl Priority {
    pub const ALL: [Priority; PRIORITY_COUNT] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Prefetch,
        Priority::Low,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Prefetch => "prefetch",
            Priority::Low => "low",
        }
    }
}

// ============================================================================
// Status handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Pending = 0,
    Loading = 1,
    Complete = 2,
    Failed = 3,
}

impl RequestStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Loading,
            2 => RequestStatus::Complete,
            _ => RequestStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Failed)
    }
}

#[derive(Debug)]
struct RequestState {
    id: u64,
    lod: u32,
    priority: Priority,
    frame: u64,
    status: AtomicU8,
    done_lock: Mutex<bool>,
    done_cv: Condvar,
}

/// Cloneable view of one request's lifecycle. Status only ever moves
/// forward: Pending → Loading → Complete | Failed.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    state: Arc<RequestState>,
}

impl RequestHandle {
    pub(crate) fn new(id: u64, lod: u32, priority: Priority, frame: u64) -> Self {
        Self {
            state: Arc::new(RequestState {
                id,
                lod,
                priority,
                frame,
                status: AtomicU8::new(RequestStatus::Pending as u8),
                done_lock: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
        }
    }

    pub fn asset_id(&self) -> u64 {
        self.state.id
    }

    pub fn lod(&self) -> u32 {
        self.state.lod
    }

    pub fn priority(&self) -> Priority {
        self.state.priority
    }

    /// Frame the request was enqueued on.
    pub fn frame(&self) -> u64 {
        self.state.frame
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.state.status.load(Ordering::Acquire))
    }

    pub fn is_complete(&self) -> bool {
        self.status() == RequestStatus::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.status() == RequestStatus::Failed
    }

    /// Advance the status, refusing backward transitions.
    pub(crate) fn set_status(&self, status: RequestStatus) {
        let new = status as u8;
        let mut current = self.state.status.load(Ordering::Acquire);
        loop {
            if current >= new {
                return;
            }
            match self.state.status.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if status.is_terminal() {
            let mut done = self.state.done_lock.lock();
            *done = true;
            self.state.done_cv.notify_all();
        }
    }

    /// Block until the request reaches a terminal status or the timeout
    /// elapses. Returns the status observed at wake-up.
    pub fn wait(&self, timeout: Duration) -> RequestStatus {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.done_lock.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self
                .state
                .done_cv
                .wait_for(&mut done, deadline - now)
                .timed_out()
            {
                break;
            }
        }
        drop(done);
        self.status()
    }
}

// ============================================================================
// Request value
// ============================================================================

/// Callback fired with the installed bytes on successful completion.
pub type CompletionFn = Box<dyn FnOnce(&[u8]) + Send>;

pub struct StreamRequest {
    pub id: u64,
    pub priority: Priority,
    pub lod: u32,
    pub frame: u64,
    pub handle: RequestHandle,
    pub completion: Option<CompletionFn>,
}

impl StreamRequest {
    pub fn new(id: u64, priority: Priority, lod: u32, frame: u64) -> Self {
        Self {
            id,
            priority,
            lod,
            frame,
            handle: RequestHandle::new(id, lod, priority, frame),
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: CompletionFn) -> Self {
        self.completion = Some(completion);
        self
    }
}

impl std::fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRequest")
            .field("id", &format_args!("{:#018x}", self.id))
            .field("priority", &self.priority)
            .field("lod", &self.lod)
            .field("frame", &self.frame)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

// ============================================================================
// Queue
// ============================================================================

pub struct RequestQueue {
    classes: [Mutex<VecDeque<StreamRequest>>; PRIORITY_COUNT],
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
        }
    }

    /// Stage a request. New arrivals go to the head; consumers take from
    /// the tail, so within a class order is insertion order.
    pub fn push(&self, request: StreamRequest) {
        self.classes[request.priority.index()]
            .lock()
            .push_front(request);
    }

    /// Unlink the oldest request from the highest-priority non-empty class.
    pub fn pop_next(&self) -> Option<StreamRequest> {
        for class in &self.classes {
            if let Some(request) = class.lock().pop_back() {
                return Some(request);
            }
        }
        None
    }

    /// Per-class depths, `Critical` first.
    pub fn depths(&self) -> [usize; PRIORITY_COUNT] {
        std::array::from_fn(|i| self.classes[i].lock().len())
    }

    pub fn len(&self) -> usize {
        self.depths().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|c| c.lock().is_empty())
    }

    /// Empty every class, dropping the requests without firing callbacks.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        for class in &self.classes {
            let mut queue = class.lock();
            dropped += queue.len();
            queue.clear();
        }
        dropped
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_is_strict() {
        let queue = RequestQueue::new();
        queue.push(StreamRequest::new(1, Priority::Low, 0, 0));
        queue.push(StreamRequest::new(2, Priority::Normal, 0, 0));
        queue.push(StreamRequest::new(3, Priority::Critical, 0, 0));
        queue.push(StreamRequest::new(4, Priority::Prefetch, 0, 0));
        queue.push(StreamRequest::new(5, Priority::High, 0, 0));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_next().map(|r| r.id)).collect();
        assert_eq!(order, vec![3, 5, 2, 4, 1]);
    }

    #[test]
    fn test_fifo_within_class() {
        let queue = RequestQueue::new();
        for id in 0..10u64 {
            queue.push(StreamRequest::new(id, Priority::Normal, 0, 0));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_next().map(|r| r.id)).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_depths_and_drain() {
        let queue = RequestQueue::new();
        queue.push(StreamRequest::new(1, Priority::Critical, 0, 0));
        queue.push(StreamRequest::new(2, Priority::Low, 0, 0));
        queue.push(StreamRequest::new(3, Priority::Low, 0, 0));

        let depths = queue.depths();
        assert_eq!(depths[Priority::Critical.index()], 1);
        assert_eq!(depths[Priority::Low.index()], 2);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_status_transitions_forward_only() {
        let handle = RequestHandle::new(1, 0, Priority::Normal, 0);
        assert_eq!(handle.status(), RequestStatus::Pending);

        handle.set_status(RequestStatus::Loading);
        assert_eq!(handle.status(), RequestStatus::Loading);

        handle.set_status(RequestStatus::Complete);
        assert_eq!(handle.status(), RequestStatus::Complete);

        // Terminal states never roll back.
        handle.set_status(RequestStatus::Loading);
        assert_eq!(handle.status(), RequestStatus::Complete);
        handle.set_status(RequestStatus::Pending);
        assert_eq!(handle.status(), RequestStatus::Complete);
    }

    #[test]
    fn test_wait_returns_on_completion() {
        let handle = RequestHandle::new(1, 0, Priority::Normal, 0);
        let waiter = handle.clone();
        let thread = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        handle.set_status(RequestStatus::Complete);
        assert_eq!(thread.join().unwrap(), RequestStatus::Complete);
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let handle = RequestHandle::new(1, 0, Priority::Normal, 0);
        let status = handle.wait(Duration::from_millis(20));
        assert_eq!(status, RequestStatus::Pending);
    }

    #[test]
    fn test_handle_metadata() {
        let handle = RequestHandle::new(0xABCD, 2, Priority::High, 7);
        assert_eq!(handle.asset_id(), 0xABCD);
        assert_eq!(handle.lod(), 2);
        assert_eq!(handle.priority(), Priority::High);
        assert_eq!(handle.frame(), 7);
    }
}
