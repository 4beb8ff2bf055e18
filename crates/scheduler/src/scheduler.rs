//! Frame request scheduler
//!
//! Tracks queued and in-flight frame requests for every volume being
//! streamed. Requests can be withdrawn per volume and moved between classes
//! while they are still queued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::priority::{FrameRequest, RequestId, RequestQueue, RequestType, ScheduledRequest};

/// Default concurrent requests per class.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 6;

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    /// Queued requests cancelled before they started
    pub requests_cancelled: u64,
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct InFlight {
    request_type: RequestType,
    volume_id: String,
    frame_index: usize,
}

struct SchedulerState {
    queue: RequestQueue,
    in_flight: HashMap<RequestId, InFlight>,
    max_in_flight: usize,
    next_id: RequestId,
    insertion_counter: u64,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn in_flight_of(&self, class: RequestType) -> usize {
        self.in_flight
            .values()
            .filter(|entry| entry.request_type == class)
            .count()
    }
}

/// Shared request scheduler.
///
/// Clones share the same queue. At most `max_in_flight` requests of each
/// class are handed out at a time; [`RequestScheduler::next_request`] skips
/// saturated classes.
///
/// # Example
///
/// ```
/// use voxstream_scheduler::{FrameRequest, RequestScheduler, RequestType};
///
/// let scheduler = RequestScheduler::new(2);
/// for frame in 0..4 {
///     scheduler.submit(RequestType::Prefetch, FrameRequest::new("ct-1", frame));
/// }
///
/// let first = scheduler.next_request().unwrap();
/// let _second = scheduler.next_request().unwrap();
/// // both prefetch slots are busy
/// assert!(scheduler.next_request().is_none());
///
/// scheduler.complete_request(first.id);
/// assert!(scheduler.next_request().is_some());
/// ```
#[derive(Clone)]
pub struct RequestScheduler {
    state: Arc<Mutex<SchedulerState>>,
    cancellation: CancellationRegistry,
}

impl RequestScheduler {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                queue: RequestQueue::new(),
                in_flight: HashMap::new(),
                max_in_flight: max_in_flight.max(1),
                next_id: 1,
                insertion_counter: 0,
                stats: SchedulerStats::default(),
            })),
            cancellation: CancellationRegistry::new(),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn set_max_in_flight(&self, max_in_flight: usize) {
        self.state.lock().max_in_flight = max_in_flight.max(1);
    }

    /// Queue a request. Returns its id and the token the executor should watch.
    pub fn submit(
        &self,
        request_type: RequestType,
        request: FrameRequest,
    ) -> (RequestId, CancellationToken) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let insertion_order = state.insertion_counter;
        state.insertion_counter += 1;
        state.stats.requests_submitted += 1;

        trace!(
            request = id,
            class = %request_type,
            volume = %request.volume_id,
            frame = request.frame_index,
            "request queued"
        );
        state
            .queue
            .push(ScheduledRequest::new(id, request_type, request, insertion_order));
        // Registered under the lock so a concurrent cancel_volume sees the token
        let token = self.cancellation.register(id);
        (id, token)
    }

    /// Hand out the next request whose class still has a free slot.
    ///
    /// The request counts as in flight until [`RequestScheduler::complete_request`].
    pub fn next_request(&self) -> Option<ScheduledRequest> {
        let mut state = self.state.lock();
        let max = state.max_in_flight;
        let busy: HashMap<RequestType, usize> = RequestType::ALL
            .into_iter()
            .map(|class| (class, state.in_flight_of(class)))
            .collect();
        let request = state
            .queue
            .pop_next(|class| busy.get(&class).copied().unwrap_or(0) < max)?;
        state.in_flight.insert(
            request.id,
            InFlight {
                request_type: request.request_type,
                volume_id: request.request.volume_id.clone(),
                frame_index: request.request.frame_index,
            },
        );
        Some(request)
    }

    /// Release an in-flight slot. Returns `false` for unknown ids.
    pub fn complete_request(&self, id: RequestId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.in_flight.remove(&id).is_some();
            if removed {
                state.stats.requests_completed += 1;
            }
            removed
        };
        self.cancellation.unregister(id);
        removed
    }

    /// Flag one request as cancelled. Returns `false` for unknown or
    /// already cancelled ids.
    ///
    /// A queued request stays in the queue with its token set. Whoever
    /// drains the scheduler still receives it and can decide to re-issue the
    /// frame if its owner needs it.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        let Some(token) = self.cancellation.get(id) else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        let mut state = self.state.lock();
        if state.queue.iter().any(|request| request.id == id) {
            state.stats.requests_cancelled += 1;
        }
        true
    }

    /// Withdraw every queued request of a volume and flag its in-flight ones.
    ///
    /// Other volumes' requests are untouched. Returns the number of requests
    /// affected.
    pub fn cancel_volume(&self, volume_id: &str) -> usize {
        let (withdrawn, running) = {
            let mut state = self.state.lock();
            let withdrawn: Vec<RequestId> = state
                .queue
                .remove_if(|request| request.volume_id() == volume_id)
                .into_iter()
                .map(|request| request.id)
                .collect();
            state.stats.requests_cancelled += withdrawn.len() as u64;
            let running: Vec<RequestId> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.volume_id == volume_id)
                .map(|(id, _)| *id)
                .collect();
            (withdrawn, running)
        };

        self.cancellation.cancel_many(&withdrawn);
        self.cancellation.unregister_many(&withdrawn);
        self.cancellation.cancel_many(&running);

        debug!(
            volume = %volume_id,
            withdrawn = withdrawn.len(),
            running = running.len(),
            "volume requests cancelled"
        );
        withdrawn.len() + running.len()
    }

    /// Move a volume's queued requests to another class.
    pub fn reprioritize_volume(&self, volume_id: &str, request_type: RequestType) -> usize {
        let moved = self
            .state
            .lock()
            .queue
            .reclassify(request_type, |request| request.volume_id() == volume_id);
        if moved > 0 {
            debug!(volume = %volume_id, class = %request_type, moved, "volume reprioritized");
        }
        moved
    }

    /// Frames of a volume that are queued or running and not cancelled.
    pub fn outstanding_frames(&self, volume_id: &str) -> Vec<usize> {
        let state = self.state.lock();
        let queued = state
            .queue
            .iter()
            .filter(|request| request.volume_id() == volume_id)
            .map(|request| (request.id, request.frame_index()));
        let running = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.volume_id == volume_id)
            .map(|(id, entry)| (*id, entry.frame_index));
        let mut frames: Vec<usize> = queued
            .chain(running)
            .filter(|(id, _)| !self.cancellation.is_cancelled(*id))
            .map(|(_, frame)| frame)
            .collect();
        frames.sort_unstable();
        frames
    }

    pub fn cancellation_token(&self, id: RequestId) -> Option<CancellationToken> {
        self.cancellation.get(id)
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    pub fn pending_of(&self, class: RequestType) -> usize {
        self.state.lock().queue.len_of(class)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn in_flight_of(&self, class: RequestType) -> usize {
        self.state.lock().in_flight_of(class)
    }

    /// Pending requests in class order (for inspection).
    pub fn pending_list(&self) -> Vec<ScheduledRequest> {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Withdraw every queued request and flag every running one.
    pub fn clear(&self) {
        let (withdrawn, running) = {
            let mut state = self.state.lock();
            let withdrawn: Vec<RequestId> = state.queue.clear().into_iter().map(|r| r.id).collect();
            state.stats.requests_cancelled += withdrawn.len() as u64;
            let running: Vec<RequestId> = state.in_flight.keys().copied().collect();
            (withdrawn, running)
        };
        self.cancellation.cancel_many(&withdrawn);
        self.cancellation.unregister_many(&withdrawn);
        self.cancellation.cancel_many(&running);
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            ..state.stats.clone()
        }
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RequestScheduler")
            .field("queued", &stats.queued)
            .field("in_flight", &stats.in_flight)
            .finish()
    }
}
