//! Request classes and the class-partitioned request queue
//!
//! Requests are served strictly by class (interaction before thumbnails
//! before prefetch before compute) and first-in first-out within a class.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

/// Resource class of a frame request.
///
/// Higher numeric values are served first. Each class has its own
/// in-flight limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestType {
    /// Background derivation work
    Compute = 0,
    /// Volumes the user is likely to look at next
    Prefetch = 1,
    Thumbnail = 2,
    /// Data the user is looking at right now
    Interaction = 3,
}

impl RequestType {
    /// All classes, highest priority first.
    pub const ALL: [RequestType; 4] = [
        RequestType::Interaction,
        RequestType::Thumbnail,
        RequestType::Prefetch,
        RequestType::Compute,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Compute => "compute",
            RequestType::Prefetch => "prefetch",
            RequestType::Thumbnail => "thumbnail",
            RequestType::Interaction => "interaction",
        };
        f.write_str(name)
    }
}

/// Unique request identifier
pub type RequestId = u64;

/// One frame of one volume to fetch and decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub volume_id: String,
    pub frame_index: usize,
    /// Transport identifier of the frame, if it has one
    pub image_id: Option<String>,
}

impl FrameRequest {
    pub fn new(volume_id: impl Into<String>, frame_index: usize) -> Self {
        Self {
            volume_id: volume_id.into(),
            frame_index,
            image_id: None,
        }
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }
}

/// A queued request.
///
/// Orders by class, then by submission order (earlier first).
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub id: RequestId,
    pub request_type: RequestType,
    pub request: FrameRequest,
    insertion_order: u64,
}

impl ScheduledRequest {
    pub fn new(
        id: RequestId,
        request_type: RequestType,
        request: FrameRequest,
        insertion_order: u64,
    ) -> Self {
        Self {
            id,
            request_type,
            request,
            insertion_order,
        }
    }

    pub fn volume_id(&self) -> &str {
        &self.request.volume_id
    }

    pub fn frame_index(&self) -> usize {
        self.request.frame_index
    }
}

impl PartialEq for ScheduledRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScheduledRequest {}

impl PartialOrd for ScheduledRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.request_type.cmp(&other.request_type) {
            // Reversed so that "greater" means "served sooner"
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// One FIFO queue per request class.
///
/// Not synchronized on its own; the scheduler owns it behind its lock.
#[derive(Debug, Default)]
pub struct RequestQueue {
    classes: [VecDeque<ScheduledRequest>; 4],
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: ScheduledRequest) {
        self.classes[request.request_type.slot()].push_back(request);
    }

    /// Pop the oldest request of the highest class for which `eligible`
    /// returns true.
    pub fn pop_next(&mut self, eligible: impl Fn(RequestType) -> bool) -> Option<ScheduledRequest> {
        RequestType::ALL
            .into_iter()
            .filter(|class| eligible(*class))
            .find_map(|class| self.classes[class.slot()].pop_front())
    }

    /// The request `pop_next` would return with every class eligible.
    pub fn peek(&self) -> Option<&ScheduledRequest> {
        RequestType::ALL
            .into_iter()
            .find_map(|class| self.classes[class.slot()].front())
    }

    /// Remove every request matching `predicate`, returning them.
    pub fn remove_if(
        &mut self,
        mut predicate: impl FnMut(&ScheduledRequest) -> bool,
    ) -> Vec<ScheduledRequest> {
        let mut removed = Vec::new();
        for queue in &mut self.classes {
            let mut kept = VecDeque::with_capacity(queue.len());
            for request in queue.drain(..) {
                if predicate(&request) {
                    removed.push(request);
                } else {
                    kept.push_back(request);
                }
            }
            *queue = kept;
        }
        removed
    }

    /// Move every request matching `predicate` into class `target`, keeping
    /// submission order within the target class. Returns how many moved.
    pub fn reclassify(
        &mut self,
        target: RequestType,
        predicate: impl FnMut(&ScheduledRequest) -> bool,
    ) -> usize {
        let moved = self.remove_if(predicate);
        let count = moved.len();
        if count == 0 {
            return 0;
        }
        let queue = &mut self.classes[target.slot()];
        queue.extend(moved.into_iter().map(|mut request| {
            request.request_type = target;
            request
        }));
        queue
            .make_contiguous()
            .sort_by_key(|request| request.insertion_order);
        count
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub fn len_of(&self, class: RequestType) -> usize {
        self.classes[class.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledRequest> {
        self.classes.iter().flat_map(|queue| queue.iter())
    }

    pub fn clear(&mut self) -> Vec<ScheduledRequest> {
        self.classes
            .iter_mut()
            .flat_map(|queue| queue.drain(..))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: RequestId, class: RequestType, volume: &str, frame: usize) -> ScheduledRequest {
        ScheduledRequest::new(id, class, FrameRequest::new(volume, frame), id)
    }

    #[test]
    fn test_class_ordering() {
        assert!(RequestType::Interaction > RequestType::Thumbnail);
        assert!(RequestType::Thumbnail > RequestType::Prefetch);
        assert!(RequestType::Prefetch > RequestType::Compute);
        assert_eq!(RequestType::ALL[0], RequestType::Interaction);
    }

    #[test]
    fn test_request_ordering() {
        let early = request(1, RequestType::Prefetch, "a", 0);
        let late = request(2, RequestType::Prefetch, "a", 1);
        let urgent = request(3, RequestType::Interaction, "b", 0);

        assert!(early > late);
        assert!(urgent > early);
    }

    #[test]
    fn test_pop_by_class_then_fifo() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, RequestType::Compute, "a", 0));
        queue.push(request(2, RequestType::Prefetch, "a", 1));
        queue.push(request(3, RequestType::Interaction, "b", 0));
        queue.push(request(4, RequestType::Interaction, "b", 1));

        let order: Vec<RequestId> =
            std::iter::from_fn(|| queue.pop_next(|_| true).map(|r| r.id)).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_skips_ineligible_classes() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, RequestType::Interaction, "a", 0));
        queue.push(request(2, RequestType::Prefetch, "b", 0));

        let next = queue
            .pop_next(|class| class != RequestType::Interaction)
            .unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(queue.peek().map(|r| r.id), Some(1));
    }

    #[test]
    fn test_remove_if() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, RequestType::Prefetch, "a", 0));
        queue.push(request(2, RequestType::Prefetch, "b", 0));
        queue.push(request(3, RequestType::Interaction, "a", 1));

        let removed = queue.remove_if(|r| r.volume_id() == "a");
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().map(|r| r.volume_id()), Some("b"));
    }

    #[test]
    fn test_reclassify_keeps_submission_order() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, RequestType::Prefetch, "a", 0));
        queue.push(request(2, RequestType::Interaction, "b", 0));
        queue.push(request(3, RequestType::Prefetch, "a", 1));

        assert_eq!(queue.reclassify(RequestType::Interaction, |r| r.volume_id() == "a"), 2);
        assert_eq!(queue.len_of(RequestType::Prefetch), 0);

        let order: Vec<RequestId> =
            std::iter::from_fn(|| queue.pop_next(|_| true).map(|r| r.id)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_returns_everything() {
        let mut queue = RequestQueue::new();
        for (id, class) in RequestType::ALL.into_iter().enumerate() {
            queue.push(request(id as RequestId, class, "a", id));
        }
        assert_eq!(queue.clear().len(), 4);
        assert!(queue.is_empty());
    }
}
