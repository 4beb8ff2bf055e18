//! Voxstream Scheduler Library
//!
//! Class-based request scheduling for frame fetches.
//!
//! Every frame of a streamed volume becomes one [`FrameRequest`]. Requests
//! are served by class (interaction, thumbnail, prefetch, compute) and in
//! submission order within a class, with a cap on concurrent requests per
//! class. A volume's requests can be withdrawn or moved to another class as
//! a unit.
//!
//! # Example
//!
//! ```
//! use voxstream_scheduler::{FrameRequest, RequestScheduler, RequestType};
//!
//! let scheduler = RequestScheduler::default();
//! for frame in 0..3 {
//!     scheduler.submit(RequestType::Prefetch, FrameRequest::new("pet-2", frame));
//! }
//! let (_, token) = scheduler.submit(RequestType::Interaction, FrameRequest::new("ct-1", 0));
//!
//! // interaction work jumps the queue
//! let request = scheduler.next_request().unwrap();
//! assert_eq!(request.volume_id(), "ct-1");
//! assert!(!token.is_cancelled());
//! scheduler.complete_request(request.id);
//!
//! // the user closed the PET series
//! assert_eq!(scheduler.cancel_volume("pet-2"), 3);
//! assert!(!scheduler.has_pending_requests());
//! ```

mod cancel;
mod priority;
mod scheduler;
mod worker;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use priority::{FrameRequest, RequestId, RequestQueue, RequestType, ScheduledRequest};
pub use scheduler::{RequestScheduler, SchedulerStats, DEFAULT_MAX_IN_FLIGHT};
pub use worker::{RequestExecutor, WorkerPool, WorkerPoolConfig};
