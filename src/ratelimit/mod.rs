//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod registry;

pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::BucketRegistry;
