//! Time-bucketed aggregation of concentration scores

pub mod periodic;
pub mod window;

pub use periodic::{PeriodicAggregator, DEFAULT_BUCKET_WIDTH};
pub use window::{floor_to_width, BucketWindow};
