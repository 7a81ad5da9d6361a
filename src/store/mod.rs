pub mod accumulator;
pub mod latest;
pub mod monitor;

pub use accumulator::{ScoreAccumulator, DEFAULT_EVOLUTION_THRESHOLD};
pub use latest::LatestValueStore;
pub use monitor::MonitorState;
