pub mod engine;
pub mod runner;

pub use engine::{calc_score, AnalysisBuffer, ScoringConfig, ScoringEngine};
pub use runner::ScoringLoop;
