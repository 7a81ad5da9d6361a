//! Process-wide accumulated concentration score
//!
//! Every received score is added to a running total. Once the total passes the
//! evolution threshold the accumulator latches into the evolved state, which the web
//! tier uses to switch its presentation.

use log::info;
use std::sync::Mutex;

/// Default total score required to evolve
pub const DEFAULT_EVOLUTION_THRESHOLD: f64 = 5000.0;

#[derive(Debug, Default)]
struct Totals {
    accumulated: f64,
    is_evolved: bool,
}

/// Running total of received scores, shared by constructor injection
#[derive(Debug)]
pub struct ScoreAccumulator {
    totals: Mutex<Totals>,
    evolution_threshold: f64,
}

impl ScoreAccumulator {
    pub fn new(evolution_threshold: f64) -> Self {
        Self {
            totals: Mutex::new(Totals::default()),
            evolution_threshold,
        }
    }

    /// Add a score; returns `true` if this call crossed the evolution threshold
    pub fn add(&self, score: f64) -> bool {
        let mut totals = match self.totals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        totals.accumulated += score;
        if !totals.is_evolved && totals.accumulated > self.evolution_threshold {
            totals.is_evolved = true;
            info!(
                "Accumulated score {:.1} passed evolution threshold {:.1}",
                totals.accumulated, self.evolution_threshold
            );
            return true;
        }
        false
    }

    pub fn accumulated(&self) -> f64 {
        self.totals.lock().map(|t| t.accumulated).unwrap_or(0.0)
    }

    pub fn is_evolved(&self) -> bool {
        self.totals.lock().map(|t| t.is_evolved).unwrap_or(false)
    }

    pub fn evolution_threshold(&self) -> f64 {
        self.evolution_threshold
    }
}

impl Default for ScoreAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_EVOLUTION_THRESHOLD)
    }
}
