//! Sliding-window concentration scoring
//!
//! The engine keeps the most recent analysis results in a bounded FIFO buffer and
//! derives a score in [0, 100] plus the penalty factors that lowered it.

use crate::bus::{Publisher, Subscriber};
use crate::error::BusError;
use crate::messages::{
    AnalysisMsg, ConcentrationStatus, EyeAspectRatio, HeadDirection, MonitorMsg, PenaltyFactor,
    Timestamp,
};
use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Share of the buffer capacity that must carry eye data before drowsiness is judged
const DROWSY_SAMPLE_RATIO: f64 = 0.8;

/// Share of eye samples below the EAR threshold that counts as drowsy
const DROWSY_EYE_RATIO: f64 = 0.5;

/// Normalizer applied to the head direction standard deviation
const HEAD_DIRECTION_STD_NORMALIZER: f64 = 20.0;

const MAX_SCORE: f64 = 100.0;

/// Tunables for the scoring engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Number of analysis results kept in the sliding window
    pub buffer_capacity: usize,
    /// Eye aspect ratio below which an eye counts as closed
    pub ear_threshold: f64,
    /// Mean |yaw| at or above which the person is looking away
    pub looking_away_angle: f64,
    pub looking_away_penalty: f64,
    pub head_direction_std_weight: f64,
    /// Buffer is cleared when its newest entry is older than this
    pub stale_after_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            ear_threshold: 0.25,
            looking_away_angle: 25.0,
            looking_away_penalty: 50.0,
            head_direction_std_weight: 50.0,
            stale_after_ms: 1000,
        }
    }
}

/// Bounded FIFO of analysis results, oldest first
#[derive(Debug, Clone)]
pub struct AnalysisBuffer {
    entries: VecDeque<AnalysisMsg>,
    capacity: usize,
}

impl AnalysisBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn push(&mut self, msg: AnalysisMsg) {
        self.entries.push_back(msg);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Clear the whole buffer if its newest entry is older than `max_age` at `now`
    ///
    /// Returns `true` if the buffer was cleared.
    pub fn clear_if_stale(&mut self, now: Timestamp, max_age: Duration) -> bool {
        match self.entries.back() {
            Some(latest) if now - latest.timestamp > max_age => {
                self.entries.clear();
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisMsg> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Score the buffer contents
///
/// Rules are applied in priority order and the first match wins: empty buffer,
/// everyone absent, drowsy, then the graded score with the looking-away and head
/// instability penalties.
pub fn calc_score(buffer: &AnalysisBuffer, config: &ScoringConfig) -> (f64, PenaltyFactor) {
    if buffer.is_empty() {
        return (0.0, PenaltyFactor::NONE);
    }

    if buffer.iter().all(|msg| msg.is_absent) {
        return (0.0, PenaltyFactor::IS_ABSENT);
    }

    let ears: Vec<EyeAspectRatio> = buffer
        .iter()
        .filter_map(|msg| msg.both_eye_aspect_ratio)
        .collect();
    let enough_eye_samples =
        ears.len() as f64 >= DROWSY_SAMPLE_RATIO * config.buffer_capacity as f64;
    if enough_eye_samples && is_drowsy(&ears, config.ear_threshold) {
        return (0.0, PenaltyFactor::IS_DROWSY);
    }

    let mut score = MAX_SCORE;
    let mut factor = PenaltyFactor::NONE;

    let directions: Vec<HeadDirection> = buffer
        .iter()
        .filter_map(|msg| msg.head_direction)
        .collect();
    if !directions.is_empty() {
        let (mean_x, mean_y) = mean(&directions);

        let is_head_down = mean_y < 0.0;
        if !is_head_down && mean_x.abs() >= config.looking_away_angle {
            score -= config.looking_away_penalty;
            factor |= PenaltyFactor::IS_LOOKING_AWAY;
        }

        let (std_x, std_y) = std_dev(&directions, mean_x, mean_y);
        let instability = (std_x + std_y) / 2.0 / HEAD_DIRECTION_STD_NORMALIZER;
        score -= config.head_direction_std_weight * instability;
    }

    if score.is_nan() {
        score = 0.0;
    }
    (score.clamp(0.0, MAX_SCORE), factor)
}

fn is_drowsy(ears: &[EyeAspectRatio], ear_threshold: f64) -> bool {
    let half = DROWSY_EYE_RATIO * ears.len() as f64;
    let left_closed = ears.iter().filter(|ear| ear.left < ear_threshold).count();
    let right_closed = ears.iter().filter(|ear| ear.right < ear_threshold).count();
    left_closed as f64 >= half || right_closed as f64 >= half
}

fn mean(directions: &[HeadDirection]) -> (f64, f64) {
    let n = directions.len() as f64;
    let sum_x: f64 = directions.iter().map(|d| d.x).sum();
    let sum_y: f64 = directions.iter().map(|d| d.y).sum();
    (sum_x / n, sum_y / n)
}

/// Population standard deviation per axis
fn std_dev(directions: &[HeadDirection], mean_x: f64, mean_y: f64) -> (f64, f64) {
    let n = directions.len() as f64;
    let var_x: f64 = directions.iter().map(|d| (d.x - mean_x).powi(2)).sum::<f64>() / n;
    let var_y: f64 = directions.iter().map(|d| (d.y - mean_y).powi(2)).sum::<f64>() / n;
    (var_x.sqrt(), var_y.sqrt())
}

/// Concentration scoring engine
///
/// The subscriber callback appends to the buffer and the scoring step reads and
/// possibly clears it; both go through the same mutex.
#[derive(Debug)]
pub struct ScoringEngine {
    config: ScoringConfig,
    buffer: Mutex<AnalysisBuffer>,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        let buffer = AnalysisBuffer::new(config.buffer_capacity);
        Self {
            config,
            buffer: Mutex::new(buffer),
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Start feeding this engine from an analysis subscriber
    pub fn attach(
        self: &Arc<Self>,
        subscriber: &mut dyn Subscriber<AnalysisMsg>,
    ) -> Result<(), BusError> {
        let engine = Arc::clone(self);
        subscriber.start(Box::new(move |msg: AnalysisMsg| engine.on_analysis(msg)))
    }

    /// Record an analysis result
    pub fn on_analysis(&self, msg: AnalysisMsg) {
        self.lock_buffer().push(msg);
    }

    /// Number of buffered analysis results
    pub fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Drop stale data, then score what remains
    pub fn evaluate(&self, now: Timestamp) -> (f64, PenaltyFactor) {
        let mut buffer = self.lock_buffer();
        let max_age = Duration::milliseconds(self.config.stale_after_ms as i64);
        if buffer.clear_if_stale(now, max_age) {
            debug!("Analysis buffer cleared: newest entry older than {}", max_age);
        }
        calc_score(&buffer, &self.config)
    }

    /// Score the buffer and package the result as a monitor message stamped `now`
    pub fn status_at(&self, now: Timestamp) -> MonitorMsg {
        let (score, factor) = self.evaluate(now);
        MonitorMsg::status(now, ConcentrationStatus::new(score, factor))
    }

    /// Score at the current time and publish the result
    pub fn tick(&self, publisher: &dyn Publisher<MonitorMsg>) -> Result<MonitorMsg, BusError> {
        let msg = self.status_at(Utc::now());
        publisher.publish(&msg)?;
        Ok(msg)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, AnalysisBuffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(ear_left: f64, ear_right: f64, x: f64, y: f64) -> AnalysisMsg {
        AnalysisMsg::present(
            Utc::now(),
            EyeAspectRatio {
                left: ear_left,
                right: ear_right,
            },
            HeadDirection { x, y },
        )
    }

    fn buffer_of(entries: Vec<AnalysisMsg>) -> AnalysisBuffer {
        let mut buffer = AnalysisBuffer::new(10);
        for entry in entries {
            buffer.push(entry);
        }
        buffer
    }

    #[test]
    fn test_empty_buffer_scores_zero_without_factor() {
        let (score, factor) = calc_score(&AnalysisBuffer::new(10), &ScoringConfig::default());
        assert_eq!(score, 0.0);
        assert_eq!(factor, PenaltyFactor::NONE);
    }

    #[test]
    fn test_all_absent() {
        let buffer = buffer_of((0..4).map(|_| AnalysisMsg::absent(Utc::now())).collect());
        let (score, factor) = calc_score(&buffer, &ScoringConfig::default());
        assert_eq!(score, 0.0);
        assert_eq!(factor, PenaltyFactor::IS_ABSENT);
    }

    #[test]
    fn test_drowsy_when_left_eye_mostly_closed() {
        let mut entries: Vec<AnalysisMsg> = (0..9).map(|_| present(0.1, 0.3, 0.0, 0.0)).collect();
        entries.push(present(0.3, 0.3, 0.0, 0.0));
        let (score, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(score, 0.0);
        assert_eq!(factor, PenaltyFactor::IS_DROWSY);
    }

    #[test]
    fn test_drowsy_when_right_eye_half_closed() {
        let mut entries: Vec<AnalysisMsg> = (0..5).map(|_| present(0.3, 0.2, 0.0, 0.0)).collect();
        entries.extend((0..5).map(|_| present(0.3, 0.3, 0.0, 0.0)));
        let (_, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::IS_DROWSY);
    }

    #[test]
    fn test_too_few_eye_samples_skips_drowsiness() {
        // 7 eye samples < 80% of capacity 10
        let entries: Vec<AnalysisMsg> = (0..7).map(|_| present(0.1, 0.1, 0.0, 0.0)).collect();
        let (score, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::NONE);
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_absent_entries_reduce_eye_samples() {
        let mut entries: Vec<AnalysisMsg> = (0..3).map(|_| AnalysisMsg::absent(Utc::now())).collect();
        entries.extend((0..7).map(|_| present(0.1, 0.1, 0.0, 0.0)));
        let (_, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::NONE);
    }

    #[test]
    fn test_looking_away_penalty() {
        let entries: Vec<AnalysisMsg> = (0..10).map(|_| present(0.3, 0.3, 30.0, 5.0)).collect();
        let (score, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::IS_LOOKING_AWAY);
        assert!((score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_looking_away_to_the_left_counts() {
        let entries: Vec<AnalysisMsg> = (0..10).map(|_| present(0.3, 0.3, -25.0, 0.0)).collect();
        let (_, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert!(factor.contains(PenaltyFactor::IS_LOOKING_AWAY));
    }

    #[test]
    fn test_head_down_is_not_looking_away() {
        let entries: Vec<AnalysisMsg> = (0..10).map(|_| present(0.3, 0.3, 30.0, -5.0)).collect();
        let (score, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::NONE);
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_head_instability_penalty() {
        // x alternates -10/+10 (std 10), y constant (std 0): mean std 5, /20 = 0.25, *50 = 12.5
        let entries: Vec<AnalysisMsg> = (0..10)
            .map(|i| present(0.3, 0.3, if i % 2 == 0 { -10.0 } else { 10.0 }, 0.0))
            .collect();
        let (score, factor) = calc_score(&buffer_of(entries), &ScoringConfig::default());
        assert_eq!(factor, PenaltyFactor::NONE);
        assert!((score - 87.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_clamped() {
        let config = ScoringConfig {
            looking_away_penalty: 500.0,
            ..ScoringConfig::default()
        };
        let entries: Vec<AnalysisMsg> = (0..10).map(|_| present(0.3, 0.3, 90.0, 1.0)).collect();
        let (score, _) = calc_score(&buffer_of(entries), &config);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = AnalysisBuffer::new(3);
        let base = Utc::now();
        for i in 0..5 {
            buffer.push(AnalysisMsg::absent(base + Duration::milliseconds(i)));
        }
        assert_eq!(buffer.len(), 3);
        let first = buffer.iter().next().unwrap();
        assert_eq!(first.timestamp, base + Duration::milliseconds(2));
    }

    #[test]
    fn test_stale_buffer_is_cleared() {
        let engine = ScoringEngine::new(ScoringConfig::default());
        let now = Utc::now();
        let mut old = present(0.3, 0.3, 0.0, 0.0);
        old.timestamp = now - Duration::milliseconds(1500);
        engine.on_analysis(old);

        let (score, factor) = engine.evaluate(now);
        assert_eq!((score, factor), (0.0, PenaltyFactor::NONE));
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_fresh_buffer_is_kept() {
        let engine = ScoringEngine::new(ScoringConfig::default());
        let now = Utc::now();
        let mut recent = present(0.3, 0.3, 0.0, 0.0);
        recent.timestamp = now - Duration::milliseconds(500);
        engine.on_analysis(recent);

        let (score, _) = engine.evaluate(now);
        assert_eq!(score, 100.0);
        assert_eq!(engine.buffered(), 1);
    }

    #[test]
    fn test_status_at_is_stamped_now() {
        let engine = ScoringEngine::new(ScoringConfig::default());
        let now = Utc::now();
        let msg = engine.status_at(now);
        assert_eq!(msg.timestamp, now);
        assert_eq!(
            msg.as_status(),
            Some(&ConcentrationStatus::new(0.0, PenaltyFactor::NONE))
        );
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    /// An analysis result with bounded, finite measurements
    #[derive(Debug, Clone)]
    struct ArbitraryAnalysis(AnalysisMsg);

    fn bounded(g: &mut Gen, limit: f64) -> f64 {
        let raw = i32::arbitrary(g) % 10_000;
        raw as f64 / 10_000.0 * limit
    }

    impl Arbitrary for ArbitraryAnalysis {
        fn arbitrary(g: &mut Gen) -> Self {
            let now = Utc::now();
            if u8::arbitrary(g) % 4 == 0 {
                return ArbitraryAnalysis(AnalysisMsg::absent(now));
            }
            ArbitraryAnalysis(AnalysisMsg::present(
                now,
                EyeAspectRatio {
                    left: bounded(g, 0.5).abs(),
                    right: bounded(g, 0.5).abs(),
                },
                HeadDirection {
                    x: bounded(g, 90.0),
                    y: bounded(g, 90.0),
                },
            ))
        }
    }

    /// Buffer capacity between 1 and 30
    #[derive(Debug, Clone)]
    struct Capacity(usize);

    impl Arbitrary for Capacity {
        fn arbitrary(g: &mut Gen) -> Self {
            Capacity(usize::arbitrary(g) % 30 + 1)
        }
    }

    #[quickcheck]
    fn prop_score_within_bounds(entries: Vec<ArbitraryAnalysis>, capacity: Capacity) -> bool {
        let config = ScoringConfig {
            buffer_capacity: capacity.0,
            ..ScoringConfig::default()
        };
        let mut buffer = AnalysisBuffer::new(capacity.0);
        for entry in entries {
            buffer.push(entry.0);
        }
        let (score, _) = calc_score(&buffer, &config);
        (0.0..=100.0).contains(&score)
    }

    #[quickcheck]
    fn prop_buffer_never_exceeds_capacity(entries: Vec<ArbitraryAnalysis>, capacity: Capacity) -> bool {
        let mut buffer = AnalysisBuffer::new(capacity.0);
        let total = entries.len();
        let last = entries.last().map(|e| e.0.clone());
        for entry in entries {
            buffer.push(entry.0);
            if buffer.len() > capacity.0 {
                return false;
            }
        }
        let expected_len = total.min(capacity.0);
        let newest_kept = match last {
            Some(last) => buffer.iter().last() == Some(&last),
            None => buffer.is_empty(),
        };
        buffer.len() == expected_len && newest_kept
    }

    #[quickcheck]
    fn prop_terminal_states_set_single_flag(entries: Vec<ArbitraryAnalysis>) -> bool {
        let config = ScoringConfig::default();
        let mut buffer = AnalysisBuffer::new(config.buffer_capacity);
        for entry in entries {
            buffer.push(entry.0);
        }
        let (score, factor) = calc_score(&buffer, &config);
        if factor.contains(PenaltyFactor::IS_ABSENT) || factor.contains(PenaltyFactor::IS_DROWSY) {
            score == 0.0 && factor.bits().count_ones() == 1
        } else {
            true
        }
    }
}
