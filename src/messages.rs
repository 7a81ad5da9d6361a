//! Message types exchanged between the capture, analysis and web processes
//!
//! This module defines the payloads carried on the message bus (analysis results and
//! monitor messages) and the rollup record persisted by the periodic aggregator.

use crate::error::DecodeError;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Eye aspect ratio of both eyes; low values indicate closed eyes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EyeAspectRatio {
    pub left: f64,
    pub right: f64,
}

/// Normalized 2D head direction (x: yaw, y: pitch)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HeadDirection {
    pub x: f64,
    pub y: f64,
}

/// Result of analyzing a single frame
///
/// `both_eye_aspect_ratio` and `head_direction` are present iff `is_absent` is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisMsg {
    /// When the analyzed frame was captured
    pub timestamp: Timestamp,
    /// No face was found in the frame
    pub is_absent: bool,
    pub both_eye_aspect_ratio: Option<EyeAspectRatio>,
    pub head_direction: Option<HeadDirection>,
}

impl AnalysisMsg {
    /// Analysis of a frame in which nobody was detected
    pub fn absent(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            is_absent: true,
            both_eye_aspect_ratio: None,
            head_direction: None,
        }
    }

    /// Analysis of a frame with a detected face
    pub fn present(
        timestamp: Timestamp,
        both_eye_aspect_ratio: EyeAspectRatio,
        head_direction: HeadDirection,
    ) -> Self {
        Self {
            timestamp,
            is_absent: false,
            both_eye_aspect_ratio: Some(both_eye_aspect_ratio),
            head_direction: Some(head_direction),
        }
    }

    /// Check the presence invariant between `is_absent` and the measurement fields
    pub fn validate(&self) -> Result<(), DecodeError> {
        let has_ear = self.both_eye_aspect_ratio.is_some();
        let has_head = self.head_direction.is_some();
        if self.is_absent && (has_ear || has_head) {
            return Err(DecodeError::InvariantViolated(
                "absent analysis carries measurements".to_string(),
            ));
        }
        if !self.is_absent && !(has_ear && has_head) {
            return Err(DecodeError::InvariantViolated(
                "present analysis is missing measurements".to_string(),
            ));
        }
        Ok(())
    }
}

bitflags! {
    /// Factors that penalize the concentration score
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PenaltyFactor: u8 {
        /// The person is absent.
        const IS_ABSENT       = 0b0001;
        /// The person is drowsy.
        const IS_DROWSY       = 0b0010;
        /// The person is looking away.
        const IS_LOOKING_AWAY = 0b0100;
    }
}

impl PenaltyFactor {
    /// No factor
    pub const NONE: Self = Self::empty();

    /// Names of the active flags, e.g. `["IS_LOOKING_AWAY"]`
    pub fn active_names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl Default for PenaltyFactor {
    fn default() -> Self {
        Self::NONE
    }
}

impl Serialize for PenaltyFactor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for PenaltyFactor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        PenaltyFactor::from_bits(bits)
            .ok_or_else(|| de::Error::custom(format!("unknown penalty factor bits {:#06b}", bits)))
    }
}

/// Measured concentration score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConcentrationStatus {
    /// Overall score in [0, 100]; higher means better concentration
    pub overall_score: f64,
    #[serde(default)]
    pub penalty_factor: PenaltyFactor,
}

impl ConcentrationStatus {
    pub fn new(overall_score: f64, penalty_factor: PenaltyFactor) -> Self {
        Self {
            overall_score,
            penalty_factor,
        }
    }
}

/// Type of a measurement error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MonitorErrorKind {
    Unknown = 1,
}

impl MonitorErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl TryFrom<u8> for MonitorErrorKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MonitorErrorKind::Unknown),
            other => Err(DecodeError::UnknownDiscriminant {
                field: "MonitorErrorKind",
                value: other as u64,
            }),
        }
    }
}

impl Serialize for MonitorErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MonitorErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        MonitorErrorKind::try_from(value).map_err(de::Error::custom)
    }
}

/// Error in measurement reported instead of a score
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorError {
    #[serde(rename = "type")]
    pub kind: MonitorErrorKind,
    pub msg: String,
}

/// Either a score or an error, tagged explicitly on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorPayload {
    Status(ConcentrationStatus),
    Error(MonitorError),
}

/// Monitoring result or error published by the scoring engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorMsg {
    pub timestamp: Timestamp,
    pub payload: MonitorPayload,
}

impl MonitorMsg {
    pub fn status(timestamp: Timestamp, status: ConcentrationStatus) -> Self {
        Self {
            timestamp,
            payload: MonitorPayload::Status(status),
        }
    }

    pub fn error(timestamp: Timestamp, kind: MonitorErrorKind, msg: impl Into<String>) -> Self {
        Self {
            timestamp,
            payload: MonitorPayload::Error(MonitorError {
                kind,
                msg: msg.into(),
            }),
        }
    }

    /// The score carried by this message, if it is not an error
    pub fn as_status(&self) -> Option<&ConcentrationStatus> {
        match &self.payload {
            MonitorPayload::Status(status) => Some(status),
            MonitorPayload::Error(_) => None,
        }
    }
}

/// Averaged scores over one aggregation bucket; immutable once persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedRecord {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub overall_score: f64,
    /// Fraction of samples in the bucket flagged as drowsy
    pub sleeping_confidence: f64,
}
