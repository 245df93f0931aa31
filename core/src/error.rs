//! Error taxonomy for the localization pipeline.
//!
//! Recoverable odometry conditions (`OdometryNotYetAvailable`, `OdometryExpired`) are
//! absorbed by the [`crate::controller::UpdateController`] and surface as a
//! [`crate::controller::StepOutcome`]; the remaining variants are structural and are
//! returned to the caller.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizationError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pose ({x}, {y}, {theta}) is not finite")]
    InvalidPose { x: f64, y: f64, theta: f64 },

    #[error("relative motion is degenerate (non-finite transform)")]
    DegenerateMotion,

    #[error("odometry for {stamp} is not available yet")]
    OdometryNotYetAvailable { stamp: DateTime<Utc> },

    #[error("odometry for {stamp} is older than the retained history (oldest {oldest})")]
    OdometryExpired {
        stamp: DateTime<Utc>,
        oldest: DateTime<Utc>,
    },

    #[error("scan has {ranges} ranges but {bearings} bearings")]
    MalformedScan { ranges: usize, bearings: usize },

    #[error("particle cloud is empty")]
    EmptyCloud,

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl LocalizationError {
    /// Whether the condition clears up on its own if the same input is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LocalizationError::OdometryNotYetAvailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, LocalizationError>;
