//! Odometry pose resolution by timestamp.
//!
//! Scans are matched to the odometry pose at the scan timestamp. A resolver answers with the pose, with
//! `OdometryNotYetAvailable` when the stamp is newer than anything it has seen (try again later), or with
//! `OdometryExpired` when the stamp predates its retained history (give up on that scan).
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{LocalizationError, Result};
use crate::{Pose2D, angle_difference, wrap_to_pi};

/// Resolves the robot pose in the odometry frame at a given time.
pub trait OdometrySource: Send {
    fn pose_at(&self, stamp: DateTime<Utc>) -> Result<Pose2D>;
}

impl<T: OdometrySource + Sync + ?Sized> OdometrySource for Arc<T> {
    fn pose_at(&self, stamp: DateTime<Utc>) -> Result<Pose2D> {
        (**self).pose_at(stamp)
    }
}

impl<T: OdometrySource + Sync> OdometrySource for RwLock<T> {
    fn pose_at(&self, stamp: DateTime<Utc>) -> Result<Pose2D> {
        self.read()
            .map_err(|_| LocalizationError::LockPoisoned("odometry"))?
            .pose_at(stamp)
    }
}

/// A single odometry reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OdometrySample {
    pub stamp: DateTime<Utc>,
    pub pose: Pose2D,
}

/// Bounded, time-ordered odometry history with linear interpolation between samples.
#[derive(Clone, Debug)]
pub struct OdometryBuffer {
    samples: VecDeque<OdometrySample>,
    capacity: usize,
}

impl OdometryBuffer {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        OdometryBuffer {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a reading, evicting the oldest one when full.
    ///
    /// Returns `false` (and keeps the history unchanged) if the reading is not finite or not newer than the
    /// newest sample.
    pub fn push(&mut self, stamp: DateTime<Utc>, pose: Pose2D) -> bool {
        if !pose.is_finite() {
            log::warn!("Ignoring non-finite odometry sample at {stamp}: {pose}");
            return false;
        }
        if let Some(newest) = self.samples.back()
            && stamp <= newest.stamp
        {
            log::debug!(
                "Ignoring out-of-order odometry sample at {stamp} (newest {})",
                newest.stamp
            );
            return false;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(OdometrySample { stamp, pose });
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest(&self) -> Option<&OdometrySample> {
        self.samples.front()
    }

    pub fn latest(&self) -> Option<&OdometrySample> {
        self.samples.back()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for OdometryBuffer {
    fn default() -> Self {
        OdometryBuffer::new(Self::DEFAULT_CAPACITY)
    }
}

impl OdometrySource for OdometryBuffer {
    fn pose_at(&self, stamp: DateTime<Utc>) -> Result<Pose2D> {
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return Err(LocalizationError::OdometryNotYetAvailable { stamp });
        };
        if stamp > newest.stamp {
            return Err(LocalizationError::OdometryNotYetAvailable { stamp });
        }
        if stamp < oldest.stamp {
            return Err(LocalizationError::OdometryExpired {
                stamp,
                oldest: oldest.stamp,
            });
        }
        let after = self.samples.partition_point(|s| s.stamp < stamp);
        let upper = &self.samples[after];
        if upper.stamp == stamp || after == 0 {
            return Ok(upper.pose);
        }
        let lower = &self.samples[after - 1];
        let fraction = seconds_between(lower.stamp, stamp) / seconds_between(lower.stamp, upper.stamp);
        Ok(interpolate(&lower.pose, &upper.pose, fraction))
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 * 1e-9,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}

/// Linear in position, shortest arc in heading.
fn interpolate(a: &Pose2D, b: &Pose2D, fraction: f64) -> Pose2D {
    Pose2D {
        x: a.x + (b.x - a.x) * fraction,
        y: a.y + (b.y - a.y) * fraction,
        theta: wrap_to_pi(a.theta + angle_difference(b.theta, a.theta) * fraction),
    }
}
