//! Outputs of the filter: particle cloud and pose messages, the map→odom correction, and the snapshot cell
//! shared between the estimation worker and the transform broadcaster.
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Pose2D;
use crate::error::{LocalizationError, Result};
use crate::particle::ParticleCloud;

/// The aggregate pose of the cloud in the map frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub pose: Pose2D,
}

/// Every particle pose and weight, for visualization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleCloudMessage {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub poses: Vec<Pose2D>,
    pub weights: Vec<f64>,
}
impl ParticleCloudMessage {
    pub fn from_cloud(stamp: DateTime<Utc>, frame_id: &str, cloud: &ParticleCloud) -> Self {
        ParticleCloudMessage {
            stamp,
            frame_id: frame_id.to_string(),
            poses: cloud.poses(),
            weights: cloud.weights(),
        }
    }
}

/// The map→odom correction as broadcast to downstream consumers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapToOdom {
    pub stamp: DateTime<Utc>,
    pub transform: Pose2D,
}

/// Sink for the messages the controller emits once per consumed scan.
pub trait Publisher: Send {
    fn publish_cloud(&mut self, message: ParticleCloudMessage);
    fn publish_pose(&mut self, estimate: PoseEstimate);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPublisher;
impl Publisher for NullPublisher {
    fn publish_cloud(&mut self, _message: ParticleCloudMessage) {}
    fn publish_pose(&mut self, _estimate: PoseEstimate) {}
}

/// Keeps every message in memory, optionally only the last `limit` clouds.
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    pub clouds: Vec<ParticleCloudMessage>,
    pub poses: Vec<PoseEstimate>,
    cloud_limit: Option<usize>,
}
impl RecordingPublisher {
    pub fn new() -> Self {
        RecordingPublisher::default()
    }
    /// Clouds are large; keep at most `limit` of them.
    pub fn with_cloud_limit(limit: usize) -> Self {
        RecordingPublisher {
            cloud_limit: Some(limit),
            ..Default::default()
        }
    }
    pub fn last_cloud(&self) -> Option<&ParticleCloudMessage> {
        self.clouds.last()
    }
    pub fn last_pose(&self) -> Option<&PoseEstimate> {
        self.poses.last()
    }
}
impl Publisher for RecordingPublisher {
    fn publish_cloud(&mut self, message: ParticleCloudMessage) {
        if let Some(limit) = self.cloud_limit {
            if limit == 0 {
                return;
            }
            if self.clouds.len() >= limit {
                self.clouds.remove(0);
            }
        }
        self.clouds.push(message);
    }
    fn publish_pose(&mut self, estimate: PoseEstimate) {
        self.poses.push(estimate);
    }
}

/// `map_T_odom = map_T_base · (odom_T_base)⁻¹`.
///
/// Composing the result with the odometry pose gives back the map-frame robot pose.
pub fn map_to_odom(robot_in_map: &Pose2D, robot_in_odom: &Pose2D) -> Pose2D {
    Pose2D::from_isometry(&(robot_in_map.to_isometry() * robot_in_odom.to_isometry().inverse()))
}

/// Immutable result of one pose estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EstimateSnapshot {
    /// Stamp of the scan the estimate was computed from.
    pub stamp: DateTime<Utc>,
    pub robot_pose: Pose2D,
    pub odom_pose: Pose2D,
    pub map_to_odom: Pose2D,
}
impl EstimateSnapshot {
    pub fn new(stamp: DateTime<Utc>, robot_pose: Pose2D, odom_pose: Pose2D) -> Self {
        EstimateSnapshot {
            stamp,
            robot_pose,
            odom_pose,
            map_to_odom: map_to_odom(&robot_pose, &odom_pose),
        }
    }
}

#[derive(Debug, Default)]
struct Published {
    snapshot: Option<Arc<EstimateSnapshot>>,
    last_scan_stamp: Option<DateTime<Utc>>,
}

/// Single-writer, multi-reader cell holding the latest [`EstimateSnapshot`].
///
/// Writers swap in a whole new `Arc`; readers clone the `Arc` out, so a reader never sees a half-written
/// estimate and never holds the lock while it works.
#[derive(Clone, Debug, Default)]
pub struct SharedEstimate {
    inner: Arc<RwLock<Published>>,
}
impl SharedEstimate {
    pub fn new() -> Self {
        SharedEstimate::default()
    }

    pub fn publish(&self, snapshot: EstimateSnapshot) -> Result<()> {
        let snapshot = Arc::new(snapshot);
        let mut published = self
            .inner
            .write()
            .map_err(|_| LocalizationError::LockPoisoned("shared estimate"))?;
        published.snapshot = Some(snapshot);
        Ok(())
    }

    /// Records the arrival of a scan, processed or not.
    pub fn note_scan(&self, stamp: DateTime<Utc>) -> Result<()> {
        let mut published = self
            .inner
            .write()
            .map_err(|_| LocalizationError::LockPoisoned("shared estimate"))?;
        if published.last_scan_stamp.is_none_or(|last| stamp > last) {
            published.last_scan_stamp = Some(stamp);
        }
        Ok(())
    }

    pub fn latest(&self) -> Result<Option<Arc<EstimateSnapshot>>> {
        let published = self
            .inner
            .read()
            .map_err(|_| LocalizationError::LockPoisoned("shared estimate"))?;
        Ok(published.snapshot.clone())
    }

    pub fn last_scan_stamp(&self) -> Result<Option<DateTime<Utc>>> {
        let published = self
            .inner
            .read()
            .map_err(|_| LocalizationError::LockPoisoned("shared estimate"))?;
        Ok(published.last_scan_stamp)
    }

    /// The correction to broadcast now, stamped `postdate` past the last scan.
    ///
    /// `None` until both a scan has arrived and an estimate has been published.
    pub fn postdated_correction(&self, postdate: TimeDelta) -> Result<Option<MapToOdom>> {
        let published = self
            .inner
            .read()
            .map_err(|_| LocalizationError::LockPoisoned("shared estimate"))?;
        let (Some(snapshot), Some(last_scan)) = (&published.snapshot, published.last_scan_stamp) else {
            return Ok(None);
        };
        Ok(Some(MapToOdom {
            stamp: last_scan + postdate,
            transform: snapshot.map_to_odom,
        }))
    }
}
