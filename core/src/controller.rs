//! The update controller: decides when a filter cycle runs and drives it.
//!
//! A controller consumes at most one pending scan per [`UpdateController::step`]. The scan is matched to the
//! odometry pose at its timestamp and then, depending on where the session is:
//!
//! 1. with no odometry reference yet, the odometry pose becomes the reference;
//! 2. with no particle cloud yet, the cloud is seeded around the odometry pose;
//! 3. once the robot has moved more than `d_thresh` along x or y, or turned more than `a_thresh`, one full
//!    cycle runs: motion update, observation update, normalization, pose estimate, resampling;
//! 4. otherwise nothing but the current odometry pose is tracked.
//!
//! The particle cloud and, if one exists, the pose estimate are published after every consumed scan.
//!
//! All mutable filter state lives in a [`FilterContext`] owned by the controller, so independent controllers
//! can run side by side in one process.
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::FilterConfig;
use crate::error::{LocalizationError, Result};
use crate::measurements::{MapDistance, ObservationModel, ObservationOutcome, RangeScan};
use crate::motion::{MotionModel, MotionUpdate};
use crate::odometry::OdometrySource;
use crate::particle::{NormalizationOutcome, ParticleCloud};
use crate::publish::{EstimateSnapshot, ParticleCloudMessage, PoseEstimate, Publisher, SharedEstimate};
use crate::{Pose2D, angle_difference};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// No particle cloud exists yet.
    Uninitialized,
    /// The cloud is populated and is updated as the robot moves.
    Initialized,
}

/// What one call to [`UpdateController::step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// No scan was pending.
    Idle,
    /// Odometry for the scan's stamp is not available yet; the scan stays pending.
    WaitingForOdometry,
    /// The scan predates the odometry history and was discarded.
    DroppedStaleScan,
    /// First odometry reading of the session; stored as the motion reference.
    ReferenceRecorded,
    /// The particle cloud was seeded around the current odometry pose.
    CloudInitialized,
    /// A full filter cycle ran.
    Updated,
    /// The robot has not moved far enough since the last cycle; only odometry was tracked.
    BelowThreshold,
}

/// Mutable state of one localization session.
#[derive(Debug)]
pub struct FilterContext {
    pub cloud: ParticleCloud,
    /// Odometry pose at the last motion update.
    pub reference_odom: Option<Pose2D>,
    /// Odometry pose matched to the most recently consumed scan.
    pub odom_pose: Option<Pose2D>,
    /// Latest aggregate estimate in the map frame.
    pub robot_pose: Option<Pose2D>,
    pub rng: StdRng,
}
impl FilterContext {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        FilterContext {
            cloud: ParticleCloud::new(),
            reference_odom: None,
            odom_pose: None,
            robot_pose: None,
            rng,
        }
    }
}

pub struct UpdateController<M, O, P> {
    config: FilterConfig,
    motion: MotionModel,
    observation: ObservationModel,
    map: M,
    odometry: O,
    publisher: P,
    context: FilterContext,
    pending_scan: Option<RangeScan>,
    shared: SharedEstimate,
    cycles: u64,
}

impl<M, O, P> UpdateController<M, O, P>
where
    M: MapDistance,
    O: OdometrySource,
    P: Publisher,
{
    /// Builds a controller; a malformed configuration is rejected here.
    pub fn new(config: FilterConfig, map: M, odometry: O, publisher: P) -> Result<Self> {
        config.validate()?;
        let motion = MotionModel::new(config.linear_odom_noise, config.angular_odom_noise)?;
        let observation = ObservationModel::new(config.likelihood_std)?;
        let context = FilterContext::new(config.seed);
        log::info!(
            "Particle filter ready: {} particles, d_thresh {:.3} m, a_thresh {:.3} rad, {:?}/{:?}",
            config.n_particles,
            config.d_thresh,
            config.a_thresh,
            config.averaging_strategy,
            config.resampling_strategy
        );
        Ok(UpdateController {
            config,
            motion,
            observation,
            map,
            odometry,
            publisher,
            context,
            pending_scan: None,
            shared: SharedEstimate::new(),
            cycles: 0,
        })
    }

    /// Queues a scan for the next step. Only the latest scan is kept.
    pub fn submit_scan(&mut self, scan: RangeScan) -> Result<()> {
        self.shared.note_scan(scan.stamp)?;
        if let Some(previous) = self.pending_scan.replace(scan) {
            log::debug!("Discarding unprocessed scan from {}", previous.stamp);
        }
        Ok(())
    }

    /// Re-seeds the cloud around an externally supplied pose.
    pub fn set_initial_pose(&mut self, pose: Pose2D, stamp: DateTime<Utc>) -> Result<()> {
        self.initialize_cloud(&pose)?;
        log::info!("Particle cloud re-initialized around {pose} at {stamp}");
        self.publish_outputs(stamp);
        Ok(())
    }

    /// Processes the pending scan, if any.
    ///
    /// Odometry that is not yet available keeps the scan pending; odometry that has already expired drops
    /// it. Either way the call succeeds. Errors are returned only for conditions that retrying cannot fix.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let Some(scan) = self.pending_scan.take() else {
            return Ok(StepOutcome::Idle);
        };
        let odom_pose = match self.odometry.pose_at(scan.stamp) {
            Ok(pose) => pose,
            Err(e) if e.is_transient() => {
                log::debug!("{e}; keeping scan pending");
                self.pending_scan = Some(scan);
                return Ok(StepOutcome::WaitingForOdometry);
            }
            Err(e @ LocalizationError::OdometryExpired { .. }) => {
                log::warn!("Dropping scan: {e}");
                return Ok(StepOutcome::DroppedStaleScan);
            }
            Err(e) => return Err(e),
        };
        self.context.odom_pose = Some(odom_pose);

        let outcome = if self.context.reference_odom.is_none() {
            self.context.reference_odom = Some(odom_pose);
            log::info!("Recorded odometry reference {odom_pose}");
            StepOutcome::ReferenceRecorded
        } else if self.context.cloud.is_empty() {
            self.initialize_cloud(&odom_pose)?;
            log::info!("Particle cloud initialized around odometry pose {odom_pose}");
            StepOutcome::CloudInitialized
        } else if self.moved_far_enough(&odom_pose) {
            self.run_cycle(&odom_pose, &scan)?;
            StepOutcome::Updated
        } else {
            StepOutcome::BelowThreshold
        };
        self.publish_outputs(scan.stamp);
        Ok(outcome)
    }

    /// True if any of |Δx|, |Δy| exceeds `d_thresh` or the wrapped |Δθ| exceeds `a_thresh`, measured in the
    /// odometry frame against the pose of the last motion update.
    pub fn moved_far_enough(&self, odom_pose: &Pose2D) -> bool {
        let Some(reference) = self.context.reference_odom else {
            return false;
        };
        (odom_pose.x - reference.x).abs() > self.config.d_thresh
            || (odom_pose.y - reference.y).abs() > self.config.d_thresh
            || angle_difference(odom_pose.theta, reference.theta).abs() > self.config.a_thresh
    }

    fn initialize_cloud(&mut self, seed: &Pose2D) -> Result<()> {
        self.context.cloud.initialize(
            seed,
            self.config.n_particles,
            self.config.initial_linear_noise,
            self.config.initial_angular_noise,
            &mut self.context.rng,
        )?;
        self.update_estimate();
        Ok(())
    }

    fn run_cycle(&mut self, odom_pose: &Pose2D, scan: &RangeScan) -> Result<()> {
        let context = &mut self.context;
        match self.motion.update(
            &mut context.cloud,
            &mut context.reference_odom,
            odom_pose,
            &mut context.rng,
        )? {
            MotionUpdate::Propagated(delta) => log::debug!("Motion update by {delta}"),
            MotionUpdate::ReferenceRecorded => {}
        }

        let points = scan.to_points();
        match self
            .observation
            .weigh_particles(&mut context.cloud, &points, &self.map)
        {
            ObservationOutcome::Weighted { scored, unscored } => {
                log::debug!(
                    "Observation update with {} points: {scored} particles scored, {unscored} off the map",
                    points.len()
                );
            }
            ObservationOutcome::NoValidPoints => {
                log::warn!("Scan at {} has no valid ranges; weights unchanged", scan.stamp);
            }
        }

        self.update_estimate();

        let context = &mut self.context;
        context.cloud = context.cloud.resample(
            self.config.n_particles,
            self.config.resampling_strategy,
            &mut context.rng,
        );
        self.cycles += 1;
        log::debug!("Cycle {} complete: {:?}", self.cycles, context.cloud);
        Ok(())
    }

    /// Normalizes the cloud, aggregates it into the robot pose and publishes the new snapshot.
    fn update_estimate(&mut self) {
        if self.context.cloud.normalize() == NormalizationOutcome::UniformReset {
            log::warn!(
                "Degenerate particle weights (sum zero or not finite); reset {} particles to uniform",
                self.context.cloud.len()
            );
        }
        self.context.robot_pose = self
            .context
            .cloud
            .aggregate_pose(self.config.averaging_strategy);
        if let Some(robot_pose) = self.context.robot_pose {
            log::debug!(
                "Pose estimate {robot_pose} (effective sample size {:.1})",
                self.context.cloud.effective_sample_size()
            );
        }
    }

    fn publish_outputs(&mut self, stamp: DateTime<Utc>) {
        if !self.context.cloud.is_empty() {
            self.publisher.publish_cloud(ParticleCloudMessage::from_cloud(
                stamp,
                &self.config.map_frame,
                &self.context.cloud,
            ));
        }
        let Some(robot_pose) = self.context.robot_pose else {
            return;
        };
        self.publisher.publish_pose(PoseEstimate {
            stamp,
            frame_id: self.config.map_frame.clone(),
            pose: robot_pose,
        });
        if let Some(odom_pose) = self.context.odom_pose {
            let snapshot = EstimateSnapshot::new(stamp, robot_pose, odom_pose);
            if let Err(e) = self.shared.publish(snapshot) {
                log::error!("Failed to publish estimate: {e}");
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.context.cloud.is_empty() {
            ControllerState::Uninitialized
        } else {
            ControllerState::Initialized
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn context(&self) -> &FilterContext {
        &self.context
    }

    pub fn cloud(&self) -> &ParticleCloud {
        &self.context.cloud
    }

    pub fn robot_pose(&self) -> Option<Pose2D> {
        self.context.robot_pose
    }

    pub fn has_pending_scan(&self) -> bool {
        self.pending_scan.is_some()
    }

    /// Number of full filter cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    pub fn odometry(&self) -> &O {
        &self.odometry
    }

    /// Lets a synchronous driver feed odometry owned by the controller.
    pub fn odometry_mut(&mut self) -> &mut O {
        &mut self.odometry
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    /// Handle to the snapshot cell read by the transform broadcaster.
    pub fn shared_estimate(&self) -> SharedEstimate {
        self.shared.clone()
    }

    pub fn into_parts(self) -> (M, O, P) {
        (self.map, self.odometry, self.publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odometry::OdometryBuffer;
    use crate::publish::RecordingPublisher;
    use assert_approx_eq::assert_approx_eq;
    use chrono::{TimeDelta, TimeZone};
    use std::f64::consts::PI;

    type TestController = UpdateController<fn(f64, f64) -> f64, OdometryBuffer, RecordingPublisher>;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::milliseconds(ms)
    }

    fn flat_map(_x: f64, _y: f64) -> f64 {
        0.0
    }

    fn scan_at(ms: i64) -> RangeScan {
        RangeScan::from_uniform(t(ms), vec![1.0; 8], 0.0, PI / 4.0)
    }

    fn controller(config: FilterConfig) -> TestController {
        UpdateController::new(
            config,
            flat_map as fn(f64, f64) -> f64,
            OdometryBuffer::new(100),
            RecordingPublisher::new(),
        )
        .unwrap()
    }

    fn small_config() -> FilterConfig {
        FilterConfig {
            n_particles: 50,
            seed: Some(42),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn test_malformed_config_is_fatal() {
        let config = FilterConfig {
            n_particles: 0,
            ..FilterConfig::default()
        };
        let result = UpdateController::new(
            config,
            flat_map as fn(f64, f64) -> f64,
            OdometryBuffer::new(10),
            RecordingPublisher::new(),
        );
        assert!(matches!(result, Err(LocalizationError::InvalidConfig(_))));
    }

    #[test]
    fn test_idle_without_scan() {
        let mut controller = controller(small_config());
        assert_eq!(controller.step().unwrap(), StepOutcome::Idle);
        assert_eq!(controller.state(), ControllerState::Uninitialized);
    }

    #[test]
    fn test_lifecycle_reference_then_initialize_then_update() {
        let mut controller = controller(small_config());
        controller.odometry.push(t(0), Pose2D::identity());
        controller.submit_scan(scan_at(0)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::ReferenceRecorded);
        assert_eq!(controller.state(), ControllerState::Uninitialized);
        assert!(controller.publisher().clouds.is_empty());

        controller.odometry.push(t(100), Pose2D::new(0.05, 0.0, 0.0));
        controller.submit_scan(scan_at(100)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::CloudInitialized);
        assert_eq!(controller.state(), ControllerState::Initialized);
        assert_eq!(controller.cloud().len(), 50);
        assert!(controller.robot_pose().is_some());

        controller.odometry.push(t(200), Pose2D::new(0.1, 0.0, 0.0));
        controller.submit_scan(scan_at(200)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::BelowThreshold);
        assert_eq!(controller.cycles(), 0);

        controller.odometry.push(t(300), Pose2D::new(0.25, 0.0, 0.0));
        controller.submit_scan(scan_at(300)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::Updated);
        assert_eq!(controller.cycles(), 1);
        assert_eq!(controller.cloud().len(), 50);
        assert_approx_eq!(controller.cloud().weight_sum(), 1.0, 1e-9);
        assert_eq!(controller.context().reference_odom, Some(Pose2D::new(0.25, 0.0, 0.0)));

        // One cloud per consumed scan once the cloud exists.
        assert_eq!(controller.publisher().clouds.len(), 3);
        assert_eq!(controller.publisher().last_cloud().unwrap().stamp, t(300));
    }

    #[test]
    fn test_scan_waits_for_odometry() {
        let mut controller = controller(small_config());
        controller.odometry.push(t(0), Pose2D::identity());
        controller.submit_scan(scan_at(50)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::WaitingForOdometry);
        assert!(controller.has_pending_scan());
        controller.odometry.push(t(100), Pose2D::identity());
        assert_eq!(controller.step().unwrap(), StepOutcome::ReferenceRecorded);
        assert!(!controller.has_pending_scan());
    }

    #[test]
    fn test_stale_scan_is_dropped() {
        let mut controller = controller(small_config());
        controller.odometry.push(t(1000), Pose2D::identity());
        controller.submit_scan(scan_at(0)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::DroppedStaleScan);
        assert!(!controller.has_pending_scan());
        assert_eq!(controller.step().unwrap(), StepOutcome::Idle);
    }

    #[test]
    fn test_latest_scan_wins() {
        let mut controller = controller(small_config());
        controller.odometry.push(t(0), Pose2D::identity());
        controller.odometry.push(t(100), Pose2D::identity());
        controller.submit_scan(scan_at(0)).unwrap();
        controller.submit_scan(scan_at(100)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::ReferenceRecorded);
        assert_eq!(controller.step().unwrap(), StepOutcome::Idle);
        assert_eq!(controller.shared_estimate().last_scan_stamp().unwrap(), Some(t(100)));
    }

    #[test]
    fn test_angular_threshold_uses_wrapped_difference() {
        let config = FilterConfig {
            a_thresh: 0.5,
            ..small_config()
        };
        let mut controller = controller(config);
        controller.context.reference_odom = Some(Pose2D::new(0.0, 0.0, PI - 0.1));
        assert!(!controller.moved_far_enough(&Pose2D::new(0.0, 0.0, -PI + 0.1)));
        assert!(controller.moved_far_enough(&Pose2D::new(0.0, 0.0, PI - 0.7)));
        assert!(controller.moved_far_enough(&Pose2D::new(0.0, -0.3, PI - 0.1)));
    }

    #[test]
    fn test_initial_pose_seeds_cloud_and_publishes_estimate() {
        let config = FilterConfig {
            initial_linear_noise: 0.0,
            initial_angular_noise: 0.0,
            ..small_config()
        };
        let mut controller = controller(config);
        controller
            .set_initial_pose(Pose2D::new(2.0, -1.0, 0.5), t(0))
            .unwrap();
        assert_eq!(controller.state(), ControllerState::Initialized);
        let estimate = controller.publisher().last_pose().unwrap();
        assert_approx_eq!(estimate.pose.x, 2.0, 1e-9);
        assert_approx_eq!(estimate.pose.theta, 0.5, 1e-9);
        assert_eq!(estimate.frame_id, "map");
        // No odometry yet, so there is no correction to broadcast.
        assert!(controller.shared_estimate().latest().unwrap().is_none());
        assert!(
            controller
                .set_initial_pose(Pose2D { x: f64::NAN, y: 0.0, theta: 0.0 }, t(1))
                .is_err()
        );
    }

    #[test]
    fn test_update_publishes_map_to_odom_snapshot() {
        let mut controller = controller(small_config());
        controller.odometry.push(t(0), Pose2D::identity());
        controller.odometry.push(t(100), Pose2D::new(0.5, 0.0, 0.0));
        controller.submit_scan(scan_at(0)).unwrap();
        controller.step().unwrap();
        controller.submit_scan(scan_at(100)).unwrap();
        assert_eq!(controller.step().unwrap(), StepOutcome::CloudInitialized);
        let snapshot = controller.shared_estimate().latest().unwrap().unwrap();
        assert_eq!(snapshot.stamp, t(100));
        assert_eq!(snapshot.odom_pose, Pose2D::new(0.5, 0.0, 0.0));
        let recovered = snapshot.map_to_odom.compose(&snapshot.odom_pose);
        assert_approx_eq!(recovered.x, snapshot.robot_pose.x, 1e-9);
        assert_approx_eq!(recovered.y, snapshot.robot_pose.y, 1e-9);
    }
}
