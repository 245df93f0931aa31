//! Odometry motion model
//!
//! Every particle is moved by the rigid displacement $\Delta = T_{ref}^{-1} T_{now}$ that odometry reports
//! between the reference pose (the odometry pose at the previous update) and the current one. The displacement
//! is expressed in the robot frame, so it is applied to each particle by right-composition $T_i \Delta$ and
//! then perturbed with independent zero-mean Gaussian noise on $x$, $y$ and $\theta$. The odometry increment is
//! trusted, just not perfectly, so the cloud spreads along plausible trajectories.
//!
//! # Usage
//!
//! ```rust
//! use mcl::Pose2D;
//! use mcl::motion::{MotionModel, MotionUpdate};
//! use mcl::particle::ParticleCloud;
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//!
//! let mut rng = StdRng::seed_from_u64(7);
//! let mut cloud = ParticleCloud::new();
//! cloud.initialize(&Pose2D::identity(), 100, 0.5, 0.5, &mut rng).unwrap();
//!
//! let model = MotionModel::new(0.05, 0.05).unwrap();
//! let mut reference = None;
//! // The first odometry reading only becomes the reference.
//! let first = model.update(&mut cloud, &mut reference, &Pose2D::identity(), &mut rng).unwrap();
//! assert_eq!(first, MotionUpdate::ReferenceRecorded);
//! let second = model.update(&mut cloud, &mut reference, &Pose2D::new(0.3, 0.0, 0.0), &mut rng).unwrap();
//! assert!(matches!(second, MotionUpdate::Propagated(_)));
//! ```

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::Pose2D;
use crate::error::{LocalizationError, Result};
use crate::particle::ParticleCloud;

/// What [`MotionModel::update`] did with the odometry reading it was given.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MotionUpdate {
    /// There was no prior reference; the reading was stored and no particle moved.
    ReferenceRecorded,
    /// Every particle was propagated by the contained robot-frame displacement.
    Propagated(Pose2D),
}

#[derive(Clone, Copy, Debug)]
pub struct MotionModel {
    linear_noise: Normal<f64>,
    angular_noise: Normal<f64>,
}

impl MotionModel {
    /// Creates a motion model injecting the given noise.
    ///
    /// # Arguments
    /// * `linear_noise_std` - Standard deviation of the noise added to x and y (m).
    /// * `angular_noise_std` - Standard deviation of the noise added to theta (rad).
    ///
    /// # Errors
    /// `InvalidConfig` if either standard deviation is negative or not finite.
    pub fn new(linear_noise_std: f64, angular_noise_std: f64) -> Result<Self> {
        Ok(MotionModel {
            linear_noise: zero_mean(linear_noise_std, "linear_odom_noise")?,
            angular_noise: zero_mean(angular_noise_std, "angular_odom_noise")?,
        })
    }

    pub fn linear_noise_std(&self) -> f64 {
        self.linear_noise.std_dev()
    }

    pub fn angular_noise_std(&self) -> f64 {
        self.angular_noise.std_dev()
    }

    /// Propagates every particle by `relative`, then adds noise. Headings are wrapped to $(-\pi, \pi]$.
    ///
    /// A non-finite displacement is rejected with `DegenerateMotion` before any particle is touched.
    pub fn apply_motion<R: Rng + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        relative: &Pose2D,
        rng: &mut R,
    ) -> Result<()> {
        if !relative.is_finite() {
            return Err(LocalizationError::DegenerateMotion);
        }
        let delta = relative.to_isometry();
        for particle in cloud.particles_mut() {
            let moved = Pose2D::from_isometry(&(particle.pose().to_isometry() * delta));
            particle.set_pose(&Pose2D {
                x: moved.x + self.linear_noise.sample(rng),
                y: moved.y + self.linear_noise.sample(rng),
                theta: moved.theta + self.angular_noise.sample(rng),
            });
        }
        Ok(())
    }

    /// Moves the cloud by the odometry displacement since `reference` and advances `reference` to `current`.
    ///
    /// When `reference` is `None` this is the first reading since start: it is recorded and the cloud is left
    /// untouched. A degenerate displacement leaves both the cloud and the reference unchanged.
    pub fn update<R: Rng + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        reference: &mut Option<Pose2D>,
        current: &Pose2D,
        rng: &mut R,
    ) -> Result<MotionUpdate> {
        let Some(previous) = reference.as_ref() else {
            current.validate()?;
            *reference = Some(*current);
            return Ok(MotionUpdate::ReferenceRecorded);
        };
        let delta = current.relative_to(previous)?;
        self.apply_motion(cloud, &delta, rng)?;
        *reference = Some(*current);
        Ok(MotionUpdate::Propagated(delta))
    }
}

fn zero_mean(std_dev: f64, name: &str) -> Result<Normal<f64>> {
    if !std_dev.is_finite() {
        return Err(LocalizationError::InvalidConfig(format!(
            "{name} must be finite, got {std_dev}"
        )));
    }
    Normal::new(0.0, std_dev)
        .map_err(|e| LocalizationError::InvalidConfig(format!("{name} = {std_dev}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn single_particle_at(pose: Pose2D) -> ParticleCloud {
        ParticleCloud::from_particles(vec![Particle::from_pose(&pose, 1.0)])
    }

    #[test]
    fn test_noiseless_forward_motion() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = single_particle_at(Pose2D::identity());
        model
            .apply_motion(&mut cloud, &Pose2D::new(1.0, 0.0, 0.0), &mut rng)
            .unwrap();
        let p = cloud.particles()[0];
        assert_eq!(p.x, 1.0);
        assert_eq!(p.y, 0.0);
        assert_eq!(p.theta, 0.0);
    }

    #[test]
    fn test_noiseless_rotation() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = single_particle_at(Pose2D::identity());
        model
            .apply_motion(&mut cloud, &Pose2D::new(0.0, 0.0, FRAC_PI_2), &mut rng)
            .unwrap();
        let p = cloud.particles()[0];
        assert_approx_eq!(p.x, 0.0, 1e-12);
        assert_approx_eq!(p.y, 0.0, 1e-12);
        assert_approx_eq!(p.theta, FRAC_PI_2, 1e-12);
    }

    #[test]
    fn test_motion_is_applied_in_the_particle_frame() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = ParticleCloud::from_particles(vec![
            Particle::new(0.0, 0.0, 0.0, 0.5),
            Particle::new(5.0, 5.0, PI, 0.5),
        ]);
        model
            .apply_motion(&mut cloud, &Pose2D::new(1.0, 0.0, 0.0), &mut rng)
            .unwrap();
        assert_approx_eq!(cloud.particles()[0].x, 1.0, 1e-12);
        assert_approx_eq!(cloud.particles()[1].x, 4.0, 1e-12);
        assert_approx_eq!(cloud.particles()[1].y, 5.0, 1e-12);
        // Weights are not the motion model's business.
        assert_eq!(cloud.particles()[1].weight, 0.5);
    }

    #[test]
    fn test_heading_stays_wrapped() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = single_particle_at(Pose2D::new(0.0, 0.0, PI - 0.1));
        model
            .apply_motion(&mut cloud, &Pose2D::new(0.0, 0.0, 0.3), &mut rng)
            .unwrap();
        assert_approx_eq!(cloud.particles()[0].theta, -PI + 0.2, 1e-12);
    }

    #[test]
    fn test_noise_spreads_particles() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = MotionModel::new(0.1, 0.05).unwrap();
        let mut cloud = ParticleCloud::from_particles(vec![Particle::new(0.0, 0.0, 0.0, 1.0); 500]);
        model
            .apply_motion(&mut cloud, &Pose2D::new(1.0, 0.0, 0.0), &mut rng)
            .unwrap();
        let n = cloud.len() as f64;
        let mean_x = cloud.iter().map(|p| p.x).sum::<f64>() / n;
        let var_x = cloud.iter().map(|p| (p.x - mean_x).powi(2)).sum::<f64>() / n;
        assert!((mean_x - 1.0).abs() < 0.02);
        assert!((var_x.sqrt() - 0.1).abs() < 0.02);
    }

    #[test]
    fn test_first_reading_only_records_reference() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = single_particle_at(Pose2D::identity());
        let before = cloud.clone();
        let mut reference = None;
        let outcome = model
            .update(&mut cloud, &mut reference, &Pose2D::new(2.0, 1.0, 0.4), &mut rng)
            .unwrap();
        assert_eq!(outcome, MotionUpdate::ReferenceRecorded);
        assert_eq!(cloud, before);
        assert_eq!(reference, Some(Pose2D::new(2.0, 1.0, 0.4)));
    }

    #[test]
    fn test_update_uses_robot_frame_delta() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.0, 0.0).unwrap();
        let mut cloud = single_particle_at(Pose2D::identity());
        // Odometry facing +y moves one meter along +y: one meter forward in the robot frame.
        let mut reference = Some(Pose2D::new(3.0, 3.0, FRAC_PI_2));
        let outcome = model
            .update(&mut cloud, &mut reference, &Pose2D::new(3.0, 4.0, FRAC_PI_2), &mut rng)
            .unwrap();
        let MotionUpdate::Propagated(delta) = outcome else {
            panic!("expected propagation, got {outcome:?}");
        };
        assert_approx_eq!(delta.x, 1.0, 1e-12);
        assert_approx_eq!(delta.y, 0.0, 1e-12);
        assert_approx_eq!(cloud.particles()[0].x, 1.0, 1e-12);
        assert_approx_eq!(cloud.particles()[0].y, 0.0, 1e-12);
        assert_eq!(reference, Some(Pose2D::new(3.0, 4.0, FRAC_PI_2)));
    }

    #[test]
    fn test_degenerate_motion_leaves_cloud_untouched() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MotionModel::new(0.1, 0.1).unwrap();
        let mut cloud = single_particle_at(Pose2D::identity());
        let before = cloud.clone();
        let bad = Pose2D {
            x: f64::INFINITY,
            y: 0.0,
            theta: 0.0,
        };
        assert!(matches!(
            model.apply_motion(&mut cloud, &bad, &mut rng),
            Err(LocalizationError::DegenerateMotion)
        ));
        let mut reference = Some(Pose2D::identity());
        assert!(model.update(&mut cloud, &mut reference, &bad, &mut rng).is_err());
        assert_eq!(cloud, before);
        assert_eq!(reference, Some(Pose2D::identity()));
    }

    #[test]
    fn test_invalid_noise_is_rejected() {
        assert!(MotionModel::new(-0.1, 0.1).is_err());
        assert!(MotionModel::new(0.1, f64::NAN).is_err());
    }
}
