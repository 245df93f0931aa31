//! Monte Carlo localization toolbox for planar mobile robots
//!
//! This crate estimates a robot's pose $(x, y, \theta)$ inside a known map by fusing noisy wheel odometry with
//! range-sensor observations. The estimator is a sequential Bayesian filter approximated by a weighted set of
//! samples (a particle filter). Each cycle of the filter runs the same fixed sequence of steps:
//!
//! 1. **Motion update** ([motion]): every particle is moved by the rigid-body displacement the odometry reports
//!    since the previous update, perturbed with Gaussian noise.
//! 2. **Observation update** ([measurements]): the range scan is projected into the map from every particle's
//!    pose and scored against the distance to the nearest mapped obstacle.
//! 3. **Normalization and pose estimate** ([particle]): weights are renormalized and an aggregate pose is taken
//!    (arithmetic mean for position, circular mean for heading).
//! 4. **Resampling** ([particle]): a new generation is drawn with replacement, probability proportional to weight.
//!
//! The [controller] decides when a cycle runs (only after sufficient motion) and the [runtime] module wires the
//! controller into a polling estimation worker plus a fixed-rate transform broadcaster.
//!
//! ## Crate overview
//!
//! - [config]: Serializable configuration for the filter, the runtime threads, and logging.
//! - [controller]: The update controller state machine that orchestrates one filter cycle.
//! - [error]: The crate error type.
//! - [logging]: Logger initialization shared by the binary and test harnesses.
//! - [map]: A precomputed nearest-obstacle distance field implementing [measurements::MapDistance].
//! - [measurements]: Range scans, the map-distance query trait, and the observation (likelihood) model.
//! - [motion]: The odometry motion model.
//! - [odometry]: Odometry pose resolution by timestamp.
//! - [particle]: Particles, the particle cloud, averaging and resampling strategies.
//! - [publish]: Published messages, the publisher trait, and the shared estimate snapshot.
//! - [runtime]: Estimation worker and transform broadcaster threads.
//! - [sim]: Synthetic worlds and a scenario driver used by the `mcl` binary and the tests.
//!
//! ## Frames and conventions
//!
//! Three planar frames are involved: `map` (the fixed world frame of the occupancy map), `odom` (the drifting
//! frame in which wheel odometry integrates) and `base` (the robot body). A pose is the rigid transform
//! $T \in SE(2)$ of a child frame expressed in a parent frame:
//!
//! $$
//! T = \begin{bmatrix} \cos\theta & -\sin\theta & x \\\\ \sin\theta & \cos\theta & y \\\\ 0 & 0 & 1 \end{bmatrix}
//! $$
//!
//! The relative motion between two odometry poses $T_{k-1}$ and $T_k$ is $\Delta = T_{k-1}^{-1} T_k$, which is
//! expressed in the robot's own frame at time $k-1$. A particle is propagated by right-composition,
//! $T_i^+ = T_i \Delta$, so heading is correctly accounted for rather than naively adding coordinate differences.
//!
//! Headings are always wrapped into $(-\pi, \pi]$ by [wrap_to_pi].
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod map;
pub mod measurements;
pub mod motion;
pub mod odometry;
pub mod particle;
pub mod publish;
pub mod runtime;
pub mod sim;

use nalgebra::{Isometry2, Point2, Vector2};
use serde::{Deserialize, Serialize};

use std::f64::consts::PI;
use std::fmt::{self, Display};

pub use crate::error::{LocalizationError, Result};

/// Planar pose (or planar rigid transform) of a child frame in a parent frame.
///
/// The heading `theta` is in radians. Constructors wrap it into $(-\pi, \pi]$; the fields are public so
/// callers building poses by hand are responsible for doing the same.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose2D(x: {:.4} m, y: {:.4} m, theta: {:.4} rad)",
            self.x, self.y, self.theta
        )
    }
}
impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D {
            x,
            y,
            theta: wrap_to_pi(theta),
        }
    }
    pub fn identity() -> Self {
        Pose2D::default()
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
    /// Returns `InvalidPose` unless all three components are finite.
    pub fn validate(&self) -> Result<()> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(LocalizationError::InvalidPose {
                x: self.x,
                y: self.y,
                theta: self.theta,
            })
        }
    }
    pub fn to_isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    pub fn from_isometry(isometry: &Isometry2<f64>) -> Self {
        Pose2D {
            x: isometry.translation.vector.x,
            y: isometry.translation.vector.y,
            theta: wrap_to_pi(isometry.rotation.angle()),
        }
    }
    /// SE(2) composition `self · delta`: applies `delta`, expressed in this pose's frame.
    pub fn compose(&self, delta: &Pose2D) -> Pose2D {
        Pose2D::from_isometry(&(self.to_isometry() * delta.to_isometry()))
    }
    pub fn inverse(&self) -> Pose2D {
        Pose2D::from_isometry(&self.to_isometry().inverse())
    }
    /// Rigid displacement from `reference` to `self`, expressed in the `reference` frame
    /// (`reference⁻¹ · self`).
    ///
    /// Fails with [`LocalizationError::DegenerateMotion`] if either pose or the result is not finite so that a
    /// corrupted transform can never be composed into the particle cloud.
    pub fn relative_to(&self, reference: &Pose2D) -> Result<Pose2D> {
        if !self.is_finite() || !reference.is_finite() {
            return Err(LocalizationError::DegenerateMotion);
        }
        let delta = Pose2D::from_isometry(&(reference.to_isometry().inverse() * self.to_isometry()));
        if delta.is_finite() {
            Ok(delta)
        } else {
            Err(LocalizationError::DegenerateMotion)
        }
    }
    /// Maps a point expressed in this pose's frame into the parent frame.
    pub fn transform_point(&self, point: &Point2<f64>) -> Point2<f64> {
        self.to_isometry() * point
    }
}
impl From<(f64, f64, f64)> for Pose2D {
    fn from(tuple: (f64, f64, f64)) -> Self {
        Pose2D::new(tuple.0, tuple.1, tuple.2)
    }
}
impl From<Pose2D> for Vec<f64> {
    fn from(pose: Pose2D) -> Self {
        vec![pose.x, pose.y, pose.theta]
    }
}
impl TryFrom<&[f64]> for Pose2D {
    type Error = &'static str;
    fn try_from(slice: &[f64]) -> std::result::Result<Self, Self::Error> {
        if slice.len() != 3 {
            return Err("Pose2D requires exactly three elements [x, y, theta]");
        }
        Ok(Pose2D::new(slice[0], slice[1], slice[2]))
    }
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// Non-finite inputs are returned unchanged so callers can still detect them.
///
/// # Example
/// ```rust
/// use mcl::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}
/// Signed shortest-arc difference `a - b`, wrapped to $(-\pi, \pi]$.
pub fn angle_difference(a: f64, b: f64) -> f64 {
    wrap_to_pi(a - b)
}
