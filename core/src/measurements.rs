//! Range scans and the observation model.
//!
//! This module defines the range-bearing scan consumed by the filter, the map distance query the
//! observation model scores against, and the Gaussian likelihood that turns a scan-to-map distance into a
//! particle weight.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use nalgebra::Point2;
use rayon::prelude::*;

use crate::error::{LocalizationError, Result};
use crate::particle::ParticleCloud;

/// Nearest-obstacle distance lookup in the map frame.
///
/// Returns the distance (m) from `(x, y)` to the closest mapped obstacle, or a non-finite value when the
/// point is outside the map or the distance is unknown. It is called once per particle per scan point, from
/// several threads at once.
pub trait MapDistance: Sync {
    fn distance(&self, x: f64, y: f64) -> f64;
}
impl<F> MapDistance for F
where
    F: Fn(f64, f64) -> f64 + Sync,
{
    fn distance(&self, x: f64, y: f64) -> f64 {
        self(x, y)
    }
}

/// Density of a scan-to-map distance.
pub trait Likelihood: Sync {
    fn density(&self, distance: f64) -> f64;
}

/// Zero-mean normal density over the scan-to-map distance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianLikelihood {
    std_dev: f64,
    normalizer: f64,
}
impl GaussianLikelihood {
    pub fn new(std_dev: f64) -> Result<Self> {
        if !std_dev.is_finite() || std_dev <= 0.0 {
            return Err(LocalizationError::InvalidConfig(format!(
                "likelihood_std must be finite and positive, got {std_dev}"
            )));
        }
        Ok(GaussianLikelihood {
            std_dev,
            normalizer: 1.0 / (std_dev * (2.0 * std::f64::consts::PI).sqrt()),
        })
    }
    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }
}
impl Likelihood for GaussianLikelihood {
    fn density(&self, distance: f64) -> f64 {
        let z = distance / self.std_dev;
        self.normalizer * (-0.5 * z * z).exp()
    }
}

/// One laser sweep in the robot frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeScan {
    pub stamp: DateTime<Utc>,
    /// Ranges (m). Zero, negative, infinite and NaN readings are treated as "no return".
    pub ranges: Vec<f64>,
    /// Bearing of each range in the robot frame (rad, counter-clockwise from +x).
    pub bearings: Vec<f64>,
}
impl Display for RangeScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RangeScan(stamp: {}, beams: {}, valid: {})",
            self.stamp,
            self.ranges.len(),
            self.valid_count()
        )
    }
}
impl RangeScan {
    pub fn new(stamp: DateTime<Utc>, ranges: Vec<f64>, bearings: Vec<f64>) -> Result<Self> {
        if ranges.len() != bearings.len() {
            return Err(LocalizationError::MalformedScan {
                ranges: ranges.len(),
                bearings: bearings.len(),
            });
        }
        Ok(RangeScan {
            stamp,
            ranges,
            bearings,
        })
    }
    /// Builds a scan whose beam `i` points at `angle_min + i * angle_increment`.
    pub fn from_uniform(
        stamp: DateTime<Utc>,
        ranges: Vec<f64>,
        angle_min: f64,
        angle_increment: f64,
    ) -> Self {
        let bearings = (0..ranges.len())
            .map(|i| angle_min + i as f64 * angle_increment)
            .collect();
        RangeScan {
            stamp,
            ranges,
            bearings,
        }
    }
    pub fn len(&self) -> usize {
        self.ranges.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
    pub fn valid_count(&self) -> usize {
        self.ranges.iter().filter(|&&r| is_valid_range(r)).count()
    }
    /// Cartesian robot-frame endpoints of the valid returns.
    pub fn to_points(&self) -> Vec<Point2<f64>> {
        self.ranges
            .iter()
            .zip(&self.bearings)
            .filter(|(r, b)| is_valid_range(**r) && b.is_finite())
            .map(|(r, b)| Point2::new(r * b.cos(), r * b.sin()))
            .collect()
    }
}

fn is_valid_range(range: f64) -> bool {
    range.is_finite() && range > 0.0
}

/// Result of [`ObservationModel::weigh_particles`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// Every particle was reweighed. `unscored` particles had no point with a finite map distance and
    /// were given weight zero.
    Weighted { scored: usize, unscored: usize },
    /// The scan had no usable point; weights were left untouched.
    NoValidPoints,
}

/// Scores particles by how well the scan lines up with the map from their pose.
#[derive(Clone, Copy, Debug)]
pub struct ObservationModel {
    likelihood: GaussianLikelihood,
}
impl ObservationModel {
    pub fn new(likelihood_std: f64) -> Result<Self> {
        Ok(ObservationModel {
            likelihood: GaussianLikelihood::new(likelihood_std)?,
        })
    }
    pub fn likelihood(&self) -> &GaussianLikelihood {
        &self.likelihood
    }
    /// Sets each particle's weight to the mean likelihood of its scan-to-map distances.
    ///
    /// The weights are not normalized; the caller must normalize the cloud before estimating or resampling.
    pub fn weigh_particles<M: MapDistance + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        points: &[Point2<f64>],
        map: &M,
    ) -> ObservationOutcome {
        weigh_particles(cloud, points, map, &self.likelihood)
    }
}

/// Per-particle observation weighting, run in parallel over the cloud.
pub fn weigh_particles<M, L>(
    cloud: &mut ParticleCloud,
    points: &[Point2<f64>],
    map: &M,
    likelihood: &L,
) -> ObservationOutcome
where
    M: MapDistance + ?Sized,
    L: Likelihood + ?Sized,
{
    if points.is_empty() {
        return ObservationOutcome::NoValidPoints;
    }
    let unscored = cloud
        .particles_mut()
        .par_iter_mut()
        .map(|particle| {
            let pose = particle.pose();
            let (sum, count) = points
                .iter()
                .map(|point| {
                    let global = pose.transform_point(point);
                    map.distance(global.x, global.y)
                })
                .filter(|distance| distance.is_finite())
                .fold((0.0, 0usize), |(sum, count), distance| {
                    (sum + likelihood.density(distance), count + 1)
                });
            if count == 0 {
                particle.weight = 0.0;
                1
            } else {
                particle.weight = sum / count as f64;
                0
            }
        })
        .sum::<usize>();
    ObservationOutcome::Weighted {
        scored: cloud.len() - unscored,
        unscored,
    }
}
