//! Particles, the particle cloud, and the resampling / averaging strategies that act on it.
//!
//! The cloud owns every particle. The motion and observation models mutate it in place; resampling replaces
//! it wholesale with a new generation of independent copies.
use crate::{Pose2D, wrap_to_pi};
use crate::error::{LocalizationError, Result};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// One pose hypothesis with its importance weight.
///
/// The particle does not ensure its weight is normalized; that is the cloud's job.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("theta", &self.theta)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(x: f64, y: f64, theta: f64, weight: f64) -> Particle {
        Particle {
            x,
            y,
            theta: wrap_to_pi(theta),
            weight,
        }
    }
    pub fn from_pose(pose: &Pose2D, weight: f64) -> Particle {
        Particle::new(pose.x, pose.y, pose.theta, weight)
    }
    pub fn pose(&self) -> Pose2D {
        Pose2D {
            x: self.x,
            y: self.y,
            theta: self.theta,
        }
    }
    pub fn set_pose(&mut self, pose: &Pose2D) {
        self.x = pose.x;
        self.y = pose.y;
        self.theta = wrap_to_pi(pose.theta);
    }
}

/// How the cloud is summarized into a single pose.
///
/// Position is an arithmetic mean and heading a circular mean in both averaging variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    /// Mean weighted by the current (normalized) importance weights.
    #[default]
    WeightedAverage,
    /// Plain mean over all particles, ignoring weights.
    UnweightedAverage,
    /// Pose of the single heaviest particle.
    HighestWeight,
}

/// How a new generation is drawn from the current cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// Independent draws with replacement via the cumulative distribution and binary search.
    #[default]
    Multinomial,
    /// A single random offset and evenly spaced pointers.
    Systematic,
    /// One uniform draw inside each of `n` equal strata.
    Stratified,
    /// Deterministic copies of `floor(n * w)` plus systematic draws over the residuals.
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draws `n` source indices from `weights`. The weights need not be normalized; if they do not carry any
    /// positive finite mass the draw is uniform.
    pub fn resample_indices<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        n: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        if weights.is_empty() || n == 0 {
            return Vec::new();
        }
        match self {
            ParticleResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ParticleResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ParticleResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

/// Running sum of the weights, scaled to end at 1.0. Non-finite or negative weights count as zero and an
/// all-zero input becomes uniform.
fn cumulative_distribution(weights: &[f64]) -> Vec<f64> {
    let clean: Vec<f64> = weights
        .iter()
        .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let total: f64 = clean.iter().sum();
    let n = weights.len();
    let mut cumulative = Vec::with_capacity(n);
    if total > 0.0 && total.is_finite() {
        let mut sum = 0.0;
        for w in clean {
            sum += w / total;
            cumulative.push(sum);
        }
    } else {
        for i in 0..n {
            cumulative.push((i + 1) as f64 / n as f64);
        }
    }
    if let Some(last) = cumulative.last_mut() {
        *last = 1.0;
    }
    cumulative
}

/// Index of the first cumulative entry strictly greater than `u`, clamped to the last index.
fn search_cumulative(cumulative: &[f64], u: f64) -> usize {
    cumulative
        .partition_point(|&c| c <= u)
        .min(cumulative.len() - 1)
}

pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumulative = cumulative_distribution(weights);
    (0..n)
        .map(|_| search_cumulative(&cumulative, rng.random::<f64>()))
        .collect()
}

pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumulative = cumulative_distribution(weights);
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    let mut indices = Vec::with_capacity(n);
    let mut i = 0;
    for j in 0..n {
        let u = offset + j as f64 * step;
        while i < cumulative.len() - 1 && u >= cumulative[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumulative = cumulative_distribution(weights);
    let step = 1.0 / n as f64;
    let mut indices = Vec::with_capacity(n);
    let mut i = 0;
    for j in 0..n {
        let u = (j as f64 + rng.random::<f64>()) * step;
        while i < cumulative.len() - 1 && u >= cumulative[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumulative = cumulative_distribution(weights);
    // Recover the normalized weights from the cumulative sum so all strategies agree on cleaning.
    let normalized: Vec<f64> = cumulative
        .iter()
        .scan(0.0, |previous, &c| {
            let w = (c - *previous).max(0.0);
            *previous = c;
            Some(w)
        })
        .collect();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(normalized.len());
    for (i, &w) in normalized.iter().enumerate() {
        let expected = w * n as f64;
        let copies = (expected.floor() as usize).min(n - indices.len());
        indices.extend(std::iter::repeat_n(i, copies));
        residual.push(expected - copies as f64);
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// Result of [`ParticleCloud::normalize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizationOutcome {
    /// Weights were divided by their (positive, finite) sum.
    Normalized,
    /// The weight sum was zero or not finite; every weight was reset to `1/N`.
    UniformReset,
    /// There were no particles to normalize.
    Empty,
}

/// Ordered, weighted sample set approximating the pose posterior.
#[derive(Clone, Default, PartialEq)]
pub struct ParticleCloud {
    particles: Vec<Particle>,
}
impl Debug for ParticleCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mut debug = f.debug_struct("ParticleCloud");
        debug
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            );
        if let Some(mean) = self.aggregate_pose(ParticleAveragingStrategy::WeightedAverage) {
            debug.field(
                "mean_pose",
                &format_args!("({:.3} m, {:.3} m, {:.3} rad)", mean.x, mean.y, mean.theta),
            );
        }
        debug.finish()
    }
}
impl ParticleCloud {
    /// An empty, uninitialized cloud.
    pub fn new() -> Self {
        ParticleCloud::default()
    }
    pub fn from_particles(particles: Vec<Particle>) -> Self {
        ParticleCloud { particles }
    }
    /// Replaces the cloud with `n_particles` poses drawn from independent Gaussians around `seed` and
    /// normalizes the (initially equal) weights.
    ///
    /// # Arguments
    /// * `seed` - Mean pose; must be finite.
    /// * `n_particles` - Number of particles, must be positive.
    /// * `linear_noise_std` - Standard deviation of x and y (m).
    /// * `angular_noise_std` - Standard deviation of theta (rad).
    /// * `rng` - Random source.
    pub fn initialize<R: Rng + ?Sized>(
        &mut self,
        seed: &Pose2D,
        n_particles: usize,
        linear_noise_std: f64,
        angular_noise_std: f64,
        rng: &mut R,
    ) -> Result<()> {
        seed.validate()?;
        if n_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "cannot initialize a cloud with zero particles".to_string(),
            ));
        }
        let normal_x = gaussian(seed.x, linear_noise_std, "linear_noise_std")?;
        let normal_y = gaussian(seed.y, linear_noise_std, "linear_noise_std")?;
        let normal_theta = gaussian(seed.theta, angular_noise_std, "angular_noise_std")?;

        self.particles = (0..n_particles)
            .map(|_| {
                Particle::new(
                    normal_x.sample(rng),
                    normal_y.sample(rng),
                    normal_theta.sample(rng),
                    1.0,
                )
            })
            .collect();
        self.normalize();
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn poses(&self) -> Vec<Pose2D> {
        self.particles.iter().map(Particle::pose).collect()
    }
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    pub fn weight_sum(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }
    /// Scales the weights to sum to one.
    ///
    /// A zero or non-finite sum cannot be divided through without producing NaNs, so the weights are reset
    /// to the uniform distribution instead and the condition is reported to the caller.
    pub fn normalize(&mut self) -> NormalizationOutcome {
        if self.particles.is_empty() {
            return NormalizationOutcome::Empty;
        }
        let sum = self.weight_sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
            NormalizationOutcome::Normalized
        } else {
            self.reset_weights();
            NormalizationOutcome::UniformReset
        }
    }
    pub fn reset_weights(&mut self) {
        let uniform = 1.0 / self.particles.len() as f64;
        for particle in &mut self.particles {
            particle.weight = uniform;
        }
    }
    /// N_eff = 1 / sum(w_i^2), assuming normalized weights.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    /// Summarizes the cloud into one pose; `None` for an empty cloud.
    ///
    /// Heading uses the circular mean `atan2(mean(sin θ), mean(cos θ))` so that hypotheses on both sides of
    /// the ±π seam average to ±π rather than 0. The weighted average falls back to the unweighted one when
    /// the weights carry no usable mass.
    pub fn aggregate_pose(&self, strategy: ParticleAveragingStrategy) -> Option<Pose2D> {
        if self.particles.is_empty() {
            return None;
        }
        match strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let total = self.weight_sum();
                if total > 0.0 && total.is_finite() {
                    Some(self.mean_pose(|p| p.weight / total))
                } else {
                    Some(self.unweighted_mean())
                }
            }
            ParticleAveragingStrategy::UnweightedAverage => Some(self.unweighted_mean()),
            ParticleAveragingStrategy::HighestWeight => self
                .particles
                .iter()
                .filter(|p| p.weight.is_finite())
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .or_else(|| self.particles.first())
                .map(Particle::pose),
        }
    }
    fn unweighted_mean(&self) -> Pose2D {
        let n = self.particles.len() as f64;
        self.mean_pose(|_| 1.0 / n)
    }
    fn mean_pose<F: Fn(&Particle) -> f64>(&self, coefficient: F) -> Pose2D {
        let (mut x, mut y, mut sin, mut cos) = (0.0, 0.0, 0.0, 0.0);
        for particle in &self.particles {
            let c = coefficient(particle);
            x += c * particle.x;
            y += c * particle.y;
            sin += c * particle.theta.sin();
            cos += c * particle.theta.cos();
        }
        Pose2D {
            x,
            y,
            theta: wrap_to_pi(sin.atan2(cos)),
        }
    }
    /// Draws `n_particles` particles with replacement, probability proportional to weight.
    ///
    /// The result is a new cloud of independent copies with uniform weights `1/n`. A cloud whose mass sits
    /// on a single particle yields `n` copies of that particle. An empty source yields an empty cloud.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        n_particles: usize,
        strategy: ParticleResamplingStrategy,
        rng: &mut R,
    ) -> ParticleCloud {
        let weights = self.weights();
        let indices = strategy.resample_indices(&weights, n_particles, rng);
        let uniform = 1.0 / n_particles as f64;
        let particles = indices
            .into_iter()
            .map(|i| {
                let mut particle = self.particles[i];
                particle.weight = uniform;
                particle
            })
            .collect();
        ParticleCloud { particles }
    }
}
impl<'a> IntoIterator for &'a ParticleCloud {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;
    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

fn gaussian(mean: f64, std_dev: f64, name: &str) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev).map_err(|e| {
        LocalizationError::InvalidConfig(format!("{name} = {std_dev} is not a valid std dev: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    const STRATEGIES: [ParticleResamplingStrategy; 4] = [
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Residual,
    ];

    fn cloud_with_weights(weights: &[f64]) -> ParticleCloud {
        ParticleCloud::from_particles(
            weights
                .iter()
                .enumerate()
                .map(|(i, &w)| Particle::new(i as f64, -(i as f64), 0.01 * i as f64, w))
                .collect(),
        )
    }

    #[test]
    fn test_initialize_populates_and_normalizes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut cloud = ParticleCloud::new();
        assert!(cloud.is_empty());
        cloud
            .initialize(&Pose2D::new(1.0, 2.0, 0.5), 300, 0.5, 0.5, &mut rng)
            .unwrap();
        assert_eq!(cloud.len(), 300);
        assert_approx_eq!(cloud.weight_sum(), 1.0, 1e-9);
        for p in cloud.iter() {
            assert_approx_eq!(p.weight, 1.0 / 300.0, 1e-12);
            assert!(p.theta > -PI && p.theta <= PI);
        }
        let mean = cloud
            .aggregate_pose(ParticleAveragingStrategy::UnweightedAverage)
            .unwrap();
        assert!((mean.x - 1.0).abs() < 0.15);
        assert!((mean.y - 2.0).abs() < 0.15);
    }

    #[test]
    fn test_initialize_rejects_bad_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut cloud = ParticleCloud::new();
        let nan_seed = Pose2D {
            x: f64::NAN,
            y: 0.0,
            theta: 0.0,
        };
        assert!(matches!(
            cloud.initialize(&nan_seed, 10, 0.1, 0.1, &mut rng),
            Err(LocalizationError::InvalidPose { .. })
        ));
        assert!(cloud
            .initialize(&Pose2D::identity(), 0, 0.1, 0.1, &mut rng)
            .is_err());
        assert!(cloud
            .initialize(&Pose2D::identity(), 10, -1.0, 0.1, &mut rng)
            .is_err());
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_initialize_with_zero_noise_stacks_on_seed() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cloud = ParticleCloud::new();
        let seed = Pose2D::new(-1.0, 4.0, 2.0);
        cloud.initialize(&seed, 5, 0.0, 0.0, &mut rng).unwrap();
        for p in cloud.iter() {
            assert_eq!(p.pose(), seed);
        }
    }

    #[test]
    fn test_normalize_sums_to_one_for_any_size() {
        let mut rng = StdRng::seed_from_u64(9);
        for n in [1usize, 2, 7, 300, 1000] {
            let weights: Vec<f64> = (0..n).map(|_| rng.random::<f64>() * 10.0 + 1e-6).collect();
            let mut cloud = cloud_with_weights(&weights);
            assert_eq!(cloud.normalize(), NormalizationOutcome::Normalized);
            assert_approx_eq!(cloud.weight_sum(), 1.0, 1e-9);
        }
    }

    #[test]
    fn test_normalize_zero_sum_resets_to_uniform() {
        let mut cloud = cloud_with_weights(&[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(cloud.normalize(), NormalizationOutcome::UniformReset);
        for p in cloud.iter() {
            assert_approx_eq!(p.weight, 0.25, 1e-12);
        }

        let mut cloud = cloud_with_weights(&[1.0, f64::NAN]);
        assert_eq!(cloud.normalize(), NormalizationOutcome::UniformReset);
        assert!(cloud.iter().all(|p| p.weight.is_finite()));

        let mut empty = ParticleCloud::new();
        assert_eq!(empty.normalize(), NormalizationOutcome::Empty);
    }

    #[test]
    fn test_circular_mean_across_the_seam() {
        let mut cloud = ParticleCloud::from_particles(vec![
            Particle::new(0.0, 0.0, PI - 0.01, 0.5),
            Particle::new(0.0, 0.0, -PI + 0.01, 0.5),
        ]);
        for strategy in [
            ParticleAveragingStrategy::WeightedAverage,
            ParticleAveragingStrategy::UnweightedAverage,
        ] {
            let mean = cloud.aggregate_pose(strategy).unwrap();
            assert!(
                (mean.theta.abs() - PI).abs() < 1e-6,
                "mean heading {} should be near ±π",
                mean.theta
            );
        }
        cloud.particles_mut()[0].weight = 0.0;
        let mean = cloud
            .aggregate_pose(ParticleAveragingStrategy::WeightedAverage)
            .unwrap();
        assert_approx_eq!(mean.theta, -PI + 0.01, 1e-9);
    }

    #[test]
    fn test_weighted_and_unweighted_means_differ() {
        let cloud = ParticleCloud::from_particles(vec![
            Particle::new(0.0, 0.0, 0.0, 0.9),
            Particle::new(10.0, 0.0, 0.0, 0.1),
        ]);
        let weighted = cloud
            .aggregate_pose(ParticleAveragingStrategy::WeightedAverage)
            .unwrap();
        let unweighted = cloud
            .aggregate_pose(ParticleAveragingStrategy::UnweightedAverage)
            .unwrap();
        let best = cloud
            .aggregate_pose(ParticleAveragingStrategy::HighestWeight)
            .unwrap();
        assert_approx_eq!(weighted.x, 1.0, 1e-12);
        assert_approx_eq!(unweighted.x, 5.0, 1e-12);
        assert_approx_eq!(best.x, 0.0, 1e-12);
        assert!(ParticleCloud::new()
            .aggregate_pose(ParticleAveragingStrategy::WeightedAverage)
            .is_none());
    }

    #[test]
    fn test_resample_returns_n_existing_poses() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut cloud = cloud_with_weights(&[0.1, 0.4, 0.2, 0.3, 0.0]);
        cloud.normalize();
        for strategy in STRATEGIES {
            for n in [1usize, 5, 17, 300] {
                let resampled = cloud.resample(n, strategy, &mut rng);
                assert_eq!(resampled.len(), n, "{strategy:?}");
                assert_approx_eq!(resampled.weight_sum(), 1.0, 1e-9);
                for p in resampled.iter() {
                    assert!(
                        cloud.iter().any(|q| q.pose() == p.pose()),
                        "{strategy:?} fabricated pose {}",
                        p
                    );
                    // The zero-weight particle sits at x = 4.
                    assert!(p.x != 4.0, "{strategy:?} drew a zero-weight particle");
                }
            }
        }
    }

    #[test]
    fn test_resample_degenerate_cloud_copies_survivor() {
        let mut rng = StdRng::seed_from_u64(5);
        let cloud = cloud_with_weights(&[0.0, 0.0, 1.0, 0.0]);
        for strategy in STRATEGIES {
            let resampled = cloud.resample(50, strategy, &mut rng);
            assert_eq!(resampled.len(), 50);
            for p in resampled.iter() {
                assert_eq!(p.pose(), cloud.particles()[2].pose());
            }
        }
    }

    #[test]
    fn test_resample_copies_are_independent() {
        let mut rng = StdRng::seed_from_u64(5);
        let cloud = cloud_with_weights(&[1.0]);
        let mut resampled = cloud.resample(3, ParticleResamplingStrategy::Multinomial, &mut rng);
        resampled.particles_mut()[0].x = 99.0;
        assert_eq!(resampled.particles()[1].x, 0.0);
        assert_eq!(cloud.particles()[0].x, 0.0);
    }

    #[test]
    fn test_multinomial_frequencies_follow_weights() {
        let mut rng = StdRng::seed_from_u64(77);
        let indices = multinomial_resample(&[0.2, 0.8], 20_000, &mut rng);
        let ones = indices.iter().filter(|&&i| i == 1).count() as f64 / 20_000.0;
        assert!((ones - 0.8).abs() < 0.02, "fraction of heavy draws {ones}");
    }

    #[test]
    fn test_resampling_all_zero_weights_is_uniform() {
        let mut rng = StdRng::seed_from_u64(13);
        for strategy in STRATEGIES {
            let indices = strategy.resample_indices(&[0.0, 0.0, 0.0], 3000, &mut rng);
            assert_eq!(indices.len(), 3000);
            for k in 0..3 {
                let count = indices.iter().filter(|&&i| i == k).count();
                assert!(count > 800, "{strategy:?} index {k} drawn {count} times");
            }
        }
    }

    #[test]
    fn test_effective_sample_size() {
        let mut cloud = cloud_with_weights(&[1.0; 10]);
        cloud.normalize();
        assert_approx_eq!(cloud.effective_sample_size(), 10.0, 1e-9);
        let peaked = cloud_with_weights(&[0.0, 1.0, 0.0]);
        assert_approx_eq!(peaked.effective_sample_size(), 1.0, 1e-12);
    }
}
