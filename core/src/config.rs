//! Configuration for the localization filter, its runtime threads, and logging.
//!
//! Configuration files are TOML. Every section and every field has a default, so a file only needs to name
//! the values it changes:
//!
//! ```toml
//! [filter]
//! n_particles = 500
//! d_thresh = 0.1
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Structurally invalid values (for example `n_particles = 0`) are rejected by [`LocalizationConfig::validate`],
//! which every constructor consuming a config calls. Such errors are fatal at startup.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{LocalizationError, Result};
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};

/// Particle filter parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of particles in the cloud.
    pub n_particles: usize,
    /// Linear odometry displacement (m, per axis) that triggers a filter update.
    pub d_thresh: f64,
    /// Angular odometry displacement (rad) that triggers a filter update.
    pub a_thresh: f64,
    /// Standard deviation of the x/y spread when seeding the cloud (m).
    pub initial_linear_noise: f64,
    /// Standard deviation of the heading spread when seeding the cloud (rad).
    pub initial_angular_noise: f64,
    /// Standard deviation of the linear noise injected per motion update (m).
    pub linear_odom_noise: f64,
    /// Standard deviation of the angular noise injected per motion update (rad).
    pub angular_odom_noise: f64,
    /// Standard deviation of the zero-mean Gaussian scoring scan-to-map distances (m).
    pub likelihood_std: f64,
    pub averaging_strategy: ParticleAveragingStrategy,
    pub resampling_strategy: ParticleResamplingStrategy,
    /// Seed for the filter's random source. `None` seeds from the operating system.
    pub seed: Option<u64>,
    /// Frame id stamped on published particle clouds.
    pub map_frame: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            n_particles: 300,
            d_thresh: 0.2,
            a_thresh: PI / 6.0,
            initial_linear_noise: 0.5,
            initial_angular_noise: 0.5,
            linear_odom_noise: 0.05,
            angular_odom_noise: 0.05,
            likelihood_std: 0.1,
            averaging_strategy: ParticleAveragingStrategy::default(),
            resampling_strategy: ParticleResamplingStrategy::default(),
            seed: None,
            map_frame: "map".to_string(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "n_particles must be positive".to_string(),
            ));
        }
        let non_negative = [
            ("d_thresh", self.d_thresh),
            ("a_thresh", self.a_thresh),
            ("initial_linear_noise", self.initial_linear_noise),
            ("initial_angular_noise", self.initial_angular_noise),
            ("linear_odom_noise", self.linear_odom_noise),
            ("angular_odom_noise", self.angular_odom_noise),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(LocalizationError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !self.likelihood_std.is_finite() || self.likelihood_std <= 0.0 {
            return Err(LocalizationError::InvalidConfig(format!(
                "likelihood_std must be finite and positive, got {}",
                self.likelihood_std
            )));
        }
        Ok(())
    }
}

/// Cadence of the estimation worker and the transform broadcaster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Idle time between polls of the estimation worker (ms).
    pub poll_interval_ms: u64,
    /// Period of the map→odom broadcast (ms).
    pub broadcast_interval_ms: u64,
    /// How far past the last scan stamp the broadcast transform is stamped (ms).
    pub transform_postdate_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            broadcast_interval_ms: 50,
            transform_postdate_ms: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_interval_ms == 0 {
            return Err(LocalizationError::InvalidConfig(
                "broadcast_interval_ms must be positive".to_string(),
            ));
        }
        if self.transform_postdate_ms < 0 {
            return Err(LocalizationError::InvalidConfig(
                "transform_postdate_ms must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// off, error, warn, info, debug or trace.
    pub level: String,
    /// Append log records to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Top-level configuration file layout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    pub filter: FilterConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl LocalizationConfig {
    /// Reads and validates a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: LocalizationConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML, creating parent directories as needed.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.runtime.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn defaults_are_sane_and_valid() {
        let config = FilterConfig::default();
        assert_eq!(config.n_particles, 300);
        assert_approx_eq!(config.d_thresh, 0.2, 1e-12);
        assert_approx_eq!(config.a_thresh, PI / 6.0, 1e-12);
        assert_approx_eq!(config.likelihood_std, 0.1, 1e-12);
        assert!(LocalizationConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_particles_is_fatal() {
        let config = FilterConfig {
            n_particles: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LocalizationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn negative_noise_is_rejected() {
        let config = FilterConfig {
            linear_odom_noise: -0.1,
            ..FilterConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("linear_odom_noise"));

        let config = FilterConfig {
            likelihood_std: 0.0,
            ..FilterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = LocalizationConfig::from_toml_str(
            r#"
            [filter]
            n_particles = 50
            resampling_strategy = "systematic"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.filter.n_particles, 50);
        assert_eq!(
            config.filter.resampling_strategy,
            ParticleResamplingStrategy::Systematic
        );
        assert_approx_eq!(config.filter.d_thresh, 0.2, 1e-12);
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn negative_particle_count_fails_to_parse() {
        let result = LocalizationConfig::from_toml_str("[filter]\nn_particles = -3\n");
        assert!(matches!(result, Err(LocalizationError::ConfigParse(_))));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mcl.toml");
        let mut config = LocalizationConfig::default();
        config.filter.seed = Some(11);
        config.filter.n_particles = 42;
        config.to_file(&path).unwrap();
        let loaded = LocalizationConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
