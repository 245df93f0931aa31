//! Simulation harness: a synthetic world, a ray-casting range sensor, drifting wheel odometry and a scenario
//! driver that runs the update controller over them and records truth against estimate.
//!
//! The world is a rectangular room plus axis-aligned box obstacles, all stored as wall segments. The robot
//! follows a constant-twist (unicycle) trajectory. Odometry integrates the same motion with a multiplicative
//! bias and Gaussian noise, so the odometry frame slowly drifts away from the map frame and the filter has
//! something to correct.
use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use nalgebra::{Point2, Vector2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::LocalizationConfig;
use crate::controller::{StepOutcome, UpdateController};
use crate::error::{LocalizationError, Result};
use crate::map::{GridGeometry, OccupancyField};
use crate::measurements::RangeScan;
use crate::odometry::OdometryBuffer;
use crate::publish::RecordingPublisher;
use crate::{Pose2D, angle_difference};

/// A straight wall from `start` to `end` in the map frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}
impl Segment {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Segment {
            start: Point2::new(x0, y0),
            end: Point2::new(x1, y1),
        }
    }
    pub fn length(&self) -> f64 {
        (self.end - self.start).norm()
    }
    /// Distance along the ray `origin + t * direction` (unit direction) to this segment, if it is hit.
    pub fn intersect(&self, origin: &Point2<f64>, direction: &Vector2<f64>) -> Option<f64> {
        let edge = self.end - self.start;
        let denominator = cross(direction, &edge);
        if denominator.abs() < 1e-12 {
            return None;
        }
        let offset = self.start - origin;
        let t = cross(&offset, &edge) / denominator;
        let u = cross(&offset, direction) / denominator;
        if t >= 0.0 && (0.0..=1.0).contains(&u) {
            Some(t)
        } else {
            None
        }
    }
}

fn cross(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Axis-aligned rectangular obstacle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxObstacle {
    pub x: f64,
    pub y: f64,
    pub half_width: f64,
    pub half_height: f64,
}

#[derive(Clone, Debug, Default)]
pub struct World {
    segments: Vec<Segment>,
}
impl World {
    /// Closed room spanning `[0, width] x [0, height]`.
    pub fn rectangular_room(width: f64, height: f64) -> Self {
        let mut world = World::default();
        world.add_rectangle(0.0, 0.0, width, height);
        world
    }
    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }
    pub fn add_box(&mut self, obstacle: &BoxObstacle) {
        self.add_rectangle(
            obstacle.x - obstacle.half_width,
            obstacle.y - obstacle.half_height,
            obstacle.x + obstacle.half_width,
            obstacle.y + obstacle.half_height,
        );
    }
    fn add_rectangle(&mut self, x0: f64, y0: f64, x1: f64, y1: f64) {
        self.segments.extend([
            Segment::new(x0, y0, x1, y0),
            Segment::new(x1, y0, x1, y1),
            Segment::new(x1, y1, x0, y1),
            Segment::new(x0, y1, x0, y0),
        ]);
    }
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    /// Range to the closest wall along `bearing` (map frame), or `None` beyond `max_range`.
    pub fn raycast(&self, origin: &Point2<f64>, bearing: f64, max_range: f64) -> Option<f64> {
        let direction = Vector2::new(bearing.cos(), bearing.sin());
        self.segments
            .iter()
            .filter_map(|segment| segment.intersect(origin, &direction))
            .filter(|&t| t <= max_range)
            .min_by(|a, b| a.total_cmp(b))
    }
    /// Simulated scan from `pose`: `n_beams` evenly spaced over a full turn, with additive range noise.
    /// Beams that hit nothing within `max_range` report `INFINITY`.
    pub fn scan(
        &self,
        pose: &Pose2D,
        stamp: DateTime<Utc>,
        sensor: &SensorModel,
        rng: &mut StdRng,
    ) -> RangeScan {
        let origin = Point2::new(pose.x, pose.y);
        let increment = 2.0 * std::f64::consts::PI / sensor.n_beams as f64;
        let ranges = (0..sensor.n_beams)
            .map(|i| {
                let bearing = pose.theta + i as f64 * increment;
                match self.raycast(&origin, bearing, sensor.max_range) {
                    Some(range) => (range + sensor.noise.sample(rng)).max(0.0),
                    None => f64::INFINITY,
                }
            })
            .collect();
        RangeScan::from_uniform(stamp, ranges, 0.0, increment)
    }
    /// Rasterizes the walls into an occupancy field with `margin` metres of free space around them.
    pub fn to_occupancy_field(&self, resolution: f64, margin: f64) -> Result<OccupancyField> {
        if self.segments.is_empty() {
            return Err(LocalizationError::InvalidConfig(
                "cannot build a map from an empty world".to_string(),
            ));
        }
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(LocalizationError::InvalidConfig(format!(
                "map resolution must be positive, got {resolution}"
            )));
        }
        let (mut min, mut max) = (self.segments[0].start, self.segments[0].start);
        for point in self.segments.iter().flat_map(|s| [s.start, s.end]) {
            min = Point2::new(min.x.min(point.x), min.y.min(point.y));
            max = Point2::new(max.x.max(point.x), max.y.max(point.y));
        }
        let geometry = GridGeometry {
            resolution,
            origin_x: min.x - margin,
            origin_y: min.y - margin,
            width: ((max.x - min.x + 2.0 * margin) / resolution).ceil() as usize + 1,
            height: ((max.y - min.y + 2.0 * margin) / resolution).ceil() as usize + 1,
        };
        let mut obstacles = Vec::new();
        for segment in &self.segments {
            let steps = (segment.length() / (0.5 * resolution)).ceil().max(1.0) as usize;
            for k in 0..=steps {
                obstacles.push(segment.start + (segment.end - segment.start) * (k as f64 / steps as f64));
            }
        }
        OccupancyField::from_obstacles(geometry, &obstacles)
    }
}

/// Range sensor parameters resolved from a [`ScenarioConfig`].
#[derive(Clone, Copy, Debug)]
pub struct SensorModel {
    pub n_beams: usize,
    pub max_range: f64,
    pub noise: Normal<f64>,
}

/// Description of one simulated run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub room_width: f64,
    pub room_height: f64,
    pub obstacles: Vec<BoxObstacle>,
    /// Cell size of the rasterized map (m).
    pub map_resolution: f64,
    /// True starting pose in the map frame.
    pub start: Pose2D,
    /// Seed handed to the filter before the first scan. `None` lets the filter seed itself around the
    /// odometry pose.
    pub initial_pose: Option<Pose2D>,
    /// Forward speed (m/s).
    pub linear_velocity: f64,
    /// Turn rate (rad/s).
    pub angular_velocity: f64,
    pub duration_s: f64,
    pub odom_rate_hz: f64,
    pub scan_rate_hz: f64,
    pub n_beams: usize,
    pub max_range: f64,
    pub range_noise_std: f64,
    /// Multiplicative odometry bias on distance travelled.
    pub odom_linear_bias: f64,
    /// Multiplicative odometry bias on angle turned.
    pub odom_angular_bias: f64,
    /// Per-tick odometry noise as a fraction of the tick's motion.
    pub odom_noise_fraction: f64,
    /// Seed for the world's random source (sensor and odometry noise).
    pub seed: u64,
}
impl Default for ScenarioConfig {
    fn default() -> Self {
        let start = Pose2D::new(4.0, 1.5, 0.0);
        ScenarioConfig {
            room_width: 8.0,
            room_height: 6.0,
            obstacles: vec![
                BoxObstacle {
                    x: 1.0,
                    y: 1.0,
                    half_width: 0.3,
                    half_height: 0.3,
                },
                BoxObstacle {
                    x: 4.0,
                    y: 3.5,
                    half_width: 0.5,
                    half_height: 0.4,
                },
                BoxObstacle {
                    x: 7.0,
                    y: 5.2,
                    half_width: 0.3,
                    half_height: 0.3,
                },
            ],
            map_resolution: 0.05,
            start,
            initial_pose: Some(start),
            linear_velocity: 0.3,
            angular_velocity: 0.15,
            duration_s: 40.0,
            odom_rate_hz: 20.0,
            scan_rate_hz: 5.0,
            n_beams: 72,
            max_range: 6.0,
            range_noise_std: 0.02,
            odom_linear_bias: 0.03,
            odom_angular_bias: -0.02,
            odom_noise_fraction: 0.05,
            seed: 7,
        }
    }
}
impl ScenarioConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("room_width", self.room_width),
            ("room_height", self.room_height),
            ("map_resolution", self.map_resolution),
            ("duration_s", self.duration_s),
            ("odom_rate_hz", self.odom_rate_hz),
            ("scan_rate_hz", self.scan_rate_hz),
            ("max_range", self.max_range),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(LocalizationError::InvalidConfig(format!(
                    "scenario.{name} must be positive, got {value}"
                )));
            }
        }
        if self.scan_rate_hz > self.odom_rate_hz {
            return Err(LocalizationError::InvalidConfig(
                "scenario.scan_rate_hz must not exceed odom_rate_hz".to_string(),
            ));
        }
        if self.n_beams == 0 {
            return Err(LocalizationError::InvalidConfig(
                "scenario.n_beams must be positive".to_string(),
            ));
        }
        self.start.validate()?;
        if let Some(pose) = &self.initial_pose {
            pose.validate()?;
        }
        Ok(())
    }
    pub fn world(&self) -> World {
        let mut world = World::rectangular_room(self.room_width, self.room_height);
        for obstacle in &self.obstacles {
            world.add_box(obstacle);
        }
        world
    }
    fn sensor(&self) -> Result<SensorModel> {
        let noise = Normal::new(0.0, self.range_noise_std).map_err(|e| {
            LocalizationError::InvalidConfig(format!(
                "scenario.range_noise_std = {}: {e}",
                self.range_noise_std
            ))
        })?;
        Ok(SensorModel {
            n_beams: self.n_beams,
            max_range: self.max_range,
            noise,
        })
    }
}

/// Localization settings plus the scenario to run them against.
///
/// ```toml
/// [filter]
/// n_particles = 300
///
/// [scenario]
/// duration_s = 60.0
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(flatten)]
    pub localization: LocalizationConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
}
impl SimulationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SimulationConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(toml::to_string_pretty(self)?.as_bytes())?;
        Ok(())
    }
    pub fn validate(&self) -> Result<()> {
        self.localization.validate()?;
        self.scenario.validate()
    }
}

/// Truth, odometry and estimate at one scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRecord {
    pub time_s: f64,
    pub true_x: f64,
    pub true_y: f64,
    pub true_theta: f64,
    pub odom_x: f64,
    pub odom_y: f64,
    pub odom_theta: f64,
    pub estimate_x: Option<f64>,
    pub estimate_y: Option<f64>,
    pub estimate_theta: Option<f64>,
    pub position_error: Option<f64>,
    pub heading_error: Option<f64>,
    pub effective_sample_size: f64,
    pub outcome: String,
}
impl LocalizationRecord {
    /// Reads records from a CSV file with a header row.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub records: Vec<LocalizationRecord>,
    /// Full filter cycles run.
    pub cycles: u64,
}
impl ScenarioResult {
    pub fn final_position_error(&self) -> Option<f64> {
        self.records.last().and_then(|r| r.position_error)
    }
    /// Root-mean-square position error over the records with an estimate, skipping the first `skip`.
    pub fn rms_position_error(&self, skip: usize) -> Option<f64> {
        let errors: Vec<f64> = self
            .records
            .iter()
            .skip(skip)
            .filter_map(|r| r.position_error)
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some((errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt())
    }
}

/// Runs the scenario to completion on the calling thread.
pub fn run_scenario(config: &SimulationConfig) -> Result<ScenarioResult> {
    config.validate()?;
    let scenario = &config.scenario;
    let world = scenario.world();
    let field = world.to_occupancy_field(scenario.map_resolution, 0.5)?;
    let sensor = scenario.sensor()?;
    let odom_dt = 1.0 / scenario.odom_rate_hz;
    let ticks = (scenario.duration_s * scenario.odom_rate_hz).round() as usize;
    let ticks_per_scan = ((scenario.odom_rate_hz / scenario.scan_rate_hz).round() as usize).max(1);
    let history = ticks_per_scan * 20;

    let mut controller = UpdateController::new(
        config.localization.filter.clone(),
        field,
        OdometryBuffer::new(history),
        RecordingPublisher::with_cloud_limit(1),
    )?;
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let t0 = DateTime::from_timestamp(1_700_000_000, 0).ok_or_else(|| {
        LocalizationError::InvalidConfig("simulation epoch is out of range".to_string())
    })?;
    let stamp_at = |tick: usize| t0 + TimeDelta::microseconds((tick as f64 * odom_dt * 1e6).round() as i64);

    if let Some(pose) = scenario.initial_pose {
        controller.set_initial_pose(pose, t0)?;
    }
    log::info!(
        "Simulating {:.1} s: {} odometry ticks, a scan every {} ticks, {} wall segments",
        scenario.duration_s,
        ticks,
        ticks_per_scan,
        world.segments().len()
    );

    let mut truth = scenario.start;
    let mut odom = Pose2D::identity();
    let mut records = Vec::new();
    for tick in 0..=ticks {
        if tick > 0 {
            let step = Pose2D::new(
                scenario.linear_velocity * odom_dt,
                0.0,
                scenario.angular_velocity * odom_dt,
            );
            truth = truth.compose(&step);
            odom = odom.compose(&drifted(&step, scenario, &mut rng)?);
        }
        let stamp = stamp_at(tick);
        controller.odometry_mut().push(stamp, odom);
        if tick % ticks_per_scan != 0 {
            continue;
        }
        controller.submit_scan(world.scan(&truth, stamp, &sensor, &mut rng))?;
        let outcome = controller.step()?;
        records.push(record(tick as f64 * odom_dt, &truth, &odom, &controller, outcome));
    }
    let cycles = controller.cycles();
    if let Some(last) = records.last() {
        log::info!(
            "Simulation finished after {cycles} filter cycles; final position error {:?} m",
            last.position_error
        );
    }
    Ok(ScenarioResult { records, cycles })
}

/// Odometry's view of a true robot-frame step: biased and noisy.
fn drifted(step: &Pose2D, scenario: &ScenarioConfig, rng: &mut StdRng) -> Result<Pose2D> {
    let linear_std = scenario.odom_noise_fraction * step.x.abs();
    let angular_std = scenario.odom_noise_fraction * step.theta.abs();
    let noise = |std: f64| {
        Normal::new(0.0, std).map_err(|e| {
            LocalizationError::InvalidConfig(format!("scenario.odom_noise_fraction: {e}"))
        })
    };
    let (linear, angular) = (noise(linear_std)?, noise(angular_std)?);
    Ok(Pose2D::new(
        step.x * (1.0 + scenario.odom_linear_bias) + linear.sample(rng),
        step.y + linear.sample(rng),
        step.theta * (1.0 + scenario.odom_angular_bias) + angular.sample(rng),
    ))
}

fn record<M, O, P>(
    time_s: f64,
    truth: &Pose2D,
    odom: &Pose2D,
    controller: &UpdateController<M, O, P>,
    outcome: StepOutcome,
) -> LocalizationRecord
where
    M: crate::measurements::MapDistance,
    O: crate::odometry::OdometrySource,
    P: crate::publish::Publisher,
{
    let estimate = controller.robot_pose();
    LocalizationRecord {
        time_s,
        true_x: truth.x,
        true_y: truth.y,
        true_theta: truth.theta,
        odom_x: odom.x,
        odom_y: odom.y,
        odom_theta: odom.theta,
        estimate_x: estimate.map(|p| p.x),
        estimate_y: estimate.map(|p| p.y),
        estimate_theta: estimate.map(|p| p.theta),
        position_error: estimate.map(|p| (p.x - truth.x).hypot(p.y - truth.y)),
        heading_error: estimate.map(|p| angle_difference(p.theta, truth.theta)),
        effective_sample_size: controller.cloud().effective_sample_size(),
        outcome: format!("{outcome:?}"),
    }
}
