//! Occupancy grid with a precomputed nearest-obstacle distance field.
//!
//! The field is built once from the occupied cells of a grid and then answers [`MapDistance`] queries with
//! a single lookup, which keeps the per-particle, per-beam cost of the observation model constant.
use std::collections::VecDeque;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::error::{LocalizationError, Result};
use crate::measurements::MapDistance;

/// Placement and size of a grid in the map frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Edge length of one cell (m).
    pub resolution: f64,
    /// Map-frame coordinates of the lower-left corner of cell (0, 0).
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: usize,
    pub height: usize,
}
impl GridGeometry {
    pub fn validate(&self) -> Result<()> {
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(LocalizationError::InvalidConfig(format!(
                "grid resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !self.origin_x.is_finite() || !self.origin_y.is_finite() {
            return Err(LocalizationError::InvalidConfig(
                "grid origin must be finite".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(LocalizationError::InvalidConfig(
                "grid must have at least one cell".to_string(),
            ));
        }
        Ok(())
    }
    /// Cell containing the map-frame point, if any.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let cx = ((x - self.origin_x) / self.resolution).floor();
        let cy = ((y - self.origin_y) / self.resolution).floor();
        if cx >= 0.0 && cy >= 0.0 && cx < self.width as f64 && cy < self.height as f64 {
            Some((cx as usize, cy as usize))
        } else {
            None
        }
    }
    pub fn cell_center(&self, cx: usize, cy: usize) -> Point2<f64> {
        Point2::new(
            self.origin_x + (cx as f64 + 0.5) * self.resolution,
            self.origin_y + (cy as f64 + 0.5) * self.resolution,
        )
    }
    fn index(&self, cx: usize, cy: usize) -> usize {
        cy * self.width + cx
    }
}

/// Distance from every cell centre to the nearest occupied cell centre.
///
/// Queries outside the grid return `NaN`. A grid with no occupied cell answers `INFINITY` everywhere
/// inside it.
#[derive(Clone, Debug)]
pub struct OccupancyField {
    geometry: GridGeometry,
    occupied: Vec<bool>,
    distances: Vec<f64>,
}

impl OccupancyField {
    /// Builds the field from row-major occupancy (`occupied[cy * width + cx]`).
    pub fn new(geometry: GridGeometry, occupied: Vec<bool>) -> Result<Self> {
        geometry.validate()?;
        if occupied.len() != geometry.width * geometry.height {
            return Err(LocalizationError::InvalidConfig(format!(
                "occupancy has {} cells, expected {}x{}",
                occupied.len(),
                geometry.width,
                geometry.height
            )));
        }
        let distances = nearest_obstacle_distances(&geometry, &occupied);
        Ok(OccupancyField {
            geometry,
            occupied,
            distances,
        })
    }

    /// Marks the cell under each map-frame point as occupied. Points outside the grid are ignored.
    pub fn from_obstacles(geometry: GridGeometry, obstacles: &[Point2<f64>]) -> Result<Self> {
        geometry.validate()?;
        let mut occupied = vec![false; geometry.width * geometry.height];
        for obstacle in obstacles {
            if let Some((cx, cy)) = geometry.cell_of(obstacle.x, obstacle.y) {
                occupied[geometry.index(cx, cy)] = true;
            }
        }
        Self::new(geometry, occupied)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn is_occupied(&self, cx: usize, cy: usize) -> bool {
        cx < self.geometry.width && cy < self.geometry.height && self.occupied[self.geometry.index(cx, cy)]
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.iter().filter(|&&o| o).count()
    }

    /// Map-frame bounding box `(min, max)` of the occupied cells.
    pub fn obstacle_bounds(&self) -> Option<(Point2<f64>, Point2<f64>)> {
        let g = &self.geometry;
        let mut bounds: Option<(Point2<f64>, Point2<f64>)> = None;
        for cy in 0..g.height {
            for cx in 0..g.width {
                if !self.occupied[g.index(cx, cy)] {
                    continue;
                }
                let c = g.cell_center(cx, cy);
                bounds = Some(match bounds {
                    None => (c, c),
                    Some((lo, hi)) => (
                        Point2::new(lo.x.min(c.x), lo.y.min(c.y)),
                        Point2::new(hi.x.max(c.x), hi.y.max(c.y)),
                    ),
                });
            }
        }
        bounds
    }

    pub fn distance_at_cell(&self, cx: usize, cy: usize) -> Option<f64> {
        if cx < self.geometry.width && cy < self.geometry.height {
            Some(self.distances[self.geometry.index(cx, cy)])
        } else {
            None
        }
    }
}

impl MapDistance for OccupancyField {
    fn distance(&self, x: f64, y: f64) -> f64 {
        match self.geometry.cell_of(x, y) {
            Some((cx, cy)) => self.distances[self.geometry.index(cx, cy)],
            None => f64::NAN,
        }
    }
}

/// Multi-source sweep from all occupied cells over the 8-connected grid.
///
/// Each cell inherits the nearest obstacle of whichever neighbour offers the shortest Euclidean distance,
/// so the stored value is a true point-to-point distance rather than an accumulated path length.
fn nearest_obstacle_distances(geometry: &GridGeometry, occupied: &[bool]) -> Vec<f64> {
    let (width, height) = (geometry.width, geometry.height);
    let mut nearest: Vec<Option<(usize, usize)>> = vec![None; width * height];
    let mut distances = vec![f64::INFINITY; width * height];
    let mut queue = VecDeque::new();

    for cy in 0..height {
        for cx in 0..width {
            let i = geometry.index(cx, cy);
            if occupied[i] {
                nearest[i] = Some((cx, cy));
                distances[i] = 0.0;
                queue.push_back((cx, cy));
            }
        }
    }

    let neighbors: [(i64, i64); 8] = [
        (-1, 0),
        (1, 0),
        (0, -1),
        (0, 1),
        (-1, -1),
        (1, -1),
        (-1, 1),
        (1, 1),
    ];

    while let Some((cx, cy)) = queue.pop_front() {
        let Some((sx, sy)) = nearest[geometry.index(cx, cy)] else {
            continue;
        };
        for (dx, dy) in neighbors {
            let nx = cx as i64 + dx;
            let ny = cy as i64 + dy;
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                continue;
            }
            let (nx, ny) = (nx as usize, ny as usize);
            let ex = nx as f64 - sx as f64;
            let ey = ny as f64 - sy as f64;
            let candidate = (ex * ex + ey * ey).sqrt() * geometry.resolution;
            let j = geometry.index(nx, ny);
            if candidate < distances[j] - 1e-12 {
                distances[j] = candidate;
                nearest[j] = Some((sx, sy));
                queue.push_back((nx, ny));
            }
        }
    }
    distances
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn geometry(width: usize, height: usize) -> GridGeometry {
        GridGeometry {
            resolution: 0.1,
            origin_x: -2.0,
            origin_y: -2.0,
            width,
            height,
        }
    }

    #[test]
    fn test_distance_from_single_obstacle() {
        let field = OccupancyField::from_obstacles(geometry(40, 40), &[Point2::new(1.05, 0.05)]).unwrap();
        assert_eq!(field.occupied_count(), 1);
        assert_approx_eq!(field.distance(1.05, 0.05), 0.0, 1e-12);
        // One metre to the left of the obstacle, on the same row.
        assert_approx_eq!(field.distance(0.05, 0.05), 1.0, 1e-9);
        // Diagonal: 3-4-5 triangle in cells.
        assert_approx_eq!(field.distance(1.35, 0.45), 0.5, 1e-9);
    }

    #[test]
    fn test_nearest_of_several_obstacles_wins() {
        let field = OccupancyField::from_obstacles(
            geometry(40, 40),
            &[Point2::new(-1.95, -1.95), Point2::new(1.05, 1.05)],
        )
        .unwrap();
        assert_approx_eq!(field.distance(0.85, 1.05), 0.2, 1e-9);
        assert_approx_eq!(field.distance(-1.95, -1.55), 0.4, 1e-9);
    }

    #[test]
    fn test_out_of_grid_is_nan() {
        let field = OccupancyField::from_obstacles(geometry(10, 10), &[Point2::new(-1.5, -1.5)]).unwrap();
        assert!(field.distance(-2.01, 0.0).is_nan());
        assert!(field.distance(5.0, -1.5).is_nan());
        assert!(field.distance(f64::NAN, 0.0).is_nan());
        assert!(field.distance(-1.05, -1.05).is_finite());
    }

    #[test]
    fn test_empty_grid_is_infinitely_far() {
        let field = OccupancyField::new(geometry(5, 5), vec![false; 25]).unwrap();
        assert_eq!(field.distance(-1.9, -1.9), f64::INFINITY);
        assert!(field.obstacle_bounds().is_none());
    }

    #[test]
    fn test_invalid_geometry() {
        let mut bad = geometry(5, 5);
        bad.resolution = 0.0;
        assert!(OccupancyField::new(bad, vec![false; 25]).is_err());
        assert!(OccupancyField::new(geometry(5, 5), vec![false; 24]).is_err());
        assert!(OccupancyField::new(geometry(0, 5), vec![]).is_err());
    }

    #[test]
    fn test_obstacle_bounds() {
        let field = OccupancyField::from_obstacles(
            geometry(40, 40),
            &[Point2::new(-1.0, 0.5), Point2::new(1.0, -0.5)],
        )
        .unwrap();
        let (lo, hi) = field.obstacle_bounds().unwrap();
        assert!(lo.x < -0.9 && lo.y < -0.4);
        assert!(hi.x > 0.9 && hi.y > 0.4);
        assert!(field.is_occupied(10, 25));
        assert!(!field.is_occupied(100, 0));
    }
}
