//! Request-time placement checks.
//!
//! The viewport is a `GRID_SIZE x GRID_SIZE` window whose top-left cell sits
//! at the caller's current position. A cell in that window is restricted
//! when it is collinear with an existing point under the fixed slope set
//! (both axes, both diagonals and the ratios 2, 3 and 5 in every direction).
//! The set is deliberately small and fixed so the check stays cheap and
//! deterministic; the cleanup sweep covers wider slopes over time.

use crate::error::{GridError, GridResult};
use serde::{Deserialize, Serialize};
use shared::geometry::{SlopeSet, FIXED_MAGNITUDES};
use shared::{within_world_bounds, Point, GRID_SIZE, WORLD_BOUND};
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// World offset applied to every restricted cell. Currently zero for all directions.
    pub fn offset(self) -> (i64, i64) {
        match self {
            Direction::Up => (0, 0),
            Direction::Down => (0, 0),
            Direction::Left => (0, 0),
            Direction::Right => (0, 0),
        }
    }
}

pub struct RestrictedSquareCalculator {
    slopes: SlopeSet,
}

impl RestrictedSquareCalculator {
    pub fn new() -> Self {
        Self {
            slopes: SlopeSet::symmetric(&FIXED_MAGNITUDES).with_axes(),
        }
    }

    /// Returns the subset of `border_indices` that may not receive a new point.
    ///
    /// Indices are `row * GRID_SIZE + col`. The result is ascending and
    /// free of duplicates. The position must lie inside the world bounds.
    pub fn calculate(
        &self,
        border_indices: &[i64],
        current_position: (i64, i64),
        direction: Direction,
        points: &[Point],
    ) -> GridResult<Vec<i64>> {
        let cells = GRID_SIZE * GRID_SIZE;
        if let Some(bad) = border_indices.iter().find(|&&e| !(0..cells).contains(&e)) {
            return Err(GridError::validation(format!(
                "border index {} is outside [0, {})",
                bad, cells
            )));
        }

        let (px, py) = current_position;
        if !within_world_bounds(px, py) {
            return Err(GridError::validation(format!(
                "position ({}, {}) is outside ±{}",
                px, py, WORLD_BOUND
            )));
        }

        let requested: BTreeSet<i64> = border_indices.iter().copied().collect();
        let anchors = distinct_coords(points);
        let (ox, oy) = direction.offset();

        let mut restricted = BTreeSet::new();
        for &e in &requested {
            let (ex, ey) = (e % GRID_SIZE, e / GRID_SIZE);
            for &(x, y) in &anchors {
                let offset = x
                    .checked_sub(px)
                    .zip(y.checked_sub(py))
                    .and_then(|(i, c)| ex.checked_sub(i).zip(ey.checked_sub(c)));
                let Some((dx, dy)) = offset else {
                    continue;
                };
                if dx == 0 && dy == 0 {
                    continue;
                }
                if !self.slopes.matches(dx, dy) {
                    continue;
                }

                let world = (ex + px + ox, ey + py + oy);
                let (lx, ly) = (world.0 - px, world.1 - py);
                if (0..GRID_SIZE).contains(&lx) && (0..GRID_SIZE).contains(&ly) {
                    restricted.insert(ly * GRID_SIZE + lx);
                }
                break;
            }
        }

        Ok(restricted.intersection(&requested).copied().collect())
    }
}

impl Default for RestrictedSquareCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// One coordinate per occupied cell; an empty world is anchored at the origin.
fn distinct_coords(points: &[Point]) -> Vec<(i64, i64)> {
    let mut seen = HashSet::new();
    let mut coords: Vec<(i64, i64)> = points
        .iter()
        .map(Point::coords)
        .filter(|c| seen.insert(*c))
        .collect();
    if coords.is_empty() {
        coords.push((0, 0));
    }
    coords
}
