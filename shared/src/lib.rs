//! Types and pure functions shared by the grid-world server and its tests.
//!
//! Nothing in this crate performs I/O or holds global state: the geometry
//! kernel, the tile codec and the event payloads are all plain functions and
//! values that the server composes into services.

pub mod events;
pub mod geometry;
pub mod tile;

use serde::{Deserialize, Serialize};

/// Cells per tile edge.
pub const TILE_SIZE: i64 = 64;
/// Edge length of the local viewport window used for placement checks.
pub const GRID_SIZE: i64 = 15;
/// Largest absolute world coordinate a client may place a point at.
pub const WORLD_BOUND: i64 = 1000;
/// Largest absolute tile coordinate a client may request.
pub const TILE_BOUND: i64 = 16;
/// Non-origin point count at which a sweep wipes the world.
pub const RESET_THRESHOLD: usize = 800;

/// A base point placed by a user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub id: i64,
    pub user_id: String,
    pub x: i64,
    pub y: i64,
    pub created_at_ms: i64,
}

impl Point {
    pub fn new(id: i64, user_id: impl Into<String>, x: i64, y: i64, created_at_ms: i64) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            x,
            y,
            created_at_ms,
        }
    }

    /// The origin is protected from incremental eviction.
    pub fn is_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }

    pub fn coords(&self) -> (i64, i64) {
        (self.x, self.y)
    }
}

/// Returns true when both world coordinates are inside `[-WORLD_BOUND, WORLD_BOUND]`.
pub fn within_world_bounds(x: i64, y: i64) -> bool {
    x.abs() <= WORLD_BOUND && y.abs() <= WORLD_BOUND
}

/// Returns true when both tile coordinates are inside `[-TILE_BOUND, TILE_BOUND]`.
pub fn within_tile_bounds(tile_x: i64, tile_y: i64) -> bool {
    (-TILE_BOUND..=TILE_BOUND).contains(&tile_x) && (-TILE_BOUND..=TILE_BOUND).contains(&tile_y)
}
