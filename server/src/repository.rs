//! Point persistence.
//!
//! [`PointRepository`] is the query surface the rest of the server depends
//! on. [`InMemoryPointRepository`] implements it behind a single async
//! `RwLock`, so a multi-row delete is applied atomically with respect to
//! readers. It can persist itself to disk as a bincode snapshot.

use crate::error::GridResult;
use crate::utils::get_timestamp;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::Point;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;

/// Fields supplied when inserting a point directly.
#[derive(Debug, Clone)]
pub struct NewPoint {
    pub user_id: String,
    pub x: i64,
    pub y: i64,
    /// Creation time; the current time when absent.
    pub game_created_at_ms: Option<i64>,
}

/// Result of an idempotent placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub point: Point,
    /// False when the user already had a point at these coordinates.
    pub created: bool,
}

#[async_trait]
pub trait PointRepository: Send + Sync {
    /// All points, oldest first.
    async fn get_all(&self) -> GridResult<Vec<Point>>;
    async fn get_by_user(&self, user_id: &str) -> GridResult<Vec<Point>>;
    /// Points inside the inclusive rectangle.
    async fn get_points_in_bounds(
        &self,
        min_x: i64,
        min_y: i64,
        max_x: i64,
        max_y: i64,
    ) -> GridResult<Vec<Point>>;
    /// Oldest point that is not the origin.
    async fn get_oldest(&self) -> GridResult<Option<Point>>;
    /// Places a point, returning the existing row if the user already owns one here.
    async fn add(&self, user_id: &str, x: i64, y: i64) -> GridResult<Placement>;
    async fn create(&self, new_point: NewPoint) -> GridResult<Point>;
    async fn delete(&self, id: i64) -> GridResult<Option<Point>>;
    /// Deletes every listed point in one step and returns the rows removed.
    async fn delete_points(&self, ids: &[i64]) -> GridResult<Vec<Point>>;
    async fn delete_all_for_user(&self, user_id: &str) -> GridResult<Vec<Point>>;
    /// Wipes every point, origin included.
    async fn delete_all(&self) -> GridResult<usize>;
    async fn get_total_count(&self) -> GridResult<usize>;
    async fn get_count_excluding_origin(&self) -> GridResult<usize>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PointSnapshot {
    next_id: i64,
    points: Vec<Point>,
}

#[derive(Debug)]
struct RepositoryState {
    points: BTreeMap<i64, Point>,
    next_id: i64,
}

impl RepositoryState {
    fn insert(&mut self, user_id: &str, x: i64, y: i64, created_at_ms: i64) -> Point {
        let point = Point::new(self.next_id, user_id, x, y, created_at_ms);
        self.next_id += 1;
        self.points.insert(point.id, point.clone());
        point
    }

    fn sorted(&self, filter: impl Fn(&Point) -> bool) -> Vec<Point> {
        let mut points: Vec<Point> = self.points.values().filter(|p| filter(p)).cloned().collect();
        points.sort_by_key(|p| (p.created_at_ms, p.id));
        points
    }
}

#[derive(Debug)]
pub struct InMemoryPointRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryPointRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RepositoryState {
                points: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Loads a snapshot written by [`save_snapshot`](Self::save_snapshot).
    pub async fn load_snapshot(path: &Path) -> GridResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: PointSnapshot = bincode::deserialize(&bytes)?;
        let count = snapshot.points.len();

        let points: BTreeMap<i64, Point> = snapshot.points.into_iter().map(|p| (p.id, p)).collect();
        let next_id = points
            .keys()
            .next_back()
            .map_or(1, |max| max + 1)
            .max(snapshot.next_id);

        info!("Loaded {} points from {}", count, path.display());
        Ok(Self {
            state: RwLock::new(RepositoryState { points, next_id }),
        })
    }

    pub async fn save_snapshot(&self, path: &Path) -> GridResult<usize> {
        let snapshot = {
            let state = self.state.read().await;
            PointSnapshot {
                next_id: state.next_id,
                points: state.points.values().cloned().collect(),
            }
        };
        let bytes = bincode::serialize(&snapshot)?;
        tokio::fs::write(path, bytes).await?;

        info!("Saved {} points to {}", snapshot.points.len(), path.display());
        Ok(snapshot.points.len())
    }
}

impl Default for InMemoryPointRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PointRepository for InMemoryPointRepository {
    async fn get_all(&self) -> GridResult<Vec<Point>> {
        Ok(self.state.read().await.sorted(|_| true))
    }

    async fn get_by_user(&self, user_id: &str) -> GridResult<Vec<Point>> {
        Ok(self.state.read().await.sorted(|p| p.user_id == user_id))
    }

    async fn get_points_in_bounds(
        &self,
        min_x: i64,
        min_y: i64,
        max_x: i64,
        max_y: i64,
    ) -> GridResult<Vec<Point>> {
        Ok(self.state.read().await.sorted(|p| {
            (min_x..=max_x).contains(&p.x) && (min_y..=max_y).contains(&p.y)
        }))
    }

    async fn get_oldest(&self) -> GridResult<Option<Point>> {
        let state = self.state.read().await;
        Ok(state
            .points
            .values()
            .filter(|p| !p.is_origin())
            .min_by_key(|p| (p.created_at_ms, p.id))
            .cloned())
    }

    async fn add(&self, user_id: &str, x: i64, y: i64) -> GridResult<Placement> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .points
            .values()
            .find(|p| p.user_id == user_id && p.x == x && p.y == y)
        {
            return Ok(Placement {
                point: existing.clone(),
                created: false,
            });
        }

        let point = state.insert(user_id, x, y, get_timestamp());
        debug!("User {} placed point {} at ({}, {})", user_id, point.id, x, y);
        Ok(Placement {
            point,
            created: true,
        })
    }

    async fn create(&self, new_point: NewPoint) -> GridResult<Point> {
        let created_at_ms = new_point.game_created_at_ms.unwrap_or_else(get_timestamp);
        let mut state = self.state.write().await;
        Ok(state.insert(&new_point.user_id, new_point.x, new_point.y, created_at_ms))
    }

    async fn delete(&self, id: i64) -> GridResult<Option<Point>> {
        Ok(self.state.write().await.points.remove(&id))
    }

    async fn delete_points(&self, ids: &[i64]) -> GridResult<Vec<Point>> {
        let mut state = self.state.write().await;
        Ok(ids.iter().filter_map(|id| state.points.remove(id)).collect())
    }

    async fn delete_all_for_user(&self, user_id: &str) -> GridResult<Vec<Point>> {
        let mut state = self.state.write().await;
        let ids: HashSet<i64> = state
            .points
            .values()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.id)
            .collect();
        Ok(ids.iter().filter_map(|id| state.points.remove(id)).collect())
    }

    async fn delete_all(&self) -> GridResult<usize> {
        let mut state = self.state.write().await;
        let removed = state.points.len();
        state.points.clear();
        Ok(removed)
    }

    async fn get_total_count(&self) -> GridResult<usize> {
        Ok(self.state.read().await.points.len())
    }

    async fn get_count_excluding_origin(&self) -> GridResult<usize> {
        let state = self.state.read().await;
        Ok(state.points.values().filter(|p| !p.is_origin()).count())
    }
}
