//! Periodic pruning of collinear base points.
//!
//! Every sweep loads one snapshot of the world and groups non-origin points
//! that share a column, a row, or a line along one of the sampled slopes.
//! Within each group only the oldest point survives. The losers are deleted
//! in small batches, and once the surviving non-origin population reaches the
//! reset threshold the whole world is wiped.
//!
//! Planning ([`plan_evictions`]) is pure and works on the snapshot alone;
//! points placed while a sweep runs are simply seen by the next one.

use crate::error::GridResult;
use crate::events::EventBroadcaster;
use crate::repository::PointRepository;
use crate::tile_store::TileService;
use crate::utils::get_timestamp;
use log::{debug, error, info, warn};
use shared::events::ServerEvent;
use shared::geometry::{LineKey, Slope, SlopeRegistry, SlopeSet};
use shared::{Point, RESET_THRESHOLD};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub const RESET_REASON: &str = "Non-origin point count reached the reset threshold";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub reset_threshold: usize,
    pub slope_sample_size: usize,
    pub slope_batch_size: usize,
    pub delete_batch_size: usize,
    pub delete_batch_delay: Duration,
    pub slow_sweep_warning: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            reset_threshold: RESET_THRESHOLD,
            slope_sample_size: 16,
            slope_batch_size: 5,
            delete_batch_size: 10,
            delete_batch_delay: Duration::from_millis(10),
            slow_sweep_warning: Duration::from_secs(5),
        }
    }
}

/// Points chosen for eviction from one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Losers from same-column groups.
    pub same_column: usize,
    /// Losers from same-row groups.
    pub same_row: usize,
    /// Losers from sloped-line groups.
    pub sloped: usize,
    /// Distinct points to delete, oldest first. Never contains the origin.
    pub evict: Vec<Point>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.evict.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Fewer than two points; nothing to compare.
    Skipped,
    Cleaned {
        initial_count: usize,
        evicted: usize,
        remaining: usize,
    },
    WorldReset {
        points_before_reset: usize,
    },
}

/// Oldest point wins; ids break ties between equal timestamps.
fn survivor_order(p: &Point) -> (i64, i64) {
    (p.created_at_ms, p.id)
}

/// Adds every non-survivor of each group to `losers`. Returns how many
/// group members lost, before de-duplication across groups.
fn collect_losers<'a, K: Eq + Hash>(
    groups: HashMap<K, Vec<&'a Point>>,
    losers: &mut BTreeMap<i64, &'a Point>,
) -> usize {
    let mut lost = 0;
    for (_, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|p| survivor_order(p));
        members.dedup_by_key(|p| p.id);
        for loser in members.into_iter().skip(1) {
            losers.insert(loser.id, loser);
            lost += 1;
        }
    }
    lost
}

fn group_by<'a, K: Eq + Hash>(
    points: &[&'a Point],
    key: impl Fn(&Point) -> K,
) -> HashMap<K, Vec<&'a Point>> {
    let mut groups: HashMap<K, Vec<&'a Point>> = HashMap::new();
    for &p in points {
        groups.entry(key(p)).or_default().push(p);
    }
    groups
}

/// Selects the points to evict from one snapshot.
///
/// Sloped lines are examined `batch_size` slopes at a time. Pairs found in a
/// batch are grouped by the line they span, so three or more points on one
/// line form a single group no matter which pairs discovered them.
pub fn plan_evictions(points: &[Point], slopes: &SlopeSet, batch_size: usize) -> EvictionPlan {
    let candidates: Vec<&Point> = points.iter().filter(|p| !p.is_origin()).collect();
    let mut losers: BTreeMap<i64, &Point> = BTreeMap::new();

    let same_column = collect_losers(group_by(&candidates, |p| p.x), &mut losers);
    let same_row = collect_losers(group_by(&candidates, |p| p.y), &mut losers);

    let mut directions: Vec<(usize, usize, Slope)> = Vec::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let dx = candidates[j].x - candidates[i].x;
            let dy = candidates[j].y - candidates[i].y;
            if let Some(slope) = Slope::from_offset(dx, dy) {
                if slopes.contains(&slope) {
                    directions.push((i, j, slope));
                }
            }
        }
    }

    let mut sloped = 0;
    for batch in slopes.batches(batch_size) {
        let mut lines: HashMap<LineKey, Vec<&Point>> = HashMap::new();
        for &(i, j, slope) in &directions {
            if !batch.contains(&slope) {
                continue;
            }
            let (p1, p2) = (candidates[i], candidates[j]);
            if let Some(key) = LineKey::through(p1.coords(), p2.coords()) {
                let members = lines.entry(key).or_default();
                members.push(p1);
                members.push(p2);
            }
        }
        sloped += collect_losers(lines, &mut losers);
    }

    let mut evict: Vec<Point> = losers.into_values().cloned().collect();
    evict.sort_by_key(survivor_order);

    EvictionPlan {
        same_column,
        same_row,
        sloped,
        evict,
    }
}

/// Runs cleanup sweeps against the live services.
pub struct CleanupEngine {
    points: Arc<dyn PointRepository>,
    tiles: Arc<TileService>,
    events: Arc<EventBroadcaster>,
    registry: Arc<RwLock<SlopeRegistry>>,
    config: CleanupConfig,
}

impl CleanupEngine {
    pub fn new(
        points: Arc<dyn PointRepository>,
        tiles: Arc<TileService>,
        events: Arc<EventBroadcaster>,
        registry: Arc<RwLock<SlopeRegistry>>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            points,
            tiles,
            events,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Performs one sweep. Errors abandon the sweep; batches already deleted stay deleted.
    pub async fn sweep(&self) -> GridResult<SweepOutcome> {
        let snapshot = self.points.get_all().await?;
        if snapshot.len() <= 1 {
            return Ok(SweepOutcome::Skipped);
        }
        let initial_count = snapshot.iter().filter(|p| !p.is_origin()).count();

        let slopes = self
            .registry
            .write()
            .await
            .sample(self.config.slope_sample_size, get_timestamp());

        let plan = plan_evictions(&snapshot, &slopes, self.config.slope_batch_size);
        debug!(
            "Sweep plan: {} column, {} row, {} sloped losers, {} distinct",
            plan.same_column,
            plan.same_row,
            plan.sloped,
            plan.evict.len()
        );

        let evicted = self.evict(&plan.evict).await;

        let remaining = self.points.get_count_excluding_origin().await?;
        let oldest_prime_timestamp = self.registry.read().await.oldest_prime_timestamp();

        if remaining >= self.config.reset_threshold {
            self.reset_world(remaining, oldest_prime_timestamp).await?;
            return Ok(SweepOutcome::WorldReset {
                points_before_reset: remaining,
            });
        }

        let total_including_origin = self.points.get_total_count().await?;
        self.events
            .broadcast(ServerEvent::Cleanup {
                initial_count,
                total_base_points: remaining,
                total_including_origin,
                timestamp: get_timestamp(),
                oldest_prime_timestamp,
            })
            .await;

        if evicted > 0 {
            info!(
                "Cleanup evicted {} of {} base points, {} remain",
                evicted, initial_count, remaining
            );
        }
        Ok(SweepOutcome::Cleaned {
            initial_count,
            evicted,
            remaining,
        })
    }

    /// Deletes points in batches, pausing between them. A failing batch is
    /// logged and skipped. Returns how many points were actually removed.
    async fn evict(&self, candidates: &[Point]) -> usize {
        let ids: Vec<i64> = candidates
            .iter()
            .filter(|p| !p.is_origin())
            .map(|p| p.id)
            .collect();

        let mut removed = 0;
        for (n, batch) in ids.chunks(self.config.delete_batch_size.max(1)).enumerate() {
            if n > 0 && !self.config.delete_batch_delay.is_zero() {
                sleep(self.config.delete_batch_delay).await;
            }

            let deleted = match self.points.delete_points(batch).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!("Failed to delete batch of {} points: {}", batch.len(), e);
                    continue;
                }
            };

            for point in &deleted {
                self.tiles.invalidate_for_point(point.x, point.y).await;
            }
            if let Some(first) = deleted.first() {
                self.events.emit_deleted(first, deleted.len()).await;
            }
            removed += deleted.len();
        }
        removed
    }

    async fn reset_world(
        &self,
        points_before_reset: usize,
        oldest_prime_timestamp: Option<i64>,
    ) -> GridResult<()> {
        let wiped = self.points.delete_all().await?;
        self.tiles.reset().await;
        warn!(
            "World reset: {} non-origin points reached threshold {}, wiped {} rows",
            points_before_reset, self.config.reset_threshold, wiped
        );

        self.events
            .broadcast(ServerEvent::WorldReset {
                reason: RESET_REASON.to_string(),
                threshold: self.config.reset_threshold,
                points_before_reset,
                timestamp: get_timestamp(),
                oldest_prime_timestamp,
            })
            .await;
        Ok(())
    }

    /// Runs one sweep, logging failures instead of returning them.
    pub async fn run_once(&self) -> Option<SweepOutcome> {
        let started = Instant::now();
        let outcome = match self.sweep().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Cleanup sweep failed: {}", e);
                None
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_sweep_warning {
            warn!("Cleanup sweep took {:.2}s", elapsed.as_secs_f64());
        }
        outcome
    }

    /// Sweeps forever on the configured interval.
    pub async fn run(self: Arc<Self>) {
        let mut timer = interval(self.config.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        timer.tick().await;

        info!(
            "Cleanup scheduler started, sweeping every {:?}",
            self.config.interval
        );
        loop {
            timer.tick().await;
            self.run_once().await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridError;
    use crate::repository::{InMemoryPointRepository, NewPoint, Placement};
    use async_trait::async_trait;
    use shared::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn p(id: i64, x: i64, y: i64, ms: i64) -> Point {
        Point::new(id, "u", x, y, ms)
    }

    fn ids(plan: &EvictionPlan) -> Vec<i64> {
        plan.evict.iter().map(|p| p.id).collect()
    }

    fn diagonals() -> SlopeSet {
        SlopeSet::new().with_diagonals()
    }

    #[test]
    fn test_plan_diagonal_keeps_oldest() {
        let points = vec![p(1, 1, 1, 10), p(2, 2, 2, 20), p(3, 3, 3, 30)];
        let plan = plan_evictions(&points, &diagonals(), 5);
        assert_eq!(ids(&plan), vec![2, 3]);
        assert_eq!(plan.sloped, 2);
    }

    #[test]
    fn test_plan_never_evicts_origin() {
        let points = vec![p(1, 0, 0, 50), p(2, 1, 1, 10), p(3, 2, 2, 20), p(4, 0, 5, 5)];
        let plan = plan_evictions(&points, &diagonals(), 5);
        assert_eq!(ids(&plan), vec![3]);
        assert!(plan.evict.iter().all(|p| !p.is_origin()));
    }

    #[test]
    fn test_plan_same_column_and_row() {
        let points = vec![
            p(1, 4, 1, 30),
            p(2, 4, 9, 10),
            p(3, 7, 9, 20),
            p(4, 11, 20, 5),
        ];
        let plan = plan_evictions(&points, &SlopeSet::new(), 5);
        assert_eq!(plan.same_column, 1);
        assert_eq!(plan.same_row, 1);
        assert_eq!(ids(&plan), vec![3, 1]);
    }

    #[test]
    fn test_plan_merges_line_across_pairs() {
        // All four lie on y = 2x + 1; only the oldest survives.
        let points = vec![
            p(1, 1, 3, 40),
            p(2, 2, 5, 10),
            p(3, 5, 11, 30),
            p(4, 9, 19, 20),
        ];
        let slopes = SlopeSet::symmetric(&[2]);
        let plan = plan_evictions(&points, &slopes, 1);
        assert_eq!(ids(&plan), vec![4, 3, 1]);
    }

    #[test]
    fn test_plan_ignores_unsampled_slopes() {
        let points = vec![p(1, 0, 1, 1), p(2, 1, 5, 2), p(3, 2, 9, 3)];
        let plan = plan_evictions(&points, &SlopeSet::symmetric(&[3, 5]), 5);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_parallel_lines_stay_separate() {
        let points = vec![p(1, 1, 2, 1), p(2, 2, 3, 2), p(3, 5, 1, 3), p(4, 6, 2, 4)];
        let plan = plan_evictions(&points, &diagonals(), 5);
        assert_eq!(ids(&plan), vec![2, 4]);
    }

    struct Harness {
        points: Arc<InMemoryPointRepository>,
        tiles: Arc<TileService>,
        events: Arc<EventBroadcaster>,
        engine: CleanupEngine,
    }

    fn harness(config: CleanupConfig) -> Harness {
        let points = Arc::new(InMemoryPointRepository::new());
        let tiles = Arc::new(TileService::default());
        let events = Arc::new(EventBroadcaster::new());
        let registry = Arc::new(RwLock::new(SlopeRegistry::new()));
        let engine = CleanupEngine::new(
            points.clone(),
            Arc::clone(&tiles),
            Arc::clone(&events),
            registry,
            config,
        );
        Harness {
            points,
            tiles,
            events,
            engine,
        }
    }

    fn fast_config() -> CleanupConfig {
        CleanupConfig {
            delete_batch_delay: Duration::ZERO,
            ..CleanupConfig::default()
        }
    }

    async fn place(repo: &InMemoryPointRepository, x: i64, y: i64, ms: i64) -> Point {
        repo.create(NewPoint {
            user_id: "u".to_string(),
            x,
            y,
            game_created_at_ms: Some(ms),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_skips_single_point() {
        let h = harness(fast_config());
        place(&h.points, 3, 3, 1).await;
        assert_eq!(h.engine.sweep().await.unwrap(), SweepOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_sweep_evicts_diagonal_and_broadcasts() {
        let h = harness(fast_config());
        let mut rx = h.events.subscribe();
        place(&h.points, 0, 0, 1).await;
        let keep = place(&h.points, 1, 1, 10).await;
        place(&h.points, 2, 2, 20).await;
        place(&h.points, 3, 3, 30).await;

        let outcome = h.engine.sweep().await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Cleaned {
                initial_count: 3,
                evicted: 2,
                remaining: 1
            }
        );

        let left: Vec<(i64, i64)> = h
            .points
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(Point::coords)
            .collect();
        assert_eq!(left, vec![(0, 0), keep.coords()]);

        match rx.recv().await.unwrap() {
            ServerEvent::BasePointDeleted { count, .. } => assert_eq!(count, 2),
            other => panic!("Unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ServerEvent::Cleanup {
                initial_count,
                total_base_points,
                total_including_origin,
                oldest_prime_timestamp,
                ..
            } => {
                assert_eq!(initial_count, 3);
                assert_eq!(total_base_points, 1);
                assert_eq!(total_including_origin, 2);
                assert_eq!(oldest_prime_timestamp, Some(0));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eviction_is_batched() {
        let h = harness(CleanupConfig {
            delete_batch_size: 2,
            ..fast_config()
        });
        let batches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&batches);
        h.events
            .on(EventKind::BasePointDeleted, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        for i in 0..6 {
            place(&h.points, 7, i + 1, i).await;
        }
        h.engine.sweep().await.unwrap();

        assert_eq!(batches.load(Ordering::SeqCst), 3);
        assert_eq!(h.points.get_total_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eviction_invalidates_tiles() {
        let h = harness(fast_config());
        place(&h.points, 10, 5, 1).await;
        place(&h.points, 10, 6, 2).await;

        let before = h.tiles.load_tile(0, 0, h.points.as_ref()).await.unwrap();
        assert_eq!(before.tile.world_points().len(), 2);

        h.engine.sweep().await.unwrap();

        let after = h.tiles.load_tile(0, 0, h.points.as_ref()).await.unwrap();
        assert!(!after.from_cache);
        assert_eq!(after.tile.world_points(), vec![(10, 5)]);
    }

    #[tokio::test]
    async fn test_threshold_triggers_world_reset() {
        let h = harness(CleanupConfig {
            reset_threshold: 3,
            ..fast_config()
        });
        let mut rx = h.events.subscribe();
        // Pairwise slopes are all 4: never sampled, never on an axis.
        place(&h.points, 1, 10, 1).await;
        place(&h.points, 2, 14, 2).await;
        place(&h.points, 4, 22, 3).await;
        h.tiles.load_tile(0, 0, h.points.as_ref()).await.unwrap();

        let outcome = h.engine.sweep().await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::WorldReset {
                points_before_reset: 3
            }
        );
        assert_eq!(h.points.get_total_count().await.unwrap(), 0);
        assert!(h.tiles.store().is_empty().await);

        match rx.recv().await.unwrap() {
            ServerEvent::WorldReset {
                threshold,
                points_before_reset,
                reason,
                ..
            } => {
                assert_eq!(threshold, 3);
                assert_eq!(points_before_reset, 3);
                assert_eq!(reason, RESET_REASON);
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    /// Repository whose batch deletes fail for chosen ids.
    struct FlakyRepository {
        inner: InMemoryPointRepository,
        poisoned: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl PointRepository for FlakyRepository {
        async fn get_all(&self) -> GridResult<Vec<Point>> {
            self.inner.get_all().await
        }
        async fn get_by_user(&self, user_id: &str) -> GridResult<Vec<Point>> {
            self.inner.get_by_user(user_id).await
        }
        async fn get_points_in_bounds(
            &self,
            min_x: i64,
            min_y: i64,
            max_x: i64,
            max_y: i64,
        ) -> GridResult<Vec<Point>> {
            self.inner.get_points_in_bounds(min_x, min_y, max_x, max_y).await
        }
        async fn get_oldest(&self) -> GridResult<Option<Point>> {
            self.inner.get_oldest().await
        }
        async fn add(&self, user_id: &str, x: i64, y: i64) -> GridResult<Placement> {
            self.inner.add(user_id, x, y).await
        }
        async fn create(&self, new_point: NewPoint) -> GridResult<Point> {
            self.inner.create(new_point).await
        }
        async fn delete(&self, id: i64) -> GridResult<Option<Point>> {
            self.inner.delete(id).await
        }
        async fn delete_points(&self, ids: &[i64]) -> GridResult<Vec<Point>> {
            let poisoned = self.poisoned.lock().unwrap().clone();
            if ids.iter().any(|id| poisoned.contains(id)) {
                return Err(GridError::Internal("lock timeout".into()));
            }
            self.inner.delete_points(ids).await
        }
        async fn delete_all_for_user(&self, user_id: &str) -> GridResult<Vec<Point>> {
            self.inner.delete_all_for_user(user_id).await
        }
        async fn delete_all(&self) -> GridResult<usize> {
            self.inner.delete_all().await
        }
        async fn get_total_count(&self) -> GridResult<usize> {
            self.inner.get_total_count().await
        }
        async fn get_count_excluding_origin(&self) -> GridResult<usize> {
            self.inner.get_count_excluding_origin().await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_sweep() {
        let repo = Arc::new(FlakyRepository {
            inner: InMemoryPointRepository::new(),
            poisoned: Mutex::new(Vec::new()),
        });
        // Column x=3: ids 1..=4, the first survives and 2..=4 are evicted.
        for i in 0..4 {
            place(&repo.inner, 3, i + 1, i).await;
        }
        repo.poisoned.lock().unwrap().push(2);

        let engine = CleanupEngine::new(
            repo.clone(),
            Arc::new(TileService::default()),
            Arc::new(EventBroadcaster::new()),
            Arc::new(RwLock::new(SlopeRegistry::new())),
            CleanupConfig {
                delete_batch_size: 1,
                ..fast_config()
            },
        );

        let outcome = engine.run_once().await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Cleaned {
                initial_count: 4,
                evicted: 2,
                remaining: 2
            }
        );
        let left: Vec<i64> = repo.get_all().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(left, vec![1, 2]);
    }
}
