//! Tile persistence and caching.
//!
//! Tiles live in two layers: a persistent [`TileRepository`] that stores the
//! compressed form, and a bounded in-memory [`TileCache`] with per-entry TTLs.
//! [`TileService`] ties both together, coalesces concurrent misses for the
//! same tile and keeps invalidations ordered with regenerations.

use crate::error::{GridError, GridResult};
use crate::repository::PointRepository;
use crate::utils::get_timestamp;
use log::{debug, info};
use shared::tile::{decompress_bitmap, generate_tile, tile_bounds, world_to_tile_coords, Tile};
use shared::{within_tile_bounds, TILE_BOUND, TILE_SIZE};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Cache key for a tile, rendered as `"x,y"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub tile_x: i64,
    pub tile_y: i64,
}

impl TileKey {
    pub fn new(tile_x: i64, tile_y: i64) -> Self {
        Self { tile_x, tile_y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.tile_x, self.tile_y)
    }
}

/// Rejects tile coordinates outside the playable world.
pub fn validate_tile_coords(tile_x: i64, tile_y: i64) -> GridResult<()> {
    if within_tile_bounds(tile_x, tile_y) {
        Ok(())
    } else {
        Err(GridError::validation(format!(
            "tile ({}, {}) is outside [-{}, {}]",
            tile_x, tile_y, TILE_BOUND, TILE_BOUND
        )))
    }
}

/// Every tile whose rendering depends on the cell `(x, y)`.
///
/// Besides the containing tile, a point on a tile's last column also touches
/// the tile to the east, one on the last row the tile to the south, and a
/// corner point the diagonal neighbour as well.
pub fn tiles_affected_by(x: i64, y: i64) -> Vec<TileKey> {
    let (tile_x, tile_y) = world_to_tile_coords(x, y);
    let east = (x + 1).rem_euclid(TILE_SIZE) == 0;
    let south = (y + 1).rem_euclid(TILE_SIZE) == 0;

    let mut keys = vec![TileKey::new(tile_x, tile_y)];
    if east {
        keys.push(TileKey::new(tile_x + 1, tile_y));
    }
    if south {
        keys.push(TileKey::new(tile_x, tile_y + 1));
    }
    if east && south {
        keys.push(TileKey::new(tile_x + 1, tile_y + 1));
    }
    keys
}

#[derive(Debug, Clone)]
struct StoredTile {
    compressed_data: Vec<u8>,
    version: u32,
    last_updated_ms: i64,
}

/// Persistent tile rows, keyed by tile coordinates.
pub struct TileRepository {
    rows: RwLock<HashMap<TileKey, StoredTile>>,
}

impl TileRepository {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Loads a tile and inflates its bitmap.
    pub async fn get_tile(&self, tile_x: i64, tile_y: i64) -> GridResult<Option<Tile>> {
        let row = {
            let rows = self.rows.read().await;
            rows.get(&TileKey::new(tile_x, tile_y)).cloned()
        };
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(Tile {
                tile_x,
                tile_y,
                data: decompress_bitmap(&row.compressed_data)?,
                compressed_data: row.compressed_data,
                version: row.version,
                last_updated_ms: row.last_updated_ms,
            })),
        }
    }

    /// Upserts a tile. Overwriting an existing row bumps its version and
    /// stamps the current time. Returns the tile as stored.
    pub async fn save_tile(&self, tile: &Tile) -> GridResult<Tile> {
        let mut rows = self.rows.write().await;
        let key = TileKey::new(tile.tile_x, tile.tile_y);

        let row = match rows.get(&key) {
            Some(previous) => StoredTile {
                compressed_data: tile.compressed_data.clone(),
                version: previous.version + 1,
                last_updated_ms: get_timestamp(),
            },
            None => StoredTile {
                compressed_data: tile.compressed_data.clone(),
                version: tile.version,
                last_updated_ms: tile.last_updated_ms,
            },
        };

        let saved = Tile {
            version: row.version,
            last_updated_ms: row.last_updated_ms,
            ..tile.clone()
        };
        rows.insert(key, row);
        Ok(saved)
    }

    pub async fn clear(&self) -> usize {
        let mut rows = self.rows.write().await;
        let removed = rows.len();
        rows.clear();
        removed
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl Default for TileRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCacheConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    tile: Tile,
    expires_at: Instant,
}

/// Marks the point in invalidation history a generation started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Epoch {
    reset: u64,
    key: u64,
}

/// Bounded tile map with per-entry expiry. Overflow evicts the oldest insertion.
#[derive(Debug)]
pub struct TileCache {
    config: TileCacheConfig,
    entries: HashMap<TileKey, CacheEntry>,
    order: VecDeque<TileKey>,
    key_epochs: HashMap<TileKey, u64>,
    reset_epoch: u64,
}

impl TileCache {
    pub fn new(config: TileCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            key_epochs: HashMap::new(),
            reset_epoch: 0,
        }
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&mut self, key: &TileKey) -> Option<Tile> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.tile.clone())
    }

    pub fn insert(&mut self, key: TileKey, tile: Tile) {
        let ttl = self.config.default_ttl;
        self.insert_with_ttl(key, tile, ttl);
    }

    pub fn insert_with_ttl(&mut self, key: TileKey, tile: Tile, ttl: Duration) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        while self.entries.len() >= self.config.max_size && !self.entries.contains_key(&key) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                tile,
                expires_at: Instant::now() + ttl,
            },
        );
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: &TileKey) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    /// Drops the entry and records the invalidation so that generations
    /// already in flight for this key do not cache their result.
    pub fn invalidate(&mut self, key: &TileKey) -> bool {
        *self.key_epochs.entry(*key).or_insert(0) += 1;
        self.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.key_epochs.clear();
        self.reset_epoch += 1;
    }

    fn epoch(&self, key: &TileKey) -> Epoch {
        Epoch {
            reset: self.reset_epoch,
            key: self.key_epochs.get(key).copied().unwrap_or(0),
        }
    }

    /// Caches the tile only if no invalidation happened since `started`.
    fn insert_if_current(&mut self, key: TileKey, tile: Tile, started: Epoch) -> bool {
        if self.epoch(&key) != started {
            return false;
        }
        self.insert(key, tile);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A tile together with where it was served from.
#[derive(Debug, Clone)]
pub struct TileFetch {
    pub tile: Tile,
    pub from_cache: bool,
}

/// Long-lived tile service shared by request handlers and the cleanup sweep.
pub struct TileService {
    store: TileRepository,
    cache: Mutex<TileCache>,
    in_flight: Mutex<HashMap<TileKey, Arc<Mutex<()>>>>,
}

impl TileService {
    pub fn new(config: TileCacheConfig) -> Self {
        Self {
            store: TileRepository::new(),
            cache: Mutex::new(TileCache::new(config)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &TileRepository {
        &self.store
    }

    /// Serves a tile from cache, otherwise runs `generator` with the stored
    /// tile (if any) and persists and caches what it returns.
    ///
    /// Concurrent misses for the same key wait for a single generation.
    pub async fn get_or_generate<F, Fut>(
        &self,
        tile_x: i64,
        tile_y: i64,
        generator: F,
    ) -> GridResult<TileFetch>
    where
        F: FnOnce(Option<Tile>) -> Fut,
        Fut: Future<Output = GridResult<Tile>>,
    {
        let key = TileKey::new(tile_x, tile_y);
        if let Some(tile) = self.cache.lock().await.get(&key) {
            return Ok(TileFetch {
                tile,
                from_cache: true,
            });
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(in_flight.entry(key).or_default())
        };
        let result = self.generate_once(key, &gate, generator).await;

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.get(&key).is_some_and(|g| Arc::ptr_eq(g, &gate)) && Arc::strong_count(&gate) == 2 {
                in_flight.remove(&key);
            }
        }
        result
    }

    async fn generate_once<F, Fut>(
        &self,
        key: TileKey,
        gate: &Mutex<()>,
        generator: F,
    ) -> GridResult<TileFetch>
    where
        F: FnOnce(Option<Tile>) -> Fut,
        Fut: Future<Output = GridResult<Tile>>,
    {
        let _guard = gate.lock().await;

        let started = {
            let mut cache = self.cache.lock().await;
            if let Some(tile) = cache.get(&key) {
                return Ok(TileFetch {
                    tile,
                    from_cache: true,
                });
            }
            cache.epoch(&key)
        };

        let stored = self.store.get_tile(key.tile_x, key.tile_y).await?;
        let generated = generator(stored.clone()).await?;
        let tile = if stored.as_ref() == Some(&generated) {
            generated
        } else {
            let saved = self.store.save_tile(&generated).await?;
            debug!("Tile {} saved at version {}", key, saved.version);
            saved
        };

        let cached = self
            .cache
            .lock()
            .await
            .insert_if_current(key, tile.clone(), started);
        if !cached {
            debug!("Tile {} invalidated during generation, not caching", key);
        }

        Ok(TileFetch {
            tile,
            from_cache: false,
        })
    }

    /// Fetches a tile, regenerating it from the live points on a miss.
    pub async fn load_tile(
        &self,
        tile_x: i64,
        tile_y: i64,
        points: &dyn PointRepository,
    ) -> GridResult<TileFetch> {
        self.get_or_generate(tile_x, tile_y, |existing| {
            regenerate(points, tile_x, tile_y, existing)
        })
        .await
    }

    /// Drops a tile from the cache. The persisted row is kept.
    pub async fn invalidate(&self, tile_x: i64, tile_y: i64) -> bool {
        self.cache
            .lock()
            .await
            .invalidate(&TileKey::new(tile_x, tile_y))
    }

    /// Invalidates every tile whose rendering depends on `(x, y)`.
    pub async fn invalidate_for_point(&self, x: i64, y: i64) -> Vec<TileKey> {
        let keys = tiles_affected_by(x, y);
        let mut cache = self.cache.lock().await;
        for key in &keys {
            cache.invalidate(key);
        }
        keys
    }

    /// Forgets every tile, persisted rows included.
    pub async fn reset(&self) {
        self.cache.lock().await.clear();
        let removed = self.store.clear().await;
        info!("Cleared {} stored tiles", removed);
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

async fn regenerate(
    points: &dyn PointRepository,
    tile_x: i64,
    tile_y: i64,
    existing: Option<Tile>,
) -> GridResult<Tile> {
    let bounds = tile_bounds(tile_x, tile_y);
    let in_bounds = points
        .get_points_in_bounds(bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y)
        .await?;
    Ok(generate_tile(
        tile_x,
        tile_y,
        &in_bounds,
        existing.as_ref(),
        get_timestamp(),
    )?)
}

impl Default for TileService {
    fn default() -> Self {
        Self::new(TileCacheConfig::default())
    }
}
