//! # Grid World Server Library
//!
//! This library provides the authoritative server for the shared grid world.
//! Users place base points on an integer grid, the server renders them into
//! compressed tiles, rejects placements that would line up with existing
//! points, and periodically sweeps collinear points out of the world.
//!
//! ## Core Responsibilities
//!
//! ### Tile Serving
//! The world is cut into 64x64 tiles. Each tile is rendered on demand into a
//! 512-byte bitmap, compressed, persisted and cached for a short TTL. Any
//! change to the point set invalidates the tiles it touches so a reader never
//! sees a stale bitmap after the mutation is acknowledged.
//!
//! ### Placement Checks
//! Before placing a point a client asks which cells of its 15x15 viewport
//! are restricted. A cell is restricted when it lies on a fixed-slope line
//! through an existing point.
//!
//! ### World Maintenance
//! A background sweep samples prime slopes, groups points that share a
//! column, a row or a sampled line, and keeps only the oldest of each group.
//! When the remaining population reaches the reset threshold the world is
//! wiped.
//!
//! ### Change Notification
//! Every creation, deletion, sweep and reset is published through the
//! [`events::EventBroadcaster`] so connected clients can refresh.
//!
//! ## Module Organization
//!
//! ### Repository Module (`repository`)
//! Storage boundary for points:
//! - The async [`repository::PointRepository`] trait
//! - An in-memory implementation with bincode snapshots
//!
//! ### Tile Store Module (`tile_store`)
//! Persistence and caching for rendered tiles:
//! - Versioned tile rows with conflict handling
//! - TTL cache with per-key invalidation epochs
//! - Coalescing of concurrent misses for one tile
//!
//! ### Restricted Module (`restricted`)
//! Viewport placement checks against the fixed slope set.
//!
//! ### Cleanup Module (`cleanup`)
//! The periodic sweep, its eviction planner and the world reset.
//!
//! ### Events Module (`events`)
//! Listener registry and broadcast channel for world change events.
//!
//! ### API Module (`api`)
//! The axum router exposing all of the above over HTTP.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::api::{create_router, AppState};
//! use server::cleanup::{CleanupConfig, CleanupEngine};
//! use server::events::EventBroadcaster;
//! use server::repository::InMemoryPointRepository;
//! use server::restricted::RestrictedSquareCalculator;
//! use server::tile_store::TileService;
//! use shared::geometry::SlopeRegistry;
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let points = Arc::new(InMemoryPointRepository::new());
//!     let tiles = Arc::new(TileService::default());
//!     let events = Arc::new(EventBroadcaster::new());
//!     let registry = Arc::new(RwLock::new(SlopeRegistry::new()));
//!
//!     // Sweep collinear points every ten seconds
//!     let engine = CleanupEngine::new(
//!         points.clone(),
//!         tiles.clone(),
//!         events.clone(),
//!         registry.clone(),
//!         CleanupConfig::default(),
//!     );
//!     Arc::new(engine).spawn();
//!
//!     let app = create_router(AppState {
//!         points,
//!         tiles,
//!         events,
//!         restricted: Arc::new(RestrictedSquareCalculator::new()),
//!         registry,
//!         reset_threshold: shared::RESET_THRESHOLD,
//!     });
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Consistency Guarantees
//!
//! ### Cache Coherence
//! Invalidation bumps a per-key epoch and a reset bumps a global one. A
//! generation that started before either bump still persists its tile but
//! never repopulates the cache, so an older bitmap cannot resurface.
//!
//! ### Sweep Isolation
//! A failed eviction batch is logged and skipped; batches already deleted
//! stay deleted and the sweep carries on with the next batch.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod repository;
pub mod restricted;
pub mod tile_store;
pub mod utils;
