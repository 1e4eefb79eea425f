//! Command-line configuration for the server binary.

use crate::cleanup::CleanupConfig;
use crate::tile_store::TileCacheConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Milliseconds between cleanup sweeps
    #[arg(long, default_value = "10000")]
    pub cleanup_interval_ms: u64,

    /// Non-origin point count that triggers a world reset
    #[arg(long, default_value_t = shared::RESET_THRESHOLD)]
    pub reset_threshold: usize,

    /// Prime slope magnitudes drawn per sweep
    #[arg(long, default_value = "16")]
    pub slope_sample_size: usize,

    /// Slopes examined together per grouping pass
    #[arg(long, default_value = "5")]
    pub slope_batch_size: usize,

    /// Points deleted per eviction batch
    #[arg(long, default_value = "10")]
    pub delete_batch_size: usize,

    /// Pause between eviction batches in milliseconds
    #[arg(long, default_value = "10")]
    pub delete_batch_delay_ms: u64,

    /// Maximum number of tiles held in memory
    #[arg(long, default_value = "1000")]
    pub tile_cache_size: usize,

    /// Lifetime of a cached tile in milliseconds
    #[arg(long, default_value = "10000")]
    pub tile_cache_ttl_ms: u64,

    /// File used to persist points across restarts
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_millis(self.cleanup_interval_ms),
            reset_threshold: self.reset_threshold,
            slope_sample_size: self.slope_sample_size,
            slope_batch_size: self.slope_batch_size.max(1),
            delete_batch_size: self.delete_batch_size.max(1),
            delete_batch_delay: Duration::from_millis(self.delete_batch_delay_ms),
            ..CleanupConfig::default()
        }
    }

    pub fn tile_cache(&self) -> TileCacheConfig {
        TileCacheConfig {
            max_size: self.tile_cache_size.max(1),
            default_ttl: Duration::from_millis(self.tile_cache_ttl_ms),
        }
    }
}
