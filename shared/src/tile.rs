//! Bitmap tiles: world/tile coordinate math and the compressed wire codec.
//!
//! A tile covers `TILE_SIZE x TILE_SIZE` cells. Bits are row-major with the
//! row taken from the y offset, most significant bit first within a byte.
//! The stored form is a format byte followed by the payload; format `1`
//! means the payload is deflate-compressed.

use crate::{Point, TILE_SIZE};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Raw bitmap length in bytes.
pub const BITMAP_BYTES: usize = ((TILE_SIZE * TILE_SIZE + 7) / 8) as usize;

/// Format byte announcing a deflate-compressed payload.
pub const FORMAT_DEFLATE: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to compress tile bitmap: {0}")]
    Compress(#[source] std::io::Error),
    #[error("failed to decompress tile bitmap: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Inclusive world-space rectangle covered by a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileBounds {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl TileBounds {
    pub fn contains(&self, x: i64, y: i64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

/// A generated tile. `data` is the raw bitmap, `compressed_data` the stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub tile_x: i64,
    pub tile_y: i64,
    pub data: Vec<u8>,
    pub compressed_data: Vec<u8>,
    pub version: u32,
    pub last_updated_ms: i64,
}

impl Tile {
    pub fn bounds(&self) -> TileBounds {
        tile_bounds(self.tile_x, self.tile_y)
    }

    /// Occupied cells in world coordinates.
    pub fn world_points(&self) -> Vec<(i64, i64)> {
        let bounds = self.bounds();
        unpack_bitmap(&self.data)
            .into_iter()
            .map(|(x, y)| (bounds.min_x + x, bounds.min_y + y))
            .collect()
    }
}

/// Floor division so that negative coordinates land in negative tiles.
pub fn world_to_tile_coords(world_x: i64, world_y: i64) -> (i64, i64) {
    (world_x.div_euclid(TILE_SIZE), world_y.div_euclid(TILE_SIZE))
}

pub fn tile_bounds(tile_x: i64, tile_y: i64) -> TileBounds {
    let min_x = tile_x * TILE_SIZE;
    let min_y = tile_y * TILE_SIZE;
    TileBounds {
        min_x,
        min_y,
        max_x: min_x + TILE_SIZE - 1,
        max_y: min_y + TILE_SIZE - 1,
    }
}

/// Packs points into a raw bitmap relative to `(origin_x, origin_y)`.
/// Points outside the tile are ignored.
pub fn pack_bitmap<I>(points: I, origin_x: i64, origin_y: i64) -> Vec<u8>
where
    I: IntoIterator<Item = (i64, i64)>,
{
    let mut bitmap = vec![0u8; BITMAP_BYTES];
    for (x, y) in points {
        let col = x - origin_x;
        let row = y - origin_y;
        if !(0..TILE_SIZE).contains(&col) || !(0..TILE_SIZE).contains(&row) {
            continue;
        }
        let bit_index = (row * TILE_SIZE + col) as usize;
        bitmap[bit_index / 8] |= 0x80 >> (bit_index % 8);
    }
    bitmap
}

/// Lists the set bits of a raw bitmap as local `(x, y)` pairs.
pub fn unpack_bitmap(bitmap: &[u8]) -> Vec<(i64, i64)> {
    let total_bits = (TILE_SIZE * TILE_SIZE) as usize;
    let mut points = Vec::new();
    for (byte_index, &byte) in bitmap.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit in 0..8 {
            let bit_index = byte_index * 8 + bit;
            if bit_index >= total_bits {
                return points;
            }
            if byte & (0x80 >> bit) != 0 {
                let bit_index = bit_index as i64;
                points.push((bit_index % TILE_SIZE, bit_index / TILE_SIZE));
            }
        }
    }
    points
}

/// Wraps a raw bitmap in the stored form: format byte plus deflate payload.
pub fn compress_bitmap(bitmap: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(vec![FORMAT_DEFLATE], Compression::default());
    encoder.write_all(bitmap).map_err(CodecError::Compress)?;
    encoder.finish().map_err(CodecError::Compress)
}

/// Recovers the raw bitmap from the stored form.
pub fn decompress_bitmap(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    match bytes.split_first() {
        None => Ok(Vec::new()),
        Some((&FORMAT_DEFLATE, payload)) => {
            let mut decoder = DeflateDecoder::new(payload);
            let mut raw = Vec::with_capacity(BITMAP_BYTES);
            decoder.read_to_end(&mut raw).map_err(CodecError::Decompress)?;
            Ok(raw)
        }
        Some((_, payload)) => Ok(payload.to_vec()),
    }
}

pub fn encode_bitmap<I>(points: I, origin_x: i64, origin_y: i64) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = (i64, i64)>,
{
    compress_bitmap(&pack_bitmap(points, origin_x, origin_y))
}

/// Decodes the stored form into local coordinates.
pub fn decode_bitmap(bytes: &[u8]) -> Result<Vec<(i64, i64)>, CodecError> {
    Ok(unpack_bitmap(&decompress_bitmap(bytes)?))
}

/// Builds the tile for `(tile_x, tile_y)` from the points inside its bounds.
///
/// If `existing` already holds the same bitmap it is returned untouched so
/// that its version and timestamp stay stable. Otherwise the result starts at
/// version 1; the tile repository bumps it past the stored version on save.
pub fn generate_tile(
    tile_x: i64,
    tile_y: i64,
    points_in_bounds: &[Point],
    existing: Option<&Tile>,
    now_ms: i64,
) -> Result<Tile, CodecError> {
    let bounds = tile_bounds(tile_x, tile_y);
    let data = pack_bitmap(
        points_in_bounds.iter().map(Point::coords),
        bounds.min_x,
        bounds.min_y,
    );

    if let Some(existing) = existing {
        if existing.tile_x == tile_x && existing.tile_y == tile_y && existing.data == data {
            return Ok(existing.clone());
        }
    }

    let compressed_data = compress_bitmap(&data)?;
    Ok(Tile {
        tile_x,
        tile_y,
        data,
        compressed_data,
        version: 1,
        last_updated_ms: now_ms,
    })
}
