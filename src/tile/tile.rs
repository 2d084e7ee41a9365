//! Region, tile and the row-major partition.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Key used for per-tile maps and paths (the tile directory).
pub type TileKey = String;

/// Integer pixel rectangle in reference image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }
}

/// One rectangular piece of the region of interest.
///
/// Field order is the serialized descriptor order and must stay stable:
/// manifests written by earlier runs are read back with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Output directory relative to the run directory
    pub dir: TileKey,
    /// Directories of the 8-connected grid neighbors, row-major, self excluded
    pub neighbors: Vec<TileKey>,
}

impl Tile {
    fn new(region: Region) -> Self {
        Self {
            x: region.x,
            y: region.y,
            w: region.w,
            h: region.h,
            dir: tile_dir(&region),
            neighbors: Vec::new(),
        }
    }

    pub fn region(&self) -> Region {
        Region::new(self.x, self.y, self.w, self.h)
    }

    pub fn key(&self) -> &TileKey {
        &self.dir
    }

    /// Tile center in reference image coordinates.
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.w) / 2.0,
            f64::from(self.y) + f64::from(self.h) / 2.0,
        )
    }

    /// One-line JSON descriptor as written to the manifest.
    pub fn descriptor(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tile {} {} ({}x{})", self.x, self.y, self.w, self.h)
    }
}

fn tile_dir(region: &Region) -> String {
    format!(
        "tiles/row_{:07}_height_{}/col_{:07}_width_{}",
        region.y, region.h, region.x, region.w
    )
}

/// Split `region` into tiles of at most `tile_w` x `tile_h`, left to right
/// then top to bottom. Tiles on the right and bottom edges are clipped.
pub fn partition(region: Region, tile_w: u32, tile_h: u32) -> Vec<Tile> {
    if tile_w == 0 || tile_h == 0 || region.w == 0 || region.h == 0 {
        return Vec::new();
    }

    let cols = region.w.div_ceil(tile_w) as usize;
    let rows = region.h.div_ceil(tile_h) as usize;

    let mut tiles = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        let y = region.y + row as u32 * tile_h;
        let h = tile_h.min(region.bottom() - y);
        for col in 0..cols {
            let x = region.x + col as u32 * tile_w;
            let w = tile_w.min(region.right() - x);
            tiles.push(Tile::new(Region::new(x, y, w, h)));
        }
    }

    for row in 0..rows {
        for col in 0..cols {
            let mut neighbors = Vec::with_capacity(8);
            for dr in -1i64..=1 {
                for dc in -1i64..=1 {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let (r, c) = (row as i64 + dr, col as i64 + dc);
                    if r < 0 || c < 0 || r >= rows as i64 || c >= cols as i64 {
                        continue;
                    }
                    neighbors.push(tiles[r as usize * cols + c as usize].dir.clone());
                }
            }
            tiles[row * cols + col].neighbors = neighbors;
        }
    }

    tiles
}

/// The tile's stored neighbor directories.
pub fn neighbors_of(tile: &Tile) -> &[TileKey] {
    &tile.neighbors
}

/// Keep the tiles flagged usable and drop references to removed tiles from
/// every surviving neighbor list.
pub fn retain_usable(tiles: Vec<Tile>, usable: &[bool]) -> Vec<Tile> {
    let kept: Vec<Tile> = tiles
        .into_iter()
        .zip(usable.iter().copied())
        .filter_map(|(tile, ok)| ok.then_some(tile))
        .collect();

    let keys: HashSet<TileKey> = kept.iter().map(|t| t.dir.clone()).collect();
    kept.into_iter()
        .map(|mut tile| {
            tile.neighbors.retain(|n| keys.contains(n));
            tile
        })
        .collect()
}
