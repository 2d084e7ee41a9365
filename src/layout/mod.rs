//! Every path a run reads or writes, relative to `output.out_dir`.
//!
//! Stages never build paths by hand; they ask the [`RunLayout`] for the
//! file of a tile, a unit or a pair, and use [`RunLayout::has_tile_output`]
//! / [`RunLayout::has_unit_output`] instead of probing directories.

pub mod textio;

use std::path::{Path, PathBuf};

use crate::tile::Tile;

/// Per-tile outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileOutput {
    Mask,
    HeightMap,
    LocalMeanHeights,
    Cloud,
    Dsm,
    Confidence,
    DsmFiltered,
}

impl TileOutput {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Mask => "mask.tif",
            Self::HeightMap => "height_map.tif",
            Self::LocalMeanHeights => "local_mean_heights.txt",
            Self::Cloud => "cloud.ply",
            Self::Dsm => "dsm.tif",
            Self::Confidence => "confidence.tif",
            Self::DsmFiltered => "dsm-filtered.tif",
        }
    }
}

/// Per (tile, pair) outputs, stored under `<tile dir>/pair_{i}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOutput {
    Pointing,
    SiftMatches,
    CenterKeypointsSec,
    RectifiedRef,
    RectifiedSec,
    HomographyRef,
    HomographySec,
    DispMinMax,
    Disparity,
    DisparityMask,
    HeightMap,
}

impl UnitOutput {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Pointing => "pointing.txt",
            Self::SiftMatches => "sift_matches.txt",
            Self::CenterKeypointsSec => "center_keypts_sec.txt",
            Self::RectifiedRef => "rectified_ref.tif",
            Self::RectifiedSec => "rectified_sec.tif",
            Self::HomographyRef => "H_ref.txt",
            Self::HomographySec => "H_sec.txt",
            Self::DispMinMax => "disp_min_max.txt",
            Self::Disparity => "rectified_disp.tif",
            Self::DisparityMask => "rectified_mask.png",
            Self::HeightMap => "height_map.tif",
        }
    }
}

/// Run-level rasters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalOutput {
    Dsm,
    Confidence,
    DsmFiltered,
}

impl GlobalOutput {
    pub const ALL: [GlobalOutput; 3] = [Self::Dsm, Self::DsmFiltered, Self::Confidence];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Dsm => "dsm.tif",
            Self::Confidence => "confidence.tif",
            Self::DsmFiltered => "dsm-filtered.tif",
        }
    }

    /// The per-tile raster merged into this output.
    pub fn tile_source(self) -> TileOutput {
        match self {
            Self::Dsm => TileOutput::Dsm,
            Self::Confidence => TileOutput::Confidence,
            Self::DsmFiltered => TileOutput::DsmFiltered,
        }
    }
}

/// Paths of one run rooted at the output directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("tiles.txt")
    }

    pub fn live_set_journal(&self, stage: u8) -> PathBuf {
        self.root.join(format!("live_units_stage_{}.json", stage))
    }

    pub fn tile_dir(&self, tile: &Tile) -> PathBuf {
        self.root.join(&tile.dir)
    }

    pub fn pair_dir(&self, tile: &Tile, pair: usize) -> PathBuf {
        self.tile_dir(tile).join(format!("pair_{}", pair))
    }

    pub fn tile_file(&self, tile: &Tile, output: TileOutput) -> PathBuf {
        self.tile_dir(tile).join(output.file_name())
    }

    /// Same as [`Self::tile_file`] for a tile known only by its key
    /// (a neighbor reference).
    pub fn tile_file_by_key(&self, key: &str, output: TileOutput) -> PathBuf {
        self.root.join(key).join(output.file_name())
    }

    pub fn unit_file(&self, tile: &Tile, pair: usize, output: UnitOutput) -> PathBuf {
        self.pair_dir(tile, pair).join(output.file_name())
    }

    pub fn unit_file_by_key(&self, key: &str, pair: usize, output: UnitOutput) -> PathBuf {
        self.root
            .join(key)
            .join(format!("pair_{}", pair))
            .join(output.file_name())
    }

    pub fn global_pointing(&self, pair: usize) -> PathBuf {
        self.root.join(format!("global_pointing_pair_{}.txt", pair))
    }

    pub fn global_mean_height(&self, pair: usize) -> PathBuf {
        self.root.join(format!("global_mean_height_pair_{}.txt", pair))
    }

    pub fn global_file(&self, output: GlobalOutput) -> PathBuf {
        self.root.join(output.file_name())
    }

    pub fn has_tile_output(&self, tile: &Tile, output: TileOutput) -> bool {
        self.tile_file(tile, output).is_file()
    }

    pub fn has_unit_output(&self, tile: &Tile, pair: usize, output: UnitOutput) -> bool {
        self.unit_file(tile, pair, output).is_file()
    }

    /// Create the tile directory and one directory per pair.
    pub fn create_tile_dirs(&self, tile: &Tile, num_pairs: usize) -> std::io::Result<()> {
        std::fs::create_dir_all(self.tile_dir(tile))?;
        for pair in 1..=num_pairs {
            std::fs::create_dir_all(self.pair_dir(tile, pair))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{partition, Region};
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let layout = RunLayout::new("/run");
        let tile = partition(Region::new(0, 300, 300, 300), 300, 300).remove(0);

        assert_eq!(layout.manifest(), PathBuf::from("/run/tiles.txt"));
        assert_eq!(
            layout.unit_file(&tile, 2, UnitOutput::Pointing),
            PathBuf::from("/run/tiles/row_0000300_height_300/col_0000000_width_300/pair_2/pointing.txt")
        );
        assert_eq!(
            layout.global_pointing(1),
            PathBuf::from("/run/global_pointing_pair_1.txt")
        );
        assert_eq!(
            layout.unit_file_by_key(&tile.dir, 2, UnitOutput::Pointing),
            layout.unit_file(&tile, 2, UnitOutput::Pointing)
        );
    }

    #[test]
    fn test_existence_queries() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path());
        let tile = partition(Region::new(0, 0, 4, 4), 4, 4).remove(0);

        layout.create_tile_dirs(&tile, 2).unwrap();
        assert!(layout.pair_dir(&tile, 2).is_dir());
        assert!(!layout.has_tile_output(&tile, TileOutput::Cloud));

        std::fs::write(layout.tile_file(&tile, TileOutput::Cloud), "ply").unwrap();
        assert!(layout.has_tile_output(&tile, TileOutput::Cloud));
        assert!(!layout.has_unit_output(&tile, 1, UnitOutput::Disparity));
    }
}
