//! Work units, the live set threaded through the stages, and the per-stage
//! journal used to resume a run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::layout::RunLayout;
use crate::tile::{Tile, TileKey};

/// A tile matched against one secondary image (`pair` >= 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub tile: Tile,
    pub pair: usize,
}

impl WorkUnit {
    pub fn key(&self) -> UnitKey {
        UnitKey {
            tile: self.tile.dir.clone(),
            pair: self.pair,
        }
    }
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pair {}", self.tile, self.pair)
    }
}

/// Serializable identity of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub tile: TileKey,
    pub pair: usize,
}

/// Units still considered valid. Only ever shrinks during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    units: Vec<WorkUnit>,
}

impl LiveSet {
    /// Every tile for pair 1, then every tile for pair 2, and so on.
    pub fn full(tiles: &[Tile], num_pairs: usize) -> Self {
        let units = (1..=num_pairs)
            .flat_map(|pair| {
                tiles.iter().map(move |tile| WorkUnit {
                    tile: tile.clone(),
                    pair,
                })
            })
            .collect();
        Self { units }
    }

    /// Rebuild a live set from journaled keys, in full cross-product order.
    /// Keys naming unknown tiles or pairs are ignored.
    pub fn from_keys(tiles: &[Tile], num_pairs: usize, keys: &[UnitKey]) -> Self {
        let wanted: HashSet<&UnitKey> = keys.iter().collect();
        let full = Self::full(tiles, num_pairs);
        let units: Vec<WorkUnit> = full
            .units
            .into_iter()
            .filter(|u| wanted.contains(&u.key()))
            .collect();

        if units.len() != keys.len() {
            tracing::warn!(
                "{} journaled work units do not match the tile manifest and were ignored",
                keys.len().saturating_sub(units.len())
            );
        }
        Self { units }
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.iter().map(WorkUnit::key).collect()
    }

    pub fn contains(&self, tile: &Tile, pair: usize) -> bool {
        self.units
            .iter()
            .any(|u| u.pair == pair && u.tile.dir == tile.dir)
    }

    pub fn units_for_pair(&self, pair: usize) -> impl Iterator<Item = &WorkUnit> {
        self.units.iter().filter(move |u| u.pair == pair)
    }

    /// Tiles with at least one live unit, in manifest order.
    pub fn live_tiles(&self, manifest: &[Tile]) -> Vec<Tile> {
        let live: HashSet<&str> = self.units.iter().map(|u| u.tile.dir.as_str()).collect();
        manifest
            .iter()
            .filter(|t| live.contains(t.dir.as_str()))
            .cloned()
            .collect()
    }

    /// Split into the kept units and the dropped ones. `keep` is aligned
    /// with [`Self::units`].
    pub fn partition_by(self, keep: &[bool]) -> (LiveSet, Vec<WorkUnit>) {
        debug_assert_eq!(keep.len(), self.units.len());
        let (kept, dropped): (Vec<(WorkUnit, bool)>, Vec<(WorkUnit, bool)>) = self
            .units
            .into_iter()
            .zip(keep.iter().copied())
            .partition(|(_, k)| *k);

        (
            LiveSet {
                units: kept.into_iter().map(|(u, _)| u).collect(),
            },
            dropped.into_iter().map(|(u, _)| u).collect(),
        )
    }

    /// Count of live units per pair.
    pub fn per_pair_counts(&self) -> HashMap<usize, usize> {
        let mut counts = HashMap::new();
        for unit in &self.units {
            *counts.entry(unit.pair).or_insert(0) += 1;
        }
        counts
    }
}

/// Live set after a completed stage, as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSetJournal {
    pub stage: u8,
    pub units: Vec<UnitKey>,
}

/// Record the live set produced by `stage`.
pub fn write_journal(layout: &RunLayout, stage: u8, live: &LiveSet) -> Result<()> {
    let journal = LiveSetJournal {
        stage,
        units: live.keys(),
    };
    let path = layout.live_set_journal(stage);
    let tmp = path.with_extension("json.tmp");

    std::fs::write(&tmp, serde_json::to_vec_pretty(&journal)?)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)?;

    tracing::debug!("Journaled {} live units after stage {}", live.len(), stage);
    Ok(())
}

/// The journal of the latest stage before `start_from`, if any.
pub fn load_latest_journal(layout: &RunLayout, start_from: u8) -> Result<Option<LiveSetJournal>> {
    for stage in (1..start_from).rev() {
        let path = layout.live_set_journal(stage);
        if !path.is_file() {
            continue;
        }
        let contents = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let journal: LiveSetJournal = serde_json::from_slice(&contents)
            .with_context(|| format!("Invalid live-set journal {}", path.display()))?;
        return Ok(Some(journal));
    }
    Ok(None)
}

/// Remove journals of stages that are about to be recomputed.
pub fn clear_journals_from(layout: &RunLayout, start_from: u8) -> Result<()> {
    for stage in start_from.max(1)..=7 {
        let path = layout.live_set_journal(stage);
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}
