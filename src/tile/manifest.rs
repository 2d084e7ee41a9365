//! Tile manifest: one JSON descriptor per line, in partition order.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use super::Tile;

/// Write the manifest, replacing any previous one.
pub fn persist(tiles: &[Tile], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = std::io::BufWriter::new(
        std::fs::File::create(path)
            .with_context(|| format!("Failed to create manifest {}", path.display()))?,
    );
    for tile in tiles {
        out.write_all(tile.descriptor()?.as_bytes())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    tracing::debug!("Wrote {} tiles to {}", tiles.len(), path.display());
    Ok(())
}

/// Read a manifest written by [`persist`].
pub fn load(path: &Path) -> Result<Vec<Tile>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid tile descriptor", path.display(), n + 1))
        })
        .collect()
}
