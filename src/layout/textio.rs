//! Whitespace-separated numeric text files exchanged between stages.
//!
//! Matrices are one row per line. Vectors accept any layout and are read
//! in reading order. `nan` is a valid value.

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fmt::Write as _;
use std::path::Path;

fn parse_rows(contents: &str, path: &Path) -> Result<Vec<Vec<f64>>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(n, line)| {
            line.split_whitespace()
                .map(|v| {
                    v.parse::<f64>().with_context(|| {
                        format!("{}:{}: invalid number '{}'", path.display(), n + 1, v)
                    })
                })
                .collect()
        })
        .collect()
}

/// Read a matrix. An empty file yields a `0 x 0` matrix.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let rows = parse_rows(&contents, path)?;

    let ncols = rows.first().map_or(0, Vec::len);
    if let Some((n, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        anyhow::bail!(
            "{}: row {} has {} values, expected {}",
            path.display(),
            n + 1,
            row.len(),
            ncols
        );
    }

    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}

/// Read every value of the file as a vector.
pub fn read_vector(path: &Path) -> Result<Array1<f64>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let values: Vec<f64> = parse_rows(&contents, path)?.into_iter().flatten().collect();
    Ok(Array1::from(values))
}

pub fn write_matrix(path: &Path, matrix: ArrayView2<'_, f64>) -> Result<()> {
    let mut out = String::new();
    for row in matrix.outer_iter() {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    std::fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
}

/// Write a vector, one value per line.
pub fn write_vector(path: &Path, values: ArrayView1<'_, f64>) -> Result<()> {
    let mut out = String::new();
    for v in values {
        writeln!(out, "{}", v)?;
    }
    std::fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_matrix_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pointing.txt");
        let m = array![[1.0, 0.0, 2.5], [0.0, 1.0, -0.125], [0.0, 0.0, 1.0]];

        write_matrix(&path, m.view()).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), m);
    }

    #[test]
    fn test_read_numpy_style_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disp_min_max.txt");
        std::fs::write(&path, "-12.0\n  34.5\n").unwrap();

        let v = read_vector(&path).unwrap();
        assert_eq!(v, array![-12.0, 34.5]);

        let m = read_matrix(&path).unwrap();
        assert_eq!(m.shape(), &[2, 1]);
    }

    #[test]
    fn test_nan_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local_mean_heights.txt");
        write_vector(&path, array![f64::NAN, 12.0].view()).unwrap();

        let v = read_vector(&path).unwrap();
        assert!(v[0].is_nan());
        assert_eq!(v[1], 12.0);
    }

    #[test]
    fn test_ragged_matrix_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "1 2 3\n4 5\n").unwrap();

        assert!(read_matrix(&path).is_err());
    }
}
