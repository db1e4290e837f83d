//! Per-sample tile score grid.
//!
//! Cells hold the infected-class probability of one tile, or [`NOT_EVALUATED`]
//! when the tile failed the focus gate. The sentinel is `NaN` in memory and
//! `null` on disk.

use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel for tiles that were not classified.
pub const NOT_EVALUATED: f32 = f32::NAN;

#[derive(Debug, Clone)]
pub struct ScoreMap {
    cells: Array2<f32>,
}

impl ScoreMap {
    /// A `rows × cols` map with every cell not evaluated.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cells: Array2::from_elem((rows, cols), NOT_EVALUATED),
        }
    }

    pub fn from_array(cells: Array2<f32>) -> Self {
        Self { cells }
    }

    /// Build from row vectors where `None` marks a not-evaluated cell.
    /// Returns `None` when the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<Option<f32>>>) -> Option<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != n_cols) {
            return None;
        }
        let flat: Vec<f32> = rows
            .into_iter()
            .flatten()
            .map(|c| c.unwrap_or(NOT_EVALUATED))
            .collect();
        Array2::from_shape_vec((n_rows, n_cols), flat)
            .ok()
            .map(Self::from_array)
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn cols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.cells.get((row, col)).copied()
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.cells[[row, col]] = value;
    }

    pub fn is_evaluated(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_some_and(|v| !v.is_nan())
    }

    /// Iterator over all cells in raster order.
    pub fn cells(&self) -> impl Iterator<Item = f32> + '_ {
        self.cells.iter().copied()
    }

    /// Number of cells that hold a probability.
    pub fn evaluated_count(&self) -> usize {
        self.cells.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn not_evaluated_count(&self) -> usize {
        self.len() - self.evaluated_count()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.cells
    }

    fn to_rows(&self) -> Vec<Vec<Option<f32>>> {
        self.cells
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|&v| if v.is_nan() { None } else { Some(v) })
                    .collect()
            })
            .collect()
    }
}

/// Sentinel cells compare equal to each other; everything else compares by value.
impl PartialEq for ScoreMap {
    fn eq(&self, other: &Self) -> bool {
        self.cells.dim() == other.cells.dim()
            && self
                .cells
                .iter()
                .zip(other.cells.iter())
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }
}

impl Serialize for ScoreMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_rows().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScoreMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<Vec<Option<f32>>>::deserialize(deserializer)?;
        ScoreMap::from_rows(rows)
            .ok_or_else(|| serde::de::Error::custom("score map rows have different lengths"))
    }
}
