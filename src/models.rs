//! Data models for the quarterly aggregation pipeline.
//!
//! This module contains the core data structures shared by every stage:
//! tags, quarter keys, per-tag source datasets and quarter × cell fields.

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Datelike, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HEALPix resolution of the spatial grid (refinement level 12).
pub const NSIDE: u64 = 4096;

/// Name of the grid recorded in store metadata.
pub const GRID_NAME: &str = "healpix";

/// Opaque identifier of one spatial cell.
pub type CellId = u64;

/// Identifier of one tracked animal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(String);

impl Tag {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag(s.to_string())
    }
}

/// Calendar quarter of a timestep (1 = Jan-Mar ... 4 = Oct-Dec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quarter(u8);

impl Quarter {
    /// Create a quarter key, returning `None` outside 1..=4.
    pub fn new(number: u8) -> Option<Self> {
        (1..=4).contains(&number).then_some(Quarter(number))
    }

    /// Quarter containing the given date.
    pub fn of<D: Datelike>(date: &D) -> Self {
        Quarter((date.month0() / 3 + 1) as u8)
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the per-quarter sums are normalized at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// Divide every quarter by the grand total of timesteps over all tags.
    #[default]
    TotalTimesteps,
    /// Divide each quarter by the number of timesteps falling in that quarter.
    PerQuarterTimesteps,
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::TotalTimesteps => write!(f, "total-timesteps"),
            Normalization::PerQuarterTimesteps => write!(f, "per-quarter-timesteps"),
        }
    }
}

/// One tag's time series of habitat states.
#[derive(Debug, Clone)]
pub struct SourceDataset {
    /// Tag the series belongs to.
    pub tag: Tag,
    /// Timestamp of each row of `states`.
    pub times: Vec<DateTime<Utc>>,
    /// Cell id of each column of `states`.
    pub cell_ids: Vec<CellId>,
    /// State values, `[time, cell]`; NaN marks a missing value.
    pub states: Array2<f64>,
}

impl SourceDataset {
    /// Build a dataset, checking that the coordinates match the value shape.
    pub fn new(
        tag: Tag,
        times: Vec<DateTime<Utc>>,
        cell_ids: Vec<CellId>,
        states: Array2<f64>,
    ) -> PipelineResult<Self> {
        let (rows, cols) = states.dim();
        if rows != times.len() || cols != cell_ids.len() {
            return Err(PipelineError::malformed(
                format!("tag {}", tag),
                format!(
                    "states shape {}x{} does not match {} timesteps x {} cells",
                    rows,
                    cols,
                    times.len(),
                    cell_ids.len()
                ),
            ));
        }

        Ok(Self {
            tag,
            times,
            cell_ids,
            states,
        })
    }

    /// Number of time samples in the series.
    pub fn timesteps(&self) -> usize {
        self.times.len()
    }
}

/// Values on a quarter × cell grid.
///
/// Both axes are kept sorted and free of duplicates; `values` is laid out
/// as `[quarter, cell]`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarterlyField {
    pub quarters: Vec<Quarter>,
    pub cell_ids: Vec<CellId>,
    pub values: Array2<f64>,
}

impl QuarterlyField {
    /// Build a field, validating axis ordering and shape.
    pub fn new(
        quarters: Vec<Quarter>,
        cell_ids: Vec<CellId>,
        values: Array2<f64>,
    ) -> PipelineResult<Self> {
        if values.dim() != (quarters.len(), cell_ids.len()) {
            return Err(PipelineError::malformed(
                "quarterly field",
                format!(
                    "values shape {:?} does not match {} quarters x {} cells",
                    values.dim(),
                    quarters.len(),
                    cell_ids.len()
                ),
            ));
        }
        if !quarters.windows(2).all(|w| w[0] < w[1]) {
            return Err(PipelineError::malformed(
                "quarterly field",
                "quarter axis must be strictly increasing",
            ));
        }
        if !cell_ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(PipelineError::malformed(
                "quarterly field",
                "cell axis must be strictly increasing",
            ));
        }

        Ok(Self {
            quarters,
            cell_ids,
            values,
        })
    }

    /// A field with no quarters and no cells.
    pub fn empty() -> Self {
        Self {
            quarters: Vec::new(),
            cell_ids: Vec::new(),
            values: Array2::zeros((0, 0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quarters.is_empty()
    }

    /// Value at `(quarter, cell)`, or `None` when either key is off-grid.
    #[cfg(test)]
    pub fn get(&self, quarter: Quarter, cell: CellId) -> Option<f64> {
        let q = self.quarters.binary_search(&quarter).ok()?;
        let c = self.cell_ids.binary_search(&cell).ok()?;
        Some(self.values[[q, c]])
    }
}
