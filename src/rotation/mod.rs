//! Rotation stage: spatial realignment of a quarterly field.
//!
//! Transforms operate on a [`TemporalField`] whose leading axis is named
//! `time`; the quarterly field is relabelled on the way in and back on the
//! way out, so quarter keys and missing values pass through untouched.

use crate::config::{RotationConfig, RotationKind};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CellId, Quarter, QuarterlyField};
use ndarray::{Array2, Axis};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

pub const QUARTER_AXIS: &str = "quarter";
pub const TIME_AXIS: &str = "time";

/// A quarterly field with a named leading axis.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalField {
    pub axis: String,
    pub labels: Vec<Quarter>,
    pub cell_ids: Vec<CellId>,
    pub values: Array2<f64>,
}

impl From<QuarterlyField> for TemporalField {
    fn from(field: QuarterlyField) -> Self {
        Self {
            axis: QUARTER_AXIS.to_string(),
            labels: field.quarters,
            cell_ids: field.cell_ids,
            values: field.values,
        }
    }
}

impl TemporalField {
    /// Rename the leading axis; fails if it is not currently `from`.
    pub fn rename_axis(mut self, from: &str, to: &str) -> PipelineResult<Self> {
        if self.axis != from {
            return Err(PipelineError::Rotation(format!(
                "expected leading axis `{}`, found `{}`",
                from, self.axis
            )));
        }
        self.axis = to.to_string();
        Ok(self)
    }

    /// Back to a quarterly field; the leading axis must be `quarter`.
    pub fn into_quarterly(self) -> PipelineResult<QuarterlyField> {
        if self.axis != QUARTER_AXIS {
            return Err(PipelineError::MissingAxis {
                context: "rotated field".to_string(),
                axis: QUARTER_AXIS.to_string(),
            });
        }
        QuarterlyField::new(self.labels, self.cell_ids, self.values)
    }
}

/// A spatial transform over a time-indexed field.
pub trait Rotation {
    /// Short name recorded in store metadata.
    fn name(&self) -> &str;

    /// Transform the field. Must keep the leading axis and its labels.
    fn apply(&self, field: TemporalField) -> PipelineResult<TemporalField>;
}

/// Leaves the field unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRotation;

impl Rotation for IdentityRotation {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, field: TemporalField) -> PipelineResult<TemporalField> {
        ensure_time_axis(&field)?;
        Ok(field)
    }
}

/// Moves each cell's column to a new cell id.
///
/// Cells absent from the table keep their id. Values are moved, never
/// recomputed.
#[derive(Debug, Clone, Default)]
pub struct CellRemap {
    table: HashMap<CellId, CellId>,
}

impl CellRemap {
    pub fn new(table: HashMap<CellId, CellId>) -> Self {
        Self { table }
    }

    /// Load a JSON object `{"<from cell>": <to cell>, ...}`.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let table: HashMap<CellId, CellId> = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Rotation(format!(
                "invalid remap table {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!("Loaded {} remap entries from {}", table.len(), path.display());
        Ok(Self::new(table))
    }
}

impl Rotation for CellRemap {
    fn name(&self) -> &str {
        "remap"
    }

    fn apply(&self, field: TemporalField) -> PipelineResult<TemporalField> {
        ensure_time_axis(&field)?;

        let targets: Vec<CellId> = field
            .cell_ids
            .iter()
            .map(|cell| self.table.get(cell).copied().unwrap_or(*cell))
            .collect();

        let mut seen = HashSet::with_capacity(targets.len());
        for (source, target) in field.cell_ids.iter().zip(&targets) {
            if !seen.insert(*target) {
                return Err(PipelineError::Rotation(format!(
                    "cell {} maps onto cell {} which is already occupied",
                    source, target
                )));
            }
        }

        let mut order: Vec<usize> = (0..targets.len()).collect();
        order.sort_by_key(|&i| targets[i]);

        Ok(TemporalField {
            axis: field.axis,
            labels: field.labels,
            cell_ids: order.iter().map(|&i| targets[i]).collect(),
            values: field.values.select(Axis(1), &order),
        })
    }
}

fn ensure_time_axis(field: &TemporalField) -> PipelineResult<()> {
    if field.axis == TIME_AXIS {
        Ok(())
    } else {
        Err(PipelineError::Rotation(format!(
            "rotation needs a leading `{}` axis, found `{}`",
            TIME_AXIS, field.axis
        )))
    }
}

/// Build the rotation selected by the configuration.
pub fn from_config(config: &RotationConfig) -> PipelineResult<Box<dyn Rotation>> {
    match config.kind {
        RotationKind::Identity => Ok(Box::new(IdentityRotation)),
        RotationKind::Remap => {
            let table = config.table.as_deref().ok_or_else(|| {
                PipelineError::Config("rotation.table is required for remap".to_string())
            })?;
            Ok(Box::new(CellRemap::from_file(table)?))
        }
    }
}

/// Rename `quarter` to `time`, rotate, and rename back.
pub fn rotate_field(field: QuarterlyField, rotation: &dyn Rotation) -> PipelineResult<QuarterlyField> {
    let quarters = field.quarters.clone();
    let temporal = TemporalField::from(field).rename_axis(QUARTER_AXIS, TIME_AXIS)?;

    let rotated = rotation.apply(temporal)?;
    if rotated.labels != quarters {
        return Err(PipelineError::Rotation(format!(
            "{} rotation changed the quarter keys",
            rotation.name()
        )));
    }

    let field = rotated
        .rename_axis(TIME_AXIS, QUARTER_AXIS)?
        .into_quarterly()?;
    info!(
        "Applied {} rotation to {} quarters x {} cells",
        rotation.name(),
        field.quarters.len(),
        field.cell_ids.len()
    );
    Ok(field)
}
