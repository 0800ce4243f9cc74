//! Quarterly aggregation of per-tag habitat states.
//!
//! Each tag's series is reduced to per-quarter sums and folded into a
//! running [`AccumulatorState`]; finalization divides by the timestep count
//! and turns exact zeros back into missing values. Only one source dataset
//! is resident at a time.

use crate::catalog::SourceCatalog;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CellId, Normalization, Quarter, QuarterlyField, SourceDataset, Tag};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Per-quarter sums of one tag, with the number of timesteps per quarter.
#[derive(Debug, Clone)]
pub struct QuarterlyReduction {
    pub sums: QuarterlyField,
    pub quarter_timesteps: BTreeMap<Quarter, u64>,
}

/// Running state of the fold over tags.
#[derive(Debug, Clone)]
pub struct AccumulatorState {
    /// Per-quarter sums over all folded tags (missing values counted as 0).
    pub sums: QuarterlyField,
    /// Total number of timesteps over all folded tags.
    pub timesteps: u64,
    /// Timesteps per quarter over all folded tags.
    pub quarter_timesteps: BTreeMap<Quarter, u64>,
    /// Number of tags folded in.
    pub contributing_tags: usize,
}

impl Default for AccumulatorState {
    fn default() -> Self {
        Self {
            sums: QuarterlyField::empty(),
            timesteps: 0,
            quarter_timesteps: BTreeMap::new(),
            contributing_tags: 0,
        }
    }
}

impl AccumulatorState {
    /// Fold one tag's dataset into the running state.
    pub fn fold(self, dataset: &SourceDataset) -> PipelineResult<Self> {
        let reduction = reduce_by_quarter(dataset)?;

        let mut quarter_timesteps = self.quarter_timesteps;
        for (quarter, count) in reduction.quarter_timesteps {
            *quarter_timesteps.entry(quarter).or_default() += count;
        }

        Ok(Self {
            sums: merge_outer(&self.sums, &reduction.sums)?,
            timesteps: self.timesteps + dataset.timesteps() as u64,
            quarter_timesteps,
            contributing_tags: self.contributing_tags + usize::from(dataset.timesteps() > 0),
        })
    }

    /// Normalize the sums and mask zeros as missing.
    ///
    /// Fails with [`PipelineError::NoContributingTags`] when no timestep was
    /// folded in, since the average would be a division by zero.
    pub fn finalize(self, normalization: Normalization) -> PipelineResult<QuarterlyField> {
        if self.timesteps == 0 {
            return Err(PipelineError::NoContributingTags);
        }

        let mut field = self.sums;
        match normalization {
            Normalization::TotalTimesteps => {
                let total = self.timesteps as f64;
                field.values.mapv_inplace(|v| v / total);
            }
            Normalization::PerQuarterTimesteps => {
                for (quarter, mut row) in field.quarters.iter().zip(field.values.rows_mut()) {
                    let count = self
                        .quarter_timesteps
                        .get(quarter)
                        .copied()
                        .filter(|&n| n > 0)
                        .ok_or_else(|| {
                            PipelineError::malformed(
                                "accumulator state",
                                format!("quarter {} has sums but no timesteps", quarter),
                            )
                        })?;
                    let count = count as f64;
                    row.mapv_inplace(|v| v / count);
                }
            }
        }

        mask_zeros(&mut field);
        Ok(field)
    }
}

/// Sum one tag's states over time within each calendar quarter.
///
/// Missing (NaN) values count as 0. Cells are re-ordered ascending; the
/// result only holds quarters that have at least one timestep.
pub fn reduce_by_quarter(dataset: &SourceDataset) -> PipelineResult<QuarterlyReduction> {
    let context = format!("tag {}", dataset.tag);

    // Sort the cell axis and reject duplicates
    let mut order: Vec<usize> = (0..dataset.cell_ids.len()).collect();
    order.sort_by_key(|&i| dataset.cell_ids[i]);
    let cell_ids: Vec<CellId> = order.iter().map(|&i| dataset.cell_ids[i]).collect();
    if let Some(pair) = cell_ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(PipelineError::malformed(
            &context,
            format!("duplicate cell id {}", pair[0]),
        ));
    }

    let row_quarters: Vec<Quarter> = dataset.times.iter().map(Quarter::of).collect();
    let mut quarter_timesteps: BTreeMap<Quarter, u64> = BTreeMap::new();
    for quarter in &row_quarters {
        *quarter_timesteps.entry(*quarter).or_default() += 1;
    }
    let quarters: Vec<Quarter> = quarter_timesteps.keys().copied().collect();

    let mut values = Array2::<f64>::zeros((quarters.len(), cell_ids.len()));
    for (row, quarter) in dataset.states.rows().into_iter().zip(&row_quarters) {
        // `quarters` was built from `row_quarters`, so the lookup always hits
        let q = quarters.binary_search(quarter).unwrap_or_else(|i| i);
        for (c, &src) in order.iter().enumerate() {
            let value = row[src];
            if value.is_nan() {
                continue;
            }
            if value.is_infinite() {
                return Err(PipelineError::malformed(
                    &context,
                    format!("infinite state value at cell {}", dataset.cell_ids[src]),
                ));
            }
            values[[q, c]] += value;
            if !values[[q, c]].is_finite() {
                return Err(PipelineError::malformed(
                    &context,
                    format!("sum overflows in quarter {} at cell {}", quarter, cell_ids[c]),
                ));
            }
        }
    }

    Ok(QuarterlyReduction {
        sums: QuarterlyField::new(quarters, cell_ids, values)?,
        quarter_timesteps,
    })
}

/// Outer union of two fields: values are summed where both have the same
/// (quarter, cell) and carried through where only one does.
///
/// Fails when a summed value overflows to infinity.
pub fn merge_outer(a: &QuarterlyField, b: &QuarterlyField) -> PipelineResult<QuarterlyField> {
    let quarters = union_sorted(&a.quarters, &b.quarters);
    let cell_ids = union_sorted(&a.cell_ids, &b.cell_ids);

    let mut values = Array2::<f64>::zeros((quarters.len(), cell_ids.len()));
    for operand in [a, b] {
        let q_index = positions(&operand.quarters, &quarters);
        let c_index = positions(&operand.cell_ids, &cell_ids);
        for ((i, j), value) in operand.values.indexed_iter() {
            let (q, c) = (q_index[i], c_index[j]);
            values[[q, c]] += *value;
            if !values[[q, c]].is_finite() {
                return Err(PipelineError::malformed(
                    "accumulator state",
                    format!("sum overflows in quarter {} at cell {}", quarters[q], cell_ids[c]),
                ));
            }
        }
    }

    Ok(QuarterlyField {
        quarters,
        cell_ids,
        values,
    })
}

/// Replace every exact zero by NaN.
///
/// A true zero cannot be told apart from "never observed" once missing
/// values have been summed as 0, so both are reported as missing.
pub fn mask_zeros(field: &mut QuarterlyField) {
    field
        .values
        .mapv_inplace(|v| if v == 0.0 { f64::NAN } else { v });
}

/// Result of a full accumulation pass.
#[derive(Debug, Clone)]
pub struct Aggregate {
    /// Finalized quarterly average.
    pub field: QuarterlyField,
    pub contributing_tags: usize,
    pub skipped_tags: usize,
    pub timesteps: u64,
    pub normalization: Normalization,
}

/// Fold every tag's dataset into a finalized quarterly average.
///
/// Tags without states are skipped. The result does not depend on the order
/// of `tags` beyond floating-point rounding.
pub fn accumulate<C: SourceCatalog + ?Sized>(
    catalog: &C,
    tags: &[Tag],
    normalization: Normalization,
    show_progress: bool,
) -> PipelineResult<Aggregate> {
    let progress = if show_progress {
        let pb = ProgressBar::new(tags.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tags ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut skipped_tags = 0;
    let state = tags
        .iter()
        .enumerate()
        .try_fold(AccumulatorState::default(), |state, (idx, tag)| -> PipelineResult<_> {
            progress.inc(1);
            if !catalog.has_states(tag) {
                debug!("No states.zarr found for {}", tag);
                skipped_tags += 1;
                return Ok(state);
            }
            debug!("Processing tag {} ({}/{})", tag, idx + 1, tags.len());

            let dataset = catalog.open_dataset(tag)?;
            state.fold(&dataset)
        })?;
    progress.finish_and_clear();

    let contributing_tags = state.contributing_tags;
    let timesteps = state.timesteps;
    let field = state.finalize(normalization)?;

    info!(
        "Aggregated {} tags ({} skipped, {} timesteps) into {} quarters x {} cells",
        contributing_tags,
        skipped_tags,
        timesteps,
        field.quarters.len(),
        field.cell_ids.len()
    );

    Ok(Aggregate {
        field,
        contributing_tags,
        skipped_tags,
        timesteps,
        normalization,
    })
}

/// Sorted union of two sorted, duplicate-free slices.
fn union_sorted<T: Ord + Copy>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len().max(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Index in `superset` of every element of `subset` (both sorted).
fn positions<T: Ord>(subset: &[T], superset: &[T]) -> Vec<usize> {
    let mut out = Vec::with_capacity(subset.len());
    let mut k = 0;
    for item in subset {
        while superset[k] != *item {
            k += 1;
        }
        out.push(k);
    }
    out
}
