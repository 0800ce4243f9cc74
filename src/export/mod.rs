//! Tabular export of a quarterly field, one parquet table per quarter.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{CellId, Quarter, QuarterlyField};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use tracing::debug;

pub const CELL_IDS_COLUMN: &str = "cell_ids";
pub const STATES_COLUMN: &str = "states";

/// States at or below this value are dropped from the tables.
pub const DEFAULT_THRESHOLD: f64 = 1e-7;

/// Rows of one quarter that survived filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarterTable {
    pub quarter: Quarter,
    pub cell_ids: Vec<CellId>,
    pub states: Vec<f64>,
}

impl QuarterTable {
    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }
}

/// Whether a state value is exported.
pub fn keep_row(state: f64, threshold: f64) -> bool {
    state.is_finite() && state > threshold
}

/// Flatten each quarter of the field to `(cell_ids, states)` rows, keeping
/// only rows whose state passes [`keep_row`].
pub fn quarter_tables(field: &QuarterlyField, threshold: f64) -> Vec<QuarterTable> {
    field
        .quarters
        .iter()
        .zip(field.values.rows())
        .map(|(&quarter, row)| {
            let (cell_ids, states) = field
                .cell_ids
                .iter()
                .zip(row.iter())
                .filter(|(_, &state)| keep_row(state, threshold))
                .map(|(&cell, &state)| (cell, state))
                .unzip();
            let table = QuarterTable {
                quarter,
                cell_ids,
                states,
            };
            debug!(
                "Quarter {}: kept {} of {} cells",
                quarter,
                table.len(),
                field.cell_ids.len()
            );
            table
        })
        .collect()
}

/// Arrow schema of every exported table.
pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(CELL_IDS_COLUMN, DataType::UInt64, false),
        Field::new(STATES_COLUMN, DataType::Float64, false),
    ]))
}

/// Encode a table as SNAPPY-compressed parquet, without an index column.
pub fn to_parquet(table: &QuarterTable) -> PipelineResult<Vec<u8>> {
    let schema = schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(table.cell_ids.clone())),
        Arc::new(Float64Array::from(table.states.clone())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| PipelineError::Parquet(e.to_string()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
        .map_err(|e| PipelineError::Parquet(e.to_string()))?;
    writer
        .write(&batch)
        .map_err(|e| PipelineError::Parquet(e.to_string()))?;
    writer
        .close()
        .map_err(|e| PipelineError::Parquet(e.to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn q(n: u8) -> Quarter {
        Quarter::new(n).unwrap()
    }

    #[test]
    fn test_keep_row_threshold() {
        assert!(!keep_row(1e-7, DEFAULT_THRESHOLD));
        assert!(keep_row(1.000001e-7, DEFAULT_THRESHOLD));
        assert!(!keep_row(0.0, DEFAULT_THRESHOLD));
        assert!(!keep_row(-0.5, DEFAULT_THRESHOLD));
        assert!(!keep_row(f64::NAN, DEFAULT_THRESHOLD));
        assert!(!keep_row(f64::INFINITY, DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_quarter_tables_filters_rows() {
        let field = QuarterlyField::new(
            vec![q(1), q(2)],
            vec![3, 5, 8],
            array![[0.5, f64::NAN, 1e-7], [1.000001e-7, 2.0, 1e-9]],
        )
        .unwrap();

        let tables = quarter_tables(&field, DEFAULT_THRESHOLD);

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].quarter, q(1));
        assert_eq!(tables[0].cell_ids, vec![3]);
        assert_eq!(tables[0].states, vec![0.5]);
        assert_eq!(tables[1].cell_ids, vec![3, 5]);
        assert_eq!(tables[1].states, vec![1.000001e-7, 2.0]);
    }

    #[test]
    fn test_quarter_with_no_surviving_rows() {
        let field = QuarterlyField::new(vec![q(4)], vec![1], array![[f64::NAN]]).unwrap();
        let tables = quarter_tables(&field, DEFAULT_THRESHOLD);
        assert_eq!(tables.len(), 1);
        assert!(tables[0].is_empty());
        assert!(to_parquet(&tables[0]).is_ok());
    }

    #[test]
    fn test_parquet_read_back() {
        let table = QuarterTable {
            quarter: q(2),
            cell_ids: vec![7, 9, 11],
            states: vec![0.25, 1.5, 3.0],
        };
        let bytes = to_parquet(&table).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_q2.parquet");
        std::fs::write(&path, &bytes).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);

        let batch = &batches[0];
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).name(), CELL_IDS_COLUMN);
        assert_eq!(batch.schema().field(1).name(), STATES_COLUMN);

        let cells = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        let states = batch
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(cells.values().to_vec(), vec![7, 9, 11]);
        assert_eq!(states.values().to_vec(), vec![0.25, 1.5, 3.0]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let table = QuarterTable {
            quarter: q(1),
            cell_ids: vec![1, 2],
            states: vec![0.5, 0.75],
        };
        assert_eq!(to_parquet(&table).unwrap(), to_parquet(&table).unwrap());
    }
}
