//! Zarr array stores for source datasets and quarterly fields.
//!
//! A quarterly field store is a Zarr V3 hierarchy holding three arrays:
//! `quarter` (int64), `cell_ids` (uint64) and `states` (float64,
//! `[quarter, cells]`, NaN fill). Dimension names are recorded in the
//! `_ARRAY_DIMENSIONS` attribute of every array so the stores stay
//! readable by xarray.
//!
//! Source datasets use the same layout with a `time` axis in place of
//! `quarter`; the time coordinate is CF-encoded (see [`time`]).

pub mod time;

use self::time::TimeEncoding;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CellId, Quarter, QuarterlyField, SourceDataset, Tag};
use ndarray::Array2;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue, ZARR_NAN_F64};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs::storage::store::FilesystemStore;
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

/// Attribute carrying the dimension names of an array.
pub const DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

pub const STATES: &str = "states";
pub const CELL_IDS: &str = "cell_ids";
pub const QUARTER: &str = "quarter";
pub const TIME: &str = "time";
pub const CELLS_DIM: &str = "cells";

/// Upper bound on the number of cells per chunk.
const CHUNK_CELLS: u64 = 262_144;

type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

/// A quarterly field read back from disk, with its metadata.
#[derive(Debug, Clone)]
pub struct StoredField {
    pub field: QuarterlyField,
    /// Attributes of the `states` array, excluding dimension names.
    pub attributes: Map<String, Value>,
}

/// Write a quarterly field, replacing any store already at `path`.
pub fn write_field(
    path: &Path,
    field: &QuarterlyField,
    attributes: Map<String, Value>,
) -> PipelineResult<()> {
    let store = create_store(path)?;

    GroupBuilder::new()
        .attributes(attributes.clone())
        .build(store.clone(), "/")
        .map_err(|e| PipelineError::store(path, e))?
        .store_metadata()
        .map_err(|e| PipelineError::store(path, e))?;

    let quarters: Vec<i64> = field.quarters.iter().map(|q| i64::from(q.number())).collect();
    let quarter_array = create_array(
        &store,
        path,
        QUARTER,
        vec![quarters.len() as u64],
        DataType::Int64,
        FillValue::from(0i64),
        &[QUARTER],
        Map::new(),
    )?;
    store_elements(&quarter_array, path, &quarters)?;

    let cell_array = create_array(
        &store,
        path,
        CELL_IDS,
        vec![field.cell_ids.len() as u64],
        DataType::UInt64,
        FillValue::from(0u64),
        &[CELLS_DIM],
        Map::new(),
    )?;
    store_elements(&cell_array, path, &field.cell_ids)?;

    let states_array = create_array(
        &store,
        path,
        STATES,
        vec![field.quarters.len() as u64, field.cell_ids.len() as u64],
        DataType::Float64,
        FillValue::from(ZARR_NAN_F64),
        &[QUARTER, CELLS_DIM],
        attributes,
    )?;
    let values: Vec<f64> = field.values.iter().copied().collect();
    store_elements(&states_array, path, &values)?;

    debug!(
        path = %path.display(),
        quarters = field.quarters.len(),
        cells = field.cell_ids.len(),
        "Wrote quarterly field"
    );
    Ok(())
}

/// Read a quarterly field written by [`write_field`].
pub fn read_field(path: &Path) -> PipelineResult<StoredField> {
    let store = open_store(path)?;
    let context = path.display().to_string();

    let states = open_array(&store, path, STATES)?;
    let dims = dimensions(&states, &context)?;
    if dims.len() != 2 || dims[0] != QUARTER {
        return Err(PipelineError::MissingAxis {
            context,
            axis: QUARTER.to_string(),
        });
    }

    let quarter_values: Vec<i64> = retrieve_elements(&open_array(&store, path, QUARTER)?, path)?;
    let quarters = quarter_values
        .iter()
        .map(|&q| {
            u8::try_from(q)
                .ok()
                .and_then(Quarter::new)
                .ok_or_else(|| PipelineError::malformed(&context, format!("invalid quarter {}", q)))
        })
        .collect::<PipelineResult<Vec<_>>>()?;

    let cell_ids: Vec<CellId> = retrieve_elements(&open_array(&store, path, CELL_IDS)?, path)?;
    let values: Vec<f64> = retrieve_elements(&states, path)?;
    let values = Array2::from_shape_vec((quarters.len(), cell_ids.len()), values)
        .map_err(|e| PipelineError::malformed(&context, e.to_string()))?;

    let mut attributes = states.attributes().clone();
    attributes.remove(DIMENSIONS_ATTR);

    Ok(StoredField {
        field: QuarterlyField::new(quarters, cell_ids, values)?,
        attributes,
    })
}

/// Read one tag's `states.zarr` store.
///
/// The `states` array may be laid out `[time, cells]` or `[cells, time]`;
/// float32 values are widened to float64.
pub fn read_source_dataset(path: &Path, tag: &Tag) -> PipelineResult<SourceDataset> {
    let store = open_store(path)?;
    let context = format!("tag {}", tag);

    let states = open_array(&store, path, STATES)?;
    let dims = dimensions(&states, &context)?;
    let time_axis = dims
        .iter()
        .position(|d| d == TIME)
        .ok_or_else(|| PipelineError::MissingAxis {
            context: context.clone(),
            axis: TIME.to_string(),
        })?;
    if dims.len() != 2 {
        return Err(PipelineError::malformed(
            &context,
            format!("expected 2 dimensions (time, cells), found {:?}", dims),
        ));
    }

    let time_array = open_array(&store, path, TIME)?;
    let times = decode_times(&time_array, path, &context)?;
    let cell_ids = read_cell_ids(&open_array(&store, path, CELL_IDS)?, path, &context)?;

    let raw: Vec<f64> = match states.data_type() {
        DataType::Float64 => retrieve_elements(&states, path)?,
        DataType::Float32 => retrieve_elements::<f32>(&states, path)?
            .into_iter()
            .map(f64::from)
            .collect(),
        other => {
            return Err(PipelineError::malformed(
                &context,
                format!("unsupported states data type {:?}", other),
            ))
        }
    };

    let shape = if time_axis == 0 {
        (times.len(), cell_ids.len())
    } else {
        (cell_ids.len(), times.len())
    };
    let grid = Array2::from_shape_vec(shape, raw)
        .map_err(|e| PipelineError::malformed(&context, e.to_string()))?;
    let grid = if time_axis == 0 { grid } else { grid.t().to_owned() };

    SourceDataset::new(tag.clone(), times, cell_ids, grid)
}

/// Write a source dataset as `[time, cells]` with seconds-since-epoch times.
#[cfg(test)]
pub fn write_source_dataset(path: &Path, dataset: &SourceDataset) -> PipelineResult<()> {
    let store = create_store(path)?;
    GroupBuilder::new()
        .build(store.clone(), "/")
        .map_err(|e| PipelineError::store(path, e))?
        .store_metadata()
        .map_err(|e| PipelineError::store(path, e))?;

    let encoding = TimeEncoding::unix_seconds();
    let times = dataset
        .times
        .iter()
        .map(|t| encoding.encode(t))
        .collect::<PipelineResult<Vec<i64>>>()?;
    let mut time_attrs = Map::new();
    time_attrs.insert("units".to_string(), Value::from(encoding.units()));
    time_attrs.insert("calendar".to_string(), Value::from("proleptic_gregorian"));

    let time_array = create_array(
        &store,
        path,
        TIME,
        vec![times.len() as u64],
        DataType::Int64,
        FillValue::from(0i64),
        &[TIME],
        time_attrs,
    )?;
    store_elements(&time_array, path, &times)?;

    let cell_array = create_array(
        &store,
        path,
        CELL_IDS,
        vec![dataset.cell_ids.len() as u64],
        DataType::UInt64,
        FillValue::from(0u64),
        &[CELLS_DIM],
        Map::new(),
    )?;
    store_elements(&cell_array, path, &dataset.cell_ids)?;

    let states_array = create_array(
        &store,
        path,
        STATES,
        vec![dataset.times.len() as u64, dataset.cell_ids.len() as u64],
        DataType::Float64,
        FillValue::from(ZARR_NAN_F64),
        &[TIME, CELLS_DIM],
        Map::new(),
    )?;
    let values: Vec<f64> = dataset.states.iter().copied().collect();
    store_elements(&states_array, path, &values)
}

/// Remove anything at `path` and open a fresh filesystem store there.
fn create_store(path: &Path) -> PipelineResult<ReadableWritableListableStorage> {
    if path.exists() {
        debug!("Overwriting existing store at {}", path.display());
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)?;
    open_store(path)
}

fn open_store(path: &Path) -> PipelineResult<ReadableWritableListableStorage> {
    if !path.is_dir() {
        return Err(PipelineError::store(path, "store does not exist"));
    }
    let store = FilesystemStore::new(path).map_err(|e| PipelineError::store(path, e))?;
    Ok(Arc::new(store))
}

#[allow(clippy::too_many_arguments)]
fn create_array(
    store: &ReadableWritableListableStorage,
    path: &Path,
    name: &str,
    shape: Vec<u64>,
    data_type: DataType,
    fill_value: FillValue,
    dims: &[&str],
    mut attributes: Map<String, Value>,
) -> PipelineResult<StoreArray> {
    attributes.insert(
        DIMENSIONS_ATTR.to_string(),
        Value::from(dims.iter().map(|d| d.to_string()).collect::<Vec<_>>()),
    );

    // Chunk along the last (cell) axis only
    let mut chunk_shape = vec![1u64; shape.len()];
    if let (Some(chunk), Some(&len)) = (chunk_shape.last_mut(), shape.last()) {
        *chunk = len.clamp(1, CHUNK_CELLS);
    }

    let array = ArrayBuilder::new(
        shape,
        data_type,
        chunk_shape
            .try_into()
            .map_err(|e| PipelineError::store(path, e))?,
        fill_value,
    )
    .dimension_names(Some(dims.iter().copied()))
    .attributes(attributes)
    .build(store.clone(), &format!("/{}", name))
    .map_err(|e| PipelineError::store(path, e))?;

    array
        .store_metadata()
        .map_err(|e| PipelineError::store(path, e))?;
    Ok(array)
}

fn open_array(
    store: &ReadableWritableListableStorage,
    path: &Path,
    name: &str,
) -> PipelineResult<StoreArray> {
    Array::open(store.clone(), &format!("/{}", name))
        .map_err(|e| PipelineError::store(path, format!("cannot open array `{}`: {}", name, e)))
}

fn store_elements<T: zarrs::array::Element>(
    array: &StoreArray,
    path: &Path,
    elements: &[T],
) -> PipelineResult<()> {
    if elements.is_empty() {
        return Ok(());
    }
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    array
        .store_array_subset_elements::<T>(&subset, elements)
        .map_err(|e| PipelineError::store(path, e))
}

fn retrieve_elements<T: zarrs::array::ElementOwned>(
    array: &StoreArray,
    path: &Path,
) -> PipelineResult<Vec<T>> {
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    array
        .retrieve_array_subset_elements::<T>(&subset)
        .map_err(|e| PipelineError::store(path, e))
}

fn dimensions(array: &StoreArray, context: &str) -> PipelineResult<Vec<String>> {
    let dims = array
        .attributes()
        .get(DIMENSIONS_ATTR)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PipelineError::malformed(context, format!("array has no {} attribute", DIMENSIONS_ATTR))
        })?;

    dims.iter()
        .map(|d| {
            d.as_str()
                .map(String::from)
                .ok_or_else(|| PipelineError::malformed(context, "dimension names must be strings"))
        })
        .collect()
}

fn decode_times(
    array: &StoreArray,
    path: &Path,
    context: &str,
) -> PipelineResult<Vec<chrono::DateTime<chrono::Utc>>> {
    let attrs = array.attributes();
    let units = attrs
        .get("units")
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::malformed(context, "time coordinate has no units"))?;
    TimeEncoding::check_calendar(attrs.get("calendar").and_then(Value::as_str))?;
    let encoding = TimeEncoding::parse(units)?;

    let raw: Vec<i64> = match array.data_type() {
        DataType::Int64 => retrieve_elements(array, path)?,
        other => {
            return Err(PipelineError::malformed(
                context,
                format!("time coordinate must be int64, found {:?}", other),
            ))
        }
    };

    raw.into_iter().map(|v| encoding.decode(v)).collect()
}

fn read_cell_ids(array: &StoreArray, path: &Path, context: &str) -> PipelineResult<Vec<CellId>> {
    match array.data_type() {
        DataType::UInt64 => retrieve_elements(array, path),
        DataType::Int64 => retrieve_elements::<i64>(array, path)?
            .into_iter()
            .map(|id| {
                CellId::try_from(id)
                    .map_err(|_| PipelineError::malformed(context, format!("negative cell id {}", id)))
            })
            .collect(),
        other => Err(PipelineError::malformed(
            context,
            format!("unsupported cell_ids data type {:?}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ndarray::array;
    use tempfile::TempDir;

    fn sample_field() -> QuarterlyField {
        QuarterlyField::new(
            vec![Quarter::new(1).unwrap(), Quarter::new(3).unwrap()],
            vec![7, 9, 4096],
            array![[1.2, f64::NAN, 0.5], [f64::NAN, 0.2, 3.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_field_roundtrip_keeps_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("avg.zarr");
        let mut attrs = Map::new();
        attrs.insert("nside".to_string(), Value::from(4096));

        write_field(&path, &sample_field(), attrs).unwrap();
        let stored = read_field(&path).unwrap();

        assert_eq!(stored.field.quarters, sample_field().quarters);
        assert_eq!(stored.field.cell_ids, vec![7, 9, 4096]);
        assert_eq!(stored.field.values[[0, 0]], 1.2);
        assert!(stored.field.values[[0, 1]].is_nan());
        assert!(stored.field.values[[1, 0]].is_nan());
        assert_eq!(stored.field.values[[1, 2]], 3.0);
        assert_eq!(stored.attributes.get("nside"), Some(&Value::from(4096)));
        assert!(stored.attributes.get(DIMENSIONS_ATTR).is_none());
    }

    #[test]
    fn test_write_field_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("avg.zarr");
        std::fs::create_dir_all(path.join("stale")).unwrap();
        std::fs::write(path.join("stale").join("junk"), b"x").unwrap();

        write_field(&path, &sample_field(), Map::new()).unwrap();

        assert!(!path.join("stale").exists());
        assert!(read_field(&path).is_ok());
    }

    #[test]
    fn test_read_missing_store() {
        let dir = TempDir::new().unwrap();
        let result = read_field(&dir.path().join("nope.zarr"));
        assert!(matches!(result, Err(PipelineError::Store { .. })));
    }

    #[test]
    fn test_source_dataset_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("states.zarr");
        let dataset = SourceDataset::new(
            Tag::from("A18832"),
            vec![
                Utc.with_ymd_and_hms(2021, 3, 31, 23, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 4, 1, 0, 0, 0).unwrap(),
            ],
            vec![100, 5],
            array![[0.1, f64::NAN], [0.3, 0.4]],
        )
        .unwrap();

        write_source_dataset(&path, &dataset).unwrap();
        let loaded = read_source_dataset(&path, &dataset.tag).unwrap();

        assert_eq!(loaded.times, dataset.times);
        assert_eq!(loaded.cell_ids, vec![100, 5]);
        assert_eq!(loaded.states[[0, 0]], 0.1);
        assert!(loaded.states[[0, 1]].is_nan());
        assert_eq!(loaded.states[[1, 1]], 0.4);
    }

    #[test]
    fn test_source_without_time_axis() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("states.zarr");
        let store = create_store(&path).unwrap();
        let states = create_array(
            &store,
            &path,
            STATES,
            vec![2, 2],
            DataType::Float64,
            FillValue::from(ZARR_NAN_F64),
            &["step", CELLS_DIM],
            Map::new(),
        )
        .unwrap();
        store_elements(&states, &path, &[1.0f64, 2.0, 3.0, 4.0]).unwrap();

        let result = read_source_dataset(&path, &Tag::from("bad"));
        match result {
            Err(PipelineError::MissingAxis { axis, .. }) => assert_eq!(axis, "time"),
            other => panic!("expected MissingAxis, got {:?}", other),
        }
    }

    #[test]
    fn test_source_transposed_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("states.zarr");
        let store = create_store(&path).unwrap();

        let mut time_attrs = Map::new();
        time_attrs.insert("units".to_string(), Value::from("days since 2022-01-01"));
        let time = create_array(
            &store,
            &path,
            TIME,
            vec![2],
            DataType::Int64,
            FillValue::from(0i64),
            &[TIME],
            time_attrs,
        )
        .unwrap();
        store_elements(&time, &path, &[0i64, 120]).unwrap();

        let cells = create_array(
            &store,
            &path,
            CELL_IDS,
            vec![3],
            DataType::Int64,
            FillValue::from(0i64),
            &[CELLS_DIM],
            Map::new(),
        )
        .unwrap();
        store_elements(&cells, &path, &[1i64, 2, 3]).unwrap();

        // [cells, time]
        let states = create_array(
            &store,
            &path,
            STATES,
            vec![3, 2],
            DataType::Float64,
            FillValue::from(ZARR_NAN_F64),
            &[CELLS_DIM, TIME],
            Map::new(),
        )
        .unwrap();
        store_elements(&states, &path, &[1.0f64, 10.0, 2.0, 20.0, 3.0, 30.0]).unwrap();

        let loaded = read_source_dataset(&path, &Tag::from("T")).unwrap();
        assert_eq!(loaded.states.dim(), (2, 3));
        assert_eq!(loaded.states.row(0).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(loaded.states.row(1).to_vec(), vec![10.0, 20.0, 30.0]);
        assert_eq!(
            loaded.times[1],
            Utc.with_ymd_and_hms(2022, 5, 1, 0, 0, 0).unwrap()
        );
    }
}
