//! The three pipeline stages: create, rotate and export.
//!
//! Every stage reads its input from the local output directory and writes
//! its artifacts through a [`DualDestination`], local copy first.

use crate::analysis::{accumulate, Aggregate};
use crate::catalog::SourceCatalog;
use crate::config::Config;
use crate::error::PipelineResult;
use crate::export::{quarter_tables, to_parquet};
use crate::models::{QuarterlyField, GRID_NAME, NSIDE};
use crate::remote::{DualDestination, ObjectUri, RemoteFilesystem};
use crate::rotation::{self, rotate_field};
use crate::store;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Attributes recorded on the aggregate store.
pub fn field_attributes(aggregate: &Aggregate) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("grid_name".to_string(), Value::from(GRID_NAME));
    attrs.insert("nside".to_string(), Value::from(NSIDE));
    attrs.insert(
        "normalization".to_string(),
        Value::from(aggregate.normalization.to_string()),
    );
    attrs.insert(
        "tags".to_string(),
        Value::from(aggregate.contributing_tags as u64),
    );
    attrs.insert("timesteps".to_string(), Value::from(aggregate.timesteps));
    attrs.insert("created_at".to_string(), Value::from(Utc::now().to_rfc3339()));
    attrs
}

fn destination<'a>(config: &Config, fs: &'a RemoteFilesystem) -> PipelineResult<DualDestination<'a>> {
    Ok(DualDestination::new(
        config.output.dir.clone(),
        ObjectUri::parse(&config.remote.base_uri)?,
        fs,
        config.remote.consolidated,
    ))
}

/// Aggregate every tag of the catalog and publish the quarterly average.
pub async fn create_groups<C: SourceCatalog + ?Sized>(
    catalog: &C,
    config: &Config,
    fs: &RemoteFilesystem,
) -> PipelineResult<Aggregate> {
    let dest = destination(config, fs)?;

    let tags = catalog.list_tags()?;
    info!("Found {} tags", tags.len());

    let aggregate = accumulate(
        catalog,
        &tags,
        config.aggregate.normalization,
        config.aggregate.show_progress,
    )?;

    let attributes = field_attributes(&aggregate);
    let uri = dest
        .write_store(&config.output.shifted_store_name(), |path| {
            store::write_field(path, &aggregate.field, attributes)
        })
        .await?;
    info!("Published aggregate to {}", uri);

    Ok(aggregate)
}

/// Rotate the stored aggregate and publish the rotated field.
pub async fn rotate_group(config: &Config, fs: &RemoteFilesystem) -> PipelineResult<QuarterlyField> {
    let dest = destination(config, fs)?;

    let stored = store::read_field(&config.output.shifted_store_path())?;
    let rotation = rotation::from_config(&config.rotation)?;
    let field = rotate_field(stored.field, rotation.as_ref())?;

    let mut attributes = stored.attributes;
    attributes.insert("rotation".to_string(), Value::from(rotation.name()));

    let uri = dest
        .write_store(&config.output.rotated_store_name(), |path| {
            store::write_field(path, &field, attributes)
        })
        .await?;
    info!("Published rotated field to {}", uri);

    Ok(field)
}

/// Export the rotated field as one parquet table per quarter.
pub async fn convert_to_parquet(
    config: &Config,
    fs: &RemoteFilesystem,
) -> PipelineResult<Vec<ObjectUri>> {
    let dest = destination(config, fs)?;

    let stored = store::read_field(&config.output.rotated_store_path())?;
    let tables = quarter_tables(&stored.field, config.export.threshold);

    let mut published = Vec::with_capacity(tables.len());
    for table in &tables {
        if table.is_empty() {
            warn!(
                "Quarter {} has no cells above {}; writing an empty table",
                table.quarter, config.export.threshold
            );
        }

        // Encoded once so both copies are byte-identical
        let bytes = to_parquet(table)?;
        let uri = dest
            .write_bytes(&config.output.parquet_name(table.quarter), &bytes)
            .await?;
        info!("Published {} rows to {}", table.len(), uri);
        published.push(uri);
    }

    Ok(published)
}
