//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.gfts-groups.toml` files.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Normalization, Quarter};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = ".gfts-groups.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where the per-tag source stores live.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Local artifact naming and location.
    #[serde(default)]
    pub output: OutputConfig,

    /// Remote object store settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Accumulator settings.
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Rotation stage settings.
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Parquet export settings.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Source catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory holding one `<tag>/states.zarr` per tag.
    #[serde(default = "default_catalog_root")]
    pub root: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            root: default_catalog_root(),
        }
    }
}

fn default_catalog_root() -> PathBuf {
    PathBuf::from("tags")
}

/// Local output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local output directory.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Base name shared by every artifact.
    #[serde(default = "default_output_name")]
    pub name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            name: default_output_name(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_name() -> String {
    "sea_bass_average".to_string()
}

impl OutputConfig {
    /// Store name of the unrotated average field.
    pub fn shifted_store_name(&self) -> String {
        format!("{}_with_shift.zarr", self.name)
    }

    /// Store name of the rotated field.
    pub fn rotated_store_name(&self) -> String {
        format!("{}.zarr", self.name)
    }

    /// File name of one quarter's parquet table.
    pub fn parquet_name(&self, quarter: Quarter) -> String {
        format!("{}_q{}.parquet", self.name, quarter)
    }

    pub fn shifted_store_path(&self) -> PathBuf {
        self.dir.join(self.shifted_store_name())
    }

    pub fn rotated_store_path(&self) -> PathBuf {
        self.dir.join(self.rotated_store_name())
    }
}

/// Backend used to reach the remote destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// S3 bucket, AWS or any S3-compatible endpoint.
    #[default]
    #[serde(alias = "http")]
    S3,
    /// Local directory standing in for the bucket.
    Mirror,
}

/// Remote object store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub backend: RemoteBackend,

    /// Base URI every artifact is published under.
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    /// S3-compatible endpoint; AWS when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bucket region; taken from the environment when unset.
    #[serde(default)]
    pub region: Option<String>,

    /// Allow plain `http://` endpoints.
    #[serde(default)]
    pub allow_http: bool,

    /// Root directory of the mirror backend.
    #[serde(default = "default_mirror_root")]
    pub mirror_root: PathBuf,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Write consolidated metadata next to published stores.
    #[serde(default = "default_true")]
    pub consolidated: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::default(),
            base_uri: default_base_uri(),
            endpoint: None,
            region: None,
            allow_http: false,
            mirror_root: default_mirror_root(),
            timeout_seconds: default_timeout(),
            consolidated: true,
        }
    }
}

fn default_base_uri() -> String {
    "s3://destine-gfts-visualisation-data/groups".to_string()
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("remote")
}

fn default_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Accumulator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(default)]
    pub normalization: Normalization,

    /// Show a progress bar over tags.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::default(),
            show_progress: true,
        }
    }
}

/// Rotation transform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationKind {
    #[default]
    Identity,
    Remap,
}

/// Rotation stage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub kind: RotationKind,

    /// JSON remap table, required when `kind = "remap"`.
    #[serde(default)]
    pub table: Option<PathBuf>,
}

/// Parquet export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Rows with a state at or below this value are dropped.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> f64 {
    crate::export::DEFAULT_THRESHOLD
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge CLI arguments over file settings.
    ///
    /// Only values given explicitly on the command line override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref root) = args.catalog {
            self.catalog.root = root.clone();
        }
        if let Some(ref dir) = args.output_dir {
            self.output.dir = dir.clone();
        }
        if let Some(ref name) = args.name {
            self.output.name = name.clone();
        }
        if let Some(ref base) = args.remote_base {
            self.remote.base_uri = base.clone();
        }
        if let Some(normalization) = args.normalization {
            self.aggregate.normalization = normalization;
        }
        if let Some(threshold) = args.threshold {
            self.export.threshold = threshold;
        }

        // Quiet mode hides the progress bar
        if args.quiet {
            self.aggregate.show_progress = false;
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.output.name.trim().is_empty() {
            return Err(PipelineError::Config("output.name must not be empty".to_string()));
        }
        if self.output.name.contains('/') {
            return Err(PipelineError::Config(format!(
                "output.name must not contain '/': {}",
                self.output.name
            )));
        }
        if let (RemoteBackend::S3, Some(endpoint)) = (self.remote.backend, &self.remote.endpoint) {
            if endpoint.starts_with("http://") {
                if !self.remote.allow_http {
                    return Err(PipelineError::Config(
                        "remote.endpoint is plain http; set remote.allow_http = true".to_string(),
                    ));
                }
            } else if !endpoint.starts_with("https://") {
                return Err(PipelineError::Config(
                    "remote.endpoint must start with 'http://' or 'https://'".to_string(),
                ));
            }
        }
        if self.remote.timeout_seconds == 0 {
            return Err(PipelineError::Config(
                "remote.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.rotation.kind == RotationKind::Remap && self.rotation.table.is_none() {
            return Err(PipelineError::Config(
                "rotation.table is required when rotation.kind = \"remap\"".to_string(),
            ));
        }
        if !self.export.threshold.is_finite() {
            return Err(PipelineError::Config(
                "export.threshold must be a finite number".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output.name, "sea_bass_average");
        assert_eq!(config.output.dir, PathBuf::from("data"));
        assert_eq!(
            config.remote.base_uri,
            "s3://destine-gfts-visualisation-data/groups"
        );
        assert_eq!(config.export.threshold, 1e-7);
        assert_eq!(config.aggregate.normalization, Normalization::TotalTimesteps);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_artifact_names() {
        let output = OutputConfig::default();
        assert_eq!(output.shifted_store_name(), "sea_bass_average_with_shift.zarr");
        assert_eq!(output.rotated_store_name(), "sea_bass_average.zarr");
        assert_eq!(
            output.parquet_name(Quarter::new(3).unwrap()),
            "sea_bass_average_q3.parquet"
        );
        assert_eq!(
            output.shifted_store_path(),
            PathBuf::from("data/sea_bass_average_with_shift.zarr")
        );
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[catalog]
root = "/data/tags"

[output]
name = "bass"

[remote]
backend = "mirror"
mirror_root = "/tmp/bucket"

[aggregate]
normalization = "per-quarter-timesteps"

[rotation]
kind = "remap"
table = "remap.json"

[export]
threshold = 0.001
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.catalog.root, PathBuf::from("/data/tags"));
        assert_eq!(config.output.name, "bass");
        assert_eq!(config.output.dir, PathBuf::from("data"));
        assert_eq!(config.remote.backend, RemoteBackend::Mirror);
        assert!(config.remote.consolidated);
        assert_eq!(
            config.aggregate.normalization,
            Normalization::PerQuarterTimesteps
        );
        assert_eq!(config.rotation.kind, RotationKind::Remap);
        assert_eq!(config.export.threshold, 0.001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s3_endpoint_checks() {
        let toml_content = r#"
[remote]
backend = "s3"
endpoint = "http://localhost:9000"
region = "eu-central-1"
"#;
        let mut config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.remote.backend, RemoteBackend::S3);
        assert_eq!(config.remote.region.as_deref(), Some("eu-central-1"));
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.remote.allow_http = true;
        assert!(config.validate().is_ok());

        config.remote.endpoint = Some("localhost:9000".to_string());
        assert!(config.validate().is_err());

        // Older files name the backend "http"
        let legacy: Config = toml::from_str("[remote]\nbackend = \"http\"\n").unwrap();
        assert_eq!(legacy.remote.backend, RemoteBackend::S3);
    }

    #[test]
    fn test_remap_requires_table() {
        let mut config = Config::default();
        config.rotation.kind = RotationKind::Remap;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_name() {
        let mut config = Config::default();
        config.output.name = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[catalog]"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[export]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.output.name, "sea_bass_average");
    }
}
