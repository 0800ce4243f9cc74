//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::Normalization;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// gfts-groups - quarterly habitat climatology for tagged fish
///
/// Aggregates per-tag habitat state fields into a quarterly average,
/// rotates it and exports one parquet table per quarter. Every artifact
/// is written locally and to the remote destination.
///
/// Examples:
///   gfts-groups create --catalog ./tags
///   gfts-groups rotate
///   gfts-groups export --threshold 1e-6
///   gfts-groups --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Stage to run
    #[command(subcommand)]
    pub command: Option<Operation>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .gfts-groups.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "GFTS_GROUPS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding one <tag>/states.zarr per tag
    #[arg(long, value_name = "DIR", global = true)]
    pub catalog: Option<PathBuf>,

    /// Local output directory
    #[arg(short, long, value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Base name of every artifact
    #[arg(long, value_name = "NAME", global = true)]
    pub name: Option<String>,

    /// Remote base URI (e.g. s3://bucket/groups)
    #[arg(long, value_name = "URI", global = true)]
    pub remote_base: Option<String>,

    /// How quarterly sums are normalized
    #[arg(long, value_name = "MODE", global = true)]
    pub normalization: Option<Normalization>,

    /// Drop exported rows with a state at or below this value
    #[arg(long, value_name = "VALUE", global = true)]
    pub threshold: Option<f64>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output, no progress bar)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Generate a default .gfts-groups.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Pipeline stage selected for one invocation.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Aggregate all tags into the quarterly average
    Create,
    /// Rotate the quarterly average
    Rotate,
    /// Export the rotated field as per-quarter parquet tables
    Export,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.command.is_none() {
            return Err("A stage is required: create, rotate or export".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() {
                return Err("Threshold must be a finite number".to_string());
            }
        }

        if let Some(ref name) = self.name {
            if name.trim().is_empty() || name.contains('/') {
                return Err(format!("Invalid artifact name: '{}'", name));
            }
        }

        if let Some(ref base) = self.remote_base {
            if !base.contains("://") {
                return Err("Remote base must be a URI such as s3://bucket/prefix".to_string());
            }
        }

        // Validate catalog directory if provided
        if let Some(ref catalog) = self.catalog {
            if !catalog.is_dir() {
                return Err(format!(
                    "Catalog directory does not exist: {}",
                    catalog.display()
                ));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            command: Some(Operation::Create),
            config: None,
            catalog: None,
            output_dir: None,
            name: None,
            remote_base: None,
            normalization: None,
            threshold: None,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_parse_subcommand_and_globals() {
        let args = Args::try_parse_from([
            "gfts-groups",
            "export",
            "--threshold",
            "0.001",
            "--name",
            "bass",
            "--normalization",
            "per-quarter-timesteps",
        ])
        .unwrap();

        assert_eq!(args.command, Some(Operation::Export));
        assert_eq!(args.threshold, Some(0.001));
        assert_eq!(args.name.as_deref(), Some("bass"));
        assert_eq!(args.normalization, Some(Normalization::PerQuarterTimesteps));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_stage() {
        let mut args = make_args();
        args.command = None;
        assert!(args.validate().is_err());

        args.init_config = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_bad_values() {
        let mut args = make_args();
        args.threshold = Some(f64::NAN);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.name = Some("a/b".to_string());
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.remote_base = Some("bucket/groups".to_string());
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.catalog = Some(PathBuf::from("/definitely/not/here"));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
