//! gfts-groups - quarterly habitat climatology for tagged fish
//!
//! Aggregates per-tag HEALPix habitat state fields into a quarterly
//! average, rotates it, and exports per-quarter parquet tables. Every
//! artifact is written to a local directory and then to the remote
//! destination.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (invalid input, store failure, partial write, etc.)

mod analysis;
mod catalog;
mod cli;
mod config;
mod error;
mod export;
mod models;
mod pipeline;
mod remote;
mod rotation;
mod store;

use anyhow::{Context, Result};
use catalog::DirectoryCatalog;
use cli::{Args, Operation};
use config::{Config, DEFAULT_CONFIG_FILE};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args)?;

    info!("gfts-groups v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args).await {
        error!("Run failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle --init-config: generate a default .gfts-groups.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to set the catalog root, output name and remote destination.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Run the selected stage.
async fn run(args: Args) -> Result<()> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    let fs = remote::get_filesystem(&config.remote)?;
    let Some(operation) = args.command else {
        anyhow::bail!("No stage selected");
    };

    match operation {
        Operation::Create => {
            println!("📥 Aggregating tags from {}", config.catalog.root.display());
            println!("   Normalization: {}", config.aggregate.normalization);

            let catalog = DirectoryCatalog::new(&config.catalog.root);
            let aggregate = pipeline::create_groups(&catalog, &config, &fs).await?;

            println!("\n📊 Aggregation Summary:");
            println!("   Tags used: {}", aggregate.contributing_tags);
            println!("   Tags without states: {}", aggregate.skipped_tags);
            println!("   Timesteps: {}", aggregate.timesteps);
            println!(
                "   Field: {} quarters x {} cells",
                aggregate.field.quarters.len(),
                aggregate.field.cell_ids.len()
            );
            println!(
                "\n✅ Saved to {}",
                config.output.shifted_store_path().display()
            );
        }
        Operation::Rotate => {
            println!(
                "🔄 Rotating {} ({:?})",
                config.output.shifted_store_path().display(),
                config.rotation.kind
            );

            let field = pipeline::rotate_group(&config, &fs).await?;
            if field.is_empty() {
                warn!("Rotated field has no quarters");
            }

            println!(
                "\n✅ Saved to {}",
                config.output.rotated_store_path().display()
            );
        }
        Operation::Export => {
            println!(
                "📝 Exporting {} (threshold {})",
                config.output.rotated_store_path().display(),
                config.export.threshold
            );

            let uris = pipeline::convert_to_parquet(&config, &fs).await?;
            for uri in &uris {
                println!("   📄 {}", uri);
            }

            println!("\n✅ Exported {} quarter tables", uris.len());
        }
    }

    println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
