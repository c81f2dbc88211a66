use std::error::Error;
use std::path::Path;

use analiza_ingest::config::JobConfig;
use analiza_ingest::dataset::Dataset;
use analiza_ingest::db::engine::DbEngine;
use analiza_ingest::db::loader::MeasurementLoader;
use analiza_ingest::error::LoadError;
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the job configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,
}

/// Run this job after each analysis finishes, once the CSV exports exist.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let env_file = format!(".env/{}.env", args.env);
    if Path::new(&env_file).exists() {
        dotenvy::from_path(Path::new(&env_file))?;
    }

    let config = JobConfig::from_path(&args.config)?;
    info!(
        "connecting to database {} on server {} as {}",
        config.database, config.host_name, config.user_name
    );

    let engine = DbEngine::new(&config);
    // Fail fast before touching any CSV if the store is unreachable.
    engine.connect().await?;
    info!("database connection successful");

    let loader = MeasurementLoader { engine };
    for name in &config.list_of_tables {
        let dataset = match Dataset::from_csv_path(name, &config.csv_path(name)) {
            Ok(ds) => ds,
            Err(e) => {
                error!("skipping table {}: cannot read CSV: {}", name, e);
                continue;
            }
        };
        match loader.load(&dataset).await {
            Ok(()) => {}
            // No table can load if the store itself went away.
            Err(e @ LoadError::Connection(_)) => return Err(e.into()),
            Err(e) => error!("loading {} failed: {}", name, e),
        }
    }

    Ok(())
}
