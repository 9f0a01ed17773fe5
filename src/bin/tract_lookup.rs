//! Resolve one coordinate against a boundary file; prints the GEOID (or
//! nothing) on stdout. Handy for checking a geocoder result by hand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use census_tract_deid::boundary::{BoundaryIndex, DEFAULT_BOUNDARY_PATH, ENV_BOUNDARY_PATH};
use census_tract_deid::DEFAULT_LOG_FILTER;

#[derive(Parser, Debug)]
#[command(name = "tract_lookup", version, about = "Find the census tract containing a coordinate")]
struct Args {
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,

    #[arg(long, allow_negative_numbers = true)]
    lng: f64,

    #[arg(long, env = ENV_BOUNDARY_PATH, default_value = DEFAULT_BOUNDARY_PATH)]
    boundaries: PathBuf,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let index = BoundaryIndex::load(&args.boundaries)?;
    match index.locate(args.lat, args.lng) {
        Some(tract) => {
            println!("{}", tract.geoid());
            tracing::info!(geoid = tract.geoid(), name = tract.name(), "tract found");
        }
        None => {
            // logged by resolve(); keep stdout empty
            index.resolve(args.lat, args.lng);
        }
    }
    Ok(())
}
