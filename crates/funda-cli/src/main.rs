use anyhow::Result;
use clap::Parser;
use funda_adapters::{OfferingType, PublicationDate, RadiusKm};
use funda_sync::{run_tracker_once, TrackerConfig, TrackerQuery};

#[derive(Debug, Parser)]
#[command(name = "funda-tracker")]
#[command(about = "Track Funda listings for one area and store them in Postgres")]
struct Cli {
    /// Four-digit postal code at the centre of the search area.
    #[arg(long = "postal_code")]
    postal_code: u32,

    /// Search radius in km: 1, 2, 5, 10, 15, 30, 50 or 100.
    #[arg(long = "km_radius")]
    km_radius: RadiusKm,

    #[arg(long = "publication_date", default_value = "now-30d")]
    publication_date: PublicationDate,

    #[arg(long = "offering_type", default_value = "buy")]
    offering_type: OfferingType,

    /// Skip the per-listing views/saves lookup.
    #[arg(long)]
    skip_listing_insights: bool,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("FUNDA_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let mut config = TrackerConfig::from_env();
    if cli.skip_listing_insights {
        config.listing_insights = false;
    }
    let query = TrackerQuery {
        postal_code: cli.postal_code,
        radius: cli.km_radius,
        publication_date: cli.publication_date,
        offering_type: cli.offering_type,
    };
    tracing::debug!(?query, table = %config.table, "starting tracker");

    let report = run_tracker_once(&config, &query).await?;
    println!("{report}");

    Ok(())
}
