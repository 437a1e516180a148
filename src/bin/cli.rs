//! firetrack CLI - scheduled-job entry point for the clustering pipeline
//!
//! Usage:
//!   firetrack-cli --db fires.sqlite init-version --epsilon-km 1 --min-points 3
//!   firetrack-cli --db fires.sqlite ingest detections.json
//!   firetrack-cli --db fires.sqlite run [--days-back 7]
//!   firetrack-cli --db fires.sqlite episodes [--open]
//!
//! The environment (strict parameter resolution in production) comes from
//! `FIRETRACK_ENV`.

use chrono::Utc;
use clap::{Parser, Subcommand};
use firetrack::{
    ClusteringEngine, Environment, FireStore, NewClusteringVersion, NewDetection, RunOptions,
    SqliteStore,
};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "firetrack-cli")]
#[command(about = "Cluster satellite hotspots into fire events and episodes", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, default_value = "firetrack.sqlite")]
    db: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one clustering pass
    Run {
        /// Only cluster detections from the last N days
        #[arg(long, default_value = "7")]
        days_back: i64,

        /// Cap on detections loaded in this pass
        #[arg(long)]
        max_detections: Option<usize>,

        /// Cap on unlinked events assigned in this pass
        #[arg(long)]
        max_events: Option<usize>,

        /// Only recompute touched episodes, skip ageing of quiet ones
        #[arg(long)]
        touched_only: bool,
    },

    /// Load detections from a JSON array file
    Ingest {
        /// JSON file with an array of detections
        file: PathBuf,
    },

    /// Print episodes as JSON
    Episodes {
        /// Only episodes that are not closed
        #[arg(long)]
        open: bool,
    },

    /// Insert and activate a clustering version
    InitVersion {
        #[arg(long, default_value = "1.0")]
        epsilon_km: f64,

        #[arg(long, default_value = "3")]
        min_points: u32,

        #[arg(long, default_value = "24.0")]
        temporal_window_hours: f64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SqliteStore::open(&cli.db)?;

    match &cli.command {
        Commands::Run {
            days_back,
            max_detections,
            max_events,
            touched_only,
        } => {
            let now = Utc::now();
            let mut options = RunOptions::days_back(*days_back, now);
            options.max_detections = *max_detections;
            options.max_events = *max_events;
            options.refresh_open_episodes = !touched_only;

            let engine = ClusteringEngine::new(Environment::from_env());
            let report = engine.run(&mut store, &options, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Ingest { file } => {
            let detections = read_detections(file)?;
            let ids = store.insert_detections(&detections)?;
            println!("Ingested {} detections from {}", ids.len(), file.display());
        }
        Commands::Episodes { open } => {
            let episodes: Vec<_> = store
                .list_episodes()?
                .into_iter()
                .filter(|e| !open || !e.status.is_terminal())
                .collect();
            println!("{}", serde_json::to_string_pretty(&episodes)?);
        }
        Commands::InitVersion {
            epsilon_km,
            min_points,
            temporal_window_hours,
        } => {
            let draft = NewClusteringVersion::new(*epsilon_km, *min_points, *temporal_window_hours);
            let now = Utc::now();
            draft.clone().into_version(0, now).validate()?;
            let version = store.insert_clustering_version(draft, now)?;
            println!(
                "Clustering version {} active: eps {} km, min_points {}, window {} h",
                version.id, version.epsilon_km, version.min_points, version.temporal_window_hours
            );
        }
    }

    Ok(())
}

fn read_detections(path: &Path) -> Result<Vec<NewDetection>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
