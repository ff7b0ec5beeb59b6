//! ts-process: maintenance of a project's processed-record cache.
//!
//! # Commands
//!
//! - `info [--json]`: entry count, file size and per-incident fingerprint counts
//! - `purge <INCIDENT>`: delete an incident's cached records and index entry
//! - `reclaim`: compact the store file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use ts_process::config::Settings;
use ts_process::logging;
use ts_process::project::Project;

#[derive(Parser)]
#[command(name = "ts-process")]
#[command(version)]
#[command(about = "Inspect and maintain the processed-record cache of a project")]
struct Cli {
    /// Configuration file (TOML); TSPROCESS_* environment variables override it
    #[arg(short, long, default_value = "ts-process.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache statistics
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every cached record of an incident
    Purge {
        /// Incident name
        incident: String,
    },
    /// Release space left behind by deletions
    Reclaim,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init(&settings.logging);

    let mut project = Project::open(settings).context("opening project store")?;

    match cli.command {
        Commands::Info { json } => {
            let stats = project.store().stats()?;
            let tracker = project.tracker();
            let mut incidents = BTreeMap::new();
            for incident in tracker.tracked_incidents()? {
                let count = tracker.tracked_fingerprints(&incident)?.len();
                incidents.insert(incident, count);
            }

            if json {
                let report = serde_json::json!({
                    "project": project.name(),
                    "store": project.store().path(),
                    "stats": stats,
                    "incidents": incidents,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("project:   {}", project.name());
                println!("store:     {}", project.store().path().display());
                println!("entries:   {}", stats.entries);
                println!(
                    "pages:     {} ({} free)",
                    stats.page_count, stats.freelist_pages
                );
                for (incident, count) in &incidents {
                    println!("  {:<24} {}", incident, count);
                }
            }
        }
        Commands::Purge { incident } => {
            let removed = project
                .remove_incident(&incident)
                .with_context(|| format!("purging incident '{}'", incident))?;
            println!("removed {} records of '{}'", removed, incident);
        }
        Commands::Reclaim => {
            let before = project.store().stats()?;
            project.store().reclaim()?;
            let after = project.store().stats()?;
            println!("pages: {} -> {}", before.page_count, after.page_count);
        }
    }

    project.close()?;
    Ok(())
}
