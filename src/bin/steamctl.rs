use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use steam_harvest::backfill;
use steam_harvest::client::SteamClient;
use steam_harvest::db::Db;
use steam_harvest::error::PipelineError;
use steam_harvest::gaps;
use steam_harvest::harvester::{self, BatchWriter, DetailFetcher, ReviewFetcher};
use steam_harvest::loader::BulkLoader;
use steam_harvest::util::env as env_util;
use steam_harvest::validation;
use steam_harvest::{analyzer, checkpoint::CheckpointStore};

#[derive(Parser, Debug)]
#[command(name = "steamctl", version, about = "Steam catalog ETL pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Harvest appdetails for the full catalog (resumable)
    HarvestDetails {
        /// Directory for checkpoint files and the cached catalog listing
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
        /// Directory for the numbered batch files
        #[arg(long, default_value = "data/games")]
        out_dir: PathBuf,
        /// Records per batch file
        #[arg(long)]
        batch_size: Option<usize>,
        /// Only process the first N catalog entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Harvest review summaries for the full catalog (resumable)
    HarvestReviews {
        /// Directory for checkpoint files and the cached catalog listing
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
        /// Directory for the numbered batch files
        #[arg(long, default_value = "data/reviews")]
        out_dir: PathBuf,
        /// Records per batch file
        #[arg(long)]
        batch_size: Option<usize>,
        /// Only process the first N catalog entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Structural analysis of a batch file or directory
    Analyze {
        /// Batch file or directory of batch files
        path: PathBuf,
        /// Number of records to keep as verbatim samples
        #[arg(long, default_value_t = 3)]
        samples: usize,
        /// Also write the report as JSON to this path
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
    /// Three-phase bulk load of harvested batches into the store
    Import {
        /// Directory of appdetails batch files
        #[arg(long, default_value = "data/games")]
        games_dir: PathBuf,
        /// Directory of review batch files (skipped when absent)
        #[arg(long)]
        reviews_dir: Option<PathBuf>,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Compare review-side appids against the store and write the gap list
    FindGaps {
        /// Directory of review batch files
        #[arg(long, default_value = "data/reviews")]
        reviews_dir: PathBuf,
        /// Output file, one missing appid per line
        #[arg(long, default_value = "missing_appids.txt")]
        out: PathBuf,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Re-harvest the appids in a gap file, then load the recovered batches
    Backfill {
        /// Gap file produced by find-gaps
        #[arg(long, default_value = "missing_appids.txt")]
        gap_file: PathBuf,
        /// Directory for backfill checkpoint files
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
        /// Directory for the recovered batch files
        #[arg(long, default_value = "data/backfill")]
        out_dir: PathBuf,
        /// Records per batch file
        #[arg(long)]
        batch_size: Option<usize>,
        /// Harvest only; skip the loader pass over the recovered batches
        #[arg(long, default_value_t = false)]
        skip_load: bool,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Run the validation stages and write the report
    Validate {
        /// Directory of appdetails batch files (stages 1-3)
        #[arg(long, default_value = "data/games")]
        games_dir: PathBuf,
        /// Run a single stage (1-5) instead of the full sequence
        #[arg(long)]
        stage: Option<u8>,
        /// Directory for the markdown and JSON report files
        #[arg(long, default_value = ".")]
        report_dir: PathBuf,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Print row counts for the core tables
    DbCounts {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
}

/// Tuning knobs logged (redacted) before a harvest starts. All have
/// defaults, so none are required.
const HARVEST_TUNING_KEYS: &[&str] = &[
    "API_DELAY_SECONDS",
    "API_MAX_RETRIES",
    "API_BACKOFF_BASE_SECONDS",
    "API_SAVE_BATCH_SIZE",
    "API_HTTP_TIMEOUT_SECS",
];

async fn connect(db_url: Option<String>) -> Result<Db> {
    match db_url {
        Some(url) => {
            let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5u32);
            Db::connect(&url, max_conns).await
        }
        None => Db::connect_from_env().await,
    }
}

/// Ctrl-c sets the stop flag; harvest loops honor it at the top of the
/// per-item loop and flush their partial batch on the way out.
fn stop_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current item then stopping");
            handle.store(true, Ordering::Relaxed);
        }
    });
    stop
}

fn batch_size(arg: Option<usize>) -> usize {
    arg.unwrap_or_else(|| env_util::env_parse("API_SAVE_BATCH_SIZE", 500usize))
}

async fn catalog_queue(
    client: &SteamClient,
    state_dir: &std::path::Path,
    limit: Option<usize>,
) -> Result<Vec<i64>> {
    let cache = state_dir.join("app_list.json");
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    let mut queue = client.app_list(&cache).await?;
    if let Some(limit) = limit {
        queue.truncate(limit);
    }
    info!(appids = queue.len(), "catalog queue ready");
    Ok(queue)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    steam_harvest::tracing::init_tracing("info")?;

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        // Integrity/infrastructure failures get a distinct exit code so
        // wrapper scripts can tell "look at the store" from "look at the run".
        let fatal = err
            .downcast_ref::<PipelineError>()
            .is_some_and(PipelineError::is_fatal);
        error!(error = %format!("{err:#}"), fatal, "command failed");
        std::process::exit(if fatal { 2 } else { 1 });
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::HarvestDetails {
            state_dir,
            out_dir,
            batch_size: bs,
            limit,
        } => {
            env_util::preflight_check("harvest-details", &[], HARVEST_TUNING_KEYS)?;
            let client = SteamClient::from_env()?;
            let queue = catalog_queue(&client, &state_dir, limit).await?;
            let mut checkpoints = CheckpointStore::open(&state_dir, "processed")?;
            let mut writer = BatchWriter::new(&out_dir, "steam_data", batch_size(bs))?;
            let stop = stop_flag();
            let fetcher = DetailFetcher(&client);
            let summary =
                harvester::run(&queue, &fetcher, &mut checkpoints, &mut writer, &stop).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::HarvestReviews {
            state_dir,
            out_dir,
            batch_size: bs,
            limit,
        } => {
            env_util::preflight_check("harvest-reviews", &[], HARVEST_TUNING_KEYS)?;
            let client = SteamClient::from_env()?;
            let queue = catalog_queue(&client, &state_dir, limit).await?;
            let mut checkpoints = CheckpointStore::open(&state_dir, "processed_reviews")?;
            let mut writer = BatchWriter::new(&out_dir, "steam_reviews", batch_size(bs))?;
            let stop = stop_flag();
            let fetcher = ReviewFetcher(&client);
            let summary =
                harvester::run(&queue, &fetcher, &mut checkpoints, &mut writer, &stop).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Analyze {
            path,
            samples,
            json_out,
        } => {
            let report = analyzer::analyze(&path, samples)?;
            println!("{}", report.render(&path.display().to_string()));
            if let Some(json_path) = json_out {
                std::fs::write(&json_path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("writing {}", json_path.display()))?;
                info!(path = %json_path.display(), "analysis report written");
            }
        }
        Commands::Import {
            games_dir,
            reviews_dir,
            db_url,
        } => {
            let db = connect(db_url).await?;
            let loader = BulkLoader::new(db.clone());
            let games = loader.load_games(&games_dir).await?;
            println!("games: {games}");
            if let Some(reviews_dir) = reviews_dir {
                let reviews = loader.load_reviews(&reviews_dir).await?;
                println!("reviews: {reviews}");
            }
            for (table, count) in db.table_counts().await? {
                println!("{table:<28} {count:>10}");
            }
        }
        Commands::FindGaps {
            reviews_dir,
            out,
            db_url,
        } => {
            let db = connect(db_url).await?;
            let missing = gaps::find_gaps(&db, &reviews_dir, &out).await?;
            println!("{} missing appids written to {}", missing.len(), out.display());
        }
        Commands::Backfill {
            gap_file,
            state_dir,
            out_dir,
            batch_size: bs,
            skip_load,
            db_url,
        } => {
            let client = SteamClient::from_env()?;
            let stop = stop_flag();
            let summary =
                backfill::run(&client, &gap_file, &state_dir, &out_dir, batch_size(bs), &stop)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if skip_load || summary.batches_written == 0 {
                return Ok(());
            }
            let db = connect(db_url).await?;
            let loader = BulkLoader::new(db);
            let loaded = loader.load_games(&out_dir).await?;
            println!("recovered: {loaded}");
        }
        Commands::Validate {
            games_dir,
            stage,
            report_dir,
            db_url,
        } => {
            // Stages 4 and 5 are the only ones that touch the store.
            let needs_db = stage.is_none() || matches!(stage, Some(4) | Some(5));
            let db = if needs_db {
                Some(connect(db_url).await?)
            } else {
                None
            };
            let report = validation::run(&games_dir, db.as_ref(), stage).await?;
            std::fs::create_dir_all(&report_dir)?;
            let md_path = report_dir.join("validation_report.md");
            let json_path = report_dir.join("validation_report.json");
            std::fs::write(&md_path, report.render_markdown())?;
            std::fs::write(&json_path, report.to_json()?)?;
            info!(
                md = %md_path.display(),
                json = %json_path.display(),
                "validation report written"
            );
            println!("overall: {}", report.overall());
            if report.overall() >= validation::Severity::Error {
                std::process::exit(1);
            }
        }
        Commands::DbCounts { db_url } => {
            let db = connect(db_url).await?;
            for (table, count) in db.table_counts().await? {
                println!("{table:<28} {count:>10}");
            }
        }
    }
    Ok(())
}
