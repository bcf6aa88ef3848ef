//! Newswire CLI: run and inspect the news pipeline.
//!
//! Usage:
//!   newswire init [--db path] [--config file]
//!   newswire run [--stage name]
//!   newswire tick <stage>
//!   newswire status [--json]
//!   newswire list <stage> [--since time] [--limit n]
//!   newswire quarantine <list|release> ...

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use newswire::config::PipelineConfig;
use newswire::storage;
use newswire::{ArticleStore, Pipeline, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "newswire", version, about = "Staged news processing pipeline")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to SQLite database file (overrides configuration)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema
    Init,
    /// Run stage workers until interrupted
    Run {
        /// Run only this stage
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Run a single tick of one stage
    Tick {
        stage: Stage,
    },
    /// Show row counts and backlog per stage
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print recent rows of a stage as JSON lines, newest first
    List {
        stage: Stage,
        /// Only rows created after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Inspect or release quarantined records
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined upstream rows
    List {
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Make a quarantined row claimable again
    Release {
        stage: Stage,
        upstream_id: i64,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("NEWSWIRE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("newswire=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, String> {
    let mut config = PipelineConfig::load(cli.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    Ok(config)
}

async fn cmd_init(store: &Arc<dyn ArticleStore>, config: &PipelineConfig) -> i32 {
    match store.stage_stats(Stage::Ingest).await {
        Ok(_) => {
            println!("Store ready ({:?} at {})", config.store.backend, config.store.path.display());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_run(pipeline: &Pipeline, stage: Option<Stage>) -> i32 {
    let scheduler = pipeline.scheduler(stage);
    if scheduler.is_empty() {
        eprintln!("Error: no stage enabled");
        return 1;
    }
    let token = scheduler.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current ticks");
            token.cancel();
        }
    });

    match scheduler.run().await {
        Ok(totals) => {
            for report in totals {
                println!("{}", report);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_tick(pipeline: &Pipeline, stage: Stage) -> i32 {
    match pipeline.worker(stage, 0).tick().await {
        Ok(report) => {
            println!("{}", report);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_status(store: &Arc<dyn ArticleStore>, json: bool) -> i32 {
    let mut all = Vec::new();
    for stage in Stage::ALL {
        match store.stage_stats(stage).await {
            Ok(stats) => all.push(stats),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    if json {
        match serde_json::to_string_pretty(&all) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
        return 0;
    }

    println!("{:<12} {:>8} {:>8} {:>11}  {}", "STAGE", "ROWS", "BACKLOG", "QUARANTINED", "LATEST");
    for stats in all {
        let latest = stats
            .latest_created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:>8} {:>8} {:>11}  {}",
            stats.stage.as_str(),
            stats.rows,
            stats.backlog,
            stats.quarantined,
            latest
        );
    }
    0
}

async fn cmd_list(
    store: &Arc<dyn ArticleStore>,
    stage: Stage,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> i32 {
    let rows = match store.list_articles(stage, since, limit).await {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    for row in rows {
        match serde_json::to_string(&row) {
            Ok(line) => println!("{}", line),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

async fn cmd_quarantine(store: &Arc<dyn ArticleStore>, action: QuarantineAction) -> i32 {
    match action {
        QuarantineAction::List { stage } => {
            let stages: Vec<Stage> = match stage {
                Some(s) => vec![s],
                None => Stage::ALL.iter().copied().filter(|s| s.upstream().is_some()).collect(),
            };
            for stage in stages {
                let records = match store.quarantined(stage).await {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        return 1;
                    }
                };
                for record in records {
                    println!(
                        "{:<12} #{:<8} attempts={} last={} {}",
                        record.stage.as_str(),
                        record.upstream_id,
                        record.attempts,
                        record.last_failed_at.to_rfc3339(),
                        record.last_error
                    );
                }
            }
            0
        }
        QuarantineAction::Release { stage, upstream_id } => {
            match store.release_quarantine(stage, upstream_id).await {
                Ok(true) => {
                    println!("Released {} #{}", stage, upstream_id);
                    0
                }
                Ok(false) => {
                    eprintln!("Error: {} #{} is not quarantined", stage, upstream_id);
                    1
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    let store = match storage::connect(&config.store).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Init => cmd_init(&store, &config).await,
        Commands::Status { json } => cmd_status(&store, json).await,
        Commands::List { stage, since, limit } => cmd_list(&store, stage, since, limit).await,
        Commands::Quarantine { action } => cmd_quarantine(&store, action).await,
        Commands::Run { stage } => {
            let pipeline = Pipeline::new(config, Arc::clone(&store));
            cmd_run(&pipeline, stage).await
        }
        Commands::Tick { stage } => {
            let pipeline = Pipeline::new(config, Arc::clone(&store));
            cmd_tick(&pipeline, stage).await
        }
    };
    std::process::exit(code);
}
