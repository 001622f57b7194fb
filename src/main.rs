use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use safeops_anomaly::config::Config;
use safeops_anomaly::detect::RunRecord;

#[derive(Parser)]
#[command(
    name = "safeops-anomaly",
    about = "Per-pipeline anomaly scoring for CI/CD runs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to SAFEOPS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Score one JSON run record and print the report
    Score {
        /// File containing the run record, or "-" for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },

    /// Train (or reuse) models for a pipeline
    Train {
        /// Pipeline id
        #[arg(long)]
        pipeline: String,
    },

    /// Show the most recent anomaly reports
    Reports {
        /// Only this pipeline
        #[arg(long)]
        pipeline: Option<String>,

        /// Number of reports
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show run and anomaly counts
    Stats {
        /// Only this pipeline
        #[arg(long)]
        pipeline: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_record(input: &str) -> Result<RunRecord> {
    let raw = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read run record from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read {}", input))?
    };
    let record: RunRecord = serde_json::from_str(&raw).context("invalid run record")?;
    if record.pipeline_id.trim().is_empty() {
        anyhow::bail!("run record has no pipeline id");
    }
    Ok(record)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting safeops-anomaly");
            safeops_anomaly::serve(config).await?;
        }
        Commands::Score { input } => {
            let record = read_record(&input)?;
            let engine = safeops_anomaly::open_engine(&config).await?;
            let report = engine.evaluate(record).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Train { pipeline } => {
            let engine = safeops_anomaly::open_engine(&config).await?;
            let outcome = engine.train(&pipeline).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Reports { pipeline, limit } => {
            let engine = safeops_anomaly::open_engine(&config).await?;
            let reports = engine.list_reports(pipeline, limit.clamp(1, 200)).await?;
            if reports.is_empty() {
                println!("No reports found.");
            } else {
                println!("{:<25} | {:<20} | {:<20} | {:<6} | Anomaly", "Created", "Pipeline", "Model", "Score");
                println!("{:-<25}-|-{:-<20}-|-{:-<20}-|-{:-<6}-|-{:-<7}", "", "", "", "", "");
                for r in reports {
                    println!(
                        "{:<25} | {:<20} | {:<20} | {:<6.3} | {}",
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.pipeline_id,
                        r.model,
                        r.score,
                        r.is_anomaly
                    );
                }
            }
        }
        Commands::Stats { pipeline } => {
            let engine = safeops_anomaly::open_engine(&config).await?;
            let stats = engine.stats(pipeline).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
