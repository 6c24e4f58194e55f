use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};

use reelsmith::config::OrchestratorConfig;
use reelsmith::database::Database;
use reelsmith::domain::{JobKind, JobStatus};
use reelsmith::{Orchestrator, SubmitRequest, logging};

/// How often `serve` purges old terminal jobs.
const PURGE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "REELSMITH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `reelsmith=debug,sqlx=warn`
    #[arg(long, global = true, env = "REELSMITH_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator until interrupted
    Serve,
    /// Submit a new job
    Submit {
        /// script-only, full-video, shorts-conversion or crawl
        #[arg(short, long)]
        kind: JobKind,
        #[arg(short, long)]
        title: String,
        #[arg(short, long, default_value = "cli")]
        owner: String,
        /// JSON object handed to the workers
        #[arg(short, long)]
        payload: Option<String>,
        /// Earliest start time (RFC 3339)
        #[arg(long)]
        run_at: Option<DateTime<Utc>>,
        #[arg(long)]
        schedule_id: Option<String>,
        /// Higher runs first
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },
    /// Show a job with its stages and logs
    Status { job_id: String },
    /// List jobs, newest first
    List {
        #[arg(short, long)]
        status: Option<JobStatus>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Cancel a job
    Cancel { job_id: String },
    /// Re-arm the failed stage of a failed or abandoned job
    Requeue { job_id: String },
    /// Job counts by kind and status plus stuck-stage report
    Summary,
    /// Delete terminal jobs older than the retention period
    Purge {
        /// Override the configured retention, in days
        #[arg(long)]
        older_than_days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config =
        OrchestratorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let (logging_config, _guard) =
        logging::init_logging(&config.log_dir).context("Failed to initialize logging")?;
    if let Some(directive) = &args.log_filter {
        logging_config.set_filter(directive)?;
    }
    debug!(filter = %logging_config.get_filter(), "Logging initialized");

    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let orchestrator = Orchestrator::new(config, db).await?;

    match args.command {
        Command::Serve => {
            logging_config.start_retention_cleanup(orchestrator.cancellation_token());
            orchestrator.start().await?;
            info!("reelsmith running; press Ctrl-C to stop");

            let mut purge_tick = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to listen for shutdown signal");
                        }
                        break;
                    }
                    _ = purge_tick.tick() => {
                        if let Err(e) = orchestrator.purge(None).await {
                            warn!(error = %e, "Periodic purge failed");
                        }
                    }
                }
            }

            orchestrator.shutdown().await;
        }
        Command::Submit {
            kind,
            title,
            owner,
            payload,
            run_at,
            schedule_id,
            priority,
        } => {
            let mut request = SubmitRequest::new(kind, title, owner).with_priority(priority);
            if let Some(payload) = payload {
                let value = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
                request = request.with_payload(value);
            }
            if let Some(run_at) = run_at {
                request = request.with_run_at(run_at);
            }
            if let Some(schedule_id) = schedule_id {
                request = request.with_schedule(schedule_id);
            }
            let id = orchestrator.submit(request).await?;
            println!("{id}");
        }
        Command::Status { job_id } => print_json(&orchestrator.get_status(&job_id).await?)?,
        Command::List { status, limit } => {
            print_json(&orchestrator.list_jobs(status, limit).await?)?
        }
        Command::Cancel { job_id } => print_json(&orchestrator.cancel(&job_id).await?)?,
        Command::Requeue { job_id } => print_json(&orchestrator.requeue(&job_id).await?)?,
        Command::Summary => {
            #[derive(Serialize)]
            struct Summary {
                counts: Vec<reelsmith::database::repositories::JobCount>,
                health: reelsmith::service::HealthReport,
            }
            print_json(&Summary {
                counts: orchestrator.queue_summary().await?,
                health: orchestrator.health().await?,
            })?
        }
        Command::Purge { older_than_days } => {
            let age = older_than_days.map(|days| Duration::from_secs(days * 24 * 60 * 60));
            let purged = orchestrator.purge(age).await?;
            println!("purged {} job(s)", purged.len());
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
