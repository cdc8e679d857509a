use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadx_core::{Job, JobTarget};
use leadx_sync::{JobService, RunnerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "leadx-cli")]
#[command(about = "LeadX paginated lead extraction")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Extract one listing URL into a new job and wait for it.
    Run {
        #[arg(long)]
        list_name: String,
        #[arg(long)]
        url: String,
    },
    /// Extract every URL of a bulk target list.
    RunBulk {
        #[arg(long)]
        list_name: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Continue a paused, stopped or failed job from its saved position.
    Resume { id: Uuid },
    /// List known jobs.
    Jobs,
    /// Validate a bulk target list without running it.
    CheckBulk { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,leadx_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => leadx_web::serve_from_env().await?,
        Commands::Run { list_name, url } => {
            let service = JobService::from_config(RunnerConfig::from_env()).await?;
            let job = service
                .create_job(&list_name, JobTarget::Single(url))
                .await?;
            let job = follow(&service, job.id).await?;
            print_job(&job)?;
        }
        Commands::RunBulk { list_name, file } => {
            let entries = read_bulk_file(&file).await?;
            let service = JobService::from_config(RunnerConfig::from_env()).await?;
            let job = service
                .create_job(&list_name, JobTarget::Bulk(entries))
                .await?;
            let job = follow(&service, job.id).await?;
            print_job(&job)?;
        }
        Commands::Resume { id } => {
            let service = JobService::from_config(RunnerConfig::from_env()).await?;
            service
                .resume_job(id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            let job = follow(&service, id).await?;
            print_job(&job)?;
        }
        Commands::Jobs => {
            let service = JobService::from_config(RunnerConfig::from_env()).await?;
            for job in service.list_jobs().await {
                println!(
                    "{} {:<9} total={} page={} url_number={} bulk={}/{} {}",
                    job.id,
                    job.status,
                    job.total,
                    job.page_index,
                    job.url_number,
                    job.bulk_index,
                    job.bulk_total,
                    job.list_name
                );
            }
        }
        Commands::CheckBulk { file } => {
            let entries = read_bulk_file(&file).await?;
            println!("{} valid rows in {}", entries.len(), file.display());
            for entry in entries {
                println!("{}\t{}", entry.url_number, entry.url);
            }
        }
    }

    Ok(())
}

async fn read_bulk_file(file: &Path) -> Result<Vec<leadx_core::BulkUrlEntry>> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    leadx_adapters::parse_bulk_csv(&text).with_context(|| format!("parsing {}", file.display()))
}

/// Waits for the job's run; Ctrl-C pauses it at the next checkpoint instead of killing it.
async fn follow(service: &JobService, id: Uuid) -> Result<Job> {
    tokio::select! {
        _ = service.wait(id) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            tracing::info!(job_id = %id, "interrupt received; pausing job");
            service.stop_job(id).await?;
            while service.registry().is_active(id).await {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
    service
        .get_job(id)
        .await
        .with_context(|| format!("job {id} disappeared"))
}

fn print_job(job: &Job) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(job).context("serializing job")?);
    Ok(())
}
