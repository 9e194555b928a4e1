use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use csv_migrator::db::job_repo::JobFilter;
use csv_migrator::queue::JobHandler;
use csv_migrator::telemetry::init_tracing;
use csv_migrator::{load_config, Config, JobStatus, Migrator, MigratorError, WorkerError};

#[derive(Parser, Debug)]
#[command(name = "csv-migrator", version, about = "Resumable, chunked CSV migrations")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher, scheduled import and progress feed until Ctrl-C
    Run {
        /// Import once, drain the queue, then exit
        #[arg(long)]
        once: bool,
    },
    /// Enqueue a CSV file
    Submit {
        file: PathBuf,
        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Show one job, or list jobs
    Status {
        job_id: Option<String>,
        /// Only list jobs in this status
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Pause a pending job
    Pause { job_id: String },
    /// Resume a paused job
    Resume { job_id: String },
    /// Requeue a failed job with a fresh retry budget
    Requeue { job_id: String },
    /// Print the audit trail of a job
    Audit { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    init_tracing(&config.logging);

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<(), MigratorError> {
    let migrator = Migrator::open(config)?;
    let queue = migrator.queue();

    match command {
        Command::Run { once } => run(&migrator, once).await,
        Command::Submit { file, name } => {
            let name = name.unwrap_or_else(|| csv_migrator::sanitize::redact_path(&file));
            let job = migrator.intake().submit(&file, &name)?;
            print_json(&job)
        }
        Command::Status {
            job_id: Some(id),
            ..
        } => print_json(&queue.store().get(&id)?),
        Command::Status {
            job_id: None,
            status,
            limit,
        } => {
            let filter = JobFilter {
                lane: Some(migrator.config().lane.clone()),
                status: status.map(|s| s.as_str().to_string()),
                limit: Some(limit),
                offset: None,
            };
            let (jobs, total) = queue.store().list(&filter)?;
            print_json(&serde_json::json!({ "total": total, "jobs": jobs }))
        }
        Command::Pause { job_id } => print_json(&queue.pause(&job_id)?),
        Command::Resume { job_id } => print_json(&queue.resume(&job_id)?),
        Command::Requeue { job_id } => print_json(&queue.requeue(&job_id)?),
        Command::Audit { job_id } => print_json(&queue.audit().for_job(&job_id)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), MigratorError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.to_ascii_uppercase()
        .parse::<JobStatus>()
        .map_err(|e| e.to_string())
}

async fn run(migrator: &Migrator, once: bool) -> Result<(), MigratorError> {
    let lane = migrator.config().lane.clone();
    let queue = migrator.queue().clone();
    let reloader = migrator.filter_reloader()?;
    let processor: Arc<dyn JobHandler> = Arc::new(migrator.processor());

    if once {
        if let Some(scheduler) = migrator.scheduler() {
            scheduler.scan_once()?;
        }
        let mut dispatched = 0usize;
        while queue.run_once(&lane, processor.as_ref()).await? {
            dispatched += 1;
        }
        log::info!("Queue drained after {} dispatch cycles", dispatched);
        return Ok(());
    }

    let reload_stop = reloader.map(|reloader| {
        let stop = reloader.stopper();
        reloader.spawn();
        stop
    });

    let mut events = migrator.progress().subscribe();
    let feed = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Failed to encode progress event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Progress feed lagged, skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let poller = migrator.progress_poller();
    let poller_task = poller.start();

    let (trigger_tx, trigger_rx) = tokio::sync::broadcast::channel(4);
    let scheduler = migrator.scheduler();
    let scheduler_thread = match &scheduler {
        Some(scheduler) => Some(scheduler.start(trigger_rx)?),
        None => None,
    };

    queue.start_polling(&lane, processor);

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| WorkerError::SpawnFailed(format!("Ctrl-C handler: {}", e)))?;

    log::info!("csv-migrator running on lane {}", lane);
    stop_rx.recv().await;
    log::info!("Shutting down, waiting for the in-flight job");

    queue.stop_polling().await;
    poller.stop();
    if let Some(stop) = reload_stop {
        stop.stop();
    }
    if let Some(scheduler) = &scheduler {
        scheduler.stop();
        let _ = trigger_tx.send(());
    }
    if let Some(handle) = scheduler_thread {
        let joined = tokio::task::spawn_blocking(move || handle.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            log::error!("Import scheduler thread panicked");
        }
    }
    let _ = poller_task.await;
    feed.abort();
    Ok(())
}
