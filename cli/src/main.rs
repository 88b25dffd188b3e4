use anyhow::Context as _;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use common::{JobChanges, JobId, RunArgs, ScheduledJob};
use meshflow_daemon::config::SchedulerConfig;
use meshflow_daemon::scheduler::delegating::DelegatingScheduler;
use meshflow_daemon::scheduler::Scheduler;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the primary scheduler
    #[arg(long, default_value = common::DEFAULT_PRIMARY_URL)]
    url: String,
    /// API key (defaults to $MESHFLOW_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List scheduled entries
    Jobs,
    /// Show one scheduled entry
    Get { id: String },
    /// Schedule a job
    Add {
        /// Entry id
        #[arg(long)]
        id: String,
        /// Id of the job to run
        #[arg(long)]
        job: i64,
        /// "every 10m", "at <rfc3339>" or a crontab string
        #[arg(short, long)]
        trigger: String,
        /// Comma-separated target names
        #[arg(long, value_delimiter = ',')]
        targets: Option<Vec<String>>,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Replace the payload of an entry
    Modify {
        id: String,
        #[arg(long)]
        payload: String,
    },
    /// Change the trigger of an entry
    Reschedule {
        id: String,
        #[arg(short, long)]
        trigger: String,
    },
    /// Pause one entry
    PauseJob { id: String },
    /// Resume one entry
    ResumeJob { id: String },
    /// Remove an entry
    Remove { id: String },
    /// Pause the whole scheduler
    Pause,
    /// Resume the whole scheduler
    Resume,
    /// Scheduler state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let api_key = cli.api_key.or_else(|| std::env::var("MESHFLOW_API_KEY").ok());
    let config = SchedulerConfig { primary_url: cli.url, ..SchedulerConfig::default() };
    let scheduler = DelegatingScheduler::new(&config, api_key)?;

    match cli.command {
        Commands::Jobs => {
            let jobs = scheduler.get_jobs().await?;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
            } else {
                print_table(&jobs);
            }
        }
        Commands::Get { id } => match scheduler.get_job(&id).await? {
            Some(job) => print_detail(&job),
            None => println!("Job not found."),
        },
        Commands::Add { id, job, trigger, targets, payload } => {
            let trigger = common::parse_trigger(&trigger)?;
            let args = RunArgs { job_id: JobId(job), targets, payload: parse_payload(payload.as_deref())? };
            let entry = scheduler.add_job(&id, trigger, args).await?;
            println!("Scheduled {}", entry.id);
            print_detail(&entry);
        }
        Commands::Modify { id, payload } => {
            let current = scheduler
                .get_job(&id)
                .await?
                .with_context(|| format!("Job {} not found", id))?;
            let args = RunArgs { payload: parse_payload(Some(&payload))?, ..current.args };
            let entry = scheduler.modify_job(&id, JobChanges { args: Some(args) }).await?;
            print_detail(&entry);
        }
        Commands::Reschedule { id, trigger } => {
            let trigger = common::parse_trigger(&trigger)?;
            print_detail(&scheduler.reschedule_job(&id, trigger).await?);
        }
        Commands::PauseJob { id } => print_detail(&scheduler.pause_job(&id).await?),
        Commands::ResumeJob { id } => print_detail(&scheduler.resume_job(&id).await?),
        Commands::Remove { id } => {
            scheduler.remove_job(&id).await?;
            println!("Removed {}", id);
        }
        Commands::Pause => {
            scheduler.pause().await?;
            println!("Scheduler paused");
        }
        Commands::Resume => {
            scheduler.resume().await?;
            println!("Scheduler resumed");
        }
        Commands::Status => {
            let status = scheduler.status().await?;
            println!("State: {:?}", status.state);
            println!("Jobs:  {}", status.jobs);
        }
    }

    Ok(())
}

fn parse_payload(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

fn next_run(job: &ScheduledJob) -> String {
    match job.next_run_time {
        Some(at) => at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "paused".to_string(),
    }
}

fn print_table(jobs: &[ScheduledJob]) {
    let mut table = Table::new();
    table.set_header(vec!["ID", "Job", "Trigger", "Targets", "Next run"]);
    for job in jobs {
        let targets = job.args.targets.as_ref().map(|t| t.join(",")).unwrap_or_else(|| "-".into());
        table.add_row(vec![
            job.id.clone(),
            job.args.job_id.to_string(),
            job.trigger.describe(),
            targets,
            next_run(job),
        ]);
    }
    println!("{table}");
}

fn print_detail(job: &ScheduledJob) {
    println!("Job Details:");
    println!("  ID:       {}", job.id);
    println!("  Job:      {}", job.args.job_id);
    println!("  Trigger:  {}", job.trigger.describe());
    println!("  Targets:  {:?}", job.args.targets);
    println!("  Payload:  {}", job.args.payload);
    println!("  Next run: {}", next_run(job));
}
