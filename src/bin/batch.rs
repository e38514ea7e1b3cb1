use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use portrait_verify::{
    app_state,
    config::AppConfig,
    models::job::{AuthContext, Job, JobId, DEFAULT_PRIORITY},
    models::status::JobStatus,
    services::{controller::Controller, pipeline::Collaborators},
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Run every portrait in a directory through the verification controller.
#[derive(Debug, Parser)]
#[command(name = "batch", version, about)]
struct Cli {
    /// Directory of input portraits.
    input_dir: PathBuf,

    /// Directory that receives the processed images.
    output_dir: PathBuf,

    /// Target format id (icao, us_passport).
    #[arg(long, default_value = "icao")]
    format: String,

    /// Priority for every submitted job, 1..=10.
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    priority: u8,

    /// Overrides MAX_CONCURRENT_JOBS.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Use scripted stage collaborators instead of the inference endpoint.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Bearer token passed to the authorization check.
    #[arg(long, env = "BATCH_TOKEN")]
    token: Option<String>,
}

/// One line of output per job.
#[derive(Serialize)]
struct JobSummary<'a> {
    input: &'a Path,
    job_id: Option<JobId>,
    status: &'a str,
    detail: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().expect("Failed to load configuration");
    if let Some(limit) = cli.concurrency {
        config.max_concurrent_jobs = limit;
    }

    let stages = if cli.dry_run {
        tracing::info!("Dry run: using scripted stage collaborators");
        Collaborators::converging()
    } else {
        app_state::production_stages(&config).expect("Failed to initialize face detector")
    };
    let controller = app_state::build_controller(&config, stages, app_state::authorizer(&config))
        .expect("Failed to initialize controller");
    let dispatch = controller.start();

    let inputs = match list_images(&cli.input_dir) {
        Ok(inputs) => inputs,
        Err(e) => {
            tracing::error!(dir = %cli.input_dir.display(), error = %e, "Cannot read input directory");
            std::process::exit(2);
        }
    };
    tracing::info!(count = inputs.len(), "Submitting batch");

    let context = match &cli.token {
        Some(token) => AuthContext::with_token("batch", token.clone()),
        None => AuthContext::new("batch"),
    };

    let mut submitted = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let output = output_path(&cli.output_dir, input);
        let job = Job::new(input, output, cli.format.clone(), context.clone()).with_priority(cli.priority);
        match controller.submit_job(job).await {
            Ok(job_id) => submitted.push((input.as_path(), job_id)),
            Err(e) => print_summary(&JobSummary {
                input,
                job_id: None,
                status: "rejected",
                detail: Some(e.to_string()),
            }),
        }
    }

    let mut failures = 0usize;
    for (input, job_id) in submitted {
        let status = wait_terminal(&controller, job_id).await;
        let detail = match &status {
            JobStatus::Failed { reason, .. } => {
                failures += 1;
                Some(reason.clone())
            }
            JobStatus::Completed { summary } => Some(format!(
                "{} iteration(s), {} issue(s)",
                summary.iterations,
                summary.issues.len()
            )),
            _ => None,
        };
        print_summary(&JobSummary {
            input,
            job_id: Some(job_id),
            status: status.label(),
            detail,
        });
    }

    controller.shutdown(Duration::from_secs(5)).await;
    if let Err(e) = dispatch.await {
        tracing::error!(error = %e, "Dispatch loop ended abnormally");
    }
    if failures > 0 {
        std::process::exit(1);
    }
}

fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("portrait");
    output_dir.join(format!("{stem}_verified.png"))
}

async fn wait_terminal(controller: &Controller, job_id: JobId) -> JobStatus {
    loop {
        let status = controller.get_processing_status(job_id);
        if !matches!(status, JobStatus::Queued { .. } | JobStatus::Active { .. }) {
            return status;
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn print_summary(summary: &JobSummary<'_>) {
    match serde_json::to_string(summary) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize summary"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["batch", "in", "out", "--format", "us_passport", "--dry-run", "--priority", "8"]);
        assert_eq!(cli.format, "us_passport");
        assert!(cli.dry_run);
        assert_eq!(cli.priority, 8);
        assert_eq!(cli.input_dir, PathBuf::from("in"));
    }

    #[test]
    fn test_output_path() {
        let out = output_path(Path::new("/tmp/out"), Path::new("/data/alice.JPG"));
        assert_eq!(out, PathBuf::from("/tmp/out/alice_verified.png"));
    }
}
