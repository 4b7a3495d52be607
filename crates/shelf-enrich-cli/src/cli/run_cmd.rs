//! `shelf-enrich run`: enrich a CSV export and write the result.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use shelf_enrich::{progress, Dataset, EnrichJob, JobSummary};

use crate::config::{load_config, Overrides, CONTROL_PASSWORD_ENV};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Input CSV with at least a `Book Id` column.
    #[arg(short, long, default_value = "./input.csv")]
    pub input: PathBuf,

    /// Where to write the enriched CSV.
    #[arg(short, long, default_value = "./output.csv")]
    pub output: PathBuf,

    /// Number of leading rows to enrich, -1 for all.
    #[arg(long, allow_negative_numbers = true)]
    pub books: Option<i64>,

    /// Rotate identity every N requests (0 disables rotation).
    #[arg(long)]
    pub rotate_every: Option<u64>,

    /// Fetch attempts per book, first attempt included.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Concurrent fetches.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Base URL; documents are fetched from {base}/show/{id}.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Connect directly instead of through Tor.
    #[arg(long)]
    pub no_tor: bool,

    /// Tor SOCKS address (host:port).
    #[arg(long)]
    pub socks: Option<String>,

    /// Tor control port address (host:port).
    #[arg(long)]
    pub control: Option<String>,

    /// Control port password. Also read from SHELF_ENRICH_CONTROL_PASSWORD.
    #[arg(long)]
    pub control_password: Option<String>,

    /// Control port auth cookie file.
    #[arg(long)]
    pub cookie_file: Option<PathBuf>,

    /// Log the apparent IP address after every identity rotation (debug level).
    #[arg(long)]
    pub log_ip: bool,

    /// Print the job summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            entity_limit: self.books,
            rotate_every: self.rotate_every,
            max_retries: self.max_retries,
            pool_width: self.workers,
            base_url: self.base_url.clone(),
            timeout_ms: self.timeout_ms,
            no_tor: self.no_tor,
            socks_addr: self.socks.clone(),
            control_addr: self.control.clone(),
            control_password: self.control_password.clone(),
            cookie_file: self.cookie_file.clone(),
            log_ip: self.log_ip,
        }
        .with_password_env(std::env::var(CONTROL_PASSWORD_ENV).ok())
    }
}

/// Run the enrichment. Nothing is written if the job fails.
pub async fn run(args: RunArgs, config_path: Option<PathBuf>, show_progress: bool) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    args.overrides().apply(&mut config);

    let mut dataset = Dataset::load(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    tracing::info!(
        rows = dataset.len(),
        tor = config.tor.enabled,
        "loaded {}",
        args.input.display()
    );

    let mut job = EnrichJob::new(config).context("cannot start job")?;
    let renderer = if show_progress {
        let (tx, rx) = progress::channel();
        job = job.with_progress(tx);
        Some(super::progress::spawn(rx))
    } else {
        None
    };

    let outcome = job.run(&mut dataset).await;
    drop(job);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    let summary = outcome.context("enrichment aborted")?;

    dataset
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, &args.output);
    }
    Ok(())
}

fn print_summary(summary: &JobSummary, output: &std::path::Path) {
    println!("Enriched {} of {} books", summary.done, summary.total);
    println!("  Failed:    {}", summary.failed);
    println!("  Requests:  {}", summary.requests);
    println!("  Rotations: {}", summary.rotations);
    println!("  Elapsed:   {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!("  Output:    {}", output.display());
}
