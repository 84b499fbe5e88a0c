//! CLI binary for ledgerpack.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, drives a `StageRunner`, and turns the outcome into an
//! exit code: 0 finished, 2 paused on quota, 1 failed.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ledgerpack::adapters::markdown::summary_path;
use ledgerpack::{
    stage_input, Adapters, CheckpointRecord, CheckpointStore, FileCheckpointStore, JobId,
    JobOutcome, JobSpec, PipelineConfig, PipelineProgress, ProgressCallback, StageName,
    StageRunner,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar per stage, re-styled on every `on_stage_start`. Chunk units may
/// finish out of order, so per-chunk start times are keyed by index.
struct CliProgress {
    bar: ProgressBar,
    start_times: Mutex<HashMap<(StageName, usize), Instant>>,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Loading checkpoint…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, stage: StageName, chunk: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&(stage, chunk)))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgress for CliProgress {
    fn on_stage_start(&self, stage: StageName, pending: usize, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} units  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_length(total as u64);
        self.bar.set_position(total.saturating_sub(pending) as u64);
        self.bar.set_prefix(format!("{stage:<9}"));
        self.bar.reset_eta();
        if stage.is_per_chunk() {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("{stage}: {pending} of {total} chunks to run"))
            ));
        }
    }

    fn on_unit_start(&self, stage: StageName, chunk: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert((stage, chunk), Instant::now());
        }
        self.bar.set_message(format!("chunk {chunk}"));
    }

    fn on_unit_complete(&self, stage: StageName, chunk: usize, records: usize) {
        let secs = self.elapsed(stage, chunk);
        if stage == StageName::Parse {
            self.bar.println(format!(
                "  {} Chunk {:>3}  {:<12}  {}",
                green("✓"),
                chunk,
                dim(&format!("{records:>4} records")),
                dim(&format!("{secs:.1}s")),
            ));
        }
        self.bar.inc(1);
    }

    fn on_unit_error(&self, stage: StageName, chunk: usize, error: &str) {
        let secs = self.elapsed(stage, chunk);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {stage} chunk {:>3}  {}  {}",
            red("✗"),
            chunk,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: StageName, completed: usize, failed: usize) {
        if stage.is_per_chunk() {
            let mark = if failed == 0 { green("✔") } else { yellow("⚠") };
            self.bar.println(format!(
                "{mark} {stage}: {} completed, {} failed",
                bold(&completed.to_string()),
                failed
            ));
        }
    }

    fn on_paused(&self, stage: StageName, reason: &str) {
        self.bar
            .println(format!("{} paused during {stage}: {reason}", yellow("⏸")));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process a package (creates or continues its checkpoint)
  ledgerpack process "Nov 2025 package.pdf"

  # Start over, discarding an existing checkpoint
  ledgerpack process --restart package.pdf

  # Continue a paused job after topping up credit
  ledgerpack resume Nov_2025_package-0123456789abcdef

  # Give permanently failed chunks another try
  ledgerpack resume --retry-failed Nov_2025_package-0123456789abcdef

  # Run one stage only
  ledgerpack run --step extract package.pdf

  # List checkpoints
  ledgerpack status

EXIT CODES:
  0  completed (possibly with failed chunks listed in the output)
  1  failed (adapter unavailable, corrupt checkpoint, invalid input, …)
  2  paused: the model provider reported exhausted quota or credit;
     run `ledgerpack resume <job-id>` later

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Override the log filter
"#;

/// Resumable conversion of financial PDF packages into CSV workbooks.
#[derive(Parser, Debug)]
#[command(
    name = "ledgerpack",
    version,
    about = "Convert financial PDF packages into CSV workbooks, resumably",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    opts: GlobalOpts,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the job for an input, or continue it if a checkpoint exists.
    Process {
        /// Local PDF path or HTTP/HTTPS URL.
        input: String,

        /// Discard any existing checkpoint for this input first.
        #[arg(long)]
        restart: bool,
    },
    /// Continue a checkpointed job.
    Resume {
        job_id: String,

        /// Reopen chunks that failed permanently.
        #[arg(long, env = "LEDGERPACK_RETRY_FAILED")]
        retry_failed: bool,
    },
    /// Run a single stage.
    Run {
        #[arg(long, value_parser = parse_stage)]
        step: StageName,

        /// Job id of an existing checkpoint, or an input path/URL.
        target: String,
    },
    /// Print checkpoint summaries.
    Status { job_id: Option<String> },
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Maximum pages per chunk.
    #[arg(long, global = true, env = "LEDGERPACK_MAX_PAGES_PER_CHUNK", default_value_t = 30)]
    max_pages_per_chunk: usize,

    /// Chunks processed concurrently within a stage.
    #[arg(short, long, global = true, env = "LEDGERPACK_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Attempts per adapter call, including the first.
    #[arg(long, global = true, env = "LEDGERPACK_RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    retry_max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, global = true, env = "LEDGERPACK_RETRY_BASE_DELAY_MS", default_value_t = 2000)]
    retry_base_delay_ms: u64,

    /// Growth factor of successive retry delays.
    #[arg(long, global = true, env = "LEDGERPACK_RETRY_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    retry_backoff_multiplier: f64,

    /// Cap on a single retry delay, in milliseconds.
    #[arg(long, global = true, env = "LEDGERPACK_RETRY_MAX_DELAY_MS", default_value_t = 60_000)]
    retry_max_delay_ms: u64,

    /// Timeout of a single adapter call in seconds (0 disables).
    #[arg(long, global = true, env = "LEDGERPACK_CALL_TIMEOUT_SECS", default_value_t = 120)]
    call_timeout_secs: u64,

    /// Give up retrying one call after this many seconds.
    #[arg(long, global = true, env = "LEDGERPACK_RETRY_DEADLINE_SECS")]
    retry_deadline_secs: Option<u64>,

    #[arg(long, global = true, env = "LEDGERPACK_CHECKPOINT_DIR", default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, global = true, env = "LEDGERPACK_OUTPUT_DIR", default_value = "data/output")]
    output_dir: PathBuf,

    /// Model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    #[arg(long, global = true, env = "LEDGERPACK_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max output tokens per parse call.
    #[arg(long, global = true, env = "LEDGERPACK_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// PDF user password for encrypted packages.
    #[arg(long, global = true, env = "LEDGERPACK_PASSWORD")]
    password: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "LEDGERPACK_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "LEDGERPACK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "LEDGERPACK_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "LEDGERPACK_NO_PROGRESS")]
    no_progress: bool,

    /// Skip the Markdown summary written beside the workbook.
    #[arg(long, global = true, env = "LEDGERPACK_NO_SUMMARY")]
    no_summary: bool,

    /// Print the outcome as JSON on stdout.
    #[arg(long, global = true, env = "LEDGERPACK_JSON")]
    json: bool,
}

fn parse_stage(s: &str) -> Result<StageName, String> {
    s.parse().map_err(|e: ledgerpack::PipelineError| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.opts.quiet
        && !cli.opts.no_progress
        && !cli.opts.json
        && !matches!(cli.command, Command::Status { .. });
    let filter = if cli.opts.verbose {
        "debug"
    } else if cli.opts.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgress::new);
    let result = run(&cli, progress.clone().map(|p| p as ProgressCallback)).await;
    if let Some(p) = progress {
        p.finish();
    }

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", red("error:"));
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, progress: Option<ProgressCallback>) -> Result<u8> {
    let retry_failed = matches!(cli.command, Command::Resume { retry_failed: true, .. });
    let config = build_config(&cli.opts, retry_failed, progress)?;
    let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));

    let runner = StageRunner::new(
        config.clone(),
        store.clone() as Arc<dyn CheckpointStore>,
        Adapters::from_config(&config),
    );

    let outcome = match &cli.command {
        Command::Process { input, restart } => {
            let spec = stage(&config, input).await?;
            if *restart && store.remove(&spec.id).await? {
                eprintln!("{} discarded checkpoint of {}", dim("↺"), spec.id);
            }
            runner.run(&spec).await
        }
        Command::Resume { job_id, .. } => {
            let id = JobId::parse(job_id)?;
            runner.resume(&id).await
        }
        Command::Run { step, target } => {
            let spec = match existing_job(&store, target).await? {
                Some(spec) => spec,
                None => stage(&config, target).await?,
            };
            runner.run_step(&spec, *step).await
        }
        Command::Status { job_id } => {
            print_status(&store, job_id.as_deref(), cli.opts.json).await?;
            return Ok(0);
        }
    }
    .context("Pipeline failed")?;

    report(&outcome, &cli.opts);
    Ok(outcome.exit_code() as u8)
}

async fn stage(config: &PipelineConfig, input: &str) -> Result<JobSpec> {
    stage_input(input, &config.work_root(), config.download_timeout_secs)
        .await
        .with_context(|| format!("Cannot open input '{input}'"))
}

/// `target` names a checkpointed job: rebuild its spec from the record.
async fn existing_job(store: &FileCheckpointStore, target: &str) -> Result<Option<JobSpec>> {
    let Ok(id) = JobId::parse(target) else {
        return Ok(None);
    };
    match store.load(&id).await? {
        Some(record) => Ok(Some(
            JobSpec::from_file(&record.job.source, &record.job.input).await?,
        )),
        None => Ok(None),
    }
}

/// Map CLI args to `PipelineConfig`.
fn build_config(
    opts: &GlobalOpts,
    retry_failed: bool,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let call_timeout = (opts.call_timeout_secs > 0).then(|| Duration::from_secs(opts.call_timeout_secs));

    let mut builder = PipelineConfig::builder()
        .max_pages_per_chunk(opts.max_pages_per_chunk)
        .concurrency(opts.concurrency)
        .max_attempts(opts.retry_max_attempts)
        .base_delay(Duration::from_millis(opts.retry_base_delay_ms))
        .backoff_multiplier(opts.retry_backoff_multiplier)
        .max_delay(Duration::from_millis(opts.retry_max_delay_ms))
        .call_timeout(call_timeout)
        .retry_deadline(opts.retry_deadline_secs.map(Duration::from_secs))
        .temperature(opts.temperature)
        .max_tokens(opts.max_tokens)
        .checkpoint_dir(&opts.checkpoint_dir)
        .output_dir(&opts.output_dir)
        .retry_failed(retry_failed)
        .write_summary(!opts.no_summary)
        .download_timeout_secs(opts.download_timeout);

    if let Some(model) = &opts.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &opts.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(password) = &opts.password {
        builder = builder.password(password);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

// ── Reporting ────────────────────────────────────────────────────────────────

fn report(outcome: &JobOutcome, opts: &GlobalOpts) {
    if opts.json {
        println!("{}", outcome_json(outcome));
        return;
    }
    if opts.quiet {
        return;
    }
    match outcome {
        JobOutcome::Completed { job, output } => {
            eprintln!("{} {job} completed  →  {}", green("✔"), bold(&output.display().to_string()));
            print_summary_path(output, opts);
        }
        JobOutcome::CompletedWithFailures { job, output, failures } => {
            eprintln!(
                "{} {job} completed with {} failed chunks  →  {}",
                yellow("⚠"),
                failures.len(),
                bold(&output.display().to_string())
            );
            print_summary_path(output, opts);
            for f in failures {
                eprintln!("   {}", dim(&f.to_string()));
            }
        }
        JobOutcome::PausedForResource {
            job,
            stage,
            completed,
            pending,
            reason,
        } => {
            eprintln!(
                "{} {job} paused during {stage}: {} chunks done, {} pending",
                yellow("⏸"),
                completed.len(),
                pending.len()
            );
            eprintln!("   {}", dim(reason));
            eprintln!("   continue with: ledgerpack resume {job}");
        }
        JobOutcome::StepCompleted { job, stage } => {
            eprintln!("{} {job}: {stage} completed", green("✔"));
        }
    }
}

fn print_summary_path(output: &std::path::Path, opts: &GlobalOpts) {
    let summary = summary_path(output);
    if !opts.no_summary && summary.exists() {
        eprintln!("   summary  →  {}", summary.display());
    }
}

fn outcome_json(outcome: &JobOutcome) -> serde_json::Value {
    use serde_json::json;
    match outcome {
        JobOutcome::Completed { job, output } => json!({
            "outcome": "completed", "job": job, "output": output,
        }),
        JobOutcome::CompletedWithFailures { job, output, failures } => json!({
            "outcome": "completed_with_failures", "job": job, "output": output, "failures": failures,
        }),
        JobOutcome::PausedForResource {
            job,
            stage,
            completed,
            pending,
            reason,
        } => json!({
            "outcome": "paused", "job": job, "stage": stage,
            "completed": completed, "pending": pending, "reason": reason,
        }),
        JobOutcome::StepCompleted { job, stage } => json!({
            "outcome": "step_completed", "job": job, "stage": stage,
        }),
    }
}

async fn print_status(store: &FileCheckpointStore, job: Option<&str>, json: bool) -> Result<()> {
    let records: Vec<CheckpointRecord> = match job {
        Some(raw) => {
            let id = JobId::parse(raw)?;
            let record = store
                .load(&id)
                .await?
                .ok_or_else(|| ledgerpack::PipelineError::JobNotFound { job: id.clone() })?;
            vec![record]
        }
        None => store.list().await?,
    };

    if json {
        let summaries: Vec<_> = records.iter().map(status_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("Failed to serialise status")?
        );
        return Ok(());
    }
    if records.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {}  {}",
            bold(record.job.id.as_str()),
            record.job.status,
            dim(&format!("updated {}", record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")))
        );
        println!("   source   {}", record.job.source);
        for stage in &record.job.stages {
            println!(
                "   {:<9} {:<9} {:>3}/{:<3} done  {} failed",
                stage.name.as_str(),
                format!("{:?}", stage.status).to_lowercase(),
                stage.completed_units().len(),
                stage.units.len(),
                stage.failed_count()
            );
        }
        if let Some(output) = &record.output {
            println!("   output   {}", output.display());
        }
    }
    Ok(())
}

fn status_json(record: &CheckpointRecord) -> serde_json::Value {
    serde_json::json!({
        "job": record.job.id,
        "status": record.job.status,
        "source": record.job.source,
        "sequence": record.sequence,
        "updated_at": record.updated_at,
        "chunks": record.chunks.len(),
        "stages": record.job.stages.iter().map(|s| serde_json::json!({
            "name": s.name,
            "status": s.status,
            "completed": s.completed_units().len(),
            "failed": s.failed_count(),
            "units": s.units.len(),
        })).collect::<Vec<_>>(),
        "failures": record.failures(),
        "output": record.output,
    })
}
