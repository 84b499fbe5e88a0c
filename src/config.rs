//! Configuration types for the checkpointed pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Retry policy and parser settings live in
//! nested structs ([`RetryConfig`], [`LlmConfig`], [`PdfConfig`]) so each
//! adapter only sees the knobs it uses.
//!
//! # Design choice: builder over constructor
//! The builder lets callers set only what they care about and rely on the
//! documented defaults for the rest. `build()` is the single place where
//! cross-field constraints are checked.

use crate::error::PipelineError;
use crate::model::JobId;
use crate::progress::{NoopProgress, ProgressCallback};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use ledgerpack::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_pages_per_chunk(20)
///     .concurrency(2)
///     .checkpoint_dir("state/checkpoints")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages_per_chunk, 20);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Upper bound on pages per chunk. Default: 30.
    ///
    /// A chunk is the unit of resumable work: smaller chunks lose less work on
    /// a pause, larger ones cost fewer parser calls.
    pub max_pages_per_chunk: usize,

    /// Maximum chunks processed concurrently within a stage. Default: 4.
    pub concurrency: usize,

    /// Retry and backoff policy applied to every adapter call.
    pub retry: RetryConfig,

    /// Parser (LLM) settings.
    pub llm: LlmConfig,

    /// PDF extraction settings.
    pub pdf: PdfConfig,

    /// Directory holding one checkpoint file per job. Default: `data/checkpoints`.
    pub checkpoint_dir: PathBuf,

    /// Directory receiving `<job-id>.csv`. Default: `data/output`.
    pub output_dir: PathBuf,

    /// Root for per-job artifacts (extracted chunk text, downloaded inputs).
    /// Default: `<checkpoint_dir>/work`.
    pub work_dir: Option<PathBuf>,

    /// Reopen permanently failed units of a finished job. Default: false.
    pub retry_failed: bool,

    /// Also write `<job-id>_SUMMARY.md` next to the workbook. Default: true.
    pub write_summary: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Receives stage and unit events.
    pub progress_callback: ProgressCallback,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages_per_chunk: 30,
            concurrency: 4,
            retry: RetryConfig::default(),
            llm: LlmConfig::default(),
            pdf: PdfConfig::default(),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            output_dir: PathBuf::from("data/output"),
            work_dir: None,
            retry_failed: false,
            write_summary: true,
            download_timeout_secs: 120,
            progress_callback: Arc::new(NoopProgress),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_pages_per_chunk", &self.max_pages_per_chunk)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("llm", &self.llm)
            .field("pdf", &self.pdf)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("output_dir", &self.output_dir)
            .field("work_dir", &self.work_dir)
            .field("retry_failed", &self.retry_failed)
            .field("write_summary", &self.write_summary)
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Root directory for per-job artifacts.
    pub fn work_root(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.checkpoint_dir.join("work"))
    }

    /// Artifact directory of one job.
    pub fn job_work_dir(&self, job: &JobId) -> PathBuf {
        self.work_root().join(job.as_str())
    }

    /// Destination of the final workbook.
    pub fn output_path(&self, job: &JobId) -> PathBuf {
        self.output_dir.join(format!("{job}.csv"))
    }

    /// Destination of the Markdown summary.
    pub fn summary_path(&self, job: &JobId) -> PathBuf {
        self.output_dir.join(format!("{job}_SUMMARY.md"))
    }
}

/// Backoff policy. The n-th retry waits
/// `min(base_delay * backoff_multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per call, including the first. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 2 s.
    pub base_delay: Duration,
    /// Growth factor between retries. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Cap on any single delay. Default: 60 s.
    pub max_delay: Duration,
    /// Per-call timeout; an expired call is a transient failure. Default: 120 s.
    pub call_timeout: Option<Duration>,
    /// Total time budget across attempts of one call. Default: none.
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            call_timeout: Some(Duration::from_secs(120)),
            deadline: None,
        }
    }
}

/// Settings for the LLM-backed chunk parser.
#[derive(Clone)]
pub struct LlmConfig {
    /// Model identifier. If None, uses the provider default.
    pub model: Option<String>,
    /// Provider name (e.g. "openai", "anthropic"). If None along with
    /// `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,
    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,
    /// Sampling temperature. Default: 0.0; extraction must be repeatable.
    pub temperature: f32,
    /// Maximum tokens per response. Default: 8192; dense ledgers run long.
    pub max_tokens: usize,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 8192,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Settings for the pdfium-backed splitter and extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfConfig {
    /// PDF user password for encrypted packages.
    pub password: Option<String>,
    /// Pages with fewer text characters than this are treated as scans and
    /// rendered to an image. Default: 40.
    pub scanned_text_threshold: usize,
    /// Longest edge of a rendered scan in pixels. Default: 2000.
    pub max_rendered_pixels: u32,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            password: None,
            scanned_text_threshold: 40,
            max_rendered_pixels: 2000,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_pages_per_chunk(mut self, n: usize) -> Self {
        self.config.max_pages_per_chunk = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.config.retry.backoff_multiplier = m;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.retry.call_timeout = timeout;
        self
    }

    pub fn retry_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.config.retry.deadline = deadline;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.llm.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.llm.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.llm.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.llm.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.llm.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.llm.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.pdf.password = Some(pwd.into());
        self
    }

    pub fn scanned_text_threshold(mut self, chars: usize) -> Self {
        self.config.pdf.scanned_text_threshold = chars;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.pdf.max_rendered_pixels = px.max(100);
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.checkpoint_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn retry_failed(mut self, v: bool) -> Self {
        self.config.retry_failed = v;
        self
    }

    pub fn write_summary(mut self, v: bool) -> Self {
        self.config.write_summary = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = callback;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_pages_per_chunk == 0 {
            return Err(PipelineError::InvalidConfig(
                "max pages per chunk must be ≥ 1".into(),
            ));
        }
        let r = &c.retry;
        if r.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "retry max attempts must be ≥ 1".into(),
            ));
        }
        if !r.backoff_multiplier.is_finite() || r.backoff_multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "backoff multiplier must be ≥ 1.0, got {}",
                r.backoff_multiplier
            )));
        }
        if r.base_delay > r.max_delay {
            return Err(PipelineError::InvalidConfig(format!(
                "base delay {:?} exceeds max delay {:?}",
                r.base_delay, r.max_delay
            )));
        }
        if r.call_timeout == Some(Duration::ZERO) {
            return Err(PipelineError::InvalidConfig(
                "call timeout must be positive".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_pages_per_chunk, 30);
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay, Duration::from_secs(2));
        assert_eq!(c.retry.max_delay, Duration::from_secs(60));
        assert_eq!(c.retry.call_timeout, Some(Duration::from_secs(120)));
        assert_eq!(c.checkpoint_dir, PathBuf::from("data/checkpoints"));
        assert_eq!(c.work_root(), PathBuf::from("data/checkpoints/work"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let err = PipelineConfig::builder()
            .max_pages_per_chunk(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max pages per chunk"), "got: {err}");
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let c = PipelineConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        assert!(PipelineConfig::builder()
            .backoff_multiplier(0.5)
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .base_delay(Duration::from_secs(90))
            .build()
            .is_err());
    }

    #[test]
    fn output_path_is_named_after_job() {
        let c = PipelineConfig::builder().output_dir("/out").build().unwrap();
        let id = JobId::parse("pkg-00ff").unwrap();
        assert_eq!(c.output_path(&id), PathBuf::from("/out/pkg-00ff.csv"));
        assert_eq!(c.summary_path(&id), PathBuf::from("/out/pkg-00ff_SUMMARY.md"));
    }

    #[test]
    fn debug_hides_provider() {
        let dbg = format!("{:?}", PipelineConfig::default());
        assert!(dbg.contains("max_pages_per_chunk"));
        assert!(!dbg.contains("progress_callback"));
    }
}
