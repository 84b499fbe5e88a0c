//! Input resolution: normalise a user-supplied path or URL to a local file
//! and derive the job identity from its bytes.
//!
//! ## Why copy downloads into the work directory?
//!
//! A job may be resumed hours later in a new process. Chunks reference the
//! file they were split from, so a download must live at a path that
//! survives the process: `<work_root>/<job-id>/source.pdf`. Local files are
//! used where they are.
//!
//! We validate the PDF magic bytes (`%PDF`) before returning so callers get a
//! meaningful error rather than a pdfium failure three stages later.

use crate::error::PipelineError;
use crate::model::JobId;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// The resolved input, either a local path or a downloaded temp file.
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is kept alive until the download is staged.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Everything the runner needs to start or resume a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: JobId,
    /// As supplied by the user.
    pub source: String,
    /// Local file to process.
    pub path: PathBuf,
    /// Hex SHA-256 of the file.
    pub fingerprint: String,
}

impl JobSpec {
    /// Fingerprint a local file and derive its job id.
    pub async fn from_file(source: &str, path: &Path) -> Result<Self, PipelineError> {
        let fingerprint = fingerprint_file(path).await?;
        Ok(Self {
            id: JobId::derive(path, &fingerprint),
            source: source.to_string(),
            path: path.to_path_buf(),
            fingerprint,
        })
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` and produce a [`JobSpec`] whose path stays valid across
/// runs. URL downloads are copied to `<work_root>/<job-id>/source.pdf`.
pub async fn stage_input(
    input: &str,
    work_root: &Path,
    timeout_secs: u64,
) -> Result<JobSpec, PipelineError> {
    let resolved = resolve_input(input, timeout_secs).await?;
    let spec = JobSpec::from_file(input, resolved.path()).await?;
    match resolved {
        ResolvedInput::Local(_) => Ok(spec),
        ResolvedInput::Downloaded { path, .. } => {
            let dir = work_root.join(spec.id.as_str());
            let staged = dir.join("source.pdf");
            if !staged.exists() {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| PipelineError::io(&dir, e))?;
                tokio::fs::copy(&path, &staged)
                    .await
                    .map_err(|e| PipelineError::io(&staged, e))?;
                debug!("Staged download at {}", staged.display());
            }
            Ok(JobSpec {
                path: staged,
                ..spec
            })
        }
    }
}

/// Resolve the input string to a local PDF file path.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, PipelineError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, PipelineError> {
    let path = PathBuf::from(path_str);

    if !path.is_file() {
        return Err(PipelineError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf { path, magic });
            }
        }
        Err(source) => return Err(PipelineError::Io { path, source }),
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, PipelineError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = extract_filename(url);
    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(PipelineError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::io(&file_path, e))?;

    info!("Downloaded {} bytes to {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL if it looks like a file name.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}

/// Hex SHA-256 of a file, streamed in 64 KiB blocks.
pub async fn fingerprint_file(path: &Path) -> Result<String, PipelineError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::io(path, e)
        }
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
