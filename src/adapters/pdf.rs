//! pdfium-backed splitter and extractor.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! runner's other chunks keep making progress.
//!
//! ## Text first, pixels only for scans
//!
//! Most pages of an accounting package are generated reports with a text
//! layer. Pages whose text layer is (nearly) empty are scans of vendor
//! invoices; only those are rendered and handed to the parser as images.
//!
//! ## Binding
//!
//! `PDFIUM_LIB_PATH` may point at the pdfium shared library (or the
//! directory holding it). Otherwise the library next to the executable or in
//! the system search path is used. Failing to bind is reported from `probe`
//! as [`ToolError::Unavailable`], which stops the job before any chunk runs.

use super::{encode, ExtractedChunk, ExtractedPage, Extractor, Splitter};
use crate::config::PdfConfig;
use crate::detect;
use crate::error::ToolError;
use crate::model::Chunk;
use crate::report::ReportType;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(target_os = "windows")]
const LIBRARY_NAME: &str = "pdfium.dll";
#[cfg(target_os = "macos")]
const LIBRARY_NAME: &str = "libpdfium.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_NAME: &str = "libpdfium.so";

/// Bind to a pdfium library.
fn bind_pdfium() -> Result<Pdfium, ToolError> {
    let unavailable = |e: PdfiumError| {
        ToolError::Unavailable(format!(
            "cannot load the pdfium library ({e:?}); set PDFIUM_LIB_PATH to libpdfium"
        ))
    };

    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(raw) => {
            let mut path = PathBuf::from(raw);
            if path.is_dir() {
                path = path.join(LIBRARY_NAME);
            }
            Pdfium::bind_to_library(path.to_string_lossy().into_owned()).map_err(unavailable)?
        }
        None => {
            let local = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(LIBRARY_NAME)))
                .filter(|p| p.is_file());
            match local {
                Some(path) => Pdfium::bind_to_library(path.to_string_lossy().into_owned())
                    .or_else(|_| Pdfium::bind_to_system_library())
                    .map_err(unavailable)?,
                None => Pdfium::bind_to_system_library().map_err(unavailable)?,
            }
        }
    };
    Ok(Pdfium::new(bindings))
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, ToolError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.to_lowercase().contains("password") {
            if password.is_some() {
                ToolError::Permanent(format!("wrong password for '{}'", path.display()))
            } else {
                ToolError::Permanent(format!(
                    "'{}' is encrypted; provide --password",
                    path.display()
                ))
            }
        } else if err_str.contains("FileNotFound") || !path.exists() {
            ToolError::Permanent(format!("'{}' not found", path.display()))
        } else {
            ToolError::Permanent(format!("'{}' is not a readable PDF: {err_str}", path.display()))
        }
    })
}

async fn run_blocking<T, F>(task: F) -> Result<T, ToolError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ToolError::Transient(format!("pdfium task panicked: {e}")))?
}

// ── Splitter ─────────────────────────────────────────────────────────────

pub struct PdfiumSplitter {
    config: PdfConfig,
}

impl PdfiumSplitter {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Splitter for PdfiumSplitter {
    async fn probe(&self) -> Result<(), ToolError> {
        run_blocking(|| bind_pdfium().map(|_| ())).await
    }

    async fn split(&self, input: &Path, max_pages_per_chunk: usize) -> Result<Vec<Chunk>, ToolError> {
        let path = input.to_path_buf();
        let password = self.config.password.clone();
        let total = run_blocking(move || {
            let pdfium = bind_pdfium()?;
            let document = open_document(&pdfium, &path, password.as_deref())?;
            Ok(document.pages().len() as usize)
        })
        .await?;

        if total == 0 {
            return Err(ToolError::Permanent(format!(
                "'{}' has no pages",
                input.display()
            )));
        }
        let chunks = Chunk::plan(total, max_pages_per_chunk, input);
        info!("PDF has {} pages → {} chunks", total, chunks.len());
        Ok(chunks)
    }
}

// ── Extractor ────────────────────────────────────────────────────────────

pub struct PdfiumExtractor {
    config: PdfConfig,
}

impl PdfiumExtractor {
    pub fn new(config: PdfConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Extractor for PdfiumExtractor {
    async fn probe(&self) -> Result<(), ToolError> {
        run_blocking(|| bind_pdfium().map(|_| ())).await
    }

    async fn extract(&self, chunk: &Chunk) -> Result<ExtractedChunk, ToolError> {
        let chunk = chunk.clone();
        let config = self.config.clone();
        run_blocking(move || extract_blocking(&chunk, &config)).await
    }
}

fn extract_blocking(chunk: &Chunk, config: &PdfConfig) -> Result<ExtractedChunk, ToolError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, &chunk.source, config.password.as_deref())?;
    let pages = document.pages();
    let total = pages.len() as usize;
    if chunk.pages.end > total {
        return Err(ToolError::Permanent(format!(
            "chunk {} covers pages {} but the document has {total}",
            chunk.index, chunk.pages
        )));
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(config.max_rendered_pixels as i32)
        .set_maximum_height(config.max_rendered_pixels as i32);

    let mut extracted = Vec::with_capacity(chunk.pages.len());
    for number in chunk.pages.pages() {
        let page = pages.get((number - 1) as u16).map_err(|e| {
            ToolError::Permanent(format!("page {number} cannot be opened: {e:?}"))
        })?;
        let text = page.text().map(|t| t.all()).unwrap_or_default();

        let image = if text.trim().chars().count() < config.scanned_text_threshold {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                ToolError::Permanent(format!("page {number} cannot be rendered: {e:?}"))
            })?;
            let img = bitmap.as_image();
            debug!("Rendered scanned page {} → {}x{} px", number, img.width(), img.height());
            let encoded = encode::encode_page(&img).map_err(|e| {
                ToolError::Permanent(format!("page {number} cannot be encoded: {e}"))
            })?;
            Some(encoded)
        } else {
            None
        };

        extracted.push(ExtractedPage {
            number,
            hint: detect::detect_page(&text),
            text,
            image,
        });
    }

    let hints: Vec<_> = extracted.iter().map(|p| p.hint).collect();
    let scanned = extracted.iter().filter(|p| p.image.is_some()).count();
    debug!(
        "Chunk {}: extracted {} pages ({} scanned)",
        chunk.index,
        extracted.len(),
        scanned
    );

    // Scans in these packages are vendor invoices.
    let mut hint = detect::dominant(&hints);
    if hint == ReportType::Unknown && scanned == extracted.len() {
        hint = ReportType::Invoice;
    }

    Ok(ExtractedChunk {
        chunk: chunk.index,
        pages: extracted,
        hint,
    })
}
