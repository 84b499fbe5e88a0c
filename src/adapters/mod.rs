//! Adapter interfaces for the external collaborators, plus the default
//! implementations.
//!
//! The runner only ever talks to these traits. Each stage has one adapter:
//!
//! ```text
//! split ──▶ extract ──▶ parse ──▶ (aggregate) ──▶ write
//! Splitter  Extractor   ChunkParser                OutputWriter
//! ```
//!
//! - [`input`]     : canonicalise a path or URL to a local file and fingerprint it
//! - [`pdf`]       : pdfium-backed [`Splitter`] and [`Extractor`]; pdfium is
//!   not async-safe, so every call runs in `spawn_blocking`
//! - [`encode`]    : PNG/base64 encoding of scanned pages
//! - [`llm`]       : [`ChunkParser`] that asks a chat model for JSON records
//! - [`csv_writer`]: [`OutputWriter`] producing a sectioned CSV workbook
//! - [`markdown`]  : Markdown summary written beside the workbook
//!
//! Every adapter reports failures as [`ToolError`]; the retry controller
//! classifies them. `probe` is called once before a stage starts and lets an
//! adapter report that it cannot work at all (missing library, missing
//! credentials) without burning retries on every chunk.

pub mod csv_writer;
pub mod encode;
pub mod input;
pub mod llm;
pub mod markdown;
pub mod pdf;

use crate::aggregate::ReportTables;
use crate::config::PipelineConfig;
use crate::error::ToolError;
use crate::model::{Chunk, ParseResult};
use crate::report::ReportType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A rendered page image, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub mime_type: String,
    pub data: String,
}

/// Content of one page as the extractor saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    /// 1-based page number in the source document.
    pub number: usize,
    pub text: String,
    /// Present for scanned pages with little or no text layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PageImage>,
    pub hint: ReportType,
}

/// Output of Extract for one chunk; persisted as a JSON artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk: usize,
    pub pages: Vec<ExtractedPage>,
    /// Dominant report type across the chunk's pages.
    pub hint: ReportType,
}

#[async_trait]
pub trait Splitter: Send + Sync {
    async fn probe(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Partition `input` into chunks of at most `max_pages_per_chunk` pages.
    /// Must be deterministic for the same input and limit.
    async fn split(&self, input: &Path, max_pages_per_chunk: usize) -> Result<Vec<Chunk>, ToolError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn probe(&self) -> Result<(), ToolError> {
        Ok(())
    }

    async fn extract(&self, chunk: &Chunk) -> Result<ExtractedChunk, ToolError>;
}

#[async_trait]
pub trait ChunkParser: Send + Sync {
    async fn probe(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Turn one chunk's content into zero or more typed results, in the
    /// order they appear in the chunk.
    async fn parse_chunk(
        &self,
        chunk: &Chunk,
        content: &ExtractedChunk,
        hint: ReportType,
    ) -> Result<Vec<ParseResult>, ToolError>;
}

#[async_trait]
pub trait OutputWriter: Send + Sync {
    async fn probe(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Write the workbook to `destination` and return the path written.
    async fn write_output(&self, tables: &ReportTables, destination: &Path) -> Result<PathBuf, ToolError>;
}

/// The four collaborators a runner needs.
#[derive(Clone)]
pub struct Adapters {
    pub splitter: Arc<dyn Splitter>,
    pub extractor: Arc<dyn Extractor>,
    pub parser: Arc<dyn ChunkParser>,
    pub writer: Arc<dyn OutputWriter>,
}

impl Adapters {
    /// pdfium for split/extract, the configured LLM for parsing, CSV output
    /// plus the Markdown summary unless it is switched off.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let writer: Arc<dyn OutputWriter> = if config.write_summary {
            Arc::new(markdown::WithSummary::new(csv_writer::CsvWorkbookWriter))
        } else {
            Arc::new(csv_writer::CsvWorkbookWriter)
        };
        Self {
            splitter: Arc::new(pdf::PdfiumSplitter::new(config.pdf.clone())),
            extractor: Arc::new(pdf::PdfiumExtractor::new(config.pdf.clone())),
            parser: Arc::new(llm::LlmChunkParser::new(config.llm.clone())),
            writer,
        }
    }
}
