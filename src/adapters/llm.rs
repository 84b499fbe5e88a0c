//! LLM-backed chunk parser.
//!
//! One chat call per chunk: the system prompt fixes the output contract, the
//! user message carries the chunk's page text plus any scanned page images.
//! All prompt text lives in [`crate::prompts`].
//!
//! This adapter does not retry. It reports each failure as a [`ToolError`]
//! whose variant tells the retry controller what to do, so quota exhaustion
//! pauses the job instead of being hammered with retries.
//!
//! The provider is resolved lazily on the first `probe`, so a job whose parse
//! stage is already complete never needs credentials.

use super::{encode, ChunkParser, ExtractedChunk};
use crate::config::LlmConfig;
use crate::error::ToolError;
use crate::model::{Chunk, ParseResult, Record};
use crate::prompts::{chunk_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::report::ReportType;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

pub struct LlmChunkParser {
    config: LlmConfig,
    provider: OnceCell<Arc<dyn LLMProvider>>,
}

impl LlmChunkParser {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            provider: OnceCell::new(),
        }
    }

    async fn provider(&self) -> Result<Arc<dyn LLMProvider>, ToolError> {
        self.provider
            .get_or_try_init(|| async { resolve_provider(&self.config) })
            .await
            .cloned()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ToolError> {
    ProviderFactory::create_llm_provider(provider_name, model)
        .map_err(|e| ToolError::Unavailable(format!("provider '{provider_name}': {e}")))
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. a pre-built provider on the config;
/// 2. a named provider plus model;
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 4. OpenAI when `OPENAI_API_KEY` is present;
/// 5. whatever [`ProviderFactory::from_env`] detects.
fn resolve_provider(config: &LlmConfig) -> Result<Arc<dyn LLMProvider>, ToolError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        ToolError::Unavailable(format!(
            "no LLM provider could be detected from the environment; \
set OPENAI_API_KEY, ANTHROPIC_API_KEY or --provider ({e})"
        ))
    })?;
    Ok(llm_provider)
}

fn build_options(config: &LlmConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl ChunkParser for LlmChunkParser {
    async fn probe(&self) -> Result<(), ToolError> {
        self.provider().await.map(|_| ())
    }

    async fn parse_chunk(
        &self,
        chunk: &Chunk,
        content: &ExtractedChunk,
        hint: ReportType,
    ) -> Result<Vec<ParseResult>, ToolError> {
        let provider = self.provider().await?;
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let images: Vec<_> = content
            .pages
            .iter()
            .filter_map(|p| p.image.as_ref())
            .map(encode::to_image_data)
            .collect();
        let user_text = chunk_prompt(chunk, content, hint);
        let user = if images.is_empty() {
            ChatMessage::user(user_text)
        } else {
            ChatMessage::user_with_images(user_text, images)
        };
        let messages = vec![ChatMessage::system(system_prompt), user];

        let response = provider
            .chat(&messages, Some(&build_options(&self.config)))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;
        debug!(
            "Chunk {}: {} input tokens, {} output tokens",
            chunk.index, response.prompt_tokens, response.completion_tokens
        );

        parse_response(chunk.index, hint, &response.content)
    }
}

// ── Failure classification ───────────────────────────────────────────────

static RE_EXHAUSTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)insufficient_quota|quota\s+exceeded|exceeded\s+your\s+(current\s+)?quota|credit\s+balance|billing|usage\s+limit|token\s+limit|out\s+of\s+credits",
    )
    .unwrap()
});

static RE_AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b401\b|\b403\b|unauthori[sz]ed|invalid[\s_]api[\s_]key|authentication|permission\s+denied|api\s+key\s+not\s+(set|found)")
        .unwrap()
});

static RE_RATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[\s_-]?limit|\b429\b|too\s+many\s+requests|overloaded|capacity").unwrap()
});

static RE_RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[\s_-]?after\D{0,3}(\d+)").unwrap());

static RE_PERMANENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b400\b|invalid\s+request|context\s+length|maximum\s+context|content\s+policy")
        .unwrap()
});

/// Map a provider error message onto a [`ToolError`].
///
/// Checked in order: quota exhaustion, credentials, rate limiting, malformed
/// request. Anything else (timeouts, 5xx, dropped connections) is transient.
pub fn classify_provider_error(message: &str) -> ToolError {
    if RE_EXHAUSTED.is_match(message) {
        ToolError::ResourceExhausted(message.to_string())
    } else if RE_AUTH.is_match(message) {
        ToolError::Unavailable(message.to_string())
    } else if RE_RATE.is_match(message) {
        ToolError::RateLimited {
            message: message.to_string(),
            retry_after_secs: RE_RETRY_AFTER
                .captures(message)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
        }
    } else if RE_PERMANENT.is_match(message) {
        ToolError::Permanent(message.to_string())
    } else {
        ToolError::Transient(message.to_string())
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*\n(.*?)\n?\s*```\s*$").unwrap());

/// Strip a single surrounding code fence, if any.
fn strip_fences(raw: &str) -> &str {
    match RE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

/// Turn the model's reply into parse results.
///
/// Accepts `{"reports": [...]}`, a bare array of reports, or a bare array of
/// records (labelled with `hint`). Invalid JSON is a permanent failure:
/// asking again with the same content rarely fixes it.
pub fn parse_response(chunk: usize, hint: ReportType, raw: &str) -> Result<Vec<ParseResult>, ToolError> {
    let body = strip_fences(raw);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ToolError::Permanent(format!("response is not valid JSON: {e}")))?;

    let reports = match value {
        Value::Object(mut obj) => match obj.remove("reports") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ToolError::Permanent("'reports' is not an array".into()));
            }
            None if obj.contains_key("records") => vec![Value::Object(obj)],
            None => return Err(ToolError::Permanent("response has no 'reports' key".into())),
        },
        Value::Array(items) if items.iter().all(|i| i.get("records").is_some()) => items,
        Value::Array(items) => {
            let records = items.into_iter().filter_map(into_record).collect();
            return Ok(vec![ParseResult::success(chunk, hint, records)]);
        }
        _ => return Err(ToolError::Permanent("response is not a JSON object".into())),
    };

    let mut results: Vec<ParseResult> = Vec::new();
    for report in reports {
        let Value::Object(mut report) = report else {
            continue;
        };
        let report_type = report
            .get("report_type")
            .and_then(Value::as_str)
            .and_then(ReportType::from_label)
            .unwrap_or(hint);
        let records: Vec<Record> = match report.remove("records") {
            Some(Value::Array(items)) => items.into_iter().filter_map(into_record).collect(),
            _ => Vec::new(),
        };
        // A model sometimes splits one report into several entries.
        match results.iter_mut().find(|r| r.report_type == report_type) {
            Some(existing) => existing.records.extend(records),
            None => results.push(ParseResult::success(chunk, report_type, records)),
        }
    }
    Ok(results)
}

fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&LlmConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(8192));
    }

    #[test]
    fn quota_messages_pause_the_job() {
        for msg in [
            "Error code: 429 - insufficient_quota",
            "You exceeded your current quota, please check your plan and billing details",
            "Your credit balance is too low to access the API",
        ] {
            assert!(
                matches!(classify_provider_error(msg), ToolError::ResourceExhausted(_)),
                "{msg}"
            );
        }
    }

    #[test]
    fn rate_limits_are_transient_with_retry_after() {
        match classify_provider_error("429 Too Many Requests; retry-after: 20") {
            ToolError::RateLimited {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, Some(20)),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            classify_provider_error("Overloaded"),
            ToolError::RateLimited { .. }
        ));
    }

    #[test]
    fn credentials_and_bad_requests() {
        assert!(matches!(
            classify_provider_error("401 Unauthorized: invalid api key"),
            ToolError::Unavailable(_)
        ));
        assert!(matches!(
            classify_provider_error("400 maximum context length exceeded"),
            ToolError::Permanent(_)
        ));
        assert!(matches!(
            classify_provider_error("error sending request: connection reset by peer"),
            ToolError::Transient(_)
        ));
    }

    #[test]
    fn parses_fenced_multi_report_reply() {
        let raw = "```json\n{\"reports\": [\
            {\"report_type\": \"balance_sheet\", \"records\": [{\"account_code\": \"1010\"}]},\
            {\"report_type\": \"Check Disbursements\", \"records\": [{\"check_number\": \"1042\"}, 7]},\
            {\"report_type\": \"balance_sheet\", \"records\": [{\"account_code\": \"1020\"}]}\
        ]}\n```";
        let results = parse_response(3, ReportType::Unknown, raw).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].report_type, ReportType::BalanceSheet);
        assert_eq!(results[0].records.len(), 2);
        assert_eq!(results[1].report_type, ReportType::Disbursements);
        assert_eq!(results[1].records.len(), 1);
        assert!(results.iter().all(|r| r.chunk == 3 && r.is_success()));
    }

    #[test]
    fn bare_record_array_uses_hint() {
        let results =
            parse_response(0, ReportType::Invoice, r#"[{"invoice_id": "A-1", "amount": 12.5}]"#)
                .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].report_type, ReportType::Invoice);
    }

    #[test]
    fn prose_reply_is_permanent() {
        let err = parse_response(0, ReportType::Invoice, "Sorry, I cannot read this page.").unwrap_err();
        assert!(matches!(err, ToolError::Permanent(_)));
    }

    #[test]
    fn empty_reply_has_no_results() {
        assert!(parse_response(0, ReportType::Invoice, "  ").unwrap().is_empty());
    }
}
