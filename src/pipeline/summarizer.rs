//! Summarization pipeline.
//!
//! Flow:
//! 1. Local short-circuit for short content (no model call)
//! 2. Single call for content that fits one chunk
//! 3. Otherwise map: each chunk summarized concurrently, bounded by
//!    `chunk_workers` and the governor's AI permits; results kept in chunk
//!    order whatever the completion order
//! 4. Reduce: one extra model call, or a local bullet join
//!
//! Every model response is checked for a safety block before its text is
//! read. A blocked call anywhere blocks the whole item.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::governor::Governor;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use crate::pipeline::chunker::{self, DEFAULT_CHUNK_CHARS, is_sentence_end};
use crate::pipeline::prompts;
use crate::pipeline::types::{Item, SourceKind, SummaryResult};
use crate::retry::{Classify, RetryError, RetryPolicy, Transience};

/// Text delivered in place of a summary the safety filter withheld.
pub const BLOCKED_MESSAGE: &str =
    "This item could not be summarized because the AI provider's safety filter blocked it.";

/// Content up to this many chars is returned as-is.
const SHORT_TEXT_CHARS: usize = 50;

/// Content up to this many chars is merged locally from its first and
/// last sentence.
const LOCAL_MERGE_CHARS: usize = 100;

const CHUNK_MAX_TOKENS: u32 = 300;
const FINAL_MAX_TOKENS: u32 = 1000;
const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Capacity of the per-attempt delta channel.
const DELTA_BUFFER: usize = 32;

/// Default number of chunks summarized concurrently per item.
pub const DEFAULT_CHUNK_WORKERS: usize = 5;

/// What to do when a chunk cannot be summarized after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkFailurePolicy {
    /// Substitute a placeholder and continue. The item still fails if no
    /// chunk succeeds.
    #[default]
    Placeholder,
    /// Fail the whole item.
    FailItem,
}

impl FromStr for ChunkFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "placeholder" | "skip" => Ok(ChunkFailurePolicy::Placeholder),
            "fail" | "fail_item" | "fail-item" => Ok(ChunkFailurePolicy::FailItem),
            other => Err(format!("expected 'placeholder' or 'fail', got '{other}'")),
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunk_chars: usize,
    pub chunk_workers: usize,
    pub reduce_with_model: bool,
    pub chunk_failure: ChunkFailurePolicy,
    /// Source kinds whose summaries are streamed to sinks as they form.
    pub stream_kinds: HashSet<SourceKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_chars: DEFAULT_CHUNK_CHARS,
            chunk_workers: DEFAULT_CHUNK_WORKERS,
            reduce_with_model: true,
            chunk_failure: ChunkFailurePolicy::default(),
            stream_kinds: HashSet::from([SourceKind::ChatMessage]),
        }
    }
}

/// Receives incremental summary text.
pub type PartialSender = mpsc::Sender<String>;

/// Usable text, or the reason the safety filter gave.
enum ModelOutput {
    Text(String),
    Blocked(String),
}

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("hub is shutting down")]
    Shutdown,
}

impl Classify for CallError {
    fn transience(&self) -> Transience {
        match self {
            CallError::Llm(e) => e.transience(),
            CallError::Shutdown => Transience::Permanent,
        }
    }
}

fn is_shutdown(err: &RetryError<CallError>) -> bool {
    matches!(err.inner(), CallError::Shutdown)
}

/// Turns item content into a [`SummaryResult`].
pub struct Summarizer {
    llm: Arc<dyn LlmProvider>,
    governor: Governor,
    retry: RetryPolicy,
    config: PipelineConfig,
}

impl Summarizer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        governor: Governor,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            governor,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether items of `kind` should use [`Summarizer::summarize_streaming`].
    pub fn streams(&self, kind: SourceKind) -> bool {
        self.config.stream_kinds.contains(&kind)
    }

    pub async fn summarize(&self, item: &Item, content: &str) -> Result<SummaryResult, PipelineError> {
        self.run(item, content, None).await
    }

    /// Like [`Summarizer::summarize`], sending partial text to `partial_tx`
    /// as it forms: provider deltas for single-chunk content, each chunk
    /// summary for longer content.
    pub async fn summarize_streaming(
        &self,
        item: &Item,
        content: &str,
        partial_tx: PartialSender,
    ) -> Result<SummaryResult, PipelineError> {
        self.run(item, content, Some(partial_tx)).await
    }

    async fn run(
        &self,
        item: &Item,
        content: &str,
        partials: Option<PartialSender>,
    ) -> Result<SummaryResult, PipelineError> {
        let text = content.trim();

        if let Some(local) = local_summary(text) {
            debug!(item = %item.identity(), "Short content, summarized locally");
            if let Some(tx) = &partials {
                let _ = tx.send(local.clone()).await;
            }
            let mut result = SummaryResult::new(item, local.clone(), vec![local]);
            result.short_circuited = true;
            return Ok(result);
        }

        let chunks = chunker::chunk_text(text, self.config.chunk_chars);
        if chunks.len() <= 1 {
            return self.summarize_single(item, text, partials).await;
        }
        self.summarize_chunked(item, &chunks, partials).await
    }

    async fn summarize_single(
        &self,
        item: &Item,
        text: &str,
        partials: Option<PartialSender>,
    ) -> Result<SummaryResult, PipelineError> {
        let request = self.request(item.source_kind, prompts::single_prompt(item, text), FINAL_MAX_TOKENS);
        let label = format!("summarize {}", item.identity());

        match self.call(&label, request, partials.as_ref()).await {
            Ok(ModelOutput::Text(summary)) => Ok(SummaryResult::new(item, summary.clone(), vec![summary])),
            Ok(ModelOutput::Blocked(reason)) => Ok(blocked(item, &reason)),
            Err(err) if is_shutdown(&err) => Err(PipelineError::Shutdown),
            Err(err) => Err(PipelineError::Summarize(err.to_string())),
        }
    }

    async fn summarize_chunked(
        &self,
        item: &Item,
        chunks: &[String],
        partials: Option<PartialSender>,
    ) -> Result<SummaryResult, PipelineError> {
        let identity = item.identity();
        let total = chunks.len();
        info!(item = %identity, chunks = total, "Summarizing in chunks");

        // Collected first so the spawned worker future stays `Send`.
        let calls: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let request = self.request(
                    item.source_kind,
                    prompts::chunk_prompt(item, chunk, index, total),
                    CHUNK_MAX_TOKENS,
                );
                let label = format!("summarize {identity} part {}/{total}", index + 1);
                async move { (index, self.call(&label, request, None).await) }
            })
            .collect();
        let mut outcomes = stream::iter(calls).buffer_unordered(self.config.chunk_workers.max(1));

        let mut slots: Vec<Option<String>> = vec![None; total];
        let mut failures = 0;
        let mut last_error = String::new();

        while let Some((index, outcome)) = outcomes.next().await {
            match outcome {
                Ok(ModelOutput::Text(summary)) => {
                    if let Some(tx) = &partials {
                        let _ = tx.send(summary.clone()).await;
                    }
                    slots[index] = Some(summary);
                }
                // Remaining chunk calls are dropped with the stream.
                Ok(ModelOutput::Blocked(reason)) => return Ok(blocked(item, &reason)),
                Err(err) if is_shutdown(&err) => return Err(PipelineError::Shutdown),
                Err(err) => {
                    let reason = err.to_string();
                    if self.config.chunk_failure == ChunkFailurePolicy::FailItem {
                        return Err(PipelineError::ChunkFailed {
                            index: index + 1,
                            total,
                            reason,
                        });
                    }
                    warn!(
                        item = %identity,
                        part = index + 1,
                        total,
                        error = %reason,
                        "Chunk could not be summarized, using placeholder"
                    );
                    failures += 1;
                    last_error = reason;
                }
            }
        }

        if failures == total {
            return Err(PipelineError::Summarize(format!(
                "all {total} parts failed, last error: {last_error}"
            )));
        }

        let succeeded: Vec<String> = slots.iter().flatten().cloned().collect();
        let partial: Vec<String> = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| placeholder(i, total)))
            .collect();

        let text = if self.config.reduce_with_model {
            let request = self.request(
                item.source_kind,
                prompts::reduce_prompt(item, &succeeded),
                FINAL_MAX_TOKENS,
            );
            match self.call(&format!("reduce {identity}"), request, None).await {
                Ok(ModelOutput::Text(text)) => text,
                Ok(ModelOutput::Blocked(reason)) => return Ok(blocked(item, &reason)),
                Err(err) if is_shutdown(&err) => return Err(PipelineError::Shutdown),
                Err(err) => {
                    warn!(item = %identity, error = %err, "Reduce call failed, joining part summaries locally");
                    join_locally(&partial)
                }
            }
        } else {
            join_locally(&partial)
        };

        Ok(SummaryResult::new(item, text, partial))
    }

    fn request(&self, kind: SourceKind, prompt: String, max_tokens: u32) -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system(prompts::system_prompt(kind)),
            ChatMessage::user(prompt),
        ])
        .with_temperature(SUMMARY_TEMPERATURE)
        .with_max_tokens(max_tokens)
    }

    /// One retry-wrapped model call. Each attempt holds one AI permit.
    ///
    /// Deltas are forwarded only until an attempt has sent any: a retry
    /// after a partly streamed failure runs single-shot, so sinks never
    /// see the same opening twice.
    async fn call(
        &self,
        label: &str,
        request: CompletionRequest,
        deltas: Option<&PartialSender>,
    ) -> Result<ModelOutput, RetryError<CallError>> {
        let streamed = AtomicBool::new(false);
        let streamed = &streamed;
        self.retry
            .run(label, || {
                let request = request.clone();
                async move {
                    let _permit = self
                        .governor
                        .ai_permit()
                        .await
                        .map_err(|_| CallError::Shutdown)?;
                    let response = match deltas {
                        Some(tx) if !streamed.load(Ordering::SeqCst) => {
                            self.stream_attempt(request, tx, streamed).await?
                        }
                        _ => self.llm.complete(request).await?,
                    };
                    read_output(self.llm.model_name(), response)
                }
            })
            .await
    }

    /// Streamed attempt; records in `streamed` once a delta reaches `tx`.
    async fn stream_attempt(
        &self,
        request: CompletionRequest,
        tx: &PartialSender,
        streamed: &AtomicBool,
    ) -> Result<CompletionResponse, LlmError> {
        let (attempt_tx, mut attempt_rx) = mpsc::channel::<String>(DELTA_BUFFER);
        let forward = async {
            while let Some(delta) = attempt_rx.recv().await {
                streamed.store(true, Ordering::SeqCst);
                let _ = tx.send(delta).await;
            }
        };
        let (response, ()) = tokio::join!(self.llm.complete_stream(request, attempt_tx), forward);
        response
    }
}

/// Check the safety verdict before touching the text.
fn read_output(provider: &str, response: CompletionResponse) -> Result<ModelOutput, CallError> {
    if let FinishReason::Safety(reason) = response.finish_reason {
        return Ok(ModelOutput::Blocked(reason));
    }
    match response.content.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(ModelOutput::Text(text.to_string())),
        _ => Err(CallError::Llm(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!(
                "response carried no text (finish reason {:?})",
                response.finish_reason
            ),
        })),
    }
}

fn blocked(item: &Item, reason: &str) -> SummaryResult {
    warn!(item = %item.identity(), reason, "Summary blocked by safety filter");
    let mut result = SummaryResult::new(item, BLOCKED_MESSAGE.to_string(), Vec::new());
    result.safety_blocked = true;
    result
}

fn placeholder(index: usize, total: usize) -> String {
    format!("[part {}/{total} could not be summarized]", index + 1)
}

fn join_locally(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summary computed without a model, for short content.
pub fn local_summary(text: &str) -> Option<String> {
    let len = text.chars().count();
    if len <= SHORT_TEXT_CHARS {
        return Some(text.to_string());
    }
    if len > LOCAL_MERGE_CHARS {
        return None;
    }
    let sentences = split_sentences(text);
    Some(match sentences.as_slice() {
        [] => text.to_string(),
        [only] => (*only).to_string(),
        [first, .., last] => format!("{first} {last}"),
    })
}

/// Split on sentence-ending punctuation followed by whitespace, and on
/// line breaks.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let next_is_space = chars.peek().is_none_or(|(_, n)| n.is_whitespace());
        if c == '\n' || (is_sentence_end(c) && next_is_space) {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
