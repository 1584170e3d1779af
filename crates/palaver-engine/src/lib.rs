use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use palaver_contracts::chat::Conversation;
use palaver_contracts::events::SessionLog;
use palaver_contracts::stream::{ImageStreamEvent, TextStreamEvent};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::ACCEPT;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEXT_MODEL: &str = "gpt-5";
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";

/// Upper bound the Images API accepts for in-progress preview frames.
pub const PARTIAL_IMAGES_MAX: u64 = 4;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Environment-supplied configuration, read once at startup and treated
/// as opaque parameters afterwards.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub api_key: String,
    pub text_model: String,
    pub image_model: String,
    pub web_search: bool,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let Some(api_key) =
            non_empty_env("OPENAI_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY_BACKUP"))
        else {
            bail!("Missing OPENAI_API_KEY. Export it before starting a session.");
        };
        Ok(Self {
            api_base: api_base_from_env(),
            api_key,
            text_model: non_empty_env("OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            image_model: non_empty_env("OPENAI_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            web_search: non_empty_env("ENABLE_WEB_SEARCH")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

fn api_base_from_env() -> String {
    env::var("OPENAI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

/// One text turn as handed to the relay. Instructions are resent every
/// turn; the remote side does not retain them across responses.
#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub user_text: String,
    pub instructions: String,
    pub model: String,
    pub web_search: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum ChatUpdate<'a> {
    /// A delta arrived; `text` is the whole accumulator so far.
    Delta { delta: &'a str, text: &'a str },
    /// A vendor-reported mid-stream problem; draining continues.
    StreamError { message: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOutcome {
    pub text: String,
    pub response_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    pub model: String,
    pub partial_images: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum ImageUpdate<'a> {
    /// An in-progress preview frame; `index` is 1-based arrival order.
    Partial { index: usize, bytes: &'a [u8] },
    /// The frame to keep. `fallback` marks a last-partial stand-in for
    /// a stream that never produced a recognized terminal event.
    Final { bytes: &'a [u8], fallback: bool },
    StreamError { message: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    pub bytes: Option<Vec<u8>>,
    pub fallback: bool,
    pub partials: usize,
    pub sha256: Option<String>,
}

/// Blocking relay over the remote text and image endpoints. One request
/// is in flight at a time; each streamed call blocks while its events
/// are drained and surfaces updates through the per-call callback.
pub struct RelayEngine {
    http: HttpClient,
    config: EngineConfig,
    events: SessionLog,
}

impl RelayEngine {
    pub fn new(config: EngineConfig, events: SessionLog) -> Result<Self> {
        // No client-wide timeout: a streamed response stays open until
        // its event stream drains.
        let http = HttpClient::builder()
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &SessionLog {
        &self.events
    }

    /// Relay one user turn to the text endpoint and reduce its event
    /// stream, surfacing partial text through `on_update` as it
    /// arrives.
    ///
    /// On success the exchange is committed to `conversation` and the
    /// outcome returned; `Ok(None)` means the stream produced no text
    /// at all (nothing stored, nothing to show). On error the
    /// conversation is left exactly as it was before the call.
    pub fn send_turn(
        &self,
        request: &ChatTurnRequest,
        conversation: &mut Conversation,
        on_update: &mut dyn FnMut(ChatUpdate<'_>),
    ) -> Result<Option<ChatOutcome>> {
        let previous_response_id = conversation.last_response_id().map(str::to_string);
        match self.send_turn_inner(request, previous_response_id.as_deref(), on_update) {
            Ok(Some(outcome)) => {
                conversation.commit_exchange(
                    &request.user_text,
                    &outcome.text,
                    outcome.response_id.clone(),
                );
                let _ = self.events.emit(
                    "turn_completed",
                    json_object(json!({
                        "model": request.model,
                        "response_id": outcome.response_id,
                        "chars": outcome.text.chars().count(),
                        "turns": conversation.len(),
                    })),
                );
                Ok(Some(outcome))
            }
            Ok(None) => {
                let _ = self.events.emit(
                    "turn_empty",
                    json_object(json!({ "model": request.model })),
                );
                Ok(None)
            }
            Err(err) => {
                let _ = self.events.emit(
                    "turn_failed",
                    json_object(json!({
                        "model": request.model,
                        "error": format!("{err:#}"),
                    })),
                );
                Err(err)
            }
        }
    }

    fn send_turn_inner(
        &self,
        request: &ChatTurnRequest,
        previous_response_id: Option<&str>,
        on_update: &mut dyn FnMut(ChatUpdate<'_>),
    ) -> Result<Option<ChatOutcome>> {
        let payload = build_responses_payload(request, previous_response_id);
        let endpoint = format!("{}/responses", self.config.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI responses request failed ({endpoint})"))?;
        let response = ensure_success("OpenAI responses", response)?;

        let reduction = reduce_text_events(SseReader::new(BufReader::new(response)), on_update)?;
        Ok(resolve_turn_outcome(&reduction))
    }

    /// Relay one image prompt to the image endpoint and reduce its
    /// event stream. Independent of any prior call; nothing persists
    /// across invocations.
    pub fn generate_image(
        &self,
        request: &ImageGenerationRequest,
        on_update: &mut dyn FnMut(ImageUpdate<'_>),
    ) -> Result<ImageOutcome> {
        let events = self.events.clone();
        let mut observed = |update: ImageUpdate<'_>| {
            if let ImageUpdate::Partial { index, bytes } = update {
                let _ = events.emit(
                    "image_partial",
                    json_object(json!({ "index": index, "byte_len": bytes.len() })),
                );
            }
            on_update(update);
        };
        match self.generate_image_inner(request, &mut observed) {
            Ok(outcome) => {
                if outcome.bytes.is_some() {
                    let _ = self.events.emit(
                        "image_completed",
                        json_object(json!({
                            "model": request.model,
                            "fallback": outcome.fallback,
                            "partials": outcome.partials,
                            "sha256": outcome.sha256,
                        })),
                    );
                } else {
                    let _ = self.events.emit(
                        "image_empty",
                        json_object(json!({ "model": request.model })),
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                let _ = self.events.emit(
                    "image_failed",
                    json_object(json!({
                        "model": request.model,
                        "error": format!("{err:#}"),
                    })),
                );
                Err(err)
            }
        }
    }

    fn generate_image_inner(
        &self,
        request: &ImageGenerationRequest,
        on_update: &mut dyn FnMut(ImageUpdate<'_>),
    ) -> Result<ImageOutcome> {
        let payload = build_image_payload(request);
        let endpoint = format!("{}/images/generations", self.config.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI images request failed ({endpoint})"))?;
        let response = ensure_success("OpenAI images", response)?;

        let reduction = reduce_image_events(SseReader::new(BufReader::new(response)), on_update)?;
        let sha256 = reduction.bytes.as_deref().map(sha256_hex);
        Ok(ImageOutcome {
            bytes: reduction.bytes,
            fallback: reduction.fallback,
            partials: reduction.partials,
            sha256,
        })
    }
}

pub fn clamp_partial_images(requested: u64) -> u64 {
    requested.min(PARTIAL_IMAGES_MAX)
}

fn is_gpt_image_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("gpt-image")
}

fn build_responses_payload(request: &ChatTurnRequest, previous_response_id: Option<&str>) -> Value {
    let tools = if request.web_search {
        json!([{ "type": "web_search_preview" }])
    } else {
        json!([])
    };
    let mut payload = json_object(json!({
        "model": request.model,
        "instructions": request.instructions,
        "input": request.user_text,
        "tools": tools,
        "stream": true,
    }));
    if let Some(id) = previous_response_id {
        payload.insert(
            "previous_response_id".to_string(),
            Value::String(id.to_string()),
        );
    }
    Value::Object(payload)
}

fn build_image_payload(request: &ImageGenerationRequest) -> Value {
    let mut payload = json_object(json!({
        "model": request.model,
        "prompt": request.prompt,
        "n": 1,
        "stream": true,
        "partial_images": clamp_partial_images(request.partial_images),
    }));
    if is_gpt_image_model(&request.model) {
        payload.insert("moderation".to_string(), Value::String("low".to_string()));
    }
    Value::Object(payload)
}

fn ensure_success(kind: &str, response: HttpResponse) -> Result<HttpResponse> {
    if response.status().is_success() {
        return Ok(response);
    }
    let code = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    bail!(
        "{kind} request failed ({code}): {}",
        truncate_text(&body, 512)
    )
}

/// Server-sent-events frames decoded to JSON over a blocking reader.
///
/// `data:` lines accumulate until a blank line ends the event
/// (multi-line payloads join with newlines); `[DONE]` ends the stream;
/// unparseable payloads and non-data lines are skipped. A trailing
/// event with no blank-line terminator (connection cut mid-stream) is
/// still decoded.
struct SseReader<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseReader<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut data_lines: Vec<String> = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.reader.read_line(&mut line) {
                Ok(read) => read,
                Err(err) => {
                    self.done = true;
                    return Some(Err(
                        anyhow::Error::new(err).context("event stream read failed")
                    ));
                }
            };
            if read == 0 {
                self.done = true;
                if data_lines.is_empty() {
                    return None;
                }
                let data = data_lines.join("\n");
                if data.trim() == "[DONE]" {
                    return None;
                }
                return serde_json::from_str::<Value>(&data).ok().map(Ok);
            }

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                if data_lines.is_empty() {
                    continue;
                }
                let data = data_lines.join("\n");
                data_lines.clear();
                if data.trim() == "[DONE]" {
                    self.done = true;
                    return None;
                }
                match serde_json::from_str::<Value>(&data) {
                    Ok(value) => return Some(Ok(value)),
                    Err(_) => continue,
                }
            }
            if let Some(rest) = trimmed.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // `event:`/`id:` lines carry nothing we need; the event kind
            // rides inside the JSON `type` field.
        }
    }
}

struct TextReduction {
    text: String,
    final_response: Option<Value>,
}

fn reduce_text_events(
    events: impl Iterator<Item = Result<Value>>,
    on_update: &mut dyn FnMut(ChatUpdate<'_>),
) -> Result<TextReduction> {
    let mut text = String::new();
    let mut final_response: Option<Value> = None;
    for event in events {
        let event = event?;
        match TextStreamEvent::classify(&event) {
            TextStreamEvent::Delta { delta } => {
                if delta.is_empty() {
                    continue;
                }
                text.push_str(&delta);
                on_update(ChatUpdate::Delta {
                    delta: &delta,
                    text: &text,
                });
            }
            TextStreamEvent::Completed { response } => {
                final_response = Some(response);
            }
            TextStreamEvent::Error { message } => {
                on_update(ChatUpdate::StreamError { message: &message });
            }
            TextStreamEvent::Other { .. } => {}
        }
    }
    Ok(TextReduction {
        text,
        final_response,
    })
}

/// Prefer the final response's aggregated text, merged with whatever
/// streaming already accumulated; an exchange with no text at all
/// resolves to `None`.
fn resolve_turn_outcome(reduction: &TextReduction) -> Option<ChatOutcome> {
    let accumulated = reduction.text.as_str();
    let extracted = reduction
        .final_response
        .as_ref()
        .map(extract_output_text)
        .unwrap_or_default();
    let text = if !accumulated.trim().is_empty() && !extracted.trim().is_empty() {
        merge_stream_text(accumulated, &extracted)
    } else if !extracted.trim().is_empty() {
        extracted
    } else if !accumulated.trim().is_empty() {
        accumulated.to_string()
    } else {
        return None;
    };
    let response_id = reduction.final_response.as_ref().and_then(|response| {
        response
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    });
    Some(ChatOutcome { text, response_id })
}

fn extract_output_text(response: &Value) -> String {
    if let Some(text) = response
        .get("output_text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return text.to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let Some(chunk_obj) = chunk.as_object() else {
                continue;
            };
            let kind = chunk_obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if matches!(kind, "output_text" | "text") {
                if let Some(text) = chunk_obj
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                {
                    parts.push(text.to_string());
                }
            }
            if let Some(refusal) = chunk_obj
                .get("refusal")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                parts.push(refusal.to_string());
            }
        }
    }
    parts.join("\n")
}

/// Merge streamed text with the aggregated final text, tolerating the
/// final text restating or extending the accumulator.
fn merge_stream_text(left: &str, right: &str) -> String {
    if right.is_empty() {
        return left.to_string();
    }
    if left.is_empty() {
        return right.to_string();
    }
    if right.starts_with(left) {
        return right.to_string();
    }
    let left_chars: Vec<char> = left.chars().collect();
    let right_chars: Vec<char> = right.chars().collect();
    let max_overlap = left_chars.len().min(right_chars.len());
    for size in (1..=max_overlap).rev() {
        if left_chars[left_chars.len() - size..] == right_chars[..size] {
            if size == right_chars.len() {
                break;
            }
            let suffix = right_chars[size..].iter().collect::<String>();
            return format!("{left}{suffix}");
        }
    }
    format!("{left}{right}")
}

struct ImageReduction {
    bytes: Option<Vec<u8>>,
    fallback: bool,
    partials: usize,
}

fn reduce_image_events(
    events: impl Iterator<Item = Result<Value>>,
    on_update: &mut dyn FnMut(ImageUpdate<'_>),
) -> Result<ImageReduction> {
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let mut final_bytes: Option<Vec<u8>> = None;
    for event in events {
        let event = event?;
        match ImageStreamEvent::classify(&event) {
            ImageStreamEvent::Partial { b64 } => {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("partial image base64 decode failed")?;
                frames.push(bytes);
                on_update(ImageUpdate::Partial {
                    index: frames.len(),
                    bytes: frames.last().map(Vec::as_slice).unwrap_or_default(),
                });
            }
            ImageStreamEvent::Completed { b64 } => {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("final image base64 decode failed")?;
                on_update(ImageUpdate::Final {
                    bytes: &bytes,
                    fallback: false,
                });
                final_bytes = Some(bytes);
            }
            ImageStreamEvent::Error { message } => {
                on_update(ImageUpdate::StreamError { message: &message });
            }
            ImageStreamEvent::Other { .. } => {}
        }
    }

    let mut fallback = false;
    if final_bytes.is_none() {
        if let Some(last) = frames.last() {
            fallback = true;
            on_update(ImageUpdate::Final {
                bytes: last,
                fallback: true,
            });
            final_bytes = Some(last.clone());
        }
    }

    Ok(ImageReduction {
        bytes: final_bytes,
        fallback,
        partials: frames.len(),
    })
}

/// Write a JSON receipt next to a saved image.
pub fn write_image_receipt(
    image_path: &Path,
    request: &ImageGenerationRequest,
    outcome: &ImageOutcome,
    dimensions: Option<(u32, u32)>,
) -> Result<PathBuf> {
    let receipt_path = image_path.with_extension("receipt.json");
    let byte_len = outcome.bytes.as_ref().map(Vec::len).unwrap_or(0);
    let mut root = json_object(json!({
        "schema_version": RECEIPT_SCHEMA_VERSION,
        "prompt": request.prompt,
        "model": request.model,
        "partial_images_requested": clamp_partial_images(request.partial_images),
        "partials_observed": outcome.partials,
        "fallback": outcome.fallback,
        "sha256": outcome.sha256,
        "byte_len": byte_len,
        "image_path": image_path.to_string_lossy().to_string(),
        "ts": now_utc_iso(),
    }));
    if let Some((width, height)) = dimensions {
        root.insert("width".to_string(), Value::Number(width.into()));
        root.insert("height".to_string(), Value::Number(height.into()));
    }
    let line = serde_json::to_string_pretty(&Value::Object(root))?;
    fs::write(&receipt_path, line)
        .with_context(|| format!("failed to write {}", receipt_path.display()))?;
    Ok(receipt_path)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn json_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
