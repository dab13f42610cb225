//! Upstream analysis providers. Each provider wraps one hosted multimodal
//! chat-completion API; the engine hands it the prompt plus the encoded
//! media and gets back the model's raw text reply.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use deeptrust_contracts::schema::MediaType;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct ProviderJob {
    pub prompt: String,
    pub media_base64: String,
    pub media_sha256: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub model: String,
    pub timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// The model's text reply; JSON is expected somewhere inside it.
    pub text: String,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, job: &ProviderJob) -> Result<ProviderReply>;
}

#[derive(Default)]
pub struct AnalysisProviderRegistry {
    providers: BTreeMap<String, Box<dyn AnalysisProvider>>,
}

impl AnalysisProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AnalysisProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn AnalysisProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> AnalysisProviderRegistry {
    let mut registry = AnalysisProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(OpenRouterProvider::new());
    registry.register(GeminiProvider::new());
    registry
}

/// A non-success status from the upstream API. Carried inside the anyhow
/// chain so the edge handler can pass 429/402 through unchanged.
#[derive(Debug)]
pub struct UpstreamFailure {
    pub status: u16,
    pub detail: String,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "upstream request failed ({}): {}",
            self.status, self.detail
        )
    }
}

impl std::error::Error for UpstreamFailure {}

/// The provider has no API key configured in the environment.
#[derive(Debug)]
pub struct MissingCredential {
    pub variable: &'static str,
}

impl fmt::Display for MissingCredential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} is not set", self.variable)
    }
}

impl std::error::Error for MissingCredential {}

pub fn upstream_status(err: &anyhow::Error) -> Option<u16> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpstreamFailure>())
        .map(|failure| failure.status)
}

pub fn is_missing_credential(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<MissingCredential>().is_some())
}

struct OpenRouterProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenRouterProvider {
    fn new() -> Self {
        Self {
            api_base: non_empty_env("OPENROUTER_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("OPENROUTER_API_KEY")
            .or_else(|| non_empty_env("DEEPTRUST_API_KEY"))
            .ok_or_else(|| {
                anyhow::Error::new(MissingCredential {
                    variable: "OPENROUTER_API_KEY",
                })
            })
    }

    fn apply_attribution_headers(
        mut request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        if let Some(referer) = non_empty_env("OPENROUTER_HTTP_REFERER") {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = non_empty_env("OPENROUTER_X_TITLE") {
            request = request.header("X-Title", title);
        }
        request
    }

    fn extract_reply_text(payload: &Value) -> Option<String> {
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))?;
        match content {
            Value::String(text) => Some(text.clone()),
            Value::Array(parts) => {
                let joined = parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n");
                (!joined.is_empty()).then_some(joined)
            }
            _ => None,
        }
    }
}

impl AnalysisProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn analyze(&self, job: &ProviderJob) -> Result<ProviderReply> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let data_url = format!("data:{};base64,{}", job.mime_type, job.media_base64);
        let payload = json!({
            "model": job.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": job.prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "temperature": 0.1,
        });

        let mut warnings = Vec::new();
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=job.transport_retries {
            let request = self
                .http
                .post(&endpoint)
                .bearer_auth(&api_key)
                .header("accept", "application/json")
                .header(CONTENT_TYPE, "application/json")
                .timeout(Duration::from_secs_f64(job.timeout_s));
            let response = match Self::apply_attribution_headers(request).json(&payload).send() {
                Ok(response) => response,
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("OpenRouter request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt == job.transport_retries {
                        return Err(err);
                    }
                    warnings.push(format!(
                        "OpenRouter transport retry {}/{} after transient request failure.",
                        attempt + 1,
                        job.transport_retries
                    ));
                    last_err = Some(err);
                    thread::sleep(Duration::from_secs_f64(
                        job.retry_backoff_s * (attempt as f64 + 1.0),
                    ));
                    continue;
                }
            };
            let parsed = response_json_or_error("OpenRouter", response)?;
            let Some(text) = Self::extract_reply_text(&parsed) else {
                bail!("OpenRouter reply contained no message content");
            };
            return Ok(ProviderReply {
                text,
                provider_request: map_object(json!({
                    "endpoint": endpoint,
                    "payload": payload,
                })),
                provider_response: map_object(parsed),
                warnings,
            });
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("OpenRouter request failed")))
    }
}

struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    fn new() -> Self {
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                anyhow::Error::new(MissingCredential {
                    variable: "GEMINI_API_KEY",
                })
            })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }

    fn extract_reply_text(payload: &Value) -> Option<String> {
        let parts = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let joined = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        (!joined.is_empty()).then_some(joined)
    }
}

impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, job: &ProviderJob) -> Result<ProviderReply> {
        let api_key = Self::api_key()?;
        let endpoint = self.endpoint_for_model(&job.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": job.prompt },
                    { "inlineData": { "mimeType": job.mime_type, "data": job.media_base64 } },
                ],
            }],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json",
            },
        });

        let mut warnings = Vec::new();
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=job.transport_retries {
            let response = match self
                .http
                .post(&endpoint)
                .header("x-goog-api-key", &api_key)
                .header(CONTENT_TYPE, "application/json")
                .timeout(Duration::from_secs_f64(job.timeout_s))
                .json(&payload)
                .send()
            {
                Ok(response) => response,
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt == job.transport_retries {
                        return Err(err);
                    }
                    warnings.push(format!(
                        "Gemini transport retry {}/{} after transient request failure.",
                        attempt + 1,
                        job.transport_retries
                    ));
                    last_err = Some(err);
                    thread::sleep(Duration::from_secs_f64(
                        job.retry_backoff_s * (attempt as f64 + 1.0),
                    ));
                    continue;
                }
            };
            let parsed = response_json_or_error("Gemini", response)?;
            let Some(text) = Self::extract_reply_text(&parsed) else {
                bail!("Gemini reply contained no candidate text");
            };
            return Ok(ProviderReply {
                text,
                provider_request: map_object(json!({
                    "endpoint": endpoint,
                    "payload": payload,
                })),
                provider_response: map_object(parsed),
                warnings,
            });
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Gemini request failed")))
    }
}

/// Offline provider: synthesizes a plausible model reply from the media
/// digest. Deterministic, no network, no credential; the reply is fenced
/// the way real models fence theirs so the extraction path gets exercised.
struct DryrunProvider;

impl DryrunProvider {
    fn digest_bytes(digest_hex: &str) -> Vec<u8> {
        hex::decode(digest_hex).unwrap_or_else(|_| digest_hex.as_bytes().to_vec())
    }

    fn score_from(byte: u8) -> f64 {
        30.0 + f64::from(byte % 66)
    }

    fn unit_from(byte: u8) -> f64 {
        f64::from(byte) / 255.0
    }
}

impl AnalysisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, job: &ProviderJob) -> Result<ProviderReply> {
        let bytes = Self::digest_bytes(&job.media_sha256);
        let at = |idx: usize| -> u8 { bytes.get(idx).copied().unwrap_or(idx as u8) };
        let trust = Self::score_from(at(0));

        let mut reply = Map::new();
        reply.insert("trustScore".to_string(), json!(trust));
        reply.insert(
            "verdict".to_string(),
            json!("No conclusive manipulation evidence found in offline mode."),
        );
        reply.insert(
            "observations".to_string(),
            json!([
                "Offline heuristic reply derived from the media digest.",
                "Texture statistics within expected bounds.",
            ]),
        );

        let mut modalities = Map::new();
        if job.media_type.has_visual() {
            modalities.insert("visual".to_string(), json!(Self::score_from(at(1))));
        }
        if job.media_type.has_audio() {
            modalities.insert("audio".to_string(), json!(Self::score_from(at(2))));
        }
        if job.media_type.has_temporal() {
            modalities.insert("temporal".to_string(), json!(Self::score_from(at(3))));
        }
        modalities.insert("structural".to_string(), json!(Self::score_from(at(4))));
        reply.insert("modalityScores".to_string(), Value::Object(modalities));

        reply.insert(
            "robustnessTests".to_string(),
            json!(deeptrust_contracts::schema::ROBUSTNESS_SCENARIOS
                .iter()
                .enumerate()
                .map(|(idx, scenario)| json!({
                    "scenario": scenario,
                    "score": Self::score_from(at(5 + idx)),
                }))
                .collect::<Vec<_>>()),
        );

        if job.media_type.has_visual() {
            reply.insert(
                "heatmapRegions".to_string(),
                json!([
                    {
                        "x": Self::unit_from(at(10)) * 0.5,
                        "y": Self::unit_from(at(11)) * 0.5,
                        "width": 0.1 + Self::unit_from(at(12)) * 0.2,
                        "height": 0.1 + Self::unit_from(at(13)) * 0.2,
                        "intensity": Self::unit_from(at(14)),
                        "label": "texture irregularity",
                    },
                    {
                        "x": Self::unit_from(at(15)) * 0.5,
                        "y": Self::unit_from(at(16)) * 0.5,
                        "width": 0.05 + Self::unit_from(at(17)) * 0.15,
                        "height": 0.05 + Self::unit_from(at(18)) * 0.15,
                        "intensity": Self::unit_from(at(19)),
                        "label": "boundary blending",
                    },
                ]),
            );
        }

        if job.media_type == MediaType::Video {
            let frames = (0..12)
                .map(|frame| {
                    json!({
                        "frame": frame,
                        "confidence": Self::score_from(at(20 + frame as usize)),
                    })
                })
                .collect::<Vec<_>>();
            reply.insert("frameConfidence".to_string(), json!(frames));
        }

        if job.media_type.has_audio() {
            let start = Self::unit_from(at(8)) * 20.0;
            reply.insert(
                "audioAnomalies".to_string(),
                json!([{
                    "startSeconds": start,
                    "endSeconds": start + 0.5 + Self::unit_from(at(9)) * 2.0,
                    "kind": "spectral discontinuity",
                    "severity": Self::unit_from(at(7)),
                }]),
            );
        }

        let body = serde_json::to_string_pretty(&Value::Object(reply))?;
        Ok(ProviderReply {
            text: format!("```json\n{body}\n```"),
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "model": job.model,
                "mime_type": job.mime_type,
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "media_sha256": job.media_sha256,
            })),
            warnings: vec!["Dryrun provider: reply synthesized offline.".to_string()],
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        return Err(anyhow::Error::new(UpstreamFailure {
            status: code,
            detail: truncate_text(&body, 512),
        })
        .context(format!("{provider} request rejected")));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
