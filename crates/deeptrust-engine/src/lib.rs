//! The analysis pipeline: decode the uploaded media, build the forensic
//! prompt, call a hosted multimodal model, and reshape its reply into the
//! fixed display schema with the local derivations (risk bucket, fusion,
//! robustness statuses, cross-modal consistency).

pub mod normalize;
pub mod prompt;
pub mod providers;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use deeptrust_contracts::audit::{AuditEvent, AuditTrail};
use deeptrust_contracts::cache::{analysis_cache_key, ResultCache};
use deeptrust_contracts::models::ModelSelector;
use deeptrust_contracts::receipts::{build_receipt, write_receipt, ReceiptRequest, ResolvedAnalysis};
use deeptrust_contracts::schema::{
    AnalysisResult, MediaInfo, MediaType, Modality, RESULT_SCHEMA_VERSION,
};
use deeptrust_contracts::scoring::{self, check_consistency};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::normalize::{extract_reply_json, normalize_reply};
use crate::prompt::{build_prompt, PROMPT_VERSION};
use crate::providers::{
    default_provider_registry, non_empty_env, AnalysisProviderRegistry, ProviderJob,
};

pub use crate::providers::{is_missing_credential, upstream_status};

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub media_base64: String,
    pub media_type: MediaType,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Receipts and the audit trail land here; `None` disables both.
    pub out_dir: Option<PathBuf>,
    /// Result cache location; `None` disables caching.
    pub cache_path: Option<PathBuf>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            out_dir: None,
            cache_path: None,
            default_provider: None,
            default_model: None,
            timeout_s: 120.0,
            transport_retries: 2,
            retry_backoff_s: 1.0,
        }
    }
}

/// Shareable across threads; `analyze` takes `&self` so concurrent
/// requests never queue behind each other.
pub struct AnalysisEngine {
    providers: AnalysisProviderRegistry,
    selector: ModelSelector,
    cache: Option<ResultCache>,
    options: EngineOptions,
}

impl AnalysisEngine {
    pub fn new(options: EngineOptions) -> Self {
        let cache = options.cache_path.as_ref().map(ResultCache::new);
        Self {
            providers: default_provider_registry(),
            selector: ModelSelector::new(None),
            cache,
            options,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    pub fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        let (media_bytes, data_url_mime) = decode_media(&request.media_base64)?;
        let media_sha256 = hex::encode(Sha256::digest(&media_bytes));
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut warnings = Vec::new();
        let (width, height, probed_mime) = probe_image(request.media_type, &media_bytes, &mut warnings);
        let mime_type = data_url_mime
            .or(probed_mime)
            .unwrap_or_else(|| default_mime(request.media_type).to_string());

        let provider_name = request
            .provider
            .clone()
            .or_else(|| self.options.default_provider.clone())
            .unwrap_or_else(default_provider_name);
        let requested_model = request
            .model
            .clone()
            .or_else(|| self.options.default_model.clone());
        let selection = self
            .selector
            .select(
                requested_model.as_deref(),
                Some(provider_name.as_str()),
                request.media_type.as_str(),
            )
            .map_err(|message| anyhow::anyhow!(message))?;
        if let Some(reason) = &selection.fallback_reason {
            warnings.push(reason.clone());
        }
        let model = selection.model.name.clone();

        let audit = self
            .options
            .out_dir
            .as_ref()
            .map(|dir| AuditTrail::new(dir.join("audit.jsonl"), request_id.clone()));
        record(&audit, AuditEvent::AnalysisStarted {
            provider: provider_name.clone(),
            model: model.clone(),
            media_type: request.media_type,
            media_sha256: media_sha256.clone(),
        });

        let cache_key = analysis_cache_key(&media_sha256, &provider_name, &model, PROMPT_VERSION);
        if let Some(cache) = &self.cache {
            if let Some(mut result) = cache.get(&cache_key) {
                result.request_id = request_id.clone();
                result.cached = true;
                record(&audit, AuditEvent::CacheHit {
                    cache_key: cache_key.clone(),
                });
                return Ok(result);
            }
        }

        let provider = self
            .providers
            .get(&provider_name)
            .with_context(|| format!("unknown provider '{provider_name}'"))?;
        let job = ProviderJob {
            prompt: build_prompt(request.media_type),
            media_base64: BASE64.encode(&media_bytes),
            media_sha256: media_sha256.clone(),
            mime_type: mime_type.clone(),
            media_type: request.media_type,
            model: model.clone(),
            timeout_s: self.options.timeout_s,
            transport_retries: self.options.transport_retries,
            retry_backoff_s: self.options.retry_backoff_s,
        };

        let reply = provider.analyze(&job).map_err(|err| {
            record(&audit, AuditEvent::AnalysisFailed {
                error: err.to_string(),
            });
            err
        })?;
        warnings.extend(reply.warnings.iter().cloned());

        let raw = extract_reply_json(&reply.text)
            .context("model reply was not parseable as the analysis schema")?;
        let normalized = normalize_reply(&raw, request.media_type);
        warnings.extend(normalized.warnings.iter().cloned());

        let trust_score = normalized.trust_score;
        let consistency = check_consistency(
            request.media_type,
            normalized.modality(Modality::Visual),
            normalized.modality(Modality::Audio),
            trust_score,
        );
        let fused_score =
            scoring::fuse_scores(&normalized.modality_scores).unwrap_or(trust_score);
        let structural = normalized
            .modality(Modality::Structural)
            .unwrap_or(trust_score);

        let mut heatmap_regions = normalized.heatmap_regions;
        if let (Some(width), Some(height)) = (width, height) {
            for region in &mut heatmap_regions {
                region.project(width, height);
            }
        }

        let mut result = AnalysisResult {
            schema_version: RESULT_SCHEMA_VERSION,
            request_id: request_id.clone(),
            analyzed_at: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
            provider: provider_name.clone(),
            model: model.clone(),
            media: MediaInfo {
                media_type: request.media_type,
                byte_len: media_bytes.len() as u64,
                sha256: media_sha256.clone(),
                width,
                height,
            },
            trust_score,
            risk_level: scoring::risk_level(trust_score),
            verdict: normalized.verdict,
            observations: normalized.observations,
            robustness_tests: normalized.robustness_tests,
            frame_confidence: normalized.frame_confidence,
            heatmap_regions,
            audio_anomalies: normalized.audio_anomalies,
            modality_scores: normalized.modality_scores,
            fused_score,
            edge_count: scoring::edge_count(structural),
            consistency,
            warnings,
            cached: false,
        };

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(&cache_key, &result) {
                result
                    .warnings
                    .push(format!("Result cache write failed: {err:#}"));
            }
        }

        if let Some(dir) = &self.options.out_dir {
            let receipt_path = dir.join(format!("receipt-{request_id}.json"));
            let receipt = build_receipt(
                &ReceiptRequest {
                    media_type: request.media_type.as_str().to_string(),
                    media_bytes: media_bytes.len() as u64,
                    media_sha256: media_sha256.clone(),
                    provider: request.provider.clone(),
                    model: request.model.clone(),
                },
                &ResolvedAnalysis {
                    provider: provider_name.clone(),
                    model: model.clone(),
                    prompt_version: PROMPT_VERSION,
                    mime_type,
                    cache_key: cache_key.clone(),
                    cached: false,
                    fallback_reason: selection.fallback_reason.clone(),
                    warnings: result.warnings.clone(),
                },
                &reply.provider_request,
                &reply.provider_response,
                &result.warnings,
                &serde_json::to_value(&result).unwrap_or(Value::Null),
                &receipt_path,
            );
            write_receipt(&receipt_path, &receipt)
                .with_context(|| format!("failed writing {}", receipt_path.display()))?;
        }

        record(&audit, AuditEvent::AnalysisCompleted {
            trust_score: result.trust_score,
            risk_level: result.risk_level,
        });
        Ok(result)
    }
}

fn record(audit: &Option<AuditTrail>, event: AuditEvent) {
    if let Some(trail) = audit {
        // Audit failures never abort an analysis.
        let _ = trail.record(&event);
    }
}

/// Accepts a bare base64 body or a full `data:` URL.
fn decode_media(raw: &str) -> Result<(Vec<u8>, Option<String>)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("media payload is empty");
    }
    let (body, mime) = if let Some(rest) = trimmed.strip_prefix("data:") {
        let (meta, body) = rest
            .split_once(',')
            .context("data URL is missing its payload")?;
        let mime = meta
            .split(';')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        (body.trim(), mime)
    } else {
        (trimmed, None)
    };
    let cleaned: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(cleaned.as_bytes())
        .context("media payload is not valid base64")?;
    if bytes.is_empty() {
        bail!("media payload is empty");
    }
    Ok((bytes, mime))
}

fn probe_image(
    media_type: MediaType,
    bytes: &[u8],
    warnings: &mut Vec<String>,
) -> (Option<u32>, Option<u32>, Option<String>) {
    if media_type != MediaType::Image {
        return (None, None, None);
    }
    let mime = image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string());
    match image::load_from_memory(bytes) {
        Ok(decoded) => (Some(decoded.width()), Some(decoded.height()), mime),
        Err(err) => {
            warnings.push(format!("Image dimensions unavailable: {err}"));
            (None, None, mime)
        }
    }
}

fn default_mime(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Image => "image/jpeg",
        MediaType::Video => "video/mp4",
        MediaType::Audio => "audio/mpeg",
    }
}

/// Picks the provider the deployment is actually configured for; the
/// offline provider is the last resort so nothing breaks without keys.
fn default_provider_name() -> String {
    if non_empty_env("OPENROUTER_API_KEY").is_some()
        || non_empty_env("DEEPTRUST_API_KEY").is_some()
    {
        return "openrouter".to_string();
    }
    if non_empty_env("GEMINI_API_KEY").is_some() || non_empty_env("GOOGLE_API_KEY").is_some() {
        return "gemini".to_string();
    }
    "dryrun".to_string()
}
