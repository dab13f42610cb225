use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::schema::{MediaType, RiskLevel};

/// The events the analysis pipeline records. One analysis emits
/// `AnalysisStarted` followed by exactly one of `CacheHit`,
/// `AnalysisFailed` or `AnalysisCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    AnalysisStarted {
        provider: String,
        model: String,
        media_type: MediaType,
        media_sha256: String,
    },
    CacheHit {
        cache_key: String,
    },
    AnalysisFailed {
        error: String,
    },
    AnalysisCompleted {
        trust_score: f64,
        risk_level: RiskLevel,
    },
}

/// Append-only `audit.jsonl` trail for one analysis request. Each line is
/// the serialized event plus `request_id` and an RFC3339 `ts`.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    path: PathBuf,
    request_id: String,
}

impl AuditTrail {
    pub fn new(path: impl Into<PathBuf>, request_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            request_id: request_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn record(&self, event: &AuditEvent) -> Result<Value> {
        let mut line = serde_json::to_value(event)?;
        let map = line
            .as_object_mut()
            .context("audit event serialized to a non-object")?;
        map.insert(
            "request_id".to_string(),
            Value::String(self.request_id.clone()),
        );
        map.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string(&line)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(line)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
