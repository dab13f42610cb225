use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::schema::AnalysisResult;

/// Builds the cache key an analysis is stored under. The prompt version
/// participates so a prompt revision invalidates prior entries.
pub fn analysis_cache_key(
    media_digest: &str,
    provider: &str,
    model: &str,
    prompt_version: u64,
) -> String {
    format!("{media_digest}:{provider}:{model}:v{prompt_version}")
}

/// File-backed store of finished analyses: one JSON object per
/// deployment, mapping cache key to serialized result. Lookups read the
/// file fresh and writes re-read it before inserting, so several
/// processes can share a cache file without clobbering each other's
/// entries.
#[derive(Debug, Clone)]
pub struct ResultCache {
    path: PathBuf,
}

impl ResultCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A hit requires the stored entry to still parse as the current
    /// result schema; a stale or corrupt entry reads as a miss and gets
    /// overwritten by the fresh analysis.
    pub fn get(&self, key: &str) -> Option<AnalysisResult> {
        read_entries(&self.path)
            .get(key)
            .and_then(|entry| serde_json::from_value(entry.clone()).ok())
    }

    pub fn put(&self, key: &str, result: &AnalysisResult) -> Result<()> {
        let mut entries = read_entries(&self.path);
        entries.insert(key.to_string(), serde_json::to_value(result)?);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(entries))?,
        )
        .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Map<String, Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|parsed| parsed.as_object().cloned())
        .unwrap_or_default()
}
