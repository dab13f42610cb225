use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// The wire-level request as the caller sent it, minus the media payload
/// (only its size and digest are recorded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub media_type: String,
    pub media_bytes: u64,
    pub media_sha256: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// What the engine actually ran after model selection and prompt
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAnalysis {
    pub provider: String,
    pub model: String,
    pub prompt_version: u64,
    pub mime_type: String,
    pub cache_key: String,
    pub cached: bool,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub fn build_receipt(
    request: &ReceiptRequest,
    resolved: &ResolvedAnalysis,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    warnings: &[String],
    result: &Value,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "resolved".to_string(),
        sanitize_payload(&serde_json::to_value(resolved).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );
    root.insert("result".to_string(), sanitize_payload(result));
    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Receipts must never persist media bytes; any key that carries a base64
/// body or data URL is replaced recursively.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "imagebase64" | "image_base64" | "b64_json" | "data" | "inline_data"
                        | "inlinedata" | "image_url"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{
        build_receipt, write_receipt, ReceiptRequest, ResolvedAnalysis, RECEIPT_SCHEMA_VERSION,
    };

    fn sample_request() -> ReceiptRequest {
        ReceiptRequest {
            media_type: "image".to_string(),
            media_bytes: 2048,
            media_sha256: "ab".repeat(32),
            provider: Some("dryrun".to_string()),
            model: None,
        }
    }

    fn sample_resolved() -> ResolvedAnalysis {
        ResolvedAnalysis {
            provider: "dryrun".to_string(),
            model: "dryrun-forensic-1".to_string(),
            prompt_version: 1,
            mime_type: "image/png".to_string(),
            cache_key: "key".to_string(),
            cached: false,
            fallback_reason: Some("No model specified; using default.".to_string()),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn receipt_writes_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-1.json");

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), json!("dryrun-native"));
        let mut provider_response = Map::new();
        provider_response.insert("status".to_string(), json!("ok"));
        let warnings = vec!["note".to_string()];
        let result = json!({"trustScore": 61.0});

        let payload = build_receipt(
            &sample_request(),
            &sample_resolved(),
            &provider_request,
            &provider_response,
            &warnings,
            &result,
            &receipt_path,
        );
        write_receipt(&receipt_path, &payload)?;

        let raw = std::fs::read_to_string(&receipt_path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["media_type"], json!("image"));
        assert_eq!(parsed["resolved"]["provider"], json!("dryrun"));
        assert_eq!(parsed["result"]["trustScore"], json!(61.0));
        assert_eq!(parsed["warnings"], json!(["note"]));
        Ok(())
    }

    #[test]
    fn sanitization_omits_media_payload_keys() {
        let receipt_path = std::path::Path::new("receipt.json");
        let mut provider_request = Map::new();
        provider_request.insert(
            "messages".to_string(),
            json!([{ "content": [{ "type": "image_url", "image_url": "data:image/png;base64,AAAA" }] }]),
        );
        let mut provider_response = Map::new();
        provider_response.insert(
            "candidates".to_string(),
            json!([{ "inline_data": "AAAA", "text": "kept" }]),
        );

        let payload = build_receipt(
            &sample_request(),
            &sample_resolved(),
            &provider_request,
            &provider_response,
            &[],
            &Value::Null,
            receipt_path,
        );
        assert_eq!(
            payload["provider_request"]["messages"][0]["content"][0]["image_url"],
            json!("<omitted>")
        );
        assert_eq!(
            payload["provider_response"]["candidates"][0]["inline_data"],
            json!("<omitted>")
        );
        assert_eq!(
            payload["provider_response"]["candidates"][0]["text"],
            json!("kept")
        );
    }
}
