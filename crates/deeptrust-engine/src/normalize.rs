//! Reshapes whatever JSON the model produced into the fixed display
//! schema. Coercion is permissive but Option-aware: a present `0` is a
//! real value and survives; only absent or non-numeric fields take the
//! documented fallbacks, and out-of-range numerics clamp.

use deeptrust_contracts::schema::{
    AudioAnomaly, FramePoint, HeatmapRegion, MediaType, Modality, ModalityScore, RobustnessTest,
    DEFAULT_ROBUSTNESS_SCORE, DEFAULT_TRUST_SCORE, DEFAULT_VERDICT, ROBUSTNESS_SCENARIOS,
};
use deeptrust_contracts::scoring::{self, fusion_weight};

use anyhow::{bail, Result};
use serde_json::{Map, Value};

/// The reply fields after coercion, before local derivations.
#[derive(Debug, Clone)]
pub struct NormalizedReply {
    pub trust_score: f64,
    pub verdict: String,
    pub observations: Vec<String>,
    pub modality_scores: Vec<ModalityScore>,
    pub robustness_tests: Vec<RobustnessTest>,
    pub heatmap_regions: Vec<HeatmapRegion>,
    pub frame_confidence: Vec<FramePoint>,
    pub audio_anomalies: Vec<AudioAnomaly>,
    pub warnings: Vec<String>,
}

impl NormalizedReply {
    pub fn modality(&self, modality: Modality) -> Option<f64> {
        self.modality_scores
            .iter()
            .find(|row| row.modality == modality)
            .map(|row| row.score)
    }
}

/// Pulls the JSON object out of the model's text reply. Models fence their
/// JSON more often than not; failing that, the outermost `{...}` span is
/// tried before giving up.
pub fn extract_reply_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("model reply was empty");
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(parsed) = serde_json::from_str::<Value>(fenced) {
            if parsed.is_object() {
                return Ok(parsed);
            }
        }
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        if parsed.is_object() {
            return Ok(parsed);
        }
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if parsed.is_object() {
                    return Ok(parsed);
                }
            }
        }
    }

    bail!("model reply did not contain a JSON object");
}

fn fenced_block(text: &str) -> Option<&str> {
    let after_open = text.split_once("```")?.1;
    let body = after_open
        .strip_prefix("json")
        .or_else(|| after_open.strip_prefix("JSON"))
        .unwrap_or(after_open);
    let inner = body.split_once("```")?.0;
    Some(inner.trim())
}

pub fn normalize_reply(raw: &Value, media_type: MediaType) -> NormalizedReply {
    let empty = Map::new();
    let map = raw.as_object().unwrap_or(&empty);
    let mut warnings = Vec::new();

    let trust_score = value_as_f64(
        pick(map, &["trustScore", "trust_score"]),
        DEFAULT_TRUST_SCORE,
        0.0,
        100.0,
    );
    let verdict = pick(map, &["verdict", "summary"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_VERDICT)
        .to_string();
    let observations = string_list(pick(map, &["observations", "keyFindings", "key_findings"]));

    let modality_scores = normalize_modalities(
        pick(map, &["modalityScores", "modality_scores"]),
        media_type,
        trust_score,
        &mut warnings,
    );
    let robustness_tests =
        normalize_robustness(pick(map, &["robustnessTests", "robustness_tests"]));
    let heatmap_regions = if media_type.has_visual() {
        normalize_heatmap(pick(map, &["heatmapRegions", "heatmap_regions"]))
    } else {
        Vec::new()
    };
    let frame_confidence = if media_type == MediaType::Video {
        normalize_frames(pick(map, &["frameConfidence", "frame_confidence"]))
    } else {
        Vec::new()
    };
    let audio_anomalies = if media_type.has_audio() {
        normalize_audio(pick(map, &["audioAnomalies", "audio_anomalies"]))
    } else {
        Vec::new()
    };

    NormalizedReply {
        trust_score,
        verdict,
        observations,
        modality_scores,
        robustness_tests,
        heatmap_regions,
        frame_confidence,
        audio_anomalies,
        warnings,
    }
}

fn normalize_modalities(
    value: Option<&Value>,
    media_type: MediaType,
    trust_score: f64,
    warnings: &mut Vec<String>,
) -> Vec<ModalityScore> {
    let mut provided: Vec<(Modality, f64)> = Vec::new();
    let push = |modality: Modality, score: f64, provided: &mut Vec<(Modality, f64)>| {
        if provided.iter().all(|(existing, _)| *existing != modality) {
            provided.push((modality, score.clamp(0.0, 100.0)));
        }
    };

    match value {
        Some(Value::Object(map)) => {
            for (key, row) in map {
                let Some(modality) = Modality::parse(key) else {
                    continue;
                };
                if let Some(score) = opt_f64(Some(row)) {
                    push(modality, score, &mut provided);
                }
            }
        }
        Some(Value::Array(rows)) => {
            for row in rows {
                let Some(obj) = row.as_object() else {
                    continue;
                };
                let Some(modality) = pick(obj, &["modality", "name"])
                    .and_then(Value::as_str)
                    .and_then(Modality::parse)
                else {
                    continue;
                };
                if let Some(score) = opt_f64(pick(obj, &["score", "value"])) {
                    push(modality, score, &mut provided);
                }
            }
        }
        _ => {}
    }

    let applicable = |modality: Modality| match modality {
        Modality::Visual => media_type.has_visual(),
        Modality::Audio => media_type.has_audio(),
        Modality::Temporal => media_type.has_temporal(),
        Modality::Structural => true,
    };

    let mut out = Vec::new();
    for (modality, score) in provided {
        if !applicable(modality) {
            warnings.push(format!(
                "Dropped {} score: not applicable to {} input.",
                modality.as_str(),
                media_type.as_str()
            ));
            continue;
        }
        out.push(ModalityScore {
            modality,
            score,
            weight: fusion_weight(modality),
        });
    }

    // The structural score backs the edge-count derivation, so it always
    // exists; the trust score stands in when the model omitted it.
    if out.iter().all(|row| row.modality != Modality::Structural) {
        out.push(ModalityScore {
            modality: Modality::Structural,
            score: scoring::clamp_score(trust_score),
            weight: fusion_weight(Modality::Structural),
        });
    }
    out
}

fn normalize_robustness(value: Option<&Value>) -> Vec<RobustnessTest> {
    let rows = value.and_then(Value::as_array).cloned().unwrap_or_default();
    ROBUSTNESS_SCENARIOS
        .iter()
        .enumerate()
        .map(|(idx, scenario)| {
            let by_name = rows.iter().find(|row| {
                row.get("scenario")
                    .or_else(|| row.get("name"))
                    .and_then(Value::as_str)
                    .map(|name| name.trim().eq_ignore_ascii_case(scenario))
                    .unwrap_or(false)
            });
            let matched = by_name.or_else(|| {
                // Positional fallback for models that renamed the rows.
                rows.get(idx).filter(|row| {
                    row.get("scenario")
                        .or_else(|| row.get("name"))
                        .and_then(Value::as_str)
                        .map(|name| {
                            !ROBUSTNESS_SCENARIOS
                                .iter()
                                .any(|known| name.trim().eq_ignore_ascii_case(known))
                        })
                        .unwrap_or(true)
                })
            });
            let score = value_as_f64(
                matched.and_then(|row| row.get("score")),
                DEFAULT_ROBUSTNESS_SCORE,
                0.0,
                100.0,
            );
            RobustnessTest {
                scenario: (*scenario).to_string(),
                score,
                status: scoring::robustness_status(score),
            }
        })
        .collect()
}

fn normalize_heatmap(value: Option<&Value>) -> Vec<HeatmapRegion> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let obj = row.as_object()?;
                    Some(HeatmapRegion {
                        x: value_as_f64(obj.get("x"), 0.0, 0.0, 1.0),
                        y: value_as_f64(obj.get("y"), 0.0, 0.0, 1.0),
                        width: value_as_f64(pick(obj, &["width", "w"]), 0.0, 0.0, 1.0),
                        height: value_as_f64(pick(obj, &["height", "h"]), 0.0, 0.0, 1.0),
                        intensity: value_as_f64(obj.get("intensity"), 0.5, 0.0, 1.0),
                        label: obj
                            .get("label")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|label| !label.is_empty())
                            .map(str::to_string),
                        pixel: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_frames(value: Option<&Value>) -> Vec<FramePoint> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .enumerate()
                .filter_map(|(idx, row)| {
                    let obj = row.as_object()?;
                    let frame = pick(obj, &["frame", "index"])
                        .and_then(Value::as_u64)
                        .unwrap_or(idx as u64);
                    let confidence = opt_f64(pick(obj, &["confidence", "score"]))?;
                    Some(FramePoint {
                        frame,
                        confidence: confidence.clamp(0.0, 100.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_audio(value: Option<&Value>) -> Vec<AudioAnomaly> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let obj = row.as_object()?;
                    let start = value_as_f64(
                        pick(obj, &["startSeconds", "start_seconds", "start"]),
                        0.0,
                        0.0,
                        f64::MAX,
                    );
                    let end = value_as_f64(
                        pick(obj, &["endSeconds", "end_seconds", "end"]),
                        start,
                        0.0,
                        f64::MAX,
                    )
                    .max(start);
                    Some(AudioAnomaly {
                        start_seconds: start,
                        end_seconds: end,
                        kind: pick(obj, &["kind", "type"])
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|kind| !kind.is_empty())
                            .unwrap_or("unspecified")
                            .to_string(),
                        severity: value_as_f64(obj.get("severity"), 0.5, 0.0, 1.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn pick<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

/// Numeric coercion with a fallback and clamp. Strings holding numbers
/// are accepted; a present `0` is kept.
pub fn value_as_f64(value: Option<&Value>, default: f64, min: f64, max: f64) -> f64 {
    opt_f64(value).unwrap_or(default).clamp(min, max)
}

fn opt_f64(value: Option<&Value>) -> Option<f64> {
    value.and_then(|row| match row {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| row.as_str().map(str::trim).map(str::to_string))
            .filter(|row| !row.is_empty())
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use deeptrust_contracts::schema::{MediaType, Modality, DEFAULT_TRUST_SCORE};
    use serde_json::json;

    use super::{extract_reply_json, normalize_reply, value_as_f64};

    #[test]
    fn extracts_fenced_json() {
        let reply = "Here is my analysis:\n```json\n{\"trustScore\": 82}\n```\nDone.";
        let parsed = extract_reply_json(reply).expect("fenced json");
        assert_eq!(parsed["trustScore"], json!(82));
    }

    #[test]
    fn extracts_bare_json() {
        let parsed = extract_reply_json("{\"trustScore\": 12.5}").expect("bare json");
        assert_eq!(parsed["trustScore"], json!(12.5));
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let reply = "The verdict follows. {\"trustScore\": 70, \"verdict\": \"ok\"} Thanks!";
        let parsed = extract_reply_json(reply).expect("embedded json");
        assert_eq!(parsed["verdict"], json!("ok"));
    }

    #[test]
    fn rejects_reply_without_json() {
        assert!(extract_reply_json("I cannot analyze this.").is_err());
        assert!(extract_reply_json("").is_err());
        assert!(extract_reply_json("[1, 2, 3]").is_err());
    }

    #[test]
    fn zero_is_a_real_value_not_a_missing_one() {
        let reply = json!({"trustScore": 0});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.trust_score, 0.0);
    }

    #[test]
    fn missing_and_mistyped_fields_take_fallbacks() {
        let reply = json!({"trustScore": {"nested": true}, "verdict": "  "});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.trust_score, DEFAULT_TRUST_SCORE);
        assert_eq!(normalized.verdict, "inconclusive");
        assert!(normalized.observations.is_empty());
    }

    #[test]
    fn numeric_strings_coerce() {
        assert_eq!(value_as_f64(Some(&json!("73.5")), 50.0, 0.0, 100.0), 73.5);
        assert_eq!(value_as_f64(Some(&json!("not a number")), 50.0, 0.0, 100.0), 50.0);
        assert_eq!(value_as_f64(Some(&json!(250)), 50.0, 0.0, 100.0), 100.0);
    }

    #[test]
    fn modalities_accept_object_form() {
        let reply = json!({"modalityScores": {"visual": 80, "structural": 60, "bogus": 10}});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.modality(Modality::Visual), Some(80.0));
        assert_eq!(normalized.modality(Modality::Structural), Some(60.0));
        assert_eq!(normalized.modality_scores.len(), 2);
    }

    #[test]
    fn modalities_accept_array_form() {
        let reply = json!({"modalityScores": [
            {"modality": "visual", "score": 75},
            {"modality": "structural", "value": 55},
        ]});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.modality(Modality::Visual), Some(75.0));
        assert_eq!(normalized.modality(Modality::Structural), Some(55.0));
    }

    #[test]
    fn inapplicable_modalities_are_dropped_with_a_warning() {
        let reply = json!({"modalityScores": {"visual": 80, "audio": 70, "structural": 50}});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.modality(Modality::Audio), None);
        assert!(normalized
            .warnings
            .iter()
            .any(|warning| warning.contains("audio")));
    }

    #[test]
    fn structural_fallback_uses_trust_score() {
        let reply = json!({"trustScore": 64.0, "modalityScores": {"visual": 90}});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.modality(Modality::Structural), Some(64.0));
    }

    #[test]
    fn robustness_rows_match_by_scenario_name() {
        let reply = json!({"robustnessTests": [
            {"scenario": "gaussian noise", "score": 30},
            {"scenario": "JPEG recompression", "score": 85},
        ]});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.robustness_tests.len(), 5);
        assert_eq!(normalized.robustness_tests[0].scenario, "JPEG recompression");
        assert_eq!(normalized.robustness_tests[0].score, 85.0);
        assert_eq!(normalized.robustness_tests[1].score, 30.0);
        // Unmatched scenarios fall back.
        assert_eq!(normalized.robustness_tests[2].score, 50.0);
    }

    #[test]
    fn robustness_rows_fall_back_positionally_for_renamed_scenarios() {
        let reply = json!({"robustnessTests": [
            {"scenario": "recompress", "score": 20},
            {"scenario": "noise", "score": 90},
        ]});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.robustness_tests[0].score, 20.0);
        assert_eq!(normalized.robustness_tests[1].score, 90.0);
        assert_eq!(normalized.robustness_tests[4].score, 50.0);
    }

    #[test]
    fn audio_series_is_suppressed_for_images() {
        let reply = json!({
            "audioAnomalies": [{"startSeconds": 1.0, "endSeconds": 2.0}],
            "frameConfidence": [{"frame": 0, "confidence": 50}],
        });
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert!(normalized.audio_anomalies.is_empty());
        assert!(normalized.frame_confidence.is_empty());
    }

    #[test]
    fn audio_anomaly_end_never_precedes_start() {
        let reply = json!({"audioAnomalies": [
            {"startSeconds": 5.0, "endSeconds": 2.0, "kind": "splice", "severity": 3.0},
        ]});
        let normalized = normalize_reply(&reply, MediaType::Audio);
        let anomaly = &normalized.audio_anomalies[0];
        assert_eq!(anomaly.start_seconds, 5.0);
        assert_eq!(anomaly.end_seconds, 5.0);
        assert_eq!(anomaly.severity, 1.0);
    }

    #[test]
    fn heatmap_regions_clamp_to_unit_square() {
        let reply = json!({"heatmapRegions": [
            {"x": 1.8, "y": -0.2, "w": 0.5, "h": 0.5, "intensity": 2.0, "label": " seam "},
            "not a region",
        ]});
        let normalized = normalize_reply(&reply, MediaType::Image);
        assert_eq!(normalized.heatmap_regions.len(), 1);
        let region = &normalized.heatmap_regions[0];
        assert_eq!(region.x, 1.0);
        assert_eq!(region.y, 0.0);
        assert_eq!(region.width, 0.5);
        assert_eq!(region.intensity, 1.0);
        assert_eq!(region.label.as_deref(), Some("seam"));
    }

    #[test]
    fn frame_points_index_by_position_when_unnumbered() {
        let reply = json!({"frameConfidence": [
            {"confidence": 90},
            {"confidence": 40},
        ]});
        let normalized = normalize_reply(&reply, MediaType::Video);
        assert_eq!(normalized.frame_confidence[0].frame, 0);
        assert_eq!(normalized.frame_confidence[1].frame, 1);
    }
}
