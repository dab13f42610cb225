//! Local decision logic: the cross-modal consistency step-function and the
//! fixed-threshold derivations (risk bucket, robustness status, fusion,
//! edge count). Everything here is pure and deterministic; the forensic
//! judgments themselves come from the upstream model.

use crate::schema::{
    ConsistencyReport, ConsistencyStatus, MediaType, Modality, ModalityScore, RiskLevel,
    RobustnessStatus,
};

/// Normalized disagreement at or above this is a hard inconsistency.
pub const DISAGREEMENT_MAJOR: f64 = 0.30;
/// Normalized disagreement at or above this (below major) is partial.
pub const DISAGREEMENT_MINOR: f64 = 0.15;

pub const MODIFIER_INCONSISTENT: f64 = -15.0;
pub const MODIFIER_PARTIALLY_CONSISTENT: f64 = -7.0;

pub const RISK_LOW_FLOOR: f64 = 70.0;
pub const RISK_MEDIUM_FLOOR: f64 = 40.0;

pub const ROBUSTNESS_PASS_FLOOR: f64 = 70.0;
pub const ROBUSTNESS_WARN_FLOOR: f64 = 40.0;

/// Static fusion weights, renormalized over the modalities present.
pub const FUSION_WEIGHTS: [(Modality, f64); 4] = [
    (Modality::Visual, 0.40),
    (Modality::Audio, 0.25),
    (Modality::Temporal, 0.20),
    (Modality::Structural, 0.15),
];

/// Scale factor mapping the structural score onto the presentational
/// edge-count statistic.
pub const EDGE_COUNT_SCALE: f64 = 1250.0;

pub fn fusion_weight(modality: Modality) -> f64 {
    FUSION_WEIGHTS
        .iter()
        .find(|(candidate, _)| *candidate == modality)
        .map(|(_, weight)| *weight)
        .unwrap_or(0.0)
}

/// The cross-modal consistency check. Scores arrive on the 0-100 display
/// scale; the disagreement bands are defined on the normalized [0,1]
/// scale. Image input or a missing modality always yields
/// `single_modality` with no penalty, regardless of the scores supplied.
pub fn check_consistency(
    media_type: MediaType,
    visual_score: Option<f64>,
    audio_score: Option<f64>,
    trust_score: f64,
) -> ConsistencyReport {
    let both = match (visual_score, audio_score) {
        (Some(visual), Some(audio)) if media_type != MediaType::Image => Some((visual, audio)),
        _ => None,
    };

    let Some((visual, audio)) = both else {
        return ConsistencyReport {
            status: ConsistencyStatus::SingleModality,
            disagreement: None,
            modifier: 0.0,
            adjusted_confidence: clamp_score(trust_score),
            explanation: "Only one modality present; cross-modal check not applicable."
                .to_string(),
        };
    };

    let disagreement = (clamp_score(visual) / 100.0 - clamp_score(audio) / 100.0).abs();
    let (status, modifier, explanation) = if disagreement >= DISAGREEMENT_MAJOR {
        (
            ConsistencyStatus::Inconsistent,
            MODIFIER_INCONSISTENT,
            "Visual and audio analyses disagree strongly; confidence reduced by 15 points.",
        )
    } else if disagreement >= DISAGREEMENT_MINOR {
        (
            ConsistencyStatus::PartiallyConsistent,
            MODIFIER_PARTIALLY_CONSISTENT,
            "Visual and audio analyses diverge moderately; confidence reduced by 7 points.",
        )
    } else {
        (
            ConsistencyStatus::Consistent,
            0.0,
            "Visual and audio analyses agree; no cross-modal penalty applied.",
        )
    };

    ConsistencyReport {
        status,
        disagreement: Some(disagreement),
        modifier,
        adjusted_confidence: clamp_score(clamp_score(trust_score) + modifier),
        explanation: explanation.to_string(),
    }
}

pub fn risk_level(trust_score: f64) -> RiskLevel {
    if trust_score >= RISK_LOW_FLOOR {
        RiskLevel::Low
    } else if trust_score >= RISK_MEDIUM_FLOOR {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

pub fn robustness_status(score: f64) -> RobustnessStatus {
    if score >= ROBUSTNESS_PASS_FLOOR {
        RobustnessStatus::Pass
    } else if score >= ROBUSTNESS_WARN_FLOOR {
        RobustnessStatus::Warn
    } else {
        RobustnessStatus::Fail
    }
}

/// Weighted mean over the modalities present; `None` when no modality
/// scores survived normalization (caller falls back to the trust score).
pub fn fuse_scores(scores: &[ModalityScore]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for row in scores {
        if row.weight <= 0.0 {
            continue;
        }
        weighted += clamp_score(row.score) * row.weight;
        total_weight += row.weight;
    }
    if total_weight <= 0.0 {
        return None;
    }
    Some(clamp_score(weighted / total_weight))
}

pub fn edge_count(structural_score: f64) -> u64 {
    (clamp_score(structural_score) / 100.0 * EDGE_COUNT_SCALE).round() as u64
}

pub fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use crate::schema::{ConsistencyStatus, MediaType, Modality, ModalityScore};
    use crate::schema::{RiskLevel, RobustnessStatus};

    use super::*;

    fn report_for(visual: f64, audio: f64) -> crate::schema::ConsistencyReport {
        check_consistency(MediaType::Video, Some(visual), Some(audio), 80.0)
    }

    #[test]
    fn small_disagreement_is_consistent() {
        // Sweep the d < 0.15 band in 0.01 steps.
        for step in 0..15 {
            let audio = 50.0 + step as f64;
            let report = report_for(50.0, audio);
            assert_eq!(report.status, ConsistencyStatus::Consistent, "audio={audio}");
            assert_eq!(report.modifier, 0.0);
            assert_eq!(report.adjusted_confidence, 80.0);
        }
    }

    #[test]
    fn moderate_disagreement_is_partially_consistent() {
        for step in 15..30 {
            let audio = 50.0 + step as f64;
            let report = report_for(50.0, audio);
            assert_eq!(
                report.status,
                ConsistencyStatus::PartiallyConsistent,
                "audio={audio}"
            );
            assert_eq!(report.modifier, -7.0);
            assert_eq!(report.adjusted_confidence, 73.0);
        }
    }

    #[test]
    fn large_disagreement_is_inconsistent() {
        for step in 30..=50 {
            let audio = 50.0 + step as f64;
            let report = report_for(50.0, audio);
            assert_eq!(report.status, ConsistencyStatus::Inconsistent, "audio={audio}");
            assert_eq!(report.modifier, -15.0);
            assert_eq!(report.adjusted_confidence, 65.0);
        }
    }

    #[test]
    fn visual_90_audio_60_is_inconsistent() {
        let report = report_for(90.0, 60.0);
        assert_eq!(report.status, ConsistencyStatus::Inconsistent);
        assert_eq!(report.modifier, -15.0);
        assert_eq!(report.adjusted_confidence, 65.0);
    }

    #[test]
    fn image_input_is_single_modality_regardless_of_scores() {
        let report = check_consistency(MediaType::Image, Some(95.0), Some(5.0), 40.0);
        assert_eq!(report.status, ConsistencyStatus::SingleModality);
        assert_eq!(report.modifier, 0.0);
        assert_eq!(report.disagreement, None);
        assert_eq!(report.adjusted_confidence, 40.0);
    }

    #[test]
    fn missing_audio_is_single_modality() {
        let report = check_consistency(MediaType::Video, Some(95.0), None, 88.0);
        assert_eq!(report.status, ConsistencyStatus::SingleModality);
        assert_eq!(report.adjusted_confidence, 88.0);
    }

    #[test]
    fn adjusted_confidence_clamps_at_zero() {
        let report = check_consistency(MediaType::Video, Some(100.0), Some(0.0), 10.0);
        assert_eq!(report.status, ConsistencyStatus::Inconsistent);
        assert_eq!(report.adjusted_confidence, 0.0);
    }

    #[test]
    fn out_of_range_inputs_are_clamped_before_banding() {
        let report = check_consistency(MediaType::Video, Some(250.0), Some(-40.0), 120.0);
        assert_eq!(report.status, ConsistencyStatus::Inconsistent);
        assert_eq!(report.disagreement, Some(1.0));
        assert_eq!(report.adjusted_confidence, 85.0);
    }

    #[test]
    fn risk_level_buckets_at_fixed_thresholds() {
        assert_eq!(risk_level(100.0), RiskLevel::Low);
        assert_eq!(risk_level(70.0), RiskLevel::Low);
        assert_eq!(risk_level(69.9), RiskLevel::Medium);
        assert_eq!(risk_level(40.0), RiskLevel::Medium);
        assert_eq!(risk_level(39.9), RiskLevel::High);
        assert_eq!(risk_level(0.0), RiskLevel::High);
    }

    #[test]
    fn robustness_status_buckets_at_fixed_thresholds() {
        assert_eq!(robustness_status(70.0), RobustnessStatus::Pass);
        assert_eq!(robustness_status(69.9), RobustnessStatus::Warn);
        assert_eq!(robustness_status(40.0), RobustnessStatus::Warn);
        assert_eq!(robustness_status(39.9), RobustnessStatus::Fail);
    }

    #[test]
    fn fusion_renormalizes_over_present_modalities() {
        let scores = vec![
            ModalityScore {
                modality: Modality::Visual,
                score: 80.0,
                weight: fusion_weight(Modality::Visual),
            },
            ModalityScore {
                modality: Modality::Structural,
                score: 60.0,
                weight: fusion_weight(Modality::Structural),
            },
        ];
        let fused = fuse_scores(&scores).expect("fusable");
        // (80 * 0.40 + 60 * 0.15) / 0.55
        assert!((fused - 74.545454).abs() < 1e-4);
    }

    #[test]
    fn fusion_of_empty_slice_is_none() {
        assert_eq!(fuse_scores(&[]), None);
    }

    #[test]
    fn edge_count_maps_structural_score() {
        assert_eq!(edge_count(0.0), 0);
        assert_eq!(edge_count(100.0), 1250);
        assert_eq!(edge_count(50.0), 625);
        assert_eq!(edge_count(250.0), 1250);
    }
}
