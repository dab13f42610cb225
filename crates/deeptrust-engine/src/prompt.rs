//! The forensic instruction prompt sent alongside the media payload. The
//! upstream model does all of the actual judging; this text pins down the
//! reply shape so the normalizer has something predictable to coerce.

use deeptrust_contracts::schema::{MediaType, ROBUSTNESS_SCENARIOS};

/// Bumped whenever the prompt text or the requested reply schema changes;
/// participates in the analysis cache key.
pub const PROMPT_VERSION: u64 = 1;

const PROMPT_PREAMBLE: &str = "\
You are a senior media-forensics analyst. You will be shown one media file. \
Examine it for signs of synthetic generation or manipulation: GAN fingerprints, \
diffusion artifacts, blending seams, inconsistent lighting and shadows, \
unnatural texture statistics, warped or duplicated fine detail, compression \
history that does not match the claimed provenance, and any region that looks \
resampled or spliced.

Be conservative: only lower the trust score for evidence you can actually \
point at, and describe that evidence in plain language. Do not speculate \
about who made the file or why.";

const PROMPT_REPLY_CONTRACT: &str = "\
Answer with a SINGLE JSON object and nothing else - no prose before or after \
it. Use exactly these fields (omit a field only if you have no basis for it):

{
  \"trustScore\": <0-100, 100 = certainly authentic>,
  \"verdict\": \"<one short sentence>\",
  \"observations\": [\"<finding>\", ...],
  \"modalityScores\": {
    \"visual\": <0-100>,
    \"audio\": <0-100>,
    \"temporal\": <0-100>,
    \"structural\": <0-100>
  },
  \"robustnessTests\": [
    {\"scenario\": \"<name from the list below>\", \"score\": <0-100>}
  ],
  \"heatmapRegions\": [
    {\"x\": <0-1>, \"y\": <0-1>, \"width\": <0-1>, \"height\": <0-1>,
     \"intensity\": <0-1>, \"label\": \"<what is suspicious here>\"}
  ],
  \"frameConfidence\": [
    {\"frame\": <index>, \"confidence\": <0-100>}
  ],
  \"audioAnomalies\": [
    {\"startSeconds\": <s>, \"endSeconds\": <s>, \"kind\": \"<artifact type>\",
     \"severity\": <0-1>}
  ]
}

All coordinates are relative to the media dimensions. Scores are on a 0-100 \
scale where higher means more likely authentic.";

pub fn build_prompt(media_type: MediaType) -> String {
    let mut sections = vec![PROMPT_PREAMBLE.to_string()];

    sections.push(match media_type {
        MediaType::Image => "\
The file is a still image. Score the `visual` and `structural` modalities; \
leave `audio`, `temporal`, `frameConfidence` and `audioAnomalies` out. Pay \
particular attention to eyes, teeth, hair boundaries, jewellery, text in the \
scene, and repeated texture patches."
            .to_string(),
        MediaType::Video => "\
The file is a video. Score all four modalities. Report per-frame confidence \
in `frameConfidence` (sample evenly across the clip), lip-sync or voice \
artifacts in `audioAnomalies`, and temporal flicker or identity drift under \
the `temporal` score."
            .to_string(),
        MediaType::Audio => "\
The file is an audio recording. Score the `audio`, `temporal` and \
`structural` modalities; leave `visual` and `heatmapRegions` out. Listen for \
vocoder artifacts, unnatural prosody, splice points, missing room tone and \
spectral discontinuities, and report suspect intervals in `audioAnomalies`."
            .to_string(),
    });

    let scenario_list = ROBUSTNESS_SCENARIOS
        .iter()
        .map(|name| format!("- {name}"))
        .collect::<Vec<_>>()
        .join("\n");
    sections.push(format!(
        "For `robustnessTests`, estimate how stable your judgement would be if \
the file had gone through each of these transformations:\n{scenario_list}"
    ));

    sections.push(PROMPT_REPLY_CONTRACT.to_string());
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use deeptrust_contracts::schema::{MediaType, ROBUSTNESS_SCENARIOS};

    use super::build_prompt;

    #[test]
    fn prompt_names_every_robustness_scenario() {
        let prompt = build_prompt(MediaType::Image);
        for scenario in ROBUSTNESS_SCENARIOS {
            assert!(prompt.contains(scenario), "missing scenario {scenario}");
        }
    }

    #[test]
    fn prompt_pins_the_reply_fields() {
        for media_type in [MediaType::Image, MediaType::Video, MediaType::Audio] {
            let prompt = build_prompt(media_type);
            for field in [
                "trustScore",
                "modalityScores",
                "robustnessTests",
                "heatmapRegions",
                "SINGLE JSON object",
            ] {
                assert!(prompt.contains(field), "missing {field}");
            }
        }
    }

    #[test]
    fn prompt_varies_by_media_type() {
        let image = build_prompt(MediaType::Image);
        let video = build_prompt(MediaType::Video);
        let audio = build_prompt(MediaType::Audio);
        assert_ne!(image, video);
        assert_ne!(video, audio);
        assert!(video.contains("lip-sync"));
        assert!(audio.contains("vocoder"));
    }
}
