use serde::{Deserialize, Serialize};

pub const RESULT_SCHEMA_VERSION: u64 = 1;

/// Fallback applied when the model reply omits the headline score or the
/// value is not numeric. A present `0` is never replaced.
pub const DEFAULT_TRUST_SCORE: f64 = 50.0;
pub const DEFAULT_ROBUSTNESS_SCORE: f64 = 50.0;
pub const DEFAULT_VERDICT: &str = "inconclusive";

/// The five robustness scenarios the dashboard displays, in render order.
pub const ROBUSTNESS_SCENARIOS: [&str; 5] = [
    "JPEG recompression",
    "Gaussian noise",
    "Downscale 50%",
    "Brightness shift",
    "Social media transcode",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
}

impl MediaType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn has_visual(&self) -> bool {
        matches!(self, Self::Image | Self::Video)
    }

    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }

    pub fn has_temporal(&self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobustnessStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Visual,
    Audio,
    Temporal,
    Structural,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Audio => "audio",
            Self::Temporal => "temporal",
            Self::Structural => "structural",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "visual" => Some(Self::Visual),
            "audio" => Some(Self::Audio),
            "temporal" => Some(Self::Temporal),
            "structural" => Some(Self::Structural),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    PartiallyConsistent,
    Inconsistent,
    SingleModality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub status: ConsistencyStatus,
    /// `|visual - audio|` on the normalized [0,1] scale; absent for
    /// single-modality media.
    pub disagreement: Option<f64>,
    pub modifier: f64,
    pub adjusted_confidence: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobustnessTest {
    pub scenario: String,
    pub score: f64,
    pub status: RobustnessStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePoint {
    pub frame: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub intensity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Projection onto source pixels, present when the image decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel: Option<PixelRect>,
}

impl HeatmapRegion {
    pub fn project(&mut self, source_width: u32, source_height: u32) {
        let clamp_dim = |value: f64, limit: u32| -> u32 {
            (value.max(0.0) * f64::from(limit)).round().min(f64::from(limit)) as u32
        };
        self.pixel = Some(PixelRect {
            x: clamp_dim(self.x, source_width),
            y: clamp_dim(self.y, source_height),
            width: clamp_dim(self.width, source_width),
            height: clamp_dim(self.height, source_height),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioAnomaly {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub kind: String,
    pub severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalityScore {
    pub modality: Modality,
    pub score: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub media_type: MediaType,
    pub byte_len: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// The normalized display record the dashboard consumes. Every numeric
/// field is either coerced from the model reply or set to its documented
/// fallback; derived fields (`riskLevel`, robustness statuses,
/// `fusedScore`, `edgeCount`, `consistency`) are computed locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub schema_version: u64,
    pub request_id: String,
    pub analyzed_at: String,
    pub provider: String,
    pub model: String,
    pub media: MediaInfo,
    pub trust_score: f64,
    pub risk_level: RiskLevel,
    pub verdict: String,
    pub observations: Vec<String>,
    pub robustness_tests: Vec<RobustnessTest>,
    pub frame_confidence: Vec<FramePoint>,
    pub heatmap_regions: Vec<HeatmapRegion>,
    pub audio_anomalies: Vec<AudioAnomaly>,
    pub modality_scores: Vec<ModalityScore>,
    pub fused_score: f64,
    pub edge_count: u64,
    pub consistency: ConsistencyReport,
    pub warnings: Vec<String>,
    pub cached: bool,
}
