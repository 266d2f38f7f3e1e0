//! Caption records exchanged between pipeline stages

use serde::{Deserialize, Serialize};

/// Image identifier (file stem of the image, or the collaborator's numeric id)
pub type ImageId = String;

/// One caption produced by one inference invocation for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCaptionRecord")]
pub struct CaptionResult {
    pub image_id: ImageId,
    pub caption: String,
    /// Log-probability or model score, when the collaborator reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl CaptionResult {
    pub fn new(image_id: impl Into<ImageId>, caption: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            caption: caption.into(),
            score: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawImageId {
    Text(String),
    Number(u64),
}

/// Record shape accepted from the inference collaborator.
///
/// Either a single `caption`, or ranked `captions` of which the first is kept.
#[derive(Deserialize)]
struct RawCaptionRecord {
    image_id: RawImageId,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    captions: Vec<String>,
    #[serde(default)]
    score: Option<f64>,
}

impl TryFrom<RawCaptionRecord> for CaptionResult {
    type Error = String;

    fn try_from(raw: RawCaptionRecord) -> Result<Self, Self::Error> {
        let image_id = match raw.image_id {
            RawImageId::Text(s) => s.trim().to_string(),
            RawImageId::Number(n) => n.to_string(),
        };
        if image_id.is_empty() {
            return Err("empty image_id".to_string());
        }

        let caption = raw
            .caption
            .into_iter()
            .chain(raw.captions)
            .map(|c| c.trim().to_string())
            .find(|c| !c.is_empty())
            .ok_or_else(|| format!("no caption for image {}", image_id))?;

        Ok(Self {
            image_id,
            caption,
            score: raw.score,
        })
    }
}

/// The caption chosen for an image after voting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub image_id: ImageId,
    pub caption: String,
}

impl From<CaptionResult> for ConsensusResult {
    fn from(r: CaptionResult) -> Self {
        Self {
            image_id: r.image_id,
            caption: r.caption,
        }
    }
}

/// Ordered captions for one (checkpoint, run-index) pair
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub run_index: usize,
    pub results: Vec<CaptionResult>,
}

impl RunOutput {
    pub fn new(run_index: usize, results: Vec<CaptionResult>) -> Self {
        Self {
            run_index,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Final per-image captions handed to the scorer
pub type Submission = Vec<ConsensusResult>;
