mod synonyms;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use synonyms::{canonical_for_label, canonical_for_synonym, SynonymSpec, OBJECT_SYNONYMS};

/// Pixel-space box as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<[f64; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f64; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(value: BoundingBox) -> Self {
        [value.x1, value.y1, value.x2, value.y2]
    }
}

/// Where the selection mask for a region lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MaskRef {
    /// Base64-encoded image carried alongside the detection.
    Inline(String),
    /// Opaque id held by the detector; not resolvable locally.
    Stored(String),
}

/// A labeled region reported by the detector. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    #[serde(default)]
    pub id: Option<String>,
    pub label: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, rename = "bbox")]
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub category: String,
}

impl DetectedEntity {
    pub fn mask_ref(&self) -> Option<MaskRef> {
        if let Some(data) = self
            .mask
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Some(MaskRef::Inline(data.to_string()));
        }
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|id| MaskRef::Stored(id.to_string()))
    }

    pub fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            return 0.0;
        }
        self.confidence.clamp(0.0, 1.0)
    }
}

/// Detector reply for one photograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAnalysis {
    #[serde(default = "default_room_type")]
    pub room_type: String,
    #[serde(default)]
    pub objects: Vec<DetectedEntity>,
}

/// Assumed when the detector omits a score.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

fn default_room_type() -> String {
    "unknown".to_string()
}

/// Canonical label → entity, in binding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: IndexMap<String, DetectedEntity>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` unless it is already taken. Returns whether the binding happened.
    pub fn bind(&mut self, key: impl Into<String>, entity: DetectedEntity) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entity);
        true
    }

    pub fn get(&self, key: &str) -> Option<&DetectedEntity> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DetectedEntity)> {
        self.entries.iter().map(|(key, entity)| (key.as_str(), entity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn normalize(detections: &[DetectedEntity]) -> Catalog {
    let mut catalog = Catalog::new();
    for entity in detections {
        let label = entity.label.trim().to_lowercase();
        if label.is_empty() {
            continue;
        }
        let key = canonical_for_label(&label)
            .map(str::to_string)
            .unwrap_or(label);
        catalog.bind(key, entity.clone());
    }
    catalog
}
