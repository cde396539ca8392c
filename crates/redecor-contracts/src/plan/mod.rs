mod compiler;
mod extract;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::MaskRef;

pub use compiler::{
    apply_preferences, compile_plan, resolve_candidates, validate_operations,
    UNMATCHED_CONFIDENCE,
};
pub use extract::{extract_candidates, EditCandidate, Extractor, EXTRACTORS};

pub const DEFAULT_STRENGTH: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Recolor,
    Texture,
    Lighting,
    General,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recolor => "recolor",
            Self::Texture => "texture",
            Self::Lighting => "lighting",
            Self::General => "general",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation parameters are flat scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
            Self::Flag(_) => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

pub type Parameters = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub target_label: String,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub resolved_mask: Option<MaskRef>,
    pub confidence: f64,
    #[serde(default)]
    pub warning: Option<String>,
}

impl EditOperation {
    pub fn text_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Scalar::as_text)
    }

    /// Inpainting strength, defaulting to 0.8 and kept within [0, 1].
    pub fn strength(&self) -> f64 {
        self.parameters
            .get("strength")
            .and_then(Scalar::as_number)
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_STRENGTH)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanValidation {
    pub valid: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    #[serde(rename = "edits")]
    pub operations: Vec<EditOperation>,
    pub room_type: String,
    pub original_prompt: String,
    pub validation: PlanValidation,
}

impl EditPlan {
    pub fn is_valid(&self) -> bool {
        self.validation.valid && !self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub preferred_colors: Vec<String>,
    #[serde(default)]
    pub preferred_materials: Vec<String>,
}

impl Preferences {
    pub fn is_empty(&self) -> bool {
        self.preferred_colors.is_empty() && self.preferred_materials.is_empty()
    }
}
