use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{OperationKind, Parameters, Scalar};

static RECOLOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:make|change|paint|colou?r)\s+(?:the\s+)?(\w+)\s+(?:(?:to|as|in)\s+)?([\w\s]+?)(?:,|\.|$)",
    )
    .expect("recolor pattern compiles")
});

static TEXTURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:change|replace|make)\s+(?:the\s+)?(\w+)\s+(?:(?:tiles?|material|texture)\s+)?(?:to|with|as)\s+([\w\s]+?)(?:,|\.|$)",
    )
    .expect("texture pattern compiles")
});

static LIGHTING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:add|change|make)\s+([\w\s]+?)\s+(?:lighting|lights?)(?:,|\.|$)")
        .expect("lighting pattern compiles")
});

/// An operation pulled out of the prompt before catalog resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct EditCandidate {
    pub target: String,
    pub kind: OperationKind,
    pub parameters: Parameters,
}

impl EditCandidate {
    fn new(target: &str, kind: OperationKind, key: &str, value: &str) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert(key.to_string(), Scalar::Text(value.trim().to_string()));
        Self {
            target: target.trim().to_string(),
            kind,
            parameters,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extractor {
    Recolor,
    Texture,
    Lighting,
}

/// Every extractor runs; their output is unioned in this order.
pub const EXTRACTORS: &[Extractor] = &[Extractor::Recolor, Extractor::Texture, Extractor::Lighting];

impl Extractor {
    fn pattern(&self) -> &'static Regex {
        match self {
            Self::Recolor => &RECOLOR_PATTERN,
            Self::Texture => &TEXTURE_PATTERN,
            Self::Lighting => &LIGHTING_PATTERN,
        }
    }

    fn candidate(&self, captures: &Captures<'_>) -> Option<EditCandidate> {
        match self {
            Self::Recolor => Some(EditCandidate::new(
                captures.get(1)?.as_str(),
                OperationKind::Recolor,
                "color",
                captures.get(2)?.as_str(),
            )),
            Self::Texture => Some(EditCandidate::new(
                captures.get(1)?.as_str(),
                OperationKind::Texture,
                "material",
                captures.get(2)?.as_str(),
            )),
            Self::Lighting => {
                let style = captures.get(1)?.as_str().trim();
                let style = style.strip_prefix("the ").unwrap_or(style);
                Some(EditCandidate::new(
                    "ceiling",
                    OperationKind::Lighting,
                    "style",
                    style,
                ))
            }
        }
    }

    /// Expects an already lowercased prompt.
    pub fn extract(&self, prompt: &str) -> Vec<EditCandidate> {
        self.pattern()
            .captures_iter(prompt)
            .filter_map(|captures| self.candidate(&captures))
            .collect()
    }
}

pub fn extract_candidates(prompt: &str) -> Vec<EditCandidate> {
    let lowered = prompt.to_lowercase();
    let mut candidates: Vec<EditCandidate> = EXTRACTORS
        .iter()
        .flat_map(|extractor| extractor.extract(&lowered))
        .collect();

    if candidates.is_empty() {
        let mut parameters = Parameters::new();
        parameters.insert("prompt".to_string(), Scalar::Text(prompt.to_string()));
        candidates.push(EditCandidate {
            target: "unknown".to_string(),
            kind: OperationKind::General,
            parameters,
        });
    }
    candidates
}
