use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redecor_contracts::catalog::SceneAnalysis;

use super::Detector;

/// Replays a fixed analysis regardless of the image.
#[derive(Debug, Clone)]
pub struct StaticDetector {
    analysis: SceneAnalysis,
}

impl StaticDetector {
    pub fn new(analysis: SceneAnalysis) -> Self {
        Self { analysis }
    }

    pub fn empty(room_type: impl Into<String>) -> Self {
        Self::new(SceneAnalysis {
            room_type: room_type.into(),
            objects: Vec::new(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let analysis: SceneAnalysis = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a scene analysis", path.display()))?;
        Ok(Self::new(analysis))
    }
}

#[async_trait]
impl Detector for StaticDetector {
    fn name(&self) -> &str {
        "static-detector"
    }

    async fn analyze(&self, _image: &[u8]) -> Result<SceneAnalysis> {
        Ok(self.analysis.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::StaticDetector;
    use crate::backends::Detector;

    #[tokio::test]
    async fn loads_analysis_from_json_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("detections.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "room_type": "bedroom",
                "objects": [{"label": "bed", "confidence": 0.88, "bbox": [1, 2, 3, 4]}]
            }))?,
        )?;

        let detector = StaticDetector::from_path(&path)?;
        let analysis = detector.analyze(b"ignored").await?;
        assert_eq!(analysis.room_type, "bedroom");
        assert_eq!(analysis.objects[0].label, "bed");
        Ok(())
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = StaticDetector::from_path(std::path::Path::new("/nonexistent/detections.json"))
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("/nonexistent/detections.json"));
    }
}
