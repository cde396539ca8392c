use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plan::EditPlan;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What one finished job leaves behind in `receipt.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: String,
    pub prompt: String,
    pub room_type: String,
    pub plan: Option<EditPlan>,
    pub status: String,
    pub output_url: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub processing_seconds: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn build_receipt(receipt: &JobReceipt) -> anyhow::Result<Value> {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    if let Value::Object(fields) = serde_json::to_value(receipt)? {
        for (key, value) in fields {
            root.insert(key, sanitize_payload(&value));
        }
    }
    Ok(Value::Object(root))
}

pub fn write_receipt(path: &Path, receipt: &JobReceipt) -> anyhow::Result<()> {
    let payload = build_receipt(receipt)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

// Inline masks are base64 images; they do not belong in a receipt.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let inline_mask = map.get("kind").and_then(Value::as_str) == Some("inline");
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                let omit = matches!(lowered.as_str(), "image" | "image_bytes" | "mask")
                    || (inline_mask && lowered == "value");
                if omit && !row.is_null() {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}
