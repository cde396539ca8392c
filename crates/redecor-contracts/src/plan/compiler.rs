use crate::catalog::{Catalog, DetectedEntity, OBJECT_SYNONYMS};

use super::extract::{extract_candidates, EditCandidate};
use super::{EditOperation, EditPlan, PlanValidation, Preferences, Scalar};

pub const UNMATCHED_CONFIDENCE: f64 = 0.3;
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

pub fn compile_plan(
    prompt: &str,
    catalog: &Catalog,
    room_type: &str,
    preferences: Option<&Preferences>,
) -> EditPlan {
    let mut operations = resolve_candidates(extract_candidates(prompt), catalog);
    if let Some(preferences) = preferences {
        apply_preferences(&mut operations, preferences);
    }
    let validation = validate_operations(&operations);

    EditPlan {
        operations,
        room_type: room_type.to_string(),
        original_prompt: prompt.to_string(),
        validation,
    }
}

fn find_entity<'a>(target: &str, catalog: &'a Catalog) -> Option<(String, &'a DetectedEntity)> {
    if let Some((key, entity)) = catalog
        .iter()
        .find(|(key, _)| !key.is_empty() && (target.contains(key) || key.contains(target)))
    {
        return Some((key.to_string(), entity));
    }

    OBJECT_SYNONYMS
        .iter()
        .filter(|entry| entry.lists(target))
        .find_map(|entry| {
            catalog
                .get(entry.canonical)
                .map(|entity| (entry.canonical.to_string(), entity))
        })
}

fn resolve_candidate(candidate: EditCandidate, catalog: &Catalog) -> EditOperation {
    let target = candidate.target.to_lowercase();
    match find_entity(&target, catalog) {
        Some((key, entity)) => {
            let resolved_mask = entity.mask_ref();
            let warning = resolved_mask.is_none().then(|| {
                format!("{key} detected without a segmentation mask, will attempt inference")
            });
            EditOperation {
                target_label: key,
                kind: candidate.kind,
                parameters: candidate.parameters,
                resolved_mask,
                confidence: entity.clamped_confidence(),
                warning,
            }
        }
        None => EditOperation {
            warning: Some(format!("{target} not detected, will attempt inference")),
            target_label: target,
            kind: candidate.kind,
            parameters: candidate.parameters,
            resolved_mask: None,
            confidence: UNMATCHED_CONFIDENCE,
        },
    }
}

pub fn resolve_candidates(candidates: Vec<EditCandidate>, catalog: &Catalog) -> Vec<EditOperation> {
    candidates
        .into_iter()
        .map(|candidate| resolve_candidate(candidate, catalog))
        .collect()
}

fn backfill(operation: &mut EditOperation, key: &str, preferred: &[String]) {
    let blank = operation
        .parameters
        .get(key)
        .map(|value| value.as_text().is_some_and(|text| text.trim().is_empty()))
        .unwrap_or(false);
    if !blank {
        return;
    }
    if let Some(first) = preferred.first() {
        operation
            .parameters
            .insert(key.to_string(), Scalar::Text(first.clone()));
    }
}

/// Fills blank color/material parameters from the caller's first preference.
pub fn apply_preferences(operations: &mut [EditOperation], preferences: &Preferences) {
    for operation in operations.iter_mut() {
        backfill(operation, "color", &preferences.preferred_colors);
        backfill(operation, "material", &preferences.preferred_materials);
    }
}

pub fn validate_operations(operations: &[EditOperation]) -> PlanValidation {
    let mut warnings = Vec::new();
    let valid = !operations.is_empty();
    if !valid {
        warnings.push("No valid edits found in request".to_string());
    }

    let low_confidence = operations
        .iter()
        .filter(|operation| operation.confidence < LOW_CONFIDENCE_THRESHOLD)
        .count();
    if low_confidence > 0 {
        warnings.push(format!("{low_confidence} edits have low confidence"));
    }

    let missing_masks = operations
        .iter()
        .filter(|operation| operation.resolved_mask.is_none())
        .count();
    if missing_masks > 0 {
        warnings.push(format!("{missing_masks} edits missing segmentation masks"));
    }

    PlanValidation { valid, warnings }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{normalize, BoundingBox, Catalog, DetectedEntity, MaskRef};
    use crate::plan::{OperationKind, Preferences, Scalar};

    use super::{apply_preferences, compile_plan, validate_operations, UNMATCHED_CONFIDENCE};

    fn detection(label: &str, confidence: f64, mask: Option<&str>) -> DetectedEntity {
        DetectedEntity {
            id: Some(format!("{label}-mask")),
            label: label.to_string(),
            confidence,
            bounding_box: BoundingBox::default(),
            mask: mask.map(str::to_string),
            category: "structural".to_string(),
        }
    }

    #[test]
    fn wall_recolor_compiles_to_single_confident_operation() {
        let catalog = normalize(&[detection("wall", 0.95, Some("bWFzaw=="))]);
        let plan = compile_plan("make the wall warm beige", &catalog, "living_room", None);

        assert!(plan.validation.valid);
        assert_eq!(plan.operations.len(), 1);
        let operation = &plan.operations[0];
        assert_eq!(operation.kind, OperationKind::Recolor);
        assert_eq!(operation.target_label, "wall");
        assert_eq!(operation.text_param("color"), Some("warm beige"));
        assert!(operation.confidence > 0.5);
        assert_eq!(
            operation.resolved_mask,
            Some(MaskRef::Inline("bWFzaw==".to_string()))
        );
        assert!(operation.warning.is_none());
        assert!(plan.validation.warnings.is_empty());
        assert_eq!(plan.room_type, "living_room");
        assert_eq!(plan.original_prompt, "make the wall warm beige");
    }

    #[test]
    fn gibberish_compiles_to_general_operation() {
        let plan = compile_plan("asdfasdf", &Catalog::new(), "bedroom", None);
        assert!(plan.validation.valid);
        assert_eq!(plan.operations.len(), 1);
        let operation = &plan.operations[0];
        assert_eq!(operation.kind, OperationKind::General);
        assert_eq!(operation.target_label, "unknown");
        assert_eq!(operation.text_param("prompt"), Some("asdfasdf"));
        assert_eq!(operation.confidence, UNMATCHED_CONFIDENCE);
        assert_eq!(
            operation.warning.as_deref(),
            Some("unknown not detected, will attempt inference")
        );
        assert_eq!(
            plan.validation.warnings,
            vec![
                "1 edits have low confidence".to_string(),
                "1 edits missing segmentation masks".to_string(),
            ]
        );
    }

    #[test]
    fn synonyms_resolve_to_catalog_keys() {
        let catalog = normalize(&[detection("couch", 0.8, None)]);
        let plan = compile_plan("paint the settee navy", &catalog, "living_room", None);
        let operation = &plan.operations[0];
        assert_eq!(operation.target_label, "sofa");
        assert_eq!(
            operation.resolved_mask,
            Some(MaskRef::Stored("couch-mask".to_string()))
        );
        assert_eq!(operation.confidence, 0.8);
    }

    #[test]
    fn substring_match_works_in_both_directions() {
        let catalog = normalize(&[detection("dining table", 0.7, None)]);
        // "dining table" normalizes to "table"; "tables" contains the key.
        let plan = compile_plan("make the tables black", &catalog, "kitchen", None);
        assert_eq!(plan.operations[0].target_label, "table");
    }

    #[test]
    fn matched_entity_without_mask_still_carries_warning() {
        let mut bare = detection("door", 0.9, None);
        bare.id = None;
        let catalog = normalize(&[bare]);
        let plan = compile_plan("paint the door red", &catalog, "hallway", None);
        let operation = &plan.operations[0];
        assert!(operation.resolved_mask.is_none());
        assert!(operation.warning.is_some());
        assert!(plan
            .validation
            .warnings
            .contains(&"1 edits missing segmentation masks".to_string()));
        assert!(plan.validation.valid);
    }

    #[test]
    fn every_operation_keeps_confidence_in_range() {
        let catalog = normalize(&[detection("floor", 1.3, None), detection("wall", -1.0, None)]);
        let plan = compile_plan(
            "change the floor tiles to oak, make the wall white, add soft lighting",
            &catalog,
            "living_room",
            None,
        );
        assert!(plan.operations.len() >= 3);
        for operation in &plan.operations {
            assert!((0.0..=1.0).contains(&operation.confidence));
            if operation.resolved_mask.is_none() {
                assert!(operation.warning.is_some());
            }
        }
    }

    #[test]
    fn preferences_fill_blank_parameters_only() {
        let mut plan = compile_plan("make the wall white", &Catalog::new(), "bedroom", None);
        plan.operations[0]
            .parameters
            .insert("color".to_string(), Scalar::from(" "));
        plan.operations[0]
            .parameters
            .insert("material".to_string(), Scalar::from("linen"));

        let preferences = Preferences {
            preferred_colors: vec!["terracotta".to_string(), "ochre".to_string()],
            preferred_materials: vec!["oak".to_string()],
        };
        apply_preferences(&mut plan.operations, &preferences);
        assert_eq!(plan.operations[0].text_param("color"), Some("terracotta"));
        assert_eq!(plan.operations[0].text_param("material"), Some("linen"));
    }

    #[test]
    fn preferences_without_values_leave_blanks() {
        let mut plan = compile_plan("make the wall white", &Catalog::new(), "bedroom", None);
        plan.operations[0]
            .parameters
            .insert("color".to_string(), Scalar::from(""));
        apply_preferences(&mut plan.operations, &Preferences::default());
        assert_eq!(plan.operations[0].text_param("color"), Some(""));
    }

    #[test]
    fn empty_operation_list_is_invalid() {
        let validation = validate_operations(&[]);
        assert!(!validation.valid);
        assert_eq!(validation.warnings, vec!["No valid edits found in request"]);
    }
}
