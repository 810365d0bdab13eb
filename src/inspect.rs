//! Structural smoke checks on records returned by a successful run.
//!
//! The inspector is schema-agnostic: it only knows the discriminator field
//! name it was given. All failing reasons are reported at once so a single
//! feedback round can address every defect.

use std::fmt;

use serde_json::Value;

/// Why a record set failed inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectionReason {
    /// The entry point returned no records at all.
    EmptyResult,
    /// A record is not a JSON object.
    NotAMapping { index: usize, found: String },
    /// A record lacks the discriminator field, or it is empty.
    MissingDiscriminator { index: usize, field: String },
}

impl fmt::Display for InspectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectionReason::EmptyResult => {
                write!(f, "the entry point returned an empty list; it must produce at least one record")
            }
            InspectionReason::NotAMapping { index, found } => {
                write!(f, "record {} is {}, expected a mapping (did you forget .model_dump(exclude_none=True)?)", index, found)
            }
            InspectionReason::MissingDiscriminator { index, field } => {
                write!(f, "record {} has no non-empty '{}' field", index, field)
            }
        }
    }
}

/// Outcome of inspecting one record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionResult {
    pub passed: bool,
    pub reasons: Vec<InspectionReason>,
}

/// Inspect records for basic structural sanity.
///
/// Checks that the set is non-empty, that every element is a mapping, and that
/// every element carries a non-empty discriminator field.
pub fn inspect(records: &[Value], discriminator: &str) -> InspectionResult {
    let mut reasons = Vec::new();

    if records.is_empty() {
        reasons.push(InspectionReason::EmptyResult);
    }

    for (index, record) in records.iter().enumerate() {
        let map = match record {
            Value::Object(map) => map,
            other => {
                reasons.push(InspectionReason::NotAMapping {
                    index,
                    found: json_type_name(other).to_string(),
                });
                continue;
            }
        };
        let has_discriminator = matches!(map.get(discriminator), Some(Value::String(s)) if !s.is_empty());
        if !has_discriminator {
            reasons.push(InspectionReason::MissingDiscriminator {
                index,
                field: discriminator.to_string(),
            });
        }
    }

    InspectionResult {
        passed: reasons.is_empty(),
        reasons,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_records_pass() {
        let records = vec![
            json!({"resourceType": "Patient", "id": "p1"}),
            json!({"resourceType": "Condition", "id": "c1"}),
        ];
        let result = inspect(&records, "resourceType");
        assert!(result.passed);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn test_empty_result_fails() {
        let result = inspect(&[], "resourceType");
        assert!(!result.passed);
        assert_eq!(result.reasons, vec![InspectionReason::EmptyResult]);
    }

    #[test]
    fn test_non_mapping_record_flagged() {
        let records = vec![json!(42)];
        let result = inspect(&records, "resourceType");
        assert!(!result.passed);
        assert!(matches!(
            result.reasons[0],
            InspectionReason::NotAMapping { index: 0, .. }
        ));
    }

    #[test]
    fn test_missing_discriminator_flagged_per_record() {
        let records = vec![
            json!({"resourceType": "Patient"}),
            json!({"id": "no-type"}),
            json!({"resourceType": ""}),
        ];
        let result = inspect(&records, "resourceType");
        assert!(!result.passed);
        assert_eq!(result.reasons.len(), 2);
        assert!(matches!(
            result.reasons[0],
            InspectionReason::MissingDiscriminator { index: 1, .. }
        ));
        assert!(matches!(
            result.reasons[1],
            InspectionReason::MissingDiscriminator { index: 2, .. }
        ));
    }

    #[test]
    fn test_all_reasons_reported_together() {
        let records = vec![json!("not a map"), json!({"id": "x"})];
        let result = inspect(&records, "resourceType");
        assert_eq!(result.reasons.len(), 2);
    }

    #[test]
    fn test_discriminator_field_is_injected() {
        let records = vec![json!({"kind": "A"})];
        assert!(inspect(&records, "kind").passed);
        assert!(!inspect(&records, "resourceType").passed);
    }
}
