//! FHIR R4B defaults for the generation engine.
//!
//! The engine itself is schema-agnostic: the policy, entry point name,
//! discriminator field, and import corrections are all injected through
//! [`crate::session::SessionConfig`]. This module supplies the values for the
//! FHIR domain so callers don't have to assemble them by hand.

use std::collections::HashMap;

use crate::policy::Policy;

/// Entry point every candidate program must define.
pub const ENTRY_POINT: &str = "generate_resources";

/// Field every produced record must carry to count as a FHIR resource.
pub const DISCRIMINATOR_FIELD: &str = "resourceType";

/// Stdlib modules the generated code may import.
const ALLOWED_MODULES: &[&str] = &[
    "random",
    "uuid",
    "datetime",
    "decimal",
    "json",
    "math",
    "string",
    "itertools",
    "collections",
    "typing",
    "copy",
    "calendar",
];

/// Import prefixes the generated code may use beyond the stdlib set.
const ALLOWED_MODULE_PREFIXES: &[&str] = &["fhir.resources"];

/// Built-ins the generated code must never call. Dynamic evaluation, code
/// compilation, and raw file access are all handled by the harness, never by
/// the candidate.
const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "globals",
    "locals",
    "__import__",
    "breakpoint",
];

/// Policy for FHIR generation code: stdlib data modules plus `fhir.resources`.
pub fn fhir_policy() -> Policy {
    Policy::new(ALLOWED_MODULES, ALLOWED_MODULE_PREFIXES, DENIED_CALLS)
}

/// Class name → correct `fhir.resources.R4B` module, for imports models
/// habitually get wrong. Backbone-element classes live inside their parent
/// resource's module, not in a module of their own, which is the usual trap.
pub fn import_corrections() -> HashMap<String, String> {
    const CORRECTIONS: &[(&str, &str)] = &[
        ("TimingRepeat", "timing"),
        ("Timing", "timing"),
        ("ObservationComponent", "observation"),
        ("ObservationReferenceRange", "observation"),
        ("PatientContact", "patient"),
        ("PatientCommunication", "patient"),
        ("EncounterLocation", "encounter"),
        ("EncounterParticipant", "encounter"),
        ("EncounterDiagnosis", "encounter"),
        ("BundleEntry", "bundle"),
        ("BundleEntryRequest", "bundle"),
        ("ConditionStage", "condition"),
        ("ConditionEvidence", "condition"),
        ("DosageDoseAndRate", "dosage"),
        ("MedicationRequestDispenseRequest", "medicationrequest"),
        ("MedicationIngredient", "medication"),
        ("AllergyIntoleranceReaction", "allergyintolerance"),
        ("CarePlanActivity", "careplan"),
        ("DiagnosticReportMedia", "diagnosticreport"),
        ("ProcedurePerformer", "procedure"),
        ("OrganizationContact", "organization"),
        ("PractitionerQualification", "practitioner"),
        ("LocationPosition", "location"),
        ("DocumentReferenceContent", "documentreference"),
        ("HumanName", "humanname"),
        ("ContactPoint", "contactpoint"),
        ("CodeableConcept", "codeableconcept"),
        ("Coding", "coding"),
        ("Quantity", "quantity"),
        ("Identifier", "identifier"),
        ("Reference", "reference"),
        ("Address", "address"),
        ("Period", "period"),
        ("Annotation", "annotation"),
        ("Attachment", "attachment"),
        ("Meta", "meta"),
        ("Narrative", "narrative"),
        ("Extension", "extension"),
        ("Dosage", "dosage"),
        ("Range", "range"),
        ("Ratio", "ratio"),
    ];

    CORRECTIONS
        .iter()
        .map(|(class, module)| (class.to_string(), module.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fhir_policy_allows_stdlib_and_fhir() {
        let policy = fhir_policy();
        assert!(policy.is_allowed_module("uuid"));
        assert!(policy.is_allowed_module("fhir.resources.R4B.patient"));
        assert!(!policy.is_allowed_module("os"));
        assert!(!policy.is_allowed_module("subprocess"));
    }

    #[test]
    fn test_fhir_policy_denies_dynamic_evaluation() {
        let policy = fhir_policy();
        assert!(policy.is_denied_call("eval"));
        assert!(policy.is_denied_call("open"));
        assert!(!policy.is_denied_call("print"));
    }

    #[test]
    fn test_corrections_map_backbone_elements_to_parent_modules() {
        let corrections = import_corrections();
        assert_eq!(corrections.get("TimingRepeat").unwrap(), "timing");
        assert_eq!(
            corrections.get("ObservationComponent").unwrap(),
            "observation"
        );
    }
}
