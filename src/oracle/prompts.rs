//! Prompt templates for the generation oracle.

/// System prompt for FHIR R4B code generation.
pub const SYSTEM_PROMPT: &str = r#"You are an expert FHIR R4B synthetic data engineer. You write Python code
that produces clinically realistic, diverse, and valid FHIR R4B resources using the
fhir.resources library (Pydantic models).

HARD RULES — every response MUST follow these:
1. Define exactly one function: def generate_resources() -> list[dict]:
2. Import from fhir.resources.R4B (e.g. from fhir.resources.R4B.patient import Patient).
3. Use uuid4 for all resource IDs.
4. Call .model_dump(exclude_none=True) on every Pydantic model before appending to results.
5. Return a flat list[dict] of resource dictionaries.
6. Do NOT read external data files — generate everything inline with the random module.
7. All dates must be valid ISO-8601 strings with timezone offsets.
8. Use standard code systems: ICD-10-CM, SNOMED CT, LOINC, RxNorm, CPT where appropriate.
9. Every clinical resource (Condition, Observation, MedicationRequest, Procedure,
   Encounter, DiagnosticReport) MUST reference a Patient via "subject" or "patient".
10. Use only the Python standard library (random, uuid, datetime, decimal) plus
    fhir.resources. Never import os, sys, subprocess, socket, or requests.
11. Wrap numeric FHIR values with Decimal (from decimal import Decimal), not float.
12. Vary names, genders, dates, and codes across records so the data looks like a
    real EHR extract.

Return ONLY the Python code, no explanation text."#;

/// Prompt for the initial code generation from a natural-language requirement.
pub fn build_code_prompt(requirement: &str) -> String {
    format!(
        r#"Generate Python code to create FHIR R4B resources.

Requirement: {requirement}

Remember:
- def generate_resources() -> list[dict]:
- import from fhir.resources.R4B (e.g. from fhir.resources.R4B.patient import Patient)
- .model_dump(exclude_none=True) on every resource
- uuid4 for IDs, Decimal for numeric values
- real clinical codes (ICD-10, LOINC, RxNorm, SNOMED)
- diverse, realistic data"#
    )
}

/// Prompt for generating a linked set of specific resource types.
pub fn build_bundle_prompt(resource_types: &[String], count_per_type: usize) -> String {
    let resources = resource_types.join(", ");
    format!(
        r#"Generate Python code that creates FHIR R4B resources and returns them as a flat list.

Requirements:
- Resource types to generate: {resources}
- Count per type: {count_per_type}
- Link clinical resources to Patients (subject references)
- Link Encounters to Patients and Practitioners
- Use real clinical codes (ICD-10, LOINC, RxNorm, SNOMED)
- def generate_resources() -> list[dict]:
- .model_dump(exclude_none=True) on every resource
- uuid4 for IDs, Decimal for numeric values"#
    )
}

/// Prompt asking the oracle to repair code that failed a previous attempt.
/// `feedback` is the failure-specific diagnosis composed by the session.
pub fn build_fix_prompt(code: &str, feedback: &str) -> String {
    format!(
        r#"The following Python code was rejected:

PROBLEM:
{feedback}

CODE:
{code}

Fix the code so it passes. Keep the same function signature:
  def generate_resources() -> list[dict]:
Return ONLY the corrected Python code, no explanation."#
    )
}
