//! Quality assessment for accepted code and its records.
//!
//! Runs after a session succeeds and never blocks acceptance; it grades how
//! idiomatic the generated code is and how well the records hang together.

use serde::Serialize;
use serde_json::Value;

use crate::policy;
use crate::schema;

/// Resource types that must reference a Patient to be clinically coherent.
const CLINICAL_TYPES: [&str; 4] = ["Condition", "Observation", "MedicationRequest", "Procedure"];

/// Outcome of a single quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Pass,
    Partial,
    Fail,
}

/// One named check with its result.
#[derive(Debug, Clone, Serialize)]
pub struct QualityCheck {
    pub name: &'static str,
    pub result: CheckResult,
}

/// Score, grade, and per-check detail for one accepted candidate.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    /// 0.0 to 1.0, clamped.
    pub score: f64,
    pub grade: &'static str,
    pub passed: bool,
    pub checks: Vec<QualityCheck>,
    pub warnings: Vec<String>,
}

impl QualityReport {
    /// Multi-line report for terminal display.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Quality: {:.2} / 1.00 ({}), {}\n",
            self.score,
            self.grade,
            if self.passed { "passed" } else { "failed" }
        ));
        for warning in &self.warnings {
            out.push_str(&format!("  warning: {warning}\n"));
        }
        out
    }
}

/// Grade accepted code and (optionally) the records it produced.
pub fn assess(code: &str, records: Option<&[Value]>) -> QualityReport {
    let mut score: f64 = 1.0;
    let mut checks = Vec::new();
    let mut warnings = Vec::new();

    // Resource IDs should come from uuid4, not counters or literals.
    if code.contains("uuid4") || code.contains("from uuid import") {
        checks.push(QualityCheck {
            name: "uses_uuid",
            result: CheckResult::Pass,
        });
    } else {
        checks.push(QualityCheck {
            name: "uses_uuid",
            result: CheckResult::Fail,
        });
        score -= 0.15;
        warnings.push("missing uuid4 for ID generation".to_string());
    }

    // Pydantic models must be dumped with exclude_none, or the records carry
    // thousands of nulls.
    if code.contains("model_dump(exclude_none=True)") {
        checks.push(QualityCheck {
            name: "uses_model_dump",
            result: CheckResult::Pass,
        });
    } else if code.contains("model_dump(") {
        checks.push(QualityCheck {
            name: "uses_model_dump",
            result: CheckResult::Partial,
        });
        score -= 0.05;
        warnings.push("model_dump() should pass exclude_none=True".to_string());
    } else {
        checks.push(QualityCheck {
            name: "uses_model_dump",
            result: CheckResult::Fail,
        });
        score -= 0.2;
        warnings.push("missing .model_dump(exclude_none=True)".to_string());
    }

    if policy::defines_function(code, schema::ENTRY_POINT) {
        checks.push(QualityCheck {
            name: "has_entry_point",
            result: CheckResult::Pass,
        });
    } else {
        checks.push(QualityCheck {
            name: "has_entry_point",
            result: CheckResult::Fail,
        });
        score -= 0.3;
        warnings.push(format!("missing {}() function", schema::ENTRY_POINT));
    }

    if code.contains("from fhir.resources.R4B") {
        checks.push(QualityCheck {
            name: "uses_fhir_r4b",
            result: CheckResult::Pass,
        });
    } else {
        checks.push(QualityCheck {
            name: "uses_fhir_r4b",
            result: CheckResult::Fail,
        });
        score -= 0.1;
        warnings.push("should import from fhir.resources.R4B".to_string());
    }

    if let Some(records) = records {
        let patients = records
            .iter()
            .filter(|r| r["resourceType"] == "Patient")
            .count();
        let clinical: Vec<&Value> = records
            .iter()
            .filter(|r| {
                r["resourceType"]
                    .as_str()
                    .map(|t| CLINICAL_TYPES.contains(&t))
                    .unwrap_or(false)
            })
            .collect();

        if patients == 0 && !clinical.is_empty() {
            checks.push(QualityCheck {
                name: "has_patients",
                result: CheckResult::Fail,
            });
            score -= 0.2;
            warnings.push("clinical resources without any Patient resource".to_string());
        } else {
            checks.push(QualityCheck {
                name: "has_patients",
                result: CheckResult::Pass,
            });
        }

        if !clinical.is_empty() && patients > 0 {
            let has_refs = clinical
                .iter()
                .any(|r| r.get("subject").is_some() || r.get("patient").is_some());
            checks.push(QualityCheck {
                name: "has_references",
                result: if has_refs {
                    CheckResult::Pass
                } else {
                    CheckResult::Fail
                },
            });
            if !has_refs {
                score -= 0.2;
                warnings.push("clinical resources do not reference patients".to_string());
            }
        }
    }

    let score = score.clamp(0.0, 1.0);
    QualityReport {
        score,
        grade: grade(score),
        passed: score >= 0.7,
        checks,
        warnings,
    }
}

fn grade(score: f64) -> &'static str {
    if score >= 0.95 {
        "A+"
    } else if score >= 0.90 {
        "A"
    } else if score >= 0.85 {
        "B+"
    } else if score >= 0.80 {
        "B"
    } else if score >= 0.70 {
        "C"
    } else {
        "F"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IDIOMATIC_CODE: &str = "\
from uuid import uuid4
from fhir.resources.R4B.patient import Patient

def generate_resources():
    patient = Patient(id=str(uuid4()))
    return [patient.model_dump(exclude_none=True)]
";

    #[test]
    fn test_idiomatic_code_gets_top_grade() {
        let report = assess(IDIOMATIC_CODE, None);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.grade, "A+");
        assert!(report.passed);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_entry_point_costs_most() {
        let code = "from uuid import uuid4\nx = uuid4()\n";
        let report = assess(code, None);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("generate_resources")));
        assert!(report.score < 0.7);
        assert!(!report.passed);
    }

    #[test]
    fn test_partial_model_dump_is_minor() {
        let code = IDIOMATIC_CODE.replace("model_dump(exclude_none=True)", "model_dump()");
        let report = assess(&code, None);
        assert!((report.score - 0.95).abs() < 1e-9);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "uses_model_dump" && c.result == CheckResult::Partial));
    }

    #[test]
    fn test_clinical_records_without_patient_flagged() {
        let records = vec![json!({"resourceType": "Condition", "id": "c1"})];
        let report = assess(IDIOMATIC_CODE, Some(&records));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("without any Patient")));
    }

    #[test]
    fn test_clinical_records_must_reference_patient() {
        let linked = vec![
            json!({"resourceType": "Patient", "id": "p1"}),
            json!({"resourceType": "Condition", "id": "c1",
                   "subject": {"reference": "Patient/p1"}}),
        ];
        let report = assess(IDIOMATIC_CODE, Some(&linked));
        assert_eq!(report.score, 1.0);

        let unlinked = vec![
            json!({"resourceType": "Patient", "id": "p1"}),
            json!({"resourceType": "Condition", "id": "c1"}),
        ];
        let report = assess(IDIOMATIC_CODE, Some(&unlinked));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("reference")));
    }

    #[test]
    fn test_score_never_goes_negative() {
        let report = assess("x = 1", None);
        assert!(report.score >= 0.0);
        assert_eq!(report.grade, "F");
    }
}
