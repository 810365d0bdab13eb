//! Deterministic rewrites for known-safe classes of generator mistakes.
//!
//! Each rule is pure and idempotent, and the rules run in a fixed order before
//! validation so the corrected imports are what gets policy-checked. The
//! original response text is kept on the attempt record; normalization never
//! rejects code, it only rewrites.

use std::collections::HashMap;

use regex::{Captures, Regex};

/// Normalize candidate code: apply every rewrite rule in order.
///
/// `corrections` maps class names to the `fhir.resources.R4B` module they
/// actually live in, for rewriting commonly mis-guessed import paths.
pub fn normalize(code: &str, corrections: &HashMap<String, String>) -> String {
    let code = fix_naive_datetimes(code);
    fix_import_modules(&code, corrections)
}

/// Rewrite naive current-time construction to be explicit about the offset.
///
/// FHIR `instant` fields require a timezone; models frequently write
/// `datetime.now().isoformat()`, which produces a naive timestamp that fails
/// model validation in the worker. Both rewrites target empty argument lists
/// only, so already-aware calls are left alone and the rule is idempotent.
fn fix_naive_datetimes(code: &str) -> String {
    let now_re = Regex::new(r"datetime\.now\(\s*\)").unwrap_or_else(|_| never_match());
    let utcnow_re = Regex::new(r"datetime\.utcnow\(\s*\)").unwrap_or_else(|_| never_match());

    let code = now_re.replace_all(code, "datetime.now(datetime.timezone.utc)");
    utcnow_re
        .replace_all(&code, "datetime.now(datetime.timezone.utc)")
        .into_owned()
}

/// Rewrite `from fhir.resources.R4B.<module> import <Class, ...>` lines whose
/// module is wrong for the classes they import.
///
/// Backbone elements live inside their parent resource's module, which models
/// regularly guess wrong (`timingrepeat` for `TimingRepeat` is the classic).
/// Classes are regrouped by their corrected module, one import line per
/// module; classes absent from the corrections table stay where they were.
fn fix_import_modules(code: &str, corrections: &HashMap<String, String>) -> String {
    let import_re =
        Regex::new(r"(?m)^(from fhir\.resources\.R4B\.)(\w+)(\s+import\s+)(.+)$")
            .unwrap_or_else(|_| never_match());

    import_re
        .replace_all(code, |caps: &Captures| {
            let prefix = &caps[1];
            let current_module = &caps[2];
            let import_kw = &caps[3];
            let names = &caps[4];

            // Group classes by their correct module, preserving grouping
            // stability via sorted module order.
            let mut by_module: Vec<(String, Vec<String>)> = Vec::new();
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let module = corrections
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| current_module.to_string());
                match by_module.iter_mut().find(|(m, _)| *m == module) {
                    Some((_, classes)) => classes.push(name.to_string()),
                    None => by_module.push((module, vec![name.to_string()])),
                }
            }
            by_module.sort_by(|(a, _), (b, _)| a.cmp(b));

            by_module
                .iter()
                .map(|(module, classes)| {
                    format!("{}{}{}{}", prefix, module, import_kw, classes.join(", "))
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .into_owned()
}

/// Fallback pattern that matches nothing, used if a static regex fails to
/// compile.
fn never_match() -> Regex {
    Regex::new("$^").expect("empty-match regex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::import_corrections;

    fn corrections() -> HashMap<String, String> {
        import_corrections()
    }

    #[test]
    fn test_naive_now_rewritten() {
        let code = "ts = datetime.now().isoformat()";
        assert_eq!(
            normalize(code, &corrections()),
            "ts = datetime.now(datetime.timezone.utc).isoformat()"
        );
    }

    #[test]
    fn test_utcnow_rewritten() {
        let code = "ts = datetime.utcnow()";
        assert_eq!(
            normalize(code, &corrections()),
            "ts = datetime.now(datetime.timezone.utc)"
        );
    }

    #[test]
    fn test_aware_now_untouched() {
        let code = "ts = datetime.now(datetime.timezone.utc)";
        assert_eq!(normalize(code, &corrections()), code);
    }

    #[test]
    fn test_wrong_module_rewritten() {
        let code = "from fhir.resources.R4B.timingrepeat import TimingRepeat\n";
        let fixed = normalize(code, &corrections());
        assert!(fixed.contains("from fhir.resources.R4B.timing import TimingRepeat"));
        assert!(!fixed.contains("timingrepeat"));
    }

    #[test]
    fn test_correct_import_unchanged() {
        let code = "from fhir.resources.R4B.patient import Patient\n";
        assert_eq!(normalize(code, &corrections()), code);
    }

    #[test]
    fn test_classes_regrouped_by_module() {
        let code = "from fhir.resources.R4B.timingrepeat import TimingRepeat, Timing\n";
        let fixed = normalize(code, &corrections());
        assert!(fixed.contains("from fhir.resources.R4B.timing import TimingRepeat, Timing"));
        assert_eq!(fixed.matches("import").count(), 1);
    }

    #[test]
    fn test_classes_split_across_modules() {
        let code =
            "from fhir.resources.R4B.observation import ObservationComponent, HumanName\n";
        let fixed = normalize(code, &corrections());
        assert!(fixed.contains("from fhir.resources.R4B.humanname import HumanName"));
        assert!(fixed.contains("from fhir.resources.R4B.observation import ObservationComponent"));
    }

    #[test]
    fn test_unknown_class_stays_in_place() {
        let code = "from fhir.resources.R4B.customthing import CustomThing\n";
        assert_eq!(normalize(code, &corrections()), code);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "ts = datetime.now()",
            "ts = datetime.utcnow().isoformat()",
            "from fhir.resources.R4B.timingrepeat import TimingRepeat, Timing\n",
            "from fhir.resources.R4B.patient import Patient\nx = datetime.now()\n",
            "def generate_resources():\n    return []\n",
        ];
        let corrections = corrections();
        for sample in samples {
            let once = normalize(sample, &corrections);
            let twice = normalize(&once, &corrections);
            assert_eq!(once, twice, "normalize not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_no_rule_match_returns_input() {
        let code = "def generate_resources():\n    return [{'resourceType': 'Patient'}]\n";
        assert_eq!(normalize(code, &corrections()), code);
    }
}
