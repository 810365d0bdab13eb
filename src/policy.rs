//! Static safety policy for generated Python code.
//!
//! Validation is the only gate between untrusted oracle output and a live
//! process, so it runs strictly before execution and never evaluates any part
//! of the candidate. The code is parsed with tree-sitter and walked for import
//! statements (including `importlib.import_module` call forms) and call
//! expressions; imports outside the allow-list and calls on the deny-list are
//! reported as violations in source order.

use std::cell::RefCell;
use std::fmt;

use tree_sitter::{Node, Parser};

// Tree-sitter parsers are expensive to create but reusable across candidates.
// Each thread gets its own pre-configured Python parser.
thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - surfaces as a parse failure at validation time
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// What a candidate program may import and must not call.
#[derive(Debug, Clone)]
pub struct Policy {
    allowed_modules: Vec<String>,
    allowed_prefixes: Vec<String>,
    denied_calls: Vec<String>,
}

impl Policy {
    pub fn new<M, P, D>(allowed_modules: &[M], allowed_prefixes: &[P], denied_calls: &[D]) -> Self
    where
        M: AsRef<str>,
        P: AsRef<str>,
        D: AsRef<str>,
    {
        Self {
            allowed_modules: allowed_modules
                .iter()
                .map(|m| m.as_ref().to_string())
                .collect(),
            allowed_prefixes: allowed_prefixes
                .iter()
                .map(|p| p.as_ref().to_string())
                .collect(),
            denied_calls: denied_calls.iter().map(|d| d.as_ref().to_string()).collect(),
        }
    }

    /// A module passes if it matches an allowed module exactly, is a submodule
    /// of one, or starts with an allowed prefix.
    pub fn is_allowed_module(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        if self
            .allowed_modules
            .iter()
            .any(|m| m == module || m == root)
        {
            return true;
        }
        self.allowed_prefixes
            .iter()
            .any(|prefix| module.starts_with(prefix.as_str()))
    }

    pub fn is_denied_call(&self, callee: &str) -> bool {
        self.denied_calls.iter().any(|d| d == callee)
    }
}

/// Kind of static safety violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    SyntaxInvalid,
    DisallowedImport,
    DisallowedCall,
}

impl ViolationKind {
    pub fn label(&self) -> &'static str {
        match self {
            ViolationKind::SyntaxInvalid => "syntax error",
            ViolationKind::DisallowedImport => "disallowed import",
            ViolationKind::DisallowedCall => "disallowed call",
        }
    }
}

/// One static safety violation found in candidate code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub detail: String,
    /// 1-based line and column of the offending node, when known.
    pub location: Option<(usize, usize)>,
}

impl PolicyViolation {
    fn at(kind: ViolationKind, detail: impl Into<String>, node: &Node) -> Self {
        let point = node.start_position();
        Self {
            kind,
            detail: detail.into(),
            location: Some((point.row + 1, point.column + 1)),
        }
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.detail)?;
        if let Some((line, _)) = self.location {
            write!(f, " (line {})", line)?;
        }
        Ok(())
    }
}

/// Validate candidate code against a policy.
///
/// Pure function over its inputs: the same code and policy always produce the
/// same ordered violation list, and the candidate is never executed. A parse
/// failure short-circuits with a single `SyntaxInvalid` violation; no other
/// checks run against unparsable text.
pub fn validate(code: &str, policy: &Policy) -> Vec<PolicyViolation> {
    let tree = PYTHON_PARSER.with(|p| p.borrow_mut().parse(code, None));
    let tree = match tree {
        Some(tree) => tree,
        None => {
            return vec![PolicyViolation {
                kind: ViolationKind::SyntaxInvalid,
                detail: "candidate code could not be parsed".to_string(),
                location: None,
            }];
        }
    };

    let root = tree.root_node();
    if root.has_error() {
        let location = first_error_point(&root);
        return vec![PolicyViolation {
            kind: ViolationKind::SyntaxInvalid,
            detail: "candidate code is not valid Python".to_string(),
            location,
        }];
    }

    let mut violations = Vec::new();
    collect_violations(&root, code, policy, &mut violations);
    violations
}

/// Locate the first error or missing node for diagnostics.
fn first_error_point(node: &Node) -> Option<(usize, usize)> {
    if node.is_error() || node.is_missing() {
        let point = node.start_position();
        return Some((point.row + 1, point.column + 1));
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if !child.has_error() && !child.is_missing() {
            continue;
        }
        if let Some(point) = first_error_point(&child) {
            return Some(point);
        }
    }
    None
}

fn collect_violations(
    node: &Node,
    code: &str,
    policy: &Policy,
    violations: &mut Vec<PolicyViolation>,
) {
    match node.kind() {
        "import_statement" => check_import(node, code, policy, violations),
        "import_from_statement" => check_import_from(node, code, policy, violations),
        "call" => check_call(node, code, policy, violations),
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_violations(&child, code, policy, violations);
    }
}

/// `import a.b.c` / `import a.b.c as d`: every imported name is checked.
fn check_import(node: &Node, code: &str, policy: &Policy, violations: &mut Vec<PolicyViolation>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let module_node = match child.kind() {
            "dotted_name" => Some(child),
            "aliased_import" => child.child_by_field_name("name"),
            _ => None,
        };
        if let Some(module_node) = module_node {
            let module = node_text(&module_node, code);
            if !policy.is_allowed_module(&module) {
                violations.push(PolicyViolation::at(
                    ViolationKind::DisallowedImport,
                    module,
                    &module_node,
                ));
            }
        }
    }
}

/// `from a.b import X`: the module path is checked. Relative imports have no
/// resolvable root and are always rejected.
fn check_import_from(
    node: &Node,
    code: &str,
    policy: &Policy,
    violations: &mut Vec<PolicyViolation>,
) {
    if let Some(module_node) = node.child_by_field_name("module_name") {
        let module = node_text(&module_node, code);
        if module_node.kind() == "relative_import" {
            violations.push(PolicyViolation::at(
                ViolationKind::DisallowedImport,
                format!("relative import '{}'", module),
                &module_node,
            ));
        } else if !policy.is_allowed_module(&module) {
            violations.push(PolicyViolation::at(
                ViolationKind::DisallowedImport,
                module,
                &module_node,
            ));
        }
    }
}

/// Call expressions: deny-listed built-ins, plus the dynamic import call form
/// `importlib.import_module(...)`, which is treated as an import of its
/// argument. Bare `__import__` calls are already covered by the deny-list.
fn check_call(node: &Node, code: &str, policy: &Policy, violations: &mut Vec<PolicyViolation>) {
    let function = match node.child_by_field_name("function") {
        Some(function) => function,
        None => return,
    };

    let callee = match function.kind() {
        "identifier" => node_text(&function, code),
        "attribute" => function
            .child_by_field_name("attribute")
            .map(|attr| node_text(&attr, code))
            .unwrap_or_default(),
        _ => return,
    };

    if policy.is_denied_call(&callee) {
        violations.push(PolicyViolation::at(
            ViolationKind::DisallowedCall,
            callee,
            &function,
        ));
        return;
    }

    if callee == "import_module" {
        match first_string_argument(node, code) {
            Some(module) if policy.is_allowed_module(&module) => {}
            Some(module) => violations.push(PolicyViolation::at(
                ViolationKind::DisallowedImport,
                format!("dynamic import of '{}'", module),
                node,
            )),
            None => violations.push(PolicyViolation::at(
                ViolationKind::DisallowedImport,
                "dynamic import with non-literal module name",
                node,
            )),
        }
    }
}

/// First positional argument of a call, if it is a plain string literal.
fn first_string_argument(call: &Node, code: &str) -> Option<String> {
    let args = call.child_by_field_name("arguments")?;
    let mut cursor = args.walk();
    let first = args.named_children(&mut cursor).next()?;
    if first.kind() != "string" {
        return None;
    }
    let text = node_text(&first, code);
    let trimmed = text
        .trim_start_matches(|c: char| c.is_ascii_alphabetic()) // string prefixes (r, f, b)
        .trim_matches(|c| c == '"' || c == '\'');
    Some(trimmed.to_string())
}

fn node_text(node: &Node, code: &str) -> String {
    code[node.start_byte()..node.end_byte()].to_string()
}

/// Whether the code defines a top-level-reachable function with this name.
/// Unparsable code defines nothing.
pub fn defines_function(code: &str, name: &str) -> bool {
    let tree = PYTHON_PARSER.with(|p| p.borrow_mut().parse(code, None));
    let tree = match tree {
        Some(tree) => tree,
        None => return false,
    };
    if tree.root_node().has_error() {
        return false;
    }
    fn walk(node: &Node, code: &str, name: &str) -> bool {
        if node.kind() == "function_definition" {
            if let Some(ident) = node.child_by_field_name("name") {
                if node_text(&ident, code) == name {
                    return true;
                }
            }
        }
        let mut cursor = node.walk();
        let found = node
            .children(&mut cursor)
            .any(|child| walk(&child, code, name));
        found
    }
    walk(&tree.root_node(), code, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fhir_policy;

    #[test]
    fn test_valid_code_has_no_violations() {
        let code = "\
import uuid
from fhir.resources.R4B.patient import Patient

def generate_resources():
    return [{'resourceType': 'Patient', 'id': str(uuid.uuid4())}]
";
        assert!(validate(code, &fhir_policy()).is_empty());
    }

    #[test]
    fn test_syntax_error_short_circuits() {
        let code = "def generate_resources(:\n    return [";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::SyntaxInvalid);
    }

    #[test]
    fn test_disallowed_import_names_the_module() {
        let code = "import os\n\ndef generate_resources():\n    return []\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DisallowedImport);
        assert_eq!(violations[0].detail, "os");
        assert_eq!(violations[0].location.unwrap().0, 1);
    }

    #[test]
    fn test_disallowed_from_import() {
        let code = "from subprocess import run\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DisallowedImport);
        assert_eq!(violations[0].detail, "subprocess");
    }

    #[test]
    fn test_aliased_import_is_checked() {
        let code = "import socket as s\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].detail, "socket");
    }

    #[test]
    fn test_relative_import_rejected() {
        let code = "from . import helpers\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DisallowedImport);
    }

    #[test]
    fn test_denied_call_flagged() {
        let code = "def generate_resources():\n    return eval('[]')\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DisallowedCall);
        assert_eq!(violations[0].detail, "eval");
    }

    #[test]
    fn test_dunder_import_call_flagged() {
        let code = "mod = __import__('os')\n";
        let violations = validate(code, &fhir_policy());
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::DisallowedCall && v.detail == "__import__"));
    }

    #[test]
    fn test_dynamic_import_module_checked() {
        let code = "import importlib\nimportlib.import_module('os')\n";
        let violations = validate(code, &fhir_policy());
        // importlib itself is not on the allow-list, and the dynamic import
        // targets a module outside it.
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::DisallowedImport && v.detail.contains("importlib")));
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::DisallowedImport && v.detail.contains("'os'")));
    }

    #[test]
    fn test_multiple_violations_in_source_order() {
        let code = "import os\nimport sys\n\ndef generate_resources():\n    open('/etc/passwd')\n    return []\n";
        let violations = validate(code, &fhir_policy());
        assert_eq!(violations.len(), 3);
        assert_eq!(violations[0].detail, "os");
        assert_eq!(violations[1].detail, "sys");
        assert_eq!(violations[2].kind, ViolationKind::DisallowedCall);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let code = "import os\nopen('x')\n";
        let policy = fhir_policy();
        assert_eq!(validate(code, &policy), validate(code, &policy));
    }

    #[test]
    fn test_submodule_of_allowed_module_is_allowed() {
        let code = "import collections.abc\n";
        assert!(validate(code, &fhir_policy()).is_empty());
    }

    #[test]
    fn test_defines_function() {
        let code = "def generate_resources():\n    return []\n";
        assert!(defines_function(code, "generate_resources"));
        assert!(!defines_function(code, "main"));
        assert!(!defines_function("def broken(:", "broken"));
    }
}
