//! Candidate code extracted from an oracle response.
//!
//! Models routinely wrap code in markdown fences or prepend prose; extraction
//! strips that down to the bare Python source. A `CandidateCode` is created
//! once per oracle response and never mutated; normalization produces a new
//! string, and the original response is kept for diagnostics.

/// One oracle response, with the code pulled out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateCode {
    /// Raw response text exactly as the oracle returned it.
    pub raw: String,
    /// Code with markdown fences and prose stripped.
    pub extracted: String,
    /// Which attempt produced this candidate (0 = initial generation).
    pub attempt: usize,
}

impl CandidateCode {
    pub fn from_response(raw: impl Into<String>, attempt: usize) -> Self {
        let raw = raw.into();
        let extracted = extract_code(&raw);
        Self {
            raw,
            extracted,
            attempt,
        }
    }
}

/// Extract Python code from an LLM response.
///
/// Prefers a ```python fence, then any bare fence (dropping a leading language
/// tag line), and finally falls back to the trimmed response itself.
pub fn extract_code(response: &str) -> String {
    if let Some(start) = response.find("```python") {
        let body = &response[start + "```python".len()..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }

    if let Some(start) = response.find("```") {
        let body = &response[start + 3..];
        if let Some(end) = body.find("```") {
            let code = body[..end].trim();
            // A bare fence may open with a language tag (```py, ```text, ...).
            // Real code starts with an import or a def; anything else on the
            // first line that has no spaces is treated as a tag and dropped.
            let mut lines = code.lines();
            if let Some(first) = lines.next() {
                let looks_like_tag = !first.trim().is_empty()
                    && !first.contains(' ')
                    && !first.starts_with("import")
                    && !first.starts_with("from")
                    && !first.starts_with("def ")
                    && !first.starts_with('#');
                if looks_like_tag {
                    return lines.collect::<Vec<_>>().join("\n").trim().to_string();
                }
            }
            return code.to_string();
        }
    }

    response.trim().to_string()
}
