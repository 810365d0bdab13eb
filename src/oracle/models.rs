use serde::Deserialize;

/// Models available for code generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// Speed tier - fast, cheap model for small fix-ups
    Speed,
    /// Smart tier - best reasoning for clinical code generation
    Smart,
}

/// Maximum tokens for all model tiers
const MODEL_MAX_TOKENS: u32 = 16384;

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Speed => "openai/gpt-oss-120b:nitro",
            Model::Smart => "anthropic/claude-sonnet-4.5:nitro",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        MODEL_MAX_TOKENS
    }
}

/// API usage information from OpenRouter
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by OpenRouter.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// One-line accounting summary for logs.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} prompt + {} completion = {} tokens",
            self.prompt_tokens, self.completion_tokens, self.total_tokens
        );
        if let Some(cost) = self.cost {
            s.push_str(&format!(" (${:.4})", cost));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ids() {
        assert!(Model::Smart.id().contains("claude"));
        assert!(Model::Speed.id().contains("gpt"));
    }

    #[test]
    fn test_usage_summary_accounting() {
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cost: Some(0.0123),
        };
        let s = usage.summary();
        assert!(s.contains("100 prompt"));
        assert!(s.contains("150 tokens"));
        assert!(s.contains("$0.0123"));

        let free = Usage { cost: None, ..usage };
        assert!(!free.summary().contains('$'));
    }
}
