//! The generation oracle: the external collaborator that writes and revises
//! candidate code.
//!
//! The engine only needs two operations: produce code for a requirement, and
//! repair previously rejected code given failure-specific feedback. Everything
//! else (transport, model choice, prompt text) is an implementation detail of
//! the oracle, which keeps sessions testable against a stub.

mod client;
mod models;
pub mod prompts;

pub use client::{LlmResponse, OracleError};
pub use models::{Model, Usage};

/// A source of candidate code.
#[allow(async_fn_in_trait)]
pub trait Oracle {
    /// Produce candidate code for a natural-language requirement.
    async fn generate(&self, requirement: &str) -> anyhow::Result<String>;

    /// Produce a repaired version of `prior_code` addressing `feedback`.
    async fn request_fix(&self, prior_code: &str, feedback: &str) -> anyhow::Result<String>;
}

/// How the initial user prompt is built from a generation request.
#[derive(Debug, Clone)]
pub enum GenerationTask {
    /// Free-form natural-language requirement.
    FreeForm,
    /// A linked set of specific resource types, a fixed count of each.
    Bundle {
        resource_types: Vec<String>,
        count_per_type: usize,
    },
}

/// Oracle backed by an OpenRouter-hosted model.
#[derive(Debug, Clone)]
pub struct LlmOracle {
    api_key: String,
    model: Model,
    task: GenerationTask,
}

impl LlmOracle {
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        Self {
            api_key: api_key.into(),
            model,
            task: GenerationTask::FreeForm,
        }
    }

    /// Oracle that generates a linked set of the given resource types instead
    /// of interpreting a free-form requirement.
    pub fn bundled(
        api_key: impl Into<String>,
        model: Model,
        resource_types: Vec<String>,
        count_per_type: usize,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            model,
            task: GenerationTask::Bundle {
                resource_types,
                count_per_type,
            },
        }
    }

    fn initial_prompt(&self, requirement: &str) -> String {
        match &self.task {
            GenerationTask::FreeForm => prompts::build_code_prompt(requirement),
            GenerationTask::Bundle {
                resource_types,
                count_per_type,
            } => prompts::build_bundle_prompt(resource_types, *count_per_type),
        }
    }
}

impl Oracle for LlmOracle {
    async fn generate(&self, requirement: &str) -> anyhow::Result<String> {
        let response = client::call_llm(
            &self.api_key,
            prompts::SYSTEM_PROMPT,
            &self.initial_prompt(requirement),
            self.model,
        )
        .await?;
        Ok(response.content)
    }

    async fn request_fix(&self, prior_code: &str, feedback: &str) -> anyhow::Result<String> {
        let response = client::call_llm(
            &self.api_key,
            prompts::SYSTEM_PROMPT,
            &prompts::build_fix_prompt(prior_code, feedback),
            self.model,
        )
        .await?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freeform_oracle_embeds_requirement() {
        let oracle = LlmOracle::new("key", Model::Smart);
        let prompt = oracle.initial_prompt("50 oncology patients");
        assert!(prompt.contains("50 oncology patients"));
    }

    #[test]
    fn test_bundled_oracle_uses_bundle_prompt() {
        let oracle = LlmOracle::bundled(
            "key",
            Model::Smart,
            vec!["Patient".to_string(), "Encounter".to_string()],
            4,
        );
        let prompt = oracle.initial_prompt("ignored");
        assert!(prompt.contains("Patient, Encounter"));
        assert!(prompt.contains("Count per type: 4"));
        assert!(!prompt.contains("ignored"));
    }
}
