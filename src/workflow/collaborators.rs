use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::GateResult;

/// What a generated script is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    /// Answer a question with a read-only script.
    Query,
    /// Inspect the sandbox before a task, read-only.
    Plan,
    /// Carry out the task using what the plan found.
    Execute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub purpose: Purpose,
    /// The operator's question or task, verbatim.
    pub request: String,
    pub sandbox_root: String,
    /// Output of the planning script, for `Purpose::Execute`.
    pub context: Option<String>,
    /// Parser diagnostics from the previous attempt.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedScript {
    pub script: String,
    /// Human-readable summary shown when approval is requested.
    #[serde(default)]
    pub explanation: String,
}

impl GeneratedScript {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            explanation: String::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }
}

/// Anything that can produce a script for a request, typically a language
/// model client.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GateResult<GeneratedScript>;
}

/// The operator's go/no-go for a script that is about to run in the write
/// phase.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, explanation: &str, script: &str) -> bool;
}

/// Turns a script's output into an answer for the operator.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &str, output: &str) -> GateResult<String>;
}

/// Fixed decision, for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub bool);

#[async_trait]
impl Approver for StaticApprover {
    async fn approve(&self, _explanation: &str, _script: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_approver() {
        assert!(tokio_test::block_on(StaticApprover(true).approve("", "Get-Date")));
        assert!(!tokio_test::block_on(StaticApprover(false).approve("", "Get-Date")));
    }

    #[test]
    fn test_generated_script_explanation_defaults() {
        let generated: GeneratedScript = serde_json::from_str(r#"{"script": "Get-Date"}"#).unwrap();
        assert_eq!(generated, GeneratedScript::new("Get-Date"));
    }
}
