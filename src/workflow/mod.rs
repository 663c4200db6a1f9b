pub mod collaborators;

pub use collaborators::*;

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::{
    Classification, ExecutionOutcome, ExecutionResult, GateError, GateResult, Gateway, Phase, RunnableScript,
    ValidatedScript,
};
use crate::sandbox::CancelHandle;

/// Progress updates for a status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    Generating(Purpose),
    Regenerating { attempt: u32, error: String },
    Validating,
    Classified(Classification),
    AwaitingApproval,
    Executing(Phase),
    Summarizing,
    Finished,
}

#[derive(Debug, Clone)]
pub struct FlowReport {
    pub purpose: Purpose,
    pub script: String,
    pub explanation: String,
    pub classification: Classification,
    pub result: ExecutionResult,
    /// Set by the query and task flows when a summarizer is configured.
    pub summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub plan: FlowReport,
    pub execution: FlowReport,
}

/// Query and task flows over the gateway. Script generation, approval and
/// summarizing are injected. Every blocking gateway step runs on tokio's
/// blocking pool, and dropping a flow's future kills whatever child process
/// that step started.
pub struct Workflow {
    gateway: Arc<Gateway>,
    syntax_retries: u32,
    status: Option<mpsc::Sender<FlowStatus>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("gateway", &self.gateway)
            .field("syntax_retries", &self.syntax_retries)
            .field("summarizer", &self.summarizer.is_some())
            .finish_non_exhaustive()
    }
}

struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Workflow {
    pub fn new(gateway: Arc<Gateway>, syntax_retries: u32) -> Self {
        Self {
            gateway,
            syntax_retries,
            status: None,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_status_channel(mut self, status: mpsc::Sender<FlowStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Generate, validate, classify (must be `Read`), run with the read
    /// timeout, then summarize the output.
    pub async fn query(&self, question: &str, generator: &dyn ScriptGenerator) -> GateResult<FlowReport> {
        info!(session_id = %self.gateway.session_id(), "Starting query flow");

        let mut report = self.read_step(Purpose::Query, question, generator).await?;
        report.summary = self.summarize(question, &report.result).await?;
        self.report(FlowStatus::Finished).await;
        Ok(report)
    }

    /// Plan with a read-only script, then generate the mutation script from
    /// the plan's output, ask for approval and run it with the write timeout.
    pub async fn task(
        &self,
        task: &str,
        planner: &dyn ScriptGenerator,
        executor: &dyn ScriptGenerator,
        approver: &dyn Approver,
    ) -> GateResult<TaskReport> {
        info!(session_id = %self.gateway.session_id(), "Starting task flow");

        let plan = self.read_step(Purpose::Plan, task, planner).await?;

        let (generated, validated) = self
            .generate_valid(Purpose::Execute, task, Some(plan.result.stdout.clone()), executor)
            .await?;

        let classified = self.gateway.classify(validated);
        let classification = classified.classification();
        self.report(FlowStatus::Classified(classification)).await;

        let approved = if classification == Classification::Unsafe {
            false
        } else {
            self.report(FlowStatus::AwaitingApproval).await;
            approver.approve(&generated.explanation, &generated.script).await
        };

        let runnable = self.gateway.authorize_write(classified, approved)?;

        self.report(FlowStatus::Executing(Phase::Write)).await;
        let result = self.execute(runnable).await?;
        let summary = self.summarize(task, &result).await?;

        self.report(FlowStatus::Finished).await;
        Ok(TaskReport {
            plan,
            execution: FlowReport {
                purpose: Purpose::Execute,
                script: generated.script,
                explanation: generated.explanation,
                classification,
                result,
                summary,
            },
        })
    }

    /// Runs an already written script. `Read` scripts run straight away in
    /// the read phase; anything else needs `approver`.
    pub async fn run(&self, script: &GeneratedScript, approver: &dyn Approver) -> GateResult<FlowReport> {
        self.report(FlowStatus::Validating).await;
        let text = script.script.clone();
        let validated = self
            .run_blocking(move |gateway, cancel| gateway.validate_with_cancel(text, cancel))
            .await??;

        let classified = self.gateway.classify(validated);
        let classification = classified.classification();
        self.report(FlowStatus::Classified(classification)).await;

        let runnable = match classification {
            Classification::Read => self.gateway.authorize_read(classified)?,
            Classification::Write => {
                self.report(FlowStatus::AwaitingApproval).await;
                let approved = approver.approve(&script.explanation, &script.script).await;
                self.gateway.authorize_write(classified, approved)?
            }
            Classification::Unsafe => self.gateway.authorize_write(classified, false)?,
        };

        let phase = runnable.phase();
        self.report(FlowStatus::Executing(phase)).await;
        let result = self.execute(runnable).await?;

        self.report(FlowStatus::Finished).await;
        Ok(FlowReport {
            purpose: match phase {
                Phase::Read => Purpose::Query,
                Phase::Write => Purpose::Execute,
            },
            script: script.script.clone(),
            explanation: script.explanation.clone(),
            classification,
            result,
            summary: None,
        })
    }

    async fn read_step(
        &self,
        purpose: Purpose,
        request: &str,
        generator: &dyn ScriptGenerator,
    ) -> GateResult<FlowReport> {
        let (generated, validated) = self.generate_valid(purpose, request, None, generator).await?;

        let classified = self.gateway.classify(validated);
        let classification = classified.classification();
        self.report(FlowStatus::Classified(classification)).await;

        let runnable = self.gateway.authorize_read(classified)?;

        self.report(FlowStatus::Executing(Phase::Read)).await;
        let result = self.execute(runnable).await?;

        Ok(FlowReport {
            purpose,
            script: generated.script,
            explanation: generated.explanation,
            classification,
            result,
            summary: None,
        })
    }

    async fn summarize(&self, request: &str, result: &ExecutionResult) -> GateResult<Option<String>> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(None);
        };

        self.report(FlowStatus::Summarizing).await;
        summarizer.summarize(request, &result.stdout).await.map(Some)
    }

    /// Asks `generator` for a script until one parses, regenerating at most
    /// `syntax_retries` times with the parser's message as feedback.
    async fn generate_valid(
        &self,
        purpose: Purpose,
        request: &str,
        context: Option<String>,
        generator: &dyn ScriptGenerator,
    ) -> GateResult<(GeneratedScript, ValidatedScript)> {
        let mut feedback = None;
        let mut attempt = 0;

        loop {
            self.report(FlowStatus::Generating(purpose)).await;
            let generated = generator
                .generate(&GenerationRequest {
                    purpose,
                    request: request.to_string(),
                    sandbox_root: self.gateway.root().to_string(),
                    context: context.clone(),
                    feedback: feedback.take(),
                })
                .await?;

            self.report(FlowStatus::Validating).await;
            let script = generated.script.clone();
            let validation = self
                .run_blocking(move |gateway, cancel| gateway.validate_with_cancel(script, cancel))
                .await?;

            match validation {
                Ok(validated) => return Ok((generated, validated)),
                Err(GateError::SyntaxInvalid(message)) if attempt < self.syntax_retries => {
                    attempt += 1;
                    debug!(attempt, "Regenerating script after syntax error");
                    self.report(FlowStatus::Regenerating {
                        attempt,
                        error: message.clone(),
                    })
                    .await;
                    feedback = Some(message);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute(&self, runnable: RunnableScript) -> GateResult<ExecutionResult> {
        let result = self
            .run_blocking(move |gateway, cancel| gateway.execute_with_cancel(runnable, cancel))
            .await??;

        if result.success {
            return Ok(result);
        }

        warn!(outcome = ?result.outcome, "Script did not complete successfully");
        match result.outcome {
            ExecutionOutcome::Cancelled => Err(GateError::Cancelled),
            _ => Err(GateError::ExecutionFailed(result.stderr)),
        }
    }

    async fn run_blocking<T, F>(&self, step: F) -> GateResult<T>
    where
        F: FnOnce(&Gateway, &CancelHandle) -> T + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancelHandle::new();
        let _guard = CancelOnDrop(cancel.clone());
        let gateway = Arc::clone(&self.gateway);

        tokio::task::spawn_blocking(move || step(&gateway, &cancel))
            .await
            .map_err(|e| GateError::ExecutionFailed(format!("worker task failed: {}", e)))
    }

    async fn report(&self, status: FlowStatus) {
        if let Some(tx) = &self.status {
            let _ = tx.send(status).await;
        }
    }
}
