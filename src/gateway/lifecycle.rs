use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Classification, ExecutionResult, GateError, GateResult};
use crate::config::{Config, TimeoutPolicy};
use crate::sandbox::{CancelHandle, OutputSizeGuard, SandboxRoot, ScriptClassifier, ScriptExecutor, ScriptHost, Verdict};
use crate::security::AuditLogger;

/// Which timeout applies to a runnable script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Read,
    Write,
}

/// A script that passed the syntax check. Each lifecycle stage consumes the
/// previous one, so nothing reaches the executor without a classification
/// and, beyond a read, an explicit approval.
#[derive(Debug, Clone)]
pub struct ValidatedScript {
    script: String,
}

impl ValidatedScript {
    pub fn script(&self) -> &str {
        &self.script
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedScript {
    script: String,
    verdict: Verdict,
}

impl ClassifiedScript {
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn classification(&self) -> Classification {
        self.verdict.classification()
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Read-phase execution. Only `Read` scripts qualify.
    pub fn into_read(self) -> GateResult<RunnableScript> {
        match self.classification() {
            Classification::Read => Ok(RunnableScript {
                script: self.script,
                classification: Classification::Read,
                phase: Phase::Read,
            }),
            Classification::Write => Err(GateError::MutationInReadPhase),
            Classification::Unsafe => Err(self.rejection()),
        }
    }

    /// Write-phase execution after the operator's decision. `Unsafe` scripts
    /// are refused whatever the decision.
    pub fn into_approved(self, approved: bool) -> GateResult<RunnableScript> {
        let classification = self.classification();
        if classification == Classification::Unsafe {
            return Err(self.rejection());
        }

        if !approved {
            return Err(GateError::NotApproved);
        }

        Ok(RunnableScript {
            script: self.script,
            classification,
            phase: Phase::Write,
        })
    }

    fn rejection(&self) -> GateError {
        self.verdict.rejection().unwrap_or(GateError::DangerousConstruct)
    }
}

#[derive(Debug, Clone)]
pub struct RunnableScript {
    script: String,
    classification: Classification,
    phase: Phase,
}

impl RunnableScript {
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// One session's view of the sandbox: a fixed root, the runtime to run
/// scripts with, timeouts and output limit, and the audit trail.
#[derive(Debug)]
pub struct Gateway {
    root: SandboxRoot,
    classifier: ScriptClassifier,
    executor: ScriptExecutor,
    output_guard: OutputSizeGuard,
    timeouts: TimeoutPolicy,
    audit: AuditLogger,
}

impl Gateway {
    pub fn new(
        root: SandboxRoot,
        host: ScriptHost,
        timeouts: TimeoutPolicy,
        output_guard: OutputSizeGuard,
        audit: AuditLogger,
    ) -> Self {
        let gateway = Self {
            classifier: ScriptClassifier::new(root.clone()),
            executor: ScriptExecutor::new(host, timeouts.syntax)
                .with_capture_limit(output_guard.limit().saturating_add(1)),
            root,
            output_guard,
            timeouts,
            audit,
        };

        info!(
            session_id = %gateway.session_id(),
            root = %gateway.root,
            audit = gateway.audit.is_enabled(),
            "Gateway session started"
        );
        gateway
    }

    pub fn from_config(config: &Config, root: SandboxRoot) -> GateResult<Self> {
        Ok(Self::new(
            root,
            config.script_host(),
            config.timeouts(),
            config.output_guard(),
            AuditLogger::new(&config.audit)?,
        ))
    }

    pub fn session_id(&self) -> &str {
        self.executor.session_id()
    }

    pub fn root(&self) -> &SandboxRoot {
        &self.root
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    pub fn validate(&self, script: impl Into<String>) -> GateResult<ValidatedScript> {
        self.validate_with_cancel(script, &CancelHandle::new())
    }

    pub fn validate_with_cancel(&self, script: impl Into<String>, cancel: &CancelHandle) -> GateResult<ValidatedScript> {
        let script = script.into();

        match self.executor.syntax_validator().validate_with_cancel(&script, cancel) {
            Ok(()) => {
                self.record(self.audit.log_validated(self.session_id(), &script));
                Ok(ValidatedScript { script })
            }
            Err(e) => {
                self.record(self.audit.log_syntax_rejected(self.session_id(), &script, &e));
                Err(e)
            }
        }
    }

    pub fn classify(&self, validated: ValidatedScript) -> ClassifiedScript {
        let verdict = self.classifier.assess(&validated.script);
        let rule = format!("{:?}", verdict);

        self.record(self.audit.log_classified(
            self.session_id(),
            &validated.script,
            verdict.classification(),
            &rule,
        ));

        ClassifiedScript {
            script: validated.script,
            verdict,
        }
    }

    /// `ClassifiedScript::into_read` with the refusal recorded.
    pub fn authorize_read(&self, classified: ClassifiedScript) -> GateResult<RunnableScript> {
        let session_id = self.session_id();
        let classification = classified.classification();
        let script = classified.script.clone();

        // Unsafe verdicts were already recorded as rejected by `classify`
        classified.into_read().inspect_err(|e| {
            if classification != Classification::Unsafe {
                self.record(self.audit.log_rejected(session_id, &script, classification, e));
            }
        })
    }

    /// `ClassifiedScript::into_approved` with the decision recorded.
    pub fn authorize_write(&self, classified: ClassifiedScript, approved: bool) -> GateResult<RunnableScript> {
        let session_id = self.session_id();
        let classification = classified.classification();
        let script = classified.script.clone();

        if classification != Classification::Unsafe {
            self.record(self.audit.log_approval(session_id, &script, classification, approved));
        }

        classified.into_approved(approved)
    }

    pub fn execute(&self, runnable: RunnableScript) -> GateResult<ExecutionResult> {
        self.execute_with_cancel(runnable, &CancelHandle::new())
    }

    /// Runs in the sandbox root with the phase's timeout. Execution failures
    /// come back as a failed `ExecutionResult`; only an oversized output is
    /// an error.
    pub fn execute_with_cancel(&self, runnable: RunnableScript, cancel: &CancelHandle) -> GateResult<ExecutionResult> {
        let timeout = match runnable.phase {
            Phase::Read => self.timeouts.read,
            Phase::Write => self.timeouts.write,
        };

        let result = self
            .executor
            .execute_with_cancel(&runnable.script, timeout, &self.root, cancel);

        self.record(
            self.audit
                .log_execution(self.session_id(), &runnable.script, runnable.classification, &result),
        );

        let checked = self
            .output_guard
            .check(&result.stdout)
            .and_then(|()| self.output_guard.check(&result.stderr));

        if let Err(e) = checked {
            self.record(self.audit.log_output_rejected(self.session_id(), &runnable.script, &e));
            return Err(e);
        }

        Ok(result)
    }

    // Audit failures never change a gate decision; they are surfaced in logs.
    fn record(&self, outcome: GateResult<()>) {
        if let Err(e) = outcome {
            warn!(session_id = %self.session_id(), error = %e, "Failed to write audit event");
        }
    }
}
