use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use crate::config::AuditSettings;
use crate::gateway::{Classification, ExecutionResult, GateError, GateResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub session_id: String,
    /// SHA-256 of the script text; the script itself is never logged.
    pub script_digest: Option<String>,
    pub classification: Option<Classification>,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    ScriptValidated,
    SyntaxRejected,
    ScriptClassified,
    ScriptRejected,
    ApprovalGranted,
    ApprovalDenied,
    ExecutionCompleted,
    ExecutionFailed,
    OutputRejected,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, session_id: &str, script: Option<&str>, details: impl Into<String>) -> Self {
        Self {
            event_type,
            session_id: session_id.to_string(),
            script_digest: script.map(script_digest),
            classification: None,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }
}

pub fn script_digest(script: &str) -> String {
    hex::encode(Sha256::digest(script.as_bytes()))
}

#[derive(Debug)]
pub struct AuditLogger {
    log_file: Option<PathBuf>,
    enabled: bool,
    file_mutex: Mutex<()>,
}

impl AuditLogger {
    pub fn new(settings: &AuditSettings) -> GateResult<Self> {
        Ok(Self {
            log_file: settings.log_file.clone(),
            enabled: settings.enable_logging,
            file_mutex: Mutex::new(()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            log_file: None,
            enabled: false,
            file_mutex: Mutex::new(()),
        }
    }

    pub fn log_event(&self, event: AuditEvent) -> GateResult<()> {
        if !self.enabled {
            return Ok(());
        }

        debug!("Audit event: {:?}", event);

        if let Some(ref log_file) = self.log_file {
            self.log_to_file(log_file, &event)?;
        }

        match event.event_type {
            AuditEventType::ScriptRejected
            | AuditEventType::SyntaxRejected
            | AuditEventType::ExecutionFailed
            | AuditEventType::OutputRejected => {
                tracing::warn!(
                    event_type = ?event.event_type,
                    session_id = %event.session_id,
                    script_digest = ?event.script_digest,
                    classification = ?event.classification,
                    details = %event.details,
                    "Gateway event"
                );
            }
            _ => {
                tracing::info!(
                    event_type = ?event.event_type,
                    session_id = %event.session_id,
                    classification = ?event.classification,
                    "Gateway event"
                );
            }
        }

        Ok(())
    }

    fn log_to_file(&self, log_file: &PathBuf, event: &AuditEvent) -> GateResult<()> {
        let _guard = self
            .file_mutex
            .lock()
            .map_err(|_| GateError::Audit("audit log lock poisoned".to_string()))?;

        let log_entry = serde_json::to_string(event)
            .map_err(|e| GateError::Audit(format!("Failed to serialize event: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| GateError::Audit(format!("Failed to open log file: {}", e)))?;

        writeln!(file, "{}", log_entry)
            .map_err(|e| GateError::Audit(format!("Failed to write to log file: {}", e)))?;

        file.flush()
            .map_err(|e| GateError::Audit(format!("Failed to flush log file: {}", e)))?;

        Ok(())
    }

    pub fn log_validated(&self, session_id: &str, script: &str) -> GateResult<()> {
        self.log_event(AuditEvent::new(
            AuditEventType::ScriptValidated,
            session_id,
            Some(script),
            "Syntax check passed",
        ))
    }

    pub fn log_syntax_rejected(&self, session_id: &str, script: &str, error: &GateError) -> GateResult<()> {
        self.log_event(AuditEvent::new(
            AuditEventType::SyntaxRejected,
            session_id,
            Some(script),
            error.to_string(),
        ))
    }

    /// `rule` names what decided the verdict, never a path from the script.
    pub fn log_classified(
        &self,
        session_id: &str,
        script: &str,
        classification: Classification,
        rule: &str,
    ) -> GateResult<()> {
        let event_type = if classification == Classification::Unsafe {
            AuditEventType::ScriptRejected
        } else {
            AuditEventType::ScriptClassified
        };

        self.log_event(
            AuditEvent::new(event_type, session_id, Some(script), rule).with_classification(classification),
        )
    }

    pub fn log_rejected(
        &self,
        session_id: &str,
        script: &str,
        classification: Classification,
        error: &GateError,
    ) -> GateResult<()> {
        self.log_event(
            AuditEvent::new(AuditEventType::ScriptRejected, session_id, Some(script), error.to_string())
                .with_classification(classification),
        )
    }

    pub fn log_approval(
        &self,
        session_id: &str,
        script: &str,
        classification: Classification,
        granted: bool,
    ) -> GateResult<()> {
        let (event_type, details) = if granted {
            (AuditEventType::ApprovalGranted, "Operator approved execution")
        } else {
            (AuditEventType::ApprovalDenied, "Operator declined execution")
        };

        self.log_event(
            AuditEvent::new(event_type, session_id, Some(script), details).with_classification(classification),
        )
    }

    pub fn log_execution(
        &self,
        session_id: &str,
        script: &str,
        classification: Classification,
        result: &ExecutionResult,
    ) -> GateResult<()> {
        let event_type = if result.success {
            AuditEventType::ExecutionCompleted
        } else {
            AuditEventType::ExecutionFailed
        };

        let details = format!("{:?} in {}ms", result.outcome, result.execution_time_ms);
        self.log_event(
            AuditEvent::new(event_type, session_id, Some(script), details).with_classification(classification),
        )
    }

    pub fn log_output_rejected(&self, session_id: &str, script: &str, error: &GateError) -> GateResult<()> {
        self.log_event(AuditEvent::new(
            AuditEventType::OutputRejected,
            session_id,
            Some(script),
            error.to_string(),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ExecutionOutcome;
    use tempfile::NamedTempFile;

    fn logger_with_file(temp_file: &NamedTempFile) -> AuditLogger {
        AuditLogger::new(&AuditSettings {
            enable_logging: true,
            log_file: Some(temp_file.path().to_path_buf()),
        })
        .unwrap()
    }

    #[test]
    fn test_audit_logger() {
        let temp_file = NamedTempFile::new().unwrap();
        let logger = logger_with_file(&temp_file);
        assert!(logger.is_enabled());

        let script = r#"Get-ChildItem "C:\Users\test\secret-plans""#;
        logger.log_validated("session-123", script).unwrap();
        logger
            .log_classified("session-123", script, Classification::Read, "read-only")
            .unwrap();
        logger
            .log_approval("session-123", script, Classification::Write, false)
            .unwrap();

        let result = ExecutionResult::completed(Some(0), "ok".to_string(), String::new(), 12);
        logger
            .log_execution("session-123", script, Classification::Read, &result)
            .unwrap();

        let log_content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(log_content.contains("ScriptValidated"));
        assert!(log_content.contains("ScriptClassified"));
        assert!(log_content.contains("ApprovalDenied"));
        assert!(log_content.contains("ExecutionCompleted"));
        assert!(log_content.contains("session-123"));
        assert!(log_content.contains(&script_digest(script)));
        assert!(!log_content.contains("secret-plans"));
    }

    #[test]
    fn test_log_lines_are_json() {
        let temp_file = NamedTempFile::new().unwrap();
        let logger = logger_with_file(&temp_file);

        logger
            .log_classified("s", "Invoke-Expression 'x'", Classification::Unsafe, "dynamic evaluation")
            .unwrap();
        let failed = ExecutionResult::failure(ExecutionOutcome::TimedOut, &GateError::ExecutionTimeout(60), 60_000);
        logger
            .log_execution("s", "Start-Sleep 100", Classification::Read, &failed)
            .unwrap();

        let events: Vec<AuditEvent> = std::fs::read_to_string(temp_file.path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::ScriptRejected);
        assert_eq!(events[0].classification, Some(Classification::Unsafe));
        assert_eq!(events[1].event_type, AuditEventType::ExecutionFailed);
        assert!(events[1].details.contains("TimedOut"));
    }

    #[test]
    fn test_script_digest() {
        assert_eq!(
            script_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(script_digest("a"), script_digest("b"));
    }

    #[test]
    fn test_disabled_audit_logger() {
        let logger = AuditLogger::new(&AuditSettings {
            enable_logging: false,
            log_file: None,
        })
        .unwrap();
        assert!(!logger.is_enabled());

        // Should not fail even when disabled
        logger.log_validated("session", "Get-Date").unwrap();
        assert!(!AuditLogger::disabled().is_enabled());
    }

    #[test]
    fn test_unwritable_log_file_is_audit_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let logger = AuditLogger::new(&AuditSettings {
            enable_logging: true,
            log_file: Some(temp_dir.path().join("missing").join("audit.jsonl")),
        })
        .unwrap();

        let err = logger.log_validated("session", "Get-Date").unwrap_err();
        assert!(matches!(err, GateError::Audit(_)));
    }
}
