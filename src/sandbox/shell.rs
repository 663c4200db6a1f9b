use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::process::{BoundedCommand, CancelHandle, ProcessExit};
use super::SandboxRoot;
use crate::gateway::{ExecutionOutcome, ExecutionResult, GateError, GateResult};

pub const DEFAULT_SYNTAX_TIMEOUT: Duration = Duration::from_secs(5);

// Reads the candidate from stdin and parses it without running anything.
const PARSE_PROGRAM: &str = r#"[Console]::InputEncoding = [System.Text.Encoding]::UTF8
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8
$source = [Console]::In.ReadToEnd()
$tokens = $null
$errors = $null
[void][System.Management.Automation.Language.Parser]::ParseInput($source, [ref]$tokens, [ref]$errors)
if ($errors.Count -gt 0) {
    foreach ($e in $errors) {
        [Console]::Out.WriteLine("line $($e.Extent.StartLineNumber): $($e.Message)")
    }
    exit 1
}
exit 0"#;

// Prepended to every executed script so nothing can block on a prompt.
const EXECUTION_PREAMBLE: &str = r#"$ConfirmPreference = 'None'
$ProgressPreference = 'SilentlyContinue'
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8
$OutputEncoding = [System.Text.Encoding]::UTF8
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Runtime {
    /// `powershell.exe`, Windows PowerShell 5.1.
    WindowsPowerShell,
    /// `pwsh`, PowerShell 7+ on any platform.
    Pwsh,
}

impl Default for Runtime {
    fn default() -> Self {
        if cfg!(windows) {
            Runtime::WindowsPowerShell
        } else {
            Runtime::Pwsh
        }
    }
}

impl Runtime {
    pub fn program(&self) -> &'static str {
        match self {
            Runtime::WindowsPowerShell => "powershell",
            Runtime::Pwsh => "pwsh",
        }
    }
}

/// How to start the PowerShell runtime non-interactively.
#[derive(Debug, Clone, Default)]
pub struct ScriptHost {
    runtime: Runtime,
    program: Option<PathBuf>,
}

impl ScriptHost {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime, program: None }
    }

    /// Use an explicit binary instead of looking `runtime` up on PATH.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn program(&self) -> OsString {
        match &self.program {
            Some(program) => program.clone().into_os_string(),
            None => OsString::from(self.runtime.program()),
        }
    }

    pub fn program_name(&self) -> String {
        self.program().to_string_lossy().into_owned()
    }

    /// Profile-free, prompt-free, policy-bypassing invocation of `script`.
    pub fn command(&self, script: &str, timeout: Duration) -> BoundedCommand {
        BoundedCommand::new(self.program(), timeout).args([
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-EncodedCommand".to_string(),
            encode_command(script),
        ])
    }

    pub fn is_available(&self) -> bool {
        matches!(
            self.command("exit 0", Duration::from_secs(15)).run(&CancelHandle::new()),
            Ok(output) if output.exit == ProcessExit::Exited(Some(0))
        )
    }
}

/// Base64 of the UTF-16LE script text, the form `-EncodedCommand` expects.
pub fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// Dry-run parse through the runtime's own parser.
#[derive(Debug, Clone)]
pub struct SyntaxValidator {
    host: ScriptHost,
    timeout: Duration,
}

impl SyntaxValidator {
    pub fn new(host: ScriptHost, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate(&self, script: &str) -> GateResult<()> {
        self.validate_with_cancel(script, &CancelHandle::new())
    }

    pub fn validate_with_cancel(&self, script: &str, cancel: &CancelHandle) -> GateResult<()> {
        let command = self.host.command(PARSE_PROGRAM, self.timeout).stdin(script.as_bytes());

        let output = command.run(cancel).map_err(|e| spawn_error(&self.host, e))?;

        match output.exit {
            ProcessExit::Exited(Some(0)) => {
                debug!("Script parsed without errors");
                Ok(())
            }
            ProcessExit::Exited(_) => {
                let diagnostics = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ");

                let message = if !diagnostics.is_empty() {
                    diagnostics
                } else if !output.stderr.trim().is_empty() {
                    output.stderr.trim().to_string()
                } else {
                    "Syntax validation failed".to_string()
                };

                debug!(%message, "Script failed to parse");
                Err(GateError::SyntaxInvalid(message))
            }
            ProcessExit::TimedOut => Err(GateError::SyntaxInvalid("Syntax validation timed out".to_string())),
            ProcessExit::Cancelled => Err(GateError::Cancelled),
        }
    }
}

pub fn validate_syntax(script: &str) -> GateResult<()> {
    SyntaxValidator::new(ScriptHost::default(), DEFAULT_SYNTAX_TIMEOUT).validate(script)
}

/// Runs scripts as bounded child processes inside a sandbox root. Every
/// failure comes back as an `ExecutionResult`, never as an error.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    session_id: String,
    host: ScriptHost,
    validator: SyntaxValidator,
    capture_limit: Option<usize>,
}

impl ScriptExecutor {
    pub fn new(host: ScriptHost, syntax_timeout: Duration) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            validator: SyntaxValidator::new(host.clone(), syntax_timeout),
            host,
            capture_limit: None,
        }
    }

    /// Caps how many bytes of each output stream are kept in memory.
    pub fn with_capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = Some(bytes);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn host(&self) -> &ScriptHost {
        &self.host
    }

    pub fn syntax_validator(&self) -> &SyntaxValidator {
        &self.validator
    }

    pub fn execute(&self, script: &str, timeout: Duration, cwd: &SandboxRoot) -> ExecutionResult {
        self.execute_with_cancel(script, timeout, cwd, &CancelHandle::new())
    }

    pub fn execute_with_cancel(
        &self,
        script: &str,
        timeout: Duration,
        cwd: &SandboxRoot,
        cancel: &CancelHandle,
    ) -> ExecutionResult {
        let start_time = Instant::now();
        let elapsed_ms = || start_time.elapsed().as_millis() as u64;

        // Callers are expected to have validated already; checked again here
        if let Err(e) = self.validator.validate_with_cancel(script, cancel) {
            let outcome = match e {
                GateError::RuntimeUnavailable(_) => ExecutionOutcome::RuntimeUnavailable,
                GateError::PermissionDenied(_) => ExecutionOutcome::PermissionDenied,
                GateError::Cancelled => ExecutionOutcome::Cancelled,
                _ => ExecutionOutcome::SyntaxRejected,
            };
            warn!(session_id = %self.session_id, error = %e, "Refusing to execute script");
            return ExecutionResult::failure(outcome, &e, elapsed_ms());
        }

        if !cwd.exists_on_host() {
            let error = GateError::ExecutionFailed(format!("working directory {} does not exist", cwd));
            return ExecutionResult::failure(ExecutionOutcome::Failed, &error, elapsed_ms());
        }

        let program = format!("{}{}", EXECUTION_PREAMBLE, script);
        let mut command = self.host.command(&program, timeout).current_dir(cwd.path());
        if let Some(limit) = self.capture_limit {
            command = command.capture_limit(limit);
        }

        info!(
            session_id = %self.session_id,
            runtime = %self.host.program_name(),
            timeout_secs = timeout.as_secs(),
            "Executing script"
        );

        let output = match command.run(cancel) {
            Ok(output) => output,
            Err(e) => {
                let error = spawn_error(&self.host, e);
                let outcome = match error {
                    GateError::RuntimeUnavailable(_) => ExecutionOutcome::RuntimeUnavailable,
                    GateError::PermissionDenied(_) => ExecutionOutcome::PermissionDenied,
                    _ => ExecutionOutcome::Failed,
                };
                warn!(session_id = %self.session_id, error = %error, "Failed to start script");
                return ExecutionResult::failure(outcome, &error, elapsed_ms());
            }
        };

        let execution_time_ms = output.elapsed.as_millis() as u64;
        match output.exit {
            ProcessExit::Exited(exit_code) => {
                // Cut-off output stays untrimmed so it still reads as oversized
                let (stdout, stderr) = if output.truncated {
                    (output.stdout, output.stderr)
                } else {
                    (output.stdout.trim().to_string(), output.stderr.trim().to_string())
                };
                let result = ExecutionResult::completed(exit_code, stdout, stderr, execution_time_ms);
                info!(
                    session_id = %self.session_id,
                    exit_code = ?exit_code,
                    execution_time_ms,
                    "Script finished"
                );
                result
            }
            ProcessExit::TimedOut => ExecutionResult::failure(
                ExecutionOutcome::TimedOut,
                &GateError::ExecutionTimeout(timeout.as_secs()),
                execution_time_ms,
            ),
            ProcessExit::Cancelled => {
                ExecutionResult::failure(ExecutionOutcome::Cancelled, &GateError::Cancelled, execution_time_ms)
            }
        }
    }
}

/// One-shot execution with the platform's default runtime.
pub fn execute(script: &str, timeout: Duration, cwd: &SandboxRoot) -> ExecutionResult {
    ScriptExecutor::new(ScriptHost::default(), DEFAULT_SYNTAX_TIMEOUT).execute(script, timeout, cwd)
}

fn spawn_error(host: &ScriptHost, error: io::Error) -> GateError {
    match error.kind() {
        io::ErrorKind::NotFound => GateError::RuntimeUnavailable(host.program_name()),
        io::ErrorKind::PermissionDenied => GateError::PermissionDenied(host.program_name()),
        _ => GateError::ExecutionFailed(format!("failed to start {}: {}", host.program_name(), error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::check_output_size;
    use tempfile::TempDir;

    const MISSING_RUNTIME: &str = "scriptgate-missing-powershell";

    fn available_host() -> Option<ScriptHost> {
        let host = ScriptHost::default();
        host.is_available().then_some(host)
    }

    #[test]
    fn test_runtime_default_matches_platform() {
        let runtime = Runtime::default();
        if cfg!(windows) {
            assert_eq!(runtime.program(), "powershell");
        } else {
            assert_eq!(runtime.program(), "pwsh");
        }
    }

    #[test]
    fn test_encode_command_is_utf16le_base64() {
        assert_eq!(encode_command("dir"), "ZABpAHIA");
        assert_eq!(encode_command(""), "");
    }

    #[test]
    fn test_program_override() {
        let host = ScriptHost::new(Runtime::Pwsh).with_program("/opt/microsoft/powershell/7/pwsh");
        assert_eq!(host.program_name(), "/opt/microsoft/powershell/7/pwsh");
        assert_eq!(host.runtime(), Runtime::Pwsh);
    }

    #[test]
    fn test_missing_runtime_in_validation() {
        let host = ScriptHost::default().with_program(MISSING_RUNTIME);
        let err = SyntaxValidator::new(host, DEFAULT_SYNTAX_TIMEOUT)
            .validate("Get-ChildItem")
            .unwrap_err();
        assert_eq!(err, GateError::RuntimeUnavailable(MISSING_RUNTIME.to_string()));
    }

    #[test]
    fn test_missing_runtime_in_execution() {
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let executor = ScriptExecutor::new(
            ScriptHost::default().with_program(MISSING_RUNTIME),
            DEFAULT_SYNTAX_TIMEOUT,
        );

        let result = executor.execute("Get-ChildItem", Duration::from_secs(5), &root);
        assert!(!result.success);
        assert_eq!(result.outcome, ExecutionOutcome::RuntimeUnavailable);
        assert!(result.stderr.contains("not available"));
    }

    // Accepts every syntax check (script on stdin); otherwise sleeps past
    // any short deadline.
    #[cfg(unix)]
    const SLEEPING_RUNTIME: &str = "#!/bin/sh\ninput=$(cat)\nif [ -n \"$input\" ]; then exit 0; fi\nsleep 10\n";

    #[cfg(unix)]
    fn write_runtime(dir: &TempDir, body: &str, mode: u32) -> ScriptHost {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.path().join("fake-pwsh");
        std::fs::write(&program, body).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(mode)).unwrap();
        ScriptHost::default().with_program(program)
    }

    #[cfg(unix)]
    #[test]
    fn test_execution_timeout_is_structured() {
        let bin = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let executor = ScriptExecutor::new(write_runtime(&bin, SLEEPING_RUNTIME, 0o755), Duration::from_secs(5));

        let started = Instant::now();
        let result = executor.execute("Start-Sleep -Seconds 30", Duration::from_secs(1), &root);
        assert!(started.elapsed() < Duration::from_secs(8));
        assert!(!result.success);
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert!(result.stderr.contains("timed out after 1 seconds"), "stderr: {}", result.stderr);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_runtime_is_permission_denied() {
        let bin = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let host = write_runtime(&bin, SLEEPING_RUNTIME, 0o644);
        let program = host.program_name();
        let executor = ScriptExecutor::new(host, Duration::from_secs(5));

        let result = executor.execute("Get-ChildItem", Duration::from_secs(5), &root);
        assert!(!result.success);
        assert_eq!(result.outcome, ExecutionOutcome::PermissionDenied);
        assert!(result.stderr.contains(&program), "stderr: {}", result.stderr);

        let err = executor.syntax_validator().validate("Get-ChildItem").unwrap_err();
        assert_eq!(err, GateError::PermissionDenied(program));
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_limit_bounds_large_output() {
        let bin = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let runtime = "#!/bin/sh\ninput=$(cat)\nif [ -n \"$input\" ]; then exit 0; fi\nhead -c 5000000 /dev/zero | tr '\\0' ' '\n";
        let executor = ScriptExecutor::new(write_runtime(&bin, runtime, 0o755), Duration::from_secs(5))
            .with_capture_limit(101);

        let result = executor.execute("Get-ChildItem", Duration::from_secs(10), &root);
        assert!(result.success, "stderr: {}", result.stderr);
        // Whitespace is not trimmed away from a cut-off stream
        assert_eq!(result.stdout.len(), 101);
        assert!(check_output_size(&result.stdout, 100).is_err());
    }

    #[test]
    fn test_executor_session_ids_are_unique() {
        let a = ScriptExecutor::new(ScriptHost::default(), DEFAULT_SYNTAX_TIMEOUT);
        let b = ScriptExecutor::new(ScriptHost::default(), DEFAULT_SYNTAX_TIMEOUT);
        assert_ne!(a.session_id(), b.session_id());
        assert!(Uuid::parse_str(a.session_id()).is_ok());
    }

    #[test]
    fn test_syntax_validation_with_runtime() {
        let Some(host) = available_host() else { return };
        let validator = SyntaxValidator::new(host, Duration::from_secs(30));

        assert!(validator.validate("Get-ChildItem -Path . | Select-Object Name").is_ok());
        assert!(validator.validate("").is_ok());

        let err = validator.validate("Get-ChildItem {").unwrap_err();
        assert!(matches!(err, GateError::SyntaxInvalid(_)));
        assert!(err.to_string().starts_with("PowerShell syntax error:"));
    }

    #[test]
    fn test_invalid_script_is_never_run() {
        let Some(host) = available_host() else { return };
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let executor = ScriptExecutor::new(host, Duration::from_secs(30));

        let result = executor.execute("New-Item -Path ./marker.txt; if (", Duration::from_secs(30), &root);
        assert_eq!(result.outcome, ExecutionOutcome::SyntaxRejected);
        assert!(!temp_dir.path().join("marker.txt").exists());
    }

    #[test]
    fn test_execution_with_runtime() {
        let Some(host) = available_host() else { return };
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let executor = ScriptExecutor::new(host, Duration::from_secs(30));

        let result = executor.execute(
            "Get-ChildItem | Select-Object -ExpandProperty Name",
            Duration::from_secs(60),
            &root,
        );
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "notes.txt");

        let failed = executor.execute("exit 3", Duration::from_secs(60), &root);
        assert!(!failed.success);
        assert_eq!(failed.outcome, ExecutionOutcome::Completed { exit_code: Some(3) });
    }

    #[test]
    fn test_execution_timeout_with_runtime() {
        let Some(host) = available_host() else { return };
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let executor = ScriptExecutor::new(host, Duration::from_secs(30));

        let result = executor.execute("Start-Sleep -Seconds 30", Duration::from_secs(2), &root);
        assert!(!result.success);
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert!(result.stderr.contains("timed out after 2 seconds"));
    }
}
