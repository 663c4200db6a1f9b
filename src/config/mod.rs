pub mod timeouts;

pub use timeouts::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::gateway::{GateError, GateResult};
use crate::sandbox::{OutputSizeGuard, Runtime, SandboxRoot, ScriptHost, DEFAULT_MAX_OUTPUT_SIZE};

const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_SYNTAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Falls back to the current directory when unset.
    pub root: Option<PathBuf>,
    pub runtime: Runtime,
    /// Explicit runtime binary, otherwise looked up on PATH.
    pub program: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub syntax_timeout_secs: u64,
    pub max_output_size: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            syntax_timeout_secs: DEFAULT_SYNTAX_TIMEOUT_SECS,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enable_logging: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enable_logging: true,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Regenerations allowed after a syntax error, per script.
    pub syntax_retries: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self { syntax_retries: 2 }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| GateError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> GateResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| GateError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| GateError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn load_or_create_default<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load_from_file(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GateError::Config(format!("Failed to create config directory: {}", e)))?;
            }

            config.save_to_file(path)?;
            Ok(config)
        }
    }

    /// `<config dir>/scriptgate/config.toml`, e.g. `%APPDATA%\scriptgate` or
    /// `~/.config/scriptgate`.
    pub fn default_config_path() -> GateResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| GateError::Config("Could not determine the user config directory".to_string()))?;

        Ok(config_dir.join("scriptgate").join("config.toml"))
    }

    pub fn validate(&self) -> GateResult<()> {
        let execution = &self.execution;

        for (name, value) in [
            ("read_timeout_secs", execution.read_timeout_secs),
            ("write_timeout_secs", execution.write_timeout_secs),
            ("syntax_timeout_secs", execution.syntax_timeout_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(GateError::Config(format!(
                    "{} must be between 1 and {} seconds",
                    name, MAX_TIMEOUT_SECS
                )));
            }
        }

        if execution.max_output_size == 0 {
            return Err(GateError::Config("max_output_size must be greater than 0".to_string()));
        }

        if self.workflow.syntax_retries > MAX_SYNTAX_RETRIES {
            return Err(GateError::Config(format!(
                "syntax_retries must be at most {}",
                MAX_SYNTAX_RETRIES
            )));
        }

        if self.audit.enable_logging {
            if let Some(parent) = self.audit.log_file.as_ref().and_then(|f| f.parent()) {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    return Err(GateError::Config(format!(
                        "Audit log directory does not exist: {}",
                        parent.display()
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_settings(&self.execution)
    }

    pub fn output_guard(&self) -> OutputSizeGuard {
        OutputSizeGuard::new(self.execution.max_output_size)
    }

    pub fn script_host(&self) -> ScriptHost {
        let host = ScriptHost::new(self.sandbox.runtime);
        match &self.sandbox.program {
            Some(program) => host.with_program(program),
            None => host,
        }
    }

    /// The sandbox root: `override_root`, then `sandbox.root`, then the
    /// current directory.
    pub fn sandbox_root(&self, override_root: Option<&Path>) -> GateResult<SandboxRoot> {
        match override_root.or(self.sandbox.root.as_deref()) {
            Some(root) => SandboxRoot::new(root),
            None => {
                let cwd = std::env::current_dir()
                    .map_err(|e| GateError::Config(format!("Failed to read current directory: {}", e)))?;
                SandboxRoot::new(cwd)
            }
        }
    }
}
