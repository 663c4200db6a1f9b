pub mod classifier;
pub mod extract;
pub mod output;
pub mod path;
pub mod process;
pub mod shell;
pub mod validator;

pub use classifier::*;
pub use extract::*;
pub use output::*;
pub use path::{Anchor, ResolveError, ScriptPath};
pub use process::{BoundedCommand, CancelHandle, ProcessExit, ProcessOutput};
pub use shell::*;
pub use validator::*;

use std::path::{Path, PathBuf};

use crate::gateway::{GateError, GateResult};

/// The directory every script-driven operation must stay under. Canonical
/// from construction on and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    path: PathBuf,
    canonical: ScriptPath,
}

impl SandboxRoot {
    pub fn new<P: AsRef<Path>>(root: P) -> GateResult<Self> {
        let root = root.as_ref();
        let text = root.to_string_lossy();

        let mut parsed = ScriptPath::parse(&text)
            .map_err(|e| GateError::InvalidPath(format!("{}: {}", text, e)))?;

        if parsed.is_relative() {
            let absolute = std::fs::canonicalize(root)
                .map_err(|e| GateError::InvalidPath(format!("{}: {}", text, e)))?;
            parsed = ScriptPath::from_host(&absolute)
                .map_err(|e| GateError::InvalidPath(format!("{}: {}", text, e)))?;
        }

        if parsed.is_unc() {
            return Err(GateError::InvalidPath(format!(
                "{}: network shares cannot be a sandbox root",
                text
            )));
        }

        let canonical = parsed
            .resolve()
            .map_err(|e| GateError::InvalidPath(format!("{}: {}", text, e)))?;

        Ok(Self {
            path: canonical.to_path_buf(),
            canonical,
        })
    }

    /// Canonical root as a host path, used as the child's working directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn canonical(&self) -> &ScriptPath {
        &self.canonical
    }

    pub fn exists_on_host(&self) -> bool {
        self.path.is_dir()
    }
}

impl std::fmt::Display for SandboxRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_windows_root_is_normalized() {
        let root = SandboxRoot::new(r"C:\Users\test\.\sub\..").unwrap();
        assert_eq!(root.to_string(), r"C:\Users\test");
    }

    #[test]
    fn test_host_root_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();

        assert_eq!(root.path(), temp_dir.path().canonicalize().unwrap());
        assert!(root.exists_on_host());
    }

    #[test]
    fn test_unc_root_rejected() {
        let err = SandboxRoot::new(r"\\server\share\data").unwrap_err();
        assert!(matches!(err, GateError::InvalidPath(_)));
    }

    #[test]
    fn test_missing_relative_root_rejected() {
        assert!(SandboxRoot::new("definitely-not-a-directory-here").is_err());
    }

    #[test]
    fn test_empty_root_rejected() {
        assert!(SandboxRoot::new("").is_err());
    }
}
