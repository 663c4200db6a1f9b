use tracing::debug;

use super::extract::{ExtractedPath, PathExtractor};
use super::path::{ResolveError, ScriptPath};
use super::SandboxRoot;

#[derive(Debug, Clone)]
pub struct ContainmentChecker {
    root: SandboxRoot,
    extractor: PathExtractor,
}

impl ContainmentChecker {
    pub fn new(root: SandboxRoot) -> Self {
        Self {
            root,
            extractor: PathExtractor::new(),
        }
    }

    pub fn root(&self) -> &SandboxRoot {
        &self.root
    }

    /// True when every path referenced by `script` resolves inside the
    /// sandbox root. A script without any recognisable path passes.
    pub fn all_contained(&self, script: &str) -> bool {
        self.extractor
            .extract(script)
            .iter()
            .all(|path| self.is_contained(path))
    }

    pub fn is_contained(&self, path: &ExtractedPath) -> bool {
        match self.resolve(&path.text) {
            Ok(resolved) => {
                let inside = resolved.starts_with(self.root.canonical());
                debug!(path = %path.text, form = ?path.form, inside, "Checked path containment");
                inside
            }
            Err(e) => {
                debug!(path = %path.text, error = %e, "Path failed to resolve");
                false
            }
        }
    }

    fn resolve(&self, text: &str) -> Result<ScriptPath, ResolveError> {
        // Any leading double separator is a share or a verbatim/device path
        if has_unc_prefix(text) {
            return Err(ResolveError::InvalidSegment(text.to_string()));
        }

        let parsed = ScriptPath::parse(text)?;
        if parsed.is_unc() {
            return Err(ResolveError::InvalidSegment(text.to_string()));
        }

        if parsed.is_relative() {
            self.root.canonical().join(&parsed)?.resolve()
        } else {
            parsed.resolve()
        }
    }
}

fn has_unc_prefix(text: &str) -> bool {
    let mut chars = text.trim_start().chars();
    matches!((chars.next(), chars.next()), (Some('\\' | '/'), Some('\\' | '/')))
}

pub fn all_paths_in_sandbox(script: &str, root: &SandboxRoot) -> bool {
    ContainmentChecker::new(root.clone()).all_contained(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checker(root: &str) -> ContainmentChecker {
        ContainmentChecker::new(SandboxRoot::new(root).unwrap())
    }

    #[test]
    fn test_valid_absolute_path_in_sandbox() {
        let checker = checker(r"C:\Users\test");
        assert!(checker.all_contained(r#"Get-ChildItem "C:\Users\test\Downloads""#));
    }

    #[test]
    fn test_invalid_absolute_path_outside_sandbox() {
        let checker = checker(r"C:\Users\test");
        assert!(!checker.all_contained(r#"Get-ChildItem "C:\Windows\System32""#));
    }

    #[test]
    fn test_sibling_directory_is_outside() {
        let checker = checker(r"C:\Users");
        assert!(!checker.all_contained(r#"Get-ChildItem "C:\Usersx\secret""#));
    }

    #[test]
    fn test_valid_relative_path() {
        let checker = checker(r"C:\Users\test");
        assert!(checker.all_contained(r#"Get-ChildItem ".\Downloads""#));
    }

    #[test]
    fn test_unc_path_rejected() {
        let checker = checker(r"C:\Users\test");
        assert!(!checker.all_contained(r#"Get-ChildItem "\\server\share""#));
    }

    #[test]
    fn test_verbatim_paths_rejected() {
        let checker = checker(r"C:\Users\test");
        assert!(!checker.all_contained(r#"Get-ChildItem "\\?\C:\Users\test\Downloads""#));
        assert!(!checker.all_contained(r#"Get-ChildItem "\\.\C:\Users\test""#));
    }

    #[test]
    fn test_no_paths_in_script() {
        let checker = checker(r"C:\Users\test");
        assert!(checker.all_contained(r#"Write-Output "Hello World""#));
        assert!(checker.all_contained(""));
    }

    #[test]
    fn test_parent_directory_escape_attempt() {
        let checker = checker(r"C:\Users\test\subfolder");
        assert!(!checker.all_contained(r#"Get-ChildItem "..\..\..\Windows""#));
        assert!(!checker.all_contained(r#"Get-ChildItem "C:\Users\test\subfolder\..\..\x""#));
    }

    #[test]
    fn test_unresolvable_path_fails_closed() {
        let checker = checker(r"C:\Users\test");
        assert!(!checker.all_contained(r#"Get-Item "C:\Users\test\bad|name""#));
    }

    #[test]
    fn test_one_escaping_path_fails_the_script() {
        let checker = checker(r"C:\Users\test");
        let script = r#"Copy-Item "C:\Users\test\a.txt" "C:\Temp\a.txt""#;
        assert!(!checker.all_contained(script));
    }

    #[test]
    fn test_host_sandbox_with_real_directories() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("docs")).unwrap();

        let root = SandboxRoot::new(temp_dir.path()).unwrap();
        let checker = ContainmentChecker::new(root.clone());

        let inside = format!(r#"Get-ChildItem "{}""#, root.path().join("docs").display());
        assert!(checker.all_contained(&inside));
        assert!(checker.all_contained(r#"Get-ChildItem ".\docs\new.txt""#));
        assert!(!checker.all_contained(r#"Get-ChildItem "..\..\..\..\..\..\..\..""#));
    }

    #[cfg(unix)]
    #[test]
    fn test_posix_absolute_outside_sandbox() {
        let temp_dir = TempDir::new().unwrap();
        let root = SandboxRoot::new(temp_dir.path()).unwrap();

        assert!(!all_paths_in_sandbox(r#"Get-Content "/etc/passwd""#, &root));
        assert!(!all_paths_in_sandbox(r#"Get-ChildItem "C:\Windows""#, &root));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let sandbox = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.path().join("escape")).unwrap();

        let root = SandboxRoot::new(sandbox.path()).unwrap();
        assert!(!all_paths_in_sandbox(r#"Get-Content ".\escape\data.txt""#, &root));
    }
}
