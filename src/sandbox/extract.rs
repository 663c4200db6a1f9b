use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Which pattern family first found a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathForm {
    QuotedAbsolute,
    NamedParameter,
    VariableAssignment,
    Unc,
    Relative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPath {
    pub text: String,
    pub form: PathForm,
}

// Drive-letter root, or a POSIX root followed by a real name (a bare "/" is
// usually a split/replace argument, not a path).
const ABSOLUTE: &str = r#"(?:[A-Za-z]:[\\/]|/[^/"'\s])"#;

static QUOTED_ABSOLUTE: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(&format!(r#"["']({}[^"']*)["']"#, ABSOLUTE)));

static NAMED_PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(&format!(
        r#"(?i)-(?:Path|LiteralPath|Destination|FilePath|Source|Target)\s+["']?({}[^\s"']*)["']?"#,
        ABSOLUTE
    ))
});

static VARIABLE_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(&format!(r#"\$\w+\s*=\s*["']({}[^"']*)["']"#, ABSOLUTE)));

static UNC: LazyLock<Regex> = LazyLock::new(|| compile_regex(r#"["']?(\\\\[^\s"']+)["']?"#));

static RELATIVE: LazyLock<Regex> = LazyLock::new(|| compile_regex(r#"["']?(\.{1,2}[\\/][^\s"']*)["']?"#));

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Patterns are constants; covered by test_patterns_compile
        Err(err) => panic!("invalid regex pattern `{}`: {}", pattern, err),
    }
}

/// Best-effort static scan for path literals. Paths built by concatenation,
/// encoding or variable indirection are not found.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathExtractor;

impl PathExtractor {
    pub fn new() -> Self {
        Self
    }

    /// All path references in `script`, deduplicated in first-seen order.
    pub fn extract(&self, script: &str) -> Vec<ExtractedPath> {
        let families: [(&Regex, PathForm); 5] = [
            (&QUOTED_ABSOLUTE, PathForm::QuotedAbsolute),
            (&NAMED_PARAMETER, PathForm::NamedParameter),
            (&VARIABLE_ASSIGNMENT, PathForm::VariableAssignment),
            (&UNC, PathForm::Unc),
            (&RELATIVE, PathForm::Relative),
        ];

        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for (regex, form) in families {
            for captures in regex.captures_iter(script) {
                let Some(matched) = captures.get(1) else { continue };
                let text = matched.as_str().trim();
                if text.is_empty() || !seen.insert(text.to_string()) {
                    continue;
                }
                paths.push(ExtractedPath { text: text.to_string(), form });
            }
        }

        paths
    }
}

pub fn extract_paths(script: &str) -> Vec<String> {
    PathExtractor::new()
        .extract(script)
        .into_iter()
        .map(|path| path.text)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        for regex in [&QUOTED_ABSOLUTE, &NAMED_PARAMETER, &VARIABLE_ASSIGNMENT, &UNC, &RELATIVE] {
            assert!(!regex.as_str().is_empty());
        }
    }

    #[test]
    fn test_extract_quoted_paths() {
        let script = r#"
        $path = "C:\Users\test\file.txt"
        Get-Item 'C:\Users\test\other.txt'
        "#;
        let paths = extract_paths(script);
        assert!(paths.contains(&r"C:\Users\test\file.txt".to_string()));
        assert!(paths.contains(&r"C:\Users\test\other.txt".to_string()));
    }

    #[test]
    fn test_extract_parameter_paths() {
        let script = r#"Get-ChildItem -Path "C:\Users\test" -Recurse"#;
        assert!(extract_paths(script).contains(&r"C:\Users\test".to_string()));

        let unquoted = r"Copy-Item -LiteralPath C:\Users\test\a.txt -destination C:\Users\test\b";
        let paths = extract_paths(unquoted);
        assert_eq!(paths, vec![r"C:\Users\test\a.txt", r"C:\Users\test\b"]);

        let found = PathExtractor::new().extract(unquoted);
        assert!(found.iter().all(|p| p.form == PathForm::NamedParameter));
    }

    #[test]
    fn test_extract_relative_paths() {
        let script = r"
        Get-Item .\subfolder\file.txt
        Get-Item ..\parent\file.txt
        ";
        let paths = extract_paths(script);
        assert!(paths.contains(&r".\subfolder\file.txt".to_string()));
        assert!(paths.contains(&r"..\parent\file.txt".to_string()));
    }

    #[test]
    fn test_extract_unc_paths() {
        let found = PathExtractor::new().extract(r#"Get-ChildItem "\\server\share\docs""#);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, r"\\server\share\docs");
        assert_eq!(found[0].form, PathForm::Unc);
    }

    #[test]
    fn test_extract_posix_paths() {
        let paths = extract_paths(r#"Get-ChildItem "/etc/ssh"; Get-Item -Path /var/log"#);
        assert_eq!(paths, vec!["/etc/ssh", "/var/log"]);

        // Separator arguments are not paths
        assert!(extract_paths(r#"$parts = $name -split "/""#).is_empty());
    }

    #[test]
    fn test_no_duplicate_paths() {
        let script = r#"
        $path = "C:\Users\test\file.txt"
        Get-Item "C:\Users\test\file.txt"
        "#;
        let paths = extract_paths(script);
        assert_eq!(paths.iter().filter(|p| *p == r"C:\Users\test\file.txt").count(), 1);
    }

    #[test]
    fn test_first_seen_order_is_stable() {
        let script = r#"Get-Item "C:\b"; Get-Item "C:\a"; Get-Item "C:\b""#;
        assert_eq!(extract_paths(script), vec![r"C:\b", r"C:\a"]);
    }

    #[test]
    fn test_empty_script() {
        assert!(extract_paths("").is_empty());
        assert!(extract_paths("Write-Output \"Hello World\"").is_empty());
    }
}
