use regex::Regex;
use serde::{Deserialize, Serialize};
use std::iter::Peekable;
use std::str::Chars;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::gateway::{Classification, GateError};
use super::validator::ContainmentChecker;
use super::SandboxRoot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DangerCategory {
    DynamicEvaluation,
    ProcessSpawn,
    RegistryAccess,
    NetworkRetrieval,
    Reflection,
    ModuleImport,
    ExecutionPolicy,
    PermanentDelete,
}

/// The rule that decided a classification. Kept out of user-facing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    OutsideSandbox,
    Dangerous(DangerCategory),
    Mutation,
    ReadOnly,
}

impl Verdict {
    pub fn classification(&self) -> Classification {
        match self {
            Verdict::OutsideSandbox | Verdict::Dangerous(_) => Classification::Unsafe,
            Verdict::Mutation => Classification::Write,
            Verdict::ReadOnly => Classification::Read,
        }
    }

    /// The rejection to report when this verdict blocks execution.
    pub fn rejection(&self) -> Option<GateError> {
        match self {
            Verdict::OutsideSandbox => Some(GateError::ContainmentViolation),
            Verdict::Dangerous(_) => Some(GateError::DangerousConstruct),
            _ => None,
        }
    }
}

// Lowercase substrings matched against the lowercased script. The generic
// `invoke-` entry sits after the specific network cmdlets.
const DENYLIST: &[(DangerCategory, &[&str])] = &[
    (
        DangerCategory::NetworkRetrieval,
        &[
            "web-request",
            "invoke-restmethod",
            "downloadstring",
            "downloadfile",
            "system.net.",
            "net.webclient",
            "start-bitstransfer",
        ],
    ),
    (
        DangerCategory::RegistryAccess,
        &["hklm:", "hkcu:", "hkcr:", "hku:", "registry::"],
    ),
    (
        DangerCategory::ProcessSpawn,
        &[
            "start-process",
            "start-job",
            "diagnostics.process",
            "cmd /c",
            "cmd.exe",
            "wscript",
            "cscript",
        ],
    ),
    (
        DangerCategory::DynamicEvaluation,
        &["invoke-expression", "invoke-command", "[scriptblock]::create", "invoke-"],
    ),
    (
        DangerCategory::Reflection,
        &["reflection.assembly", "[reflection.", "add-type", "[activator]", "-comobject"],
    ),
    (
        DangerCategory::ModuleImport,
        &["import-module", "using module", "install-module"],
    ),
    (
        DangerCategory::ExecutionPolicy,
        &["set-executionpolicy", "-executionpolicy"],
    ),
    (
        DangerCategory::PermanentDelete,
        &[
            "[system.io.file]::delete",
            "[io.file]::delete",
            "[system.io.directory]::delete",
            "[io.directory]::delete",
            "clear-recyclebin",
            "format-volume",
        ],
    ),
];

const MUTATION_CMDLETS: &[&str] = &[
    "move-item",
    "copy-item",
    "remove-item",
    "new-item",
    "rename-item",
    "set-content",
    "add-content",
    "out-file",
    "set-itemproperty",
    "clear-content",
    "new-object system.io",
    "set-item",
    "clear-item",
    "new-itemproperty",
    "remove-itemproperty",
    "rename-itemproperty",
    "export-csv",
    "tee-object",
    "compress-archive",
    "expand-archive",
];

// Native programs that start another interpreter, reach the network or
// change system state, invoked at the start of a statement.
const NATIVE_PROGRAMS: &str = r#"(?im)(?:^|[;|{(]|&&)\s*(?:&\s*)?["']?(?:[^\s"';|]*[\\/])?(?:bash|sh|zsh|dash|python[0-9.]*|perl|ruby|node|pwsh|powershell|cmd|wsl|curl|wget|ssh|scp|nc|certutil|bitsadmin|mshta|rundll32|regsvr32|schtasks|reg)(?:\.exe)?["']?(?:\s|$)"#;

static DANGEROUS_PATTERNS: LazyLock<Vec<(DangerCategory, Regex)>> = LazyLock::new(|| {
    vec![
        (DangerCategory::NetworkRetrieval, compile_regex(r"(?i)\b(?:iwr|irm)\b")),
        (DangerCategory::DynamicEvaluation, compile_regex(r"(?i)\b(?:iex|icm)\b")),
        // Dot-sourcing another script
        (DangerCategory::DynamicEvaluation, compile_regex(r"(?m)(?:^|[;|{(])\s*\.\s+\S")),
        (DangerCategory::ModuleImport, compile_regex(r"(?i)\bipmo\b")),
        (DangerCategory::ProcessSpawn, compile_regex(NATIVE_PROGRAMS)),
        // Call operator
        (DangerCategory::ProcessSpawn, compile_regex(r"(?m)(?:^|[;|{(])\s*&\s*\S")),
        (
            DangerCategory::PermanentDelete,
            compile_regex(r"(?i)(?:^|[\s;|&({])(?:remove-item|ri|rm|del|erase|rd|rmdir)\s[^\r\n;|]*-force\b"),
        ),
    ]
});

static MUTATION_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"(?im)(?:^|[;|{(]|&&)\s*(?:mv|move|mi|cp|copy|cpi|rm|ri|del|erase|rd|rmdir|ni|mkdir|md|ren|rni|sc|ac)\s")
});

// `> file` / `>> file` / `2> file`; the target is checked separately.
static REDIRECTION: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"(?:[1-6*])?>>?\s*(\S+)"));

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{}`: {}", pattern, err),
    }
}

#[derive(Debug, Clone)]
pub struct ScriptClassifier {
    containment: ContainmentChecker,
}

impl ScriptClassifier {
    pub fn new(root: SandboxRoot) -> Self {
        Self {
            containment: ContainmentChecker::new(root),
        }
    }

    pub fn root(&self) -> &SandboxRoot {
        self.containment.root()
    }

    pub fn classify(&self, script: &str) -> Classification {
        self.assess(script).classification()
    }

    /// First matching rule wins: containment, then the denylist, then the
    /// mutation set.
    pub fn assess(&self, script: &str) -> Verdict {
        if !self.containment.all_contained(script) {
            warn!("Script references a path outside the sandbox");
            return Verdict::OutsideSandbox;
        }

        let lowered = script.to_lowercase();

        if let Some(category) = dangerous_construct(script, &lowered) {
            warn!(category = ?category, "Script contains a denylisted construct");
            return Verdict::Dangerous(category);
        }

        if is_mutating(script, &lowered) {
            debug!("Script classified as write");
            return Verdict::Mutation;
        }

        debug!("Script classified as read");
        Verdict::ReadOnly
    }
}

pub fn classify_script(script: &str, root: &SandboxRoot) -> Classification {
    ScriptClassifier::new(root.clone()).classify(script)
}

fn dangerous_construct(script: &str, lowered: &str) -> Option<DangerCategory> {
    for (category, needles) in DENYLIST {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return Some(*category);
        }
    }

    DANGEROUS_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(script))
        .map(|(category, _)| *category)
}

fn is_mutating(script: &str, lowered: &str) -> bool {
    MUTATION_CMDLETS.iter().any(|cmdlet| lowered.contains(cmdlet))
        || MUTATION_ALIAS.is_match(script)
        || writes_redirection(script)
}

fn writes_redirection(script: &str) -> bool {
    let code = mask_literals(script);
    REDIRECTION.captures_iter(&code).any(|captures| {
        let target = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let target = target.trim_matches(|c| c == '"' || c == '\'');
        // `2>&1` merges streams, `> $null` discards
        !(target.starts_with('&') || target.eq_ignore_ascii_case("$null"))
    })
}

/// Blanks out string contents and comments so operators inside them are not
/// mistaken for code. Quote characters, line breaks and `$(...)`
/// subexpressions inside double-quoted strings are kept.
fn mask_literals(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut chars = script.chars().peekable();
    let mut prev = '\n';

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push(c);
                while let Some(c) = chars.next() {
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            out.push_str("  ");
                            continue;
                        }
                        out.push(c);
                        break;
                    }
                    out.push(blank(c));
                }
            }
            '"' => {
                out.push(c);
                while let Some(c) = chars.next() {
                    match c {
                        '`' => {
                            out.push(' ');
                            if let Some(escaped) = chars.next() {
                                out.push(blank(escaped));
                            }
                        }
                        '$' if chars.peek() == Some(&'(') => {
                            out.push(c);
                            copy_subexpression(&mut chars, &mut out);
                        }
                        '"' if chars.peek() == Some(&'"') => {
                            chars.next();
                            out.push_str("  ");
                        }
                        '"' => {
                            out.push(c);
                            break;
                        }
                        c => out.push(blank(c)),
                    }
                }
            }
            '<' if chars.peek() == Some(&'#') => {
                out.push(' ');
                let mut last = ' ';
                for c in chars.by_ref() {
                    out.push(blank(c));
                    if last == '#' && c == '>' {
                        break;
                    }
                    last = c;
                }
            }
            '#' if prev.is_whitespace() || matches!(prev, ';' | '|' | '(' | '{') => {
                out.push(' ');
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                    out.push(' ');
                }
            }
            '`' => {
                out.push(' ');
                if let Some(escaped) = chars.next() {
                    out.push(blank(escaped));
                }
            }
            c => out.push(c),
        }
        prev = c;
    }

    out
}

// Copies `(...)` through unchanged, balancing parentheses.
fn copy_subexpression(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    let mut depth = 0usize;
    for c in chars.by_ref() {
        out.push(c);
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
}

fn blank(c: char) -> char {
    if c == '\n' {
        '\n'
    } else {
        ' '
    }
}
