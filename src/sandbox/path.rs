use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// `C:\...`, letter stored uppercase.
    Drive(char),
    /// `\\server\share\...`, also `\\?\UNC\...` and device paths.
    Unc { server: String, share: String },
    /// POSIX `/...`, or a Windows root-of-current-drive `\...`.
    Root,
    Relative,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("path is empty")]
    Empty,
    #[error("path contains a NUL character")]
    Nul,
    #[error("drive-relative path '{0}' cannot be resolved")]
    DriveRelative(String),
    #[error("invalid path segment '{0}'")]
    InvalidSegment(String),
    #[error("relative path '{0}' has no base")]
    Unanchored(String),
    #[error("cannot resolve '{path}': {reason}")]
    Io { path: String, reason: String },
}

/// A path as it appears in script text. Windows drive paths, UNC shares and
/// POSIX paths parse the same way on every host, so containment decisions do
/// not depend on where the gateway runs. Paths that name something on the
/// current host are also resolved through the filesystem so symlinks are
/// followed before the containment test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPath {
    anchor: Anchor,
    // Raw segments with "" and "." removed; ".." is kept until resolution.
    segments: Vec<String>,
}

impl ScriptPath {
    pub fn parse(text: &str) -> Result<Self, ResolveError> {
        if text.contains('\0') {
            return Err(ResolveError::Nul);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(ResolveError::Empty);
        }

        let (anchor, rest) = split_anchor(text)?;
        let mut path = Self { anchor, segments: Vec::new() };
        for segment in rest.split(['/', '\\']) {
            path.push(segment)?;
        }

        Ok(path)
    }

    pub fn from_host(path: &Path) -> Result<Self, ResolveError> {
        Self::parse(&path.to_string_lossy())
    }

    pub fn anchor(&self) -> &Anchor {
        &self.anchor
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_unc(&self) -> bool {
        matches!(self.anchor, Anchor::Unc { .. })
    }

    pub fn is_relative(&self) -> bool {
        self.anchor == Anchor::Relative
    }

    fn is_windows_form(&self) -> bool {
        matches!(self.anchor, Anchor::Drive(_) | Anchor::Unc { .. })
    }

    fn push(&mut self, segment: &str) -> Result<(), ResolveError> {
        match segment {
            "" | "." => Ok(()),
            ".." => {
                self.segments.push("..".to_string());
                Ok(())
            }
            segment => {
                if self.is_windows_form() {
                    check_windows_segment(segment)?;
                }
                self.segments.push(segment.to_string());
                Ok(())
            }
        }
    }

    /// Appends a relative path to this one. Segments are re-validated against
    /// this path's anchor.
    pub fn join(&self, relative: &ScriptPath) -> Result<Self, ResolveError> {
        let mut joined = self.clone();
        for segment in &relative.segments {
            joined.push(segment)?;
        }
        Ok(joined)
    }

    /// Lexically applies `..`. Absolute paths never climb above their anchor.
    pub fn normalize(&self) -> Self {
        let mut segments: Vec<String> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            if segment == ".." {
                match segments.last() {
                    Some(last) if last != ".." => {
                        segments.pop();
                    }
                    _ if self.anchor == Anchor::Relative => segments.push(segment.clone()),
                    _ => {}
                }
            } else {
                segments.push(segment.clone());
            }
        }

        Self { anchor: self.anchor.clone(), segments }
    }

    /// Resolves to a canonical absolute path. Host paths go through the
    /// filesystem (symlinks followed, missing tails kept); anything else is
    /// normalized lexically. Any I/O failure other than a missing component
    /// is an error.
    pub fn resolve(&self) -> Result<Self, ResolveError> {
        if self.is_relative() {
            return Err(ResolveError::Unanchored(self.to_string()));
        }

        match self.host_anchor() {
            Some(anchor) => {
                let resolved = resolve_on_host(&anchor, &self.segments).map_err(|e| ResolveError::Io {
                    path: self.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Self::from_host(&resolved)?.normalize())
            }
            None => Ok(self.normalize()),
        }
    }

    /// Segment-wise prefix test. Drive and UNC paths compare
    /// case-insensitively, POSIX paths exactly.
    pub fn starts_with(&self, base: &ScriptPath) -> bool {
        if !same_anchor(&self.anchor, &base.anchor) || self.is_relative() {
            return false;
        }

        if base.segments.len() > self.segments.len() {
            return false;
        }

        base.segments
            .iter()
            .zip(&self.segments)
            .all(|(a, b)| self.segment_key(a) == self.segment_key(b))
    }

    fn segment_key<'a>(&self, segment: &'a str) -> Cow<'a, str> {
        if self.is_windows_form() {
            Cow::Owned(segment.to_lowercase())
        } else {
            Cow::Borrowed(segment)
        }
    }

    /// The filesystem root this path lives under, when it names a location on
    /// the current host. UNC paths are never touched.
    fn host_anchor(&self) -> Option<PathBuf> {
        match self.anchor {
            #[cfg(windows)]
            Anchor::Drive(letter) => Some(PathBuf::from(format!("{}:\\", letter))),
            #[cfg(unix)]
            Anchor::Root => Some(PathBuf::from("/")),
            _ => None,
        }
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }
}

impl fmt::Display for ScriptPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.anchor {
            Anchor::Drive(letter) => {
                write!(f, "{}:\\{}", letter, self.segments.join("\\"))
            }
            Anchor::Unc { server, share } => {
                write!(f, "\\\\{}\\{}", server, share)?;
                for segment in &self.segments {
                    write!(f, "\\{}", segment)?;
                }
                Ok(())
            }
            Anchor::Root => write!(f, "/{}", self.segments.join("/")),
            Anchor::Relative => f.write_str(&self.segments.join("/")),
        }
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn split_anchor(text: &str) -> Result<(Anchor, &str), ResolveError> {
    let mut chars = text.chars();
    let first = chars.next();
    let second = chars.next();

    match (first, second) {
        (Some(a), Some(b)) if is_separator(a) && is_separator(b) => {
            let rest = &text[2..];

            // Verbatim (`\\?\`) and device (`\\.\`) prefixes
            if let Some(inner) = rest.strip_prefix("?\\").or_else(|| rest.strip_prefix("?/")) {
                if let Some(unc) = strip_prefix_ignore_case(inner, "UNC\\") {
                    return Ok(split_unc(unc));
                }
                if has_drive_prefix(inner) {
                    return split_anchor(inner);
                }
                return Ok((Anchor::Unc { server: "?".to_string(), share: String::new() }, inner));
            }

            Ok(split_unc(rest))
        }
        (Some(a), _) if is_separator(a) => Ok((Anchor::Root, &text[1..])),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            if !has_drive_prefix(text) {
                return Err(ResolveError::DriveRelative(text.to_string()));
            }
            Ok((Anchor::Drive(letter.to_ascii_uppercase()), &text[3..]))
        }
        _ => Ok((Anchor::Relative, text)),
    }
}

fn has_drive_prefix(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn split_unc(text: &str) -> (Anchor, &str) {
    let mut parts = text.splitn(3, is_separator);
    let server = parts.next().unwrap_or_default().to_lowercase();
    let share = parts.next().unwrap_or_default().to_lowercase();
    let rest = parts.next().unwrap_or_default();
    (Anchor::Unc { server, share }, rest)
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn check_windows_segment(segment: &str) -> Result<(), ResolveError> {
    let invalid_char = segment
        .chars()
        .any(|c| c.is_control() || matches!(c, '<' | '>' | '"' | '|' | ':'));

    // Windows silently strips trailing dots and spaces, so "test." and
    // "test" name the same entry.
    let trailing = segment.ends_with('.') || segment.ends_with(' ');

    if invalid_char || trailing {
        return Err(ResolveError::InvalidSegment(segment.to_string()));
    }

    Ok(())
}

fn same_anchor(a: &Anchor, b: &Anchor) -> bool {
    match (a, b) {
        (Anchor::Drive(x), Anchor::Drive(y)) => x == y,
        (Anchor::Unc { server: s1, share: h1 }, Anchor::Unc { server: s2, share: h2 }) => s1 == s2 && h1 == h2,
        (Anchor::Root, Anchor::Root) => true,
        _ => false,
    }
}

/// Walks `segments` from `anchor`, following every symlink that exists along
/// the way. Components that do not exist are appended as-is.
fn resolve_on_host(anchor: &Path, segments: &[String]) -> io::Result<PathBuf> {
    let mut current = std::fs::canonicalize(anchor)?;

    for segment in segments {
        if segment == ".." {
            // `current` is always canonical here, so popping is exact
            current.pop();
            continue;
        }

        current.push(segment);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                current = std::fs::canonicalize(&current)?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(current)
}
