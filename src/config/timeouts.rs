use std::time::Duration;

use super::ExecutionSettings;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SYNTAX_TIMEOUT_SECS: u64 = 5;

/// Independent limits for read-phase and write-phase execution, plus the
/// short limit for dry-run parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub read: Duration,
    pub write: Duration,
    pub syntax: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            syntax: Duration::from_secs(DEFAULT_SYNTAX_TIMEOUT_SECS),
        }
    }
}

impl TimeoutPolicy {
    pub fn new(read: Duration, write: Duration) -> Self {
        Self {
            read,
            write,
            ..Self::default()
        }
    }

    pub fn with_syntax(mut self, syntax: Duration) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            read: Duration::from_secs(settings.read_timeout_secs),
            write: Duration::from_secs(settings.write_timeout_secs),
            syntax: Duration::from_secs(settings.syntax_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.read, Duration::from_secs(60));
        assert_eq!(policy.write, Duration::from_secs(300));
        assert_eq!(policy.syntax, Duration::from_secs(5));
    }

    #[test]
    fn test_phases_are_independent() {
        let policy = TimeoutPolicy::new(Duration::from_secs(1), Duration::from_secs(2))
            .with_syntax(Duration::from_millis(500));
        assert_eq!(policy.read, Duration::from_secs(1));
        assert_eq!(policy.write, Duration::from_secs(2));
        assert_eq!(policy.syntax, Duration::from_millis(500));
    }
}
