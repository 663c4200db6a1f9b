use crate::gateway::{GateError, GateResult};

pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSizeGuard {
    limit: usize,
}

impl Default for OutputSizeGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_SIZE)
    }
}

impl OutputSizeGuard {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fails when `output` is strictly larger than the limit, in bytes.
    pub fn check(&self, output: &str) -> GateResult<()> {
        check_output_size(output, self.limit)
    }
}

pub fn check_output_size(output: &str, limit: usize) -> GateResult<()> {
    if output.len() > limit {
        return Err(GateError::OutputTooLarge {
            size_kb: output.len() / 1000,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_output_size() {
        assert!(OutputSizeGuard::default().check(&"x".repeat(50_000)).is_ok());
    }

    #[test]
    fn test_output_too_large() {
        let err = OutputSizeGuard::default().check(&"x".repeat(150_000)).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("too large"));
    }

    #[test]
    fn test_empty_output() {
        assert!(check_output_size("", DEFAULT_MAX_OUTPUT_SIZE).is_ok());
        assert!(check_output_size("", 0).is_ok());
    }

    #[test]
    fn test_exactly_at_limit() {
        assert!(check_output_size(&"x".repeat(100_000), 100_000).is_ok());

        let err = check_output_size(&"x".repeat(100_001), 100_000).unwrap_err();
        assert_eq!(err, GateError::OutputTooLarge { size_kb: 100 });
        assert!(err.to_string().contains("100KB"));
    }

    #[test]
    fn test_limit_counts_bytes_not_chars() {
        // 4 bytes per char
        let output = "🦀".repeat(30);
        assert!(check_output_size(&output, 120).is_ok());
        assert!(check_output_size(&output, 119).is_err());
    }
}
