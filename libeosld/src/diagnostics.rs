//! Non-fatal error reporting for the writer pipeline.
//!
//! Configuration and feature problems are reported here and the link keeps
//! going so that one invocation surfaces as many diagnostics as possible.
//! The driver consults the accumulated count at two checkpoints (after
//! dispatcher emission and after the output buffer is opened) and suppresses
//! the final commit when anything was reported. Fatal conditions don't come
//! through here at all; they return `Err` immediately.

use crate::error::Result;
use anyhow::bail;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Mutex<Vec<String>>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    /// Reports a non-fatal error. The link continues; the final output is
    /// suppressed at the next checkpoint.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.errors.lock().unwrap().push(message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// All messages reported so far, in order.
    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Checkpoint: bails with an aggregate error if anything was reported.
    pub fn check(&self) -> Result {
        let errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            return Ok(());
        }
        bail!("link failed with {} error(s):\n{}", errors.len(), errors.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_when_clean() {
        let diag = Diagnostics::new();
        assert!(diag.check().is_ok());
        assert!(!diag.has_errors());
    }

    #[test]
    fn check_aggregates_reports() {
        let diag = Diagnostics::new();
        diag.error("stack size must be 16-byte aligned");
        diag.error("initial memory too small, 131072 bytes needed");
        let err = diag.check().unwrap_err().to_string();
        assert!(err.contains("2 error(s)"));
        assert!(err.contains("stack size must be 16-byte aligned"));
        assert_eq!(diag.error_count(), 2);
    }
}
