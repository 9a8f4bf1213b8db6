use serde::{Deserialize, Serialize};

/// How the scheduler engine is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    /// A background ticker thread fires due deferrals (default).
    #[default]
    Automatic,

    /// No background thread; the caller drives `run_pending()` explicitly.
    Manual,
}

impl ExecutionMode {
    /// Whether `start()` should spawn the background ticker.
    pub fn is_automatic(&self) -> bool {
        matches!(self, ExecutionMode::Automatic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_default() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Automatic);
        assert!(ExecutionMode::Automatic.is_automatic());
        assert!(!ExecutionMode::Manual.is_automatic());
    }
}
