//! Typed error hierarchy for the workflow engine.
//!
//! Two enums cover the two failure surfaces:
//! - `WorkflowError`: failures while planning or running a workflow step
//! - `ProviderError`: failures reported by a command provider's handler

use thiserror::Error;

/// Errors raised while a workflow is planned or executed.
///
/// Only `Other` is treated as fatal for the whole workflow by the scheduler;
/// the remaining variants each map to a narrower recovery policy.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The reasoning service returned nothing after the retry budget.
    /// Fails only the current todo.
    #[error("Reasoning service returned no reply after {attempts} attempts")]
    ReasoningUnavailable { attempts: u32 },

    /// A command handler reported failure. The todo is retried.
    #[error("Command '{command}' failed: {message}")]
    Execution { command: String, message: String },

    /// The iteration budget ran out before every todo reached a terminal state.
    #[error("Iteration budget exhausted after {iterations} iterations")]
    PlanExhausted { iterations: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by `CommandProvider::handle`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path {0} escapes the provider root")]
    OutsideRoot(std::path::PathBuf),

    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_unavailable_carries_attempts() {
        let err = WorkflowError::ReasoningUnavailable { attempts: 3 };
        match &err {
            WorkflowError::ReasoningUnavailable { attempts } => assert_eq!(*attempts, 3),
            _ => panic!("Expected ReasoningUnavailable"),
        }
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn plan_exhausted_carries_iterations() {
        let err = WorkflowError::PlanExhausted { iterations: 20 };
        assert!(matches!(err, WorkflowError::PlanExhausted { iterations: 20 }));
        assert!(err.to_string().contains("20"));
    }

    #[test]
    fn execution_error_names_command() {
        let err = WorkflowError::Execution {
            command: "read_file".into(),
            message: "no such file".into(),
        };
        let text = err.to_string();
        assert!(text.contains("read_file"));
        assert!(text.contains("no such file"));
    }

    #[test]
    fn workflow_error_converts_from_anyhow() {
        let err: WorkflowError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, WorkflowError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn provider_io_error_carries_path() {
        let path = std::path::PathBuf::from("/data/list.txt");
        let err = ProviderError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        match &err {
            ProviderError::Io { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::PlanExhausted { iterations: 1 });
        assert_std_error(&ProviderError::Failed("x".into()));
    }
}
