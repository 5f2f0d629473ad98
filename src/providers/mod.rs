//! Built-in command providers.

pub mod file;
pub mod start_workflow;

pub use file::FileProvider;
pub use start_workflow::{StartWorkflowProvider, WorkflowRequest};

use crate::dispatch::ProviderRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Registry with the file provider and, when a host channel is given, the
/// start-workflow provider.
pub fn builtin_registry(
    file_root: PathBuf,
    requests: Option<mpsc::Sender<WorkflowRequest>>,
) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new().with(Arc::new(FileProvider::new(file_root)));
    if let Some(tx) = requests {
        registry.register(Arc::new(StartWorkflowProvider::new(tx)));
    }
    registry
}
