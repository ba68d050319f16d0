// Work Order Engine Library - vehicle repair work order lifecycle
// This exposes the core components for embedding, testing and the CLI

pub mod config;
pub mod error;
pub mod observability;
pub mod store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use config::{config, init_config, WorkOrderEngineConfig};
pub use error::{NotificationError, StoreError, WorkflowError};
pub use observability::{OperationTimer, WorkflowMetrics, WorkflowStats};
pub use store::{InMemoryStore, UserDirectory, WorkOrderStore};
#[cfg(feature = "database")]
pub use store::SqliteStore;
pub use telemetry::{create_transition_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    NotificationEvent, Notifier, RuleCatalog, TracingNotifier, TransitionRequest, WorkflowEngine,
};
