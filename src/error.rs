use thiserror::Error;

use crate::workflow::types::{InterventionId, Role, WorkOrderId, WorkOrderState};

/// Errors returned by the state transition engine.
///
/// Every variant except `Store` guarantees that nothing was written.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Work order {work_order_id} not found")]
    NotFound { work_order_id: WorkOrderId },

    #[error("Transition from {from} to {to} is not permitted")]
    TransitionNotPermitted {
        from: WorkOrderState,
        to: WorkOrderState,
    },

    #[error("Role {role} is not authorized for this transition (allowed: {})", format_roles(.allowed))]
    Unauthorized { role: Role, allowed: Vec<Role> },

    #[error("Prerequisite not met: {message}")]
    PrerequisiteFailed { message: String },

    #[error("A reason is required to move from {from} to {to}")]
    ReasonRequired {
        from: WorkOrderState,
        to: WorkOrderState,
    },

    #[error("Intervention {intervention_id} not found for work order {work_order_id}")]
    InterventionNotFound {
        work_order_id: WorkOrderId,
        intervention_id: InterventionId,
    },

    #[error("Status '{status}' requires a descriptive note")]
    NoteRequired { status: String },

    #[error("Sequence {sequence} is already used in work order {work_order_id}")]
    DuplicateSequence {
        work_order_id: WorkOrderId,
        sequence: u32,
    },

    #[error("Sequence {sequence} is not valid for work order {work_order_id}; numbering starts at 1")]
    InvalidSequence {
        work_order_id: WorkOrderId,
        sequence: u32,
    },

    #[error("Work order {work_order_id} kept changing concurrently after {attempts} attempts")]
    ConcurrentModification {
        work_order_id: WorkOrderId,
        attempts: u32,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Short stable identifier, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::NotFound { .. } => "not_found",
            WorkflowError::TransitionNotPermitted { .. } => "transition_not_permitted",
            WorkflowError::Unauthorized { .. } => "unauthorized",
            WorkflowError::PrerequisiteFailed { .. } => "prerequisite_failed",
            WorkflowError::ReasonRequired { .. } => "reason_required",
            WorkflowError::InterventionNotFound { .. } => "intervention_not_found",
            WorkflowError::NoteRequired { .. } => "note_required",
            WorkflowError::DuplicateSequence { .. } => "duplicate_sequence",
            WorkflowError::InvalidSequence { .. } => "invalid_sequence",
            WorkflowError::ConcurrentModification { .. } => "concurrent_modification",
            WorkflowError::Store(_) => "store",
        }
    }
}

/// Errors raised by persistence collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    /// Compare-and-set lost: the row no longer holds the expected state
    #[error("Work order {work_order_id} was modified concurrently")]
    Conflict { work_order_id: WorkOrderId },

    #[error("Work order {work_order_id} not found")]
    MissingWorkOrder { work_order_id: WorkOrderId },

    #[error("Intervention {intervention_id} not found")]
    MissingIntervention { intervention_id: InterventionId },

    #[error("Sequence {sequence} is already used in work order {work_order_id}")]
    DuplicateSequence {
        work_order_id: WorkOrderId,
        sequence: u32,
    },

    #[error("Corrupt row: {reason}")]
    Corrupt { reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<crate::workflow::types::ParseEnumError> for StoreError {
    fn from(err: crate::workflow::types::ParseEnumError) -> Self {
        StoreError::Corrupt {
            reason: err.to_string(),
        }
    }
}

/// Failure reported by a notification collaborator. Never fatal to a transition.
#[derive(Debug, Error, Clone)]
pub enum NotificationError {
    #[error("Delivery to {recipient} failed: {message}")]
    Delivery { recipient: String, message: String },

    #[error("Notification timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Recipient lookup failed: {message}")]
    RecipientLookup { message: String },
}

fn format_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(Role::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
