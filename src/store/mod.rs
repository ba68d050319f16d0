//! Persistence collaborators
//!
//! The engine never talks to a database directly. It loads work orders and
//! commits state changes through [`WorkOrderStore`], and resolves people
//! through [`UserDirectory`]. Both are trait objects so the engine can run
//! against the in-memory store in tests and the SQLite store in production.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::error::StoreError;
use crate::workflow::types::{
    ActivityType, AuditEntry, Intervention, InterventionId, InterventionStatus, Role, TransitionWrite,
    User, UserId, WorkOrder, WorkOrderId,
};

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Intervention row ready to be inserted, sequence already resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionInsert {
    pub work_order_id: WorkOrderId,
    pub sequence: u32,
    pub description: String,
    pub estimated_hours: f64,
    pub activity_type: ActivityType,
    pub status: Option<InterventionStatus>,
    pub note: Option<String>,
    pub suspension_note: Option<String>,
}

/// Intervention ids and statuses of one work order, ordered by id
pub type InterventionSnapshot = Vec<(InterventionId, Option<InterventionStatus>)>;

/// Snapshot of the interventions a cascade is planned against
pub fn intervention_snapshot(work_order: &WorkOrder) -> InterventionSnapshot {
    let mut snapshot: InterventionSnapshot = work_order
        .interventions
        .iter()
        .map(|i| (i.id, i.status))
        .collect();
    snapshot.sort_by_key(|(id, _)| *id);
    snapshot
}

/// Field changes of one intervention status edit. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionChange {
    pub work_order_id: WorkOrderId,
    pub intervention_id: InterventionId,
    pub status: InterventionStatus,
    pub note: Option<String>,
    pub suspension_note: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Interventions as they were when the cascade was planned. The store
    /// rejects the change with `StoreError::Conflict` if they differ now.
    pub expected: InterventionSnapshot,
}

/// Work order persistence
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkOrderStore: Send + Sync {
    /// Load a work order with its interventions and activities
    async fn load_work_order(&self, id: WorkOrderId) -> Result<Option<WorkOrder>, StoreError>;

    /// Apply a compare-and-set state change and append its audit entry in one
    /// transaction. Returns `StoreError::Conflict` if the persisted state no
    /// longer equals `write.change.expected`, in which case nothing is written.
    async fn commit_transition(&self, write: TransitionWrite) -> Result<AuditEntry, StoreError>;

    /// Apply an intervention edit together with the cascade transitions it
    /// triggered, all or nothing. Cascades are applied in order. Returns
    /// `StoreError::Conflict` when the work order's interventions no longer
    /// match `change.expected`.
    async fn commit_intervention_change(
        &self,
        change: InterventionChange,
        cascades: Vec<TransitionWrite>,
    ) -> Result<(Intervention, Vec<AuditEntry>), StoreError>;

    async fn insert_intervention(&self, insert: InterventionInsert) -> Result<Intervention, StoreError>;

    /// Audit entries of one work order, newest first, at most `limit`
    async fn audit_trail(&self, work_order_id: WorkOrderId, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Identity collaborator
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Active users, restricted to `roles` when given
    async fn active_users(&self, roles: Option<Vec<Role>>) -> Result<Vec<User>, StoreError>;
}
