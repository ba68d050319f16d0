// In-memory store: a single RwLock guards every table, so each commit is
// trivially atomic and compare-and-set is a plain state comparison.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{intervention_snapshot, InterventionChange, InterventionInsert, UserDirectory, WorkOrderStore};
use crate::error::StoreError;
use crate::workflow::types::{
    AuditEntry, AuditId, Intervention, InterventionId, Role, TransitionWrite, User, UserId, WorkOrder,
    WorkOrderId,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    work_orders: BTreeMap<WorkOrderId, WorkOrder>,
    users: BTreeMap<UserId, User>,
    audits: Vec<AuditEntry>,
    next_audit_id: AuditId,
    next_intervention_id: InterventionId,
}

impl Tables {
    fn apply(&mut self, write: TransitionWrite) -> Result<AuditEntry, StoreError> {
        let change = write.change;
        let work_order = self
            .work_orders
            .get_mut(&change.work_order_id)
            .ok_or(StoreError::MissingWorkOrder {
                work_order_id: change.work_order_id,
            })?;

        if work_order.state != change.expected {
            return Err(StoreError::Conflict {
                work_order_id: change.work_order_id,
            });
        }

        work_order.state = change.new_state;
        work_order.completion_date = change.completion_date;
        if let Some(approver) = change.approved_by {
            work_order.approved_by = Some(approver);
        }

        self.next_audit_id += 1;
        let entry = write.audit.with_id(self.next_audit_id);
        self.audits.push(entry.clone());
        Ok(entry)
    }
}

/// Store and directory backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a work order. Intervention ids already present are kept.
    pub async fn insert_work_order(&self, work_order: WorkOrder) {
        let mut tables = self.tables.write().await;
        let max_id = work_order.interventions.iter().map(|i| i.id).max().unwrap_or(0);
        tables.next_intervention_id = tables.next_intervention_id.max(max_id);
        tables.work_orders.insert(work_order.id, work_order);
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id, user);
    }

    pub async fn audit_count(&self, work_order_id: WorkOrderId) -> usize {
        self.tables
            .read()
            .await
            .audits
            .iter()
            .filter(|a| a.work_order_id == work_order_id)
            .count()
    }
}

#[async_trait]
impl WorkOrderStore for InMemoryStore {
    async fn load_work_order(&self, id: WorkOrderId) -> Result<Option<WorkOrder>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.work_orders.get(&id).map(|wo| {
            let mut wo = wo.clone();
            wo.interventions.sort_by_key(|i| i.sequence);
            wo
        }))
    }

    async fn commit_transition(&self, write: TransitionWrite) -> Result<AuditEntry, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.apply(write)?;
        debug!(
            work_order_id = entry.work_order_id,
            audit_id = entry.id,
            "Committed transition"
        );
        Ok(entry)
    }

    async fn commit_intervention_change(
        &self,
        change: InterventionChange,
        cascades: Vec<TransitionWrite>,
    ) -> Result<(Intervention, Vec<AuditEntry>), StoreError> {
        let mut tables = self.tables.write().await;
        // Stage on a copy so a failing cascade leaves nothing behind
        let mut staged = tables.clone();

        let work_order = staged
            .work_orders
            .get_mut(&change.work_order_id)
            .ok_or(StoreError::MissingWorkOrder {
                work_order_id: change.work_order_id,
            })?;
        if intervention_snapshot(work_order) != change.expected {
            return Err(StoreError::Conflict {
                work_order_id: change.work_order_id,
            });
        }
        let intervention = work_order
            .interventions
            .iter_mut()
            .find(|i| i.id == change.intervention_id)
            .ok_or(StoreError::MissingIntervention {
                intervention_id: change.intervention_id,
            })?;

        intervention.status = Some(change.status);
        if let Some(note) = change.note {
            intervention.note = Some(note);
        }
        if let Some(note) = change.suspension_note {
            intervention.suspension_note = Some(note);
        }
        if let Some(started_at) = change.started_at {
            intervention.started_at = Some(started_at);
        }
        if let Some(ended_at) = change.ended_at {
            intervention.ended_at = Some(ended_at);
        }
        let updated = intervention.clone();

        let mut entries = Vec::with_capacity(cascades.len());
        for write in cascades {
            entries.push(staged.apply(write)?);
        }

        *tables = staged;
        Ok((updated, entries))
    }

    async fn insert_intervention(&self, insert: InterventionInsert) -> Result<Intervention, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_intervention_id += 1;
        let id = tables.next_intervention_id;

        let work_order = tables
            .work_orders
            .get_mut(&insert.work_order_id)
            .ok_or(StoreError::MissingWorkOrder {
                work_order_id: insert.work_order_id,
            })?;
        if work_order
            .interventions
            .iter()
            .any(|i| i.sequence == insert.sequence)
        {
            return Err(StoreError::DuplicateSequence {
                work_order_id: insert.work_order_id,
                sequence: insert.sequence,
            });
        }

        let intervention = Intervention {
            id,
            work_order_id: insert.work_order_id,
            sequence: insert.sequence,
            description: insert.description,
            estimated_hours: insert.estimated_hours,
            activity_type: insert.activity_type,
            status: insert.status,
            note: insert.note,
            suspension_note: insert.suspension_note,
            started_at: None,
            ended_at: None,
        };
        work_order.interventions.push(intervention.clone());
        Ok(intervention)
    }

    async fn audit_trail(&self, work_order_id: WorkOrderId, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let tables = self.tables.read().await;
        // Ids grow with insertion order, so reverse order is newest first
        Ok(tables
            .audits
            .iter()
            .rev()
            .filter(|a| a.work_order_id == work_order_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn active_users(&self, roles: Option<Vec<Role>>) -> Result<Vec<User>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .filter(|u| u.active)
            .filter(|u| roles.as_ref().map_or(true, |r| r.contains(&u.role)))
            .cloned()
            .collect())
    }
}
