//! Shared fixtures for work order integration tests
//!
//! A small repair shop: one admin, one general manager, two technicians, a
//! mechanics lead and an inactive bodywork technician, all held by the
//! in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use work_order_engine::config::WorkOrderEngineConfig;
use work_order_engine::error::NotificationError;
use work_order_engine::store::InMemoryStore;
use work_order_engine::workflow::{
    Activity, ActivityStatus, ActivityType, ActorSummary, Intervention, InterventionId,
    InterventionStatus, NotificationEvent, Notifier, Priority, Recipient, RequestContext, Role,
    TracingNotifier, TransitionRequest, User, UserId, WorkOrder, WorkOrderId, WorkOrderState,
    WorkOrderSummary, WorkflowEngine,
};

pub const ADMIN: UserId = 1;
pub const MANAGER: UserId = 2;
pub const MECHANIC: UserId = 3;
pub const BODYWORKER: UserId = 4;
pub const MECHANICS_LEAD: UserId = 5;
pub const RETIRED: UserId = 6;

pub fn users() -> Vec<User> {
    vec![
        user(ADMIN, "Paola Rossi", Role::Admin, true),
        user(MANAGER, "Giulia Neri", Role::GeneralManager, true),
        user(MECHANIC, "Luca Bianchi", Role::Workshop, true),
        user(BODYWORKER, "Marco Gallo", Role::Bodyshop, true),
        user(MECHANICS_LEAD, "Sara Conti", Role::MechanicsLead, true),
        user(RETIRED, "Anna Verdi", Role::Bodyshop, false),
    ]
}

pub fn user(id: UserId, name: &str, role: Role, active: bool) -> User {
    User {
        id,
        full_name: name.to_string(),
        email: format!("{}@officina.example", name.to_lowercase().replace(' ', ".")),
        role,
        active,
    }
}

pub fn find(id: UserId) -> User {
    users()
        .into_iter()
        .find(|u| u.id == id)
        .expect("fixture user exists")
}

pub fn work_order(id: WorkOrderId, state: WorkOrderState) -> WorkOrder {
    WorkOrder {
        id,
        number: format!("WO-{id}"),
        state,
        priority: Priority::Medium,
        appointment_date: None,
        expected_end_date: None,
        completion_date: None,
        created_by: Some(MANAGER),
        approved_by: None,
        interventions: Vec::new(),
        activities: Vec::new(),
    }
}

pub fn intervention(
    id: InterventionId,
    work_order_id: WorkOrderId,
    sequence: u32,
    status: Option<InterventionStatus>,
) -> Intervention {
    Intervention {
        id,
        work_order_id,
        sequence,
        description: format!("Intervention {sequence}"),
        estimated_hours: 1.5,
        activity_type: ActivityType::Mechanical,
        status,
        note: None,
        suspension_note: None,
        started_at: None,
        ended_at: None,
    }
}

pub fn activity(id: i64, description: &str, status: ActivityStatus) -> Activity {
    Activity {
        id,
        description: description.to_string(),
        activity_type: ActivityType::Mechanical,
        status,
    }
}

/// A work order in `state` that satisfies every structural prerequisite
pub fn ready_work_order(id: WorkOrderId, state: WorkOrderState) -> WorkOrder {
    let mut wo = work_order(id, state);
    wo.interventions.push(intervention(id * 100, id, 1, None));
    wo.activities.push(activity(id * 100, "Replace pads", ActivityStatus::Completed));
    if state == WorkOrderState::Completed {
        wo.completion_date = Some(chrono::Utc::now());
    }
    wo
}

pub fn request(
    work_order_id: WorkOrderId,
    target: WorkOrderState,
    user: UserId,
    reason: Option<&str>,
) -> TransitionRequest {
    TransitionRequest {
        work_order_id,
        target,
        user: find(user),
        reason: reason.map(str::to_string),
        context: RequestContext::default(),
        overrides: None,
    }
}

pub struct Shop {
    pub store: Arc<InMemoryStore>,
    pub engine: WorkflowEngine,
}

impl Shop {
    pub async fn seed(&self, work_order: WorkOrder) {
        self.store.insert_work_order(work_order).await;
    }

    pub async fn state(&self, id: WorkOrderId) -> WorkOrderState {
        self.engine.work_order(id).await.expect("work order exists").state
    }
}

pub async fn shop() -> Shop {
    shop_with(Arc::new(TracingNotifier), WorkOrderEngineConfig::default()).await
}

pub async fn shop_with(notifier: Arc<dyn Notifier>, config: WorkOrderEngineConfig) -> Shop {
    let store = Arc::new(InMemoryStore::new());
    for user in users() {
        store.insert_user(user).await;
    }
    let engine = WorkflowEngine::new(store.clone(), store.clone(), notifier, &config);
    Shop { store, engine }
}

/// Notifier that remembers every delivery
#[derive(Default)]
pub struct RecordingNotifier {
    pub deliveries: Mutex<Vec<(UserId, NotificationEvent, WorkOrderState)>>,
}

impl RecordingNotifier {
    pub fn recipients(&self, event: NotificationEvent) -> Vec<UserId> {
        let mut ids: Vec<_> = self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(id, _, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        recipient: &Recipient,
        work_order: &WorkOrderSummary,
        event: NotificationEvent,
        _actor: &ActorSummary,
    ) -> Result<(), NotificationError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((recipient.id, event, work_order.state));
        Ok(())
    }
}

/// Notifier whose every delivery fails
pub struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(
        &self,
        recipient: &Recipient,
        _work_order: &WorkOrderSummary,
        _event: NotificationEvent,
        _actor: &ActorSummary,
    ) -> Result<(), NotificationError> {
        Err(NotificationError::Delivery {
            recipient: recipient.email.clone(),
            message: "mail relay refused connection".to_string(),
        })
    }
}
