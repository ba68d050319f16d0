// Work order state transition engine
// Every state change is a compare-and-set commit paired with its audit entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::cascade::plan_cascade;
use super::notify::{NotificationDispatcher, Notifier, WorkOrderSummary};
use super::rules::RuleCatalog;
use super::types::{
    ActorSummary, AuditTrailEntry, AvailableTransition, Intervention, InterventionId,
    InterventionStatus, InterventionStatusUpdate, InterventionUpdateOutcome, NewAuditEntry, NewIntervention,
    RequestContext, StateChange, TransitionOutcome, TransitionOverrides, TransitionType,
    TransitionWrite, User, UserId, WorkOrder, WorkOrderId, WorkOrderState,
};
use crate::config::{AuditConfig, WorkOrderEngineConfig};
use crate::error::{StoreError, WorkflowError};
use crate::observability::{OperationTimer, WorkflowMetrics};
use crate::store::{
    intervention_snapshot, InterventionChange, InterventionInsert, UserDirectory, WorkOrderStore,
};
use crate::telemetry::{create_transition_span, generate_correlation_id};

/// A manual transition requested by an authenticated user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub work_order_id: WorkOrderId,
    pub target: WorkOrderState,
    pub user: User,
    pub reason: Option<String>,
    #[serde(default)]
    pub context: RequestContext,
    pub overrides: Option<TransitionOverrides>,
}

/// Who is changing the state. Cascades run as the system on behalf of the
/// user whose intervention edit triggered them.
#[derive(Debug, Clone, Copy)]
enum Initiator<'a> {
    User(&'a User),
    System { triggered_by: &'a User },
}

impl<'a> Initiator<'a> {
    fn user(&self) -> &'a User {
        match self {
            Initiator::User(user) => user,
            Initiator::System { triggered_by } => triggered_by,
        }
    }

    fn transition_type(&self) -> TransitionType {
        match self {
            Initiator::User(_) => TransitionType::Manual,
            Initiator::System { .. } => TransitionType::Automatic,
        }
    }
}

pub struct WorkflowEngine {
    catalog: RuleCatalog,
    store: Arc<dyn WorkOrderStore>,
    directory: Arc<dyn UserDirectory>,
    dispatcher: NotificationDispatcher,
    audit: AuditConfig,
    max_conflict_retries: u32,
    metrics: Arc<WorkflowMetrics>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkOrderStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        config: &WorkOrderEngineConfig,
    ) -> Self {
        let (catalog, unknown) =
            RuleCatalog::standard().with_role_overrides(&config.workflow.role_overrides);
        for o in &unknown {
            warn!(
                from = %o.from,
                to = %o.to,
                "Ignoring role override for a transition that does not exist"
            );
        }

        let metrics = Arc::new(WorkflowMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            notifier,
            Arc::clone(&directory),
            config.notifications.clone(),
            Arc::clone(&metrics),
        );

        Self {
            catalog,
            store,
            directory,
            dispatcher,
            audit: config.audit.clone(),
            max_conflict_retries: config.workflow.max_conflict_retries,
            metrics,
        }
    }

    /// Replace the rule catalog, e.g. with a hand-built one in tests
    pub fn with_catalog(mut self, catalog: RuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &WorkflowMetrics {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub async fn work_order(&self, id: WorkOrderId) -> Result<WorkOrder, WorkflowError> {
        self.store
            .load_work_order(id)
            .await?
            .ok_or(WorkflowError::NotFound { work_order_id: id })
    }

    /// Execute a manual transition. Nothing is written unless every check
    /// passes; notifications go out only after the commit.
    pub async fn transition(&self, request: TransitionRequest) -> Result<TransitionOutcome, WorkflowError> {
        let correlation_id = generate_correlation_id();
        let span = create_transition_span(
            "transition",
            request.work_order_id,
            Some(request.target),
            &correlation_id,
        );

        async {
            let timer = OperationTimer::new("transition");
            let result = self.execute_transition(&request).await;
            timer.finish();

            match &result {
                Ok(outcome) => {
                    self.metrics.record_transition();
                    info!(
                        work_order.id = outcome.work_order_id,
                        from = %outcome.from_state,
                        to = %outcome.to_state,
                        user.id = request.user.id,
                        audit.id = outcome.audit_id,
                        "Work order transition executed"
                    );
                }
                Err(e) => {
                    self.metrics.record_rejection();
                    warn!(
                        work_order.id = request.work_order_id,
                        user.id = request.user.id,
                        role = %request.user.role,
                        kind = e.kind(),
                        error = %e,
                        "Work order transition rejected"
                    );
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_transition(&self, request: &TransitionRequest) -> Result<TransitionOutcome, WorkflowError> {
        let reason = normalize_reason(request.reason.as_deref());
        let mut attempts = 0;

        loop {
            attempts += 1;
            let work_order = self.work_order(request.work_order_id).await?;

            let from = work_order.state;
            let rule = self
                .catalog
                .find_rule(from, request.target)
                .ok_or(WorkflowError::TransitionNotPermitted {
                    from,
                    to: request.target,
                })?;
            rule.authorize(request.user.role)?;
            rule.check_prerequisites(&work_order, request.overrides.as_ref())?;
            if rule.reason_required && reason.is_none() {
                return Err(WorkflowError::ReasonRequired {
                    from,
                    to: request.target,
                });
            }

            let now = Utc::now();
            let write = build_write(
                &work_order,
                request.target,
                Initiator::User(&request.user),
                reason.clone(),
                &request.context,
                now,
            );

            match self.store.commit_transition(write).await {
                Ok(entry) => {
                    let mut summary = WorkOrderSummary::from(&work_order);
                    summary.state = request.target;
                    let actor = ActorSummary::from(&request.user);
                    self.dispatcher.dispatch(summary, actor.clone());

                    return Ok(TransitionOutcome {
                        success: true,
                        work_order_id: work_order.id,
                        from_state: from,
                        to_state: request.target,
                        timestamp: entry.created_at,
                        executed_by: actor,
                        audit_id: entry.id,
                    });
                }
                Err(e) => self.handle_commit_error(e, request.work_order_id, attempts)?,
            }
        }
    }

    /// Decide whether a failed commit is worth another attempt. Returns Ok
    /// to retry after re-reading the work order.
    fn handle_commit_error(
        &self,
        error: StoreError,
        work_order_id: WorkOrderId,
        attempts: u32,
    ) -> Result<(), WorkflowError> {
        match error {
            StoreError::Conflict { .. } if attempts <= self.max_conflict_retries => {
                self.metrics.record_conflict_retry();
                debug!(work_order.id = work_order_id, attempts, "Re-reading after conflict");
                Ok(())
            }
            StoreError::Conflict { .. } => Err(WorkflowError::ConcurrentModification {
                work_order_id,
                attempts,
            }),
            StoreError::MissingWorkOrder { .. } => Err(WorkflowError::NotFound { work_order_id }),
            other => Err(other.into()),
        }
    }

    /// Read-only projection of the rules leaving the current state, in
    /// catalog order, evaluated for `user`.
    pub async fn available_transitions(
        &self,
        work_order: &WorkOrder,
        user: &User,
        overrides: Option<&TransitionOverrides>,
    ) -> Vec<AvailableTransition> {
        let mut available = Vec::new();
        for rule in self.catalog.rules_from(work_order.state) {
            let (allowed, explanation) = match rule.can_execute(work_order, user.role, overrides) {
                Ok(()) => (true, String::new()),
                Err(e) => (false, e.to_string()),
            };
            let candidate_recipients = self
                .dispatcher
                .candidate_recipients(&rule.allowed_roles)
                .await;

            available.push(AvailableTransition {
                to_state: rule.to_state,
                allowed,
                reason_required: rule.reason_required,
                explanation,
                allowed_roles: rule.allowed_roles.clone(),
                candidate_recipients,
            });
        }
        available
    }

    /// Audit entries of a work order, newest first
    pub async fn audit_trail(
        &self,
        work_order_id: WorkOrderId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditTrailEntry>, WorkflowError> {
        let limit = limit
            .unwrap_or(self.audit.default_limit)
            .min(self.audit.max_limit);
        let entries = self.store.audit_trail(work_order_id, limit).await?;

        let mut names: HashMap<UserId, Option<String>> = HashMap::new();
        let mut trail = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = match names.get(&entry.executed_by) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .directory
                        .find_user(entry.executed_by)
                        .await?
                        .map(|u| u.full_name);
                    names.insert(entry.executed_by, name.clone());
                    name
                }
            };

            trail.push(AuditTrailEntry {
                id: entry.id,
                from_state: entry.from_state,
                to_state: entry.to_state,
                transition_type: entry.transition_type,
                executed_by: ActorSummary {
                    id: entry.executed_by,
                    name,
                    role: entry.user_role,
                },
                reason: entry.reason,
                ip_address: entry.ip_address,
                user_agent: entry.user_agent,
                timestamp: entry.created_at,
            });
        }
        Ok(trail)
    }

    /// Change an intervention's status and apply any cascade on the parent
    /// work order in the same commit. Cascades bypass authorization.
    pub async fn update_intervention_status(
        &self,
        work_order_id: WorkOrderId,
        intervention_id: InterventionId,
        update: InterventionStatusUpdate,
        user: &User,
    ) -> Result<InterventionUpdateOutcome, WorkflowError> {
        let correlation_id = generate_correlation_id();
        let span = create_transition_span("intervention_status", work_order_id, None, &correlation_id);

        let result = self
            .execute_intervention_update(work_order_id, intervention_id, &update, user)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            warn!(
                work_order.id = work_order_id,
                intervention.id = intervention_id,
                kind = e.kind(),
                error = %e,
                "Intervention status update rejected"
            );
        }
        result
    }

    async fn execute_intervention_update(
        &self,
        work_order_id: WorkOrderId,
        intervention_id: InterventionId,
        update: &InterventionStatusUpdate,
        user: &User,
    ) -> Result<InterventionUpdateOutcome, WorkflowError> {
        let suspension_note = normalize_reason(update.suspension_note.as_deref());
        if update.status.requires_note() && suspension_note.is_none() {
            return Err(WorkflowError::NoteRequired {
                status: update.status.code().to_string(),
            });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let work_order = self.work_order(work_order_id).await?;
            let intervention = work_order.intervention(intervention_id).ok_or(
                WorkflowError::InterventionNotFound {
                    work_order_id,
                    intervention_id,
                },
            )?;

            let now = Utc::now();
            let change = InterventionChange {
                work_order_id,
                intervention_id,
                status: update.status,
                note: update.note.clone(),
                suspension_note: suspension_note.clone(),
                started_at: (update.status == InterventionStatus::TakenInCharge
                    && intervention.started_at.is_none())
                .then_some(now),
                ended_at: (update.status == InterventionStatus::Closed
                    && intervention.ended_at.is_none())
                .then_some(now),
                expected: intervention_snapshot(&work_order),
            };

            // Each step is checked against the state the previous one produced
            let mut staged = work_order.clone();
            let mut cascades = Vec::new();
            for step in plan_cascade(&work_order, intervention_id, update.status) {
                staged.state = step.from_state;
                cascades.push(build_write(
                    &staged,
                    step.to_state,
                    Initiator::System { triggered_by: user },
                    Some(step.reason),
                    &RequestContext::default(),
                    now,
                ));
                staged.state = step.to_state;
            }

            match self.store.commit_intervention_change(change, cascades).await {
                Ok((intervention, entries)) => {
                    for entry in &entries {
                        self.metrics.record_cascade();
                        info!(
                            work_order.id = work_order_id,
                            intervention.id = intervention_id,
                            from = %entry.from_state,
                            to = %entry.to_state,
                            audit.id = entry.id,
                            "Cascaded work order transition"
                        );
                    }
                    debug!(
                        work_order.id = work_order_id,
                        intervention.id = intervention_id,
                        status = update.status.code(),
                        "Intervention status updated"
                    );
                    return Ok(InterventionUpdateOutcome {
                        intervention,
                        work_order_state: staged.state,
                        cascades: entries,
                    });
                }
                Err(StoreError::MissingIntervention { .. }) => {
                    return Err(WorkflowError::InterventionNotFound {
                        work_order_id,
                        intervention_id,
                    })
                }
                Err(e) => self.handle_commit_error(e, work_order_id, attempts)?,
            }
        }
    }

    /// Append an intervention, assigning the next sequence number when none is given
    pub async fn add_intervention(
        &self,
        work_order_id: WorkOrderId,
        new: NewIntervention,
    ) -> Result<Intervention, WorkflowError> {
        let suspension_note = normalize_reason(new.suspension_note.as_deref());
        if let Some(status) = new.status {
            if status.requires_note() && suspension_note.is_none() {
                return Err(WorkflowError::NoteRequired {
                    status: status.code().to_string(),
                });
            }
        }

        if new.sequence == Some(0) {
            return Err(WorkflowError::InvalidSequence {
                work_order_id,
                sequence: 0,
            });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let work_order = self.work_order(work_order_id).await?;
            let sequence = match new.sequence {
                Some(sequence) => {
                    if work_order.interventions.iter().any(|i| i.sequence == sequence) {
                        return Err(WorkflowError::DuplicateSequence {
                            work_order_id,
                            sequence,
                        });
                    }
                    sequence
                }
                None => work_order.next_sequence(),
            };

            let insert = InterventionInsert {
                work_order_id,
                sequence,
                description: new.description.clone(),
                estimated_hours: new.estimated_hours,
                activity_type: new.activity_type,
                status: new.status,
                note: new.note.clone(),
                suspension_note: suspension_note.clone(),
            };

            match self.store.insert_intervention(insert).await {
                Ok(intervention) => {
                    info!(
                        work_order.id = work_order_id,
                        intervention.id = intervention.id,
                        sequence = intervention.sequence,
                        "Intervention added"
                    );
                    return Ok(intervention);
                }
                // Another insert took the number we picked; pick again once
                Err(StoreError::DuplicateSequence { .. })
                    if new.sequence.is_none() && attempts == 1 =>
                {
                    debug!(
                        work_order.id = work_order_id,
                        sequence, "Sequence taken concurrently, reassigning"
                    );
                }
                Err(StoreError::DuplicateSequence { sequence, .. }) => {
                    return Err(WorkflowError::DuplicateSequence {
                        work_order_id,
                        sequence,
                    })
                }
                Err(StoreError::MissingWorkOrder { .. }) => {
                    return Err(WorkflowError::NotFound { work_order_id })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Blank text counts as no text; anything else is kept verbatim
fn normalize_reason(reason: Option<&str>) -> Option<String> {
    reason
        .filter(|r| !r.trim().is_empty())
        .map(str::to_string)
}

fn build_write(
    work_order: &WorkOrder,
    to: WorkOrderState,
    initiator: Initiator<'_>,
    reason: Option<String>,
    context: &RequestContext,
    at: DateTime<Utc>,
) -> TransitionWrite {
    let user = initiator.user();
    let approved_by = match initiator {
        Initiator::User(user) if to == WorkOrderState::Approved => Some(user.id),
        _ => None,
    };

    TransitionWrite {
        change: StateChange {
            work_order_id: work_order.id,
            expected: work_order.state,
            new_state: to,
            completion_date: (to == WorkOrderState::Completed).then_some(at),
            approved_by,
        },
        audit: NewAuditEntry {
            work_order_id: work_order.id,
            from_state: work_order.state,
            to_state: to,
            transition_type: initiator.transition_type(),
            executed_by: user.id,
            user_role: user.role.as_str().to_string(),
            reason,
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            created_at: at,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MockWorkOrderStore};
    use crate::workflow::notify::TracingNotifier;
    use crate::workflow::types::{ActivityType, Priority, Role};
    use mockall::Sequence;

    fn manager() -> User {
        User {
            id: 3,
            full_name: "Giulia Neri".to_string(),
            email: "giulia@example.com".to_string(),
            role: Role::GeneralManager,
            active: true,
        }
    }

    fn work_order(state: WorkOrderState) -> WorkOrder {
        WorkOrder {
            id: 42,
            number: "WO-42".to_string(),
            state,
            priority: Priority::Medium,
            appointment_date: None,
            expected_end_date: None,
            completion_date: None,
            created_by: Some(1),
            approved_by: None,
            interventions: vec![Intervention {
                id: 1,
                work_order_id: 42,
                sequence: 1,
                description: "Brake check".to_string(),
                estimated_hours: 1.0,
                activity_type: ActivityType::Mechanical,
                status: None,
                note: None,
                suspension_note: None,
                started_at: None,
                ended_at: None,
            }],
            activities: Vec::new(),
        }
    }

    fn approve_request() -> TransitionRequest {
        TransitionRequest {
            work_order_id: 42,
            target: WorkOrderState::Approved,
            user: manager(),
            reason: None,
            context: RequestContext::default(),
            overrides: None,
        }
    }

    fn engine_with(store: MockWorkOrderStore, retries: u32) -> WorkflowEngine {
        let mut config = WorkOrderEngineConfig::default();
        config.workflow.max_conflict_retries = retries;
        config.notifications.enabled = false;
        WorkflowEngine::new(
            Arc::new(store),
            Arc::new(InMemoryStore::new()),
            Arc::new(TracingNotifier),
            &config,
        )
    }

    #[test]
    fn blank_reasons_are_absent() {
        assert_eq!(normalize_reason(None), None);
        assert_eq!(normalize_reason(Some("   ")), None);
        assert_eq!(normalize_reason(Some(" wrong car ")), Some(" wrong car ".to_string()));
    }

    #[test]
    fn writes_stamp_approver_and_completion() {
        let user = manager();
        let wo = work_order(WorkOrderState::Draft);
        let write = build_write(
            &wo,
            WorkOrderState::Approved,
            Initiator::User(&user),
            None,
            &RequestContext::default(),
            Utc::now(),
        );
        assert_eq!(write.change.approved_by, Some(3));
        assert_eq!(write.change.completion_date, None);
        assert_eq!(write.audit.transition_type, TransitionType::Manual);

        let wo = work_order(WorkOrderState::InProgress);
        let write = build_write(
            &wo,
            WorkOrderState::Completed,
            Initiator::System { triggered_by: &user },
            Some("Automatic: all interventions closed".to_string()),
            &RequestContext::default(),
            Utc::now(),
        );
        assert!(write.change.completion_date.is_some());
        assert_eq!(write.change.approved_by, None);
        assert_eq!(write.audit.transition_type, TransitionType::Automatic);
        assert_eq!(write.audit.user_role, "GENERAL_MANAGER");
    }

    #[tokio::test]
    async fn losing_a_race_re_reads_and_rejects() {
        let mut store = MockWorkOrderStore::new();
        let mut seq = Sequence::new();
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store
            .expect_commit_transition()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Conflict { work_order_id: 42 }));
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Approved))));

        let engine = engine_with(store, 3);
        let err = engine.transition(approve_request()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::TransitionNotPermitted {
                from: WorkOrderState::Approved,
                to: WorkOrderState::Approved
            }
        ));
        assert_eq!(engine.metrics().get_stats().conflicts_retried, 1);
    }

    #[tokio::test]
    async fn retry_applies_a_request_that_still_validates() {
        let mut store = MockWorkOrderStore::new();
        store
            .expect_load_work_order()
            .times(2)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        let mut seq = Sequence::new();
        store
            .expect_commit_transition()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Conflict { work_order_id: 42 }));
        store
            .expect_commit_transition()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|write| Ok(write.audit.with_id(9)));

        let engine = engine_with(store, 3);
        let outcome = engine.transition(approve_request()).await.unwrap();
        assert_eq!(outcome.audit_id, 9);
        assert_eq!(outcome.to_state, WorkOrderState::Approved);
        assert_eq!(engine.metrics().get_stats().transitions_executed, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_concurrent_modification() {
        let mut store = MockWorkOrderStore::new();
        store
            .expect_load_work_order()
            .times(3)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store
            .expect_commit_transition()
            .times(3)
            .returning(|_| Err(StoreError::Conflict { work_order_id: 42 }));

        let engine = engine_with(store, 2);
        let err = engine.transition(approve_request()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::ConcurrentModification {
                work_order_id: 42,
                attempts: 3
            }
        ));
        assert_eq!(engine.metrics().get_stats().transitions_rejected, 1);
    }

    #[tokio::test]
    async fn backend_failures_propagate() {
        let mut store = MockWorkOrderStore::new();
        store
            .expect_load_work_order()
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store
            .expect_commit_transition()
            .times(1)
            .returning(|_| Err(StoreError::Backend("disk full".to_string())));

        let engine = engine_with(store, 3);
        let err = engine.transition(approve_request()).await.unwrap_err();
        assert_eq!(err.kind(), "store");
    }

    #[tokio::test]
    async fn rejected_requests_never_commit() {
        let mut store = MockWorkOrderStore::new();
        store
            .expect_load_work_order()
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store.expect_commit_transition().never();

        let engine = engine_with(store, 3);
        let mut request = approve_request();
        request.user.role = Role::Workshop;
        assert!(matches!(
            engine.transition(request).await,
            Err(WorkflowError::Unauthorized { .. })
        ));

        let mut request = approve_request();
        request.target = WorkOrderState::Cancelled;
        request.reason = Some("  ".to_string());
        assert!(matches!(
            engine.transition(request).await,
            Err(WorkflowError::ReasonRequired { .. })
        ));
    }

    #[tokio::test]
    async fn suspension_without_note_is_rejected_before_loading() {
        let mut store = MockWorkOrderStore::new();
        store.expect_load_work_order().never();

        let engine = engine_with(store, 3);
        let err = engine
            .update_intervention_status(
                42,
                1,
                InterventionStatusUpdate {
                    status: InterventionStatus::Suspended,
                    note: None,
                    suspension_note: None,
                },
                &manager(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoteRequired { ref status } if status == "sospeso"));
    }

    fn with_second_intervention(
        mut wo: WorkOrder,
        status: Option<InterventionStatus>,
    ) -> WorkOrder {
        let mut second = wo.interventions[0].clone();
        second.id = 2;
        second.sequence = 2;
        second.status = status;
        wo.interventions.push(second);
        wo
    }

    fn new_intervention(sequence: Option<u32>) -> NewIntervention {
        NewIntervention {
            sequence,
            description: "Replace wiper blades".to_string(),
            estimated_hours: 0.5,
            activity_type: ActivityType::Mechanical,
            status: None,
            note: None,
            suspension_note: None,
        }
    }

    #[tokio::test]
    async fn cascade_is_replanned_when_interventions_moved_underneath() {
        let mut store = MockWorkOrderStore::new();
        let mut seq = Sequence::new();
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(with_second_intervention(
                    work_order(WorkOrderState::InProgress),
                    None,
                )))
            });
        store
            .expect_commit_intervention_change()
            .withf(|change, cascades| {
                change.expected == vec![(1, None), (2, None)] && cascades.is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StoreError::Conflict { work_order_id: 42 }));
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(with_second_intervention(
                    work_order(WorkOrderState::InProgress),
                    Some(InterventionStatus::Closed),
                )))
            });
        store
            .expect_commit_intervention_change()
            .withf(|change, cascades| {
                change.expected == vec![(1, None), (2, Some(InterventionStatus::Closed))]
                    && cascades.len() == 1
                    && cascades[0].change.new_state == WorkOrderState::Completed
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut closed = work_order(WorkOrderState::InProgress).interventions[0].clone();
                closed.status = Some(InterventionStatus::Closed);
                Ok((closed, Vec::new()))
            });

        let engine = engine_with(store, 3);
        let outcome = engine
            .update_intervention_status(
                42,
                1,
                InterventionStatusUpdate {
                    status: InterventionStatus::Closed,
                    note: None,
                    suspension_note: None,
                },
                &manager(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.work_order_state, WorkOrderState::Completed);
        assert_eq!(engine.metrics().get_stats().conflicts_retried, 1);
    }

    #[tokio::test]
    async fn sequence_zero_is_rejected_before_loading() {
        let mut store = MockWorkOrderStore::new();
        store.expect_load_work_order().never();
        store.expect_insert_intervention().never();

        let engine = engine_with(store, 3);
        let err = engine
            .add_intervention(42, new_intervention(Some(0)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidSequence {
                work_order_id: 42,
                sequence: 0
            }
        ));
        assert_eq!(err.kind(), "invalid_sequence");
    }

    #[tokio::test]
    async fn auto_sequence_is_reassigned_once_after_a_collision() {
        let mut store = MockWorkOrderStore::new();
        let mut seq = Sequence::new();
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store
            .expect_insert_intervention()
            .withf(|insert| insert.sequence == 2)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(StoreError::DuplicateSequence {
                    work_order_id: 42,
                    sequence: 2,
                })
            });
        store
            .expect_load_work_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(with_second_intervention(
                    work_order(WorkOrderState::Draft),
                    None,
                )))
            });
        store
            .expect_insert_intervention()
            .withf(|insert| insert.sequence == 3 && insert.description == "Replace wiper blades")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|insert| {
                let mut added = work_order(WorkOrderState::Draft).interventions[0].clone();
                added.id = 3;
                added.sequence = insert.sequence;
                added.description = insert.description;
                Ok(added)
            });

        let engine = engine_with(store, 3);
        let added = engine
            .add_intervention(42, new_intervention(None))
            .await
            .unwrap();
        assert_eq!(added.sequence, 3);
        assert_eq!(added.id, 3);
    }

    #[tokio::test]
    async fn explicit_sequence_collisions_are_not_retried() {
        let mut store = MockWorkOrderStore::new();
        store
            .expect_load_work_order()
            .times(1)
            .returning(|_| Ok(Some(work_order(WorkOrderState::Draft))));
        store.expect_insert_intervention().times(1).returning(|_| {
            Err(StoreError::DuplicateSequence {
                work_order_id: 42,
                sequence: 7,
            })
        });

        let engine = engine_with(store, 3);
        let err = engine
            .add_intervention(42, new_intervention(Some(7)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::DuplicateSequence {
                work_order_id: 42,
                sequence: 7
            }
        ));
    }
}
