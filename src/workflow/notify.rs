//! Post-commit notification dispatch
//!
//! Notifications run in spawned tasks after the transition has committed.
//! Recipient lookup and delivery both happen inside the task, so the caller
//! never waits on the identity collaborator or on a slow notifier. Failures
//! are logged and counted, never returned.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::types::{
    ActorSummary, Priority, Recipient, Role, WorkOrder, WorkOrderId, WorkOrderState,
};
use crate::config::NotificationConfig;
use crate::error::NotificationError;
use crate::observability::WorkflowMetrics;
use crate::store::UserDirectory;

/// What happened to the work order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    WorkOrderApproved,
    WorkStarted,
    WorkCompleted,
    WorkOrderCancelled,
}

impl NotificationEvent {
    /// Event announced when a work order enters `state`, if any
    pub fn for_state(state: WorkOrderState) -> Option<Self> {
        match state {
            WorkOrderState::Approved => Some(NotificationEvent::WorkOrderApproved),
            WorkOrderState::InProgress => Some(NotificationEvent::WorkStarted),
            WorkOrderState::Completed => Some(NotificationEvent::WorkCompleted),
            WorkOrderState::Cancelled => Some(NotificationEvent::WorkOrderCancelled),
            WorkOrderState::Draft => None,
        }
    }

    /// Roles to notify. `None` means every active user.
    pub fn audience(&self) -> Option<&'static [Role]> {
        match self {
            NotificationEvent::WorkOrderApproved => Some(Role::TECHNICIANS),
            NotificationEvent::WorkStarted | NotificationEvent::WorkCompleted => Some(Role::MANAGERS),
            NotificationEvent::WorkOrderCancelled => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::WorkOrderApproved => "work_order_approved",
            NotificationEvent::WorkStarted => "work_started",
            NotificationEvent::WorkCompleted => "work_completed",
            NotificationEvent::WorkOrderCancelled => "work_order_cancelled",
        }
    }
}

/// Work order fields a notifier needs, detached from the loaded aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderSummary {
    pub id: WorkOrderId,
    pub number: String,
    pub state: WorkOrderState,
    pub priority: Priority,
}

impl From<&WorkOrder> for WorkOrderSummary {
    fn from(work_order: &WorkOrder) -> Self {
        Self {
            id: work_order.id,
            number: work_order.number.clone(),
            state: work_order.state,
            priority: work_order.priority,
        }
    }
}

/// Delivery channel (email, SMS, calendar, ...)
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &Recipient,
        work_order: &WorkOrderSummary,
        event: NotificationEvent,
        actor: &ActorSummary,
    ) -> Result<(), NotificationError>;
}

/// Notifier that only writes a structured log event
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        recipient: &Recipient,
        work_order: &WorkOrderSummary,
        event: NotificationEvent,
        actor: &ActorSummary,
    ) -> Result<(), NotificationError> {
        info!(
            event = event.as_str(),
            work_order.id = work_order.id,
            work_order.number = %work_order.number,
            recipient.id = recipient.id,
            recipient.email = %recipient.email,
            actor.id = actor.id,
            "Work order notification"
        );
        Ok(())
    }
}

type RecipientCache = Cache<Vec<Role>, Arc<Vec<Recipient>>>;

/// Fans committed transitions out to the notifier on background tasks.
///
/// Queued deliveries belong to the dispatcher: dropping it aborts whatever
/// has not finished yet, with a warning naming how many. Call
/// [`wait_idle`](Self::wait_idle) first when every delivery must go out.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn UserDirectory>,
    settings: NotificationConfig,
    recipients: Option<RecipientCache>,
    pending: Mutex<JoinSet<()>>,
    metrics: Arc<WorkflowMetrics>,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn UserDirectory>,
        settings: NotificationConfig,
        metrics: Arc<WorkflowMetrics>,
    ) -> Self {
        let recipients = settings.recipient_cache_ttl().map(|ttl| {
            Cache::builder()
                .max_capacity(64)
                .time_to_live(ttl)
                .build()
        });

        Self {
            notifier,
            directory,
            settings,
            recipients,
            pending: Mutex::new(JoinSet::new()),
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Active users holding any of `roles`, for display next to an available
    /// transition. Lookup failures are logged and yield an empty list.
    pub async fn candidate_recipients(&self, roles: &[Role]) -> Vec<Recipient> {
        let mut key = roles.to_vec();
        key.sort();
        key.dedup();

        let lookup = {
            let directory = Arc::clone(&self.directory);
            let key = key.clone();
            async move { lookup_recipients(directory.as_ref(), Some(key)).await.map(Arc::new) }
        };

        let result = match &self.recipients {
            Some(cache) => cache
                .try_get_with(key, lookup)
                .await
                .map_err(|e| NotificationError::clone(&e)),
            None => lookup.await,
        };

        match result {
            Ok(recipients) => (*recipients).clone(),
            Err(e) => {
                warn!(error = %e, "Failed to resolve candidate recipients");
                Vec::new()
            }
        }
    }

    /// Queue notifications for a committed transition into `work_order.state`.
    /// Returns immediately; delivery happens on a spawned task.
    pub fn dispatch(&self, work_order: WorkOrderSummary, actor: ActorSummary) {
        if !self.settings.enabled {
            return;
        }
        let Some(event) = NotificationEvent::for_state(work_order.state) else {
            return;
        };

        let notifier = Arc::clone(&self.notifier);
        let directory = Arc::clone(&self.directory);
        let metrics = Arc::clone(&self.metrics);
        let timeout = self.settings.dispatch_timeout();

        let task = async move {
            deliver(
                notifier.as_ref(),
                directory.as_ref(),
                metrics.as_ref(),
                timeout,
                &work_order,
                event,
                &actor,
            )
            .await;
        };

        let mut pending = self.lock_pending();
        // Reap finished tasks so the set does not grow without bound
        while pending.try_join_next().is_some() {}
        pending.spawn(task.instrument(tracing::Span::current()));
    }

    /// Wait until every queued notification task has finished
    pub async fn wait_idle(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_pending());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Notification task aborted");
            }
        }
    }

    /// Deliveries queued and not yet finished
    pub fn pending(&self) -> usize {
        let mut pending = self.lock_pending();
        while pending.try_join_next().is_some() {}
        pending.len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while pending.try_join_next().is_some() {}
        if !pending.is_empty() {
            warn!(
                pending = pending.len(),
                "Notification dispatcher dropped, aborting queued deliveries"
            );
        }
    }
}

async fn lookup_recipients(
    directory: &dyn UserDirectory,
    roles: Option<Vec<Role>>,
) -> Result<Vec<Recipient>, NotificationError> {
    directory
        .active_users(roles)
        .await
        .map(|users| users.iter().map(Recipient::from).collect())
        .map_err(|e| NotificationError::RecipientLookup {
            message: e.to_string(),
        })
}

async fn deliver(
    notifier: &dyn Notifier,
    directory: &dyn UserDirectory,
    metrics: &WorkflowMetrics,
    timeout: Duration,
    work_order: &WorkOrderSummary,
    event: NotificationEvent,
    actor: &ActorSummary,
) {
    let roles = event.audience().map(<[Role]>::to_vec);
    let recipients = match tokio::time::timeout(timeout, lookup_recipients(directory, roles)).await {
        Ok(Ok(recipients)) => recipients,
        Ok(Err(e)) => {
            metrics.record_notification_failure();
            warn!(work_order.id = work_order.id, error = %e, "Notification dispatch failed");
            return;
        }
        Err(_) => {
            metrics.record_notification_failure();
            warn!(
                work_order.id = work_order.id,
                timeout_ms = timeout.as_millis() as u64,
                "Recipient lookup timed out"
            );
            return;
        }
    };

    debug!(
        work_order.id = work_order.id,
        event = event.as_str(),
        recipients = recipients.len(),
        "Dispatching notifications"
    );

    for recipient in &recipients {
        let outcome = match tokio::time::timeout(
            timeout,
            notifier.notify(recipient, work_order, event, actor),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NotificationError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(()) => metrics.record_notification_sent(),
            Err(e) => {
                metrics.record_notification_failure();
                warn!(
                    work_order.id = work_order.id,
                    recipient.id = recipient.id,
                    event = event.as_str(),
                    error = %e,
                    "Notification dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MockUserDirectory};
    use crate::workflow::types::User;

    fn user(id: i64, role: Role, active: bool) -> User {
        User {
            id,
            full_name: format!("User {id}"),
            email: format!("user{id}@example.com"),
            role,
            active,
        }
    }

    async fn directory() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.insert_user(user(1, Role::Workshop, true)).await;
        store.insert_user(user(2, Role::Bodyshop, true)).await;
        store.insert_user(user(3, Role::GeneralManager, true)).await;
        store.insert_user(user(4, Role::Workshop, false)).await;
        store
    }

    fn summary(state: WorkOrderState) -> WorkOrderSummary {
        WorkOrderSummary {
            id: 42,
            number: "WO-42".to_string(),
            state,
            priority: Priority::High,
        }
    }

    fn actor() -> ActorSummary {
        ActorSummary {
            id: 3,
            name: Some("User 3".to_string()),
            role: "GENERAL_MANAGER".to_string(),
        }
    }

    #[test]
    fn events_follow_the_new_state() {
        assert_eq!(
            NotificationEvent::for_state(WorkOrderState::Approved),
            Some(NotificationEvent::WorkOrderApproved)
        );
        assert_eq!(NotificationEvent::for_state(WorkOrderState::Draft), None);
        assert_eq!(
            NotificationEvent::WorkOrderApproved.audience(),
            Some(Role::TECHNICIANS)
        );
        assert_eq!(NotificationEvent::WorkCompleted.audience(), Some(Role::MANAGERS));
        assert_eq!(NotificationEvent::WorkOrderCancelled.audience(), None);
    }

    #[tokio::test]
    async fn approval_reaches_active_technicians() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|recipient, _, event, _| {
                Role::TECHNICIANS.contains(&recipient.role)
                    && *event == NotificationEvent::WorkOrderApproved
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let metrics = Arc::new(WorkflowMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::new(notifier),
            directory().await,
            NotificationConfig::default(),
            Arc::clone(&metrics),
        );

        dispatcher.dispatch(summary(WorkOrderState::Approved), actor());
        dispatcher.wait_idle().await;

        assert_eq!(metrics.get_stats().notifications_sent, 2);
        assert_eq!(metrics.get_stats().notification_failures, 0);
    }

    #[tokio::test]
    async fn failing_notifier_is_swallowed_and_counted() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|recipient, _, _, _| {
            Err(NotificationError::Delivery {
                recipient: recipient.email.clone(),
                message: "smtp unavailable".to_string(),
            })
        });

        let metrics = Arc::new(WorkflowMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::new(notifier),
            directory().await,
            NotificationConfig::default(),
            Arc::clone(&metrics),
        );

        // Cancellation goes to every active user
        dispatcher.dispatch(summary(WorkOrderState::Cancelled), actor());
        dispatcher.wait_idle().await;

        assert_eq!(metrics.get_stats().notification_failures, 3);
        assert_eq!(metrics.get_stats().notifications_sent, 0);
    }

    struct StalledNotifier;

    #[async_trait]
    impl Notifier for StalledNotifier {
        async fn notify(
            &self,
            _recipient: &Recipient,
            _work_order: &WorkOrderSummary,
            _event: NotificationEvent,
            _actor: &ActorSummary,
        ) -> Result<(), NotificationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notifier_is_bounded_by_timeout() {
        let metrics = Arc::new(WorkflowMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::new(StalledNotifier),
            directory().await,
            NotificationConfig {
                dispatch_timeout_ms: 100,
                ..NotificationConfig::default()
            },
            Arc::clone(&metrics),
        );

        dispatcher.dispatch(summary(WorkOrderState::Completed), actor());
        dispatcher.wait_idle().await;

        assert_eq!(metrics.get_stats().notification_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_dispatcher_aborts_queued_deliveries() {
        let metrics = Arc::new(WorkflowMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            Arc::new(StalledNotifier),
            directory().await,
            NotificationConfig::default(),
            Arc::clone(&metrics),
        );

        dispatcher.dispatch(summary(WorkOrderState::Completed), actor());
        assert_eq!(dispatcher.pending(), 1);
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(metrics.get_stats().notification_failures, 1);

        dispatcher.dispatch(summary(WorkOrderState::Completed), actor());
        assert_eq!(dispatcher.pending(), 1);
        drop(dispatcher);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        let stats = metrics.get_stats();
        assert_eq!(stats.notification_failures, 1);
        assert_eq!(stats.notifications_sent, 0);
    }

    #[tokio::test]
    async fn disabled_dispatch_sends_nothing() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let dispatcher = NotificationDispatcher::new(
            Arc::new(notifier),
            directory().await,
            NotificationConfig {
                enabled: false,
                ..NotificationConfig::default()
            },
            Arc::new(WorkflowMetrics::new()),
        );

        dispatcher.dispatch(summary(WorkOrderState::Approved), actor());
        dispatcher.wait_idle().await;
    }

    #[tokio::test]
    async fn candidate_recipients_are_cached_per_role_set() {
        let mut directory = MockUserDirectory::new();
        directory
            .expect_active_users()
            .times(1)
            .returning(|_| Ok(vec![user(3, Role::GeneralManager, true)]));

        let dispatcher = NotificationDispatcher::new(
            Arc::new(TracingNotifier),
            Arc::new(directory),
            NotificationConfig::default(),
            Arc::new(WorkflowMetrics::new()),
        );

        let first = dispatcher
            .candidate_recipients(&[Role::Admin, Role::GeneralManager])
            .await;
        let second = dispatcher
            .candidate_recipients(&[Role::GeneralManager, Role::Admin])
            .await;
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn lookup_errors_yield_no_candidates() {
        let mut directory = MockUserDirectory::new();
        directory
            .expect_active_users()
            .returning(|_| Err(crate::error::StoreError::Backend("offline".to_string())));

        let dispatcher = NotificationDispatcher::new(
            Arc::new(TracingNotifier),
            Arc::new(directory),
            NotificationConfig {
                recipient_cache_ttl_seconds: 0,
                ..NotificationConfig::default()
            },
            Arc::new(WorkflowMetrics::new()),
        );

        assert!(dispatcher.candidate_recipients(&[Role::Admin]).await.is_empty());
    }
}
