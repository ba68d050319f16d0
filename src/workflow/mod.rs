// Work order workflow: rule catalog, transition engine, cascades and notifications

pub mod cascade;
pub mod engine;
pub mod notify;
pub mod rules;
pub mod types;

pub use cascade::{plan_cascade, CascadeStep};
pub use engine::{TransitionRequest, WorkflowEngine};
pub use notify::{NotificationDispatcher, NotificationEvent, Notifier, TracingNotifier, WorkOrderSummary};
pub use rules::{Prerequisite, RoleOverride, RuleCatalog, TransitionRule};
pub use types::*;
