// Core types for the work order workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type WorkOrderId = i64;
pub type InterventionId = i64;
pub type ActivityId = i64;
pub type UserId = i64;
pub type AuditId = i64;

/// Business states of a work order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderState {
    /// Initial state, waiting for manager approval
    Draft,
    /// Approved, ready to be picked up by the shop floor
    Approved,
    /// Work in progress
    InProgress,
    /// Work finished
    Completed,
    /// Ticket cancelled
    Cancelled,
}

impl WorkOrderState {
    pub const ALL: [WorkOrderState; 5] = [
        WorkOrderState::Draft,
        WorkOrderState::Approved,
        WorkOrderState::InProgress,
        WorkOrderState::Completed,
        WorkOrderState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderState::Draft => "draft",
            WorkOrderState::Approved => "approved",
            WorkOrderState::InProgress => "in_progress",
            WorkOrderState::Completed => "completed",
            WorkOrderState::Cancelled => "cancelled",
        }
    }

    /// Position along the forward path Approved < InProgress < Completed.
    /// States off that path have no rank.
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            WorkOrderState::Approved => Some(1),
            WorkOrderState::InProgress => Some(2),
            WorkOrderState::Completed => Some(3),
            WorkOrderState::Draft | WorkOrderState::Cancelled => None,
        }
    }
}

impl fmt::Display for WorkOrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkOrderState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(WorkOrderState::Draft),
            "approved" => Ok(WorkOrderState::Approved),
            "in_progress" => Ok(WorkOrderState::InProgress),
            "completed" => Ok(WorkOrderState::Completed),
            "cancelled" => Ok(WorkOrderState::Cancelled),
            other => Err(ParseEnumError::new("work order state", other)),
        }
    }
}

/// Fixed role enumeration supplied by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "ADMIN")]
    Admin,
    #[serde(rename = "GENERAL_MANAGER")]
    GeneralManager,
    /// Mechanics technician
    #[serde(rename = "WORKSHOP")]
    Workshop,
    /// Bodywork technician
    #[serde(rename = "BODYSHOP")]
    Bodyshop,
    #[serde(rename = "CMM")]
    MechanicsLead,
    #[serde(rename = "CBM")]
    BodyworkLead,
}

impl Role {
    pub const TECHNICIANS: &'static [Role] = &[Role::Workshop, Role::Bodyshop];
    pub const MANAGERS: &'static [Role] = &[Role::GeneralManager];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::GeneralManager => "GENERAL_MANAGER",
            Role::Workshop => "WORKSHOP",
            Role::Bodyshop => "BODYSHOP",
            Role::MechanicsLead => "CMM",
            Role::BodyworkLead => "CBM",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADMIN" => Ok(Role::Admin),
            "GENERAL_MANAGER" => Ok(Role::GeneralManager),
            "WORKSHOP" => Ok(Role::Workshop),
            "BODYSHOP" => Ok(Role::Bodyshop),
            "CMM" => Ok(Role::MechanicsLead),
            "CBM" => Ok(Role::BodyworkLead),
            other => Err(ParseEnumError::new("role", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Mechanical,
    Bodywork,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Mechanical => "mechanical",
            ActivityType::Bodywork => "bodywork",
        }
    }
}

impl FromStr for ActivityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mechanical" => Ok(ActivityType::Mechanical),
            "bodywork" => Ok(ActivityType::Bodywork),
            other => Err(ParseEnumError::new("activity type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    ToDo,
    InProgress,
    Completed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::ToDo => "to_do",
            ActivityStatus::InProgress => "in_progress",
            ActivityStatus::Completed => "completed",
        }
    }
}

impl FromStr for ActivityStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_do" => Ok(ActivityStatus::ToDo),
            "in_progress" => Ok(ActivityStatus::InProgress),
            "completed" => Ok(ActivityStatus::Completed),
            other => Err(ParseEnumError::new("activity status", other)),
        }
    }
}

/// Sub-status of an intervention. `None` on the intervention means not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    TakenInCharge,
    AwaitingPart,
    Suspended,
    Closed,
}

impl InterventionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            InterventionStatus::TakenInCharge => "preso_in_carico",
            InterventionStatus::AwaitingPart => "attesa_componente",
            InterventionStatus::Suspended => "sospeso",
            InterventionStatus::Closed => "concluso",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InterventionStatus::TakenInCharge => "taken in charge",
            InterventionStatus::AwaitingPart => "waiting for a part",
            InterventionStatus::Suspended => "suspended",
            InterventionStatus::Closed => "closed",
        }
    }

    /// Whether choosing this status demands a suspension note
    pub fn requires_note(&self) -> bool {
        matches!(self, InterventionStatus::Suspended)
    }

    /// Statuses that mean the shop floor has started working
    pub fn starts_work(&self) -> bool {
        matches!(
            self,
            InterventionStatus::TakenInCharge | InterventionStatus::AwaitingPart
        )
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for InterventionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preso_in_carico" | "taken_in_charge" => Ok(InterventionStatus::TakenInCharge),
            "attesa_componente" | "awaiting_part" => Ok(InterventionStatus::AwaitingPart),
            "sospeso" | "suspended" => Ok(InterventionStatus::Suspended),
            "concluso" | "closed" => Ok(InterventionStatus::Closed),
            other => Err(ParseEnumError::new("intervention status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Requested by a user through the transition entry point
    Manual,
    /// Applied by the system as a consequence of an intervention edit
    Automatic,
    Rollback,
}

impl TransitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionType::Manual => "manual",
            TransitionType::Automatic => "automatic",
            TransitionType::Rollback => "rollback",
        }
    }
}

impl FromStr for TransitionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TransitionType::Manual),
            "automatic" => Ok(TransitionType::Automatic),
            "rollback" => Ok(TransitionType::Rollback),
            other => Err(ParseEnumError::new("transition type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Authenticated actor as exposed by the identity collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub active: bool,
}

/// Actor summary returned with transition results and audit projections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub id: UserId,
    pub name: Option<String>,
    pub role: String,
}

impl From<&User> for ActorSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: Some(user.full_name.clone()),
            role: user.role.as_str().to_string(),
        }
    }
}

/// A user who may receive a notification for a transition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for Recipient {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.full_name.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub description: String,
    pub activity_type: ActivityType,
    pub status: ActivityStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: InterventionId,
    pub work_order_id: WorkOrderId,
    /// 1-based, unique within the owning work order
    pub sequence: u32,
    pub description: String,
    pub estimated_hours: f64,
    pub activity_type: ActivityType,
    pub status: Option<InterventionStatus>,
    pub note: Option<String>,
    pub suspension_note: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A repair job ticket, loaded with its interventions and activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: WorkOrderId,
    pub number: String,
    pub state: WorkOrderState,
    pub priority: Priority,
    pub appointment_date: Option<DateTime<Utc>>,
    pub expected_end_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub approved_by: Option<UserId>,
    pub interventions: Vec<Intervention>,
    pub activities: Vec<Activity>,
}

impl WorkOrder {
    pub fn intervention(&self, id: InterventionId) -> Option<&Intervention> {
        self.interventions.iter().find(|i| i.id == id)
    }

    pub fn next_sequence(&self) -> u32 {
        self.interventions
            .iter()
            .map(|i| i.sequence)
            .max()
            .map_or(1, |max| max + 1)
    }
}

/// Caller-supplied values that take precedence over persisted content while
/// evaluating prerequisites, e.g. the intervention count of an unsaved form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOverrides {
    pub interventions_count: Option<usize>,
}

/// Request metadata recorded on the audit entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Persisted audit record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub work_order_id: WorkOrderId,
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub transition_type: TransitionType,
    pub executed_by: UserId,
    /// Role of the executor at the time of the transition
    pub user_role: String,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit record before the store assigns its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub work_order_id: WorkOrderId,
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub transition_type: TransitionType,
    pub executed_by: UserId,
    pub user_role: String,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn with_id(self, id: AuditId) -> AuditEntry {
        AuditEntry {
            id,
            work_order_id: self.work_order_id,
            from_state: self.from_state,
            to_state: self.to_state,
            transition_type: self.transition_type,
            executed_by: self.executed_by,
            user_role: self.user_role,
            reason: self.reason,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: self.created_at,
        }
    }
}

/// Compare-and-set state mutation of a single work order.
/// The store applies it only if the persisted state still equals `expected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub work_order_id: WorkOrderId,
    pub expected: WorkOrderState,
    pub new_state: WorkOrderState,
    pub completion_date: Option<DateTime<Utc>>,
    /// Replaces `approved_by` when present
    pub approved_by: Option<UserId>,
}

/// State change and its audit entry, committed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionWrite {
    pub change: StateChange,
    pub audit: NewAuditEntry,
}

/// Successful result of a manual transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub success: bool,
    pub work_order_id: WorkOrderId,
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub timestamp: DateTime<Utc>,
    pub executed_by: ActorSummary,
    pub audit_id: AuditId,
}

/// One row of the available-transitions projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableTransition {
    pub to_state: WorkOrderState,
    pub allowed: bool,
    pub reason_required: bool,
    /// Empty when allowed
    pub explanation: String,
    pub allowed_roles: Vec<Role>,
    pub candidate_recipients: Vec<Recipient>,
}

/// Audit entry as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrailEntry {
    pub id: AuditId,
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub transition_type: TransitionType,
    pub executed_by: ActorSummary,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIntervention {
    /// Assigned as max+1 when omitted
    pub sequence: Option<u32>,
    pub description: String,
    pub estimated_hours: f64,
    pub activity_type: ActivityType,
    pub status: Option<InterventionStatus>,
    pub note: Option<String>,
    /// Mandatory when `status` requires one
    pub suspension_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionStatusUpdate {
    pub status: InterventionStatus,
    pub note: Option<String>,
    pub suspension_note: Option<String>,
}

/// Result of an intervention status edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionUpdateOutcome {
    pub intervention: Intervention,
    /// Work order state after any cascade
    pub work_order_state: WorkOrderState,
    /// Automatic audit entries appended by the cascade, oldest first
    pub cascades: Vec<AuditEntry>,
}
