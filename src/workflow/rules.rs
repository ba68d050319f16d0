// Rule catalog, role authorization and structural prerequisites.
// Pure functions over loaded work orders, no persistence access.

use serde::{Deserialize, Serialize};

use super::types::{ActivityStatus, Role, TransitionOverrides, WorkOrder, WorkOrderState};
use crate::error::WorkflowError;

/// Structural requirement a work order must meet before a rule may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prerequisite {
    None,
    /// At least one intervention, counting the caller override when present
    AtLeastOneIntervention,
    /// Current state must already be Approved
    MustBeApproved,
    /// Must be in progress with every activity completed
    ActivitiesCompleted,
}

impl Prerequisite {
    /// Check the requirement. The error string is a user-facing explanation.
    pub fn evaluate(
        &self,
        work_order: &WorkOrder,
        overrides: Option<&TransitionOverrides>,
    ) -> Result<(), String> {
        match self {
            Prerequisite::None => Ok(()),
            Prerequisite::AtLeastOneIntervention => {
                let count = overrides
                    .and_then(|o| o.interventions_count)
                    .unwrap_or(work_order.interventions.len());
                if count == 0 {
                    return Err(
                        "At least one intervention must be entered before the work order can be approved"
                            .to_string(),
                    );
                }
                Ok(())
            }
            Prerequisite::MustBeApproved => {
                if work_order.state != WorkOrderState::Approved {
                    return Err("The work order must be approved first".to_string());
                }
                Ok(())
            }
            Prerequisite::ActivitiesCompleted => {
                if work_order.state != WorkOrderState::InProgress {
                    return Err("The work order must be in progress".to_string());
                }
                if work_order.activities.is_empty() {
                    return Err("The work order has no activities".to_string());
                }
                let unfinished: Vec<&str> = work_order
                    .activities
                    .iter()
                    .filter(|a| a.status != ActivityStatus::Completed)
                    .map(|a| a.description.as_str())
                    .collect();
                if !unfinished.is_empty() {
                    return Err(format!(
                        "All activities must be completed; unfinished: {}",
                        unfinished.join(", ")
                    ));
                }
                Ok(())
            }
        }
    }
}

/// One legal edge of the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub allowed_roles: Vec<Role>,
    pub prerequisite: Prerequisite,
    pub reason_required: bool,
}

impl TransitionRule {
    fn new(
        from_state: WorkOrderState,
        to_state: WorkOrderState,
        allowed_roles: &[Role],
        prerequisite: Prerequisite,
        reason_required: bool,
    ) -> Self {
        Self {
            from_state,
            to_state,
            allowed_roles: allowed_roles.to_vec(),
            prerequisite,
            reason_required,
        }
    }

    /// Role check. Always runs before the prerequisite check.
    pub fn authorize(&self, role: Role) -> Result<(), WorkflowError> {
        if self.allowed_roles.contains(&role) {
            Ok(())
        } else {
            Err(WorkflowError::Unauthorized {
                role,
                allowed: self.allowed_roles.clone(),
            })
        }
    }

    pub fn check_prerequisites(
        &self,
        work_order: &WorkOrder,
        overrides: Option<&TransitionOverrides>,
    ) -> Result<(), WorkflowError> {
        self.prerequisite
            .evaluate(work_order, overrides)
            .map_err(|message| WorkflowError::PrerequisiteFailed { message })
    }

    /// Authorization then prerequisites, as the available-transitions projection needs it
    pub fn can_execute(
        &self,
        work_order: &WorkOrder,
        role: Role,
        overrides: Option<&TransitionOverrides>,
    ) -> Result<(), WorkflowError> {
        self.authorize(role)?;
        self.check_prerequisites(work_order, overrides)
    }
}

/// Replacement role list for one existing edge, usually read from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOverride {
    pub from: WorkOrderState,
    pub to: WorkOrderState,
    pub roles: Vec<Role>,
}

/// Immutable table of legal transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCatalog {
    rules: Vec<TransitionRule>,
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleCatalog {
    /// The shop's workflow. Draft cannot jump straight to InProgress or Completed.
    pub fn standard() -> Self {
        use Prerequisite as P;
        use crate::workflow::types::WorkOrderState::*;

        const MANAGEMENT: &[Role] = &[Role::GeneralManager, Role::Admin];
        const SHOP_FLOOR: &[Role] = &[Role::Workshop, Role::Bodyshop, Role::Admin];

        Self {
            rules: vec![
                TransitionRule::new(Draft, Approved, MANAGEMENT, P::AtLeastOneIntervention, false),
                TransitionRule::new(Approved, InProgress, SHOP_FLOOR, P::MustBeApproved, false),
                TransitionRule::new(InProgress, Completed, SHOP_FLOOR, P::ActivitiesCompleted, false),
                // Reopen for corrections
                TransitionRule::new(Completed, InProgress, MANAGEMENT, P::None, true),
                TransitionRule::new(Draft, Cancelled, MANAGEMENT, P::None, true),
                TransitionRule::new(Approved, Cancelled, MANAGEMENT, P::None, true),
                TransitionRule::new(InProgress, Cancelled, MANAGEMENT, P::None, true),
                // Restore a cancelled ticket
                TransitionRule::new(Cancelled, Draft, MANAGEMENT, P::None, true),
            ],
        }
    }

    /// Replace role lists of existing edges. Overrides naming an unknown edge
    /// are returned so the caller can report them; they never create edges.
    pub fn with_role_overrides(mut self, overrides: &[RoleOverride]) -> (Self, Vec<RoleOverride>) {
        let mut unknown = Vec::new();
        for o in overrides {
            match self
                .rules
                .iter_mut()
                .find(|r| r.from_state == o.from && r.to_state == o.to)
            {
                Some(rule) => rule.allowed_roles = o.roles.clone(),
                None => unknown.push(o.clone()),
            }
        }
        (self, unknown)
    }

    /// Exact (from, to) match, no fallback
    pub fn find_rule(&self, from: WorkOrderState, to: WorkOrderState) -> Option<&TransitionRule> {
        self.rules
            .iter()
            .find(|r| r.from_state == from && r.to_state == to)
    }

    /// Rules leaving `from`, in catalog order
    pub fn rules_from(&self, from: WorkOrderState) -> impl Iterator<Item = &TransitionRule> {
        self.rules.iter().filter(move |r| r.from_state == from)
    }

    pub fn rules(&self) -> &[TransitionRule] {
        &self.rules
    }
}
