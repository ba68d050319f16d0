// Cascading status propagation: intervention edits that move the parent
// work order forward. Planning is pure; the engine commits the steps.

use super::types::{InterventionId, InterventionStatus, WorkOrder, WorkOrderState};

/// One automatic transition the parent work order should take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    pub from_state: WorkOrderState,
    pub to_state: WorkOrderState,
    pub reason: String,
}

/// Plan the automatic transitions caused by setting `new_status` on
/// `intervention_id`. `work_order` is the state before the edit; the edited
/// intervention is evaluated with `new_status` already applied.
pub fn plan_cascade(
    work_order: &WorkOrder,
    intervention_id: InterventionId,
    new_status: InterventionStatus,
) -> Vec<CascadeStep> {
    let mut steps = Vec::new();
    let mut state = work_order.state;
    let sequence = work_order
        .intervention(intervention_id)
        .map(|i| i.sequence)
        .unwrap_or_default();

    if state == WorkOrderState::Approved && new_status.starts_work() {
        push_forward(
            &mut steps,
            &mut state,
            WorkOrderState::InProgress,
            format!("Automatic: intervention #{sequence} {}", new_status.label()),
        );
    }

    let all_closed = new_status == InterventionStatus::Closed
        && work_order.interventions.iter().all(|i| {
            let status = if i.id == intervention_id {
                Some(new_status)
            } else {
                i.status
            };
            status == Some(InterventionStatus::Closed)
        });

    if all_closed && matches!(state, WorkOrderState::Approved | WorkOrderState::InProgress) {
        push_forward(
            &mut steps,
            &mut state,
            WorkOrderState::Completed,
            "Automatic: all interventions closed".to_string(),
        );
    }

    steps
}

fn push_forward(
    steps: &mut Vec<CascadeStep>,
    state: &mut WorkOrderState,
    target: WorkOrderState,
    reason: String,
) {
    // Never move backward along Approved < InProgress < Completed
    let forward = match (state.progress_rank(), target.progress_rank()) {
        (Some(current), Some(next)) => next > current,
        _ => false,
    };
    if !forward {
        return;
    }
    steps.push(CascadeStep {
        from_state: *state,
        to_state: target,
        reason,
    });
    *state = target;
}
