//! Workflow state machine: pure transition logic over a loaded request
//!
//! Nothing here touches storage. The service loads a request, applies one
//! transition, and persists the result together with any budget action this
//! module instructs it to take.
use super::authorize::can_act;
use super::error::WorkflowError;
use super::hierarchy::Role;
use super::trip::TimeStamp;
use super::workflow::{
    Approver, FINANCE_ROLE, Request, RequestStatus, StepStatus, StepType, WorkflowStep,
};
use chrono::Utc;

/// Ledger mutation the service must perform as part of the same
/// transaction as the request persist.
#[derive(Debug, PartialEq, Eq)]
pub enum BudgetAction {
    Allocate { project_id: String, amount: u64 },
    ReleaseAllocation { project_id: String },
}

/// Aggregate status as a pure function of step state. Never stored
/// independently of the steps that produced it.
pub fn derive_status(steps: &[WorkflowStep]) -> RequestStatus {
    let next = steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .min_by_key(|s| s.step_order);
    match next {
        None => RequestStatus::Approved,
        Some(step) => status_for_step(step.step_type),
    }
}

fn status_for_step(step_type: StepType) -> RequestStatus {
    if step_type == StepType::FinanceApproval {
        RequestStatus::PendingFinanceApproval
    } else if step_type.is_project() {
        RequestStatus::PendingProjectApproval
    } else {
        RequestStatus::PendingDepartmentApproval
    }
}

// The approve selection rule: a pending step bound to this identity, or the
// role-bound finance step when acting as Finance or Admin. Lowest order wins
// when the same identity holds several steps.
fn select_step(steps: &[WorkflowStep], actor_id: &str, actor_role: Role) -> Option<usize> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status == StepStatus::Pending)
        .filter(|(_, s)| match &s.approver {
            Approver::Identity(id) => id == actor_id,
            Approver::Role(role_name) => {
                s.step_type == StepType::FinanceApproval
                    && role_name == FINANCE_ROLE
                    && matches!(actor_role, Role::Finance | Role::Admin)
            }
        })
        .min_by_key(|(_, s)| s.step_order)
        .map(|(idx, _)| idx)
}

/// Apply one approval. Mutates exactly one step, re-derives the aggregate
/// status, appends history, and reports the budget allocation to perform
/// (first project-manager approval on a costed, project-backed request).
pub fn apply_approval(
    request: &mut Request,
    actor_id: &str,
    actor_role: Role,
    now: TimeStamp<Utc>,
) -> Result<Option<BudgetAction>, WorkflowError> {
    let status = request.status;
    let Some(selected) = select_step(&request.steps, actor_id, actor_role) else {
        // a rejected/cancelled/paid request keeps no actionable steps; a
        // fully approved one simply has nothing left to match
        if matches!(
            status,
            RequestStatus::Rejected | RequestStatus::Cancelled | RequestStatus::Paid
        ) {
            return Err(WorkflowError::TerminalState {
                id: request.request_id.clone(),
                status: status.to_string(),
            });
        }
        return Err(WorkflowError::NoPendingStepForActor {
            actor_id: actor_id.to_string(),
        });
    };
    if status.is_terminal() {
        return Err(WorkflowError::TerminalState {
            id: request.request_id.clone(),
            status: status.to_string(),
        });
    }

    let step = &mut request.steps[selected];
    step.status = StepStatus::Approved;
    step.approved_by = Some(actor_id.to_string());
    step.approved_at = Some(now.clone());
    let approved_type = step.step_type;

    let next_status = derive_status(&request.steps);
    request.status = next_status;
    request.push_history(next_status, now, actor_id, actor_role.as_str(), None);

    let action = match (approved_type, request.project_id(), request.cost()) {
        (StepType::ProjectManager, Some(project_id), cost) if cost > 0 => {
            Some(BudgetAction::Allocate {
                project_id: project_id.to_string(),
                amount: cost,
            })
        }
        _ => None,
    };
    Ok(action)
}

/// Apply one rejection. Only the current step transitions (to Rejected);
/// later steps stay Pending and are fenced off by the terminal status. Any
/// open allocation for the request must be released by the caller.
pub fn apply_rejection(
    request: &mut Request,
    actor_id: &str,
    actor_role: Role,
    custom_status: Option<&str>,
    reason: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Option<BudgetAction>, WorkflowError> {
    if request.status.is_terminal() {
        return Err(WorkflowError::TerminalState {
            id: request.request_id.clone(),
            status: request.status.to_string(),
        });
    }
    let Some(current) = request.current_step() else {
        return Err(WorkflowError::NoPendingStepForActor {
            actor_id: actor_id.to_string(),
        });
    };
    if !can_act(current, actor_id, actor_role) {
        return Err(WorkflowError::NoPendingStepForActor {
            actor_id: actor_id.to_string(),
        });
    }

    // unknown custom statuses silently fall back to Rejected; historical
    // behavior, kept observable through the warning
    let new_status = match custom_status {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("invalid custom status {raw:?}, falling back to Rejected");
            RequestStatus::Rejected
        }),
        None => RequestStatus::Rejected,
    };

    let current_order = current.step_order;
    // at most one step leaves Pending per action; later steps stay Pending
    // behind the terminal status
    if let Some(step) = request
        .steps
        .iter_mut()
        .find(|s| s.step_order == current_order)
    {
        step.status = StepStatus::Rejected;
        step.approved_by = Some(actor_id.to_string());
        step.approved_at = Some(now.clone());
    }

    request.status = new_status;
    request.push_history(new_status, now, actor_id, actor_role.as_str(), reason);

    let action = match (request.project_id(), request.cost()) {
        (Some(project_id), cost) if cost > 0 => Some(BudgetAction::ReleaseAllocation {
            project_id: project_id.to_string(),
        }),
        _ => None,
    };
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip::TripDetails;

    fn request(steps: Vec<WorkflowStep>) -> Request {
        let status = derive_status(&steps);
        Request {
            request_id: "trip_test".into(),
            details: TripDetails::new()
                .set_requester("user_r")
                .set_project("proj_a")
                .set_cost(100),
            status,
            steps,
            history: vec![],
            submitted_at: TimeStamp::new(),
        }
    }

    fn project_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new(1, StepType::ProjectManager, Approver::Identity("pm_1".into()), true),
            WorkflowStep::new(2, StepType::SecondProjectManager, Approver::Identity("pm_2".into()), true),
            WorkflowStep::new(3, StepType::FinanceApproval, Approver::Role(FINANCE_ROLE.into()), true),
        ]
    }

    #[test]
    fn first_project_manager_approval_allocates() {
        let mut req = request(project_steps());
        let action = apply_approval(&mut req, "pm_1", Role::Manager, TimeStamp::new()).unwrap();

        assert_eq!(
            action,
            Some(BudgetAction::Allocate {
                project_id: "proj_a".into(),
                amount: 100
            })
        );
        assert_eq!(req.status, RequestStatus::PendingProjectApproval);
        assert_eq!(req.steps[0].status, StepStatus::Approved);
        assert_eq!(req.steps[0].approved_by.as_deref(), Some("pm_1"));
    }

    #[test]
    fn second_project_manager_approval_does_not_allocate() {
        let mut req = request(project_steps());
        apply_approval(&mut req, "pm_1", Role::Manager, TimeStamp::new()).unwrap();
        let action = apply_approval(&mut req, "pm_2", Role::Manager, TimeStamp::new()).unwrap();

        assert_eq!(action, None);
        assert_eq!(req.status, RequestStatus::PendingFinanceApproval);
    }

    #[test]
    fn finance_approval_completes_the_request() {
        let mut req = request(project_steps());
        apply_approval(&mut req, "pm_1", Role::Manager, TimeStamp::new()).unwrap();
        apply_approval(&mut req, "pm_2", Role::Manager, TimeStamp::new()).unwrap();
        let action = apply_approval(&mut req, "fin_1", Role::Finance, TimeStamp::new()).unwrap();

        assert_eq!(action, None);
        assert_eq!(req.status, RequestStatus::Approved);
        assert_eq!(req.history.len(), 3);
    }

    #[test]
    fn wrong_actor_gets_no_pending_step() {
        let mut req = request(project_steps());
        let err = apply_approval(&mut req, "stranger", Role::Manager, TimeStamp::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::NoPendingStepForActor { .. }));
    }

    #[test]
    fn fully_approved_request_yields_no_pending_step() {
        let mut req = request(project_steps());
        apply_approval(&mut req, "pm_1", Role::Manager, TimeStamp::new()).unwrap();
        apply_approval(&mut req, "pm_2", Role::Manager, TimeStamp::new()).unwrap();
        apply_approval(&mut req, "fin_1", Role::Finance, TimeStamp::new()).unwrap();

        let err = apply_approval(&mut req, "fin_1", Role::Finance, TimeStamp::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::NoPendingStepForActor { .. }));
    }

    #[test]
    fn rejected_request_is_terminal_for_both_actions() {
        let mut req = request(project_steps());
        apply_approval(&mut req, "pm_1", Role::Manager, TimeStamp::new()).unwrap();
        let action =
            apply_rejection(&mut req, "pm_2", Role::Manager, None, None, TimeStamp::new()).unwrap();

        assert_eq!(
            action,
            Some(BudgetAction::ReleaseAllocation {
                project_id: "proj_a".into()
            })
        );
        assert_eq!(req.status, RequestStatus::Rejected);
        assert_eq!(req.steps[1].status, StepStatus::Rejected);
        // later steps stay Pending; the terminal status fences them off
        assert_eq!(req.steps[2].status, StepStatus::Pending);

        let err = apply_approval(&mut req, "pm_2", Role::Manager, TimeStamp::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::TerminalState { .. }));
        let err = apply_rejection(&mut req, "pm_2", Role::Manager, None, None, TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TerminalState { .. }));
    }

    #[test]
    fn reject_with_cancelled_custom_status() {
        let mut req = request(project_steps());
        let _ = apply_rejection(
            &mut req,
            "pm_1",
            Role::Manager,
            Some("Cancelled"),
            Some("traveller withdrew".into()),
            TimeStamp::new(),
        )
        .unwrap();

        assert_eq!(req.status, RequestStatus::Cancelled);
        assert_eq!(
            req.history.last().unwrap().reason.as_deref(),
            Some("traveller withdrew")
        );
    }

    #[test]
    fn reject_with_invalid_custom_status_falls_back() {
        let mut req = request(project_steps());
        let _ = apply_rejection(
            &mut req,
            "pm_1",
            Role::Manager,
            Some("Vetoed"),
            None,
            TimeStamp::new(),
        )
        .unwrap();
        assert_eq!(req.status, RequestStatus::Rejected);
    }

    #[test]
    fn reject_requires_authority_over_current_step() {
        let mut req = request(project_steps());
        let err = apply_rejection(&mut req, "pm_2", Role::Employee, None, None, TimeStamp::new())
            .unwrap_err();
        // pm_2 holds step 2, but the current step is pm_1's
        assert!(matches!(err, WorkflowError::NoPendingStepForActor { .. }));

        // admin may reject at any stage
        apply_rejection(&mut req, "admin_1", Role::Admin, None, None, TimeStamp::new()).unwrap();
        assert_eq!(req.status, RequestStatus::Rejected);
    }

    #[test]
    fn advancement_ignores_is_required() {
        // optional second step must still be visited before the required
        // third; ordering is the only tie-break
        let mut steps = vec![
            WorkflowStep::new(1, StepType::DepartmentManager, Approver::Identity("m1".into()), true),
            WorkflowStep::new(2, StepType::SecondDepartmentManager, Approver::Identity("m2".into()), false),
            WorkflowStep::new(3, StepType::TertiaryDepartmentManager, Approver::Identity("m3".into()), true),
            WorkflowStep::new(4, StepType::FinanceApproval, Approver::Role(FINANCE_ROLE.into()), true),
        ];
        steps[0].status = StepStatus::Approved;
        assert_eq!(derive_status(&steps), RequestStatus::PendingDepartmentApproval);

        let mut req = request(steps);
        apply_approval(&mut req, "m2", Role::Manager, TimeStamp::new()).unwrap();
        assert_eq!(req.status, RequestStatus::PendingDepartmentApproval);
        assert_eq!(req.current_step().unwrap().step_order, 3);
    }
}
