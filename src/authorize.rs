//! Step-level authorization
use super::hierarchy::Role;
use super::workflow::{Approver, FINANCE_ROLE, StepType, WorkflowStep};

/// Whether `actor_id` acting as `actor_role` may act on `step`.
///
/// Admin is an administrative override and may act on anything. Identity
/// steps require an exact id match. The role-bound Finance step accepts
/// Finance; any other role-bound combination is reserved and denied.
pub fn can_act(step: &WorkflowStep, actor_id: &str, actor_role: Role) -> bool {
    if actor_role == Role::Admin {
        return true;
    }
    match &step.approver {
        Approver::Identity(approver_id) => approver_id == actor_id,
        Approver::Role(role_name) => {
            step.step_type == StepType::FinanceApproval
                && role_name == FINANCE_ROLE
                && actor_role == Role::Finance
        }
    }
}
