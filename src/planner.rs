//! Step planning: turns a validated trip draft into the full approval plan
//!
//! Steps are created once, in full, at submission time. They are never
//! reordered or deleted afterwards; approvals only mutate them in place.
use super::error::WorkflowError;
use super::hierarchy::HierarchySnapshot;
use super::trip::{TimeStamp, TripCategory, TripDetails};
use super::workflow::{
    Approver, FINANCE_ROLE, HistoryEntry, RequestStatus, StepType, WorkflowStep,
};
use chrono::Utc;

pub const BYPASS_REASON: &str = "Department approval bypassed (urgent)";

/// Everything the engine needs to initialize a request.
#[derive(Debug)]
pub struct Plan {
    pub steps: Vec<WorkflowStep>,
    pub initial_status: RequestStatus,
    pub history: Vec<HistoryEntry>,
}

pub fn plan(
    details: &TripDetails,
    hierarchy: &dyn HierarchySnapshot,
    submitted_at: &TimeStamp<Utc>,
) -> anyhow::Result<Plan> {
    let mut steps = Vec::new();
    let mut order = 1u32;
    let mut push = |steps: &mut Vec<WorkflowStep>, step_type, approver, is_required| {
        steps.push(WorkflowStep::new(order, step_type, approver, is_required));
        order += 1;
    };

    if let Some(project_id) = details.project_id() {
        let project = hierarchy
            .project(project_id)
            .ok_or_else(|| WorkflowError::ProjectNotFound(project_id.to_string()))?;

        if let Some(manager) = project.manager_id {
            push(&mut steps, StepType::ProjectManager, Approver::Identity(manager), true);
        }
        if let Some(second) = project.second_manager_id {
            push(&mut steps, StepType::SecondProjectManager, Approver::Identity(second), true);
        }
    } else if !details.is_urgent() {
        // explicit department, or fall back to the requester's home department
        let department_id = details.department_id().map(str::to_string).or_else(|| {
            details
                .requester_id()
                .and_then(|requester| hierarchy.home_department(requester))
        });

        if let Some(department_id) = department_id {
            let department = hierarchy
                .department(&department_id)
                .ok_or_else(|| WorkflowError::DepartmentNotFound(department_id.clone()))?;

            if let Some(manager) = department.manager_id {
                push(&mut steps, StepType::DepartmentManager, Approver::Identity(manager), true);
            }
            if let Some(second) = department.second_manager_id {
                push(
                    &mut steps,
                    StepType::SecondDepartmentManager,
                    Approver::Identity(second),
                    false,
                );
            }
            let over_threshold = details
                .kilometers()
                .is_some_and(|km| km > hierarchy.kilometer_threshold());
            if over_threshold && details.category() == TripCategory::DistanceBilled {
                if let Some(third) = department.third_manager_id {
                    push(
                        &mut steps,
                        StepType::TertiaryDepartmentManager,
                        Approver::Identity(third),
                        true,
                    );
                }
            }
        }
    }
    // urgent without a project skips department review entirely

    push(
        &mut steps,
        StepType::FinanceApproval,
        Approver::Role(FINANCE_ROLE.to_string()),
        true,
    );

    let initial_status = if details.project_id().is_some() {
        RequestStatus::PendingProjectApproval
    } else if details.is_urgent() {
        RequestStatus::PendingFinanceApproval
    } else {
        RequestStatus::PendingDepartmentApproval
    };

    let requester = details.requester_id().unwrap_or_default().to_string();
    let mut history = vec![HistoryEntry {
        status: initial_status,
        timestamp: submitted_at.clone(),
        actor_id: requester.clone(),
        actor_role: "Requester".to_string(),
        reason: None,
    }];
    if details.is_urgent() {
        // synthetic marker so the audit trail shows the skipped review,
        // dated strictly after submission
        history.push(HistoryEntry {
            status: initial_status,
            timestamp: submitted_at.just_after(),
            actor_id: requester,
            actor_role: "Requester".to_string(),
            reason: Some(BYPASS_REASON.to_string()),
        });
    }

    Ok(Plan {
        steps,
        initial_status,
        history,
    })
}
