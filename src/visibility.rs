//! Derived read-only views: which requests an actor sees, and which await
//! that actor's action
use super::authorize::can_act;
use super::hierarchy::{HierarchySnapshot, Role};
use super::workflow::{Approver, Request};

fn scan(tree: &sled::Tree) -> anyhow::Result<Vec<Request>> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        out.push(minicbor::decode::<Request>(&value)?);
    }
    Ok(out)
}

fn manages(request: &Request, hierarchy: &dyn HierarchySnapshot, actor_id: &str) -> bool {
    let manages_department = request
        .department_id()
        .and_then(|id| hierarchy.department(id))
        .is_some_and(|d| {
            [d.manager_id, d.second_manager_id, d.third_manager_id]
                .iter()
                .any(|m| m.as_deref() == Some(actor_id))
        });
    let manages_project = request
        .project_id()
        .and_then(|id| hierarchy.project(id))
        .is_some_and(|p| {
            [p.manager_id, p.second_manager_id]
                .iter()
                .any(|m| m.as_deref() == Some(actor_id))
        });
    manages_department || manages_project
}

/// Requests the actor may see: own submissions, requests naming the actor
/// as an approver on any step regardless of step status, and requests under
/// departments or projects the actor manages. Visibility is not
/// actionability; named approvers see requests they cannot act on yet.
pub fn visible_requests(
    tree: &sled::Tree,
    hierarchy: &dyn HierarchySnapshot,
    actor_id: &str,
) -> anyhow::Result<Vec<Request>> {
    let mut out = scan(tree)?;
    out.retain(|request| {
        request.requester_id() == actor_id
            || request
                .steps
                .iter()
                .any(|s| s.approver == Approver::Identity(actor_id.to_string()))
            || manages(request, hierarchy, actor_id)
    });
    Ok(out)
}

/// The strict "my approvals" queue: non-terminal requests whose
/// lowest-order pending step this actor may act on right now.
pub fn approvable_requests(
    tree: &sled::Tree,
    actor_id: &str,
    actor_role: Role,
) -> anyhow::Result<Vec<Request>> {
    let mut out = scan(tree)?;
    out.retain(|request| {
        !request.status.is_terminal()
            && request
                .current_step()
                .is_some_and(|step| can_act(step, actor_id, actor_role))
    });
    Ok(out)
}
