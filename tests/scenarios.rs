//! End-to-end workflow scenarios against a real sled store

use anyhow::Context;
use std::sync::Arc;
use tempfile::tempdir;
use trip_approval::{
    audit::{AuditSink, LogAudit},
    hierarchy::{Department, Project, Role, StaticHierarchy},
    ledger::EntryType,
    service::ApprovalService,
    trip::{TripCategory, TripDetails},
    workflow::RequestStatus,
};

// Sled uses file-based locking to prevent concurrent access, so each test
// gets its own database on temp for simplified cleanup.
fn service(db_name: &str) -> anyhow::Result<(tempfile::TempDir, ApprovalService)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(db_name))?;
    let db = Arc::new(db);

    let hierarchy = Arc::new(StaticHierarchy::new(50));
    hierarchy.insert_department(Department {
        id: "dept_ops".into(),
        manager_id: Some("mgr_1".into()),
        second_manager_id: Some("mgr_2".into()),
        third_manager_id: Some("mgr_3".into()),
        parent_id: None,
    });
    hierarchy.insert_project(Project {
        id: "proj_a".into(),
        manager_id: Some("pm_1".into()),
        second_manager_id: Some("pm_2".into()),
    });

    let service = ApprovalService::new(db, hierarchy, Arc::new(LogAudit))?;
    Ok((temp_dir, service))
}

fn project_trip(cost: u64) -> TripDetails {
    TripDetails::new()
        .set_requester("user_req")
        .set_project("proj_a")
        .set_cost(cost)
}

/// Scenario A: project-backed request, cost 100 against a budget of 500.
/// Allocation happens on the first project-manager approval only.
#[test]
fn project_request_allocates_once_through_full_approval() -> anyhow::Result<()> {
    let (_dir, service) = service("scenario_a.db")?;
    service.open_project("proj_a", 500, "admin_1")?;

    let request = service
        .submit(project_trip(100))
        .context("Trip failed on submit: ")?;
    assert_eq!(request.status, RequestStatus::PendingProjectApproval);

    // first project manager approves: allocation entry, running balance 400
    let request = service.approve(&request.request_id, "pm_1", Role::Manager)?;
    assert_eq!(request.status, RequestStatus::PendingProjectApproval);

    let entries = service.ledger().entries("proj_a")?;
    assert_eq!(entries.len(), 2); // initial + allocation
    let alloc = entries.last().unwrap();
    assert_eq!(alloc.entry_type, EntryType::Allocation);
    assert_eq!(alloc.amount, 100);
    assert_eq!(alloc.running_balance, 400);
    assert_eq!(alloc.reference_id.as_deref(), Some(request.request_id.as_str()));

    // second project manager approves: no new allocation
    let request = service.approve(&request.request_id, "pm_2", Role::Manager)?;
    assert_eq!(request.status, RequestStatus::PendingFinanceApproval);
    assert_eq!(service.ledger().entries("proj_a")?.len(), 2);

    // finance approves: terminal, no ledger change
    let request = service.approve(&request.request_id, "fin_1", Role::Finance)?;
    assert_eq!(request.status, RequestStatus::Approved);
    assert_eq!(service.ledger().entries("proj_a")?.len(), 2);
    assert_eq!(service.ledger().available("proj_a")?, 400);

    Ok(())
}

/// Scenario B: rejection after allocation writes one full-amount
/// deallocation, restoring availability.
#[test]
fn rejection_after_allocation_releases_the_funds() -> anyhow::Result<()> {
    let (_dir, service) = service("scenario_b.db")?;
    service.open_project("proj_a", 500, "admin_1")?;

    let request = service.submit(project_trip(100))?;
    let request = service.approve(&request.request_id, "pm_1", Role::Manager)?;
    let request = service.approve(&request.request_id, "pm_2", Role::Manager)?;

    let request = service.reject(
        &request.request_id,
        "fin_1",
        Role::Finance,
        None,
        Some("insufficient justification".into()),
    )?;
    assert_eq!(request.status, RequestStatus::Rejected);

    let entries = service.ledger().entries("proj_a")?;
    let dealloc = entries.last().unwrap();
    assert_eq!(dealloc.entry_type, EntryType::Deallocation);
    assert_eq!(dealloc.amount, 100);
    assert_eq!(dealloc.running_balance, 500);
    assert_eq!(service.ledger().available("proj_a")?, 500);

    // terminal immutability: nothing moves anymore
    assert!(service.approve(&request.request_id, "fin_1", Role::Finance).is_err());
    assert!(service
        .reject(&request.request_id, "fin_1", Role::Finance, None, None)
        .is_err());

    Ok(())
}

/// Scenario C: urgent request without a project goes straight to finance
/// and carries the bypass marker in its history.
#[test]
fn urgent_request_bypasses_department_review() -> anyhow::Result<()> {
    let (_dir, service) = service("scenario_c.db")?;

    let request = service.submit(
        TripDetails::new()
            .set_requester("user_req")
            .set_cost(40)
            .set_urgent(true),
    )?;

    assert_eq!(request.steps.len(), 1);
    assert_eq!(request.status, RequestStatus::PendingFinanceApproval);

    let bypass = request
        .history
        .iter()
        .find(|h| h.reason.as_deref().is_some_and(|r| r.contains("bypassed")))
        .expect("bypass marker in history");
    assert!(bypass.timestamp > request.submitted_at);

    let request = service.approve(&request.request_id, "fin_1", Role::Finance)?;
    assert_eq!(request.status, RequestStatus::Approved);

    Ok(())
}

/// Department route with all three managers and a long distance-billed
/// trip: four steps, acted in step order regardless of is_required.
#[test]
fn department_route_advances_in_step_order() -> anyhow::Result<()> {
    let (_dir, service) = service("dept_route.db")?;

    let request = service.submit(
        TripDetails::new()
            .set_requester("user_req")
            .set_department("dept_ops")
            .set_kilometers(80)
            .set_category(TripCategory::DistanceBilled)
            .set_cost(60),
    )?;
    assert_eq!(request.steps.len(), 4);
    assert_eq!(request.status, RequestStatus::PendingDepartmentApproval);

    let request = service.approve(&request.request_id, "mgr_1", Role::Manager)?;
    // the optional second step is still visited before the required third
    let request = service.approve(&request.request_id, "mgr_2", Role::Manager)?;
    assert_eq!(request.status, RequestStatus::PendingDepartmentApproval);
    let request = service.approve(&request.request_id, "mgr_3", Role::Manager)?;
    assert_eq!(request.status, RequestStatus::PendingFinanceApproval);
    let request = service.approve(&request.request_id, "fin_1", Role::Finance)?;
    assert_eq!(request.status, RequestStatus::Approved);

    Ok(())
}

/// Approved -> Paid feeds spent totals and utilization; the allocation
/// ledger is untouched by payment.
#[test]
fn paid_requests_drive_spent_and_utilization() -> anyhow::Result<()> {
    let (_dir, service) = service("paid_flow.db")?;
    service.open_project("proj_a", 500, "admin_1")?;

    let request = service.submit(project_trip(100))?;
    service.approve(&request.request_id, "pm_1", Role::Manager)?;
    service.approve(&request.request_id, "pm_2", Role::Manager)?;
    service.approve(&request.request_id, "fin_1", Role::Finance)?;

    // only finance/admin may pay, and only approved requests
    assert!(service.mark_paid(&request.request_id, "pm_1", Role::Manager).is_err());
    let request = service.mark_paid(&request.request_id, "fin_1", Role::Finance)?;
    assert_eq!(request.status, RequestStatus::Paid);
    assert!(service.mark_paid(&request.request_id, "fin_1", Role::Finance).is_err());

    let snapshot = service.project_budget_snapshot("proj_a")?;
    assert_eq!(snapshot.original_budget, 500);
    assert_eq!(snapshot.effective_budget, 500);
    assert_eq!(snapshot.allocated, 100);
    assert_eq!(snapshot.spent, 100);
    assert_eq!(snapshot.available, 400);
    assert!((snapshot.utilization - 20.0).abs() < f64::EPSILON);

    Ok(())
}

/// Cancellation is an ordinary terminal rejection with the standard
/// deallocation trigger, not a distinct protocol.
#[test]
fn cancellation_releases_allocation_like_any_rejection() -> anyhow::Result<()> {
    let (_dir, service) = service("cancel.db")?;
    service.open_project("proj_a", 500, "admin_1")?;

    let request = service.submit(project_trip(100))?;
    service.approve(&request.request_id, "pm_1", Role::Manager)?;

    let request = service.reject(
        &request.request_id,
        "admin_1",
        Role::Admin,
        Some("Cancelled"),
        Some("traveller withdrew".into()),
    )?;
    assert_eq!(request.status, RequestStatus::Cancelled);
    assert_eq!(service.ledger().available("proj_a")?, 500);
    assert_eq!(
        service.ledger().open_allocation("proj_a", &request.request_id)?,
        None
    );

    Ok(())
}

/// An unknown custom status silently falls back to Rejected.
#[test]
fn invalid_custom_status_falls_back_to_rejected() -> anyhow::Result<()> {
    let (_dir, service) = service("custom_status.db")?;

    let request = service.submit(
        TripDetails::new()
            .set_requester("user_req")
            .set_cost(10)
            .set_urgent(true),
    )?;
    let request =
        service.reject(&request.request_id, "fin_1", Role::Finance, Some("Vetoed"), None)?;
    assert_eq!(request.status, RequestStatus::Rejected);

    Ok(())
}

/// A broken audit sink never blocks the workflow transition.
#[test]
fn audit_failures_are_swallowed() -> anyhow::Result<()> {
    struct BrokenAudit;
    impl AuditSink for BrokenAudit {
        fn record(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("audit store down")
        }
    }

    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("audit_down.db"))?);
    let hierarchy = Arc::new(StaticHierarchy::new(50));
    hierarchy.insert_project(Project {
        id: "proj_a".into(),
        manager_id: Some("pm_1".into()),
        second_manager_id: None,
    });
    let service = ApprovalService::new(db, hierarchy, Arc::new(BrokenAudit))?;
    service.open_project("proj_a", 500, "admin_1")?;

    let request = service.submit(project_trip(100))?;
    let request = service.approve(&request.request_id, "pm_1", Role::Manager)?;
    assert_eq!(request.status, RequestStatus::PendingFinanceApproval);
    assert_eq!(service.ledger().available("proj_a")?, 400);

    Ok(())
}

/// Requests survive a reload from the store with steps and history intact.
#[test]
fn request_round_trips_through_the_store() -> anyhow::Result<()> {
    let (_dir, service) = service("reload.db")?;
    service.open_project("proj_a", 500, "admin_1")?;

    let submitted = service.submit(project_trip(100))?;
    service.approve(&submitted.request_id, "pm_1", Role::Manager)?;

    let reloaded = service.request(&submitted.request_id)?;
    assert_eq!(reloaded.request_id, submitted.request_id);
    assert_eq!(reloaded.steps.len(), 3);
    assert_eq!(reloaded.status, RequestStatus::PendingProjectApproval);
    assert_eq!(reloaded.history.len(), 2);

    Ok(())
}
