//! Service layer API for trip approval operations
//!
//! [`ApprovalService`] is the transaction coordinator: every submit,
//! approve or reject runs serialized per request id and covers the step
//! mutation, status derivation, ledger mutation and persistence as one
//! unit, followed by a best-effort audit record.
use super::audit::AuditSink;
use super::engine::{self, BudgetAction};
use super::error::WorkflowError;
use super::hierarchy::{HierarchySnapshot, Role};
use super::ledger::{Affordability, BudgetLedger, LedgerEntry};
use super::planner;
use super::trip::{TimeStamp, TripDetails};
use super::utils;
use super::visibility;
use super::workflow::{Request, RequestStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const REQUESTS_TREE: &str = "requests";

/// Point-in-time budget picture for one project.
#[derive(Debug, Clone)]
pub struct BudgetSnapshot {
    pub original_budget: u64,
    pub effective_budget: i64,
    pub allocated: i64,
    pub spent: u64,
    pub available: i64,
    pub utilization: f64, // spent as a percentage of effective budget
}

pub struct ApprovalService {
    requests: sled::Tree,
    ledger: BudgetLedger,
    hierarchy: Arc<dyn HierarchySnapshot>,
    audit: Arc<dyn AuditSink>,
    // serializes approve/reject per request id so two racing approvals
    // cannot both observe the same pending step
    request_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApprovalService {
    pub fn new(
        db: Arc<sled::Db>,
        hierarchy: Arc<dyn HierarchySnapshot>,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            requests: db.open_tree(REQUESTS_TREE)?,
            ledger: BudgetLedger::new(&db)?,
            hierarchy,
            audit,
            request_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    fn lock_for(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.request_locks.lock().unwrap();
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // audit failures never block or roll back the transition
    fn record_audit(&self, actor_id: &str, action: &str, details: &str) {
        if let Err(err) = self.audit.record(actor_id, action, details) {
            log::warn!("audit record failed for {action} by {actor_id}: {err:#}");
        }
    }

    /// Load a request from the store
    pub fn request(&self, request_id: &str) -> anyhow::Result<Request> {
        Request::load(&self.requests, request_id)
    }

    /// Submit a new trip request: plans the full step list, derives the
    /// initial status and writes the request with its synthesized history.
    pub fn submit(&self, details: TripDetails) -> anyhow::Result<Request> {
        details.validate_and_finalise()?;

        let submitted_at = TimeStamp::new();
        let plan = planner::plan(&details, self.hierarchy.as_ref(), &submitted_at)?;
        let request = Request {
            request_id: utils::new_uuid_to_bech32("trip_")?,
            details,
            status: plan.initial_status,
            steps: plan.steps,
            history: plan.history,
            submitted_at,
        };
        request.save(&self.requests)?;

        log::info!(
            "submitted {} with {} steps, status {}",
            request.request_id,
            request.steps.len(),
            request.status
        );
        self.record_audit(
            request.requester_id(),
            "submit",
            &format!("{} ({})", request.request_id, request.status),
        );
        Ok(request)
    }

    /// Approve the current step as the given actor.
    pub fn approve(
        &self,
        request_id: &str,
        actor_id: &str,
        actor_role: Role,
    ) -> anyhow::Result<Request> {
        let guard = self.lock_for(request_id);
        let _held = guard.lock().unwrap();

        let mut request = Request::load(&self.requests, request_id)?;
        let action = engine::apply_approval(&mut request, actor_id, actor_role, TimeStamp::new())?;

        // ledger first: a failed ledger write aborts before the request is
        // persisted, so no partially-applied state survives
        if let Some(BudgetAction::Allocate { project_id, amount }) = action {
            // never double-allocate for the same request
            if self.ledger.open_allocation(&project_id, request_id)?.is_none() {
                self.ledger.allocate(
                    &project_id,
                    amount,
                    request_id,
                    "trip cost allocation",
                    actor_id,
                )?;
                if let Err(err) = request.save(&self.requests) {
                    // request persist failed after the allocation landed;
                    // reverse it so the ledger stays consistent
                    let _ = self.ledger.deallocate(
                        &project_id,
                        amount,
                        request_id,
                        "allocation reversed: request persist failed",
                        actor_id,
                    );
                    return Err(err);
                }
            } else {
                request.save(&self.requests)?;
            }
        } else {
            request.save(&self.requests)?;
        }

        log::info!("approved step on {request_id} by {actor_id}, status {}", request.status);
        self.record_audit(
            actor_id,
            "approve",
            &format!("{request_id} -> {}", request.status),
        );
        Ok(request)
    }

    /// Reject the request, releasing any open allocation in full. An
    /// unknown `custom_status` falls back to `Rejected`.
    pub fn reject(
        &self,
        request_id: &str,
        actor_id: &str,
        actor_role: Role,
        custom_status: Option<&str>,
        reason: Option<String>,
    ) -> anyhow::Result<Request> {
        let guard = self.lock_for(request_id);
        let _held = guard.lock().unwrap();

        let mut request = Request::load(&self.requests, request_id)?;
        let action = engine::apply_rejection(
            &mut request,
            actor_id,
            actor_role,
            custom_status,
            reason,
            TimeStamp::new(),
        )?;

        if let Some(BudgetAction::ReleaseAllocation { project_id }) = action {
            // the reversal is independent of which stage rejected; it only
            // depends on an allocation being open
            if let Some(amount) = self.ledger.open_allocation(&project_id, request_id)? {
                self.ledger.deallocate(
                    &project_id,
                    amount,
                    request_id,
                    "trip rejected",
                    actor_id,
                )?;
            }
        }
        request.save(&self.requests)?;

        log::info!("rejected {request_id} by {actor_id}, status {}", request.status);
        self.record_audit(
            actor_id,
            "reject",
            &format!("{request_id} -> {}", request.status),
        );
        Ok(request)
    }

    /// Mark an approved request as paid. Paid requests feed spent totals
    /// and utilization; the allocation ledger is untouched.
    pub fn mark_paid(
        &self,
        request_id: &str,
        actor_id: &str,
        actor_role: Role,
    ) -> anyhow::Result<Request> {
        let guard = self.lock_for(request_id);
        let _held = guard.lock().unwrap();

        if !matches!(actor_role, Role::Finance | Role::Admin) {
            return Err(WorkflowError::NoPendingStepForActor {
                actor_id: actor_id.to_string(),
            }
            .into());
        }
        let mut request = Request::load(&self.requests, request_id)?;
        if request.status != RequestStatus::Approved {
            return Err(WorkflowError::TerminalState {
                id: request_id.to_string(),
                status: request.status.to_string(),
            }
            .into());
        }
        request.status = RequestStatus::Paid;
        request.push_history(
            RequestStatus::Paid,
            TimeStamp::new(),
            actor_id,
            actor_role.as_str(),
            None,
        );
        request.save(&self.requests)?;

        self.record_audit(actor_id, "mark_paid", request_id);
        Ok(request)
    }

    /// Register a project's budget with the ledger.
    pub fn open_project(
        &self,
        project_id: &str,
        original_budget: u64,
        actor_id: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let entry = self.ledger.open_project(project_id, original_budget, actor_id)?;
        self.record_audit(actor_id, "open_project", project_id);
        Ok(entry)
    }

    /// Manual budget adjustment.
    pub fn record_adjustment(
        &self,
        project_id: &str,
        amount: i64,
        description: &str,
        actor_id: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let entry = self.ledger.adjust(project_id, amount, description, actor_id)?;
        self.record_audit(actor_id, "record_adjustment", &format!("{project_id} {amount:+}"));
        Ok(entry)
    }

    /// Affordability pre-check callers run before approving a
    /// project-manager step. May be stale under concurrent writers.
    pub fn check_affordability(
        &self,
        project_id: &str,
        cost: u64,
        exclude_reference: Option<&str>,
    ) -> anyhow::Result<Affordability> {
        self.ledger.check_affordability(project_id, cost, exclude_reference)
    }

    /// Sum of cost over paid requests for the project. Independent of the
    /// allocation ledger; used only for utilization reporting.
    pub fn spent_total(&self, project_id: &str) -> anyhow::Result<u64> {
        let mut spent = 0u64;
        for item in self.requests.iter() {
            let (_, value) = item?;
            let request: Request = minicbor::decode(&value)?;
            if request.status == RequestStatus::Paid && request.project_id() == Some(project_id) {
                spent += request.cost();
            }
        }
        Ok(spent)
    }

    pub fn project_budget_snapshot(&self, project_id: &str) -> anyhow::Result<BudgetSnapshot> {
        let project = self.ledger.project(project_id)?;
        let available = self.ledger.available(project_id)?;
        let allocated = self.ledger.allocated_total(project_id)?;
        let spent = self.spent_total(project_id)?;
        let effective = project.effective_budget();
        let utilization = if effective > 0 {
            spent as f64 / effective as f64 * 100.0
        } else {
            0.0
        };
        Ok(BudgetSnapshot {
            original_budget: project.original_budget,
            effective_budget: effective,
            allocated,
            spent,
            available,
            utilization,
        })
    }

    /// Requests the actor may see (inbox superset).
    pub fn visible_requests(&self, actor_id: &str) -> anyhow::Result<Vec<Request>> {
        visibility::visible_requests(&self.requests, self.hierarchy.as_ref(), actor_id)
    }

    /// Requests currently awaiting this actor's action.
    pub fn approvable_requests(
        &self,
        actor_id: &str,
        actor_role: Role,
    ) -> anyhow::Result<Vec<Request>> {
        visibility::approvable_requests(&self.requests, actor_id, actor_role)
    }
}
