//! Workflow data model: requests, approval steps, statuses, history
use super::error::WorkflowError;
use super::trip::{TimeStamp, TripCategory, TripDetails};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

/// Who may act on a step. Identity-bound steps name one user; role-bound
/// steps accept any member of the role (only Finance today, the role name
/// is kept open for future step types).
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub enum Approver {
    #[n(0)]
    Identity(#[n(0)] String),
    #[n(1)]
    Role(#[n(0)] String),
}

pub const FINANCE_ROLE: &str = "Finance";

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum StepType {
    #[n(0)]
    DepartmentManager,
    #[n(1)]
    SecondDepartmentManager,
    #[n(2)]
    TertiaryDepartmentManager,
    #[n(3)]
    ProjectManager,
    #[n(4)]
    SecondProjectManager,
    #[n(5)]
    FinanceApproval,
}

impl StepType {
    pub fn is_project(&self) -> bool {
        matches!(self, StepType::ProjectManager | StepType::SecondProjectManager)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum StepStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Skipped,
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct WorkflowStep {
    #[n(0)]
    pub step_order: u32, // 1-based, contiguous within a request
    #[n(1)]
    pub step_type: StepType,
    #[n(2)]
    pub approver: Approver,
    #[n(3)]
    pub status: StepStatus,
    #[n(4)]
    pub approved_by: Option<String>,
    #[n(5)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub is_required: bool, // informational only, never drives step selection
}

impl WorkflowStep {
    pub fn new(step_order: u32, step_type: StepType, approver: Approver, is_required: bool) -> Self {
        Self {
            step_order,
            step_type,
            approver,
            status: StepStatus::Pending,
            approved_by: None,
            approved_at: None,
            is_required,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    PendingDepartmentApproval,
    #[n(1)]
    PendingProjectApproval,
    #[n(2)]
    PendingFinanceApproval,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Paid,
    #[n(6)]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved
                | RequestStatus::Rejected
                | RequestStatus::Paid
                | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::PendingDepartmentApproval => "PendingDepartmentApproval",
            RequestStatus::PendingProjectApproval => "PendingProjectApproval",
            RequestStatus::PendingFinanceApproval => "PendingFinanceApproval",
            RequestStatus::Approved => "Approved",
            RequestStatus::Rejected => "Rejected",
            RequestStatus::Paid => "Paid",
            RequestStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl FromStr for RequestStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PendingDepartmentApproval" => Ok(RequestStatus::PendingDepartmentApproval),
            "PendingProjectApproval" => Ok(RequestStatus::PendingProjectApproval),
            "PendingFinanceApproval" => Ok(RequestStatus::PendingFinanceApproval),
            "Approved" => Ok(RequestStatus::Approved),
            "Rejected" => Ok(RequestStatus::Rejected),
            "Paid" => Ok(RequestStatus::Paid),
            "Cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(WorkflowError::Validation(format!(
                "unknown request status: {other}"
            ))),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct HistoryEntry {
    #[n(0)]
    pub status: RequestStatus,
    #[n(1)]
    pub timestamp: TimeStamp<Utc>,
    #[n(2)]
    pub actor_id: String,
    #[n(3)]
    pub actor_role: String,
    #[n(4)]
    pub reason: Option<String>,
}

/// One trip request with its embedded step list and status history.
/// Persisted as a single CBOR record, so every approve/reject mutation of
/// steps + status + history lands in one sled write.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct Request {
    #[n(0)]
    pub request_id: String, // uuid7, bech32 encoded
    #[n(1)]
    pub details: TripDetails,
    #[n(2)]
    pub status: RequestStatus,
    #[n(3)]
    pub steps: Vec<WorkflowStep>,
    #[n(4)]
    pub history: Vec<HistoryEntry>,
    #[n(5)]
    pub submitted_at: TimeStamp<Utc>,
}

impl Request {
    pub fn requester_id(&self) -> &str {
        self.details.requester_id().unwrap_or_default()
    }
    pub fn project_id(&self) -> Option<&str> {
        self.details.project_id()
    }
    pub fn department_id(&self) -> Option<&str> {
        self.details.department_id()
    }
    pub fn cost(&self) -> u64 {
        self.details.cost()
    }
    pub fn category(&self) -> TripCategory {
        self.details.category()
    }

    /// The lowest-order Pending step, the only one an actor may act on next.
    pub fn current_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .min_by_key(|s| s.step_order)
    }

    pub fn push_history(
        &mut self,
        status: RequestStatus,
        timestamp: TimeStamp<Utc>,
        actor_id: &str,
        actor_role: &str,
        reason: Option<String>,
    ) {
        self.history.push(HistoryEntry {
            status,
            timestamp,
            actor_id: actor_id.to_string(),
            actor_role: actor_role.to_string(),
            reason,
        });
    }

    /// Load a request from the given tree
    pub fn load(tree: &sled::Tree, request_id: &str) -> anyhow::Result<Self> {
        let bytes = tree
            .get(request_id.as_bytes())?
            .ok_or_else(|| WorkflowError::RequestNotFound(request_id.to_string()))?;
        Ok(minicbor::decode(&bytes)?)
    }

    /// Save the request back to the given tree
    pub fn save(&self, tree: &sled::Tree) -> anyhow::Result<()> {
        tree.insert(self.request_id.as_bytes(), minicbor::to_vec(self)?)?;
        Ok(())
    }
}
