//! Project budget ledger: append-only entries with running balances
//!
//! The ledger is the source of truth for available budget. There is no
//! mutable counter anywhere; availability is always
//! `effective_budget - allocations + deallocations` and can be recomputed
//! by replaying the entries of a project at any time.
use super::error::WorkflowError;
use super::trip::TimeStamp;
use chrono::Utc;
use sled::Batch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const BUDGET_TREE: &str = "budget";

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum EntryType {
    #[n(0)]
    Initial,
    #[n(1)]
    Allocation,
    #[n(2)]
    Deallocation,
    #[n(3)]
    Adjustment,
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub project_id: String,
    #[n(1)]
    pub seq: u64, // per-project, monotonic, drives key order
    #[n(2)]
    pub entry_type: EntryType,
    #[n(3)]
    pub amount: u64, // always positive, sign implied by entry_type
    #[n(4)]
    pub running_balance: i64, // available budget immediately after this entry
    #[n(5)]
    pub reference_id: Option<String>, // request that caused the entry
    #[n(6)]
    pub description: String,
    #[n(7)]
    pub created_by: String,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

/// Budget fields of a project. Manager assignments live in the hierarchy
/// snapshot; only the money is ours.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct ProjectBudget {
    #[n(0)]
    pub project_id: String,
    #[n(1)]
    pub original_budget: u64,
    #[n(2)]
    pub budget_adjustments: i64,
}

impl ProjectBudget {
    pub fn effective_budget(&self) -> i64 {
        self.original_budget as i64 + self.budget_adjustments
    }
}

#[derive(Debug, Clone)]
pub struct Affordability {
    pub can_approve: bool,
    pub excess: i64, // how far short of the cost, 0 when affordable
    pub available: i64,
    pub effective: i64,
}

impl Affordability {
    /// The guard callers run before approving a project-manager step.
    pub fn ensure(&self) -> Result<(), WorkflowError> {
        if self.can_approve {
            Ok(())
        } else {
            Err(WorkflowError::InsufficientBudget {
                excess: self.excess,
            })
        }
    }
}

pub struct BudgetLedger {
    tree: sled::Tree,
    // serializes read-tail-then-append per project; without this two
    // concurrent allocations both compute a stale running balance
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

// project record lives at `{project_id}`, entries at `{project_id}/{seq}`,
// all in one tree so a Batch covers both atomically
fn entry_key(project_id: &str, seq: u64) -> String {
    format!("{project_id}/{seq:010}")
}

impl BudgetLedger {
    pub fn new(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree(BUDGET_TREE)?,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn project(&self, project_id: &str) -> anyhow::Result<ProjectBudget> {
        let bytes = self
            .tree
            .get(project_id.as_bytes())?
            .ok_or_else(|| WorkflowError::ProjectNotFound(project_id.to_string()))?;
        Ok(minicbor::decode(&bytes)?)
    }

    /// All entries for a project in write order.
    pub fn entries(&self, project_id: &str) -> anyhow::Result<Vec<LedgerEntry>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(format!("{project_id}/").as_bytes()) {
            let (_, value) = item?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    fn replay(&self, project_id: &str) -> anyhow::Result<(ProjectBudget, Vec<LedgerEntry>, i64)> {
        let project = self.project(project_id)?;
        let entries = self.entries(project_id)?;
        let mut available = project.effective_budget();
        for entry in &entries {
            match entry.entry_type {
                EntryType::Allocation => available -= entry.amount as i64,
                EntryType::Deallocation => available += entry.amount as i64,
                EntryType::Initial | EntryType::Adjustment => {}
            }
        }
        Ok((project, entries, available))
    }

    /// Register a project with the ledger, writing its Initial entry.
    pub fn open_project(
        &self,
        project_id: &str,
        original_budget: u64,
        created_by: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let guard = self.lock_for(project_id);
        let _held = guard.lock().unwrap();

        let project = ProjectBudget {
            project_id: project_id.to_string(),
            original_budget,
            budget_adjustments: 0,
        };
        let entry = LedgerEntry {
            project_id: project_id.to_string(),
            seq: 0,
            entry_type: EntryType::Initial,
            amount: original_budget,
            running_balance: original_budget as i64,
            reference_id: None,
            description: "initial budget".to_string(),
            created_by: created_by.to_string(),
            created_at: TimeStamp::new(),
        };

        let mut batch = Batch::default();
        batch.insert(project_id.as_bytes(), minicbor::to_vec(&project)?);
        batch.insert(
            entry_key(project_id, entry.seq).as_bytes(),
            minicbor::to_vec(&entry)?,
        );
        self.tree.apply_batch(batch)?;

        log::info!("opened project {project_id} with budget {original_budget}");
        Ok(entry)
    }

    /// Reserve budget against a request's cost. Does not reject
    /// over-allocation; callers pre-check through [`check_affordability`]
    /// under their own serialization.
    ///
    /// [`check_affordability`]: BudgetLedger::check_affordability
    pub fn allocate(
        &self,
        project_id: &str,
        amount: u64,
        reference_id: &str,
        description: &str,
        created_by: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let guard = self.lock_for(project_id);
        let _held = guard.lock().unwrap();

        let (_, entries, available) = self.replay(project_id)?;
        let entry = LedgerEntry {
            project_id: project_id.to_string(),
            seq: entries.last().map_or(0, |e| e.seq + 1),
            entry_type: EntryType::Allocation,
            amount,
            running_balance: available - amount as i64,
            reference_id: Some(reference_id.to_string()),
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at: TimeStamp::new(),
        };
        self.tree.insert(
            entry_key(project_id, entry.seq).as_bytes(),
            minicbor::to_vec(&entry)?,
        )?;

        log::info!("allocated {amount} on {project_id} for {reference_id}");
        Ok(entry)
    }

    /// Reverse a prior allocation in full.
    pub fn deallocate(
        &self,
        project_id: &str,
        amount: u64,
        reference_id: &str,
        description: &str,
        created_by: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let guard = self.lock_for(project_id);
        let _held = guard.lock().unwrap();

        let (_, entries, available) = self.replay(project_id)?;
        let entry = LedgerEntry {
            project_id: project_id.to_string(),
            seq: entries.last().map_or(0, |e| e.seq + 1),
            entry_type: EntryType::Deallocation,
            amount,
            running_balance: available + amount as i64,
            reference_id: Some(reference_id.to_string()),
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at: TimeStamp::new(),
        };
        self.tree.insert(
            entry_key(project_id, entry.seq).as_bytes(),
            minicbor::to_vec(&entry)?,
        )?;

        log::info!("deallocated {amount} on {project_id} for {reference_id}");
        Ok(entry)
    }

    /// Manual budget adjustment: mutates the accumulated adjustments and
    /// records the movement as an entry.
    pub fn adjust(
        &self,
        project_id: &str,
        amount: i64,
        description: &str,
        created_by: &str,
    ) -> anyhow::Result<LedgerEntry> {
        let guard = self.lock_for(project_id);
        let _held = guard.lock().unwrap();

        let (mut project, entries, available) = self.replay(project_id)?;
        project.budget_adjustments += amount;
        let entry = LedgerEntry {
            project_id: project_id.to_string(),
            seq: entries.last().map_or(0, |e| e.seq + 1),
            entry_type: EntryType::Adjustment,
            amount: amount.unsigned_abs(),
            running_balance: available + amount,
            reference_id: None,
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at: TimeStamp::new(),
        };

        let mut batch = Batch::default();
        batch.insert(project_id.as_bytes(), minicbor::to_vec(&project)?);
        batch.insert(
            entry_key(project_id, entry.seq).as_bytes(),
            minicbor::to_vec(&entry)?,
        );
        self.tree.apply_batch(batch)?;

        log::info!("adjusted {project_id} by {amount}");
        Ok(entry)
    }

    /// The allocation amount for `reference_id` that has not been reversed
    /// yet, if any. Drives the rejection trigger and the at-most-one-open-
    /// allocation invariant.
    pub fn open_allocation(
        &self,
        project_id: &str,
        reference_id: &str,
    ) -> anyhow::Result<Option<u64>> {
        let entries = self.entries(project_id)?;
        let mut open = None;
        for entry in entries {
            if entry.reference_id.as_deref() != Some(reference_id) {
                continue;
            }
            match entry.entry_type {
                EntryType::Allocation => open = Some(entry.amount),
                EntryType::Deallocation => open = None,
                _ => {}
            }
        }
        Ok(open)
    }

    /// Current available budget. Lock-free; may be stale under concurrent
    /// writers, so approval paths re-check under their own serialization.
    pub fn available(&self, project_id: &str) -> anyhow::Result<i64> {
        let (_, _, available) = self.replay(project_id)?;
        Ok(available)
    }

    /// Net outstanding allocations.
    pub fn allocated_total(&self, project_id: &str) -> anyhow::Result<i64> {
        let (project, _, available) = self.replay(project_id)?;
        Ok(project.effective_budget() - available)
    }

    /// Can `cost` be approved against this project? When
    /// `exclude_reference` names a request holding an open allocation, its
    /// amount is added back first, so an edited request is not counted
    /// against itself.
    pub fn check_affordability(
        &self,
        project_id: &str,
        cost: u64,
        exclude_reference: Option<&str>,
    ) -> anyhow::Result<Affordability> {
        let (project, _, mut available) = self.replay(project_id)?;
        if let Some(reference) = exclude_reference {
            if let Some(amount) = self.open_allocation(project_id, reference)? {
                available += amount as i64;
            }
        }
        let shortfall = cost as i64 - available;
        Ok(Affordability {
            can_approve: shortfall <= 0,
            excess: shortfall.max(0),
            available,
            effective: project.effective_budget(),
        })
    }
}
