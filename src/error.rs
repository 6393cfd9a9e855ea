#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("no pending step awaits this actor: {actor_id}")]
    NoPendingStepForActor { actor_id: String },
    #[error("request not found: {0}")]
    RequestNotFound(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("department not found: {0}")]
    DepartmentNotFound(String),
    #[error("request {id} is terminal ({status}) and cannot transition")]
    TerminalState { id: String, status: String },
    #[error("insufficient budget: short by {excess}")]
    InsufficientBudget { excess: i64 },
    #[error("invalid trip details: {0}")]
    Validation(String),
}
