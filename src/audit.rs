//! Write-only audit sink
//!
//! Audit storage mechanics live outside this crate. The service records one
//! entry per action and treats sink failures as log-and-continue; a broken
//! audit store must never block or roll back a workflow transition.

pub trait AuditSink: Send + Sync {
    fn record(&self, actor_id: &str, action: &str, details: &str) -> anyhow::Result<()>;
}

/// Default sink: emits through the `log` facade.
pub struct LogAudit;

impl AuditSink for LogAudit {
    fn record(&self, actor_id: &str, action: &str, details: &str) -> anyhow::Result<()> {
        log::info!(target: "audit", "{actor_id} {action}: {details}");
        Ok(())
    }
}
