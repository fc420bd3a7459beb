// audit.rs — The mediation layer's single-writer path onto the Audit Log.
//
// Spec: "The Audit Log serializes writes through a single-producer channel
// with one writer task to guarantee hash-chain integrity." The Proxy and
// the DNS Filter each hold a clone of the channel sender; only the task
// spawned by `AuditHandle::spawn` ever calls `AuditLog::append`, so the
// hash chain is never raced even though both subsystems emit concurrently.

use aegis_audit::{AuditEvent, AuditLog};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditHandle {
    /// Spawn the writer task over an already-open `AuditLog`, returning the
    /// handle callers record events through and the task's `JoinHandle` so
    /// the orchestrator can await clean shutdown after dropping every
    /// `AuditHandle` clone (which closes the channel and ends the task).
    pub fn spawn(mut log: AuditLog) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                if let Err(err) = log.append(event) {
                    // IntegrityError is fatal for the Audit Log component: it
                    // stops accepting writes rather than risk a chain built
                    // on an already-broken link.
                    tracing::error!(error = %err, "audit log append failed; writer task halting");
                    break;
                }
            }
        });
        (Self { tx }, task)
    }

    /// Record an event. Never blocks the caller; a send after the writer
    /// task has halted is silently dropped — the halted writer itself
    /// already logged the fault that caused it to stop.
    pub fn record(&self, event: AuditEvent) {
        let _ = self.tx.send(event);
    }
}
