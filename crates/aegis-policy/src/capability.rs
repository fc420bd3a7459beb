// capability.rs — Seams the AEGIS engine evaluates through.
//
// `evaluate()` takes these as per-call parameters rather than storing them
// as engine state, keeping the engine itself a pure function of
// (operation, capabilities, mode) as required — the orchestrator owns the
// actual audit sink / approval queue instances and passes references in.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// A single decision emitted for the durable compliance record. Deliberately
/// decoupled from `aegis-audit`'s own `AuditEvent` type — this crate has no
/// dependency on `aegis-audit` (policy evaluation must stay pure and
/// dependency-free of the I/O-bound audit log) — the orchestrator adapts
/// `AuditRecord` into an `aegis_audit::AuditEvent` at the point where the two
/// are wired together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation_summary: String,
    pub outcome: String,
    pub reason: String,
    pub rule_matched: Option<String>,
}

/// The durable-record sink the engine writes every verdict to. Implemented
/// by the orchestrator over the real Audit Log; test code can implement it
/// over an in-memory `Vec`.
pub trait AuditSink {
    fn record(&self, record: AuditRecord);
}

/// A no-op sink for callers (and tests) that don't care about the audit
/// trail, e.g. a dry-run `evaluate_with_trace` call.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: AuditRecord) {}
}

/// The host-side facilities the AEGIS engine consults during evaluation:
/// the rate limiter and the approval queue. Bundled as a trait so the
/// engine's `evaluate` signature takes one reference instead of two, and so
/// test code can substitute a fake queue without touching disk.
pub trait PolicyCapabilities {
    fn rate_limit_check(&self, subject: &str) -> crate::ratelimit::RateLimitDecision;

    /// Submit an Ask-outcome operation for human review and return its
    /// approval id. The engine does not block on resolution; resolution is
    /// a separate, asynchronous step the orchestrator drives.
    fn submit_for_approval(
        &self,
        operation: &Operation,
        prompt: String,
    ) -> Result<uuid::Uuid, crate::error::PolicyError>;

    /// Current mode, consulted for mode-sensitive invariants (the Project
    /// allow-list).
    fn mode(&self) -> crate::mode::Mode;
}
