// error.rs — Error taxonomy for the policy subsystem.
//
// Mirrors the cross-cutting error taxonomy every governed component shares
// (ConfigError / PolicyViolation / ApprovalError / CancelledError); the
// network- and integrity-specific variants live in their owning crates
// (aegis-mediation, aegis-audit) instead of being duplicated here.

use thiserror::Error;

/// Errors that can occur while evaluating or configuring policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The egress config file failed validation (missing/invalid fields).
    #[error("invalid egress config: {0}")]
    ConfigError(String),

    /// A top-level AEGIS invariant failed closed. Carries the invariant's
    /// short id so callers and audit entries can cite it directly.
    #[error("policy violation [{invariant}]: {detail}")]
    PolicyViolation { invariant: &'static str, detail: String },

    /// The approval queue could not be read or written (corruption, or the
    /// host-side store is unreachable).
    #[error("approval queue error: {0}")]
    ApprovalError(String),

    /// A blocking wait (e.g. on an Approval Queue resolution) was cancelled.
    #[error("operation cancelled while waiting for '{0}'")]
    Cancelled(String),

    /// Underlying I/O failure (approval queue persistence, pattern files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a persisted record.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
