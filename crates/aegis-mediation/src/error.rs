// error.rs — Error taxonomy for the network mediation layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediationError {
    /// The egress config failed validation before a listener could start.
    #[error("invalid egress config: {0}")]
    ConfigError(String),

    /// An upstream (origin server, DNS resolver) I/O failure.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Listener bind, disk, or permission failure.
    #[error("resource error: {0}")]
    ResourceError(String),

    /// The approval queue could not be reached or is corrupted.
    #[error("approval error: {0}")]
    ApprovalError(String),

    /// The audit log refused the write (integrity fault upstream).
    #[error("audit error: {0}")]
    AuditError(#[from] aegis_audit::AuditError),

    /// A request was cooperatively cancelled mid-flight.
    #[error("cancelled: {0}")]
    Cancelled(String),
}
