// error.rs — Orchestrator errors and the exit codes they map to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to bind port: {0}")]
    PortBindFailure(String),

    #[error("audit log unwritable: {0}")]
    AuditUnwritable(String),

    #[error("policy error: {0}")]
    Policy(#[from] aegis_policy::PolicyError),

    #[error("mediation error: {0}")]
    Mediation(#[from] aegis_mediation::MediationError),

    #[error("audit error: {0}")]
    Audit(#[from] aegis_audit::AuditError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// The process exit code this error should surface as:
    /// 0 normal shutdown, 2 config invalid, 3 runtime unavailable,
    /// 4 port bind failure, 5 audit log unwritable. Anything else that
    /// can abort a boot collapses to the generic failure code 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_) => 2,
            OrchestratorError::RuntimeUnavailable(_) => 3,
            OrchestratorError::PortBindFailure(_) => 4,
            OrchestratorError::AuditUnwritable(_) => 5,
            OrchestratorError::Audit(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_documented_table() {
        assert_eq!(OrchestratorError::Config("x".into()).exit_code(), 2);
        assert_eq!(OrchestratorError::RuntimeUnavailable("x".into()).exit_code(), 3);
        assert_eq!(OrchestratorError::PortBindFailure("x".into()).exit_code(), 4);
        assert_eq!(OrchestratorError::AuditUnwritable("x".into()).exit_code(), 5);
        assert_eq!(OrchestratorError::Other("x".into()).exit_code(), 1);
    }
}
