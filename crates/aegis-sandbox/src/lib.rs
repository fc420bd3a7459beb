//! # aegis-sandbox
//!
//! The Sandbox Orchestrator: brings up the Egress Proxy, DNS Filter, Audit
//! Log, and Approval Queue in a fixed order, keeps the egress rule set
//! hot-reloadable for the life of the process, and tears everything back
//! down — in reverse order — the moment any one of them fails.
//!
//! This crate owns no policy logic itself (that's `aegis-policy`) and no
//! wire protocol (that's `aegis-mediation`); it's the lifecycle glue that
//! turns those two into a runnable process.

mod config;
mod error;
mod orchestrator;
mod runtime;

pub use config::{SandboxConfig, WhitelistRuleConfig};
pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;
pub use runtime::{ContainerRuntime, ProcessContainerRuntime, WorkerHandle, WorkerSpec};

#[cfg(any(test, feature = "test-util"))]
pub use runtime::NullContainerRuntime;
