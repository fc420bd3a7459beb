//! # aegis-policy
//!
//! The governed-execution policy engine: default-deny evaluation of every
//! filesystem, process, and network operation an agent attempts, against a
//! fixed set of invariants (path confinement, command classification,
//! content inspection, domain allow-listing, rate limiting, mode-sensitive
//! risk gating) plus the human-in-the-loop approval queue those invariants
//! escalate into.
//!
//! This crate is synchronous and has no I/O side effects of its own beyond
//! the Approval Queue's append-only persistence file — it is meant to be
//! cheap to construct, pure to evaluate, and trivial to unit-test without a
//! running sandbox.

pub mod approval;
pub mod capability;
pub mod command;
pub mod confine;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exemption;
pub mod inspect;
pub mod mode;
pub mod operation;
pub mod ratelimit;

pub use approval::{ApprovalQueue, ApprovalRequest, ApprovalState};
pub use capability::{AuditRecord, AuditSink, NullAuditSink, PolicyCapabilities};
pub use confine::{confine as confine_path, ConfineError, ConfineErrorKind, WorkspaceRoot};
pub use domain::{is_llm_domain, DomainDecision, DomainRule, DomainSource, EgressConfig};
pub use engine::{AegisEngine, EvaluationStep, EvaluationTrace, Verdict};
pub use error::PolicyError;
pub use exemption::ExemptionPatterns;
pub use mode::Mode;
pub use operation::{Operation, OperationKind, OperationMetadata, OperationTarget, Risk};
pub use ratelimit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
