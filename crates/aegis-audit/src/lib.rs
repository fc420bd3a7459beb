//! # aegis-audit
//!
//! The governed-execution core's durable compliance record: an append-only,
//! hash-chained JSONL log. Every AEGIS policy verdict, proxy decision, DNS
//! answer, and lifecycle transition is written here as one [`AuditEvent`]
//! per line, each line's `self_hash` a keyed HMAC-SHA256 chained to the
//! line before it — a verifier walking the log can prove no entry was
//! altered, reordered, or removed after writing.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use aegis_audit::{AuditLog, AuditEvent, AuditEventKind, Outcome, ChainKey};
//!
//! let key = ChainKey::from_secret_bytes(b"per-installation-secret");
//! let mut log = AuditLog::open("/tmp/audit.jsonl", key).unwrap();
//! log.append(
//!     AuditEvent::new("orchestrator", AuditEventKind::Lifecycle, Outcome::Info, "proxy started")
//! ).unwrap();
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;

pub use error::AuditError;
pub use event::{AuditEvent, AuditEventKind, Outcome};
pub use hasher::ChainKey;
pub use log::AuditLog;
