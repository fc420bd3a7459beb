//! # aegis-mediation
//!
//! Host-side network mediation: the two subsystems that stand between a
//! sandboxed agent and the public internet. The Egress Proxy terminates
//! every outbound HTTP/HTTPS connection and applies the domain allow-list,
//! rate limits, write-method approval gating, and content inspection the
//! policy engine's network invariants describe; the DNS Filter answers only
//! the names the same egress configuration permits, so a blocked domain is
//! unreachable even before a connection is attempted.
//!
//! Both subsystems read a shared `Arc<RwLock<aegis_policy::EgressConfig>>`
//! so a SIGHUP-triggered config reload takes effect for new requests
//! without restarting either listener, and both write audit events through
//! a single `AuditHandle` so the two event streams interleave into one
//! hash-chained log in true wall-clock order.

pub mod audit;
pub mod dns;
pub mod error;
pub mod proxy;

pub use audit::AuditHandle;
pub use dns::{DnsFilter, DnsFilterConfig};
pub use error::MediationError;
pub use proxy::{EgressProxy, ProxyConfig};
