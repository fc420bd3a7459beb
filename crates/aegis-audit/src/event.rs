// event.rs — Audit event data model.
//
// Every AEGIS verdict — and the boot/teardown lifecycle events around it —
// is recorded as one `AuditEvent`, one JSONL line. Fields are serialized in
// the canonical order a compliance reviewer reads them in: when, who, what
// kind of thing, on what subject, with what outcome and reason, which rule
// fired, how much data moved, how long it took, and finally the two hash
// fields that chain this line to the one before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of thing this event records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// The AEGIS Policy Engine evaluated an operation.
    PolicyDecision,
    /// A human resolved (approved/denied) an Approval Queue request.
    ApprovalResolved,
    /// An Approval Queue request expired unresolved.
    ApprovalExpired,
    /// The Egress Proxy made a per-request decision.
    ProxyDecision,
    /// The DNS Filter answered a query.
    DnsDecision,
    /// A sandbox subsystem came up or went down.
    Lifecycle,
    /// An integrity or resource failure the operator must see.
    IntegrityFault,
    /// Log rotation checkpoint, carrying the tail hash of the previous
    /// segment forward as this segment's first `prev_hash`.
    Checkpoint,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Ask,
    Info,
}

/// A single audit event — one line in the JSONL audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,

    /// RFC-3339, UTC, microsecond precision.
    pub ts: DateTime<Utc>,

    /// Who or what performed the action (agent session id, "orchestrator",
    /// or an operator identity for approval resolutions).
    pub actor: String,

    pub event_type: AuditEventKind,

    /// The resource affected — a path, a URL, a domain, or a subsystem name.
    pub subject: Option<String>,

    pub outcome: Outcome,

    /// Single-sentence, human-readable reason for the outcome.
    pub reason: String,

    /// The invariant or domain rule that determined the outcome, if any.
    pub rule_matched: Option<String>,

    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
    pub duration_ms: Option<u64>,

    /// Arbitrary structured context that doesn't warrant its own field.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Self-hash of the previous line in the log; `None` only for the
    /// first event after a rotation checkpoint.
    pub prev_hash: Option<String>,

    /// Keyed HMAC-SHA256 of this event's canonical bytes (every field
    /// above, in declaration order) together with `prev_hash`, computed by
    /// the log writer just before append — never set by the caller.
    #[serde(default)]
    pub self_hash: String,
}

impl AuditEvent {
    pub fn new(actor: impl Into<String>, event_type: AuditEventKind, outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            ts: Utc::now(),
            actor: actor.into(),
            event_type,
            subject: None,
            outcome,
            reason: reason.into(),
            rule_matched: None,
            bytes_in: None,
            bytes_out: None,
            duration_ms: None,
            metadata: serde_json::Value::Null,
            prev_hash: None,
            self_hash: String::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_rule_matched(mut self, rule: impl Into<String>) -> Self {
        self.rule_matched = Some(rule.into());
        self
    }

    pub fn with_bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = Some(bytes_in);
        self.bytes_out = Some(bytes_out);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The canonical byte representation hashed into `self_hash` — the
    /// event with `self_hash` itself cleared, so the hash never depends on
    /// its own value, followed by the hex-encoded `prev_hash`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut for_hash = self.clone();
        for_hash.self_hash = String::new();
        serde_json::to_vec(&for_hash).expect("AuditEvent always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_round_trip() {
        let event = AuditEvent::new("agent-1", AuditEventKind::PolicyDecision, Outcome::Pass, "all invariants satisfied")
            .with_subject("fs://workspace/test.txt")
            .with_rule_matched("path_confinement")
            .with_bytes(0, 128)
            .with_duration_ms(2);

        let json = serde_json::to_string(&event).expect("serialize");
        let restored: AuditEvent = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(event.event_id, restored.event_id);
        assert_eq!(event.actor, restored.actor);
        assert_eq!(event.event_type, restored.event_type);
        assert_eq!(event.subject, restored.subject);
        assert_eq!(event.outcome, restored.outcome);
        assert_eq!(event.rule_matched, restored.rule_matched);
    }

    #[test]
    fn event_ids_are_unique() {
        let e1 = AuditEvent::new("agent", AuditEventKind::PolicyDecision, Outcome::Pass, "ok");
        let e2 = AuditEvent::new("agent", AuditEventKind::PolicyDecision, Outcome::Pass, "ok");
        assert_ne!(e1.event_id, e2.event_id);
    }

    #[test]
    fn event_type_serializes_as_snake_case() {
        let json = serde_json::to_string(&AuditEventKind::ApprovalResolved).unwrap();
        assert_eq!(json, "\"approval_resolved\"");
    }

    #[test]
    fn canonical_bytes_are_independent_of_self_hash_value() {
        let mut event = AuditEvent::new("agent", AuditEventKind::PolicyDecision, Outcome::Fail, "denied");
        let bytes_before = event.canonical_bytes();
        event.self_hash = "deadbeef".to_string();
        let bytes_after = event.canonical_bytes();
        assert_eq!(bytes_before, bytes_after);
    }

    #[test]
    fn backward_missing_optional_fields_still_deserialize() {
        let json = r#"{
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "ts": "2026-02-25T12:00:00.000001Z",
            "actor": "agent-1",
            "event_type": "policy_decision",
            "subject": null,
            "outcome": "pass",
            "reason": "ok",
            "rule_matched": null,
            "bytes_in": null,
            "bytes_out": null,
            "duration_ms": null,
            "prev_hash": null
        }"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.self_hash, "");
    }
}
