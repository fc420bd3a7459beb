// operation.rs — The single request type every AEGIS invariant evaluates.
//
// Modeled as a Rust enum over the target (`OperationTarget`) rather than a
// loosely-typed single field, so the compiler — not a runtime match on a
// string discriminator — enforces that a filesystem operation always
// carries a path and a network operation always carries a URL.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of operation kinds the Action Scope invariant recognizes.
/// `Create` and `Modify` are kept distinct
/// even though the Mode permission table and the Risk gate treat them
/// identically today — a future stricter mode could split them without a
/// breaking change to this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Create,
    Modify,
    Delete,
    Exec,
    Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OperationTarget {
    Path {
        path: PathBuf,
        /// Present only for `Exec` operations: the argv the command would
        /// be invoked with, argv[0] is the executable itself.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argv: Option<Vec<String>>,
        /// Present only for `Delete` operations against more than one
        /// target (a directory removed recursively, a glob expansion) —
        /// the Risk gate escalates a multi-target delete to `High`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        additional_targets: Option<Vec<PathBuf>>,
    },
    Net {
        url: String,
        method: String,
        body_size: u64,
        /// First N bytes of the outgoing body, for Content Inspector
        /// evaluation — never the full body, to keep evaluation cheap and
        /// bounded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_sample: Option<Vec<u8>>,
    },
}

/// Risk tier assigned by the Risk gate invariant. `Critical` operations
/// always return `Ask` regardless of Mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

/// Free-form context that doesn't change the evaluation outcome but is
/// carried through to the audit record (who asked, from where, why).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub initiator: Option<String>,
    pub session_id: Option<String>,
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: uuid::Uuid,
    pub kind: OperationKind,
    pub target: OperationTarget,
    pub requested_at: DateTime<Utc>,
    pub metadata: OperationMetadata,
}

impl Operation {
    pub fn new(kind: OperationKind, target: OperationTarget) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            target,
            requested_at: Utc::now(),
            metadata: OperationMetadata::default(),
        }
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        match &self.target {
            OperationTarget::Path { path, .. } => Some(path.as_path()),
            OperationTarget::Net { .. } => None,
        }
    }

    pub fn argv(&self) -> Option<&[String]> {
        match &self.target {
            OperationTarget::Path { argv, .. } => argv.as_deref(),
            OperationTarget::Net { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.target {
            OperationTarget::Net { url, .. } => Some(url.as_str()),
            OperationTarget::Path { .. } => None,
        }
    }

    /// Total number of filesystem targets this operation touches — the
    /// primary path plus any `additional_targets` (a multi-file delete).
    pub fn target_count(&self) -> usize {
        match &self.target {
            OperationTarget::Path { additional_targets, .. } => {
                1 + additional_targets.as_ref().map(Vec::len).unwrap_or(0)
            }
            OperationTarget::Net { .. } => 1,
        }
    }

    /// A human-scannable single-line summary for tracing/audit correlation.
    pub fn summary(&self) -> String {
        match &self.target {
            OperationTarget::Path { path, .. } => {
                format!("{:?} {}", self.kind, path.display())
            }
            OperationTarget::Net { url, method, .. } => {
                format!("{:?} {method} {url}", self.kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_operation_exposes_path_and_not_url() {
        let op = Operation::new(
            OperationKind::Read,
            OperationTarget::Path {
                path: PathBuf::from("/ws/file.txt"),
                argv: None,
                additional_targets: None,
            },
        );
        assert!(op.path().is_some());
        assert!(op.url().is_none());
    }

    #[test]
    fn net_operation_exposes_url_and_not_path() {
        let op = Operation::new(
            OperationKind::Net,
            OperationTarget::Net {
                url: "https://api.anthropic.com/v1/messages".to_string(),
                method: "POST".to_string(),
                body_size: 128,
                body_sample: None,
            },
        );
        assert!(op.url().is_some());
        assert!(op.path().is_none());
    }

    #[test]
    fn risk_ordering_places_critical_above_high_above_medium_above_low() {
        assert!(Risk::Critical > Risk::High);
        assert!(Risk::High > Risk::Medium);
        assert!(Risk::Medium > Risk::Low);
    }

    #[test]
    fn target_count_reflects_additional_targets() {
        let single = Operation::new(
            OperationKind::Delete,
            OperationTarget::Path { path: PathBuf::from("/ws/a.txt"), argv: None, additional_targets: None },
        );
        assert_eq!(single.target_count(), 1);

        let multi = Operation::new(
            OperationKind::Delete,
            OperationTarget::Path {
                path: PathBuf::from("/ws/a.txt"),
                argv: None,
                additional_targets: Some(vec![PathBuf::from("/ws/b.txt"), PathBuf::from("/ws/c.txt")]),
            },
        );
        assert_eq!(multi.target_count(), 3);
    }
}
