// approval.rs — Approval Queue.
//
// A crash-recoverable, host-persisted queue of pending human-in-the-loop
// decisions. Persistence follows the same append-only JSONL pattern as the
// Audit Log (one transition per line, replayed in full on load) rather than
// a mutable on-disk record, so a crash mid-write never corrupts more than
// the last, incomplete line.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::operation::Operation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ApprovalState {
    Pending,
    Approved { decided_at: DateTime<Utc>, decided_by: String },
    Denied { decided_at: DateTime<Utc>, decided_by: String, reason: Option<String> },
    Expired { expired_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub prompt: String,
    pub submitted_at: DateTime<Utc>,
    pub ttl: Duration,
    pub state: ApprovalState,
}

impl ApprovalRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, ApprovalState::Pending)
            && now.signed_duration_since(self.submitted_at).to_std().unwrap_or(Duration::ZERO) > self.ttl
    }
}

/// One line of the queue's transition log. `Submitted` is the only
/// transition that carries the full request; resolutions reference it by
/// id, mirroring the Audit Log's own append-then-replay persistence shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
enum Transition {
    Submitted { request: ApprovalRequest },
    Resolved { id: Uuid, state: ApprovalState },
}

pub struct ApprovalQueue {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    requests: Mutex<HashMap<Uuid, ApprovalRequest>>,
}

impl ApprovalQueue {
    /// Open (creating if absent) the queue's persistence file at `path` and
    /// replay every transition to reconstruct in-memory state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref().to_path_buf();
        let requests = Self::replay(&path)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            requests: Mutex::new(requests),
        })
    }

    fn replay(path: &Path) -> Result<HashMap<Uuid, ApprovalRequest>, PolicyError> {
        let mut requests = HashMap::new();
        let Ok(file) = std::fs::File::open(path) else {
            return Ok(requests);
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(transition) = serde_json::from_str::<Transition>(&line) else {
                // A partial final line from a crash mid-write is tolerated
                // and dropped, matching the Audit Log's own replay leniency.
                continue;
            };
            match transition {
                Transition::Submitted { request } => {
                    requests.insert(request.id, request);
                }
                Transition::Resolved { id, state } => {
                    if let Some(req) = requests.get_mut(&id) {
                        req.state = state;
                    }
                }
            }
        }
        Ok(requests)
    }

    fn append(&self, transition: &Transition) -> Result<(), PolicyError> {
        let line = serde_json::to_string(transition)?;
        let mut file = self.file.lock().expect("approval queue file mutex poisoned");
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// Submit a new approval request for `operation`, returning its id.
    pub fn submit(&self, operation: &Operation, prompt: String, ttl: Duration) -> Result<Uuid, PolicyError> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            operation_id: operation.id,
            prompt,
            submitted_at: Utc::now(),
            ttl,
            state: ApprovalState::Pending,
        };
        let id = request.id;
        self.append(&Transition::Submitted { request: request.clone() })?;
        self.requests
            .lock()
            .expect("approval queue requests mutex poisoned")
            .insert(id, request);
        Ok(id)
    }

    pub fn resolve_approved(&self, id: Uuid, decided_by: String) -> Result<(), PolicyError> {
        self.resolve(id, ApprovalState::Approved { decided_at: Utc::now(), decided_by })
    }

    pub fn resolve_denied(&self, id: Uuid, decided_by: String, reason: Option<String>) -> Result<(), PolicyError> {
        self.resolve(id, ApprovalState::Denied { decided_at: Utc::now(), decided_by, reason })
    }

    fn resolve(&self, id: Uuid, state: ApprovalState) -> Result<(), PolicyError> {
        {
            let requests = self.requests.lock().expect("approval queue requests mutex poisoned");
            match requests.get(&id) {
                Some(req) if matches!(req.state, ApprovalState::Pending) => {}
                Some(_) => {
                    return Err(PolicyError::ApprovalError(format!(
                        "request {id} is already resolved"
                    )))
                }
                None => return Err(PolicyError::ApprovalError(format!("unknown request {id}"))),
            }
        }
        self.append(&Transition::Resolved { id, state: state.clone() })?;
        if let Some(req) = self
            .requests
            .lock()
            .expect("approval queue requests mutex poisoned")
            .get_mut(&id)
        {
            req.state = state;
        }
        Ok(())
    }

    /// Mark every pending request past its TTL as `Expired`, persisting
    /// each transition. Called periodically by the orchestrator.
    pub fn expire_stale(&self) -> Result<Vec<Uuid>, PolicyError> {
        let now = Utc::now();
        let expired_ids: Vec<Uuid> = {
            let requests = self.requests.lock().expect("approval queue requests mutex poisoned");
            requests
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id)
                .collect()
        };
        for id in &expired_ids {
            self.resolve(*id, ApprovalState::Expired { expired_at: now })?;
        }
        Ok(expired_ids)
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.requests.lock().expect("approval queue requests mutex poisoned").get(&id).cloned()
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .expect("approval queue requests mutex poisoned")
            .values()
            .filter(|r| matches!(r.state, ApprovalState::Pending))
            .cloned()
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, OperationTarget};
    use tempfile::tempdir;

    fn sample_operation() -> Operation {
        Operation::new(
            OperationKind::Net,
            OperationTarget::Net {
                url: "https://unknown.example.com/".to_string(),
                method: "GET".to_string(),
                body_size: 0,
                body_sample: None,
            },
        )
    }

    #[test]
    fn submit_then_approve_round_trips_through_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let queue = ApprovalQueue::open(&path).unwrap();
        let op = sample_operation();
        let id = queue.submit(&op, "allow egress to unknown.example.com?".to_string(), Duration::from_secs(300)).unwrap();
        queue.resolve_approved(id, "operator@host".to_string()).unwrap();

        let reopened = ApprovalQueue::open(&path).unwrap();
        let req = reopened.get(id).unwrap();
        assert!(matches!(req.state, ApprovalState::Approved { .. }));
    }

    #[test]
    fn cannot_resolve_twice() {
        let dir = tempdir().unwrap();
        let queue = ApprovalQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let op = sample_operation();
        let id = queue.submit(&op, "prompt".to_string(), Duration::from_secs(300)).unwrap();
        queue.resolve_denied(id, "operator@host".to_string(), None).unwrap();
        let err = queue.resolve_approved(id, "operator@host".to_string()).unwrap_err();
        assert!(matches!(err, PolicyError::ApprovalError(_)));
    }

    #[test]
    fn expire_stale_marks_pending_requests_past_ttl() {
        let dir = tempdir().unwrap();
        let queue = ApprovalQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let op = sample_operation();
        let id = queue.submit(&op, "prompt".to_string(), Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let expired = queue.expire_stale().unwrap();
        assert_eq!(expired, vec![id]);
        assert!(matches!(queue.get(id).unwrap().state, ApprovalState::Expired { .. }));
    }

    #[test]
    fn pending_excludes_resolved_requests() {
        let dir = tempdir().unwrap();
        let queue = ApprovalQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let op = sample_operation();
        let id1 = queue.submit(&op, "a".to_string(), Duration::from_secs(300)).unwrap();
        let id2 = queue.submit(&op, "b".to_string(), Duration::from_secs(300)).unwrap();
        queue.resolve_approved(id1, "operator@host".to_string()).unwrap();
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id2);
    }

    #[test]
    fn truncated_final_line_after_crash_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let queue = ApprovalQueue::open(&path).unwrap();
        let op = sample_operation();
        queue.submit(&op, "a".to_string(), Duration::from_secs(300)).unwrap();
        drop(queue);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"transition\":\"submitted\",\"request\":{{\"id\":\"broken").unwrap();

        let reopened = ApprovalQueue::open(&path).unwrap();
        assert_eq!(reopened.pending().len(), 1);
    }
}
