// log.rs — Append-only, hash-chained JSONL audit log.
//
// One canonical JSON object per line. Every event's `self_hash` is a keyed
// HMAC-SHA256 over its own canonical bytes chained to the previous line's
// `self_hash` — not a plain SHA-256 of the line, which anyone with write
// access to the file could recompute and extend. `verify` walks a range of
// the log and fails closed on the first line whose `self_hash` doesn't
// match its recomputation: a verifier must be able to prove no entry was
// altered, reordered, or removed after writing.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::AuditError;
use crate::event::{AuditEvent, AuditEventKind, Outcome};
use crate::hasher::ChainKey;

/// An append-only audit log backed by a JSONL file, with a writer-held
/// exclusive advisory lock on the active segment: the file is opened
/// append-only with an OS-level exclusive write lock for the active
/// segment.
pub struct AuditLog {
    writer: BufWriter<File>,
    path: PathBuf,
    key: ChainKey,
    /// `self_hash` of the last event written, or `None` immediately after a
    /// fresh file or a rotation checkpoint.
    last_hash: Option<String>,
}

impl AuditLog {
    /// Open (or create) an audit log at `path`, keyed by `key`. If the file
    /// already has content, the hash chain state is recovered from its last
    /// line so appends continue the existing chain rather than starting a
    /// disconnected one.
    pub fn open(path: impl AsRef<Path>, key: ChainKey) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        let last_hash = if path.exists() {
            Self::read_last_self_hash(&path)?
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed { path: path.clone(), source })?;
        lock_exclusive(&file)?;

        Ok(Self { writer: BufWriter::new(file), path, key, last_hash })
    }

    /// Append `event` to the log, computing its hash-chain fields. The
    /// caller's `prev_hash`/`self_hash` are overwritten unconditionally —
    /// only the writer may set them.
    pub fn append(&mut self, mut event: AuditEvent) -> Result<AuditEvent, AuditError> {
        event.prev_hash = self.last_hash.clone();
        event.self_hash.clear();

        let canonical = event.canonical_bytes();
        event.self_hash = self.key.chain_hash(&canonical, event.prev_hash.as_deref());

        let line = serde_json::to_string(&event)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;

        self.last_hash = Some(event.self_hash.clone());
        Ok(event)
    }

    /// Roll over to a fresh segment: write a `Checkpoint` event carrying
    /// the outgoing segment's tail hash, rename the current file aside,
    /// then reopen a clean file whose chain restarts at `None`.
    pub fn rotate(&mut self) -> Result<PathBuf, AuditError> {
        let tail_hash = self.last_hash.clone();
        let checkpoint = AuditEvent::new(
            "aegis-audit",
            AuditEventKind::Checkpoint,
            Outcome::Info,
            "segment rotated",
        )
        .with_metadata(serde_json::json!({ "tail_hash": tail_hash }));
        self.append(checkpoint)?;
        self.writer.flush()?;

        let rotated_path = rotated_segment_path(&self.path);
        std::fs::rename(&self.path, &rotated_path).map_err(|source| AuditError::RotationFailed(source.to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| AuditError::OpenFailed { path: self.path.clone(), source })?;
        lock_exclusive(&file)?;
        self.writer = BufWriter::new(file);
        self.last_hash = None;

        Ok(rotated_path)
    }

    /// Read every event in `path`, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        let file = File::open(path.as_ref()).map_err(|source| AuditError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// Verify the hash chain over `range` (a 0-based, exclusive-end slice of
    /// the log's event indices), keyed by `key`. Fails on the first entry
    /// whose `self_hash` does not match its recomputation, or whose
    /// `prev_hash` does not match the previous entry's `self_hash`.
    pub fn verify(path: impl AsRef<Path>, key: &ChainKey, range: Range<usize>) -> Result<(), AuditError> {
        let events = Self::read_all(path)?;
        let mut expected_prev: Option<String> = if range.start == 0 {
            None
        } else {
            events
                .get(range.start - 1)
                .map(|e| e.self_hash.clone())
        };

        for (idx, event) in events.iter().enumerate().take(range.end.min(events.len())).skip(range.start) {
            if event.prev_hash != expected_prev {
                return Err(AuditError::IntegrityViolation {
                    line: idx + 1,
                    expected: expected_prev.clone().unwrap_or_else(|| "none".to_string()),
                    actual: event.prev_hash.clone().unwrap_or_else(|| "none".to_string()),
                });
            }
            let canonical = event.canonical_bytes();
            let recomputed = key.chain_hash(&canonical, event.prev_hash.as_deref());
            if recomputed != event.self_hash {
                return Err(AuditError::IntegrityViolation {
                    line: idx + 1,
                    expected: recomputed,
                    actual: event.self_hash.clone(),
                });
            }
            expected_prev = Some(event.self_hash.clone());
        }
        Ok(())
    }

    /// Verify the entire log file.
    pub fn verify_all(path: impl AsRef<Path>, key: &ChainKey) -> Result<(), AuditError> {
        let len = Self::read_all(path.as_ref())?.len();
        Self::verify(path, key, 0..len)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_last_self_hash(path: &Path) -> Result<Option<String>, AuditError> {
        let events = Self::read_all(path)?;
        Ok(events.last().map(|e| e.self_hash.clone()))
    }
}

fn rotated_segment_path(active_path: &Path) -> PathBuf {
    let stamp = AuditEvent::new("aegis-audit", AuditEventKind::Checkpoint, Outcome::Info, "").event_id;
    let mut rotated = active_path.to_path_buf();
    let file_name = rotated.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    rotated.set_file_name(format!("{file_name}.{stamp}"));
    rotated
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<(), AuditError> {
    use std::os::fd::AsRawFd;
    // SAFETY: `file`'s fd is valid for the duration of this call; flock is
    // advisory and does not alter the fd's read/write semantics.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(AuditError::RotationFailed(
            "failed to acquire exclusive lock on audit log segment".to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<(), AuditError> {
    Ok(())
}
