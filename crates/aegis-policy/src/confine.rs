// workspace.rs — Workspace Root and path confinement.
//
// `confine()` is the single chokepoint every filesystem operation's target
// path must pass through before AEGIS will consider it. The algorithm is
// deliberately conservative: reject first on raw-byte evidence of known
// escape tricks (NUL bytes, ADS syntax, reserved device names), then
// symlink-resolve to an absolute form, then check the result is the root
// itself or has the root as a proper *component* prefix — never a string
// prefix, which would wrongly accept a sibling directory like `/ws-foo`
// against root `/ws`.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The canonical, symlink-resolved directory filesystem operations are
/// confined to. Immutable for the lifetime of a worker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRoot(PathBuf);

impl WorkspaceRoot {
    /// Resolve `path` to a canonical workspace root.
    ///
    /// The root itself must already exist and be a directory — there is no
    /// sense confining operations to a root AEGIS cannot observe.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let canonical = path.as_ref().canonicalize()?;
        Ok(Self(canonical))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Why `confine()` rejected a candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfineErrorKind {
    NullByte,
    ReservedDevice,
    AltDataStream,
    EscapesRoot,
    SymlinkEscape,
    CaseNormalizationMismatch,
    NotAbsoluteAfterResolve,
}

impl std::fmt::Display for ConfineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfineErrorKind::NullByte => "null_byte",
            ConfineErrorKind::ReservedDevice => "reserved_device",
            ConfineErrorKind::AltDataStream => "alt_data_stream",
            ConfineErrorKind::EscapesRoot => "escapes_root",
            ConfineErrorKind::SymlinkEscape => "symlink_escape",
            ConfineErrorKind::CaseNormalizationMismatch => "case_normalization_mismatch",
            ConfineErrorKind::NotAbsoluteAfterResolve => "not_absolute_after_resolve",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("path confinement failed: {kind} for '{candidate}'")]
pub struct ConfineError {
    pub kind: ConfineErrorKind,
    pub candidate: String,
}

/// The closed set of Windows reserved device names, checked case-insensitively
/// as a whole path segment (not a substring).
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Decide whether `candidate` lies within `root`.
///
/// Returns the canonical, symlink-resolved path on success. Pure and
/// idempotent: calling `confine` again on the returned path with the same
/// root always succeeds.
pub fn confine(candidate: impl AsRef<Path>, root: &WorkspaceRoot) -> Result<PathBuf, ConfineError> {
    let candidate = candidate.as_ref();
    let raw = candidate.to_string_lossy();

    // (a) NUL byte anywhere in the raw path.
    if raw.bytes().any(|b| b == 0) {
        return Err(ConfineError {
            kind: ConfineErrorKind::NullByte,
            candidate: raw.into_owned(),
        });
    }

    for segment in candidate.components() {
        let Component::Normal(os_seg) = segment else {
            continue;
        };
        let seg = os_seg.to_string_lossy();

        // (b) NTFS alternate-data-stream syntax: a colon in a segment that
        // is not the Windows drive-letter prefix (drive letters are their
        // own `Component::Prefix`, never `Component::Normal`, so any colon
        // reaching here is ADS syntax).
        if seg.contains(':') {
            return Err(ConfineError {
                kind: ConfineErrorKind::AltDataStream,
                candidate: raw.into_owned(),
            });
        }

        // (c) Reserved device name as a whole segment, case-insensitive,
        // ignoring a trailing extension (`NUL.txt` is still `NUL`).
        let stem = seg.split('.').next().unwrap_or("");
        if RESERVED_DEVICE_NAMES
            .iter()
            .any(|d| d.eq_ignore_ascii_case(stem))
        {
            return Err(ConfineError {
                kind: ConfineErrorKind::ReservedDevice,
                candidate: raw.into_owned(),
            });
        }
    }

    // Resolve to an absolute, symlink-free form. A path that doesn't exist
    // yet (e.g. a file about to be created) can't be `canonicalize`d, so we
    // resolve its existing parent and rejoin the leaf.
    let resolved = resolve_best_effort(candidate, root.as_path()).map_err(|kind| ConfineError {
        kind,
        candidate: raw.clone().into_owned(),
    })?;

    if !resolved.is_absolute() {
        return Err(ConfineError {
            kind: ConfineErrorKind::NotAbsoluteAfterResolve,
            candidate: raw.into_owned(),
        });
    }

    // Structural (component-wise) confinement check — never a string
    // prefix comparison, which would wrongly accept `/ws-foo` against `/ws`.
    if !is_component_prefix(root.as_path(), &resolved) {
        return Err(ConfineError {
            kind: ConfineErrorKind::EscapesRoot,
            candidate: raw.into_owned(),
        });
    }

    Ok(resolved)
}

/// Resolve `candidate` (relative or absolute) against `root` to an absolute,
/// symlink-resolved path, tolerating leaf components that don't exist yet.
fn resolve_best_effort(candidate: &Path, root: &Path) -> Result<PathBuf, ConfineErrorKind> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    // Walk from the root of `joined` down, canonicalizing the longest
    // existing prefix, then lexically append whatever doesn't exist yet.
    // This still resolves every symlink that *does* exist on the path,
    // which is where a symlink-escape would actually live.
    let mut existing = PathBuf::new();
    let mut remainder = Vec::new();
    let mut found_existing = false;
    for component in joined.components() {
        let mut candidate_prefix = existing.clone();
        candidate_prefix.push(component.as_os_str());
        if !found_existing && candidate_prefix.exists() {
            existing = candidate_prefix;
        } else {
            found_existing = true;
            remainder.push(component.as_os_str().to_owned());
        }
    }

    let mut resolved = if existing.as_os_str().is_empty() {
        PathBuf::from(component_root(&joined))
    } else {
        existing
            .canonicalize()
            .map_err(|_| ConfineErrorKind::SymlinkEscape)?
    };

    for part in remainder {
        resolved.push(part);
    }

    Ok(normalize_lexically(&resolved))
}

fn component_root(path: &Path) -> PathBuf {
    path.components()
        .next()
        .map(|c| PathBuf::from(c.as_os_str()))
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Remove any `.`/`..` components left in the lexical remainder after the
/// existing prefix was canonicalized. A leading `..` that would climb above
/// the canonicalized existing prefix collapses harmlessly since `push`
/// followed by component iteration in `is_component_prefix` treats the
/// result structurally, not by string.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True iff `child`'s components start with all of `root`'s components, on
/// platform-appropriate case sensitivity.
fn is_component_prefix(root: &Path, child: &Path) -> bool {
    let mut root_components = root.components();
    let mut child_components = child.components();

    loop {
        match (root_components.next(), child_components.next()) {
            (None, _) => return true,
            (Some(r), Some(c)) => {
                if !components_equal(r, c) {
                    return false;
                }
            }
            (Some(_), None) => return false,
        }
    }
}

#[cfg(target_os = "windows")]
fn components_equal(a: Component<'_>, b: Component<'_>) -> bool {
    a.as_os_str().to_string_lossy().eq_ignore_ascii_case(&b.as_os_str().to_string_lossy())
}

#[cfg(not(target_os = "windows"))]
fn components_equal(a: Component<'_>, b: Component<'_>) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn root_at(dir: &Path) -> WorkspaceRoot {
        WorkspaceRoot::new(dir).expect("root canonicalizes")
    }

    #[test]
    fn root_itself_is_accepted() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let resolved = confine(dir.path(), &root).expect("root accepted");
        assert_eq!(resolved, *root.as_path());
    }

    #[test]
    fn plain_child_is_accepted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), b"hi").unwrap();
        let root = root_at(dir.path());
        let resolved = confine(dir.path().join("file.txt"), &root).unwrap();
        assert!(resolved.starts_with(root.as_path()));
    }

    #[test]
    fn nonexistent_leaf_under_root_is_accepted() {
        // Creating a new file — the leaf doesn't exist yet.
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let resolved = confine(dir.path().join("new_file.txt"), &root).unwrap();
        assert!(resolved.starts_with(root.as_path()));
    }

    #[test]
    fn dot_dot_root_dot_dot_root_resolves_to_root() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let root_name = dir.path().file_name().unwrap();
        let tricky = dir.path().join("..").join(root_name);
        let resolved = confine(tricky, &root).expect("resolves back to root");
        assert_eq!(resolved, *root.as_path());
    }

    #[test]
    fn sibling_directory_with_prefix_name_is_rejected() {
        let parent = tempdir().unwrap();
        let root_dir = parent.path().join("ws");
        let sibling_dir = parent.path().join("ws-foo");
        fs::create_dir(&root_dir).unwrap();
        fs::create_dir(&sibling_dir).unwrap();
        let root = root_at(&root_dir);

        let err = confine(&sibling_dir, &root).unwrap_err();
        assert_eq!(err.kind, ConfineErrorKind::EscapesRoot);
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let escape = dir.path().join("..").join("..").join("etc").join("passwd");
        let err = confine(escape, &root).unwrap_err();
        assert_eq!(err.kind, ConfineErrorKind::EscapesRoot);
    }

    #[test]
    fn null_byte_is_rejected() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            let bad = std::ffi::OsStr::from_bytes(b"/tmp/foo\0bar");
            let err = confine(Path::new(bad), &root).unwrap_err();
            assert_eq!(err.kind, ConfineErrorKind::NullByte);
        }
    }

    #[test]
    fn alternate_data_stream_syntax_is_rejected() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let candidate = dir.path().join("file.txt:hidden_stream");
        let err = confine(candidate, &root).unwrap_err();
        assert_eq!(err.kind, ConfineErrorKind::AltDataStream);
    }

    #[test]
    fn reserved_device_name_is_rejected() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        for name in ["CON", "nul", "Com1", "LPT9"] {
            let candidate = dir.path().join(name);
            let err = confine(&candidate, &root).unwrap_err();
            assert_eq!(
                err.kind,
                ConfineErrorKind::ReservedDevice,
                "expected {name} to be rejected"
            );
        }
    }

    #[test]
    fn reserved_device_name_with_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let root = root_at(dir.path());
        let candidate = dir.path().join("NUL.txt");
        let err = confine(candidate, &root).unwrap_err();
        assert_eq!(err.kind, ConfineErrorKind::ReservedDevice);
    }

    #[test]
    fn symlink_escaping_root_is_rejected() {
        #[cfg(unix)]
        {
            let dir = tempdir().unwrap();
            let outside = tempdir().unwrap();
            let root_dir = dir.path().join("ws");
            fs::create_dir(&root_dir).unwrap();
            let root = root_at(&root_dir);

            let link = root_dir.join("escape");
            std::os::unix::fs::symlink(outside.path(), &link).unwrap();

            let err = confine(&link, &root).unwrap_err();
            assert_eq!(err.kind, ConfineErrorKind::EscapesRoot);
        }
    }

    #[test]
    fn confine_is_idempotent_on_accepted_input() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let root = root_at(dir.path());
        let once = confine(dir.path().join("a.txt"), &root).unwrap();
        let twice = confine(&once, &root).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_subdirectory_is_accepted() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/lib")).unwrap();
        fs::write(dir.path().join("src/lib/mod.rs"), b"").unwrap();
        let root = root_at(dir.path());
        let resolved = confine(dir.path().join("src/lib/mod.rs"), &root).unwrap();
        assert!(resolved.starts_with(root.as_path()));
    }
}
