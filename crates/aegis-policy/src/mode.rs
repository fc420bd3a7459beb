// mode.rs — Operating modes and the permission table they gate.
//
// Mode is the coarse dial an operator sets per session. Invariant 2 of the
// AEGIS engine ("mode gate") consults `Mode::permission_for` directly: it
// is the one authoritative place the read/modify/create/delete/exec
// permission table lives, rather than being re-derived ad hoc at call
// sites. Every other invariant (Path Confinement, Command Classifier,
// Content Inspector, Rate Limiter) evaluates identically regardless of
// Mode — Mode only changes which operation kinds are permitted, asked, or
// denied outright.

use serde::{Deserialize, Serialize};

use crate::operation::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Read-only: no write, create, delete, or exec is ever permitted,
    /// regardless of risk or operator approval.
    ReadOnly,
    /// Every write-side operation (modify, create, delete) requires human
    /// approval; exec is never permitted.
    ReviewedWrite,
    /// Read, modify, and create are permitted outright; delete requires
    /// approval; exec is permitted only for allow-listed executables.
    Project,
}

/// The outcome `Mode::permission_for` assigns an operation kind, before any
/// other invariant (risk, command safety, domain allow) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Outright permitted by this mode; later invariants still apply.
    Allow,
    /// Mode requires human review regardless of risk tier.
    Ask,
    /// Never permitted under this mode.
    Deny,
}

impl Mode {
    /// The mode gate's permission table: what this mode allows
    /// for each operation kind, before Path Confinement, Risk, Command
    /// Safety, or Network Gate are consulted.
    pub fn permission_for(self, kind: OperationKind) -> Permission {
        use OperationKind::*;
        use Permission::*;
        match (self, kind) {
            (Mode::ReadOnly, Read) => Allow,
            (Mode::ReadOnly, Net) => Allow,
            (Mode::ReadOnly, _) => Deny,

            (Mode::ReviewedWrite, Read) => Allow,
            (Mode::ReviewedWrite, Create | Modify | Delete) => Ask,
            (Mode::ReviewedWrite, Exec) => Deny,
            (Mode::ReviewedWrite, Net) => Allow,

            (Mode::Project, Read | Create | Modify) => Allow,
            (Mode::Project, Delete) => Ask,
            // Exec is "allow-listed" under Project: the mode gate defers to
            // the Command Classifier (invariant 5) rather than deciding on
            // its own, so it passes through here and the classifier's
            // allow-list check is what actually gates it.
            (Mode::Project, Exec) => Allow,
            (Mode::Project, Net) => Allow,
        }
    }

    /// Whether this mode consults a curated executable allow-list for Exec
    /// operations (Command Classifier invariant), as opposed to falling
    /// back to the hardcoded safe/high-risk executable sets alone.
    pub fn uses_project_allowlist(self) -> bool {
        matches!(self, Mode::Project)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::ReadOnly => "read_only",
            Mode::ReviewedWrite => "reviewed_write",
            Mode::Project => "project",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationKind::*;
    use Permission::*;

    #[test]
    fn read_only_permits_only_read_and_net() {
        assert_eq!(Mode::ReadOnly.permission_for(Read), Allow);
        assert_eq!(Mode::ReadOnly.permission_for(Net), Allow);
        for kind in [Create, Modify, Delete, Exec] {
            assert_eq!(Mode::ReadOnly.permission_for(kind), Deny, "{kind:?} must be denied under ReadOnly");
        }
    }

    #[test]
    fn reviewed_write_asks_for_every_write_side_kind() {
        for kind in [Create, Modify, Delete] {
            assert_eq!(Mode::ReviewedWrite.permission_for(kind), Ask, "{kind:?} must ask under ReviewedWrite");
        }
        assert_eq!(Mode::ReviewedWrite.permission_for(Exec), Deny);
        assert_eq!(Mode::ReviewedWrite.permission_for(Read), Allow);
    }

    #[test]
    fn project_allows_create_and_modify_but_asks_on_delete() {
        assert_eq!(Mode::Project.permission_for(Create), Allow);
        assert_eq!(Mode::Project.permission_for(Modify), Allow);
        assert_eq!(Mode::Project.permission_for(Delete), Ask);
    }

    #[test]
    fn only_project_uses_the_executable_allowlist() {
        assert!(Mode::Project.uses_project_allowlist());
        assert!(!Mode::ReadOnly.uses_project_allowlist());
        assert!(!Mode::ReviewedWrite.uses_project_allowlist());
    }

    #[test]
    fn net_operations_are_not_gated_by_mode() {
        // Network egress is governed by the Network Gate and External
        // Access invariants (domain rules, method), not by Mode — so Mode
        // never denies a Net operation outright.
        for mode in [Mode::ReadOnly, Mode::ReviewedWrite, Mode::Project] {
            assert_eq!(mode.permission_for(Net), Allow);
        }
    }
}
