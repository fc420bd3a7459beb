// config.rs — The host-side egress config file and the Sandbox
// Orchestrator's own boot-time settings layered on top of it.
//
// Parsed with `toml` + `serde`: one structured text file, mounted
// read-only into the worker container, that the orchestrator reads once
// at boot and re-reads on reload. `SandboxConfig::to_egress_config` is the
// one place a config-file `blocked_services` entry and a `whitelist`
// entry are both lowered into `aegis_policy::DomainRule`s — blocked
// services are placed ahead of the whitelist in rule order so the
// additive-whitelist's first-match-wins semantics give them deny-wins,
// without touching the build-time hardcoded set `aegis_policy::domain`
// already owns.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use aegis_policy::{DomainRule, DomainSource, EgressConfig, Mode};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

fn default_true() -> bool {
    true
}

fn default_proxy_port() -> u16 {
    8443
}

fn default_dns_port() -> u16 {
    5353
}

fn default_global_rpm() -> u32 {
    600
}

fn default_upstream_timeout_sec() -> u64 {
    120
}

fn default_approval_ttl_sec() -> u64 {
    120
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_dns_upstream() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53)
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_mode() -> Mode {
    Mode::Project
}

/// One `whitelist` entry from the egress config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistRuleConfig {
    pub domain: String,
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The egress config file, plus a handful of boot-time settings
/// (`bind_addr`, `dns_upstream`, `approval_queue_path`, `audit_secret_path`)
/// a host operator configures once and forgets, never a per-request
/// decision, so they live alongside the rest of the fields rather than in
/// a second config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enforce: bool,
    #[serde(default = "default_true")]
    pub inspect_content: bool,
    #[serde(default = "default_true")]
    pub dns_filtering: bool,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_global_rpm")]
    pub global_rate_limit_rpm: u32,
    #[serde(default = "default_upstream_timeout_sec")]
    pub upstream_timeout_sec: u64,
    pub audit_log_path: PathBuf,
    #[serde(default = "default_approval_ttl_sec")]
    pub approval_ttl_sec: u64,
    #[serde(default)]
    pub whitelist: Vec<WhitelistRuleConfig>,
    #[serde(default)]
    pub blocked_services: Vec<String>,
    /// Whether a Content Inspector pass truncated by the window limit
    /// auto-denies the request, rather than passing on the inspected
    /// prefix alone. Default false.
    #[serde(default)]
    pub deny_on_inspect_truncation: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_dns_upstream")]
    pub dns_upstream: SocketAddr,
    #[serde(default)]
    pub approval_queue_path: Option<PathBuf>,
    /// Path to the per-installation secret the Audit Log's hash chain is
    /// keyed by, loaded from the host keychain. Absent only in
    /// development; the orchestrator generates an ephemeral key and warns
    /// loudly when this is unset.
    #[serde(default)]
    pub audit_secret_path: Option<PathBuf>,
    /// The binary invoked to verify and drive the external container
    /// runtime. Defaults to `docker`; an operator on a podman host
    /// overrides this.
    #[serde(default = "default_container_runtime_binary")]
    pub container_runtime_binary: String,
    /// The worker container image to launch as boot step 6. `None` skips
    /// worker launch entirely — useful for running the proxy/DNS/approval
    /// stack standalone (tests, or a host that launches workers through a
    /// separate orchestration layer and only wants the egress gate).
    #[serde(default)]
    pub worker_image: Option<String>,

    /// The confinement root the Policy Engine's Path Confinement invariant
    /// resolves every filesystem operation against. Defaults to the
    /// current directory — a real deployment always overrides this to the
    /// agent's actual workspace mount.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// The operating mode the Policy Engine's Mode gate consults.
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Optional `.gitignore`-style pattern file of executables allow-listed
    /// for Exec operations under `Mode::Project`. `None` means the Command
    /// Classifier falls back to its hardcoded safe/high-risk sets alone.
    #[serde(default)]
    pub project_allowlist_path: Option<PathBuf>,
}

fn default_container_runtime_binary() -> String {
    "docker".to_string()
}

impl SandboxConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, OrchestratorError> {
        toml::from_str(content).map_err(|e| OrchestratorError::Config(format!("failed to parse egress config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("failed to read egress config at {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Field-level sanity checks beyond what serde's type system already
    /// enforces.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.proxy_port == 0 {
            return Err(OrchestratorError::Config("proxy_port must be nonzero".to_string()));
        }
        if self.dns_filtering && self.dns_port == 0 {
            return Err(OrchestratorError::Config("dns_port must be nonzero when dns_filtering is enabled".to_string()));
        }
        if self.dns_filtering && self.proxy_port == self.dns_port {
            return Err(OrchestratorError::Config("proxy_port and dns_port must differ".to_string()));
        }
        if self.global_rate_limit_rpm == 0 {
            return Err(OrchestratorError::Config("global_rate_limit_rpm must be nonzero".to_string()));
        }
        if self.approval_ttl_sec == 0 {
            return Err(OrchestratorError::Config("approval_ttl_sec must be nonzero".to_string()));
        }
        for rule in &self.whitelist {
            if rule.domain.trim().is_empty() {
                return Err(OrchestratorError::Config("whitelist entry has an empty domain".to_string()));
            }
        }
        for domain in &self.blocked_services {
            if domain.trim().is_empty() {
                return Err(OrchestratorError::Config("blocked_services entry is empty".to_string()));
            }
        }
        Ok(())
    }

    /// Lower this file's `whitelist`/`blocked_services` into the
    /// `aegis_policy::EgressConfig` the Policy Engine, Proxy, and DNS
    /// Filter all evaluate against. Blocked services come first so that
    /// `EgressConfig::decide`'s first-match-wins configured-rule scan
    /// denies them even if a whitelist entry for the same domain follows —
    /// the config-file-level form of a hard-coded deny set that
    /// short-circuits to deny even if a user rule would otherwise allow.
    pub fn to_egress_config(&self) -> EgressConfig {
        let mut rules: Vec<DomainRule> = self
            .blocked_services
            .iter()
            .map(|domain| DomainRule {
                pattern: domain.clone(),
                allow: false,
                allow_write: false,
                rate_limit_rpm: None,
                source: DomainSource::Configured,
            })
            .collect();
        rules.extend(self.whitelist.iter().map(|rule| DomainRule {
            pattern: rule.domain.clone(),
            allow: true,
            allow_write: rule.allow_write,
            rate_limit_rpm: rule.rate_limit_rpm,
            source: DomainSource::Configured,
        }));
        EgressConfig { rules }
    }

    pub fn proxy_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.proxy_port)
    }

    pub fn dns_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.dns_port)
    }

    pub fn approval_queue_path(&self) -> PathBuf {
        self.approval_queue_path
            .clone()
            .unwrap_or_else(|| self.audit_log_path.with_file_name("approval-queue.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            audit_log_path = "/tmp/aegis/audit.jsonl"

            [[whitelist]]
            domain = "docs.example.com"
            allow_write = false

            blocked_services = ["169.254.169.254"]
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        assert!(config.enforce);
        assert_eq!(config.proxy_port, 8443);
        assert_eq!(config.dns_port, 5353);
        assert_eq!(config.whitelist.len(), 1);
        assert_eq!(config.blocked_services, vec!["169.254.169.254".to_string()]);
    }

    #[test]
    fn validate_rejects_matching_proxy_and_dns_ports() {
        let mut config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        config.dns_port = config.proxy_port;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_rate_limit() {
        let mut config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        config.global_rate_limit_rpm = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn to_egress_config_places_blocked_services_before_whitelist() {
        let config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        let egress = config.to_egress_config();
        assert_eq!(egress.rules[0].pattern, "169.254.169.254");
        assert!(!egress.rules[0].allow);
        assert_eq!(egress.rules[1].pattern, "docs.example.com");
        assert!(egress.rules[1].allow);
    }

    #[test]
    fn blocked_service_denies_even_when_also_whitelisted() {
        let toml = r#"
            audit_log_path = "/tmp/aegis/audit.jsonl"
            blocked_services = ["evil.example.com"]

            [[whitelist]]
            domain = "evil.example.com"
            allow_write = true
        "#;
        let config = SandboxConfig::from_toml_str(toml).unwrap();
        let egress = config.to_egress_config();
        let decision = egress.decide("evil.example.com");
        assert!(!decision.allowed);
    }

    #[test]
    fn missing_required_audit_log_path_fails_to_parse() {
        let toml = r#"enforce = true"#;
        assert!(SandboxConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn approval_queue_path_defaults_alongside_audit_log() {
        let config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        assert_eq!(config.approval_queue_path(), PathBuf::from("/tmp/aegis/approval-queue.jsonl"));
    }

    #[test]
    fn workspace_root_and_mode_default_when_unset() {
        let config = SandboxConfig::from_toml_str(minimal_toml()).unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("."));
        assert_eq!(config.mode, aegis_policy::Mode::Project);
        assert!(config.project_allowlist_path.is_none());
    }

    #[test]
    fn workspace_root_and_mode_are_read_from_config() {
        let toml = r#"
            audit_log_path = "/tmp/aegis/audit.jsonl"
            workspace_root = "/home/agent/workspace"
            mode = "read_only"
        "#;
        let config = SandboxConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("/home/agent/workspace"));
        assert_eq!(config.mode, aegis_policy::Mode::ReadOnly);
    }
}
