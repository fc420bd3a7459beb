// domain.rs — Domain Rules and the Egress Config they live in.
//
// The live rule set is read far more often than it's written (reloaded on
// SIGHUP / config-file change), so it's held by the orchestrator behind
// `Arc<RwLock<EgressConfig>>` — a read-copy-update pattern for hot-reloadable
// config, rather than pulling in a dedicated arc-swap dependency.

use glob::Pattern;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainSource {
    /// Baked into the binary — the LLM provider domains the agent cannot
    /// function without, and the cloud control-plane domains it must never
    /// reach regardless of operator configuration.
    Hardcoded,
    /// Loaded from the egress config file at startup or reload.
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRule {
    /// A bare domain (`api.anthropic.com`) or a `*.`-prefixed suffix
    /// wildcard (`*.githubusercontent.com`).
    pub pattern: String,
    pub allow: bool,
    /// Whether a write-side method (POST/PUT/PATCH/DELETE) to this domain
    /// is auto-ok, as opposed to requiring an Approval Queue round-trip.
    /// Distinct from `allow`: a rule can permit reaching a domain read-only
    /// while still gating every write through human review.
    #[serde(default)]
    pub allow_write: bool,
    /// Per-domain sliding-window limit, in requests per minute. `None`
    /// defers entirely to the proxy's global limit.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    pub source: DomainSource,
}

impl DomainRule {
    pub fn matches(&self, host: &str) -> bool {
        if let Some(suffix) = self.pattern.strip_prefix("*.") {
            return host == suffix || host.ends_with(&format!(".{suffix}"));
        }
        // Fall back to glob matching for any other wildcard shape an
        // operator might write in the config file.
        if self.pattern.contains('*') {
            return Pattern::new(&self.pattern)
                .map(|p| p.matches(host))
                .unwrap_or(false);
        }
        self.pattern.eq_ignore_ascii_case(host)
    }
}

/// Cloud control-plane / management-plane hosts an agent must never reach
/// even if an operator's config file mistakenly allows them — these are
/// where credential theft turns into account takeover.
const HARDCODED_DENY_DOMAINS: &[&str] = &[
    "169.254.169.254", // cloud instance metadata service
    "metadata.google.internal",
    "*.iam.amazonaws.com",
    "sts.amazonaws.com",
    "*.ec2.amazonaws.com",
];

/// LLM provider API domains the agent needs to function at all — seeded
/// unconditionally so a misconfigured or absent egress config file cannot
/// strand the agent without model access while still being denied
/// everything else.
const HARDCODED_ALLOW_DOMAINS: &[&str] = &[
    "api.anthropic.com",
    "api.openai.com",
    "generativelanguage.googleapis.com",
];

fn hardcoded_rules() -> Vec<DomainRule> {
    let mut rules: Vec<DomainRule> = HARDCODED_DENY_DOMAINS
        .iter()
        .map(|p| DomainRule {
            pattern: p.to_string(),
            allow: false,
            allow_write: false,
            rate_limit_rpm: None,
            source: DomainSource::Hardcoded,
        })
        .collect();
    // The LLM provider carve-out permits writes outright — an agent that
    // cannot POST a chat completion request to its own model provider
    // cannot function at all.
    rules.extend(HARDCODED_ALLOW_DOMAINS.iter().map(|p| DomainRule {
        pattern: p.to_string(),
        allow: true,
        allow_write: true,
        rate_limit_rpm: None,
        source: DomainSource::Hardcoded,
    }));
    rules
}

/// True iff `host` matches one of the hardcoded LLM provider domains — the
/// Content Inspector and protocol-downgrade checks in the Egress Proxy skip
/// these, since their request bodies are the agent's own model traffic, not
/// untrusted write-side payloads headed to an arbitrary domain.
pub fn is_llm_domain(host: &str) -> bool {
    HARDCODED_ALLOW_DOMAINS
        .iter()
        .any(|p| DomainRule {
            pattern: p.to_string(),
            allow: true,
            allow_write: true,
            rate_limit_rpm: None,
            source: DomainSource::Hardcoded,
        }
        .matches(host))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    #[serde(default)]
    pub rules: Vec<DomainRule>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl EgressConfig {
    /// Decide whether `host` is permitted egress under this configuration.
    ///
    /// Evaluation order: hardcoded deny first (nothing overrides it), then
    /// hardcoded allow, then configured rules in file order, first match
    /// wins. An unmatched host is denied — default-closed.
    pub fn decide(&self, host: &str) -> DomainDecision {
        for rule in hardcoded_rules().iter().filter(|r| !r.allow) {
            if rule.matches(host) {
                return DomainDecision {
                    allowed: false,
                    matched_rule: Some(rule.clone()),
                };
            }
        }
        for rule in hardcoded_rules().iter().filter(|r| r.allow) {
            if rule.matches(host) {
                return DomainDecision {
                    allowed: true,
                    matched_rule: Some(rule.clone()),
                };
            }
        }
        for rule in &self.rules {
            if rule.matches(host) {
                return DomainDecision {
                    allowed: rule.allow,
                    matched_rule: Some(rule.clone()),
                };
            }
        }
        DomainDecision {
            allowed: false,
            matched_rule: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDecision {
    pub allowed: bool,
    pub matched_rule: Option<DomainRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(pattern: &str, allow: bool) -> DomainRule {
        DomainRule {
            pattern: pattern.to_string(),
            allow,
            allow_write: false,
            rate_limit_rpm: None,
            source: DomainSource::Configured,
        }
    }

    #[test]
    fn hardcoded_allow_domain_passes_with_empty_config() {
        let cfg = EgressConfig::default();
        let d = cfg.decide("api.anthropic.com");
        assert!(d.allowed);
        assert_eq!(d.matched_rule.unwrap().source, DomainSource::Hardcoded);
    }

    #[test]
    fn hardcoded_llm_domain_permits_writes() {
        assert!(is_llm_domain("api.anthropic.com"));
        assert!(!is_llm_domain("evil.example.com"));
    }

    #[test]
    fn instance_metadata_ip_is_always_denied() {
        let cfg = EgressConfig { rules: vec![configured("169.254.169.254", true)] };
        // Even an operator's explicit allow rule for this host cannot win:
        // hardcoded deny is checked first.
        let d = cfg.decide("169.254.169.254");
        assert!(!d.allowed);
    }

    #[test]
    fn unmatched_host_is_denied_by_default() {
        let cfg = EgressConfig::default();
        let d = cfg.decide("evil.example.com");
        assert!(!d.allowed);
        assert!(d.matched_rule.is_none());
    }

    #[test]
    fn wildcard_suffix_matches_subdomains_but_not_unrelated_domains() {
        let cfg = EgressConfig { rules: vec![configured("*.githubusercontent.com", true)] };
        assert!(cfg.decide("raw.githubusercontent.com").allowed);
        assert!(cfg.decide("githubusercontent.com").allowed);
        assert!(!cfg.decide("notgithubusercontent.com").allowed);
    }

    #[test]
    fn first_matching_configured_rule_wins() {
        let cfg = EgressConfig {
            rules: vec![configured("*.example.com", false), configured("api.example.com", true)],
        };
        // The broader deny rule appears first, so it wins even though a
        // more specific allow rule also matches.
        assert!(!cfg.decide("api.example.com").allowed);
    }

    #[test]
    fn allow_write_defaults_to_false_for_configured_rules() {
        let rule = configured("docs.example.com", true);
        assert!(!rule.allow_write);
    }
}
