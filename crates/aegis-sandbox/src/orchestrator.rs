// orchestrator.rs — The Sandbox Orchestrator: boots the governed execution
// core's components in a fixed order, tears them back down in reverse on
// any failure, and keeps the live egress rule set hot-reloadable for the
// life of the process.
//
// Boot order:
//   1. Load and validate the egress config file.
//   2. Verify the external container runtime is reachable.
//   3. Open the Audit Log (hash-chained, keyed) and start its writer task.
//   4. Open the Approval Queue's persistence file (replaying any
//      crash-interrupted state) and construct the Policy Engine.
//   5. Bind and run the Egress Proxy.
//   6. Bring the Approval Queue fully online (sweeper task, lifecycle entry).
//   7. Bind and run the DNS Filter (if enabled).
// Each step writes a Lifecycle audit entry recording success or failure,
// and any failure unwinds everything already brought up, in reverse,
// before returning — the same bring-up/tear-down discipline applied
// around a single gateway server, generalized from "one server" to "an
// ordered chain of components that must agree on shutdown."

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aegis_audit::{AuditEvent, AuditEventKind, AuditLog, ChainKey, Outcome};
use aegis_mediation::{AuditHandle, DnsFilter, DnsFilterConfig, EgressProxy, ProxyConfig};
use aegis_policy::{
    AegisEngine, ApprovalQueue, AuditRecord, AuditSink as PolicyAuditSink, EgressConfig,
    ExemptionPatterns, Mode, Operation, PolicyCapabilities, PolicyError, RateLimitDecision,
    RateLimitPolicy, RateLimiter, Verdict, WorkspaceRoot,
};
use base64::Engine;
use notify::{RecursiveMode, Watcher};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::SandboxConfig;
use crate::error::OrchestratorError;
use crate::runtime::{ContainerRuntime, WorkerHandle, WorkerSpec};

const DOMAIN_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const OPERATION_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const APPROVAL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn lifecycle_event(outcome: Outcome, reason: impl Into<String>) -> AuditEvent {
    AuditEvent::new("orchestrator", AuditEventKind::Lifecycle, outcome, reason)
}

/// A running instance of the governed execution core. Dropping this
/// without calling `shutdown` first still stops the background tasks (they
/// hold only `Arc`/channel handles, no raw OS resources this type itself
/// owns), but skips the orderly teardown audit trail — callers should
/// always prefer `shutdown()`.
pub struct Orchestrator {
    config_path: PathBuf,
    egress: Arc<RwLock<EgressConfig>>,
    audit: AuditHandle,
    audit_writer: JoinHandle<()>,
    approvals: Arc<ApprovalQueue>,
    approval_sweeper: JoinHandle<()>,
    proxy_task: JoinHandle<Result<(), aegis_mediation::MediationError>>,
    dns_task: Option<JoinHandle<Result<(), aegis_mediation::MediationError>>>,
    watcher: Option<notify::RecommendedWatcher>,
    runtime: Arc<dyn ContainerRuntime>,
    worker: Option<WorkerHandle>,
    /// The Policy Engine the Orchestrator owns for the life of the
    /// process — every file/command operation the host submits is
    /// evaluated synchronously against it before it ever reaches the
    /// worker container's filesystem or process table.
    engine: Arc<AegisEngine>,
    operation_limiter: Arc<RateLimiter>,
    approval_ttl: Duration,
    mode: Mode,
}

impl Orchestrator {
    /// Run the full boot sequence. On any step's failure, every
    /// already-started component is torn down in reverse order before the
    /// error is returned — the orchestrator never leaves a partial stack
    /// running.
    pub async fn boot(
        config_path: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, OrchestratorError> {
        // Step 1: config.
        let config = SandboxConfig::load(&config_path)?;
        let chain_key = load_or_generate_chain_key(&config)?;

        // Step 2: container runtime reachability.
        runtime.verify_available()?;

        // Step 3: audit log + writer task.
        let log = AuditLog::open(&config.audit_log_path, chain_key)
            .map_err(|e| OrchestratorError::AuditUnwritable(e.to_string()))?;
        let (audit, audit_writer) = AuditHandle::spawn(log);
        audit.record(lifecycle_event(Outcome::Info, "container runtime verified"));
        audit.record(lifecycle_event(Outcome::Info, "audit log opened"));

        // Step 4: Approval Queue persistence file + Policy Engine. The
        // queue object itself must exist before the Egress Proxy can be
        // constructed (its constructor takes a shared handle to it), but
        // its sweeper task and "opened" lifecycle entry wait until after
        // the proxy is confirmed bound (step 6, below) — the queue file is
        // open, but the queue isn't "running" yet.
        let approvals = Arc::new(ApprovalQueue::open(config.approval_queue_path())?);

        let egress = Arc::new(RwLock::new(config.to_egress_config()));
        let workspace_root = WorkspaceRoot::new(&config.workspace_root)?;
        let project_allowlist = match &config.project_allowlist_path {
            Some(path) => Some(ExemptionPatterns::load_or_empty(path)),
            None => None,
        };
        let engine = Arc::new(AegisEngine::new(workspace_root, egress.clone(), project_allowlist));
        let operation_limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            config.global_rate_limit_rpm as usize,
            OPERATION_RATE_LIMIT_WINDOW,
        )));

        // Step 5: Egress Proxy.
        let domain_rate_limit = RateLimitPolicy::new(config.global_rate_limit_rpm as usize, DOMAIN_RATE_LIMIT_WINDOW);
        let global_rate_limit = RateLimitPolicy::new(config.global_rate_limit_rpm as usize, DOMAIN_RATE_LIMIT_WINDOW);
        let proxy = Arc::new(EgressProxy::new(
            egress.clone(),
            audit.clone(),
            approvals.clone(),
            domain_rate_limit,
            global_rate_limit,
            config.enforce,
            config.inspect_content,
            ExemptionPatterns::inspection_defaults(),
        ));
        let proxy_config = ProxyConfig {
            listen_addr: config.proxy_listen_addr(),
            upstream_timeout: Duration::from_secs(config.upstream_timeout_sec),
            idle_tunnel_timeout: Duration::from_secs(config.upstream_timeout_sec),
            approval_wait_timeout: Duration::from_secs(config.approval_ttl_sec),
        };
        let bound_proxy_addr = proxy_config.listen_addr;
        let proxy_task = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run(proxy_config).await })
        };
        // Give the bind a moment to fail fast rather than discovering a
        // port conflict only once the first connection is refused.
        tokio::task::yield_now().await;
        if proxy_task.is_finished() {
            let _ = shutdown_partial(audit.clone(), audit_writer, None, approvals, None, None).await;
            return Err(OrchestratorError::PortBindFailure(format!(
                "egress proxy failed to bind {bound_proxy_addr}"
            )));
        }
        audit.record(lifecycle_event(Outcome::Info, format!("egress proxy listening on {bound_proxy_addr}")));

        // Step 6: Approval Queue goes live — sweeper started, now that the
        // proxy it feeds approval requests to is confirmed up.
        audit.record(lifecycle_event(Outcome::Info, "approval queue opened"));
        let approval_sweeper = spawn_approval_sweeper(approvals.clone(), audit.clone());

        // Step 7: DNS filter (optional per config).
        let dns_task = if config.dns_filtering {
            let filter = Arc::new(DnsFilter::new(egress.clone(), audit.clone(), config.enforce));
            let dns_config = DnsFilterConfig {
                listen_addr: config.dns_listen_addr(),
                upstream_addr: config.dns_upstream,
                upstream_timeout: Duration::from_secs(config.upstream_timeout_sec),
            };
            let bound_dns_addr = dns_config.listen_addr;
            let task = tokio::spawn(async move { filter.run(dns_config).await });
            tokio::task::yield_now().await;
            if task.is_finished() {
                task.abort();
                proxy_task.abort();
                let _ = shutdown_partial(audit.clone(), audit_writer, Some(approval_sweeper), approvals, None, None).await;
                return Err(OrchestratorError::PortBindFailure(format!(
                    "dns filter failed to bind {bound_dns_addr}"
                )));
            }
            audit.record(lifecycle_event(Outcome::Info, format!("dns filter listening on {bound_dns_addr}")));
            Some(task)
        } else {
            None
        };

        let watcher = spawn_config_watcher(config_path.clone(), egress.clone(), audit.clone());

        // Step 8: launch the worker container, its sole egress path being
        // the proxy/DNS filter just brought up. Skipped when no image is
        // configured — the stack then runs as a standalone egress gate.
        let worker = match &config.worker_image {
            Some(image) => {
                let spec = WorkerSpec {
                    image: image.clone(),
                    proxy_addr: bound_proxy_addr.to_string(),
                    dns_addr: dns_task
                        .as_ref()
                        .map(|_| config.dns_listen_addr().to_string())
                        .unwrap_or_default(),
                    extra_env: Vec::new(),
                };
                match runtime.launch_worker(&spec) {
                    Ok(handle) => {
                        audit.record(lifecycle_event(Outcome::Info, format!("worker container {} launched", handle.container_id)));
                        Some(handle)
                    }
                    Err(err) => {
                        if let Some(task) = dns_task {
                            task.abort();
                        }
                        proxy_task.abort();
                        let _ = shutdown_partial(audit.clone(), audit_writer, Some(approval_sweeper), approvals, None, None).await;
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        audit.record(lifecycle_event(Outcome::Info, "boot sequence complete"));

        Ok(Self {
            config_path,
            egress,
            audit,
            audit_writer,
            approvals,
            approval_sweeper,
            proxy_task,
            dns_task,
            watcher,
            runtime,
            worker,
            engine,
            operation_limiter,
            approval_ttl: Duration::from_secs(config.approval_ttl_sec),
            mode: config.mode,
        })
    }

    /// Evaluate `operation` against every AEGIS invariant, synchronously,
    /// using the Orchestrator's own rate limiter, Approval Queue, and
    /// Audit Log as the Policy Engine's capability/audit seams. This is
    /// the one call path every file and command operation an agent
    /// attempts must go through before it reaches the worker container.
    pub fn evaluate(&self, operation: &Operation) -> Verdict {
        let caps = EngineCapabilities {
            limiter: self.operation_limiter.clone(),
            approvals: self.approvals.clone(),
            approval_ttl: self.approval_ttl,
            mode: self.mode,
        };
        let sink = EngineAuditSink { audit: self.audit.clone() };
        self.engine.evaluate(operation, &caps, &sink)
    }

    /// Atomically replace the live egress rule set with whatever the
    /// config file on disk currently says, validating first so a bad edit
    /// never clears the rule set to empty-deny-all mid-flight.
    pub async fn reload(&self) -> Result<(), OrchestratorError> {
        let config = SandboxConfig::load(&self.config_path)?;
        let new_rules = config.to_egress_config();
        *self.egress.write().await = new_rules;
        self.audit.record(lifecycle_event(Outcome::Info, "egress config reloaded"));
        Ok(())
    }

    /// Tear down every component in the reverse of boot order, waiting for
    /// the audit writer to drain so the final Lifecycle entry is durably
    /// chained before returning.
    pub async fn shutdown(self) -> Result<(), OrchestratorError> {
        self.audit.record(lifecycle_event(Outcome::Info, "shutdown requested"));
        drop(self.watcher);
        if let Some(handle) = &self.worker {
            if let Err(err) = self.runtime.stop_worker(handle) {
                tracing::warn!(error = %err, "failed to stop worker container during shutdown");
            }
        }
        if let Some(task) = self.dns_task {
            task.abort();
        }
        self.proxy_task.abort();
        self.approval_sweeper.abort();
        drop(self.approvals);
        drop(self.audit);
        // Dropping every AuditHandle clone closes the writer's channel; the
        // writer task then drains and exits on its own.
        let _ = self.audit_writer.await;
        Ok(())
    }

    pub fn approvals(&self) -> Arc<ApprovalQueue> {
        self.approvals.clone()
    }
}

async fn shutdown_partial(
    audit: AuditHandle,
    audit_writer: JoinHandle<()>,
    approval_sweeper: Option<JoinHandle<()>>,
    approvals: Arc<ApprovalQueue>,
    proxy_task: Option<JoinHandle<Result<(), aegis_mediation::MediationError>>>,
    dns_task: Option<JoinHandle<Result<(), aegis_mediation::MediationError>>>,
) {
    if let Some(t) = proxy_task {
        t.abort();
    }
    if let Some(t) = dns_task {
        t.abort();
    }
    if let Some(t) = approval_sweeper {
        t.abort();
    }
    drop(approvals);
    audit.record(lifecycle_event(Outcome::Fail, "boot aborted; unwinding partial stack"));
    drop(audit);
    let _ = audit_writer.await;
}

/// Adapts the Orchestrator's own rate limiter, Approval Queue, and mode
/// setting into the `PolicyCapabilities` seam `AegisEngine::evaluate`
/// consults. Built fresh per call rather than stored on `Orchestrator`
/// itself, since it borrows nothing and every field is a cheap `Arc` clone.
struct EngineCapabilities {
    limiter: Arc<RateLimiter>,
    approvals: Arc<ApprovalQueue>,
    approval_ttl: Duration,
    mode: Mode,
}

impl PolicyCapabilities for EngineCapabilities {
    fn rate_limit_check(&self, subject: &str) -> RateLimitDecision {
        self.limiter.check(subject)
    }

    fn submit_for_approval(&self, operation: &Operation, prompt: String) -> Result<uuid::Uuid, PolicyError> {
        self.approvals.submit(operation, prompt, self.approval_ttl)
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}

/// Adapts the Audit Log into the `AuditSink` seam `AegisEngine::evaluate`
/// writes every verdict to.
struct EngineAuditSink {
    audit: AuditHandle,
}

impl PolicyAuditSink for EngineAuditSink {
    fn record(&self, record: AuditRecord) {
        let outcome = match record.outcome.as_str() {
            "pass" => Outcome::Pass,
            "fail" => Outcome::Fail,
            "ask" => Outcome::Ask,
            _ => Outcome::Info,
        };
        let mut event = AuditEvent::new("policy_engine", AuditEventKind::PolicyDecision, outcome, record.reason)
            .with_subject(record.operation_summary);
        if let Some(rule) = record.rule_matched {
            event = event.with_rule_matched(rule);
        }
        self.audit.record(event);
    }
}

fn spawn_approval_sweeper(approvals: Arc<ApprovalQueue>, audit: AuditHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(APPROVAL_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match approvals.expire_stale() {
                Ok(expired) => {
                    for id in expired {
                        audit.record(
                            AuditEvent::new("orchestrator", AuditEventKind::ApprovalExpired, Outcome::Info, "approval request expired")
                                .with_subject(id.to_string()),
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "approval sweep failed");
                }
            }
        }
    })
}

/// Watch the config file for changes and reload the live egress rule set
/// on every write, using the workspace's `notify` dependency.
fn spawn_config_watcher(
    path: PathBuf,
    egress: Arc<RwLock<EgressConfig>>,
    audit: AuditHandle,
) -> Option<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    }) {
        Ok(w) => w,
        Err(err) => {
            tracing::warn!(error = %err, "config watcher unavailable; hot-reload disabled");
            return None;
        }
    };
    if let Err(err) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %err, "failed to watch config path; hot-reload disabled");
        return None;
    }

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !event.kind.is_modify() {
                continue;
            }
            match SandboxConfig::load(&path) {
                Ok(config) => {
                    *egress.write().await = config.to_egress_config();
                    audit.record(lifecycle_event(Outcome::Info, "egress config hot-reloaded"));
                }
                Err(err) => {
                    audit.record(lifecycle_event(Outcome::Fail, format!("config reload rejected: {err}")));
                }
            }
        }
    });

    Some(watcher)
}

fn load_or_generate_chain_key(config: &SandboxConfig) -> Result<ChainKey, OrchestratorError> {
    match &config.audit_secret_path {
        Some(path) => ChainKey::load_from_file(path).map_err(|e| OrchestratorError::AuditUnwritable(e.to_string())),
        None => {
            let mut secret = [0u8; 32];
            ring_fill(&mut secret)?;
            // Logged once so an operator can persist it to audit_secret_path
            // and verify past segments after a restart; raw bytes never hit
            // the log, only their base64 encoding.
            tracing::warn!(
                ephemeral_key_b64 = %base64::engine::general_purpose::STANDARD.encode(secret),
                "no audit_secret_path configured; generating an ephemeral chain key for this process only"
            );
            Ok(ChainKey::from_secret_bytes(&secret))
        }
    }
}

fn ring_fill(buf: &mut [u8]) -> Result<(), OrchestratorError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| OrchestratorError::Other("failed to generate ephemeral audit key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NullContainerRuntime;

    fn write_config(dir: &tempfile::TempDir) -> PathBuf {
        let audit_path = dir.path().join("audit.jsonl");
        let content = format!(
            r#"
                audit_log_path = "{}"
                proxy_port = 18443
                dns_port = 15353
            "#,
            audit_path.display()
        );
        let config_path = dir.path().join("egress.toml");
        std::fs::write(&config_path, content).unwrap();
        config_path
    }

    #[tokio::test]
    async fn boot_fails_fast_when_runtime_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullContainerRuntime { available: false });
        let result = Orchestrator::boot(config_path, runtime).await;
        assert!(matches!(result, Err(OrchestratorError::RuntimeUnavailable(_))));
    }

    #[tokio::test]
    async fn boot_fails_with_config_error_on_missing_file() {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullContainerRuntime { available: true });
        let result = Orchestrator::boot(PathBuf::from("/nonexistent/egress.toml"), runtime).await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn boot_and_shutdown_full_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullContainerRuntime { available: true });
        let orchestrator = Orchestrator::boot(config_path, runtime).await.unwrap();
        assert!(orchestrator.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn reload_picks_up_new_blocked_service() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullContainerRuntime { available: true });
        let orchestrator = Orchestrator::boot(config_path.clone(), runtime).await.unwrap();

        let mut content = std::fs::read_to_string(&config_path).unwrap();
        content.push_str("\nblocked_services = [\"evil.example.com\"]\n");
        std::fs::write(&config_path, content).unwrap();

        orchestrator.reload().await.unwrap();
        let egress = orchestrator.egress.read().await;
        assert!(!egress.decide("evil.example.com").allowed);
        drop(egress);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn evaluate_passes_a_read_inside_the_workspace_and_fails_one_outside_it() {
        use aegis_policy::{OperationKind, OperationTarget};

        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir);
        let mut content = std::fs::read_to_string(&config_path).unwrap();
        content.push_str(&format!("\nworkspace_root = \"{}\"\n", dir.path().display()));
        std::fs::write(&config_path, content).unwrap();

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullContainerRuntime { available: true });
        let orchestrator = Orchestrator::boot(config_path, runtime).await.unwrap();

        let inside = Operation::new(
            OperationKind::Read,
            OperationTarget::Path { path: dir.path().join("notes.txt"), argv: None, additional_targets: None },
        );
        assert!(matches!(orchestrator.evaluate(&inside), Verdict::Pass));

        let outside = Operation::new(
            OperationKind::Read,
            OperationTarget::Path { path: PathBuf::from("/etc/passwd"), argv: None, additional_targets: None },
        );
        assert!(matches!(orchestrator.evaluate(&outside), Verdict::Fail { .. }));

        orchestrator.shutdown().await.unwrap();
    }
}
