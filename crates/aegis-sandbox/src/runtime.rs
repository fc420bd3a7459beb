// runtime.rs — The external container runtime boundary.
//
// The orchestrator never launches or supervises the agent's actual work —
// that's delegated to whatever container runtime the host operator already
// runs. All this crate owns is (a) verifying the runtime binary is present
// and healthy before bringing up the rest of the stack, and (b) the thin
// spawn/stop hooks a worker's lifecycle needs to be wired into boot/
// teardown ordering. Shells out to an external CLI and checks its exit
// status, rather than linking a Docker/OCI client library.

use std::process::Command;

use crate::error::OrchestratorError;

/// One worker container to bring up, keyed by the image and the env/args
/// the orchestrator injects (proxy address, DNS filter address).
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub image: String,
    pub proxy_addr: String,
    pub dns_addr: String,
    pub extra_env: Vec<(String, String)>,
}

/// A handle to a launched worker, sufficient to stop it again on teardown.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub container_id: String,
}

/// The boundary the orchestrator drives the external container runtime
/// through. Swappable so tests can substitute `NullContainerRuntime`
/// without shelling out to a real `docker`/`podman` binary.
pub trait ContainerRuntime: Send + Sync {
    /// Confirm the runtime binary is present and responsive. Called once
    /// at boot, as the second step; failure here is `RuntimeUnavailable`
    /// and aborts the boot sequence before any network listener binds.
    fn verify_available(&self) -> Result<(), OrchestratorError>;

    fn launch_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle, OrchestratorError>;

    fn stop_worker(&self, handle: &WorkerHandle) -> Result<(), OrchestratorError>;
}

/// Shells out to a configured container runtime binary (`docker` by
/// default; `podman` and compatible CLIs work identically).
pub struct ProcessContainerRuntime {
    binary: String,
}

impl ProcessContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl ContainerRuntime for ProcessContainerRuntime {
    fn verify_available(&self) -> Result<(), OrchestratorError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| OrchestratorError::RuntimeUnavailable(format!("{}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(OrchestratorError::RuntimeUnavailable(format!(
                "{} --version exited with {}",
                self.binary, output.status
            )));
        }
        Ok(())
    }

    fn launch_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle, OrchestratorError> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "-e".to_string(),
            format!("AEGIS_PROXY_ADDR={}", spec.proxy_addr),
            "-e".to_string(),
            format!("AEGIS_DNS_ADDR={}", spec.dns_addr),
        ];
        for (k, v) in &spec.extra_env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.clone());

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|e| OrchestratorError::RuntimeUnavailable(format!("{}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(OrchestratorError::RuntimeUnavailable(format!(
                "{} run exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(WorkerHandle { container_id })
    }

    fn stop_worker(&self, handle: &WorkerHandle) -> Result<(), OrchestratorError> {
        let output = Command::new(&self.binary)
            .args(["stop", &handle.container_id])
            .output()
            .map_err(|e| OrchestratorError::RuntimeUnavailable(format!("{}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(OrchestratorError::RuntimeUnavailable(format!(
                "{} stop exited with {}",
                self.binary, output.status
            )));
        }
        Ok(())
    }
}

/// A fake runtime for tests and the teardown-ordering unit tests in
/// `orchestrator.rs` — never shells out, just records calls.
#[cfg(any(test, feature = "test-util"))]
pub struct NullContainerRuntime {
    pub available: bool,
}

#[cfg(any(test, feature = "test-util"))]
impl ContainerRuntime for NullContainerRuntime {
    fn verify_available(&self) -> Result<(), OrchestratorError> {
        if self.available {
            Ok(())
        } else {
            Err(OrchestratorError::RuntimeUnavailable("no runtime configured in test".to_string()))
        }
    }

    fn launch_worker(&self, _spec: &WorkerSpec) -> Result<WorkerHandle, OrchestratorError> {
        Ok(WorkerHandle { container_id: "null-container".to_string() })
    }

    fn stop_worker(&self, _handle: &WorkerHandle) -> Result<(), OrchestratorError> {
        Ok(())
    }
}
