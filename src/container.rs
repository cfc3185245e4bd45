//! Container lifecycle contract.
//!
//! The broker core never talks to a container engine directly; it goes
//! through [`ContainerAdapter`]. The production implementation drives the
//! engine CLI ([`docker::DockerCli`]); tests use the deterministic
//! in-memory [`fake::FakeSandbox`]. Keeping the seam here means every
//! lifecycle path (create, attach, health, reconcile, teardown) is
//! testable without an engine on the host.

pub mod docker;
pub mod fake;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Label attached to every container the broker manages; reconcile only
/// ever touches containers carrying it.
pub const MANAGED_LABEL: &str = "io.shellgate.managed";

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to create container: {0}")]
    Create(String),

    #[error("failed to attach to container {0}: {1}")]
    Attach(String, String),

    #[error("failed to stop container {0}: {1}")]
    Stop(String, String),

    #[error("failed to remove container {0}: {1}")]
    Remove(String, String),

    #[error("reconcile failed: {0}")]
    Reconcile(String),

    #[error("failed to resize container terminal: {0}")]
    Resize(String),

    #[error("engine unavailable: {0}")]
    Engine(String),
}

/// Opaque reference to a live container. The core stores and passes it
/// around but never interprets the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Health classification for a session's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Unhealthy,
    Gone,
}

/// Streams bound to an attached container shell.
///
/// `stdin` accepts client bytes; `output` yields stdout/stderr in order;
/// `resize` propagates TTY size changes; `exited` resolves when the shell
/// process ends. The adapter owns whatever pump tasks are needed behind
/// these channels and tears them down when the channels close.
pub struct ContainerIo {
    pub stdin: mpsc::Sender<Bytes>,
    pub output: mpsc::Receiver<Bytes>,
    pub resize: Box<dyn Fn(u16, u16) -> Result<(), ContainerError> + Send + Sync>,
    pub exited: oneshot::Receiver<()>,
}

/// What startup reconciliation found and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub left_running: Vec<String>,
}

/// Engine-agnostic container lifecycle operations.
///
/// Implementations must tolerate concurrent calls; the core never holds a
/// registry lock across any of these.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    /// Startup pass: remove non-running containers carrying the management
    /// label, leave running ones alone.
    async fn reconcile(&self) -> Result<ReconcileReport, ContainerError>;

    /// Create a sandboxed container for `session_id` with the configured
    /// security posture and the given environment overrides. The container
    /// is created but not attached.
    async fn create(
        &self,
        session_id: &str,
        env: &HashMap<String, String>,
    ) -> Result<ContainerHandle, ContainerError>;

    /// Start (if necessary) and attach to the container's shell.
    async fn attach(
        &self,
        handle: &ContainerHandle,
        rows: u16,
        cols: u16,
    ) -> Result<ContainerIo, ContainerError>;

    /// Stop the shell, allowing `grace` before the engine kills it.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), ContainerError>;

    /// Remove the container and its resources.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError>;

    /// Classify the given containers. Absent handles classify as `Gone`.
    async fn health_check(
        &self,
        handles: &[ContainerHandle],
    ) -> HashMap<ContainerHandle, HealthStatus>;
}
