//! Deterministic in-memory container adapter.
//!
//! Simulates create/attach/exit without an engine: the "shell" echoes stdin
//! back as output and exits when it sees an `exit` line. Tests use the
//! extra handles (`inject_output`, `mark_gone`, `fail_next_create`,
//! `remove_calls`) to drive scenarios the real engine would produce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{
    ContainerAdapter, ContainerError, ContainerHandle, ContainerIo, HealthStatus,
    ReconcileReport,
};

const IO_CHANNEL_CAPACITY: usize = 64;

struct FakeContainer {
    running: bool,
    gone: bool,
    env: HashMap<String, String>,
    resizes: Vec<(u16, u16)>,
    /// Present while attached; lets tests inject output as if the shell
    /// had written it.
    output_tx: Option<mpsc::Sender<Bytes>>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    remove_calls: Vec<String>,
}

#[derive(Clone)]
pub struct FakeSandbox {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
    fail_create: Arc<AtomicBool>,
    fail_attach: Arc<AtomicBool>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_id: Arc::new(AtomicU64::new(0)),
            fail_create: Arc::new(AtomicBool::new(false)),
            fail_attach: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the next `create` call fail.
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make the next `attach` call fail.
    pub fn fail_next_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Simulate the engine losing the container entirely.
    pub fn mark_gone(&self, handle: &ContainerHandle) {
        if let Some(c) = self.state.lock().containers.get_mut(handle.id()) {
            c.gone = true;
            c.running = false;
        }
    }

    /// Write bytes to the attached session as if the shell produced them.
    pub async fn inject_output(&self, handle: &ContainerHandle, data: &[u8]) -> bool {
        let tx = self
            .state
            .lock()
            .containers
            .get(handle.id())
            .and_then(|c| c.output_tx.clone());
        match tx {
            Some(tx) => tx.send(Bytes::copy_from_slice(data)).await.is_ok(),
            None => false,
        }
    }

    /// Ids `remove` has been called with, in order.
    pub fn remove_calls(&self) -> Vec<String> {
        self.state.lock().remove_calls.clone()
    }

    pub fn container_count(&self) -> usize {
        let state = self.state.lock();
        state.containers.values().filter(|c| !c.gone).count()
    }

    pub fn env_of(&self, handle: &ContainerHandle) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.env.clone())
    }

    pub fn resizes_of(&self, handle: &ContainerHandle) -> Vec<(u16, u16)> {
        self.state
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.resizes.clone())
            .unwrap_or_default()
    }

    /// Pre-seed a container as the reconcile pass would find it.
    pub fn seed_container(&self, id: &str, running: bool) {
        self.state.lock().containers.insert(
            id.to_string(),
            FakeContainer {
                running,
                gone: false,
                env: HashMap::new(),
                resizes: Vec::new(),
                output_tx: None,
            },
        );
    }
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerAdapter for FakeSandbox {
    async fn reconcile(&self) -> Result<ReconcileReport, ContainerError> {
        let mut state = self.state.lock();
        let mut report = ReconcileReport::default();
        state.containers.retain(|id, container| {
            if container.running {
                report.left_running.push(id.clone());
                true
            } else {
                report.removed.push(id.clone());
                false
            }
        });
        Ok(report)
    }

    async fn create(
        &self,
        _session_id: &str,
        env: &HashMap<String, String>,
    ) -> Result<ContainerHandle, ContainerError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(ContainerError::Create("injected create failure".into()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.lock().containers.insert(
            id.clone(),
            FakeContainer {
                running: true,
                gone: false,
                env: env.clone(),
                resizes: Vec::new(),
                output_tx: None,
            },
        );
        Ok(ContainerHandle::new(id))
    }

    async fn attach(
        &self,
        handle: &ContainerHandle,
        _rows: u16,
        _cols: u16,
    ) -> Result<ContainerIo, ContainerError> {
        if self.fail_attach.swap(false, Ordering::SeqCst) {
            return Err(ContainerError::Attach(
                handle.id().to_string(),
                "injected attach failure".into(),
            ));
        }
        {
            let state = self.state.lock();
            let container = state.containers.get(handle.id()).ok_or_else(|| {
                ContainerError::Attach(handle.id().to_string(), "no such container".into())
            })?;
            if container.gone {
                return Err(ContainerError::Attach(
                    handle.id().to_string(),
                    "container is gone".into(),
                ));
            }
        }

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(IO_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(IO_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel::<()>();

        {
            let mut state = self.state.lock();
            if let Some(c) = state.containers.get_mut(handle.id()) {
                c.output_tx = Some(output_tx.clone());
            }
        }

        // The fake shell: echo stdin verbatim, exit on an `exit` line.
        let state = self.state.clone();
        let id = handle.id().to_string();
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                let wants_exit = String::from_utf8_lossy(&data)
                    .lines()
                    .any(|l| l.trim() == "exit");
                if output_tx.send(data).await.is_err() {
                    break;
                }
                if wants_exit {
                    break;
                }
            }
            if let Some(c) = state.lock().containers.get_mut(&id) {
                c.running = false;
                c.output_tx = None;
            }
            let _ = exit_tx.send(());
        });

        let state = self.state.clone();
        let id = handle.id().to_string();
        let resize: Box<dyn Fn(u16, u16) -> Result<(), ContainerError> + Send + Sync> =
            Box::new(move |rows, cols| {
                if let Some(c) = state.lock().containers.get_mut(&id) {
                    c.resizes.push((rows, cols));
                }
                Ok(())
            });

        Ok(ContainerIo {
            stdin: stdin_tx,
            output: output_rx,
            resize,
            exited: exit_rx,
        })
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), ContainerError> {
        if let Some(c) = self.state.lock().containers.get_mut(handle.id()) {
            c.running = false;
            c.output_tx = None;
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        state.remove_calls.push(handle.id().to_string());
        state.containers.remove(handle.id());
        Ok(())
    }

    async fn health_check(
        &self,
        handles: &[ContainerHandle],
    ) -> HashMap<ContainerHandle, HealthStatus> {
        let state = self.state.lock();
        handles
            .iter()
            .map(|handle| {
                let status = match state.containers.get(handle.id()) {
                    None => HealthStatus::Gone,
                    Some(c) if c.gone => HealthStatus::Gone,
                    Some(c) if c.running => HealthStatus::Ok,
                    Some(_) => HealthStatus::Unhealthy,
                };
                (handle.clone(), status)
            })
            .collect()
    }
}
