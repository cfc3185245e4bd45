//! Container adapter driving the engine CLI (`docker`, podman-compatible).
//!
//! Lifecycle calls (`create`, `stop`, `rm`, `inspect`, `ps`) go through
//! `tokio::process`. Attach is the exception: `docker start -a -i` runs
//! under a local pseudo-terminal so the sandbox shell gets a real TTY and
//! resize propagates without engine-API attach support. The TTY plumbing
//! lives here because only the engine CLI ever sits on one; the broker
//! core deals purely in the channel pairs of [`ContainerIo`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::ContainerLimits;

use super::{
    ContainerAdapter, ContainerError, ContainerHandle, ContainerIo, HealthStatus,
    ReconcileReport, MANAGED_LABEL,
};

/// Capacity of the stdin/output channels between the broker and the pumps.
const IO_CHANNEL_CAPACITY: usize = 64;

pub struct DockerCli {
    binary: String,
    limits: ContainerLimits,
}

/// The engine CLI held on a local PTY for one attach. The master stays
/// behind a mutex so the resize path can reach it from any task while the
/// blocking pumps own the reader and writer halves.
struct CliTty {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
}

/// Put `cmd` on a fresh PTY of the given dimensions. The slave side is
/// dropped once the child holds it; the kept master drives reads, writes
/// and resizes for the lifetime of the attachment.
fn spawn_cli_tty(cmd: CommandBuilder, rows: u16, cols: u16) -> Result<CliTty, String> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| format!("openpty: {e}"))?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| format!("spawn engine cli: {e}"))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("clone reader: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("take writer: {e}"))?;
    // The child owns its copy of the slave fd now.
    drop(pair.slave);
    Ok(CliTty {
        master: Arc::new(Mutex::new(pair.master)),
        reader,
        writer,
        child: Some(child),
    })
}

impl DockerCli {
    pub fn new(limits: ContainerLimits) -> Self {
        Self::with_binary("docker", limits)
    }

    /// Use a different engine CLI (`podman` speaks the same dialect).
    pub fn with_binary(binary: impl Into<String>, limits: ContainerLimits) -> Self {
        Self {
            binary: binary.into(),
            limits,
        }
    }

    /// Run an engine command, returning trimmed stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String, ContainerError> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::Engine(format!("{}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ContainerError::Engine(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )))
        }
    }

    /// Make sure the sandbox image exists locally, pulling it if not.
    async fn ensure_image(&self) -> Result<(), ContainerError> {
        if self
            .run(&["image", "inspect", &self.limits.image, "--format", "{{.Id}}"])
            .await
            .is_ok()
        {
            return Ok(());
        }
        tracing::info!(image = %self.limits.image, "sandbox image missing, pulling");
        self.run(&["pull", &self.limits.image])
            .await
            .map_err(|e| ContainerError::Create(format!("image pull failed: {e}")))?;
        Ok(())
    }

    /// Resolve the isolated network, falling back to the engine default.
    async fn resolve_network(&self) -> String {
        match self
            .run(&["network", "inspect", &self.limits.network, "--format", "{{.Id}}"])
            .await
        {
            Ok(_) => self.limits.network.clone(),
            Err(_) => {
                tracing::warn!(
                    network = %self.limits.network,
                    "configured network not found, falling back to bridge"
                );
                "bridge".to_string()
            }
        }
    }

    /// Build the full `docker create` argument vector. Pure so the security
    /// posture is unit-testable.
    fn create_args(
        &self,
        session_id: &str,
        network: &str,
        env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--interactive".into(),
            "--tty".into(),
            "--label".into(),
            format!("{MANAGED_LABEL}={session_id}"),
            "--name".into(),
            format!("shellgate-{session_id}"),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
        ];
        // Seccomp and MAC confinement. With no override the engine applies
        // its own default profiles (and docker-default AppArmor where the
        // host supports it); a configured profile is passed explicitly.
        if !self.limits.seccomp_profile.is_empty() {
            args.push("--security-opt".into());
            args.push(format!("seccomp={}", self.limits.seccomp_profile));
        }
        if !self.limits.apparmor_profile.is_empty() {
            args.push("--security-opt".into());
            args.push(format!("apparmor={}", self.limits.apparmor_profile));
        }
        args.extend([
            "--pids-limit".into(),
            self.limits.pids_limit.to_string(),
            "--memory".into(),
            format!("{}m", self.limits.memory_limit_mb),
            "--cpu-shares".into(),
            self.limits.cpu_shares.to_string(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}m", self.limits.tmpfs_size_mb),
            "--tmpfs".into(),
            format!("/home/sandbox:rw,nosuid,size={}m", self.limits.tmpfs_size_mb),
            "--network".into(),
            network.into(),
            "--user".into(),
            "1000:1000".into(),
        ]);
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("--env".into());
            args.push(format!("{key}={}", env[key]));
        }
        args.push(self.limits.image.clone());
        args
    }

    fn classify_state(state: &str) -> HealthStatus {
        match state {
            "running" => HealthStatus::Ok,
            "created" | "restarting" | "paused" | "exited" | "dead" => HealthStatus::Unhealthy,
            _ => HealthStatus::Gone,
        }
    }
}

#[async_trait]
impl ContainerAdapter for DockerCli {
    async fn reconcile(&self) -> Result<ReconcileReport, ContainerError> {
        let listing = self
            .run(&[
                "ps",
                "--all",
                "--filter",
                &format!("label={MANAGED_LABEL}"),
                "--format",
                "{{.ID}}\t{{.State}}",
            ])
            .await
            .map_err(|e| ContainerError::Reconcile(e.to_string()))?;

        let mut report = ReconcileReport::default();
        for line in listing.lines() {
            let Some((id, state)) = line.split_once('\t') else {
                continue;
            };
            if state == "running" {
                report.left_running.push(id.to_string());
                continue;
            }
            match self.run(&["rm", "--force", id]).await {
                Ok(_) => report.removed.push(id.to_string()),
                Err(e) => tracing::warn!(container = %id, error = %e, "failed to remove stale container"),
            }
        }
        Ok(report)
    }

    async fn create(
        &self,
        session_id: &str,
        env: &HashMap<String, String>,
    ) -> Result<ContainerHandle, ContainerError> {
        self.ensure_image().await?;
        let network = self.resolve_network().await;
        let args = self.create_args(session_id, &network, env);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .run(&arg_refs)
            .await
            .map_err(|e| ContainerError::Create(e.to_string()))?;
        Ok(ContainerHandle::new(id))
    }

    async fn attach(
        &self,
        handle: &ContainerHandle,
        rows: u16,
        cols: u16,
    ) -> Result<ContainerIo, ContainerError> {
        let mut cmd = CommandBuilder::new(&self.binary);
        cmd.arg("start");
        cmd.arg("--attach");
        cmd.arg("--interactive");
        cmd.arg(handle.id());
        cmd.env("TERM", "xterm-256color");

        let mut tty = spawn_cli_tty(cmd, rows, cols)
            .map_err(|e| ContainerError::Attach(handle.id().to_string(), e))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(IO_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(IO_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel::<()>();

        // Shell output pump. Blocking reads off the PTY, forwarded into the
        // async side. Ends at EOF (shell exit) or when the receiver drops.
        let mut reader = tty.reader;
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Stdin pump. Ends when the session closes the channel.
        let mut writer = tty.writer;
        tokio::task::spawn_blocking(move || {
            while let Some(data) = stdin_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Child exit watcher.
        if let Some(mut child) = tty.child.take() {
            tokio::task::spawn_blocking(move || {
                match child.wait() {
                    Ok(status) => tracing::debug!(?status, "container shell exited"),
                    Err(e) => tracing::error!(?e, "error waiting for container shell"),
                }
                let _ = exit_tx.send(());
            });
        } else {
            let _ = exit_tx.send(());
        }

        let master = tty.master;
        let resize: Box<dyn Fn(u16, u16) -> Result<(), ContainerError> + Send + Sync> =
            Box::new(move |rows, cols| {
                master
                    .lock()
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|e| ContainerError::Resize(e.to_string()))
            });

        Ok(ContainerIo {
            stdin: stdin_tx,
            output: output_rx,
            resize,
            exited: exit_rx,
        })
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), ContainerError> {
        self.run(&[
            "stop",
            "--time",
            &grace.as_secs().max(1).to_string(),
            handle.id(),
        ])
        .await
        .map(|_| ())
        .map_err(|e| ContainerError::Stop(handle.id().to_string(), e.to_string()))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        self.run(&["rm", "--force", handle.id()])
            .await
            .map(|_| ())
            .map_err(|e| ContainerError::Remove(handle.id().to_string(), e.to_string()))
    }

    async fn health_check(
        &self,
        handles: &[ContainerHandle],
    ) -> HashMap<ContainerHandle, HealthStatus> {
        let mut statuses = HashMap::new();
        for handle in handles {
            let status = match self
                .run(&["inspect", "--format", "{{.State.Status}}", handle.id()])
                .await
            {
                Ok(state) => Self::classify_state(&state),
                Err(_) => HealthStatus::Gone,
            };
            statuses.insert(handle.clone(), status);
        }
        statuses
    }
}
