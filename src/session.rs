//! Session registry and lifecycle.
//!
//! A session is one logical shell: one container, one output ring, at most
//! one attached WebSocket. The registry is the broker's only mutable shared
//! state; admission, resume, takeover, detach and terminate all go through
//! it, and per-session mutation is serialised behind each session's state
//! lock. Registry locks are never held across a container adapter call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::auth::{hashes_equal, Credentials};
use crate::config::Config;
use crate::container::{ContainerAdapter, ContainerError, ContainerHandle};
use crate::limiter::RateLimiters;
use crate::protocol::reason;
use crate::ring::OutputRing;

/// Why a session was terminated. Also the label on the termination metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    ContainerExited,
    ContainerGone,
    IdleTimeout,
    DurationExceeded,
    OrphanExpired,
    Shutdown,
}

impl TerminateReason {
    /// The wire reason sent in the final `status:disconnected` frame.
    pub fn protocol_reason(self) -> &'static str {
        match self {
            TerminateReason::ContainerExited => reason::EXITED,
            TerminateReason::ContainerGone => reason::CONTAINER_GONE,
            TerminateReason::IdleTimeout
            | TerminateReason::DurationExceeded
            | TerminateReason::OrphanExpired => reason::TIMEOUT,
            TerminateReason::Shutdown => reason::SHUTDOWN,
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            TerminateReason::ContainerExited => "exited",
            TerminateReason::ContainerGone => "container_gone",
            TerminateReason::IdleTimeout => "idle",
            TerminateReason::DurationExceeded => "duration",
            TerminateReason::OrphanExpired => "orphan",
            TerminateReason::Shutdown => "shutdown",
        }
    }
}

/// Why an attached socket is being closed out from under its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Replaced,
    Terminated(TerminateReason),
}

impl DisconnectReason {
    pub fn protocol_reason(self) -> &'static str {
        match self {
            DisconnectReason::Replaced => reason::REPLACED,
            DisconnectReason::Terminated(t) => t.protocol_reason(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("session capacity reached for this bucket")]
    AtCapacity,

    #[error("container create failed: {0}")]
    Container(#[source] ContainerError),

    #[error("container attach failed: {0}")]
    Attach(#[source] ContainerError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResumeError {
    #[error("no session with that id")]
    NotFound,

    #[error("credentials do not match the session")]
    Mismatch,

    #[error("resume grace expired")]
    Expired,

    #[error("too many resume attempts")]
    RateLimited,

    #[error("another connection is taking this session over")]
    Conflict,
}

impl ResumeError {
    pub fn protocol_reason(&self) -> &'static str {
        match self {
            ResumeError::NotFound => reason::RESUME_NOT_FOUND,
            ResumeError::Mismatch => reason::RESUME_MISMATCH,
            ResumeError::Expired => reason::RESUME_EXPIRED,
            ResumeError::RateLimited => reason::RESUME_RATE_LIMITED,
            ResumeError::Conflict => reason::RESUME_CONFLICT,
        }
    }
}

#[derive(Debug)]
struct Attachment {
    id: u64,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<DisconnectReason>>>,
}

#[derive(Debug)]
struct OrphanTimer {
    cancel: CancellationToken,
    deadline: Instant,
}

#[derive(Debug)]
struct SessionState {
    attachment: Option<Attachment>,
    orphan: Option<OrphanTimer>,
}

/// One logical shell with its container, buffers and timers.
pub struct Session {
    pub id: String,
    pub credential_hash: String,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    created_instant: Instant,
    pub container: ContainerHandle,
    pub ring: OutputRing,
    pub activity: ActivityTracker,
    pub input_tx: mpsc::Sender<Bytes>,
    resize_fn: Box<dyn Fn(u16, u16) -> Result<(), ContainerError> + Send + Sync>,
    /// Cancelled exactly once, when the session terminates. Child tokens
    /// hang off it for attachments and timers.
    pub cancelled: CancellationToken,
    terminated: AtomicBool,
    /// Latch covering the bind window; a takeover racing another loses.
    attaching: AtomicBool,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("credential_hash", &self.credential_hash)
            .field("authenticated", &self.authenticated)
            .field("created_at", &self.created_at)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ContainerError> {
        (self.resize_fn)(rows, cols)
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attachment.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }
}

/// Everything a socket loop needs after binding to a session.
#[derive(Debug)]
pub struct SocketBinding {
    pub attachment_id: u64,
    /// Cancelled on takeover or termination; the loop must stop forwarding
    /// immediately and consult `reason` for the close message.
    pub cancel: CancellationToken,
    pub reason: Arc<Mutex<Option<DisconnectReason>>>,
    /// Full ring replay; write it before reading a single live frame.
    pub replay: Bytes,
    /// Live output from exactly the replay point onward.
    pub live: broadcast::Receiver<Bytes>,
}

struct RegistryInner {
    config: Config,
    adapter: Arc<dyn ContainerAdapter>,
    limiters: Arc<RateLimiters>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    anonymous: Arc<AtomicUsize>,
    authenticated: Arc<AtomicUsize>,
    attachment_ids: AtomicU64,
}

/// Cheap-to-clone handle on the shared registry state; clones go into the
/// timer and pump tasks.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

/// A reserved admission slot. Released on drop unless committed into a
/// live session; this is what keeps concurrent admissions from ever
/// overshooting a bucket cap.
struct AdmissionPermit {
    counter: Arc<AtomicUsize>,
    committed: bool,
}

impl AdmissionPermit {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.committed {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SessionRegistry {
    pub fn new(
        config: Config,
        adapter: Arc<dyn ContainerAdapter>,
        limiters: Arc<RateLimiters>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                adapter,
                limiters,
                sessions: Mutex::new(HashMap::new()),
                anonymous: Arc::new(AtomicUsize::new(0)),
                authenticated: Arc::new(AtomicUsize::new(0)),
                attachment_ids: AtomicU64::new(0),
            }),
        }
    }

    /// Live session counts: (anonymous, authenticated).
    pub fn counts(&self) -> (usize, usize) {
        (
            self.inner.anonymous.load(Ordering::SeqCst),
            self.inner.authenticated.load(Ordering::SeqCst),
        )
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(id).cloned()
    }

    /// All live sessions, for the health sweep.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    fn audit(&self, event: &str, detail: &str) {
        if self.inner.config.security_audit_log {
            tracing::info!(target: "audit", event, detail);
        }
    }

    /// Reserve an admission slot in the right bucket, refusing at cap.
    fn admit(&self, authenticated: bool) -> Result<AdmissionPermit, CreateError> {
        let (counter, cap) = if authenticated {
            (
                &self.inner.authenticated,
                self.inner.config.max_authenticated_sessions,
            )
        } else {
            (&self.inner.anonymous, self.inner.config.max_anonymous_sessions)
        };
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                self.audit(
                    "admission_refused",
                    if authenticated { "authenticated" } else { "anonymous" },
                );
                return Err(CreateError::AtCapacity);
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(AdmissionPermit {
                        counter: counter.clone(),
                        committed: false,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Create a fresh session: admission, container create, container
    /// attach, registry insert, pumps and timers. The new session starts
    /// detached with its orphan timer armed; the caller binds a socket
    /// immediately via [`SessionRegistry::bind_socket`].
    pub async fn create(
        &self,
        credentials: &Credentials,
        env: &HashMap<String, String>,
    ) -> Result<Arc<Session>, CreateError> {
        let authenticated = credentials.is_authenticated();
        let permit = self.admit(authenticated)?;

        let id = uuid::Uuid::new_v4().to_string();

        let handle = self
            .inner
            .adapter
            .create(&id, env)
            .await
            .map_err(CreateError::Container)?;

        let io = match self.inner.adapter.attach(&handle, 24, 80).await {
            Ok(io) => io,
            Err(e) => {
                // Attach failed after create: reclaim the container now.
                if let Err(re) = self.inner.adapter.remove(&handle).await {
                    tracing::warn!(container = %handle, error = %re, "failed to remove container after attach failure");
                }
                return Err(CreateError::Attach(e));
            }
        };

        let session = Arc::new(Session {
            id: id.clone(),
            credential_hash: credentials.hash(),
            authenticated,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            container: handle,
            ring: OutputRing::new(
                self.inner.config.output_buffer_max_lines,
                self.inner.config.max_output_buffer_size,
            ),
            activity: ActivityTracker::new(),
            input_tx: io.stdin,
            resize_fn: io.resize,
            cancelled: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            attaching: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                attachment: None,
                orphan: None,
            }),
        });

        self.inner.sessions.lock().insert(id.clone(), session.clone());
        permit.commit();
        let (anon, auth) = self.counts();
        metrics::counter!("shellgate_sessions_created_total").increment(1);
        metrics::gauge!("shellgate_sessions_anonymous").set(anon as f64);
        metrics::gauge!("shellgate_sessions_authenticated").set(auth as f64);
        self.audit("session_created", &id);
        tracing::info!(session = %id, authenticated, "session created");

        self.spawn_output_pump(&session, io.output);
        self.spawn_exit_watcher(&session, io.exited);
        self.spawn_idle_timer(&session);
        self.spawn_absolute_timer(&session);
        self.arm_orphan_timer(&session);

        Ok(session)
    }

    /// Look up a resumable session. Counts the attempt against the
    /// per-session resume quota; exceeding it refuses even a valid resume.
    pub fn try_resume(
        &self,
        session_id: &str,
        credential_hash: &str,
    ) -> Result<Arc<Session>, ResumeError> {
        metrics::counter!("shellgate_resume_attempts_total").increment(1);
        if !self.inner.limiters.check_resume(session_id).is_allowed() {
            self.audit("resume_rate_limited", session_id);
            return Err(ResumeError::RateLimited);
        }

        let session = self.get(session_id).ok_or(ResumeError::NotFound)?;
        if session.is_terminated() {
            return Err(ResumeError::NotFound);
        }
        if !hashes_equal(&session.credential_hash, credential_hash) {
            self.audit("resume_mismatch", session_id);
            return Err(ResumeError::Mismatch);
        }
        // Grace already over but the orphan timer has not fired yet.
        if let Some(orphan) = session.state.lock().orphan.as_ref() {
            if Instant::now() >= orphan.deadline {
                return Err(ResumeError::Expired);
            }
        }
        Ok(session)
    }

    /// Bind a socket to a session, displacing any currently attached one
    /// (takeover). Returns the replay snapshot and the live receiver,
    /// captured atomically so replay-then-live never interleaves.
    pub fn bind_socket(&self, session: &Arc<Session>) -> Result<SocketBinding, ResumeError> {
        if session
            .attaching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ResumeError::Conflict);
        }

        let binding = {
            let mut state = session.state.lock();
            if session.is_terminated() {
                session.attaching.store(false, Ordering::SeqCst);
                return Err(ResumeError::NotFound);
            }

            // Takeover: the old socket is told it was replaced, then cut.
            if let Some(old) = state.attachment.take() {
                *old.reason.lock() = Some(DisconnectReason::Replaced);
                old.cancel.cancel();
                metrics::counter!("shellgate_takeovers_total").increment(1);
                self.audit("session_takeover", &session.id);
            }

            // A bound session has no orphan deadline.
            if let Some(orphan) = state.orphan.take() {
                orphan.cancel.cancel();
            }

            let id = self.inner.attachment_ids.fetch_add(1, Ordering::SeqCst);
            let cancel = session.cancelled.child_token();
            let disconnect_reason = Arc::new(Mutex::new(None));
            state.attachment = Some(Attachment {
                id,
                cancel: cancel.clone(),
                reason: disconnect_reason.clone(),
            });

            let (replay, live) = session.ring.snapshot_and_subscribe();
            SocketBinding {
                attachment_id: id,
                cancel,
                reason: disconnect_reason,
                replay,
                live,
            }
        };

        session.activity.touch();
        session.attaching.store(false, Ordering::SeqCst);
        Ok(binding)
    }

    /// Socket gone; leave the container running and start the orphan
    /// grace. A displaced socket's late detach is a no-op because its
    /// attachment id is no longer current.
    pub fn detach(&self, session: &Arc<Session>, attachment_id: u64) {
        {
            let mut state = session.state.lock();
            match state.attachment.as_ref() {
                Some(current) if current.id == attachment_id => {
                    state.attachment = None;
                }
                _ => return,
            }
        }
        if session.is_terminated() {
            return;
        }
        tracing::info!(session = %session.id, "socket detached, orphan grace started");
        self.audit("session_detached", &session.id);
        self.arm_orphan_timer(session);
    }

    /// Terminate a session. Idempotent: the first caller wins and runs the
    /// whole teardown; later calls return immediately.
    pub async fn terminate(&self, session: &Arc<Session>, why: TerminateReason) {
        if session.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = session.state.lock();
            if let Some(attachment) = state.attachment.take() {
                let mut slot = attachment.reason.lock();
                if slot.is_none() {
                    *slot = Some(DisconnectReason::Terminated(why));
                }
                attachment.cancel.cancel();
            }
            if let Some(orphan) = state.orphan.take() {
                orphan.cancel.cancel();
            }
        }

        // Stops pumps, timers and any attached socket loop.
        session.cancelled.cancel();

        let removed = self.inner.sessions.lock().remove(&session.id).is_some();
        if removed {
            let counter = if session.authenticated {
                &self.inner.authenticated
            } else {
                &self.inner.anonymous
            };
            counter.fetch_sub(1, Ordering::SeqCst);
        }

        session.ring.clear();

        metrics::counter!("shellgate_sessions_terminated_total", "reason" => why.metric_label())
            .increment(1);
        let (anon, auth) = self.counts();
        metrics::gauge!("shellgate_sessions_anonymous").set(anon as f64);
        metrics::gauge!("shellgate_sessions_authenticated").set(auth as f64);
        self.audit("session_terminated", &session.id);
        tracing::info!(session = %session.id, reason = ?why, "session terminated");

        // Container teardown happens after every lock is released.
        if let Err(e) = self
            .inner
            .adapter
            .stop(&session.container, self.inner.config.cleanup_grace)
            .await
        {
            tracing::warn!(session = %session.id, error = %e, "container stop failed");
        }
        if let Err(e) = self.inner.adapter.remove(&session.container).await {
            tracing::warn!(session = %session.id, error = %e, "container remove failed");
        }
    }

    /// Terminate every live session. Used by shutdown and by tests.
    pub async fn terminate_all(&self, why: TerminateReason) {
        let sessions = self.snapshot();
        for session in sessions {
            self.terminate(&session, why).await;
        }
    }

    fn spawn_output_pump(&self, session: &Arc<Session>, mut output: mpsc::Receiver<Bytes>) {
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled.cancelled() => break,
                    chunk = output.recv() => match chunk {
                        Some(data) => {
                            session.ring.append(&data);
                            session.activity.touch();
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn spawn_exit_watcher(
        &self,
        session: &Arc<Session>,
        exited: tokio::sync::oneshot::Receiver<()>,
    ) {
        let registry = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled.cancelled() => {}
                _ = exited => {
                    registry
                        .terminate(&session, TerminateReason::ContainerExited)
                        .await;
                }
            }
        });
    }

    fn spawn_idle_timer(&self, session: &Arc<Session>) {
        let registry = self.clone();
        let session = session.clone();
        let timeout = self.inner.config.idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled.cancelled() => {}
                _ = session.activity.idle_elapsed(timeout) => {
                    registry.terminate(&session, TerminateReason::IdleTimeout).await;
                }
            }
        });
    }

    fn spawn_absolute_timer(&self, session: &Arc<Session>) {
        let registry = self.clone();
        let session = session.clone();
        let limit = self.inner.config.max_session_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    registry
                        .terminate(&session, TerminateReason::DurationExceeded)
                        .await;
                }
            }
        });
    }

    /// Start the orphan grace timer. Caller must hold no state lock.
    fn arm_orphan_timer(&self, session: &Arc<Session>) {
        let cancel = CancellationToken::new();
        let grace = self.inner.config.resume_grace;
        {
            let mut state = session.state.lock();
            // Bound again in the meantime: nothing to arm.
            if state.attachment.is_some() {
                return;
            }
            state.orphan = Some(OrphanTimer {
                cancel: cancel.clone(),
                deadline: Instant::now() + grace,
            });
        }

        let registry = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = session.cancelled.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    registry
                        .terminate(&session, TerminateReason::OrphanExpired)
                        .await;
                }
            }
        });
    }
}
