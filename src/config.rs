//! Broker configuration, read from the environment.
//!
//! All options are optional with documented defaults. Validation is
//! aggregate: every violation is collected and reported at once, so a
//! misconfigured deployment surfaces the full list of problems instead of
//! failing one variable at a time.

use std::collections::HashMap;
use std::time::Duration;

/// How access tokens are validated during the auth handshake.
///
/// `Strict` rejects expired or structurally malformed tokens. `Permissive`
/// accepts any syntactically valid token without verification and is meant
/// for local development only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtMode {
    Strict,
    Permissive,
}

/// Resource limits and identity applied to every sandbox container.
///
/// The adapter never hard-codes limits; everything comes from here.
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    pub image: String,
    pub network: String,
    pub memory_limit_mb: u64,
    pub pids_limit: u64,
    pub cpu_shares: u64,
    pub tmpfs_size_mb: u64,
    /// Seccomp profile passed to the engine at create time. Empty means
    /// the engine's default profile.
    pub seccomp_profile: String,
    /// Mandatory-access-control (AppArmor) profile. Empty means the
    /// engine's default where the host supports one.
    pub apparmor_profile: String,
}

/// Effective broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_anonymous_sessions: usize,
    pub max_authenticated_sessions: usize,
    pub max_connections_per_ip_per_minute: u32,
    pub max_resume_attempts_per_session_per_minute: u32,
    pub idle_timeout: Duration,
    pub max_session_duration: Duration,
    pub resume_grace: Duration,
    pub output_buffer_max_lines: usize,
    pub max_output_buffer_size: usize,
    pub max_ws_message_size: usize,
    pub throttle_window: Duration,
    pub monitor_interval: Duration,
    pub cleanup_grace: Duration,
    pub auth_timeout: Duration,
    pub shutdown_grace: Duration,
    pub enable_connection_throttling: bool,
    pub enable_resource_monitoring: bool,
    pub jwt_validation_mode: JwtMode,
    pub container: ContainerLimits,
    pub debug: bool,
    pub security_audit_log: bool,
}

/// Minimum output buffer size. Anything smaller cannot hold a useful screen.
const MIN_OUTPUT_BUFFER_SIZE: usize = 4096;

/// Minimum WebSocket message cap. Interactive input fits in far less.
const MIN_WS_MESSAGE_SIZE: usize = 1024;

/// Minimum container memory limit in MiB.
const MIN_CONTAINER_MEMORY_MB: u64 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            max_anonymous_sessions: 50,
            max_authenticated_sessions: 50,
            max_connections_per_ip_per_minute: 10,
            max_resume_attempts_per_session_per_minute: 3,
            idle_timeout: Duration::from_millis(1_800_000),
            max_session_duration: Duration::from_millis(14_400_000),
            resume_grace: Duration::from_millis(300_000),
            output_buffer_max_lines: 1000,
            max_output_buffer_size: 1024 * 1024,
            max_ws_message_size: 64 * 1024,
            throttle_window: Duration::from_millis(60_000),
            monitor_interval: Duration::from_millis(30_000),
            cleanup_grace: Duration::from_millis(300_000),
            auth_timeout: Duration::from_millis(10_000),
            shutdown_grace: Duration::from_millis(5_000),
            enable_connection_throttling: true,
            enable_resource_monitoring: true,
            jwt_validation_mode: JwtMode::Strict,
            container: ContainerLimits {
                image: "shellgate-sandbox:latest".to_string(),
                network: "shellgate-isolated".to_string(),
                memory_limit_mb: 256,
                pids_limit: 128,
                cpu_shares: 512,
                tmpfs_size_mb: 64,
                seccomp_profile: String::new(),
                apparmor_profile: String::new(),
            },
            debug: false,
            security_audit_log: true,
        }
    }
}

/// Collects parse/validation failures while options are read.
struct Parser<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    errors: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            lookup,
            errors: Vec::new(),
        }
    }

    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    /// Parse a non-negative integer, recording an error on failure.
    /// Negative values are reported explicitly rather than as generic
    /// parse failures.
    fn u64(&mut self, key: &str, default: u64) -> u64 {
        match self.raw(key) {
            None => default,
            Some(v) => match v.parse::<i128>() {
                Ok(n) if n < 0 => {
                    self.errors.push(format!("{key}: must not be negative (got {n})"));
                    default
                }
                Ok(n) if n > u64::MAX as i128 => {
                    self.errors.push(format!("{key}: value out of range (got {n})"));
                    default
                }
                Ok(n) => n as u64,
                Err(_) => {
                    self.errors.push(format!("{key}: not a number (got {v:?})"));
                    default
                }
            },
        }
    }

    fn bool(&mut self, key: &str, default: bool) -> bool {
        match self.raw(key).as_deref() {
            None => default,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(v) => {
                self.errors
                    .push(format!("{key}: expected true or false (got {v:?})"));
                default
            }
        }
    }

    fn string(&mut self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&mut self, ok: bool, message: String) {
        if !ok {
            self.errors.push(message);
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Read configuration from an arbitrary lookup function (tests pass a
    /// map here instead of mutating process state).
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut p = Parser::new(lookup);

        let port = p.u64("PORT", defaults.port as u64);
        p.require(
            (1..=65535).contains(&port),
            format!("PORT: must be in 1..=65535 (got {port})"),
        );

        let max_anonymous_sessions =
            p.u64("MAX_ANONYMOUS_SESSIONS", defaults.max_anonymous_sessions as u64);
        let max_authenticated_sessions = p.u64(
            "MAX_AUTHENTICATED_SESSIONS",
            defaults.max_authenticated_sessions as u64,
        );

        let max_connections_per_ip = p.u64(
            "MAX_CONNECTIONS_PER_IP_PER_MINUTE",
            defaults.max_connections_per_ip_per_minute as u64,
        );
        p.require(
            max_connections_per_ip >= 1,
            format!(
                "MAX_CONNECTIONS_PER_IP_PER_MINUTE: must be at least 1 (got {max_connections_per_ip})"
            ),
        );

        let max_resume_attempts = p.u64(
            "MAX_RESUME_ATTEMPTS_PER_SESSION_PER_MINUTE",
            defaults.max_resume_attempts_per_session_per_minute as u64,
        );
        p.require(
            max_resume_attempts >= 1,
            format!(
                "MAX_RESUME_ATTEMPTS_PER_SESSION_PER_MINUTE: must be at least 1 (got {max_resume_attempts})"
            ),
        );

        let idle_timeout_ms = p.u64(
            "TERMINAL_IDLE_TIMEOUT_MS",
            defaults.idle_timeout.as_millis() as u64,
        );
        p.require(idle_timeout_ms > 0, "TERMINAL_IDLE_TIMEOUT_MS: must be positive".into());

        let max_session_duration_ms = p.u64(
            "MAX_SESSION_DURATION_MS",
            defaults.max_session_duration.as_millis() as u64,
        );
        p.require(
            max_session_duration_ms > 0,
            "MAX_SESSION_DURATION_MS: must be positive".into(),
        );

        let resume_grace_ms =
            p.u64("RESUME_GRACE_MS", defaults.resume_grace.as_millis() as u64);
        p.require(resume_grace_ms > 0, "RESUME_GRACE_MS: must be positive".into());

        let output_buffer_max_lines = p.u64(
            "OUTPUT_BUFFER_MAX_LINES",
            defaults.output_buffer_max_lines as u64,
        );
        p.require(
            output_buffer_max_lines > 0,
            "OUTPUT_BUFFER_MAX_LINES: must be positive".into(),
        );

        let max_output_buffer_size = p.u64(
            "MAX_OUTPUT_BUFFER_SIZE",
            defaults.max_output_buffer_size as u64,
        );
        p.require(
            max_output_buffer_size >= MIN_OUTPUT_BUFFER_SIZE as u64,
            format!(
                "MAX_OUTPUT_BUFFER_SIZE: must be at least {MIN_OUTPUT_BUFFER_SIZE} (got {max_output_buffer_size})"
            ),
        );

        let max_ws_message_size = p.u64(
            "MAX_WEBSOCKET_MESSAGE_SIZE",
            defaults.max_ws_message_size as u64,
        );
        p.require(
            max_ws_message_size >= MIN_WS_MESSAGE_SIZE as u64,
            format!(
                "MAX_WEBSOCKET_MESSAGE_SIZE: must be at least {MIN_WS_MESSAGE_SIZE} (got {max_ws_message_size})"
            ),
        );

        let throttle_window_ms = p.u64(
            "CONNECTION_THROTTLE_WINDOW_MS",
            defaults.throttle_window.as_millis() as u64,
        );
        p.require(
            throttle_window_ms > 0,
            "CONNECTION_THROTTLE_WINDOW_MS: must be positive".into(),
        );

        let monitor_interval_ms = p.u64(
            "RESOURCE_MONITORING_INTERVAL_MS",
            defaults.monitor_interval.as_millis() as u64,
        );
        p.require(
            monitor_interval_ms > 0,
            "RESOURCE_MONITORING_INTERVAL_MS: must be positive".into(),
        );

        let cleanup_grace_ms = p.u64(
            "CLEANUP_GRACE_PERIOD_MS",
            defaults.cleanup_grace.as_millis() as u64,
        );
        p.require(cleanup_grace_ms > 0, "CLEANUP_GRACE_PERIOD_MS: must be positive".into());

        let auth_timeout_ms =
            p.u64("AUTH_TIMEOUT_MS", defaults.auth_timeout.as_millis() as u64);
        p.require(auth_timeout_ms > 0, "AUTH_TIMEOUT_MS: must be positive".into());

        let shutdown_grace_ms = p.u64(
            "SHUTDOWN_GRACE_PERIOD_MS",
            defaults.shutdown_grace.as_millis() as u64,
        );
        p.require(
            shutdown_grace_ms > 0,
            "SHUTDOWN_GRACE_PERIOD_MS: must be positive".into(),
        );

        let enable_connection_throttling =
            p.bool("ENABLE_CONNECTION_THROTTLING", defaults.enable_connection_throttling);
        let enable_resource_monitoring =
            p.bool("ENABLE_RESOURCE_MONITORING", defaults.enable_resource_monitoring);

        let jwt_validation_mode = match p.raw("JWT_VALIDATION_MODE").as_deref() {
            None => defaults.jwt_validation_mode,
            Some("strict") => JwtMode::Strict,
            Some("permissive") => JwtMode::Permissive,
            Some(v) => {
                p.errors.push(format!(
                    "JWT_VALIDATION_MODE: expected \"strict\" or \"permissive\" (got {v:?})"
                ));
                defaults.jwt_validation_mode
            }
        };

        let image = p.string("CONTAINER_IMAGE", &defaults.container.image);
        let network = p.string("CONTAINER_NETWORK", &defaults.container.network);

        let memory_limit_mb = p.u64(
            "CONTAINER_MEMORY_LIMIT_MB",
            defaults.container.memory_limit_mb,
        );
        p.require(
            memory_limit_mb >= MIN_CONTAINER_MEMORY_MB,
            format!(
                "CONTAINER_MEMORY_LIMIT_MB: must be at least {MIN_CONTAINER_MEMORY_MB} (got {memory_limit_mb})"
            ),
        );

        let pids_limit = p.u64("CONTAINER_PIDS_LIMIT", defaults.container.pids_limit);
        p.require(pids_limit >= 1, "CONTAINER_PIDS_LIMIT: must be at least 1".into());

        let cpu_shares = p.u64("CONTAINER_CPU_SHARES", defaults.container.cpu_shares);
        p.require(cpu_shares >= 2, "CONTAINER_CPU_SHARES: must be at least 2".into());

        let tmpfs_size_mb = p.u64("CONTAINER_TMPFS_SIZE_MB", defaults.container.tmpfs_size_mb);
        p.require(tmpfs_size_mb >= 1, "CONTAINER_TMPFS_SIZE_MB: must be at least 1".into());

        let seccomp_profile =
            p.string("CONTAINER_SECCOMP_PROFILE", &defaults.container.seccomp_profile);
        let apparmor_profile =
            p.string("CONTAINER_APPARMOR_PROFILE", &defaults.container.apparmor_profile);

        let debug = p.bool("DEBUG", defaults.debug);
        let security_audit_log = p.bool("SECURITY_AUDIT_LOG", defaults.security_audit_log);

        if !p.errors.is_empty() {
            return Err(ConfigError::Invalid(p.errors));
        }

        Ok(Config {
            port: port as u16,
            max_anonymous_sessions: max_anonymous_sessions as usize,
            max_authenticated_sessions: max_authenticated_sessions as usize,
            max_connections_per_ip_per_minute: max_connections_per_ip as u32,
            max_resume_attempts_per_session_per_minute: max_resume_attempts as u32,
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            max_session_duration: Duration::from_millis(max_session_duration_ms),
            resume_grace: Duration::from_millis(resume_grace_ms),
            output_buffer_max_lines: output_buffer_max_lines as usize,
            max_output_buffer_size: max_output_buffer_size as usize,
            max_ws_message_size: max_ws_message_size as usize,
            throttle_window: Duration::from_millis(throttle_window_ms),
            monitor_interval: Duration::from_millis(monitor_interval_ms),
            cleanup_grace: Duration::from_millis(cleanup_grace_ms),
            auth_timeout: Duration::from_millis(auth_timeout_ms),
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            enable_connection_throttling,
            enable_resource_monitoring,
            jwt_validation_mode,
            container: ContainerLimits {
                image,
                network,
                memory_limit_mb,
                pids_limit,
                cpu_shares,
                tmpfs_size_mb,
                seccomp_profile,
                apparmor_profile,
            },
            debug,
            security_audit_log,
        })
    }

    /// Build from a map of variables. Test convenience.
    pub fn from_map(vars: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| vars.get(key).map(|v| v.to_string()))
    }
}
