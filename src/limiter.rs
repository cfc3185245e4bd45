//! Sliding-window rate limiting.
//!
//! Two independent windows protect the broker: per-IP connection attempts
//! (checked at upgrade time, before authentication, so unauthenticated
//! floods are cheap to refuse) and per-session resume attempts (so a stolen
//! session id cannot be brute-forced against the credential hash).
//!
//! Buckets are swept by a janitor once their last activity is older than
//! twice the window. When throttling is disabled both checks become no-ops
//! and record nothing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

struct Bucket {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

/// A keyed sliding-window counter.
///
/// Every attempt is recorded, including refused ones, so a sustained flood
/// stays blocked instead of leaking through once per window.
pub struct SlidingWindow {
    max: u32,
    window: Duration,
    enabled: bool,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl SlidingWindow {
    pub fn new(max: u32, window: Duration, enabled: bool) -> Self {
        Self {
            max,
            window,
            enabled,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key` and decide whether it is admitted.
    pub fn check(&self, key: &str) -> Decision {
        if !self.enabled {
            return Decision::Allowed;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            hits: VecDeque::new(),
            last_seen: now,
        });
        bucket.last_seen = now;
        while let Some(front) = bucket.hits.front() {
            if now.duration_since(*front) >= self.window {
                bucket.hits.pop_front();
            } else {
                break;
            }
        }
        bucket.hits.push_back(now);
        if bucket.hits.len() > self.max as usize {
            metrics::counter!("shellgate_rate_limited_total").increment(1);
            Decision::Limited
        } else {
            Decision::Allowed
        }
    }

    /// Drop buckets idle for more than twice the window.
    pub fn sweep(&self) {
        if !self.enabled {
            return;
        }
        let cutoff = self.window * 2;
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_seen) < cutoff);
    }

    /// Number of live buckets. Used by the janitor tests.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// The broker's two limiters, built from configuration.
pub struct RateLimiters {
    connections: SlidingWindow,
    resumes: SlidingWindow,
}

impl RateLimiters {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connections: SlidingWindow::new(
                config.max_connections_per_ip_per_minute,
                config.throttle_window,
                config.enable_connection_throttling,
            ),
            resumes: SlidingWindow::new(
                config.max_resume_attempts_per_session_per_minute,
                config.throttle_window,
                config.enable_connection_throttling,
            ),
        }
    }

    /// Admission check for a WebSocket upgrade from `ip`.
    pub fn check_connection(&self, ip: IpAddr) -> Decision {
        self.connections.check(&ip.to_string())
    }

    /// Admission check for a resume attempt against `session_id`.
    pub fn check_resume(&self, session_id: &str) -> Decision {
        self.resumes.check(session_id)
    }

    /// Janitor entry point: sweep both windows.
    pub fn sweep(&self) {
        self.connections.sweep();
        self.resumes.sweep();
    }

    pub fn bucket_counts(&self) -> (usize, usize) {
        (self.connections.bucket_count(), self.resumes.bucket_count())
    }
}
