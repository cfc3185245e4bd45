//! The broker value.
//!
//! One `Broker` owns everything mutable: the session registry, the rate
//! limiters, the container adapter and the shutdown coordinator. It is
//! constructed in `main` (or directly in tests) and handed to the API
//! layer; there are no module-level singletons anywhere.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::container::ContainerAdapter;
use crate::limiter::RateLimiters;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

pub struct Broker {
    pub config: Config,
    pub registry: SessionRegistry,
    pub limiters: Arc<RateLimiters>,
    pub adapter: Arc<dyn ContainerAdapter>,
    pub shutdown: ShutdownCoordinator,
    started_at: Instant,
}

impl Broker {
    pub fn new(config: Config, adapter: Arc<dyn ContainerAdapter>) -> Arc<Self> {
        let limiters = Arc::new(RateLimiters::from_config(&config));
        let registry = SessionRegistry::new(config.clone(), adapter.clone(), limiters.clone());
        Arc::new(Self {
            config,
            registry,
            limiters,
            adapter,
            shutdown: ShutdownCoordinator::new(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeSandbox;

    #[tokio::test]
    async fn broker_starts_empty() {
        let broker = Broker::new(Config::default(), Arc::new(FakeSandbox::new()));
        assert_eq!(broker.registry.counts(), (0, 0));
        assert!(!broker.shutdown.in_progress());
    }

    #[tokio::test]
    async fn uptime_is_monotonic() {
        let broker = Broker::new(Config::default(), Arc::new(FakeSandbox::new()));
        let first = broker.uptime_seconds();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(broker.uptime_seconds() >= first);
    }
}
