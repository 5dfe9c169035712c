//! Background liveness sweep over supervised modules
//!
//! Pull-based counterpart of the handshake ping confirmation: a watched module
//! whose last-ping watermark grows older than the staleness threshold is
//! demoted to `Unknown` and dropped from the watch-list, a healthy `Unknown`
//! module is promoted back to `Online`.

use crate::client::ModuleClient;
use crate::config::SupervisorConfig;
use crate::module::{ModuleDescriptor, ModuleState};
use crate::process::process_running;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Liveness evidence for one module
pub trait LivenessProbe: Send + Sync {
    fn is_alive<'a>(&'a self, module: &'a ModuleDescriptor) -> BoxFuture<'a, bool>;
}

/// Process presence for local modules, a `Ping` for everything else
pub struct ModuleProbe {
    client: ModuleClient,
}

impl ModuleProbe {
    pub fn new(client: ModuleClient) -> Self {
        Self { client }
    }
}

impl LivenessProbe for ModuleProbe {
    fn is_alive<'a>(&'a self, module: &'a ModuleDescriptor) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !module.is_remote() && process_running(module.pid) {
                return true;
            }
            self.client.ping(module).await
        })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub interval: Duration,
    pub stale_after: Duration,
    pub probe_interval: Duration,
}

impl From<&SupervisorConfig> for SupervisorPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            interval: config.interval(),
            stale_after: config.stale_after(),
            probe_interval: config.probe_interval(),
        }
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

pub struct Supervisor {
    registry: Arc<Registry>,
    /// Appended to by request handlers, iterated by the sweep
    watched: Mutex<Vec<String>>,
    probe: Arc<dyn LivenessProbe>,
    policy: SupervisorPolicy,
}

fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, probe: Arc<dyn LivenessProbe>, policy: SupervisorPolicy) -> Self {
        Self {
            registry,
            watched: Mutex::new(Vec::new()),
            probe,
            policy,
        }
    }

    /// Start watching `name`; returns false if it was already watched
    pub fn add(&self, name: &str) -> bool {
        let mut watched = self.watched.lock();
        if watched.iter().any(|n| n == name) {
            return false;
        }
        watched.push(name.to_string());
        debug!(module = name, "Module supervised");
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut watched = self.watched.lock();
        let before = watched.len();
        watched.retain(|n| n != name);
        before != watched.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.watched.lock().iter().any(|n| n == name)
    }

    pub fn watched(&self) -> Vec<String> {
        self.watched.lock().clone()
    }

    /// One pass over the watch-list as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for name in self.watched() {
            let module = match self.registry.get(&name) {
                Some(module) => module,
                None => {
                    self.remove(&name);
                    continue;
                }
            };

            if !module.state.is_managed() {
                debug!(module = %name, state = %module.state, "Module left managed states, unwatching");
                self.remove(&name);
                continue;
            }

            let mut watermark = module.last_ping;
            if age(now, watermark) >= self.policy.probe_interval && self.probe.is_alive(&module).await {
                watermark = now;
                self.registry.update(&name, |m| m.touch(now));
            }

            if age(now, watermark) > self.policy.stale_after {
                let demoted = self
                    .registry
                    .update(&name, |m| {
                        if m.state.is_managed() {
                            m.state = ModuleState::Unknown;
                        }
                    })
                    .map(|m| m.state == ModuleState::Unknown)
                    .unwrap_or(false);
                self.remove(&name);
                if demoted {
                    warn!(
                        module = %name,
                        stale_secs = age(now, watermark).as_secs(),
                        "No liveness evidence, module demoted to UNKNOWN"
                    );
                }
                continue;
            }

            if !module.state.is_active() {
                self.registry.update(&name, |m| {
                    if m.state == ModuleState::Unknown {
                        m.state = ModuleState::Online;
                        info!(module = %m.name, "Module alive again, promoted to ONLINE");
                    }
                });
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.policy.interval.as_millis() as u64,
            stale_after_secs = self.policy.stale_after.as_secs(),
            "Supervisor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {
                    self.sweep(Utc::now()).await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedProbe {
        alive: AtomicBool,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl LivenessProbe for FixedProbe {
        fn is_alive<'a>(&'a self, _module: &'a ModuleDescriptor) -> BoxFuture<'a, bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let alive = self.alive.load(Ordering::SeqCst);
            Box::pin(async move { alive })
        }
    }

    fn setup(state: ModuleState, last_ping: DateTime<Utc>, probe: Arc<FixedProbe>) -> (Supervisor, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let mut module = ModuleDescriptor::new("blog").with_state(state);
        module.last_ping = last_ping;
        registry.register(module).unwrap();
        let supervisor = Supervisor::new(Arc::clone(&registry), probe, SupervisorPolicy::default());
        supervisor.add("blog");
        (supervisor, registry)
    }

    #[test]
    fn test_watch_list_dedupes() {
        let registry = Arc::new(Registry::new());
        let supervisor = Supervisor::new(registry, FixedProbe::new(true), SupervisorPolicy::default());
        assert!(supervisor.add("a"));
        assert!(!supervisor.add("a"));
        assert_eq!(supervisor.watched(), vec!["a"]);
        assert!(supervisor.remove("a"));
        assert!(!supervisor.remove("a"));
        assert!(!supervisor.contains("a"));
    }

    #[tokio::test]
    async fn test_stale_module_demoted_and_unwatched() {
        let now = Utc::now();
        let probe = FixedProbe::new(false);
        let (supervisor, registry) = setup(
            ModuleState::Online,
            now - chrono::Duration::minutes(6),
            Arc::clone(&probe),
        );

        supervisor.sweep(now).await;

        assert_eq!(registry.state_of("blog"), Some(ModuleState::Unknown));
        assert!(!supervisor.contains("blog"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_module_not_probed() {
        let now = Utc::now();
        let probe = FixedProbe::new(false);
        let (supervisor, registry) = setup(
            ModuleState::Online,
            now - chrono::Duration::seconds(5),
            Arc::clone(&probe),
        );

        supervisor.sweep(now).await;

        assert_eq!(registry.state_of("blog"), Some(ModuleState::Online));
        assert!(supervisor.contains("blog"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_alive_probe_refreshes_watermark() {
        let now = Utc::now();
        let (supervisor, registry) = setup(
            ModuleState::Online,
            now - chrono::Duration::minutes(10),
            FixedProbe::new(true),
        );

        supervisor.sweep(now).await;

        let module = registry.get("blog").unwrap();
        assert_eq!(module.state, ModuleState::Online);
        assert_eq!(module.last_ping, now);
        assert!(supervisor.contains("blog"));
    }

    #[tokio::test]
    async fn test_unknown_module_promoted_when_alive() {
        let now = Utc::now();
        let (supervisor, registry) = setup(
            ModuleState::Unknown,
            now - chrono::Duration::minutes(1),
            FixedProbe::new(true),
        );

        supervisor.sweep(now).await;
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Online));
    }

    #[tokio::test]
    async fn test_loading_module_left_alone_while_fresh() {
        let now = Utc::now();
        let (supervisor, registry) = setup(ModuleState::Loading, now, FixedProbe::new(true));
        supervisor.sweep(now).await;
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Loading));
    }

    #[tokio::test]
    async fn test_stopped_module_unwatched() {
        let now = Utc::now();
        let (supervisor, registry) = setup(ModuleState::Stopped, now, FixedProbe::new(true));
        supervisor.sweep(now).await;
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Stopped));
        assert!(!supervisor.contains("blog"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = Arc::new(Registry::new());
        let policy = SupervisorPolicy {
            interval: Duration::from_millis(10),
            ..Default::default()
        };
        let supervisor = Arc::new(Supervisor::new(registry, FixedProbe::new(true), policy));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&supervisor).run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor exits on shutdown")
            .unwrap();
    }
}
