//! Reconciler context: one explicit object constructed at startup and passed
//! into every reconciler call. Holds the engine handle, agent settings, host
//! facts, retry profile and the compute serialization gate — there are no
//! global singletons.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use shepherd_common::InfoData;

use crate::engine::ContainerEngine;
use crate::plugin::PluginClient;
use crate::retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};

/// Agent-level settings the reconciler needs. Built from the environment by
/// the agent crate, from explicit values in tests.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the per-container state snapshots.
    pub state_dir: PathBuf,
    /// Control-plane URL injected into agent containers.
    pub control_url: String,
    /// Local API proxy port, used instead of a literal localhost URL.
    pub api_proxy_port: u16,
    /// Directory of storage-plugin unix sockets (`<driver>.sock`).
    pub storage_sock_dir: PathBuf,
    /// Host resolv.conf consulted for DNS search scaffolding.
    pub resolv_conf: PathBuf,
    /// Proxy variables copied into system containers.
    pub host_proxy_env: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_dir: PathBuf::from("/var/lib/shepherd/containers"),
            control_url: String::new(),
            api_proxy_port: 9342,
            storage_sock_dir: PathBuf::from("/var/run/shepherd/storage"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            host_proxy_env: BTreeMap::new(),
        }
    }
}

/// Retry/backoff profile for the bounded loops in the reconciliation path.
#[derive(Debug, Clone, Copy)]
pub struct RetryProfile {
    /// State-file rename: a co-located reader may transiently hold the path.
    pub rename: RetryPolicy,
    /// Wait for pid 0 between kill and remove.
    pub remove_wait: RetryPolicy,
    /// Managed volume removal.
    pub volume_remove: RetryPolicy,
    /// Storage plugin calls.
    pub plugin: RetryPolicy,
}

impl Default for RetryProfile {
    fn default() -> Self {
        RetryProfile {
            rename: RetryPolicy::new(10, Backoff::None),
            remove_wait: RetryPolicy::new(10, Backoff::Fixed(Duration::from_millis(500))),
            volume_remove: RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(1))),
            plugin: RetryPolicy::new(3, Backoff::Doubling(Duration::from_millis(100))),
        }
    }
}

pub struct ReconcilerContext {
    engine: Arc<dyn ContainerEngine>,
    pub settings: Settings,
    pub info: InfoData,
    pub retries: RetryProfile,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) plugin: PluginClient,
    serialize_compute: bool,
    compute_lock: Mutex<()>,
}

impl ReconcilerContext {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: Settings, info: InfoData) -> Self {
        // Certain device-mapper configurations corrupt state when create and
        // remove run concurrently; in that case every compute operation takes
        // the gate.
        let serialize_compute = info.storage_driver.starts_with("devicemapper");
        let plugin = PluginClient::new(settings.storage_sock_dir.clone());
        ReconcilerContext {
            engine,
            settings,
            info,
            retries: RetryProfile::default(),
            sleeper: Arc::new(TokioSleeper),
            plugin,
            serialize_compute,
            compute_lock: Mutex::new(()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retries(mut self, retries: RetryProfile) -> Self {
        self.retries = retries;
        self
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.engine.as_ref()
    }

    /// Serialization gate for activate/remove compute operations. Returns a
    /// held guard only when the storage driver requires single-file access.
    pub async fn compute_gate(&self) -> Option<MutexGuard<'_, ()>> {
        if self.serialize_compute {
            debug!("compute gate engaged");
            Some(self.compute_lock.lock().await)
        } else {
            None
        }
    }
}
