//! In-memory [`ContainerEngine`] used by the reconciler tests and by anything
//! that wants to exercise the state machine without a daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{
    ContainerInspectResponse, ContainerState, ContainerSummary, ImageInspect,
};
use tokio::sync::Mutex;

use crate::engine::{ContainerEngine, EngineError, EngineResult, VolumeInfo};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub config: Config<String>,
    pub running: bool,
    pub pid: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FakeVolume {
    pub driver: String,
    pub mountpoint: String,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashMap<String, FakeVolume>,
    images: Vec<String>,
    sequence: u64,
}

/// Knobs: `fail_next_start` makes the next start call fail, `add_image`
/// controls which create calls succeed without a pull. Counters expose how
/// often the mutating calls ran so idempotency is assertable.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    fail_next_start: AtomicBool,
    conflict_on_volume_remove: AtomicBool,
    pub create_calls: AtomicU64,
    pub remove_calls: AtomicU64,
    pub pull_calls: AtomicU64,
    pub volume_create_calls: AtomicU64,
    pub volume_remove_calls: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_image(&self, image: &str) {
        let mut state = self.state.lock().await;
        if !state.images.iter().any(|i| i == image) {
            state.images.push(image.to_string());
        }
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Every volume remove call answers 409 until cleared.
    pub fn conflict_on_volume_remove(&self, enabled: bool) {
        self.conflict_on_volume_remove.store(enabled, Ordering::SeqCst);
    }

    pub async fn add_volume(&self, name: &str, driver: &str, mountpoint: &str) {
        self.state.lock().await.volumes.insert(
            name.to_string(),
            FakeVolume { driver: driver.to_string(), mountpoint: mountpoint.to_string() },
        );
    }

    pub async fn volume(&self, name: &str) -> Option<FakeVolume> {
        self.state.lock().await.volumes.get(name).cloned()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().await.containers.get(id).cloned()
    }

    pub async fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().await.containers.values().cloned().collect()
    }

    fn summarize(container: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: Some(container.id.clone()),
            names: Some(vec![format!("/{}", container.name)]),
            image: container.config.image.clone(),
            labels: container.config.labels.clone(),
            state: Some(if container.running { "running" } else { "exited" }.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> EngineResult<Vec<ContainerSummary>> {
        let state = self.state.lock().await;
        let label_filters = filters.get("label").cloned().unwrap_or_default();
        let mut result = Vec::new();
        for container in state.containers.values() {
            let matches = label_filters.iter().all(|filter| {
                let (key, value) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
                container
                    .config
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(key))
                    .is_some_and(|v| v == value)
            });
            if matches {
                result.push(Self::summarize(container));
            }
        }
        Ok(result)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .or_else(|| state.containers.values().find(|c| c.name == id))
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {id}")))?;
        Ok(ContainerInspectResponse {
            id: Some(container.id.clone()),
            name: Some(format!("/{}", container.name)),
            state: Some(ContainerState {
                running: Some(container.running),
                pid: Some(container.pid),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let image = config.image.clone().unwrap_or_default();
        if !state.images.iter().any(|i| *i == image) {
            return Err(EngineError::NotFound(format!("no such image: {image}")));
        }
        if state.containers.values().any(|c| c.name == name) {
            return Err(EngineError::Conflict(format!("name already in use: {name}")));
        }
        state.sequence += 1;
        let id = format!("ctr-{}", state.sequence);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                config,
                running: false,
                pid: 0,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Api("simulated start failure".to_string()));
        }
        let mut state = self.state.lock().await;
        let sequence = state.sequence;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {id}")))?;
        container.running = true;
        container.pid = 4000 + sequence as i64;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {id}")))?;
        container.running = false;
        container.pid = 0;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        self.stop_container(id, 0).await
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {id}")))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if !state.images.iter().any(|i| i == image) {
            state.images.push(image.to_string());
        }
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect> {
        let state = self.state.lock().await;
        if state.images.iter().any(|i| i == image) {
            Ok(ImageInspect {
                id: Some(format!("sha256:{image}")),
                ..Default::default()
            })
        } else {
            Err(EngineError::NotFound(format!("no such image: {image}")))
        }
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let before = state.images.len();
        state.images.retain(|i| i != image);
        if state.images.len() == before {
            return Err(EngineError::NotFound(format!("no such image: {image}")));
        }
        Ok(())
    }

    async fn tag_image(&self, _image: &str, repo: &str, tag: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let tagged = format!("{repo}:{tag}");
        if !state.images.iter().any(|i| *i == tagged) {
            state.images.push(tagged);
        }
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo> {
        let state = self.state.lock().await;
        state
            .volumes
            .get(name)
            .map(|v| VolumeInfo { name: name.to_string(), mountpoint: v.mountpoint.clone() })
            .ok_or_else(|| EngineError::NotFound(format!("no such volume: {name}")))
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        _driver_opts: HashMap<String, String>,
    ) -> EngineResult<()> {
        self.volume_create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.volumes.insert(
            name.to_string(),
            FakeVolume {
                driver: driver.to_string(),
                mountpoint: format!("/var/lib/engine/volumes/{name}/_data"),
            },
        );
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> EngineResult<()> {
        self.volume_remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.conflict_on_volume_remove.load(Ordering::SeqCst) {
            return Err(EngineError::Conflict(format!("volume {name} is in use")));
        }
        let mut state = self.state.lock().await;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("no such volume: {name}")))
    }
}
