//! Instance reconciliation engine: maps an abstract Instance (desired
//! container spec) onto concrete container-engine operations — lookup,
//! network-mode resolution, volume provisioning, spec building, idempotent
//! state transitions and durable local state recording.

use thiserror::Error;

pub mod context;
pub mod engine;
pub mod links;
pub mod lookup;
pub mod netmode;
pub mod plugin;
pub mod reconciler;
pub mod retry;
pub mod spec;
pub mod state;
pub mod testing;
pub mod volumes;

pub use context::{ReconcilerContext, RetryProfile, Settings};
pub use engine::{ContainerEngine, DockerEngine, EngineError, VolumeInfo};
pub use retry::{Backoff, NoSleep, RetryPolicy, Sleeper, TokioSleeper};

// Re-export the engine client for consumers wiring up a real daemon.
pub use bollard;
pub use shepherd_common as common;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Expected condition driving the idempotent short-circuits; never logged
    /// as an error.
    #[error("container not found")]
    NotFound,
    #[error("container lookup failed: {0}")]
    Lookup(#[source] EngineError),
    #[error("image pull failed: {0}")]
    Pull(#[source] EngineError),
    #[error("container create failed: {0}")]
    Create(#[source] EngineError),
    #[error("container start failed: {0}")]
    Start(#[source] EngineError),
    #[error("container stop failed: {0}")]
    Stop(#[source] EngineError),
    #[error("container remove failed: {0}")]
    Remove(#[source] EngineError),
    #[error("container inspect failed: {0}")]
    Inspect(#[source] EngineError),
    #[error("image operation failed: {0}")]
    Image(#[source] EngineError),
    #[error("volume operation failed: {0}")]
    Volume(#[source] EngineError),
    #[error("storage plugin call failed: {0}")]
    Plugin(String),
    #[error("cannot start container with no image")]
    MissingImage,
    #[error("failed to stop container {0}")]
    StopEscalationFailed(String),
    #[error("volume {0} did not become active")]
    VolumeNotActivated(String),
    #[error("failed to record state: {0}")]
    StateIo(#[from] std::io::Error),
    #[error("json encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
