//! Event dispatch layer of the agent: env-driven configuration, a bounded
//! worker pool with per-resource advisory locking, and the per-event
//! adapters between the control plane's envelopes and the reconciler.
//!
//! The transport itself (websocket subscription and reply publishing) is an
//! external collaborator; it feeds [`dispatch::Dispatcher::dispatch`] and
//! publishes the [`shepherd_common::EventReply`] each accepted event
//! resolves to.

pub mod config;
pub mod dispatch;
pub mod handlers;

pub use config::AgentConfig;
pub use dispatch::{DispatchOutcome, Dispatcher};

/// Install the process-wide subscriber. Called once by the bootstrap before
/// anything logs; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
