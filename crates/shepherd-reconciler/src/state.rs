//! Durable local state: one JSON snapshot of the Instance per container id,
//! written via temp-file plus atomic rename. A co-located read-only API uses
//! these files to answer "what instance is this container" without asking
//! the control plane.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use shepherd_common::Instance;

use crate::context::ReconcilerContext;
use crate::lookup;
use crate::{ReconcileError, Result};

fn state_path(dir: &Path, container_id: &str) -> PathBuf {
    dir.join(container_id)
}

fn temp_path(dir: &Path, container_id: &str) -> PathBuf {
    dir.join(format!("tmp-{container_id}"))
}

/// Record the instance↔container mapping. With no id supplied the container
/// is looked up; nothing is written when none exists.
pub async fn record(
    ctx: &ReconcilerContext,
    instance: &Instance,
    container_id: Option<&str>,
) -> Result<()> {
    let container_id = match container_id {
        Some(id) => id.to_string(),
        None => match lookup::locate(ctx, instance, false).await? {
            Some(container) => lookup::container_id(&container).to_string(),
            None => return Ok(()),
        },
    };
    if container_id.is_empty() {
        return Ok(());
    }

    let dir = ctx.settings.state_dir.as_path();
    fs::create_dir_all(dir)?;

    let temp = temp_path(dir, &container_id);
    let target = state_path(dir, &container_id);
    let _ = fs::remove_file(&temp);
    let _ = fs::remove_file(&target);

    let data = serde_json::to_vec_pretty(instance)?;
    fs::write(&temp, data)?;

    // The local read-only API may transiently hold the target path open;
    // the rename is retried, never rewritten.
    ctx.retries
        .rename
        .run(ctx.sleeper.as_ref(), || {
            let temp = temp.clone();
            let target = target.clone();
            async move { fs::rename(&temp, &target) }
        })
        .await
        .map_err(ReconcileError::StateIo)?;

    debug!(container_id, path = %target.display(), "state recorded");
    Ok(())
}

/// Drop the canonical snapshot and any stale temp file for the instance's
/// container.
pub async fn purge(ctx: &ReconcilerContext, instance: &Instance) -> Result<()> {
    let Some(container) = lookup::locate(ctx, instance, false).await? else {
        return Ok(());
    };
    purge_id(ctx, lookup::container_id(&container))
}

/// Purge by raw container id, for callers that already removed the container.
pub fn purge_id(ctx: &ReconcilerContext, container_id: &str) -> Result<()> {
    if container_id.is_empty() {
        return Ok(());
    }
    let dir = ctx.settings.state_dir.as_path();
    for path in [temp_path(dir, container_id), state_path(dir, container_id)] {
        if path.exists() {
            fs::remove_file(&path)?;
            info!(path = %path.display(), "state file purged");
        }
    }
    Ok(())
}

/// Read a recorded snapshot back. Used by the local API and by tests.
pub fn read(state_dir: &Path, container_id: &str) -> Result<Instance> {
    let data = fs::read(state_path(state_dir, container_id))?;
    Ok(serde_json::from_slice(&data)?)
}
