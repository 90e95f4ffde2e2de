//! Volume provisioning: data-volume string parsing, volumes-from resolution
//! and the managed-volume lifecycle against the engine volume API or a
//! storage plugin socket.

use tracing::{info, warn};

use shepherd_common::{Instance, Volume};

use crate::context::ReconcilerContext;
use crate::lookup;
use crate::plugin::{PluginAction, PluginOutcome};
use crate::{ReconcileError, Result};

/// Mountpoint marker left behind when a volume has been relocated to another
/// host; such a volume must be deleted and recreated, never reused.
pub const MOVED_MARKER: &str = "moved";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedVolumes {
    /// In-container paths declared as anonymous volumes (includes the
    /// destination of every bind).
    pub anonymous: Vec<String>,
    /// `src:dst:mode` bind strings, mode always explicit.
    pub binds: Vec<String>,
}

/// Parse `src[:dst[:mode]]` strings. A bare path is an anonymous volume; the
/// mode defaults to `rw`.
pub fn parse_data_volumes(specs: &[String]) -> ParsedVolumes {
    let mut parsed = ParsedVolumes::default();
    for spec in specs {
        let mut parts = spec.splitn(3, ':');
        let first = match parts.next() {
            Some(p) if !p.is_empty() => p,
            _ => continue,
        };
        match parts.next() {
            None => {
                if !parsed.anonymous.iter().any(|v| v == first) {
                    parsed.anonymous.push(first.to_string());
                }
            }
            Some(destination) => {
                if !parsed.anonymous.iter().any(|v| v == destination) {
                    parsed.anonymous.push(destination.to_string());
                }
                let mode = parts.next().unwrap_or("rw");
                parsed.binds.push(format!("{first}:{destination}:{mode}"));
            }
        }
    }
    parsed
}

/// Resolve `data_volumes_from_containers` references to engine container
/// ids. Unresolved references are tolerated and skipped.
pub async fn resolve_volumes_from(
    ctx: &ReconcilerContext,
    instance: &Instance,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for source in &instance.data_volumes_from_containers {
        match lookup::locate(ctx, source, false).await? {
            Some(container) => ids.push(lookup::container_id(&container).to_string()),
            None => warn!(uuid = %source.uuid, "volumes-from container not found, skipping"),
        }
    }
    Ok(ids)
}

/// Make sure every prerequisite mounted volume exists before the container
/// that uses it is created. Idempotent.
pub async fn activate_mounted_volumes(ctx: &ReconcilerContext, instance: &Instance) -> Result<()> {
    for volume in &instance.volumes_from_data_volume_mounts {
        ensure_volume_active(ctx, volume).await?;
    }
    Ok(())
}

/// Activate one volume. No-op for unmanaged volumes and for volumes that are
/// already active; verifies activation afterwards.
pub async fn ensure_volume_active(ctx: &ReconcilerContext, volume: &Volume) -> Result<()> {
    if !volume.is_managed() {
        return Ok(());
    }

    if ctx.plugin.serves(volume) {
        let plugin = &ctx.plugin;
        for action in [PluginAction::Create, PluginAction::Attach] {
            let outcome = ctx
                .retries
                .plugin
                .run(ctx.sleeper.as_ref(), || plugin.call(volume, action))
                .await?;
            if outcome == PluginOutcome::Unsupported {
                break;
            }
        }
        return Ok(());
    }

    if is_volume_active(ctx, volume).await? {
        return Ok(());
    }
    create_engine_volume(ctx, volume).await?;
    if !is_volume_active(ctx, volume).await? {
        return Err(ReconcileError::VolumeNotActivated(volume.name.clone()));
    }
    Ok(())
}

async fn create_engine_volume(ctx: &ReconcilerContext, volume: &Volume) -> Result<()> {
    // A moved volume still holds a stale engine reference; it has to go
    // before the name can be reused.
    match ctx.engine().inspect_volume(&volume.name).await {
        Ok(existing) if existing.mountpoint == MOVED_MARKER => {
            info!(volume = %volume.name, "removing moved volume so it can be re-added");
            ctx.engine()
                .remove_volume(&volume.name, true)
                .await
                .map_err(ReconcileError::Volume)?;
        }
        Ok(_) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(ReconcileError::Volume(err)),
    }

    ctx.engine()
        .create_volume(
            &volume.name,
            &volume.driver,
            volume.driver_opts.clone().into_iter().collect(),
        )
        .await
        .map_err(ReconcileError::Volume)
}

/// Active means the engine knows the volume and it has not been moved away.
/// Unmanaged volumes are always considered active.
pub async fn is_volume_active(ctx: &ReconcilerContext, volume: &Volume) -> Result<bool> {
    if !volume.is_managed() {
        return Ok(true);
    }
    match ctx.engine().inspect_volume(&volume.name).await {
        Ok(info) => Ok(info.mountpoint != MOVED_MARKER),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(ReconcileError::Volume(err)),
    }
}

pub async fn is_volume_removed(ctx: &ReconcilerContext, volume: &Volume) -> Result<bool> {
    if volume.device_number == 0 {
        if let Some(instance) = volume.instance.as_deref() {
            return Ok(lookup::locate(ctx, instance, false).await?.is_none());
        }
        return Ok(true);
    }
    if volume.is_managed() {
        return Ok(!is_volume_active(ctx, volume).await?);
    }
    if volume.is_host_path {
        return Ok(true);
    }
    Ok(!local_path(volume).is_some_and(|p| std::path::Path::new(&p).exists()))
}

/// Remove a volume. Idempotent: an absent volume is success.
pub async fn remove_volume(ctx: &ReconcilerContext, volume: &Volume) -> Result<()> {
    if is_volume_removed(ctx, volume).await? {
        return Ok(());
    }

    // Device number 0 is the instance's root volume; removing it means
    // removing the backing container.
    if volume.device_number == 0 {
        if let Some(instance) = volume.instance.as_deref() {
            if let Some(container) = lookup::locate(ctx, instance, false).await? {
                crate::reconciler::remove_container_by_id(ctx, lookup::container_id(&container))
                    .await?;
            }
        }
        return Ok(());
    }

    if ctx.plugin.serves(volume) {
        let plugin = &ctx.plugin;
        ctx.retries
            .plugin
            .run(ctx.sleeper.as_ref(), || plugin.call(volume, PluginAction::Remove))
            .await?;
        return Ok(());
    }

    if volume.is_managed() {
        let engine = ctx.engine();
        let name = volume.name.clone();
        let result = ctx
            .retries
            .volume_remove
            .run(ctx.sleeper.as_ref(), || engine.remove_volume(&name, false))
            .await;
        return match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) if err.is_conflict() => {
                warn!(volume = %volume.name, error = %err, "conflict while deleting volume, orphaning it");
                Ok(())
            }
            Err(err) => Err(ReconcileError::Volume(err)),
        };
    }

    if !volume.is_host_path {
        if let Some(path) = local_path(volume) {
            let path = std::path::Path::new(&path);
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
        }
    }
    Ok(())
}

fn local_path(volume: &Volume) -> Option<String> {
    if volume.uri.is_empty() {
        return None;
    }
    Some(volume.uri.strip_prefix("file://").unwrap_or(&volume.uri).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(specs: &[&str]) -> Vec<String> {
        specs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn two_part_spec_gets_default_mode() {
        let parsed = parse_data_volumes(&strings(&["/a:/b"]));
        assert_eq!(parsed.binds, vec!["/a:/b:rw".to_string()]);
        assert_eq!(parsed.anonymous, vec!["/b".to_string()]);
    }

    #[test]
    fn explicit_mode_is_preserved() {
        let parsed = parse_data_volumes(&strings(&["/a:/b:ro"]));
        assert_eq!(parsed.binds, vec!["/a:/b:ro".to_string()]);
    }

    #[test]
    fn bare_path_is_an_anonymous_volume() {
        let parsed = parse_data_volumes(&strings(&["/a"]));
        assert!(parsed.binds.is_empty());
        assert_eq!(parsed.anonymous, vec!["/a".to_string()]);
    }

    #[test]
    fn destinations_are_deduplicated() {
        let parsed = parse_data_volumes(&strings(&["/x:/data", "/y:/data:ro", "/data"]));
        assert_eq!(parsed.anonymous, vec!["/data".to_string()]);
        assert_eq!(parsed.binds.len(), 2);
    }

    #[test]
    fn local_path_strips_the_uri_scheme() {
        let volume = Volume { uri: "file:///var/lib/data/v1".into(), ..Default::default() };
        assert_eq!(local_path(&volume).as_deref(), Some("/var/lib/data/v1"));
    }
}
