//! The state machine: Absent → Created → Running → Stopped → Absent.
//! Every transition is idempotent and errors carry call-site context; the
//! only automatic rollback is deleting a just-created container whose start
//! failed.

use std::collections::BTreeMap;

use bollard::models::{ContainerInspectResponse, ImageInspect};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use shepherd_common::event::PullParams;
use shepherd_common::{Host, Instance, PULL_IMAGE_LABEL};

use crate::context::ReconcilerContext;
use crate::spec::{BuildInput, ResolvedRefs, SpecParts};
use crate::{lookup, netmode, spec, state, volumes};
use crate::{ReconcileError, Result};

/// Converge the engine to "running" for this instance.
///
/// No-op instances only refresh the persisted state. An already-running
/// container short-circuits. Otherwise the spec is built, the container
/// located or created (creating retries once after a pull when the image is
/// missing), and started; a start failure on a container created in this
/// call deletes it again so no unusable container is left behind.
#[instrument(skip_all, fields(uuid = %instance.uuid))]
pub async fn activate(ctx: &ReconcilerContext, instance: &Instance, host: &Host) -> Result<()> {
    if instance.process_data.no_op {
        state::record(ctx, instance, None).await?;
        return Ok(());
    }
    if is_active(ctx, instance).await? {
        info!("instance already running");
        state::record(ctx, instance, None).await?;
        return Ok(());
    }

    let _gate = ctx.compute_gate().await;

    let image = image_name(&instance.fields.image_uuid)?;

    volumes::activate_mounted_volumes(ctx, instance).await?;

    let refs = resolve_refs(ctx, instance).await?;
    let resolv_conf = std::fs::read_to_string(&ctx.settings.resolv_conf).unwrap_or_default();
    let input = BuildInput {
        instance,
        host,
        info: &ctx.info,
        settings: &ctx.settings,
        refs,
        resolv_conf,
    };
    let built = spec::build_spec(&input);

    let (container_id, created) = match lookup::locate(ctx, instance, false).await? {
        Some(existing) => (lookup::container_id(&existing).to_string(), false),
        None => {
            let name = preferred_name(ctx, instance).await?;
            (create_container(ctx, instance, &image, &name, built).await?, true)
        }
    };

    info!(%container_id, "starting container");
    if let Err(err) = ctx.engine().start_container(&container_id).await {
        if created {
            remove_container_by_id(ctx, &container_id).await?;
        }
        return Err(ReconcileError::Start(err));
    }

    netmode::install_dns_redirect(instance);

    state::record(ctx, instance, Some(&container_id)).await?;
    Ok(())
}

/// Converge to "stopped": stop with the caller's timeout, escalate to kill,
/// fail only if the container still runs after the kill.
#[instrument(skip_all, fields(uuid = %instance.uuid))]
pub async fn deactivate(ctx: &ReconcilerContext, instance: &Instance) -> Result<()> {
    if instance.process_data.no_op {
        return Ok(());
    }
    let Some(container) = lookup::locate(ctx, instance, false).await? else {
        return Ok(());
    };
    let id = lookup::container_id(&container).to_string();
    if !lookup::is_running(ctx, &id).await? {
        debug!(container_id = %id, "already stopped");
        return Ok(());
    }

    let timeout = instance.process_data.timeout.unwrap_or(10) as i64;
    match ctx.engine().stop_container(&id, timeout).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => warn!(container_id = %id, error = %err, "stop failed, escalating to kill"),
    }

    if lookup::is_running(ctx, &id).await? {
        match ctx.engine().kill_container(&id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => warn!(container_id = %id, error = %err, "kill failed"),
        }
    }
    if lookup::is_running(ctx, &id).await? {
        return Err(ReconcileError::StopEscalationFailed(instance.uuid.clone()));
    }
    info!(container_id = %id, "container deactivated");
    Ok(())
}

/// Converge to "absent". An absent container is success without any engine
/// remove call.
#[instrument(skip_all, fields(uuid = %instance.uuid))]
pub async fn remove(ctx: &ReconcilerContext, instance: &Instance) -> Result<()> {
    if instance.process_data.no_op {
        return Ok(());
    }
    let Some(container) = lookup::locate(ctx, instance, false).await? else {
        return Ok(());
    };

    let _gate = ctx.compute_gate().await;

    let id = lookup::container_id(&container).to_string();
    remove_container_by_id(ctx, &id).await?;
    state::purge_id(ctx, &id)?;
    Ok(())
}

/// Raw-id remove for out-of-band cleanup; tolerates an already-absent
/// container.
#[instrument(skip(ctx))]
pub async fn force_stop(ctx: &ReconcilerContext, container_id: &str) -> Result<()> {
    remove_container_by_id(ctx, container_id).await?;
    info!(container_id, "container force-stopped");
    Ok(())
}

/// Kill, wait for the process to be gone, then remove. Not-found on the
/// remove call itself is tolerated: someone else finishing the job is fine.
pub async fn remove_container_by_id(ctx: &ReconcilerContext, container_id: &str) -> Result<()> {
    if let Err(err) = ctx.engine().kill_container(container_id).await {
        debug!(container_id, error = %err, "kill before remove failed");
    }

    let engine = ctx.engine();
    ctx.retries
        .remove_wait
        .wait_until(ctx.sleeper.as_ref(), || async move {
            match engine.inspect_container(container_id).await {
                Ok(inspect) => inspect
                    .state
                    .and_then(|s| s.pid)
                    .map(|pid| pid == 0)
                    .unwrap_or(true),
                Err(_) => true,
            }
        })
        .await;

    match ctx.engine().remove_container(container_id).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(ReconcileError::Remove(err)),
    }
}

/// Read-only inspect: by id first, then by name suffix.
pub async fn inspect(
    ctx: &ReconcilerContext,
    id: &str,
    name: &str,
) -> Result<ContainerInspectResponse> {
    let all = ctx
        .engine()
        .list_containers(Default::default())
        .await
        .map_err(ReconcileError::Inspect)?;

    let mut found = None;
    if !id.is_empty() {
        found = all.iter().find(|c| c.id.as_deref() == Some(id));
    }
    if found.is_none() && !name.is_empty() {
        let suffix = format!("/{name}");
        found = all.iter().find(|c| {
            c.names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n.ends_with(&suffix)))
        });
    }
    match found {
        Some(container) => ctx
            .engine()
            .inspect_container(lookup::container_id(container))
            .await
            .map_err(ReconcileError::Inspect),
        None => Err(ReconcileError::NotFound),
    }
}

/// Image pull with the cached/complete modes and optional extra tag.
pub async fn pull(ctx: &ReconcilerContext, params: &PullParams) -> Result<Option<ImageInspect>> {
    let image = image_name(&params.image_uuid)?;

    let existing = match ctx.engine().inspect_image(&image).await {
        Ok(inspect) => Some(inspect),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(ReconcileError::Image(err)),
    };

    if params.mode == "cached" {
        if let Some(existing) = existing {
            return Ok(Some(existing));
        }
    }
    if params.complete {
        match ctx.engine().remove_image(&format!("{image}{}", params.tag)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(ReconcileError::Image(err)),
        }
        return Ok(None);
    }

    ctx.engine().pull_image(&image).await.map_err(ReconcileError::Pull)?;

    if !params.tag.is_empty() {
        let (repo, tag) = parse_repo_tag(&image);
        ctx.engine()
            .tag_image(&image, &repo, &format!("{tag}{}", params.tag))
            .await
            .map_err(ReconcileError::Image)?;
    }

    ctx.engine()
        .inspect_image(&image)
        .await
        .map(Some)
        .map_err(ReconcileError::Image)
}

/// Whether the instance's container is currently running. No-op instances
/// read as active by definition.
pub async fn is_active(ctx: &ReconcilerContext, instance: &Instance) -> Result<bool> {
    if instance.process_data.no_op {
        return Ok(true);
    }
    match lookup::locate(ctx, instance, false).await? {
        Some(container) => lookup::is_running(ctx, lookup::container_id(&container)).await,
        None => Ok(false),
    }
}

/// Reply payload for instance operations: updated external id, address,
/// ports, mounts and the raw inspect.
pub async fn instance_reply(ctx: &ReconcilerContext, instance: &Instance) -> Result<serde_json::Value> {
    let Some(container) = lookup::locate(ctx, instance, false).await? else {
        return Ok(json!({}));
    };
    let id = lookup::container_id(&container).to_string();
    let inspect = match ctx.engine().inspect_container(&id).await {
        Ok(inspect) => inspect,
        Err(err) if err.is_not_found() => return Ok(json!({})),
        Err(err) => return Err(ReconcileError::Inspect(err)),
    };

    let ip = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ip_address.clone())
        .unwrap_or_default();
    let ports = port_specs(&inspect);
    let mounts = serde_json::to_value(inspect.mounts.clone().unwrap_or_default())?;

    Ok(json!({
        "instance": {
            "externalId": id,
            "ip": ip,
            "ports": ports,
            "mounts": mounts,
            "inspect": serde_json::to_value(&inspect)?,
        }
    }))
}

/// `[bind-address:][public-port:]private/proto` specs, sorted for stable
/// replies.
fn port_specs(inspect: &ContainerInspectResponse) -> Vec<String> {
    let Some(ports) = inspect.network_settings.as_ref().and_then(|ns| ns.ports.as_ref()) else {
        return Vec::new();
    };
    let sorted: BTreeMap<_, _> = ports.iter().collect();
    sorted
        .into_iter()
        .map(|(key, bindings)| {
            let first = bindings.as_ref().and_then(|b| b.first());
            match first {
                Some(binding) => {
                    let mut parts = String::new();
                    if let Some(ip) = binding.host_ip.as_deref().filter(|ip| !ip.is_empty()) {
                        parts.push_str(ip);
                        parts.push(':');
                    }
                    if let Some(port) = binding.host_port.as_deref().filter(|p| !p.is_empty()) {
                        parts.push_str(port);
                        parts.push(':');
                    }
                    parts.push_str(key);
                    parts
                }
                None => key.clone(),
            }
        })
        .collect()
}

async fn resolve_refs(ctx: &ReconcilerContext, instance: &Instance) -> Result<ResolvedRefs> {
    let volumes_from_ids = volumes::resolve_volumes_from(ctx, instance).await?;

    let mut network_container_id = None;
    let wants_container_mode = instance
        .nics
        .first()
        .is_some_and(|nic| nic.network.kind == "dockerContainer");
    if wants_container_mode {
        if let Some(target) = instance.network_container.as_deref() {
            network_container_id = match lookup::locate(ctx, target, false).await? {
                Some(container) => Some(lookup::container_id(&container).to_string()),
                None => Some(derived_name(target)),
            };
        }
    }
    Ok(ResolvedRefs { volumes_from_ids, network_container_id })
}

async fn create_container(
    ctx: &ReconcilerContext,
    instance: &Instance,
    image: &str,
    name: &str,
    built: SpecParts,
) -> Result<String> {
    let mut config = built.into_config();
    config.image = Some(image.to_string());

    let pull_always = config
        .labels
        .as_ref()
        .and_then(|l| l.get(PULL_IMAGE_LABEL))
        .is_some_and(|v| v == "always");
    if pull_always {
        ctx.engine().pull_image(image).await.map_err(ReconcileError::Pull)?;
    }

    info!(name, image, "creating container");
    match ctx.engine().create_container(name, config.clone()).await {
        Ok(id) => Ok(id),
        Err(err) if err.is_not_found() => {
            // image not present locally: pull once and retry the create
            ctx.engine().pull_image(image).await.map_err(ReconcileError::Pull)?;
            ctx.engine()
                .create_container(name, config)
                .await
                .map_err(ReconcileError::Create)
        }
        Err(err) => Err(ReconcileError::Create(err)),
    }
}

/// The container is named after the instance when the name is usable as an
/// engine name and free, otherwise after the uuid.
async fn preferred_name(ctx: &ReconcilerContext, instance: &Instance) -> Result<String> {
    let candidate = derived_name(instance);
    if candidate == instance.uuid {
        return Ok(candidate);
    }
    match ctx.engine().inspect_container(&candidate).await {
        Ok(_) => Ok(instance.uuid.clone()),
        Err(err) if err.is_not_found() => Ok(candidate),
        Err(err) => Err(ReconcileError::Lookup(err)),
    }
}

/// Pure part of the naming scheme; also used as the fallback reference for
/// unresolved network containers.
pub fn derived_name(instance: &Instance) -> String {
    if is_valid_container_name(&instance.name) {
        format!("s-{}", instance.name)
    } else {
        instance.uuid.clone()
    }
}

fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    let mut rest = 0;
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            return false;
        }
        rest += 1;
    }
    rest >= 1
}

fn image_name(image_uuid: &str) -> Result<String> {
    let image = image_uuid.strip_prefix("docker:").unwrap_or(image_uuid);
    if image.is_empty() {
        return Err(ReconcileError::MissingImage);
    }
    Ok(image.to_string())
}

fn parse_repo_tag(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_strips_the_scheme() {
        assert_eq!(image_name("docker:nginx:1.25").unwrap(), "nginx:1.25");
        assert_eq!(image_name("nginx").unwrap(), "nginx");
        assert!(matches!(image_name(""), Err(ReconcileError::MissingImage)));
        assert!(matches!(image_name("docker:"), Err(ReconcileError::MissingImage)));
    }

    #[test]
    fn repo_tag_parsing_handles_registry_ports() {
        assert_eq!(parse_repo_tag("nginx:1.25"), ("nginx".into(), "1.25".into()));
        assert_eq!(parse_repo_tag("nginx"), ("nginx".into(), "latest".into()));
        assert_eq!(
            parse_repo_tag("registry:5000/team/app"),
            ("registry:5000/team/app".into(), "latest".into())
        );
        assert_eq!(
            parse_repo_tag("registry:5000/team/app:v2"),
            ("registry:5000/team/app".into(), "v2".into())
        );
    }

    #[test]
    fn container_names_derive_from_instance_name_when_valid() {
        let mut instance = Instance::default();
        instance.uuid = "8a4b6d2e".into();
        instance.name = "web-1".into();
        assert_eq!(derived_name(&instance), "s-web-1");
        instance.name = "has space".into();
        assert_eq!(derived_name(&instance), "8a4b6d2e");
        instance.name = "x".into();
        assert_eq!(derived_name(&instance), "8a4b6d2e");
    }
}
