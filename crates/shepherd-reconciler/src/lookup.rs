//! Resolving an Instance to an existing engine container. Never creates
//! anything; "not found" is `Ok(None)`, distinct from transport errors.

use std::collections::HashMap;

use bollard::models::ContainerSummary;
use shepherd_common::{Instance, AGENT_ID_LABEL, UUID_LABEL};

use crate::context::ReconcilerContext;
use crate::{ReconcileError, Result};

/// Resolution order: exact uuid-label match, then a scan of names/labels for
/// the derived uuid, then the recorded external id, and — only when
/// `by_agent` — the agent-id label, which recovers orphaned helper
/// containers whose uuid label was lost.
pub async fn locate(
    ctx: &ReconcilerContext,
    instance: &Instance,
    by_agent: bool,
) -> Result<Option<ContainerSummary>> {
    if instance.uuid.is_empty() {
        return Ok(None);
    }

    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{}={}", UUID_LABEL, instance.uuid)],
    );
    let labeled = ctx
        .engine()
        .list_containers(filters)
        .await
        .map_err(ReconcileError::Lookup)?;
    if let Some(container) = labeled.into_iter().next() {
        return Ok(Some(container));
    }

    let all = ctx
        .engine()
        .list_containers(HashMap::new())
        .await
        .map_err(ReconcileError::Lookup)?;

    if let Some(container) = all.iter().find(|c| derived_uuid(c) == instance.uuid) {
        return Ok(Some(container.clone()));
    }

    if let Some(external_id) = instance.external_id.as_deref().filter(|id| !id.is_empty()) {
        if let Some(container) = all.iter().find(|c| c.id.as_deref() == Some(external_id)) {
            return Ok(Some(container.clone()));
        }
    }

    if by_agent && instance.agent_id != 0 {
        let agent_id = instance.agent_id.to_string();
        if let Some(container) = all.iter().find(|c| {
            c.labels
                .as_ref()
                .and_then(|l| l.get(AGENT_ID_LABEL))
                .is_some_and(|v| *v == agent_id)
        }) {
            return Ok(Some(container.clone()));
        }
    }

    Ok(None)
}

/// Identity of a container as this agent sees it: the uuid label when
/// stamped, otherwise the bare container name.
pub fn derived_uuid(container: &ContainerSummary) -> String {
    if let Some(uuid) = container.labels.as_ref().and_then(|l| l.get(UUID_LABEL)) {
        return uuid.clone();
    }
    match container.names.as_ref().and_then(|n| n.first()) {
        Some(name) => name.strip_prefix('/').unwrap_or(name).to_string(),
        None => format!("no-uuid-{}", container.id.as_deref().unwrap_or_default()),
    }
}

pub fn container_id(container: &ContainerSummary) -> &str {
    container.id.as_deref().unwrap_or_default()
}

/// Whether the engine reports the container as running. Not-found reads as
/// not running.
pub async fn is_running(ctx: &ReconcilerContext, id: &str) -> Result<bool> {
    match ctx.engine().inspect_container(id).await {
        Ok(inspect) => Ok(inspect.state.and_then(|s| s.running).unwrap_or(false)),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(ReconcileError::Inspect(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, name: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: Some(id.to_string()),
            names: Some(vec![format!("/{name}")]),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn derived_uuid_prefers_label_over_name() {
        let labeled = summary("c1", "s-web", &[(UUID_LABEL, "i-1")]);
        assert_eq!(derived_uuid(&labeled), "i-1");
        let unlabeled = summary("c2", "i-2", &[]);
        assert_eq!(derived_uuid(&unlabeled), "i-2");
        let bare = ContainerSummary { id: Some("c3".into()), ..Default::default() };
        assert_eq!(derived_uuid(&bare), "no-uuid-c3");
    }
}
