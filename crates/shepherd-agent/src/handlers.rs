//! Event adapters: decode the typed request, drive the reconciler, build the
//! reply. This is the only layer that converts errors into replies.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use shepherd_common::event::{EventDecodeError, EventEnvelope, EventReply, EventRequest};
use shepherd_reconciler::{reconciler, volumes, ReconcileError, ReconcilerContext};

#[derive(Error, Debug)]
enum HandlerError {
    #[error("{0}")]
    Decode(#[from] EventDecodeError),
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
    #[error("{0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle one event and produce its reply. Never panics, never loses the
/// error: failures become `transitioning = "error"` replies.
pub async fn handle(ctx: &ReconcilerContext, event: &EventEnvelope) -> EventReply {
    info!(
        name = %event.name,
        event_id = %event.id,
        resource_id = %event.resource_id,
        "received event"
    );
    match process(ctx, event).await {
        Ok(data) => EventReply::success(event, data),
        Err(HandlerError::Reconcile(err)) if err.is_not_found() => {
            // expected condition, not a failure of the agent
            info!(event_id = %event.id, "resource not found");
            EventReply::error(event, err.to_string())
        }
        Err(err) => {
            error!(event_id = %event.id, error = %err, "event handling failed");
            EventReply::error(event, err.to_string())
        }
    }
}

async fn process(ctx: &ReconcilerContext, event: &EventEnvelope) -> Result<Value, HandlerError> {
    match event.decode()? {
        EventRequest::InstanceActivate { instance, host } => {
            reconciler::activate(ctx, &instance, &host).await?;
            Ok(reconciler::instance_reply(ctx, &instance).await?)
        }
        EventRequest::InstanceDeactivate { instance } => {
            reconciler::deactivate(ctx, &instance).await?;
            Ok(reconciler::instance_reply(ctx, &instance).await?)
        }
        EventRequest::InstanceRemove { instance } => {
            reconciler::remove(ctx, &instance).await?;
            Ok(json!({}))
        }
        EventRequest::InstanceForceStop { id } => {
            reconciler::force_stop(ctx, &id).await?;
            Ok(json!({}))
        }
        EventRequest::InstanceInspect { id, name } => {
            let inspect = reconciler::inspect(ctx, &id, &name).await?;
            let mut data = serde_json::Map::new();
            data.insert(event.resource_type.clone(), serde_json::to_value(&inspect)?);
            Ok(Value::Object(data))
        }
        EventRequest::InstancePull { params } => {
            match reconciler::pull(ctx, &params).await? {
                Some(image) => Ok(json!({
                    "fields": { "dockerImage": serde_json::to_value(&image)? }
                })),
                None => Ok(json!({})),
            }
        }
        EventRequest::VolumeActivate { volume } => {
            volumes::ensure_volume_active(ctx, &volume).await?;
            Ok(json!({}))
        }
        EventRequest::VolumeRemove { volume } => {
            volumes::remove_volume(ctx, &volume).await?;
            Ok(json!({}))
        }
    }
}
