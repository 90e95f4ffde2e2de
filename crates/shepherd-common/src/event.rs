//! Typed event envelope and reply types.
//!
//! The transport hands us raw JSON; it is decoded exactly once here into a
//! tagged [`EventRequest`] so everything past the boundary operates on typed
//! values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Host, Instance, ProcessData, Volume};

pub const INSTANCE_ACTIVATE: &str = "compute.instance.activate";
pub const INSTANCE_DEACTIVATE: &str = "compute.instance.deactivate";
pub const INSTANCE_FORCE_STOP: &str = "compute.instance.force.stop";
pub const INSTANCE_INSPECT: &str = "compute.instance.inspect";
pub const INSTANCE_PULL: &str = "compute.instance.pull";
pub const INSTANCE_REMOVE: &str = "compute.instance.remove";
pub const VOLUME_ACTIVATE: &str = "storage.volume.activate";
pub const VOLUME_REMOVE: &str = "storage.volume.remove";

#[derive(Error, Debug)]
pub enum EventDecodeError {
    #[error("no handler registered for event '{0}'")]
    UnknownEvent(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Inbound event as delivered by the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub name: String,
    pub reply_to: String,
    pub resource_id: String,
    pub resource_type: String,
    pub time: i64,
    pub data: Value,
}

/// Typed view of an inbound event.
#[derive(Debug, Clone)]
pub enum EventRequest {
    InstanceActivate { instance: Instance, host: Host },
    InstanceDeactivate { instance: Instance },
    InstanceRemove { instance: Instance },
    InstanceForceStop { id: String },
    InstanceInspect { id: String, name: String },
    InstancePull { params: PullParams },
    VolumeActivate { volume: Volume },
    VolumeRemove { volume: Volume },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PullParams {
    pub image_uuid: String,
    /// "all" pulls unconditionally, "cached" is satisfied by a local image.
    pub mode: String,
    /// Remove the local image instead of pulling it.
    pub complete: bool,
    /// Extra tag applied after the pull.
    pub tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InstanceHostMap {
    instance: Instance,
    host: Host,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VolumeStoragePoolMap {
    volume: Volume,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ForceStopPayload {
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InspectPayload {
    id: String,
    name: String,
}

impl EventEnvelope {
    fn section(&self, key: &str) -> Value {
        self.data.get(key).cloned().unwrap_or(Value::Null)
    }

    fn process_data(&self) -> ProcessData {
        self.data
            .get("processData")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Decode the dynamic payload into a typed request. The event-level
    /// process data is folded onto the instance so downstream code never
    /// looks back into the raw envelope.
    pub fn decode(&self) -> Result<EventRequest, EventDecodeError> {
        let with_instance = |envelope: &EventEnvelope| -> Result<(Instance, Host), serde_json::Error> {
            let map: InstanceHostMap = serde_json::from_value(envelope.section("instanceHostMap"))?;
            let mut instance = map.instance;
            instance.process_data = envelope.process_data();
            Ok((instance, map.host))
        };

        match self.name.as_str() {
            INSTANCE_ACTIVATE => {
                let (instance, host) = with_instance(self)?;
                Ok(EventRequest::InstanceActivate { instance, host })
            }
            INSTANCE_DEACTIVATE => {
                let (instance, _) = with_instance(self)?;
                Ok(EventRequest::InstanceDeactivate { instance })
            }
            INSTANCE_REMOVE => {
                let (instance, _) = with_instance(self)?;
                Ok(EventRequest::InstanceRemove { instance })
            }
            INSTANCE_FORCE_STOP => {
                let payload: ForceStopPayload =
                    serde_json::from_value(self.section("instanceForceStop"))?;
                Ok(EventRequest::InstanceForceStop { id: payload.id })
            }
            INSTANCE_INSPECT => {
                let payload: InspectPayload =
                    serde_json::from_value(self.section("instanceInspect"))?;
                Ok(EventRequest::InstanceInspect { id: payload.id, name: payload.name })
            }
            INSTANCE_PULL => {
                let params: PullParams = serde_json::from_value(self.section("instancePull"))?;
                Ok(EventRequest::InstancePull { params })
            }
            VOLUME_ACTIVATE => {
                let map: VolumeStoragePoolMap =
                    serde_json::from_value(self.section("volumeStoragePoolMap"))?;
                Ok(EventRequest::VolumeActivate { volume: map.volume })
            }
            VOLUME_REMOVE => {
                let map: VolumeStoragePoolMap =
                    serde_json::from_value(self.section("volumeStoragePoolMap"))?;
                Ok(EventRequest::VolumeRemove { volume: map.volume })
            }
            other => Err(EventDecodeError::UnknownEvent(other.to_string())),
        }
    }
}

/// Outbound reply, published by the transport. References the originating
/// event through `previous_ids`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventReply {
    pub id: String,
    pub name: String,
    pub previous_ids: Vec<String>,
    pub resource_id: String,
    pub resource_type: String,
    pub time: i64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitioning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitioning_message: Option<String>,
}

impl EventReply {
    fn base(event: &EventEnvelope) -> Self {
        EventReply {
            id: uuid::Uuid::new_v4().to_string(),
            name: event.reply_to.clone(),
            previous_ids: vec![event.id.clone()],
            resource_id: event.resource_id.clone(),
            resource_type: event.resource_type.clone(),
            time: chrono::Utc::now().timestamp_millis(),
            data: Value::Object(Default::default()),
            transitioning: None,
            transitioning_message: None,
        }
    }

    pub fn success(event: &EventEnvelope, data: Value) -> Self {
        EventReply { data, ..Self::base(event) }
    }

    pub fn error(event: &EventEnvelope, message: impl Into<String>) -> Self {
        EventReply {
            transitioning: Some("error".to_string()),
            transitioning_message: Some(message.into()),
            ..Self::base(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(name: &str, data: Value) -> EventEnvelope {
        EventEnvelope {
            id: "event-1".into(),
            name: name.into(),
            reply_to: "reply.event-1".into(),
            resource_id: "42".into(),
            resource_type: "instanceHostMap".into(),
            time: 0,
            data,
        }
    }

    #[test]
    fn decodes_activate_and_folds_process_data() {
        let event = envelope(
            INSTANCE_ACTIVATE,
            json!({
                "instanceHostMap": {
                    "instance": {"uuid": "i-1", "name": "web"},
                    "host": {"id": 7}
                },
                "processData": {"containerNoOpEvent": true, "timeout": 5}
            }),
        );
        match event.decode().unwrap() {
            EventRequest::InstanceActivate { instance, host } => {
                assert_eq!(instance.uuid, "i-1");
                assert!(instance.process_data.no_op);
                assert_eq!(instance.process_data.timeout, Some(5));
                assert_eq!(host.id, 7);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let event = envelope("compute.instance.migrate", json!({}));
        assert!(matches!(
            event.decode(),
            Err(EventDecodeError::UnknownEvent(name)) if name == "compute.instance.migrate"
        ));
    }

    #[test]
    fn error_reply_carries_transitioning_marker() {
        let event = envelope(INSTANCE_ACTIVATE, json!({}));
        let reply = EventReply::error(&event, "engine unreachable");
        assert_eq!(reply.transitioning.as_deref(), Some("error"));
        assert_eq!(reply.previous_ids, vec!["event-1".to_string()]);
        assert_eq!(reply.resource_id, "42");
        let success = EventReply::success(&event, json!({"ok": true}));
        assert!(success.transitioning.is_none());
    }
}
