//! Bounded parallel event dispatch. One worker per event; an event for a
//! resource that is already being worked on is dropped (the control plane
//! redelivers), as is an event arriving while every worker is busy.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

use shepherd_common::event::{EventEnvelope, EventReply};
use shepherd_reconciler::ReconcilerContext;

use crate::handlers;

pub enum DispatchOutcome {
    /// The event is being handled; the handle resolves to its reply.
    Accepted(JoinHandle<EventReply>),
    /// Another event for the same resource id is in flight.
    DroppedBusyResource,
    /// Every worker is occupied.
    DroppedNoWorker,
}

pub struct Dispatcher {
    ctx: Arc<ReconcilerContext>,
    workers: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ReconcilerContext>, worker_count: usize) -> Self {
        Dispatcher {
            ctx,
            workers: Arc::new(Semaphore::new(worker_count)),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Advisory process-local lock on a resource id. Held for the duration
    /// of one event's handling.
    fn lock_resource(&self, resource_id: &str) -> bool {
        match self.in_flight.entry(resource_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    pub fn dispatch(&self, event: EventEnvelope) -> DispatchOutcome {
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            warn!(name = %event.name, event_id = %event.id, "all workers busy, dropping event");
            return DispatchOutcome::DroppedNoWorker;
        };

        let locked = event.resource_id.is_empty() || self.lock_resource(&event.resource_id);
        if !locked {
            warn!(
                name = %event.name,
                resource_id = %event.resource_id,
                "resource already being processed, dropping event"
            );
            return DispatchOutcome::DroppedBusyResource;
        }

        let ctx = self.ctx.clone();
        let in_flight = self.in_flight.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let reply = handlers::handle(&ctx, &event).await;
            if !event.resource_id.is_empty() {
                in_flight.remove(&event.resource_id);
            }
            reply
        });
        DispatchOutcome::Accepted(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shepherd_common::InfoData;
    use shepherd_reconciler::testing::FakeEngine;
    use shepherd_reconciler::{NoSleep, Settings};
    use tempfile::TempDir;

    fn dispatcher(workers: usize, dir: &TempDir) -> (Dispatcher, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::new());
        let settings = Settings {
            state_dir: dir.path().join("containers"),
            resolv_conf: dir.path().join("resolv.conf"),
            storage_sock_dir: dir.path().join("storage-sockets"),
            ..Default::default()
        };
        let ctx = ReconcilerContext::new(engine.clone(), settings, InfoData::default())
            .with_sleeper(Arc::new(NoSleep));
        (Dispatcher::new(Arc::new(ctx), workers), engine)
    }

    fn activate_event(resource_id: &str, uuid: &str) -> EventEnvelope {
        EventEnvelope {
            id: format!("evt-{resource_id}"),
            name: "compute.instance.activate".into(),
            reply_to: format!("reply.evt-{resource_id}"),
            resource_id: resource_id.into(),
            resource_type: "instanceHostMap".into(),
            time: 0,
            data: json!({
                "instanceHostMap": {
                    "instance": {
                        "uuid": uuid,
                        "name": "web",
                        "fields": {"imageUuid": "docker:nginx:1.25"}
                    },
                    "host": {"id": 1}
                }
            }),
        }
    }

    #[tokio::test]
    async fn dispatch_handles_event_and_releases_the_resource() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, engine) = dispatcher(4, &dir);
        engine.add_image("nginx:1.25").await;

        let DispatchOutcome::Accepted(handle) = dispatcher.dispatch(activate_event("42", "i-1"))
        else {
            panic!("event should have been accepted");
        };
        let reply = handle.await.unwrap();
        assert!(reply.transitioning.is_none());
        assert_eq!(reply.resource_id, "42");
        assert_eq!(engine.container_count().await, 1);

        // resource lock released: a follow-up event is accepted again
        assert!(matches!(
            dispatcher.dispatch(activate_event("42", "i-1")),
            DispatchOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_event_for_same_resource_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _engine) = dispatcher(4, &dir);
        assert!(dispatcher.lock_resource("42"));
        assert!(matches!(
            dispatcher.dispatch(activate_event("42", "i-1")),
            DispatchOutcome::DroppedBusyResource
        ));
        // a different resource still goes through
        assert!(matches!(
            dispatcher.dispatch(activate_event("43", "i-2")),
            DispatchOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn exhausted_worker_pool_drops_events() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _engine) = dispatcher(0, &dir);
        assert!(matches!(
            dispatcher.dispatch(activate_event("42", "i-1")),
            DispatchOutcome::DroppedNoWorker
        ));
    }

    #[tokio::test]
    async fn failures_become_error_replies() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _engine) = dispatcher(4, &dir);
        // instance without an image reference: activation must fail
        let mut event = activate_event("42", "i-1");
        event.data = json!({
            "instanceHostMap": {
                "instance": {"uuid": "i-1", "name": "web"},
                "host": {"id": 1}
            }
        });
        let DispatchOutcome::Accepted(handle) = dispatcher.dispatch(event) else {
            panic!("event should have been accepted");
        };
        let reply = handle.await.unwrap();
        assert_eq!(reply.transitioning.as_deref(), Some("error"));
        assert!(reply
            .transitioning_message
            .as_deref()
            .unwrap()
            .contains("no image"));
    }

    #[tokio::test]
    async fn unknown_events_get_error_replies() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _engine) = dispatcher(4, &dir);
        let mut event = activate_event("42", "i-1");
        event.name = "compute.instance.migrate".into();
        let DispatchOutcome::Accepted(handle) = dispatcher.dispatch(event) else {
            panic!("event should have been accepted");
        };
        let reply = handle.await.unwrap();
        assert_eq!(reply.transitioning.as_deref(), Some("error"));
    }
}
