//! K8s events emitted on Balancers.
//!
//! Publication is fire-and-forget: failures are logged and never propagated.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

/// The reporting component of emitted events.
pub const CONTROLLER_NAME: &str = "balancer-controller";

/// The action recorded on all events.
pub const ACTION_RECONCILE: &str = "Reconcile";
/// Reconciliation of a Balancer failed.
pub const REASON_UNABLE_TO_BALANCE: &str = "UnableToBalance";
/// Writing a Balancer's status failed.
pub const REASON_STATUS_NOT_UPDATED: &str = "StatusNotUpdated";

/// Publisher of K8s events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the referenced object.
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: Option<String>);
}

/// An `EventPublisher` backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Create a new instance, reporting as the given controller instance.
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: CONTROLLER_NAME.into(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: Option<String>) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.into(),
            note,
            action: ACTION_RECONCILE.into(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            tracing::warn!(error = ?err, reason, object = ?reference.name, "error publishing k8s event");
        }
    }
}
