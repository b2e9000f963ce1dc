//! Balancer workers.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::events::EventType;
use kube::Resource;
use tokio::task::JoinHandle;

use crate::balancer::condition::set_balancing_condition;
use crate::balancer::Core;
use crate::events::{EventPublisher, REASON_STATUS_NOT_UPDATED, REASON_UNABLE_TO_BALANCE};
use crate::k8s::{BalancerLister, StatusWriter};
use crate::queue::WorkQueue;
use crate::selector::Selector;

/// A worker processing Balancer keys from the shared queue.
pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue<String>>,
    lister: Arc<dyn BalancerLister>,
    core: Arc<Core>,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventPublisher>,
}

impl Worker {
    /// Create a new instance.
    pub fn new(
        id: usize, queue: Arc<WorkQueue<String>>, lister: Arc<dyn BalancerLister>, core: Arc<Core>, status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            id,
            queue,
            lister,
            core,
            status,
            events,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(worker = self.id, "balancer worker started");
        while let Some(key) = self.queue.get().await {
            self.process_key(&key).await;
            self.queue.done(&key).await;
        }
        tracing::debug!(worker = self.id, "balancer worker stopped");
    }

    /// Process the Balancer with the given `namespace/name` key.
    ///
    /// Reconciles the Balancer, records the outcome in its status & events, and schedules the
    /// key for its next periodic pass.
    #[tracing::instrument(level = "debug", skip(self), fields(worker = self.id))]
    pub async fn process_key(&self, key: &str) {
        let (namespace, name) = match key.split_once('/') {
            Some(parts) => parts,
            None => {
                tracing::error!("invalid balancer key, dropping");
                self.queue.forget(&key.to_string()).await;
                return;
            }
        };
        // The lister hands out an owned copy, so the cached object is never mutated.
        let mut balancer = match self.lister.get(namespace, name) {
            Ok(Some(balancer)) => balancer,
            Ok(None) => {
                tracing::debug!("balancer no longer exists");
                self.queue.forget(&key.to_string()).await;
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, requeues = self.queue.num_requeues(&key.to_string()), "error fetching balancer");
                self.queue.add_rate_limited(key.to_string()).await;
                return;
            }
        };

        let now = Utc::now();
        let outcome = self.core.process_balancer(&balancer, now).await;

        let mut status = balancer.status.clone().unwrap_or_default();
        if let Some(info) = outcome.status {
            status.replicas = info.observed_replicas;
        }
        if let Ok(selector) = Selector::from_label_selector(&balancer.spec.selector) {
            status.selector = selector.to_string();
        }
        set_balancing_condition(&mut status.conditions, outcome.result.as_ref().err(), now);

        let reference = balancer.object_ref(&());
        if let Err(err) = &outcome.result {
            tracing::error!(error = %err, phase = %err.phase, "error balancing replicas");
            self.events
                .publish(&reference, EventType::Warning, REASON_UNABLE_TO_BALANCE, Some(err.to_string()))
                .await;
        }

        if balancer.status.as_ref() != Some(&status) {
            balancer.status = Some(status);
            if let Err(err) = self.status.replace_status(&balancer).await {
                tracing::warn!(error = ?err, "error updating balancer status");
                self.events
                    .publish(&reference, EventType::Warning, REASON_STATUS_NOT_UPDATED, Some(format!("{:#}", err)))
                    .await;
            }
        }

        self.queue.add_rate_limited(key.to_string()).await;
    }
}
