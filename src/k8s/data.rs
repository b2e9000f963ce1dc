use std::collections::HashSet;
use std::time::Duration;

use kube::runtime::watcher::Event;

use crate::crd::Balancer;
use crate::k8s::{Controller, EventResult};

//////////////////////////////////////////////////////////////////////////////
// Balancer Events ///////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Balancer` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_balancer_event(&mut self, res: EventResult<Balancer>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Balancer k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.balancer_applied(obj).await,
            Event::Deleted(obj) => self.balancer_deleted(obj).await,
            Event::Restarted(objs) => self.balancer_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, balancer), fields(balancer = %balancer.key()))]
    async fn balancer_applied(&mut self, balancer: Balancer) {
        if balancer.metadata.name.is_none() {
            return; // Not actually possible as K8s requires name.
        }
        let key = balancer.key();
        if let Some(old) = self.cache.balancers.get(&key) {
            if old.value() == &balancer {
                return;
            }
        }
        self.cache.balancers.insert(key.clone(), balancer);
        self.queue.add(key).await;
    }

    #[tracing::instrument(level = "debug", skip(self, balancer), fields(balancer = %balancer.key()))]
    async fn balancer_deleted(&mut self, balancer: Balancer) {
        let key = balancer.key();
        self.cache.balancers.remove(&key);
        self.queue.forget(&key).await;
    }

    #[tracing::instrument(level = "debug", skip(self, balancers))]
    async fn balancer_restarted(&mut self, balancers: Vec<Balancer>) {
        // Forget anything deleted while the watch was down.
        let live: HashSet<String> = balancers.iter().map(|balancer| balancer.key()).collect();
        let stale: Vec<String> = self
            .cache
            .balancers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !live.contains(key))
            .collect();
        for key in stale {
            self.cache.balancers.remove(&key);
            self.queue.forget(&key).await;
        }

        for balancer in balancers {
            self.balancer_applied(balancer).await;
        }
        if !self.synced {
            tracing::debug!(count = live.len(), "initial balancer listing cached");
            self.synced = true;
        }
    }
}
