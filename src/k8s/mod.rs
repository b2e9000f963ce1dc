//! Kubernetes controller.
//!
//! This controller watches Balancers, caches them, and feeds their keys through a work queue to
//! a pool of workers. Workers only start once the initial listing of Balancers has been cached.
//! Every key is reprocessed periodically through the queue's rate limiter.

mod data;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Error as WatcherError, Event};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::balancer::scale::KubeScaleClient;
use crate::balancer::{Core, PodLister};
use crate::config::Config;
use crate::crd::Balancer;
use crate::events::KubeEventPublisher;
use crate::k8s::worker::Worker;
use crate::queue::{FixedIntervalRateLimiter, WorkQueue};
use crate::selector::Selector;

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Read access to known Balancers.
pub trait BalancerLister: Send + Sync {
    /// Get a copy of the Balancer with the given namespace & name, if it exists.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Balancer>>;
}

/// Write access to Balancer status.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Replace the status of the given Balancer with its `status` field.
    async fn replace_status(&self, balancer: &Balancer) -> Result<()>;
}

/// An in-memory cache of Balancers, keyed by `namespace/name`.
#[derive(Default)]
pub struct BalancerCache {
    balancers: DashMap<String, Balancer>,
}

impl BalancerLister for BalancerCache {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Balancer>> {
        let key = format!("{}/{}", namespace, name);
        Ok(self.balancers.get(&key).map(|entry| entry.value().clone()))
    }
}

/// A `PodLister` backed by the K8s API.
pub struct KubePodLister {
    client: Client,
}

impl KubePodLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let pods = api
            .list(&params)
            .await
            .with_context(|| format!("error listing pods in namespace {} matching {:?}", namespace, selector.to_string()))?;
        Ok(pods.items)
    }
}

/// A `StatusWriter` backed by the K8s API.
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn replace_status(&self, balancer: &Balancer) -> Result<()> {
        let api: Api<Balancer> = Api::namespaced(self.client.clone(), balancer.namespace());
        let data = serde_json::to_vec(balancer).context("error serializing balancer")?;
        api.replace_status(balancer.name(), &PostParams::default(), data)
            .await
            .with_context(|| format!("error updating status of balancer {}", balancer.key()))?;
        Ok(())
    }
}

/// Kubernetes controller for watching Balancer CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// All known Balancers.
    cache: Arc<BalancerCache>,
    /// The queue of Balancer keys awaiting processing.
    queue: Arc<WorkQueue<String>>,
    /// Set once the initial listing of Balancers has been cached.
    synced: bool,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let limiter = FixedIntervalRateLimiter::new(config.reprocess_period());
        Self {
            client,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            cache: Default::default(),
            queue: Arc::new(WorkQueue::new(Box::new(limiter))),
            synced: false,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let balancers: Api<Balancer> = match self.config.env.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let balancers_watcher = watcher(balancers, WatcherConfig::default());
        tokio::pin!(balancers_watcher);

        tracing::info!(namespace = ?self.config.env.watch_namespace, "k8s controller initialized");
        let mut workers: Vec<JoinHandle<()>> = vec![];
        let mut res = Ok(());
        loop {
            tokio::select! {
                k8s_event_res = balancers_watcher.next() => match k8s_event_res {
                    Some(k8s_event_res) => self.handle_balancer_event(k8s_event_res).await,
                    None if !self.synced => {
                        res = Err(anyhow::anyhow!("balancer watcher closed before the cache was synced"));
                        break;
                    }
                    None => {
                        tracing::error!("balancer watcher closed unexpectedly");
                        break;
                    }
                },
                _ = self.shutdown_rx.next() => {
                    if !self.synced {
                        res = Err(anyhow::anyhow!("shutdown requested before the balancer cache was synced"));
                    }
                    break;
                }
            }
            if self.synced && workers.is_empty() {
                workers = self.spawn_workers();
            }
        }

        // Begin shutdown routine.
        let _ = self.shutdown_tx.send(());
        self.queue.shutdown().await;
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = ?err, "error joining balancer worker");
            }
        }
        tracing::debug!("k8s controller shutdown complete");
        res
    }

    /// Spawn the configured number of workers.
    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let core = Arc::new(Core::new(
            Arc::new(KubeScaleClient::new(self.client.clone())),
            Arc::new(KubePodLister::new(self.client.clone())),
        ));
        let status = Arc::new(KubeStatusWriter::new(self.client.clone()));
        let events = Arc::new(KubeEventPublisher::new(self.client.clone(), self.config.env.pod_name.clone()));
        tracing::info!(workers = self.config.opts.concurrency, "balancer cache synced, starting workers");
        (0..self.config.opts.concurrency)
            .map(|id| {
                Worker::new(
                    id,
                    self.queue.clone(),
                    self.cache.clone(),
                    core.clone(),
                    status.clone(),
                    events.clone(),
                )
                .spawn()
            })
            .collect()
    }
}
