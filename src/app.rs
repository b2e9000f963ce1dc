use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;

/// The application object for when the controller is running.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = new_client(&config).await?;

        let controller = Controller::new(client, config, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("balancer controller is shutting down");
        let res = self.controller.await.context("error joining k8s controller handle").and_then(|res| res);
        if let Err(err) = &res {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("balancer controller shutdown complete");
        res
    }
}

/// Build a K8s client from the configured kubeconfig & master URL, falling back to the
/// in-cluster or default kubeconfig environment.
async fn new_client(config: &Config) -> Result<Client> {
    let mut kube_config = match config.opts.kubeconfig.as_ref() {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).with_context(|| format!("error reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("error loading kubeconfig")?
        }
        None => kube::Config::infer().await.context("error inferring K8s client config")?,
    };
    if let Some(master) = config.opts.master.as_deref() {
        kube_config.cluster_url = master.parse::<http::Uri>().with_context(|| format!("invalid master URL {:?}", master))?;
    }
    Client::try_from(kube_config).context("error initializing K8s client")
}
