//! The Balancer controller.
//!
//! Balances a total number of replicas across a set of scalable targets, driven by `Balancer`
//! custom resources.

mod app;
mod balancer;
mod config;
mod crd;
mod events;
#[cfg(test)]
mod fixtures;
mod k8s;
mod queue;
#[cfg(test)]
mod queue_test;
mod selector;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use crate::crd::Balancer;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);
    if cfg.opts.print_crd {
        let crd = serde_yaml::to_string(&Balancer::crd()).context("error serializing Balancer CRD")?;
        print!("{}", crd);
        return Ok(());
    }

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var, falling back to the CLI verbosity.
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_directive())))
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
                .compact(),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    tracing::info!(
        concurrency = cfg.opts.concurrency,
        reprocess_period_sec = cfg.opts.reprocess_period_sec,
        namespace = ?cfg.env.watch_namespace,
        "starting balancer controller",
    );
    let res = match App::new(cfg).await?.spawn().await {
        Ok(res) => res,
        Err(err) => Err(err).context("error joining app task"),
    };
    if let Err(err) = &res {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}
