//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use structopt::StructOpt;

/// The Balancer controller.
#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "balancer-controller")]
pub struct Opts {
    /// The address of the K8s API server, overriding any value from the kubeconfig.
    #[structopt(long)]
    pub master: Option<String>,
    /// Path to a kubeconfig; only required when running outside of a cluster.
    #[structopt(long, parse(from_os_str))]
    pub kubeconfig: Option<PathBuf>,
    /// The interval in seconds at which every Balancer is reprocessed.
    #[structopt(long, default_value = "15")]
    pub reprocess_period_sec: u64,
    /// The number of Balancers processed concurrently.
    #[structopt(long, default_value = "3")]
    pub concurrency: usize,
    /// Increase logging verbosity; may be repeated. Overridden by `RUST_LOG`.
    #[structopt(short, parse(from_occurrences))]
    pub verbose: u8,
    /// Print the Balancer CRD as YAML and exit.
    #[structopt(long)]
    pub print_crd: bool,
}

/// Configuration read from the runtime environment.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EnvConfig {
    /// The name of the pod on which this instance is running, reported on events.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// The namespace to watch; all namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
}

/// Runtime configuration data.
#[derive(Clone, Debug)]
pub struct Config {
    pub opts: Opts,
    pub env: EnvConfig,
}

impl Config {
    /// Create a new config instance from the command line & the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let env = envy::from_env().context("error building config from env")?;
        Self::from_parts(Opts::from_args(), env)
    }

    /// Create a new config instance from the given parts, validating them.
    pub fn from_parts(opts: Opts, env: EnvConfig) -> Result<Self> {
        if opts.concurrency < 1 {
            bail!("--concurrency must be at least 1, got {}", opts.concurrency);
        }
        if opts.reprocess_period_sec < 1 {
            bail!("--reprocess-period-sec must be at least 1, got {}", opts.reprocess_period_sec);
        }
        Ok(Self { opts, env })
    }

    /// The interval at which every Balancer is reprocessed.
    pub fn reprocess_period(&self) -> Duration {
        Duration::from_secs(self.opts.reprocess_period_sec)
    }

    /// The default logging directive for the configured verbosity.
    pub fn log_directive(&self) -> &'static str {
        match self.opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
