//! Balancer reconciliation.
//!
//! A single pass over one Balancer reads the `Scale` of every target, samples the pods behind
//! each target, computes a placement and writes back any replica counts which differ. Each step
//! is a named phase; the first failing phase aborts the pass and tags the error it returns.

pub mod condition;
pub mod placement;
pub mod pods;
pub mod scale;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::balancer::placement::get_placement;
use crate::balancer::pods::{summarize, Summary};
use crate::balancer::scale::{ScaleClient, ScaleMapping};
use crate::crd::Balancer;
use crate::selector::Selector;

/// The step of the reconciliation pipeline in which an error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    ScaleSubresourcePolling,
    PodLabelsChecking,
    PodListing,
    ApplyingBalancerPolicy,
    ReplicaCountSetting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ScaleSubresourcePolling => "ScaleSubresourcePolling",
            Self::PodLabelsChecking => "PodLabelsChecking",
            Self::PodListing => "PodListing",
            Self::ApplyingBalancerPolicy => "ApplyingBalancerPolicy",
            Self::ReplicaCountSetting => "ReplicaCountSetting",
        })
    }
}

/// A reconciliation error, tagged with the phase which produced it.
#[derive(Debug, Error)]
#[error("{cause:#}")]
pub struct PhasedError {
    pub phase: Phase,
    cause: anyhow::Error,
}

impl PhasedError {
    pub fn new(phase: Phase, cause: impl Into<anyhow::Error>) -> Self {
        Self { phase, cause: cause.into() }
    }
}

/// Observations gathered during a reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusInfo {
    /// Running and pending pods across all targets.
    pub observed_replicas: i32,
    /// Whether any target's `Scale` was written.
    pub any_updated: bool,
}

/// The result of processing one Balancer.
///
/// `status` is present once pods have been summarized, even if a later phase failed.
#[derive(Debug)]
pub struct Outcome {
    pub status: Option<StatusInfo>,
    pub result: Result<(), PhasedError>,
}

impl Outcome {
    fn failed(status: Option<StatusInfo>, error: PhasedError) -> Self {
        Self { status, result: Err(error) }
    }
}

/// A source of pod observations.
#[async_trait]
pub trait PodLister: Send + Sync {
    /// List the pods of the given namespace matching the given selector.
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>>;
}

/// The reconciliation core, shared by all workers.
pub struct Core {
    scales: Arc<dyn ScaleClient>,
    pods: Arc<dyn PodLister>,
}

impl Core {
    /// Create a new instance.
    pub fn new(scales: Arc<dyn ScaleClient>, pods: Arc<dyn PodLister>) -> Self {
        Self { scales, pods }
    }

    /// Reconcile the given Balancer, writing any changed replica counts to target scales.
    #[tracing::instrument(level = "debug", skip(self, balancer, now), fields(balancer = %balancer.key()))]
    pub async fn process_balancer(&self, balancer: &Balancer, now: DateTime<Utc>) -> Outcome {
        let namespace = balancer.namespace();
        let spec = &balancer.spec;

        // Poll the scale subresource of every target.
        let mut scales: BTreeMap<&str, (Scale, ScaleMapping)> = BTreeMap::new();
        for target in spec.targets.iter() {
            match self.scales.get_scale(namespace, &target.scale_target_ref).await {
                Ok(found) => {
                    scales.insert(target.name.as_str(), found);
                }
                Err(err) => return Outcome::failed(None, PhasedError::new(Phase::ScaleSubresourcePolling, err)),
            }
        }

        let selector = match Selector::from_label_selector(&spec.selector) {
            Ok(selector) => selector,
            Err(err) => return Outcome::failed(None, PhasedError::new(Phase::PodLabelsChecking, anyhow!("incorrect selector: {}", err))),
        };

        // List the pods of each target through the target's own selector.
        let mut pods_by_target: BTreeMap<&str, Vec<Pod>> = BTreeMap::new();
        for (name, (scale, _)) in scales.iter() {
            let raw = scale.status.as_ref().and_then(|status| status.selector.as_deref()).unwrap_or_default();
            let target_selector = match Selector::parse(raw) {
                Ok(target_selector) => target_selector,
                Err(err) => {
                    let err = anyhow!("incorrect selector in scale status of target {}: {}", name, err);
                    return Outcome::failed(None, PhasedError::new(Phase::PodListing, err));
                }
            };
            match self.pods.list_pods(namespace, &target_selector).await {
                Ok(pods) => {
                    pods_by_target.insert(*name, pods);
                }
                Err(err) => {
                    let err = err.context(format!("error listing pods of target {}", name));
                    return Outcome::failed(None, PhasedError::new(Phase::PodListing, err));
                }
            }
        }

        // Every pod of a target must also belong to the Balancer.
        for (name, pods) in pods_by_target.iter() {
            let mislabeled = pods.iter().any(|pod| !selector.matches(pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())));
            if mislabeled {
                let err = anyhow!("incorrect labeling for pods in target {}", name);
                return Outcome::failed(None, PhasedError::new(Phase::PodLabelsChecking, err));
            }
        }

        let deadline = spec
            .policy
            .fallback
            .as_ref()
            .map(|fallback| Duration::seconds(fallback.startup_timeout_seconds as i64));
        let mut status = StatusInfo::default();
        let mut summaries: BTreeMap<String, Summary> = BTreeMap::new();
        for (name, pods) in pods_by_target.iter() {
            let summary = summarize(pods, now, deadline);
            status.observed_replicas += summary.total;
            summaries.insert(name.to_string(), summary);
        }

        let (placement, problems) = match get_placement(balancer, &summaries) {
            Ok(res) => res,
            Err(err) => return Outcome::failed(Some(status), PhasedError::new(Phase::ApplyingBalancerPolicy, err)),
        };
        if problems.missing_replicas > 0 || problems.overflow_replicas > 0 {
            tracing::info!(
                missing = problems.missing_replicas,
                overflow = problems.overflow_replicas,
                "placement could not honor the requested replicas exactly"
            );
        }

        // Write back every replica count which differs from the desired placement.
        for target in spec.targets.iter() {
            let desired = match placement.get(&target.name) {
                Some(desired) => *desired,
                None => {
                    let err = anyhow!("no placement computed for target {}", target.name);
                    return Outcome::failed(Some(status), PhasedError::new(Phase::ApplyingBalancerPolicy, err));
                }
            };
            let (scale, mapping) = match scales.get_mut(target.name.as_str()) {
                Some(found) => found,
                None => continue, // Every target's scale was polled above.
            };
            let current = scale.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
            if current == desired {
                continue;
            }
            scale.spec.get_or_insert_with(ScaleSpec::default).replicas = Some(desired);
            if let Err(err) = self.scales.update_scale(namespace, scale, mapping).await {
                return Outcome::failed(Some(status), PhasedError::new(Phase::ReplicaCountSetting, err));
            }
            tracing::info!(name = %target.name, from = current, to = desired, "updated target replicas");
            status.any_updated = true;
        }

        Outcome { status: Some(status), result: Ok(()) }
    }
}
