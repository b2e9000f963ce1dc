//! Balancer CRD.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#scale-subresource

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The name of the priority policy.
pub const POLICY_PRIORITY: &str = "priority";
/// The name of the proportional policy.
pub const POLICY_PROPORTIONAL: &str = "proportional";

/// CRD spec for the Balancer resource.
///
/// A Balancer distributes `replicas` over a set of scalable targets according to its policy,
/// and writes the result into each target's `Scale` subresource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    group = "balancer.x-k8s.io",
    version = "v1alpha1",
    kind = "Balancer",
    namespaced,
    status = "BalancerStatus",
    derive = "PartialEq",
    shortname = "balancer",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.policy.policyName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BalancerSpec {
    /// The targets across which replicas are balanced.
    ///
    /// At least two targets are expected, and names must be unique.
    pub targets: Vec<BalancerTarget>,
    /// The desired total number of replicas across all targets.
    pub replicas: i32,
    /// A selector matching all pods which count towards this Balancer.
    ///
    /// Every pod selected by a target's own selector must also match this selector.
    pub selector: LabelSelector,
    /// The policy used to place replicas on targets.
    pub policy: BalancerPolicy,
}

/// A named reference to a scalable resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalancerTarget {
    /// The name of this target, unique within its Balancer.
    pub name: String,
    /// A reference to the resource exposing a `Scale` subresource.
    pub scale_target_ref: ScaleTargetRef,
    /// The minimum number of replicas for this target. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// The maximum number of replicas for this target. Defaults to unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

/// A cross-version reference to a scalable object in the Balancer's namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// The kind of the referent, e.g. `Deployment`.
    pub kind: String,
    /// The name of the referent.
    pub name: String,
    /// The API version of the referent, e.g. `apps/v1`.
    #[serde(default)]
    pub api_version: String,
}

impl std::fmt::Display for ScaleTargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.api_version)
    }
}

/// The placement policy of a Balancer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalancerPolicy {
    /// The name of the policy, either `priority` or `proportional`.
    pub policy_name: String,
    /// Details of the priority policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<PriorityPolicy>,
    /// Details of the proportional policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proportions: Option<ProportionalPolicy>,
    /// Optional fallback applied when replicas fail to start in time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Fallback>,
}

/// Replicas are placed on targets in the given order, filling each up to its max.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PriorityPolicy {
    /// Target names, most preferred first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_order: Option<Vec<String>>,
}

/// Replicas are placed on targets in proportion to the given weights.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProportionalPolicy {
    /// Weight per target name. Targets absent from the map have weight 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_proportions: Option<BTreeMap<String, i32>>,
}

/// Fallback configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Fallback {
    /// Pods pending for longer than this are considered stuck, and their replicas are
    /// duplicated onto other targets.
    pub startup_timeout_seconds: i32,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStatus {
    /// The number of running or pending pods observed across all targets.
    #[serde(default)]
    pub replicas: i32,
    /// The string form of `spec.selector`, for the scale subresource.
    #[serde(default)]
    pub selector: String,
    /// Conditions of this Balancer; only `Balancing` is maintained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Balancer {
    /// The namespace of this object.
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// The name of this object.
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// The work queue key of this object, formatted as `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }
}
