//! Test fixtures shared across modules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec, ScaleStatus};
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use maplit::btreemap;

use crate::balancer::scale::{ScaleClient, ScaleMapping};
use crate::balancer::PodLister;
use crate::crd::{Balancer, BalancerPolicy, BalancerSpec, BalancerTarget, Fallback, PriorityPolicy, ProportionalPolicy, ScaleTargetRef};
use crate::crd::{POLICY_PRIORITY, POLICY_PROPORTIONAL};
use crate::events::EventPublisher;
use crate::k8s::{BalancerLister, StatusWriter};
use crate::selector::Selector;

pub const NAMESPACE: &str = "default";
pub const BALANCER_NAME: &str = "web";

/// A target backed by a Deployment named `{name}-deploy`.
pub fn target(name: &str, min: Option<i32>, max: Option<i32>) -> BalancerTarget {
    BalancerTarget {
        name: name.into(),
        scale_target_ref: ScaleTargetRef {
            kind: "Deployment".into(),
            name: format!("{}-deploy", name),
            api_version: "apps/v1".into(),
        },
        min_replicas: min,
        max_replicas: max,
    }
}

pub fn priority_policy(order: &[&str]) -> BalancerPolicy {
    BalancerPolicy {
        policy_name: POLICY_PRIORITY.into(),
        priorities: Some(PriorityPolicy {
            target_order: Some(order.iter().map(|name| name.to_string()).collect()),
        }),
        ..Default::default()
    }
}

pub fn proportional_policy(proportions: &[(&str, i32)]) -> BalancerPolicy {
    BalancerPolicy {
        policy_name: POLICY_PROPORTIONAL.into(),
        proportions: Some(ProportionalPolicy {
            target_proportions: Some(proportions.iter().map(|(name, weight)| (name.to_string(), *weight)).collect()),
        }),
        ..Default::default()
    }
}

pub fn with_fallback(mut policy: BalancerPolicy, startup_timeout_seconds: i32) -> BalancerPolicy {
    policy.fallback = Some(Fallback { startup_timeout_seconds });
    policy
}

/// A Balancer in the default namespace selecting pods labelled `app=web`.
pub fn balancer(replicas: i32, targets: Vec<BalancerTarget>, policy: BalancerPolicy) -> Balancer {
    let mut balancer = Balancer::new(
        BALANCER_NAME,
        BalancerSpec {
            targets,
            replicas,
            selector: LabelSelector {
                match_labels: Some(btreemap! {"app".into() => "web".into()}),
                ..Default::default()
            },
            policy,
        },
    );
    balancer.metadata.namespace = Some(NAMESPACE.into());
    balancer
}

//////////////////////////////////////////////////////////////////////////////
// Fakes /////////////////////////////////////////////////////////////////////

/// The fixed instant used as "now" by tests.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()
}

/// The `Scale` of a target Deployment, publishing the selector `app=web,target={name}`.
pub fn deployment_scale(name: &str, replicas: i32) -> Scale {
    Scale {
        metadata: ObjectMeta {
            name: Some(format!("{}-deploy", name)),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        spec: Some(ScaleSpec { replicas: Some(replicas) }),
        status: Some(ScaleStatus {
            replicas,
            selector: Some(format!("app=web,target={}", name)),
        }),
    }
}

/// A pod of the given target, created `age_secs` before `now()`.
pub fn pod(target: &str, phase: &str, age_secs: i64) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(NAMESPACE.into()),
            labels: Some(btreemap! {"app".into() => "web".into(), "target".into() => target.into()}),
            creation_timestamp: Some(Time(now() - chrono::Duration::seconds(age_secs))),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// An in-memory `ScaleClient`, keyed by target object name.
#[derive(Default)]
pub struct FakeScales {
    pub scales: Mutex<BTreeMap<String, Scale>>,
    /// Object names for which `get_scale` fails.
    pub failing: Mutex<BTreeSet<String>>,
    pub fail_updates: AtomicBool,
    /// Every successful write, as `(object name, replicas)`.
    pub updates: Mutex<Vec<(String, i32)>>,
}

impl FakeScales {
    pub fn with(scales: Vec<Scale>) -> Self {
        let scales = scales
            .into_iter()
            .map(|scale| (scale.metadata.name.clone().unwrap_or_default(), scale))
            .collect();
        Self {
            scales: Mutex::new(scales),
            ..Default::default()
        }
    }

    pub fn updates(&self) -> Vec<(String, i32)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScaleClient for FakeScales {
    async fn get_scale(&self, _namespace: &str, target: &ScaleTargetRef) -> Result<(Scale, ScaleMapping)> {
        if self.failing.lock().unwrap().contains(&target.name) {
            bail!("deployments.apps {:?} not found", target.name);
        }
        let scale = self
            .scales
            .lock()
            .unwrap()
            .get(&target.name)
            .cloned()
            .ok_or_else(|| anyhow!("deployments.apps {:?} not found", target.name))?;
        let mapping = ScaleMapping::new(ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        });
        Ok((scale, mapping))
    }

    async fn update_scale(&self, _namespace: &str, scale: &Scale, _mapping: &ScaleMapping) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("the object has been modified; please apply your changes to the latest version");
        }
        let name = scale.metadata.name.clone().unwrap_or_default();
        let replicas = scale.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        self.updates.lock().unwrap().push((name.clone(), replicas));
        self.scales.lock().unwrap().insert(name, scale.clone());
        Ok(())
    }
}

/// An in-memory `PodLister` which filters its pods by the given selector.
#[derive(Default)]
pub struct FakePods {
    pub pods: Mutex<Vec<Pod>>,
    pub fail: AtomicBool,
}

impl FakePods {
    pub fn with(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PodLister for FakePods {
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("pods is forbidden: User cannot list resource \"pods\" in namespace {:?}", namespace);
        }
        let empty = BTreeMap::new();
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| selector.matches(pod.metadata.labels.as_ref().unwrap_or(&empty)))
            .cloned()
            .collect())
    }
}

/// An in-memory `BalancerLister`.
#[derive(Default)]
pub struct FakeLister {
    pub balancers: Mutex<BTreeMap<String, Balancer>>,
    pub fail: AtomicBool,
}

impl FakeLister {
    pub fn with(balancers: Vec<Balancer>) -> Self {
        let lister = Self::default();
        for balancer in balancers {
            lister.put(balancer);
        }
        lister
    }

    pub fn put(&self, balancer: Balancer) {
        self.balancers.lock().unwrap().insert(balancer.key(), balancer);
    }
}

impl BalancerLister for FakeLister {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Balancer>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("cache unavailable");
        }
        Ok(self.balancers.lock().unwrap().get(&format!("{}/{}", namespace, name)).cloned())
    }
}

/// A `StatusWriter` recording every written Balancer.
#[derive(Default)]
pub struct FakeStatusWriter {
    pub written: Mutex<Vec<Balancer>>,
    pub fail: AtomicBool,
}

impl FakeStatusWriter {
    pub fn written(&self) -> Vec<Balancer> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusWriter for FakeStatusWriter {
    async fn replace_status(&self, balancer: &Balancer) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("Operation cannot be fulfilled on balancers.balancer.x-k8s.io {:?}", balancer.name());
        }
        self.written.lock().unwrap().push(balancer.clone());
        Ok(())
    }
}

/// A published event.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// An `EventPublisher` recording every published event.
#[derive(Default)]
pub struct FakeEvents {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: Option<String>) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: reference.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.into(),
            note,
        });
    }
}
