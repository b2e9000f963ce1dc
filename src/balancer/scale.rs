//! Uniform access to the `Scale` subresource of arbitrary scalable kinds.
//!
//! A target names its scalable object by kind and API version. The kube implementation resolves
//! that pair into concrete API resources across every version of the group through discovery,
//! caches the result, and tries each candidate in turn until one serves the `Scale` subresource.

use std::future::Future;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::{self, ApiResource};
use kube::Client;

use crate::crd::ScaleTargetRef;

/// The group and resource a `Scale` was read from, so that a write goes back to the same place.
#[derive(Clone, Debug)]
pub struct ScaleMapping {
    resource: ApiResource,
}

impl ScaleMapping {
    pub fn new(resource: ApiResource) -> Self {
        Self { resource }
    }
}

impl std::fmt::Display for ScaleMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.resource.group.is_empty() {
            write!(f, "{}", self.resource.plural)
        } else {
            write!(f, "{}.{}", self.resource.plural, self.resource.group)
        }
    }
}

/// Read & write access to `Scale` subresources.
#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// Fetch the `Scale` of the referenced object, along with the mapping it was read from.
    async fn get_scale(&self, namespace: &str, target: &ScaleTargetRef) -> Result<(Scale, ScaleMapping)>;

    /// Write the given `Scale` back through the given mapping.
    async fn update_scale(&self, namespace: &str, scale: &Scale, mapping: &ScaleMapping) -> Result<()>;
}

/// A `ScaleClient` backed by the K8s API, using discovery to map kinds to resources.
pub struct KubeScaleClient {
    client: Client,
    /// Discovered resources keyed by `(apiVersion, kind)`.
    mappings: DashMap<(String, String), Vec<ApiResource>>,
}

impl KubeScaleClient {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            mappings: Default::default(),
        }
    }

    /// Resolve the candidate resources for the given kind, consulting the cache first.
    ///
    /// Every version the group serves is considered, the requested version first.
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Vec<ApiResource>> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(cached) = self.mappings.get(&key) {
            return Ok(cached.clone());
        }

        let (group, version) = split_api_version(api_version);
        let discovered = discovery::group(&self.client, group)
            .await
            .with_context(|| format!("error discovering resources of API group {:?}", group))?;
        let served = discovered
            .versions()
            .map(|ver| {
                let resources = discovered.versioned_resources(ver).into_iter().map(|(res, _)| res).collect();
                (ver.to_string(), resources)
            })
            .collect();

        let candidates = candidate_mappings(kind, version, served);
        if candidates.is_empty() {
            bail!("unrecognized resource: no mapping found for kind {} in {:?}", kind, api_version);
        }
        self.mappings.insert(key, candidates.clone());
        Ok(candidates)
    }
}

#[async_trait]
impl ScaleClient for KubeScaleClient {
    #[tracing::instrument(level = "debug", skip(self, target), fields(kind = %target.kind, name = %target.name))]
    async fn get_scale(&self, namespace: &str, target: &ScaleTargetRef) -> Result<(Scale, ScaleMapping)> {
        let candidates = self
            .resolve(&target.api_version, &target.kind)
            .await
            .with_context(|| format!("error resolving {} {}/{}", target.kind, namespace, target.name))?;

        let (client, name) = (&self.client, target.name.as_str());
        let (scale, resource) = first_success(candidates, |resource| {
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, resource);
            let name = name.to_string();
            async move { api.get_scale(&name).await.map_err(anyhow::Error::from) }
        })
        .await
        .with_context(|| format!("error fetching scale of {} {}/{}", target.kind, namespace, target.name))?;
        Ok((scale, ScaleMapping::new(resource)))
    }

    #[tracing::instrument(level = "debug", skip(self, scale, mapping), fields(mapping = %mapping))]
    async fn update_scale(&self, namespace: &str, scale: &Scale, mapping: &ScaleMapping) -> Result<()> {
        let name = scale_name(scale)?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &mapping.resource);
        let data = serde_json::to_vec(scale).context("error serializing scale")?;
        api.replace_scale(name, &PostParams::default(), data)
            .await
            .with_context(|| format!("error updating scale of {} {}/{}", mapping, namespace, name))?;
        Ok(())
    }
}

/// Split an `apiVersion` into its group & version. The core group is the empty string, and an
/// empty `apiVersion` names the core group without a preferred version.
pub(crate) fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Order the resources of the given kind across the served versions of a group, the resources of
/// `requested_version` first and the rest in discovery order.
pub(crate) fn candidate_mappings(kind: &str, requested_version: &str, served: Vec<(String, Vec<ApiResource>)>) -> Vec<ApiResource> {
    let (mut ordered, rest): (Vec<_>, Vec<_>) = served.into_iter().partition(|(version, _)| version == requested_version);
    ordered.extend(rest);
    ordered
        .into_iter()
        .flat_map(|(_, resources)| resources)
        .filter(|res| res.kind == kind)
        .collect()
}

/// Try each candidate in order, returning the first success along with the candidate it came
/// from. If every candidate fails, the first error is returned.
pub(crate) async fn first_success<T, F, Fut>(candidates: Vec<ApiResource>, mut fetch: F) -> Result<(T, ApiResource)>
where
    F: FnMut(&ApiResource) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut first_err = None;
    for resource in candidates {
        match fetch(&resource).await {
            Ok(val) => return Ok((val, resource)),
            Err(err) => {
                tracing::debug!(error = ?err, resource = %resource.plural, "error fetching from candidate mapping");
                first_err.get_or_insert(err);
            }
        }
    }
    Err(first_err.unwrap_or_else(|| anyhow!("unrecognized resource: no candidate mappings")))
}

/// The name of the object the given `Scale` belongs to.
pub(crate) fn scale_name(scale: &Scale) -> Result<&str> {
    scale
        .metadata
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("scale has no name"))
}
