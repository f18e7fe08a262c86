//! kube-rs backed [`ClusterApi`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope as KubeScope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};

use kubor_core::{Object, ObjectReference, ResourceIdentity};

use crate::{fill_type_meta, ClusterApi, ClusterError, ListOptions, Page, Scope, WatchEvent, WatchStream};

const FIELD_MANAGER: &str = "kubor";

pub struct KubeCluster {
    client: Client,
    discovery: Discovery,
}

impl KubeCluster {
    /// Connect with the ambient kubeconfig / in-cluster config and run discovery once.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let t0 = std::time::Instant::now();
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        info!(groups = discovery.groups().count(), took_ms = %t0.elapsed().as_millis(), "discovery done");
        Ok(Self { client, discovery })
    }

    fn resolve(&self, gvk: &ResourceIdentity) -> Result<(ApiResource, Scope), ClusterError> {
        let exact = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        if let Some((ar, caps)) = self.discovery.resolve_gvk(&exact) {
            return Ok((ar, scope_of(&caps.scope)));
        }
        // Manifests may spell kinds in another case than discovery does.
        for group in self.discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    if ResourceIdentity::new(&ar.group, &ar.version, &ar.kind) == *gvk {
                        return Ok((ar, scope_of(&caps.scope)));
                    }
                }
            }
        }
        Err(ClusterError::NotFound(format!("resource kind {gvk} is not served")))
    }

    fn api(&self, gvk: &ResourceIdentity, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, scope) = self.resolve(gvk)?;
        let api = match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    /// List across all namespaces when no namespace is given.
    fn list_api(&self, gvk: &ResourceIdentity, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, scope) = self.resolve(gvk)?;
        let api = match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}

fn scope_of(scope: &KubeScope) -> Scope {
    match scope {
        KubeScope::Namespaced => Scope::Namespaced,
        KubeScope::Cluster => Scope::Cluster,
    }
}

fn map_err(e: kube::Error, what: &str) -> ClusterError {
    counter!("cluster_errors", 1u64);
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(what.to_string()),
        kube::Error::Api(resp) => ClusterError::Remote { code: Some(resp.code), message: format!("{what}: {}", resp.message) },
        other => ClusterError::Remote { code: None, message: format!("{what}: {other}") },
    }
}

fn to_dynamic(object: &Object) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(object.body().clone()).map_err(|e| ClusterError::Encoding(format!("{}: {e}", object.reference())))
}

fn to_json(obj: &DynamicObject, ar: &ApiResource) -> Result<Json, ClusterError> {
    let mut v = serde_json::to_value(obj).map_err(|e| ClusterError::Encoding(e.to_string()))?;
    fill_type_meta(&mut v, &ResourceIdentity::new(&ar.group, &ar.version, &ar.kind));
    Ok(v)
}

fn to_object(obj: &DynamicObject, ar: &ApiResource) -> Result<Object, ClusterError> {
    Object::from_json(to_json(obj, ar)?).map_err(|e| ClusterError::Encoding(e.to_string()))
}

fn post_params(dry_run: bool) -> PostParams {
    PostParams { dry_run, field_manager: Some(FIELD_MANAGER.to_string()) }
}

fn list_params(options: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(sel) = &options.label_selector {
        lp = lp.labels(sel);
    }
    if let Some(limit) = options.limit {
        lp = lp.limit(limit);
    }
    if let Some(token) = &options.continue_token {
        lp = lp.continue_token(token);
    }
    lp
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn default_namespace(&self) -> String { self.client.default_namespace().to_string() }

    async fn scope(&self, gvk: &ResourceIdentity) -> Result<Scope, ClusterError> {
        self.resolve(gvk).map(|(_, scope)| scope)
    }

    async fn get(&self, reference: &ObjectReference) -> Result<Object, ClusterError> {
        let (api, ar) = self.api(&reference.gvk, reference.namespace.as_deref())?;
        let obj = api.get(&reference.name).await.map_err(|e| map_err(e, &reference.to_string()))?;
        to_object(&obj, &ar)
    }

    async fn create(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError> {
        let reference = object.reference();
        let (api, ar) = self.api(&reference.gvk, reference.namespace.as_deref())?;
        let created = api.create(&post_params(dry_run), &to_dynamic(object)?).await.map_err(|e| map_err(e, &reference.to_string()))?;
        to_object(&created, &ar)
    }

    async fn update(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError> {
        let reference = object.reference();
        let (api, ar) = self.api(&reference.gvk, reference.namespace.as_deref())?;
        let replaced = api
            .replace(&reference.name, &post_params(dry_run), &to_dynamic(object)?)
            .await
            .map_err(|e| map_err(e, &reference.to_string()))?;
        to_object(&replaced, &ar)
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), ClusterError> {
        let (api, _) = self.api(&reference.gvk, reference.namespace.as_deref())?;
        api.delete(&reference.name, &DeleteParams::foreground()).await.map_err(|e| map_err(e, &reference.to_string()))?;
        Ok(())
    }

    async fn list(&self, gvk: &ResourceIdentity, namespace: Option<&str>, options: &ListOptions) -> Result<Page<Json>, ClusterError> {
        let (api, ar) = self.list_api(gvk, namespace)?;
        let what = format!("{gvk} in {}", namespace.unwrap_or("(all)"));
        let list = api.list(&list_params(options)).await.map_err(|e| map_err(e, &what))?;
        let items = list.items.iter().map(|o| to_json(o, &ar)).collect::<Result<Vec<_>, _>>()?;
        debug!(gvk = %gvk, ns = ?namespace, count = items.len(), "listed");
        Ok(Page { items, continue_token: list.metadata.continue_.filter(|t| !t.is_empty()) })
    }

    async fn list_namespaces(&self, options: &ListOptions) -> Result<Page<String>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&list_params(options)).await.map_err(|e| map_err(e, "namespaces"))?;
        let items = list.items.into_iter().filter_map(|ns| ns.metadata.name).collect();
        Ok(Page { items, continue_token: list.metadata.continue_.filter(|t| !t.is_empty()) })
    }

    async fn watch(&self, reference: &ObjectReference) -> Result<WatchStream, ClusterError> {
        let (api, ar) = self.api(&reference.gvk, reference.namespace.as_deref())?;
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", reference.name));
        let target = reference.to_string();
        let stream = watcher::watcher(api, cfg)
            .map_err(move |e| ClusterError::Remote { code: None, message: format!("watch {target}: {e}") })
            .map_ok(move |ev| {
                let events: Vec<Result<WatchEvent, ClusterError>> = match ev {
                    Event::Applied(o) => vec![to_json(&o, &ar).map(WatchEvent::Applied)],
                    Event::Deleted(o) => vec![to_json(&o, &ar).map(WatchEvent::Deleted)],
                    Event::Restarted(list) => list.iter().map(|o| to_json(o, &ar).map(WatchEvent::Applied)).collect(),
                };
                futures::stream::iter(events)
            })
            .try_flatten()
            .boxed();
        Ok(stream)
    }
}
