//! Kubor kubehub: the cluster access seam used by the apply and cleanup engines.
//!
//! [`ClusterApi`] is generic CRUD + list + watch over untyped documents keyed by
//! resource identity, namespace and name. [`KubeCluster`] talks to a real API
//! server through kube-rs; [`mock::MockCluster`] keeps everything in memory.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::debug;

use kubor_core::{Object, ObjectReference, Project, ResourceIdentity};

mod kube_cluster;
pub mod mock;

pub use kube_cluster::KubeCluster;

/// Whether a kind lives inside namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote: {message}")]
    Remote { code: Option<u16>, message: String },
    #[error("encoding: {0}")]
    Encoding(String),
}

impl ClusterError {
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Self::Remote { code: Some(code), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Remote { code, .. } => *code,
            Self::Encoding(_) => None,
        }
    }

    /// The server refused a dry-run request (rather than the object itself).
    pub fn rejects_dry_run(&self) -> bool {
        match self {
            Self::Remote { code: Some(400 | 405 | 501), message } => message.to_ascii_lowercase().contains("dry"),
            _ => false,
        }
    }
}

/// Parameters of one list page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub continue_token: Option<String>,
    pub limit: Option<u32>,
}

impl ListOptions {
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn continue_from(mut self, token: Option<String>) -> Self {
        self.continue_token = token;
        self
    }
}

/// One page of a list call. `continue_token` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(Json),
    Deleted(Json),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace the server gives namespaced objects that name none.
    fn default_namespace(&self) -> String;

    async fn scope(&self, gvk: &ResourceIdentity) -> Result<Scope, ClusterError>;

    async fn get(&self, reference: &ObjectReference) -> Result<Object, ClusterError>;

    async fn create(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError>;

    /// Full replacement of the stored object.
    async fn update(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError>;

    /// Delete with foreground cascading.
    async fn delete(&self, reference: &ObjectReference) -> Result<(), ClusterError>;

    /// One page of raw items; items may be malformed and are decoded by the caller.
    async fn list(
        &self,
        gvk: &ResourceIdentity,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<Page<Json>, ClusterError>;

    async fn list_namespaces(&self, options: &ListOptions) -> Result<Page<String>, ClusterError>;

    /// Events for exactly one object. Dropping the stream releases the watch.
    async fn watch(&self, reference: &ObjectReference) -> Result<WatchStream, ClusterError>;
}

/// The project's default namespace, else the cluster's.
pub fn effective_namespace(project: &Project, cluster: &dyn ClusterApi) -> String {
    project.default_namespace.clone().unwrap_or_else(|| cluster.default_namespace())
}

/// Put every namespace-less object of a namespaced kind into `namespace`.
/// Scopes come from the server, so untyped kinds are covered too; kinds it
/// does not serve are left as they are.
pub async fn assign_namespace(cluster: &dyn ClusterApi, objects: &mut [Object], namespace: &str) -> Result<(), ClusterError> {
    let mut scopes: FxHashMap<ResourceIdentity, Option<Scope>> = FxHashMap::default();
    for object in objects.iter_mut().filter(|o| o.namespace().is_none()) {
        let scope = match scopes.get(object.gvk()) {
            Some(scope) => *scope,
            None => {
                let scope = match cluster.scope(object.gvk()).await {
                    Ok(scope) => Some(scope),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                scopes.insert(object.gvk().clone(), scope);
                scope
            }
        };
        if scope == Some(Scope::Namespaced) {
            object.set_namespace(namespace).map_err(|e| ClusterError::Encoding(e.to_string()))?;
            debug!(object = %object.reference(), "placed in default namespace");
        }
    }
    Ok(())
}

/// List items omit `apiVersion`/`kind`; restore them from the listed identity.
pub(crate) fn fill_type_meta(item: &mut Json, gvk: &ResourceIdentity) {
    if let Some(map) = item.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Json::String(gvk.api_version()));
        map.entry("kind").or_insert_with(|| Json::String(gvk.kind.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_rejections_are_recognized() {
        assert!(ClusterError::remote(400, "dryRun is not supported").rejects_dry_run());
        assert!(!ClusterError::remote(400, "spec.replicas: invalid").rejects_dry_run());
        assert!(!ClusterError::NotFound("x".into()).rejects_dry_run());
        assert_eq!(ClusterError::NotFound("x".into()).code(), Some(404));
    }

    #[tokio::test]
    async fn namespaces_follow_the_server_scope() {
        let cluster = mock::MockCluster::new().with_default_namespace("team-a");
        cluster.unserve("example.com/v1/Gadget".parse().unwrap());
        let obj = |api: &str, kind: &str, ns: Option<&str>| {
            let mut v = serde_json::json!({"apiVersion": api, "kind": kind, "metadata": {"name": "x"}});
            if let Some(ns) = ns {
                v["metadata"]["namespace"] = serde_json::json!(ns);
            }
            Object::from_json(v).unwrap()
        };
        let mut batch = vec![
            obj("monitoring.coreos.com/v1", "ServiceMonitor", None),
            obj("v1", "ConfigMap", Some("prod")),
            obj("rbac.authorization.k8s.io/v1", "ClusterRole", None),
            obj("example.com/v1", "Gadget", None),
        ];
        let project = Project::default();
        let ns = effective_namespace(&project, &cluster);
        assert_eq!(ns, "team-a");
        assign_namespace(&cluster, &mut batch, &ns).await.unwrap();
        let namespaces: Vec<_> = batch.iter().map(Object::namespace).collect();
        assert_eq!(namespaces, vec![Some("team-a"), Some("prod"), None, None]);
        assert_eq!(batch[0].get_str(&["metadata", "namespace"]), Some("team-a"));

        let project = Project { default_namespace: Some("shop".into()), ..Project::default() };
        assert_eq!(effective_namespace(&project, &cluster), "shop");
    }

    #[test]
    fn type_meta_is_filled_only_when_missing() {
        let gvk: ResourceIdentity = "apps/v1/Deployment".parse().unwrap();
        let mut item = serde_json::json!({"metadata": {"name": "a"}});
        fill_type_meta(&mut item, &gvk);
        assert_eq!(item["apiVersion"], "apps/v1");
        let mut item = serde_json::json!({"apiVersion": "apps/v1beta2", "kind": "Deployment"});
        fill_type_meta(&mut item, &gvk);
        assert_eq!(item["apiVersion"], "apps/v1beta2");
    }
}
