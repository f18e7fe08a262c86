//! Kubor schema: typed decode checks for known kinds, the multi-document
//! manifest decoder, and a file source feeding it.

#![forbid(unsafe_code)]

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope, Resource};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::debug;

use kubor_core::document::PathExt;
use kubor_core::{Object, ObjectError, PathError, ResourceIdentity};
use kubor_kubehub::Scope;

mod decode;
mod source;

pub use decode::{split_documents, Decoded, Decoder};
pub use source::FileSource;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The kind has no schema here; callers may fall back to an untyped decode.
    #[error("no schema registered for {0}")]
    NotRegistered(ResourceIdentity),
    #[error("unknown kind {0} (not in ignoreUnknownKinds)")]
    UnknownKind(ResourceIdentity),
    #[error("{gvk} does not match its schema: {source}")]
    Typed { gvk: ResourceIdentity, source: serde_json::Error },
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Path(#[from] PathError),
}

type Check = fn(&Json) -> Result<(), serde_json::Error>;

fn typed_check<K: DeserializeOwned>(v: &Json) -> Result<(), serde_json::Error> {
    K::deserialize(v).map(|_| ())
}

fn untyped_check(_: &Json) -> Result<(), serde_json::Error> { Ok(()) }

#[derive(Clone)]
struct Entry {
    /// Registered spelling; manifests may differ in case.
    gvk: ResourceIdentity,
    scope: Scope,
    check: Check,
}

/// Identity → (scope, typed check). Built once at startup.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    kinds: FxHashMap<ResourceIdentity, Entry>,
}

fn identity_of<K: Resource>() -> ResourceIdentity {
    ResourceIdentity::new(K::GROUP, K::VERSION, K::KIND)
}

impl SchemaRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn namespaced<K>(mut self) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope> + DeserializeOwned,
    {
        let gvk = identity_of::<K>();
        self.kinds.insert(gvk.clone(), Entry { gvk, scope: Scope::Namespaced, check: typed_check::<K> });
        self
    }

    pub fn cluster<K>(mut self) -> Self
    where
        K: Resource<Scope = ClusterResourceScope> + DeserializeOwned,
    {
        let gvk = identity_of::<K>();
        self.kinds.insert(gvk.clone(), Entry { gvk, scope: Scope::Cluster, check: typed_check::<K> });
        self
    }

    /// Register a kind without a typed representation (custom resources).
    pub fn register_untyped(&mut self, gvk: ResourceIdentity, scope: Scope) {
        self.kinds.insert(gvk.clone(), Entry { gvk, scope, check: untyped_check });
    }

    /// Register every served version of a CustomResourceDefinition document.
    /// Returns how many identities were added.
    pub fn register_crd(&mut self, crd: &Object) -> usize {
        let body = crd.body();
        let (Some(group), Some(kind)) = (body.get_str(&["spec", "group"]), body.get_str(&["spec", "names", "kind"])) else {
            return 0;
        };
        let scope = match body.get_str(&["spec", "scope"]) {
            Some(s) if s.eq_ignore_ascii_case("Cluster") => Scope::Cluster,
            _ => Scope::Namespaced,
        };
        let versions = body.get_path(&["spec", "versions"]).and_then(Json::as_array).cloned().unwrap_or_default();
        let mut added = 0;
        for v in versions {
            let served = v.get("served").and_then(Json::as_bool).unwrap_or(true);
            if let (true, Some(name)) = (served, v.get("name").and_then(Json::as_str)) {
                self.register_untyped(ResourceIdentity::new(group, name, kind), scope);
                added += 1;
            }
        }
        debug!(group, kind, added, "registered custom resource kinds");
        added
    }

    pub fn scope_of(&self, gvk: &ResourceIdentity) -> Option<Scope> {
        self.kinds.get(gvk).map(|e| e.scope)
    }

    /// Typed decode check. `NotRegistered` is the recoverable signal.
    pub fn check(&self, object: &Object) -> Result<Scope, DecodeError> {
        let entry = self.kinds.get(object.gvk()).ok_or_else(|| DecodeError::NotRegistered(object.gvk().clone()))?;
        let mut body = object.body().clone();
        body.set_path(&["apiVersion"], Json::String(entry.gvk.api_version()))?;
        body.set_path(&["kind"], Json::String(entry.gvk.kind.clone()))?;
        (entry.check)(&body).map_err(|source| DecodeError::Typed { gvk: object.gvk().clone(), source })?;
        Ok(entry.scope)
    }

    pub fn len(&self) -> usize { self.kinds.len() }

    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// The common built-in kinds.
    pub fn with_builtins() -> Self {
        use k8s_openapi::api::{
            admissionregistration::v1 as admission, apps::v1 as apps, autoscaling::v1 as autoscaling_v1,
            autoscaling::v2 as autoscaling_v2, batch::v1 as batch, coordination::v1 as coordination, core::v1 as core,
            networking::v1 as networking, policy::v1 as policy, rbac::v1 as rbac, scheduling::v1 as scheduling,
            storage::v1 as storage,
        };
        use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiext;

        Self::new()
            .namespaced::<core::ConfigMap>()
            .namespaced::<core::Secret>()
            .namespaced::<core::Service>()
            .namespaced::<core::ServiceAccount>()
            .namespaced::<core::Pod>()
            .namespaced::<core::PersistentVolumeClaim>()
            .namespaced::<core::Endpoints>()
            .namespaced::<core::LimitRange>()
            .namespaced::<core::ResourceQuota>()
            .namespaced::<core::ReplicationController>()
            .cluster::<core::Namespace>()
            .cluster::<core::PersistentVolume>()
            .namespaced::<apps::Deployment>()
            .namespaced::<apps::StatefulSet>()
            .namespaced::<apps::DaemonSet>()
            .namespaced::<apps::ReplicaSet>()
            .namespaced::<apps::ControllerRevision>()
            .namespaced::<batch::Job>()
            .namespaced::<batch::CronJob>()
            .namespaced::<networking::Ingress>()
            .namespaced::<networking::NetworkPolicy>()
            .cluster::<networking::IngressClass>()
            .namespaced::<policy::PodDisruptionBudget>()
            .namespaced::<autoscaling_v1::HorizontalPodAutoscaler>()
            .namespaced::<autoscaling_v2::HorizontalPodAutoscaler>()
            .namespaced::<rbac::Role>()
            .namespaced::<rbac::RoleBinding>()
            .cluster::<rbac::ClusterRole>()
            .cluster::<rbac::ClusterRoleBinding>()
            .cluster::<scheduling::PriorityClass>()
            .cluster::<storage::StorageClass>()
            .cluster::<storage::CSIDriver>()
            .cluster::<admission::ValidatingWebhookConfiguration>()
            .cluster::<admission::MutatingWebhookConfiguration>()
            .namespaced::<coordination::Lease>()
            .cluster::<apiext::CustomResourceDefinition>()
    }
}
