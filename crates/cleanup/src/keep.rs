//! What a project owns and what it still wants.

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use kubor_core::project::anchored;
use kubor_core::{GvkRegistry, Object, ObjectReference, Project, ResourceIdentity, ValidationError};

/// Resources a project considers its own: kinds, where to look and which names.
#[derive(Debug, Clone)]
pub struct Claim {
    pub kinds: Vec<ResourceIdentity>,
    /// Explicit namespaces; empty means every namespace of the cluster.
    pub namespaces: Vec<String>,
    /// Filter for discovered namespaces.
    pub namespace_patterns: Vec<Regex>,
    pub names: Vec<Regex>,
    /// Label selector every owned resource carries.
    pub selector: String,
    /// Where the server puts namespaced objects that name no namespace.
    pub default_namespace: String,
}

impl Claim {
    /// Claim of `project`; without configured kinds, the kinds of `batch` in
    /// first-seen order. `default_namespace` must be the namespace the batch
    /// was placed in (see `kubor_kubehub::effective_namespace`).
    pub fn from_project<'a>(
        project: &Project,
        default_namespace: &str,
        batch: impl IntoIterator<Item = &'a Object>,
    ) -> Result<Self, ValidationError> {
        let mut kinds: Vec<ResourceIdentity> = Vec::new();
        if project.claim.kinds.is_empty() {
            for o in batch {
                if !kinds.contains(o.gvk()) {
                    kinds.push(o.gvk().clone());
                }
            }
        } else {
            for k in &project.claim.kinds {
                let k: ResourceIdentity = k.parse()?;
                if !kinds.contains(&k) {
                    kinds.push(k);
                }
            }
        }
        Ok(Self {
            kinds,
            namespaces: project.claim.namespaces.clone(),
            namespace_patterns: project.claim.namespace_patterns.iter().map(|p| anchored(p)).collect::<Result<_, _>>()?,
            names: project.claim.names.iter().map(|p| anchored(p)).collect::<Result<_, _>>()?,
            selector: project.ownership_selector(),
            default_namespace: default_namespace.to_string(),
        })
    }

    pub fn claims_name(&self, name: &str) -> bool { self.names.is_empty() || self.names.iter().any(|r| r.is_match(name)) }

    pub fn claims_namespace(&self, namespace: &str) -> bool {
        self.namespace_patterns.is_empty() || self.namespace_patterns.iter().any(|r| r.is_match(namespace))
    }
}

/// Identity → namespace → names of every object in the desired batch.
#[derive(Debug, Clone, Default)]
pub struct KeepSet {
    index: FxHashMap<ResourceIdentity, FxHashMap<String, FxHashSet<String>>>,
    len: usize,
}

impl KeepSet {
    /// Index `batch`. The same object declared twice, under one identity or
    /// under two twin identities, is rejected.
    pub fn build<'a>(batch: impl IntoIterator<Item = &'a Object>, twins: &GvkRegistry) -> Result<Self, ValidationError> {
        let mut keep = Self::default();
        for o in batch {
            let r = o.reference();
            let ns = r.namespace_or_empty();
            let clash = std::iter::once(r.gvk.clone())
                .chain(twins.twins_of(&r.gvk))
                .find(|gvk| keep.contains(gvk, ns, &r.name));
            if let Some(gvk) = clash {
                let first = ObjectReference::new(gvk, r.namespace.as_deref(), &r.name);
                return Err(ValidationError::Duplicate { first: first.to_string(), second: r.to_string() });
            }
            keep.index.entry(r.gvk.clone()).or_default().entry(ns.to_string()).or_default().insert(r.name.clone());
            keep.len += 1;
        }
        Ok(keep)
    }

    /// Exact-identity membership; `namespace` is empty for cluster-scoped objects.
    pub fn contains(&self, gvk: &ResourceIdentity, namespace: &str, name: &str) -> bool {
        self.index.get(gvk).and_then(|by_ns| by_ns.get(namespace)).is_some_and(|names| names.contains(name))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceIdentity> { self.index.keys() }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> Object {
        let mut v = json!({"apiVersion": api_version, "kind": kind, "metadata": {"name": name}});
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = json!(ns);
        }
        Object::from_json(v).unwrap()
    }

    #[test]
    fn membership_is_exact() {
        let batch = [obj("apps/v1", "Deployment", Some("prod"), "web"), obj("v1", "Namespace", None, "prod")];
        let keep = KeepSet::build(&batch, &GvkRegistry::with_builtin_catalog()).unwrap();
        let deploy: ResourceIdentity = "apps/v1/deployment".parse().unwrap();
        let old: ResourceIdentity = "extensions/v1beta1/Deployment".parse().unwrap();
        assert!(keep.contains(&deploy, "prod", "web"));
        assert!(!keep.contains(&deploy, "dev", "web"));
        assert!(!keep.contains(&old, "prod", "web"));
        assert!(keep.contains(&"v1/Namespace".parse().unwrap(), "", "prod"));
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn duplicates_are_rejected_also_through_twins() {
        let twins = GvkRegistry::with_builtin_catalog();
        let same = [obj("v1", "ConfigMap", Some("a"), "c"), obj("v1", "ConfigMap", Some("a"), "c")];
        assert!(matches!(KeepSet::build(&same, &twins), Err(ValidationError::Duplicate { .. })));

        let twin = [obj("apps/v1", "Deployment", Some("a"), "web"), obj("extensions/v1beta1", "Deployment", Some("a"), "web")];
        let err = KeepSet::build(&twin, &twins).unwrap_err();
        assert_eq!(
            err.to_string(),
            "apps/v1/Deployment a/web and extensions/v1beta1/Deployment a/web declare the same object"
        );

        let distinct = [obj("v1", "ConfigMap", Some("a"), "c"), obj("v1", "ConfigMap", Some("b"), "c")];
        assert!(KeepSet::build(&distinct, &twins).is_ok());
    }

    #[test]
    fn claim_kinds_default_to_the_batch() {
        let project = Project { group_id: "acme".into(), artifact_id: "shop".into(), ..Project::default() };
        let batch = [obj("v1", "ConfigMap", Some("a"), "c"), obj("v1", "configmap", Some("a"), "d"), obj("v1", "Service", Some("a"), "s")];
        let claim = Claim::from_project(&project, "team-a", &batch).unwrap();
        let kinds: Vec<String> = claim.kinds.iter().map(ToString::to_string).collect();
        assert_eq!(kinds, vec!["v1/ConfigMap", "v1/Service"]);
        assert_eq!(claim.default_namespace, "team-a");
        assert!(claim.claims_name("anything"));

        let mut project = project;
        project.claim.kinds = vec!["apps/v1/Deployment".into()];
        project.claim.names = vec!["shop-.*".into()];
        let claim = Claim::from_project(&project, "team-a", &batch).unwrap();
        assert_eq!(claim.kinds.len(), 1);
        assert!(claim.claims_name("shop-web"));
        assert!(!claim.claims_name("my-shop-web"));
    }
}
