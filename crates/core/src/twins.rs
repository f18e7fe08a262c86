//! Equivalence classes of resource identities that expose one logical
//! resource under several API versions.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::gvk::ResourceIdentity;

/// Identity → twin class table. Built once at startup and passed by reference.
#[derive(Debug, Clone, Default)]
pub struct GvkRegistry {
    class_of: FxHashMap<ResourceIdentity, usize>,
    classes: Vec<FxHashSet<ResourceIdentity>>,
}

impl GvkRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn builder() -> GvkRegistryBuilder { GvkRegistryBuilder { registry: Self::new() } }

    /// Registry holding the catalog of well-known built-in kinds.
    pub fn with_builtin_catalog() -> Self {
        let mut b = Self::builder();
        for (versions, kinds) in BUILTIN_CATALOG {
            for kind in *kinds {
                b = b.twins(versions.iter().map(|gv| ResourceIdentity::from_api_version(gv, kind)));
            }
        }
        b.build()
    }

    /// Merge a new class. Members leave whatever class they were in before.
    pub fn register_twins<I>(&mut self, identities: I)
    where
        I: IntoIterator<Item = ResourceIdentity>,
    {
        let members: FxHashSet<ResourceIdentity> = identities.into_iter().collect();
        if members.is_empty() {
            return;
        }
        let idx = self.classes.len();
        for id in &members {
            if let Some(prev) = self.class_of.insert(id.clone(), idx) {
                self.classes[prev].remove(id);
            }
        }
        self.classes.push(members);
    }

    /// Other members of `id`'s class; empty when unregistered.
    pub fn twins_of(&self, id: &ResourceIdentity) -> FxHashSet<ResourceIdentity> {
        match self.class_of.get(id) {
            Some(idx) => self.classes[*idx].iter().filter(|m| *m != id).cloned().collect(),
            None => FxHashSet::default(),
        }
    }

    pub fn are_twins(&self, a: &ResourceIdentity, b: &ResourceIdentity) -> bool {
        if a == b {
            return true;
        }
        match (self.class_of.get(a), self.class_of.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Non-empty classes, members sorted, for listing.
    pub fn classes(&self) -> Vec<Vec<ResourceIdentity>> {
        let mut out: Vec<Vec<ResourceIdentity>> = self
            .classes
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| {
                let mut v: Vec<_> = c.iter().cloned().collect();
                v.sort();
                v
            })
            .collect();
        out.sort();
        out
    }
}

pub struct GvkRegistryBuilder {
    registry: GvkRegistry,
}

impl GvkRegistryBuilder {
    pub fn twins<I>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = ResourceIdentity>,
    {
        self.registry.register_twins(identities);
        self
    }

    pub fn build(self) -> GvkRegistry { self.registry }
}

type CatalogEntry = (&'static [&'static str], &'static [&'static str]);

const BUILTIN_CATALOG: &[CatalogEntry] = &[
    (&["apps/v1", "apps/v1beta1", "apps/v1beta2", "extensions/v1beta1"], &["Deployment"]),
    (&["apps/v1", "apps/v1beta2", "extensions/v1beta1"], &["DaemonSet", "ReplicaSet"]),
    (&["apps/v1", "apps/v1beta1", "apps/v1beta2"], &["StatefulSet", "ControllerRevision"]),
    (&["networking.k8s.io/v1", "networking.k8s.io/v1beta1", "extensions/v1beta1"], &["Ingress"]),
    (&["networking.k8s.io/v1", "extensions/v1beta1"], &["NetworkPolicy"]),
    (&["policy/v1beta1", "extensions/v1beta1"], &["PodSecurityPolicy"]),
    (&["batch/v1", "batch/v1beta1", "batch/v2alpha1"], &["CronJob"]),
    (&["autoscaling/v1", "autoscaling/v2", "autoscaling/v2beta1", "autoscaling/v2beta2"], &["HorizontalPodAutoscaler"]),
    (&["policy/v1", "policy/v1beta1"], &["PodDisruptionBudget"]),
    (&["apiextensions.k8s.io/v1", "apiextensions.k8s.io/v1beta1"], &["CustomResourceDefinition"]),
    (
        &["rbac.authorization.k8s.io/v1", "rbac.authorization.k8s.io/v1beta1", "rbac.authorization.k8s.io/v1alpha1"],
        &["Role", "RoleBinding", "ClusterRole", "ClusterRoleBinding"],
    ),
    (&["scheduling.k8s.io/v1", "scheduling.k8s.io/v1beta1", "scheduling.k8s.io/v1alpha1"], &["PriorityClass"]),
    (&["storage.k8s.io/v1", "storage.k8s.io/v1beta1"], &["StorageClass", "VolumeAttachment", "CSIDriver"]),
    (&["admissionregistration.k8s.io/v1", "admissionregistration.k8s.io/v1beta1"], &["MutatingWebhookConfiguration", "ValidatingWebhookConfiguration"]),
    (&["coordination.k8s.io/v1", "coordination.k8s.io/v1beta1"], &["Lease"]),
    (&["events.k8s.io/v1", "events.k8s.io/v1beta1", "v1"], &["Event"]),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ResourceIdentity { s.parse().unwrap() }

    #[test]
    fn identical_identities_are_twins_case_insensitively() {
        let r = GvkRegistry::new();
        assert!(r.are_twins(&id("apps/v1/Deployment"), &id("APPS/V1/deployment")));
        assert!(!r.are_twins(&id("apps/v1/Deployment"), &id("apps/v1beta1/Deployment")));
        assert!(r.twins_of(&id("apps/v1/Deployment")).is_empty());
    }

    #[test]
    fn twin_membership_is_symmetric_and_transitive() {
        let r = GvkRegistry::with_builtin_catalog();
        let a = id("apps/v1/Deployment");
        let b = id("extensions/v1beta1/Deployment");
        let c = id("apps/v1beta2/deployment");
        assert!(r.are_twins(&a, &b) && r.are_twins(&b, &a));
        assert!(r.are_twins(&b, &c) && r.are_twins(&a, &c));
        assert!(!r.are_twins(&a, &id("apps/v1/StatefulSet")));
        let twins = r.twins_of(&a);
        assert_eq!(twins.len(), 3);
        assert!(!twins.contains(&a));
    }

    #[test]
    fn last_registration_wins() {
        let r = GvkRegistry::builder()
            .twins([id("x.io/v1/Foo"), id("x.io/v1beta1/Foo"), id("x.io/v1alpha1/Foo")])
            .twins([id("x.io/v1alpha1/Foo"), id("y.io/v1/Foo")])
            .build();
        assert!(!r.are_twins(&id("x.io/v1/Foo"), &id("x.io/v1alpha1/Foo")));
        assert!(r.are_twins(&id("X.IO/v1alpha1/Foo"), &id("y.io/v1/Foo")));
        assert_eq!(r.twins_of(&id("x.io/v1/Foo")).len(), 1);
        assert_eq!(r.classes().len(), 2);
    }
}
