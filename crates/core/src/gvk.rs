//! Resource identities (group/version/kind) and object references.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Group/version/kind triple. Equality and hashing are case-folded; the
/// original spelling is kept for API calls and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceIdentity {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from a manifest's `apiVersion` (`v1` or `group/v1`) and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Lowercased `(group, version, kind)`, the form every lookup uses.
    pub fn normalized(&self) -> (String, String, String) {
        (self.group.to_ascii_lowercase(), self.version.to_ascii_lowercase(), self.kind.to_ascii_lowercase())
    }

    pub fn kind_lower(&self) -> String {
        self.kind.to_ascii_lowercase()
    }

    /// Same group and kind, any version.
    pub fn same_group_kind(&self, other: &ResourceIdentity) -> bool {
        self.group.eq_ignore_ascii_case(&other.group) && self.kind.eq_ignore_ascii_case(&other.kind)
    }
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.group.eq_ignore_ascii_case(&other.group)
            && self.version.eq_ignore_ascii_case(&other.version)
            && self.kind.eq_ignore_ascii_case(&other.kind)
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for part in [&self.group, &self.version, &self.kind] {
            for b in part.bytes() {
                state.write_u8(b.to_ascii_lowercase());
            }
            state.write_u8(0xff);
        }
    }
}

impl PartialOrd for ResourceIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for ResourceIdentity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.normalized().cmp(&other.normalized()) }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Parses `v1/Kind` or `group/v1/Kind`.
impl FromStr for ResourceIdentity {
    type Err = ValidationError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(ValidationError::Identity(key.to_string())),
        }
    }
}

/// Identity + namespace + name of one live or desired object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    pub gvk: ResourceIdentity,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectReference {
    pub fn new(gvk: ResourceIdentity, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.filter(|n| !n.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identities_compare_case_insensitively() {
        let a = ResourceIdentity::new("apps", "v1", "Deployment");
        let b = ResourceIdentity::new("APPS", "V1", "deployment");
        assert_eq!(a, b);
        let set: HashSet<_> = [a.clone()].into_iter().collect();
        assert!(set.contains(&b));
        assert_eq!(b.to_string(), "APPS/V1/deployment");
    }

    #[test]
    fn parses_keys_and_api_versions() {
        let core: ResourceIdentity = "v1/Service".parse().unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        let apps: ResourceIdentity = "apps/v1/Deployment".parse().unwrap();
        assert_eq!(apps, ResourceIdentity::from_api_version("apps/v1", "Deployment"));
        assert!("Deployment".parse::<ResourceIdentity>().is_err());
        assert!("a/b/c/d".parse::<ResourceIdentity>().is_err());
    }

    #[test]
    fn reference_drops_empty_namespace() {
        let r = ObjectReference::new(ResourceIdentity::new("", "v1", "Namespace"), Some(""), "prod");
        assert_eq!(r.namespace, None);
        assert_eq!(r.to_string(), "v1/Namespace prod");
    }
}
