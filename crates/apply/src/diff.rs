//! Field-level change counts between a target and the live object.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}

/// Drop server-maintained fields that would show up as noise in every diff.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count keys `target` adds, leaves changed and removes relative to `base`.
/// A `Null` base counts every top-level key of the target as an add.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (Json::Object(ao), Json::Null) => s.adds += ao.len(),
            (av, bv) if av != bv => s.updates += 1,
            _ => {}
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "u-1",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        assert_eq!(pruned["metadata"], json!({"name": "x", "namespace": "ns"}));
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3], "gone": true});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        assert_eq!(diff_summary(&target, &base), DiffSummary { adds: 2, updates: 2, removes: 2 });
    }

    #[test]
    fn creation_counts_top_level_keys() {
        let target = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}});
        let s = diff_summary(&target, &Json::Null);
        assert_eq!(s.adds, 3);
        assert_eq!(s.to_string(), "+3 ~0 -0");
    }
}
