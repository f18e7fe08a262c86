//! Readiness aggregation: per-kind extraction of replica counts and a ready flag.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::document::PathExt;
use crate::object::Object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    NotReady,
    /// The kind has no readiness concept.
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Readiness {
    pub desired: Option<i64>,
    pub ready: Option<i64>,
    pub up_to_date: Option<i64>,
    pub available: Option<i64>,
    pub state: Option<ReadyState>,
}

impl Readiness {
    fn unknown() -> Self { Self { state: Some(ReadyState::Unknown), ..Self::default() } }

    pub fn state(&self) -> ReadyState { self.state.unwrap_or(ReadyState::Unknown) }

    /// Ready, or a kind without readiness.
    pub fn ready_or_unknown(&self) -> bool { !matches!(self.state(), ReadyState::NotReady) }
}

/// How a kind reports readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Job,
    Pod,
    PersistentVolumeClaim,
}

/// Normalized kind name → strategy. Unknown kinds report [`ReadyState::Unknown`].
#[derive(Debug, Clone)]
pub struct ReadinessRegistry {
    by_kind: FxHashMap<String, Strategy>,
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        let mut r = Self { by_kind: FxHashMap::default() };
        r.register("Deployment", Strategy::Deployment);
        r.register("StatefulSet", Strategy::StatefulSet);
        r.register("DaemonSet", Strategy::DaemonSet);
        r.register("ReplicaSet", Strategy::ReplicaSet);
        r.register("ReplicationController", Strategy::ReplicaSet);
        r.register("Job", Strategy::Job);
        r.register("Pod", Strategy::Pod);
        r.register("PersistentVolumeClaim", Strategy::PersistentVolumeClaim);
        r
    }
}

impl ReadinessRegistry {
    pub fn register(&mut self, kind: &str, strategy: Strategy) {
        self.by_kind.insert(kind.to_ascii_lowercase(), strategy);
    }

    pub fn strategy_for(&self, kind: &str) -> Option<Strategy> {
        self.by_kind.get(&kind.to_ascii_lowercase()).copied()
    }

    pub fn evaluate(&self, object: &Object) -> Readiness {
        match self.strategy_for(&object.gvk().kind) {
            Some(s) => evaluate(s, object.body()),
            None => Readiness::unknown(),
        }
    }
}

fn int(v: &Json, path: &[&str]) -> Option<i64> { v.get_i64(path) }

/// The controller has not yet looked at the latest spec.
fn stale(v: &Json) -> bool {
    match (int(v, &["metadata", "generation"]), int(v, &["status", "observedGeneration"])) {
        (Some(generation), Some(observed)) => observed < generation,
        (Some(_), None) => v.get_path(&["status"]).is_some(),
        _ => false,
    }
}

fn state_of(ok: bool) -> Option<ReadyState> {
    Some(if ok { ReadyState::Ready } else { ReadyState::NotReady })
}

fn evaluate(strategy: Strategy, v: &Json) -> Readiness {
    match strategy {
        Strategy::Deployment => {
            let desired = int(v, &["spec", "replicas"]).unwrap_or(1);
            let total = int(v, &["status", "replicas"]).unwrap_or(0);
            let ready = int(v, &["status", "readyReplicas"]).unwrap_or(0);
            let updated = int(v, &["status", "updatedReplicas"]).unwrap_or(0);
            let available = int(v, &["status", "availableReplicas"]).unwrap_or(0);
            let ok = !stale(v) && updated >= desired && total <= updated && available >= desired && ready >= desired;
            Readiness { desired: Some(desired), ready: Some(ready), up_to_date: Some(updated), available: Some(available), state: state_of(ok) }
        }
        Strategy::StatefulSet => {
            let desired = int(v, &["spec", "replicas"]).unwrap_or(1);
            let ready = int(v, &["status", "readyReplicas"]).unwrap_or(0);
            let updated = int(v, &["status", "updatedReplicas"]).unwrap_or(0);
            let available = int(v, &["status", "availableReplicas"]).unwrap_or(ready);
            let on_delete = v.get_str(&["spec", "updateStrategy", "type"]) == Some("OnDelete");
            let ok = !stale(v) && ready >= desired && (on_delete || updated >= desired);
            Readiness { desired: Some(desired), ready: Some(ready), up_to_date: Some(updated), available: Some(available), state: state_of(ok) }
        }
        Strategy::DaemonSet => {
            let desired = int(v, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = int(v, &["status", "numberReady"]).unwrap_or(0);
            let updated = int(v, &["status", "updatedNumberScheduled"]).unwrap_or(0);
            let available = int(v, &["status", "numberAvailable"]).unwrap_or(0);
            let observed = v.get_path(&["status", "desiredNumberScheduled"]).is_some();
            let ok = observed && !stale(v) && ready >= desired && updated >= desired && available >= desired;
            Readiness { desired: Some(desired), ready: Some(ready), up_to_date: Some(updated), available: Some(available), state: state_of(ok) }
        }
        Strategy::ReplicaSet => {
            let desired = int(v, &["spec", "replicas"]).unwrap_or(1);
            let ready = int(v, &["status", "readyReplicas"]).unwrap_or(0);
            let available = int(v, &["status", "availableReplicas"]).unwrap_or(0);
            let ok = !stale(v) && ready >= desired && available >= desired;
            Readiness { desired: Some(desired), ready: Some(ready), up_to_date: None, available: Some(available), state: state_of(ok) }
        }
        Strategy::Job => {
            let desired = int(v, &["spec", "completions"]).unwrap_or(1);
            let succeeded = int(v, &["status", "succeeded"]).unwrap_or(0);
            let active = int(v, &["status", "active"]);
            Readiness { desired: Some(desired), ready: Some(succeeded), up_to_date: None, available: active, state: state_of(succeeded >= desired) }
        }
        Strategy::Pod => {
            let phase = v.get_str(&["status", "phase"]);
            let ready_condition = v
                .get_path(&["status", "conditions"])
                .and_then(Json::as_array)
                .map(|cs| cs.iter().any(|c| c.get_str(&["type"]) == Some("Ready") && c.get_str(&["status"]) == Some("True")))
                .unwrap_or(false);
            let ok = phase == Some("Succeeded") || (phase == Some("Running") && ready_condition);
            Readiness { desired: Some(1), ready: Some(i64::from(ok)), up_to_date: None, available: None, state: state_of(ok) }
        }
        Strategy::PersistentVolumeClaim => {
            let ok = v.get_str(&["status", "phase"]) == Some("Bound");
            Readiness { state: state_of(ok), ..Readiness::default() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Json) -> Object { Object::from_json(v).unwrap() }

    fn deployment(generation: i64, status: Json) -> Object {
        obj(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod", "generation": generation},
            "spec": {"replicas": 2},
            "status": status
        }))
    }

    #[test]
    fn deployment_counts_and_state() {
        let r = ReadinessRegistry::default();
        let ready = deployment(2, json!({"observedGeneration": 2, "replicas": 2, "readyReplicas": 2, "updatedReplicas": 2, "availableReplicas": 2}));
        let got = r.evaluate(&ready);
        assert_eq!(got.state(), ReadyState::Ready);
        assert_eq!((got.desired, got.ready, got.up_to_date, got.available), (Some(2), Some(2), Some(2), Some(2)));

        let rolling = deployment(2, json!({"observedGeneration": 2, "replicas": 3, "readyReplicas": 2, "updatedReplicas": 2, "availableReplicas": 2}));
        assert_eq!(r.evaluate(&rolling).state(), ReadyState::NotReady);

        let stale = deployment(3, json!({"observedGeneration": 2, "replicas": 2, "readyReplicas": 2, "updatedReplicas": 2, "availableReplicas": 2}));
        assert!(!r.evaluate(&stale).ready_or_unknown());
    }

    #[test]
    fn unknown_kinds_never_fail() {
        let r = ReadinessRegistry::default();
        let cm = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        let got = r.evaluate(&cm);
        assert_eq!(got.state(), ReadyState::Unknown);
        assert!(got.ready_or_unknown());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let r = ReadinessRegistry::default();
        assert_eq!(r.strategy_for("DEPLOYMENT"), Some(Strategy::Deployment));
        assert_eq!(r.strategy_for("configmap"), None);
    }

    #[test]
    fn job_and_pod() {
        let r = ReadinessRegistry::default();
        let job = obj(json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "j"}, "spec": {"completions": 2}, "status": {"succeeded": 2}}));
        assert_eq!(r.evaluate(&job).state(), ReadyState::Ready);
        let pod = obj(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}}));
        assert_eq!(r.evaluate(&pod).state(), ReadyState::NotReady);
    }
}
