//! In-memory [`ClusterApi`] for tests.
//!
//! Behaves like a small API server: creates assign `generation` and
//! `resourceVersion`, updates bump `generation` on spec changes and reject stale
//! resource versions, list honours equality label selectors and pages through
//! continuation tokens, watches see every later change of their object.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio::sync::broadcast;

use kubor_core::document::PathExt;
use kubor_core::{Object, ObjectReference, ResourceIdentity};

use crate::{ClusterApi, ClusterError, ListOptions, Page, Scope, WatchEvent, WatchStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Scope,
    Get,
    Create,
    Update,
    Delete,
    List,
    ListNamespaces,
    Watch,
}

/// One recorded call: the action and its target (`reference`, or `gvk ns` for lists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub action: Action,
    pub target: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
struct Failure {
    action: Action,
    /// Object name, lowercased kind for lists, `*` for anything.
    target: String,
    error: ClusterError,
    once: bool,
}

type Key = (String, String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Json>,
    namespaces: BTreeSet<String>,
    default_namespace: String,
    cluster_scoped: FxHashSet<ResourceIdentity>,
    unserved: FxHashSet<ResourceIdentity>,
    failures: Vec<Failure>,
    calls: Vec<Call>,
    next_rv: u64,
    page_size: Option<u32>,
    rejects_dry_run: bool,
}

pub struct MockCluster {
    state: Mutex<State>,
    events: Mutex<Option<broadcast::Sender<(ObjectReference, WatchEvent)>>>,
}

const CLUSTER_SCOPED: &[&str] = &[
    "v1/Namespace",
    "v1/Node",
    "v1/PersistentVolume",
    "rbac.authorization.k8s.io/v1/ClusterRole",
    "rbac.authorization.k8s.io/v1/ClusterRoleBinding",
    "apiextensions.k8s.io/v1/CustomResourceDefinition",
    "scheduling.k8s.io/v1/PriorityClass",
    "storage.k8s.io/v1/StorageClass",
];

fn key_of(r: &ObjectReference) -> Key {
    let (g, v, k) = r.gvk.normalized();
    (g, v, k, r.namespace_or_empty().to_string(), r.name.clone())
}

impl Default for MockCluster {
    fn default() -> Self { Self::new() }
}

impl MockCluster {
    pub fn new() -> Self {
        let mut state = State { next_rv: 1, ..State::default() };
        state.namespaces.insert("default".to_string());
        state.default_namespace = "default".to_string();
        state.cluster_scoped = CLUSTER_SCOPED.iter().filter_map(|k| k.parse().ok()).collect();
        let (tx, _) = broadcast::channel(256);
        Self { state: Mutex::new(state), events: Mutex::new(Some(tx)) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, reference: &ObjectReference, event: WatchEvent) {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send((reference.clone(), event));
        }
    }

    /// Context namespace: where namespaced objects without a namespace land.
    pub fn with_default_namespace(self, namespace: &str) -> Self {
        {
            let mut st = self.lock();
            st.namespaces.insert(namespace.to_string());
            st.default_namespace = namespace.to_string();
        }
        self
    }

    /// Page size applied to every list call, on top of the caller's limit.
    pub fn with_page_size(self, size: u32) -> Self {
        self.lock().page_size = Some(size);
        self
    }

    pub fn mark_cluster_scoped(&self, gvk: ResourceIdentity) {
        self.lock().cluster_scoped.insert(gvk);
    }

    /// Pretend the server does not serve `gvk` at all.
    pub fn unserve(&self, gvk: ResourceIdentity) {
        self.lock().unserved.insert(gvk);
    }

    /// Reject every dry-run request like an API server without dry-run support.
    pub fn reject_dry_run(&self) {
        self.lock().rejects_dry_run = true;
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.insert(namespace.to_string());
    }

    /// Store `body` as a live object, bypassing creation bookkeeping except
    /// for missing `generation` / `resourceVersion`.
    pub fn insert(&self, mut body: Json) -> ObjectReference {
        let mut st = self.lock();
        let rv = st.bump_rv();
        if body.get_path(&["metadata", "generation"]).is_none() {
            let _ = body.set_path(&["metadata", "generation"], Json::from(1));
        }
        if body.get_path(&["metadata", "resourceVersion"]).is_none() {
            let _ = body.set_path(&["metadata", "resourceVersion"], Json::String(rv));
        }
        let object = Object::from_json(body).unwrap_or_else(|e| panic!("mock insert: {e}"));
        let reference = object.reference().clone();
        if let Some(ns) = &reference.namespace {
            st.namespaces.insert(ns.clone());
        }
        st.objects.insert(key_of(&reference), object.into_json());
        reference
    }

    /// Replace the status of a stored object and notify watchers.
    pub fn set_status(&self, reference: &ObjectReference, status: Json) {
        let body = {
            let mut st = self.lock();
            let rv = st.bump_rv();
            let Some(body) = st.objects.get_mut(&key_of(reference)) else { panic!("mock set_status: {reference} not stored") };
            let _ = body.set_path(&["status"], status);
            let _ = body.set_path(&["metadata", "resourceVersion"], Json::String(rv));
            body.clone()
        };
        self.emit(reference, WatchEvent::Applied(body));
    }

    /// Fail every future `action` on `target`.
    pub fn fail(&self, action: Action, target: &str, error: ClusterError) {
        self.lock().failures.push(Failure { action, target: target.to_string(), error, once: false });
    }

    pub fn fail_once(&self, action: Action, target: &str, error: ClusterError) {
        self.lock().failures.push(Failure { action, target: target.to_string(), error, once: true });
    }

    /// End every open watch stream.
    pub fn close_watches(&self) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events.take();
    }

    pub fn object(&self, reference: &ObjectReference) -> Option<Json> {
        self.lock().objects.get(&key_of(reference)).cloned()
    }

    pub fn contains(&self, reference: &ObjectReference) -> bool {
        self.lock().objects.contains_key(&key_of(reference))
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn count(&self, action: Action) -> usize {
        self.lock().calls.iter().filter(|c| c.action == action && !c.dry_run).count()
    }
}

impl State {
    fn bump_rv(&mut self) -> String {
        let rv = self.next_rv;
        self.next_rv += 1;
        rv.to_string()
    }

    fn record(&mut self, action: Action, target: String, dry_run: bool) {
        self.calls.push(Call { action, target, dry_run });
    }

    fn injected(&mut self, action: Action, target: &str) -> Result<(), ClusterError> {
        let pos = self
            .failures
            .iter()
            .position(|f| f.action == action && (f.target == "*" || f.target.eq_ignore_ascii_case(target)));
        match pos {
            Some(i) if self.failures[i].once => Err(self.failures.remove(i).error),
            Some(i) => Err(self.failures[i].error.clone()),
            None => Ok(()),
        }
    }

    fn served(&self, gvk: &ResourceIdentity) -> Result<(), ClusterError> {
        if self.unserved.contains(gvk) {
            return Err(ClusterError::NotFound(format!("resource kind {gvk} is not served")));
        }
        Ok(())
    }

    fn scope_of(&self, gvk: &ResourceIdentity) -> Scope {
        if self.cluster_scoped.contains(gvk) { Scope::Cluster } else { Scope::Namespaced }
    }

    /// Namespaced kinds without a namespace land in the context namespace.
    fn place(&self, reference: &ObjectReference) -> ObjectReference {
        match (self.scope_of(&reference.gvk), &reference.namespace) {
            (Scope::Namespaced, None) => ObjectReference::new(reference.gvk.clone(), Some(self.default_namespace.as_str()), &reference.name),
            (Scope::Cluster, Some(_)) => ObjectReference::new(reference.gvk.clone(), None, &reference.name),
            _ => reference.clone(),
        }
    }
}

fn dry_run_rejected() -> ClusterError {
    ClusterError::remote(400, "dryRun is not supported by this server")
}

/// Body without the fields a spec change does not touch.
fn spec_view(body: &Json) -> Json {
    let mut v = body.clone();
    let _ = v.delete_path(&["status"]);
    let _ = v.delete_path(&["metadata"]);
    v
}

fn matches_selector(body: &Json, selector: Option<&str>) -> bool {
    let Some(selector) = selector else { return true };
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|term| {
        let label = |k: &str| body.get_str(&["metadata", "labels", k.trim()]);
        if let Some((k, v)) = term.split_once("!=") {
            label(k) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            label(k) == Some(v.trim())
        } else {
            label(term).is_some()
        }
    })
}

fn page<T>(all: Vec<T>, options: &ListOptions, page_size: Option<u32>) -> Result<Page<T>, ClusterError> {
    let start = match &options.continue_token {
        Some(t) => t.parse::<usize>().map_err(|_| ClusterError::remote(410, format!("bad continue token {t:?}")))?,
        None => 0,
    };
    let limit = match (options.limit, page_size) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let total = all.len();
    let items: Vec<T> = match limit {
        Some(n) => all.into_iter().skip(start).take(n as usize).collect(),
        None => all.into_iter().skip(start).collect(),
    };
    let end = start + items.len();
    Ok(Page { items, continue_token: (end < total).then(|| end.to_string()) })
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn default_namespace(&self) -> String { self.lock().default_namespace.clone() }

    async fn scope(&self, gvk: &ResourceIdentity) -> Result<Scope, ClusterError> {
        let mut st = self.lock();
        st.record(Action::Scope, gvk.to_string(), false);
        st.served(gvk)?;
        Ok(st.scope_of(gvk))
    }

    async fn get(&self, reference: &ObjectReference) -> Result<Object, ClusterError> {
        let mut st = self.lock();
        st.record(Action::Get, reference.to_string(), false);
        st.injected(Action::Get, &reference.name)?;
        st.served(&reference.gvk)?;
        let placed = st.place(reference);
        let body = st.objects.get(&key_of(&placed)).cloned().ok_or_else(|| ClusterError::NotFound(reference.to_string()))?;
        Object::from_json(body).map_err(|e| ClusterError::Encoding(e.to_string()))
    }

    async fn create(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError> {
        let created = {
            let mut st = self.lock();
            st.record(Action::Create, object.reference().to_string(), dry_run);
            if dry_run && st.rejects_dry_run {
                return Err(dry_run_rejected());
            }
            st.injected(Action::Create, object.name())?;
            st.served(object.gvk())?;
            let reference = st.place(object.reference());
            if st.objects.contains_key(&key_of(&reference)) {
                return Err(ClusterError::remote(409, format!("{reference} already exists")));
            }
            let mut body = object.body().clone();
            if let Some(ns) = &reference.namespace {
                let _ = body.set_path(&["metadata", "namespace"], Json::String(ns.clone()));
            }
            let _ = body.set_path(&["metadata", "generation"], Json::from(1));
            let _ = body.delete_path(&["status"]);
            if dry_run {
                let _ = body.delete_path(&["metadata", "resourceVersion"]);
            } else {
                let rv = st.bump_rv();
                let _ = body.set_path(&["metadata", "resourceVersion"], Json::String(rv));
                let _ = body.set_path(&["metadata", "uid"], Json::String(format!("uid-{}", st.next_rv)));
                if let Some(ns) = &reference.namespace {
                    st.namespaces.insert(ns.clone());
                }
                st.objects.insert(key_of(&reference), body.clone());
            }
            (reference, body)
        };
        let (reference, body) = created;
        if !dry_run {
            self.emit(&reference, WatchEvent::Applied(body.clone()));
        }
        Object::from_json(body).map_err(|e| ClusterError::Encoding(e.to_string()))
    }

    async fn update(&self, object: &Object, dry_run: bool) -> Result<Object, ClusterError> {
        let updated = {
            let mut st = self.lock();
            st.record(Action::Update, object.reference().to_string(), dry_run);
            if dry_run && st.rejects_dry_run {
                return Err(dry_run_rejected());
            }
            st.injected(Action::Update, object.name())?;
            st.served(object.gvk())?;
            let reference = st.place(object.reference());
            let key = key_of(&reference);
            let stored = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(reference.to_string()))?;
            let stored_rv = stored.get_str(&["metadata", "resourceVersion"]).unwrap_or_default().to_string();
            if let Some(rv) = object.resource_version() {
                if rv != stored_rv {
                    return Err(ClusterError::remote(409, format!("{reference}: resourceVersion {rv} is stale (now {stored_rv})")));
                }
            }
            let mut body = object.body().clone();
            if let Some(ns) = &reference.namespace {
                let _ = body.set_path(&["metadata", "namespace"], Json::String(ns.clone()));
            }
            let generation = stored.get_i64(&["metadata", "generation"]).unwrap_or(1);
            let generation = if spec_view(&stored) != spec_view(&body) { generation + 1 } else { generation };
            let _ = body.set_path(&["metadata", "generation"], Json::from(generation));
            match stored.get_path(&["status"]) {
                Some(status) => {
                    let _ = body.set_path(&["status"], status.clone());
                }
                None => {
                    let _ = body.delete_path(&["status"]);
                }
            }
            if let Some(uid) = stored.get_path(&["metadata", "uid"]) {
                let _ = body.set_path(&["metadata", "uid"], uid.clone());
            }
            if dry_run {
                let _ = body.set_path(&["metadata", "resourceVersion"], Json::String(stored_rv));
            } else {
                let rv = st.bump_rv();
                let _ = body.set_path(&["metadata", "resourceVersion"], Json::String(rv));
                st.objects.insert(key, body.clone());
            }
            (reference, body)
        };
        let (reference, body) = updated;
        if !dry_run {
            self.emit(&reference, WatchEvent::Applied(body.clone()));
        }
        Object::from_json(body).map_err(|e| ClusterError::Encoding(e.to_string()))
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), ClusterError> {
        let (placed, body) = {
            let mut st = self.lock();
            st.record(Action::Delete, reference.to_string(), false);
            st.injected(Action::Delete, &reference.name)?;
            st.served(&reference.gvk)?;
            let placed = st.place(reference);
            let body = st.objects.remove(&key_of(&placed)).ok_or_else(|| ClusterError::NotFound(reference.to_string()))?;
            (placed, body)
        };
        self.emit(&placed, WatchEvent::Deleted(body));
        Ok(())
    }

    async fn list(&self, gvk: &ResourceIdentity, namespace: Option<&str>, options: &ListOptions) -> Result<Page<Json>, ClusterError> {
        let mut st = self.lock();
        st.record(Action::List, format!("{gvk} {}", namespace.unwrap_or("")), false);
        st.injected(Action::List, &gvk.kind_lower())?;
        st.served(gvk)?;
        let (g, v, k) = gvk.normalized();
        let all: Vec<Json> = st
            .objects
            .iter()
            .filter(|((og, ov, ok, ns, _), _)| *og == g && *ov == v && *ok == k && namespace.map_or(true, |want| want == ns))
            .filter(|(_, body)| matches_selector(body, options.label_selector.as_deref()))
            .map(|(_, body)| {
                let mut item = body.clone();
                if let Some(map) = item.as_object_mut() {
                    map.remove("apiVersion");
                    map.remove("kind");
                }
                crate::fill_type_meta(&mut item, gvk);
                item
            })
            .collect();
        page(all, options, st.page_size)
    }

    async fn list_namespaces(&self, options: &ListOptions) -> Result<Page<String>, ClusterError> {
        let mut st = self.lock();
        st.record(Action::ListNamespaces, String::new(), false);
        st.injected(Action::ListNamespaces, "")?;
        let all: Vec<String> = st.namespaces.iter().cloned().collect();
        page(all, options, st.page_size)
    }

    async fn watch(&self, reference: &ObjectReference) -> Result<WatchStream, ClusterError> {
        let placed = {
            let mut st = self.lock();
            st.record(Action::Watch, reference.to_string(), false);
            st.injected(Action::Watch, &reference.name)?;
            st.served(&reference.gvk)?;
            st.place(reference)
        };
        let rx = {
            let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
            events.as_ref().map(broadcast::Sender::subscribe)
        };
        let Some(rx) = rx else { return Ok(futures::stream::empty().boxed()) };
        let stream = futures::stream::unfold((rx, placed), |(mut rx, target)| async move {
            loop {
                match rx.recv().await {
                    Ok((r, ev)) if r == target => return Some((Ok(ev), (rx, target))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, data: &str) -> Object {
        Object::from_json(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "prod", "labels": {"app": "shop"}},
            "data": {"k": data}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_update_bookkeeping() {
        let m = MockCluster::new();
        let created = m.create(&cm("a", "1"), false).await.unwrap();
        assert_eq!(created.generation(), Some(1));
        assert!(m.create(&cm("a", "1"), false).await.unwrap_err().code() == Some(409));

        let same = m.update(&cm("a", "1"), false).await.unwrap();
        assert_eq!(same.generation(), Some(1));
        let changed = m.update(&cm("a", "2"), false).await.unwrap();
        assert_eq!(changed.generation(), Some(2));

        let mut stale = cm("a", "3");
        stale.set_path(&["metadata", "resourceVersion"], json!(created.resource_version().unwrap())).unwrap();
        assert_eq!(m.update(&stale, false).await.unwrap_err().code(), Some(409));
    }

    #[tokio::test]
    async fn dry_runs_do_not_store() {
        let m = MockCluster::new();
        m.create(&cm("a", "1"), true).await.unwrap();
        assert!(m.is_empty());
        m.reject_dry_run();
        assert!(m.create(&cm("a", "1"), true).await.unwrap_err().rejects_dry_run());
    }

    #[tokio::test]
    async fn lists_page_and_filter() {
        let m = MockCluster::new().with_page_size(2);
        for n in ["a", "b", "c"] {
            m.create(&cm(n, "1"), false).await.unwrap();
        }
        m.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "prod"}}));
        let gvk: ResourceIdentity = "v1/ConfigMap".parse().unwrap();
        let opts = ListOptions::default().labels("app=shop");
        let first = m.list(&gvk, Some("prod"), &opts).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0]["kind"], "ConfigMap");
        let second = m.list(&gvk, Some("prod"), &opts.clone().continue_from(first.continue_token)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.continue_token, None);
        assert!(m.list(&gvk, Some("other"), &opts).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn watch_sees_later_changes_of_its_object_only() {
        let m = MockCluster::new();
        let a = m.create(&cm("a", "1"), false).await.unwrap();
        let mut w = m.watch(a.reference()).await.unwrap();
        m.create(&cm("b", "1"), false).await.unwrap();
        m.set_status(a.reference(), json!({"phase": "Done"}));
        match w.next().await {
            Some(Ok(WatchEvent::Applied(body))) => assert_eq!(body["status"]["phase"], "Done"),
            other => panic!("unexpected {other:?}"),
        }
        m.close_watches();
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_failures() {
        let m = MockCluster::new();
        m.fail_once(Action::Create, "a", ClusterError::remote(500, "boom"));
        assert!(m.create(&cm("a", "1"), false).await.is_err());
        assert!(m.create(&cm("a", "1"), false).await.is_ok());
        assert_eq!(m.count(Action::Create), 2);
    }
}
