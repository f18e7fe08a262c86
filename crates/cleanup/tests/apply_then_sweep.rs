use std::sync::Arc;
use std::time::Duration;

use kubor_apply::{ApplySet, Engine};
use kubor_cleanup::{Claim, Cleaner, KeepSet, Mode};
use kubor_core::{GvkRegistry, Object, ObjectReference, Project};
use kubor_kubehub::mock::MockCluster;
use kubor_kubehub::{assign_namespace, effective_namespace};
use kubor_schema::{Decoder, SchemaRegistry};
use kubor_transform::{Context, Environment};

const MANIFESTS: &str = "\
apiVersion: monitoring.coreos.com/v1
kind: ServiceMonitor
metadata:
  name: web
  labels:
    kubor.echocat.org/group-id: acme
    kubor.echocat.org/artifact-id: shop
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  labels:
    kubor.echocat.org/group-id: acme
    kubor.echocat.org/artifact-id: shop
";

fn project(default_namespace: Option<&str>) -> Project {
    Project {
        group_id: "acme".into(),
        artifact_id: "shop".into(),
        release: "1".into(),
        ignore_unknown_kinds: vec!["monitoring.coreos.com/v1/ServiceMonitor".into()],
        default_namespace: default_namespace.map(str::to_string),
        ..Project::default()
    }
}

fn decode(project: &Project) -> Vec<Object> {
    let mut decoder = Decoder::new(SchemaRegistry::with_builtins(), project);
    let decoded = decoder.decode_all(vec![Ok::<_, anyhow::Error>(("app.yaml".to_string(), MANIFESTS.as_bytes().to_vec()))]).unwrap();
    decoded.into_iter().map(|d| d.object).collect()
}

/// Decode, place, apply and sweep the way `kubor apply` does.
async fn apply_and_sweep(cluster: &Arc<MockCluster>, project: &Project) -> (String, kubor_cleanup::CleanupReport) {
    let mut batch = decode(project);
    let namespace = effective_namespace(project, cluster.as_ref());
    assign_namespace(cluster.as_ref(), &mut batch, &namespace).await.unwrap();

    let twins = GvkRegistry::with_builtin_catalog();
    let keep = KeepSet::build(&batch, &twins).unwrap();
    let engine = Engine::new(cluster.clone(), Context::new(project.clone(), Environment::default()));
    let mut set = ApplySet::new(&engine);
    for object in batch.iter().cloned() {
        set.push(object).unwrap();
    }
    set.apply(Duration::from_secs(5)).await.unwrap();

    let claim = Claim::from_project(project, &namespace, &batch).unwrap();
    let report = Cleaner::new(cluster.as_ref(), &twins).run(&claim, &keep, Mode::Orphans).await.unwrap();
    (namespace, report)
}

fn reference(gvk: &str, ns: &str, name: &str) -> ObjectReference { ObjectReference::new(gvk.parse().unwrap(), Some(ns), name) }

#[tokio::test]
async fn untyped_objects_land_in_the_project_namespace_and_survive_the_sweep() {
    let cluster = Arc::new(MockCluster::new());
    let (namespace, report) = apply_and_sweep(&cluster, &project(Some("shop"))).await;

    assert_eq!(namespace, "shop");
    let monitor = reference("monitoring.coreos.com/v1/ServiceMonitor", "shop", "web");
    assert!(cluster.contains(&monitor));
    assert!(cluster.contains(&reference("v1/ConfigMap", "shop", "settings")));
    assert!(report.deleted.is_empty(), "deleted {:?}", report.deleted);
    assert!(report.kept.contains(&monitor.to_string()));
}

#[tokio::test]
async fn without_a_project_namespace_the_context_namespace_is_used_throughout() {
    let cluster = Arc::new(MockCluster::new().with_default_namespace("team-a"));
    let (namespace, report) = apply_and_sweep(&cluster, &project(None)).await;

    assert_eq!(namespace, "team-a");
    assert!(cluster.contains(&reference("monitoring.coreos.com/v1/ServiceMonitor", "team-a", "web")));
    assert!(cluster.contains(&reference("v1/ConfigMap", "team-a", "settings")));
    assert!(report.deleted.is_empty(), "deleted {:?}", report.deleted);
    assert_eq!(report.kept.len(), 2);
}
