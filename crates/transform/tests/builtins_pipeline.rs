use serde_json::json;

use kubor_core::project::LabelAction;
use kubor_core::{Object, Project};
use kubor_transform::{Context, Environment, Pipeline};

fn obj(v: serde_json::Value) -> Object { Object::from_json(v).unwrap() }

fn project() -> Project {
    let mut p = Project { group_id: "acme".into(), artifact_id: "shop".into(), release: "1.4.0".into(), ..Project::default() };
    p.labels.release.action = LabelAction::SetIfAbsent;
    p
}

fn live_service() -> Object {
    obj(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "web", "namespace": "prod", "resourceVersion": "812"},
        "spec": {
            "type": "NodePort",
            "clusterIP": "10.0.0.5",
            "clusterIPs": ["10.0.0.5"],
            "ports": [
                {"name": "http", "port": 80, "nodePort": 30080},
                {"name": "metrics", "port": 9090, "nodePort": 30090}
            ]
        }
    }))
}

#[test]
fn cluster_ip_is_carried_when_target_omits_it() {
    let mut target = obj(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "web", "namespace": "prod"},
        "spec": {"type": "NodePort", "ports": [{"name": "metrics", "port": 9090}, {"name": "http", "port": 80, "nodePort": 31000}]}
    }));
    let ctx = Context::new(project(), Environment::default());
    Pipeline::with_builtins().run_update(&ctx, &live_service(), &mut target).unwrap();

    assert_eq!(target.get_str(&["spec", "clusterIP"]), Some("10.0.0.5"));
    assert_eq!(target.get_path(&["spec", "ports", "0", "nodePort"]), Some(&json!(30090)));
    assert_eq!(target.get_path(&["spec", "ports", "1", "nodePort"]), Some(&json!(31000)));
    assert_eq!(target.resource_version(), Some("812"));
}

#[test]
fn cluster_ip_in_target_wins() {
    let mut target = obj(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "web", "namespace": "prod"},
        "spec": {"clusterIP": "10.0.0.9", "ports": [{"name": "http", "port": 80}]}
    }));
    let ctx = Context::new(project(), Environment::default());
    Pipeline::with_builtins().run_update(&ctx, &live_service(), &mut target).unwrap();

    assert_eq!(target.get_str(&["spec", "clusterIP"]), Some("10.0.0.9"));
    // ClusterIP services have no node ports to keep.
    assert!(target.is_unset(&["spec", "ports", "0", "nodePort"]));
}

#[test]
fn preservation_can_be_switched_off_per_object() {
    let mut target = obj(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "web", "namespace": "prod",
            "annotations": {"transformation.kubor.echocat.org/preserve-service-fields": "disabled"}},
        "spec": {"type": "NodePort"}
    }));
    Pipeline::with_builtins().run_update(&Context::default(), &live_service(), &mut target).unwrap();
    assert!(target.is_unset(&["spec", "clusterIP"]));
}

#[test]
fn ownership_labels_reach_pod_templates() {
    let mut target = obj(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "labels": {"kubor.echocat.org/release": "pinned"}},
        "spec": {"template": {"metadata": {"labels": {"app": "web"}}, "spec": {}}}
    }));
    let ctx = Context::new(project(), Environment::default());
    Pipeline::with_builtins().run_create(&ctx, &mut target).unwrap();

    assert_eq!(target.label("kubor.echocat.org/group-id"), Some("acme"));
    assert_eq!(target.label("kubor.echocat.org/release"), Some("pinned"));
    let template = |key: &str| target.get_str(&["spec", "template", "metadata", "labels", key]).map(str::to_string);
    assert_eq!(template("kubor.echocat.org/artifact-id").as_deref(), Some("shop"));
    assert_eq!(template("kubor.echocat.org/release").as_deref(), Some("1.4.0"));
    assert_eq!(template("app").as_deref(), Some("web"));
}

#[test]
fn ownership_label_argument_overrides_the_project() {
    let mut target = obj(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "c",
            "labels": {"kubor.echocat.org/group-id": "old"},
            "annotations": {"transformation.kubor.echocat.org/ownership-labels": "drop"}}
    }));
    let ctx = Context::new(project(), Environment::default());
    Pipeline::with_builtins().run_create(&ctx, &mut target).unwrap();
    assert!(target.labels().is_empty());

    let mut bad = obj(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "c", "annotations": {"transformation.kubor.echocat.org/ownership-labels": "enabled:sometimes"}}
    }));
    let err = Pipeline::with_builtins().run_create(&ctx, &mut bad).unwrap_err();
    assert_eq!(err.name, "ownership-labels");
    assert_eq!(err.argument, "sometimes");
}
