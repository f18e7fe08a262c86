//! Built-in transformations.
//!
//! Update-time handlers that copy fields from the live object act only when
//! live and target share the same resource identity; a changed API version
//! alone must not carry fields across schemas.

use serde_json::Value as Json;

use kubor_core::annotations::{is_bookkeeping, LABEL_ARTIFACT_ID, LABEL_GROUP_ID, LABEL_RELEASE};
use kubor_core::project::{AnnotationAction, LabelAction};
use kubor_core::{Object, PathError};

use crate::{BoxError, Context, Environment, Transformation};

pub const PRESERVE_RESOURCE_VERSION: &str = "preserve-resource-version";
pub const PRESERVE_SERVICE_FIELDS: &str = "preserve-service-fields";
pub const PRESERVE_SERVICE_ACCOUNT_SECRETS: &str = "preserve-service-account-secrets";
pub const OWNERSHIP_LABELS: &str = "ownership-labels";
pub const CI_PROVENANCE: &str = "ci-provenance";
pub const BOOKKEEPING_ANNOTATIONS: &str = "bookkeeping-annotations";

pub const ANNOTATION_CI_COMMIT: &str = "ci.kubor.echocat.org/commit";
pub const ANNOTATION_CI_REPOSITORY: &str = "ci.kubor.echocat.org/repository";
pub const ANNOTATION_CI_BUILD: &str = "ci.kubor.echocat.org/build";
pub const ANNOTATION_CI_REF: &str = "ci.kubor.echocat.org/ref";

pub fn all() -> Vec<Transformation> {
    vec![
        preserve_resource_version(),
        preserve_service_fields(),
        preserve_service_account_secrets(),
        ownership_labels(),
        ci_provenance(),
        bookkeeping_annotations(),
    ]
}

fn is_kind(o: &Object, group: &str, kind: &str) -> bool {
    o.gvk().group.eq_ignore_ascii_case(group) && o.gvk().kind.eq_ignore_ascii_case(kind)
}

fn same_identity(existing: &Object, target: &Object) -> bool { existing.gvk() == target.gvk() }

/// Copy `path` from `existing` when the target leaves it unset.
fn copy_if_unset(existing: &Object, target: &mut Object, path: &[&str]) -> Result<bool, PathError> {
    if !target.is_unset(path) || existing.is_unset(path) {
        return Ok(false);
    }
    match existing.get_path(path) {
        Some(v) => {
            target.set_path(path, v.clone())?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn preserve_resource_version() -> Transformation {
    Transformation::unchecked(PRESERVE_RESOURCE_VERSION, 0).on_update(|_, existing, target, _| {
        if same_identity(existing, target) {
            copy_if_unset(existing, target, &["metadata", "resourceVersion"])?;
        }
        Ok(())
    })
}

fn same_port(live: &Json, wanted: &Json) -> bool {
    let name = |v: &Json| v.get("name").and_then(Json::as_str).unwrap_or("").to_string();
    let protocol = |v: &Json| v.get("protocol").and_then(Json::as_str).unwrap_or("TCP").to_string();
    if !name(live).is_empty() || !name(wanted).is_empty() {
        return name(live) == name(wanted);
    }
    live.get("port") == wanted.get("port") && protocol(live) == protocol(wanted)
}

fn preserve_node_ports(existing: &Object, target: &mut Object) -> Result<(), PathError> {
    let Some(live) = existing.get_path(&["spec", "ports"]).and_then(Json::as_array).cloned() else { return Ok(()) };
    let count = target.get_path(&["spec", "ports"]).and_then(Json::as_array).map_or(0, Vec::len);
    for i in 0..count {
        let idx = i.to_string();
        let node_port = ["spec", "ports", idx.as_str(), "nodePort"];
        if !target.is_unset(&node_port) {
            continue;
        }
        let wanted = target.get_path(&["spec", "ports", idx.as_str()]).cloned().unwrap_or(Json::Null);
        let carried = live.iter().find(|l| same_port(l, &wanted)).and_then(|l| l.get("nodePort")).filter(|v| !v.is_null());
        if let Some(v) = carried {
            target.set_path(&node_port, v.clone())?;
        }
    }
    Ok(())
}

/// Keep server-allocated Service fields the API refuses to change or re-allocates.
pub fn preserve_service_fields() -> Transformation {
    Transformation::unchecked(PRESERVE_SERVICE_FIELDS, 10)
        .enabled_when(|_, t| is_kind(t, "", "Service"))
        .on_update(|_, existing, target, _| {
            if !same_identity(existing, target) || !is_kind(target, "", "Service") {
                return Ok(());
            }
            copy_if_unset(existing, target, &["spec", "clusterIP"])?;
            copy_if_unset(existing, target, &["spec", "clusterIPs"])?;
            let service_type = target.get_str(&["spec", "type"]).unwrap_or("ClusterIP").to_string();
            if service_type == "LoadBalancer" {
                copy_if_unset(existing, target, &["spec", "healthCheckNodePort"])?;
            }
            if matches!(service_type.as_str(), "NodePort" | "LoadBalancer") {
                preserve_node_ports(existing, target)?;
            }
            Ok(())
        })
}

/// Keep token secrets the controller attached to a ServiceAccount.
pub fn preserve_service_account_secrets() -> Transformation {
    Transformation::unchecked(PRESERVE_SERVICE_ACCOUNT_SECRETS, 10)
        .enabled_when(|_, t| is_kind(t, "", "ServiceAccount"))
        .on_update(|_, existing, target, _| {
            if same_identity(existing, target) && is_kind(target, "", "ServiceAccount") {
                copy_if_unset(existing, target, &["secrets"])?;
                copy_if_unset(existing, target, &["imagePullSecrets"])?;
            }
            Ok(())
        })
}

fn set_label(target: &mut Object, base: &[&str], key: &str, value: &str, action: LabelAction) -> Result<(), PathError> {
    let mut path = base.to_vec();
    path.push(key);
    let present = target.get_path(&path).is_some();
    let set = match action {
        LabelAction::Set => !value.is_empty(),
        LabelAction::SetIfAbsent => !present && !value.is_empty(),
        LabelAction::SetIfExists => present,
        LabelAction::Leave => false,
        LabelAction::Drop => {
            target.delete_path(&path)?;
            false
        }
    };
    if set {
        target.set_path(&path, Json::String(value.to_string()))?;
    }
    Ok(())
}

fn apply_ownership_labels(ctx: &Context, target: &mut Object, argument: Option<&str>) -> Result<(), BoxError> {
    let forced: Option<LabelAction> = argument.map(str::parse).transpose()?;
    let p = &ctx.project;
    let labels = [
        (LABEL_GROUP_ID, p.group_id.as_str(), p.labels.group_id.action),
        (LABEL_ARTIFACT_ID, p.artifact_id.as_str(), p.labels.artifact_id.action),
        (LABEL_RELEASE, p.release.as_str(), p.labels.release.action),
    ];
    let has_template = target.get_path(&["spec", "template"]).is_some_and(Json::is_object);
    for (key, value, action) in labels {
        let action = forced.unwrap_or(action);
        set_label(target, &["metadata", "labels"], key, value, action)?;
        if has_template {
            set_label(target, &["spec", "template", "metadata", "labels"], key, value, action)?;
        }
    }
    Ok(())
}

/// Group, artifact and release labels; also on pod templates.
pub fn ownership_labels() -> Transformation {
    Transformation::unchecked(OWNERSHIP_LABELS, 50)
        .on_create(apply_ownership_labels)
        .on_update(|ctx, _, target, argument| apply_ownership_labels(ctx, target, argument))
}

fn provenance(env: &Environment) -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    let mut push = |key: &'static str, value: Option<String>| {
        if let Some(v) = value {
            out.push((key, v));
        }
    };
    if let Some(sha) = env.get("GITHUB_SHA") {
        let server = env.get("GITHUB_SERVER_URL").unwrap_or("https://github.com");
        let repo = env.get("GITHUB_REPOSITORY");
        push(ANNOTATION_CI_COMMIT, Some(sha.to_string()));
        push(ANNOTATION_CI_REPOSITORY, repo.map(|r| format!("{server}/{r}")));
        push(
            ANNOTATION_CI_BUILD,
            repo.zip(env.get("GITHUB_RUN_ID")).map(|(r, id)| format!("{server}/{r}/actions/runs/{id}")),
        );
        push(ANNOTATION_CI_REF, env.get("GITHUB_REF").map(str::to_string));
    } else if let Some(sha) = env.get("CI_COMMIT_SHA") {
        push(ANNOTATION_CI_COMMIT, Some(sha.to_string()));
        push(ANNOTATION_CI_REPOSITORY, env.get("CI_PROJECT_URL").map(str::to_string));
        push(ANNOTATION_CI_BUILD, env.get("CI_JOB_URL").map(str::to_string));
        push(ANNOTATION_CI_REF, env.get("CI_COMMIT_REF_NAME").map(str::to_string));
    } else {
        push(ANNOTATION_CI_COMMIT, env.get("CI_COMMIT").map(str::to_string));
        push(ANNOTATION_CI_REPOSITORY, env.get("CI_REPOSITORY").map(str::to_string));
        push(ANNOTATION_CI_BUILD, env.get("CI_BUILD_URL").map(str::to_string));
        push(ANNOTATION_CI_REF, env.get("CI_REF").map(str::to_string));
    }
    out
}

fn annotate_provenance(ctx: &Context, target: &mut Object) -> Result<(), BoxError> {
    for (key, value) in provenance(&ctx.env) {
        target.set_path(&["metadata", "annotations", key], Json::String(value))?;
    }
    Ok(())
}

/// Commit, repository, build and ref of the CI run doing the apply.
pub fn ci_provenance() -> Transformation {
    Transformation::unchecked(CI_PROVENANCE, 60)
        .enabled_when(|ctx, _| ctx.env.get("CI").is_some())
        .on_create(|ctx, target, _| annotate_provenance(ctx, target))
        .on_update(|ctx, _, target, _| annotate_provenance(ctx, target))
}

fn strip_bookkeeping(ctx: &Context, target: &mut Object, argument: Option<&str>) -> Result<(), BoxError> {
    let action = match argument {
        Some(a) => a.parse::<AnnotationAction>()?,
        None => ctx.project.annotations.action,
    };
    if action == AnnotationAction::Leave {
        return Ok(());
    }
    let keys: Vec<String> = target.annotations().into_keys().filter(|k| is_bookkeeping(k)).collect();
    for key in &keys {
        target.delete_path(&["metadata", "annotations", key])?;
    }
    if !keys.is_empty() && target.is_unset(&["metadata", "annotations"]) {
        target.delete_path(&["metadata", "annotations"])?;
    }
    Ok(())
}

/// Drop (or leave) kubor's own annotations. Runs last so every other
/// transformation still sees its directive.
pub fn bookkeeping_annotations() -> Transformation {
    Transformation::unchecked(BOOKKEEPING_ANNOTATIONS, 1000)
        .on_create(strip_bookkeeping)
        .on_update(|ctx, _, target, argument| strip_bookkeeping(ctx, target, argument))
}
