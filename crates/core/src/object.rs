//! Untyped resource documents addressed by an [`ObjectReference`].

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::document::PathExt;
use crate::error::{ObjectError, PathError};
use crate::gvk::{ObjectReference, ResourceIdentity};

/// A desired or live resource: the manifest plus its decoded reference.
///
/// Identity fields (`apiVersion`, `kind`, `metadata.name`,
/// `metadata.namespace`) can only change through [`Object::set_namespace`],
/// so the reference never drifts from the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    reference: ObjectReference,
    body: Json,
}

const IDENTITY_PATHS: [&[&str]; 4] = [&["apiVersion"], &["kind"], &["metadata", "name"], &["metadata", "namespace"]];

impl Object {
    pub fn from_json(body: Json) -> Result<Self, ObjectError> {
        if !body.is_object() {
            return Err(ObjectError::NotAMap);
        }
        let api_version = body.get_str(&["apiVersion"]).filter(|s| !s.is_empty()).ok_or(ObjectError::Missing("apiVersion"))?;
        let kind = body.get_str(&["kind"]).filter(|s| !s.is_empty()).ok_or(ObjectError::Missing("kind"))?;
        let name = body.get_str(&["metadata", "name"]).filter(|s| !s.is_empty()).ok_or(ObjectError::Missing("metadata.name"))?;
        let gvk = ResourceIdentity::from_api_version(api_version, kind);
        let reference = ObjectReference::new(gvk, body.get_str(&["metadata", "namespace"]), name);
        Ok(Self { reference, body })
    }

    pub fn reference(&self) -> &ObjectReference { &self.reference }
    pub fn gvk(&self) -> &ResourceIdentity { &self.reference.gvk }
    pub fn name(&self) -> &str { &self.reference.name }
    pub fn namespace(&self) -> Option<&str> { self.reference.namespace.as_deref() }
    pub fn body(&self) -> &Json { &self.body }
    pub fn into_json(self) -> Json { self.body }

    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), PathError> {
        self.body.set_path(&["metadata", "namespace"], Json::String(namespace.to_string()))?;
        self.reference.namespace = Some(namespace.to_string());
        Ok(())
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Json> { self.body.get_path(path) }
    pub fn get_str(&self, path: &[&str]) -> Option<&str> { self.body.get_str(path) }
    pub fn is_unset(&self, path: &[&str]) -> bool { self.body.is_unset(path) }

    pub fn set_path(&mut self, path: &[&str], value: Json) -> Result<Option<Json>, PathError> {
        guard_identity(path)?;
        self.body.set_path(path, value)
    }

    pub fn delete_path(&mut self, path: &[&str]) -> Result<Option<Json>, PathError> {
        guard_identity(path)?;
        self.body.delete_path(path)
    }

    pub fn generation(&self) -> Option<i64> { self.body.get_i64(&["metadata", "generation"]) }
    pub fn resource_version(&self) -> Option<&str> { self.body.get_str(&["metadata", "resourceVersion"]) }

    pub fn label(&self, key: &str) -> Option<&str> { self.body.get_str(&["metadata", "labels", key]) }
    pub fn annotation(&self, key: &str) -> Option<&str> { self.body.get_str(&["metadata", "annotations", key]) }

    pub fn labels(&self) -> BTreeMap<String, String> { string_map(self.body.get_path(&["metadata", "labels"])) }
    pub fn annotations(&self) -> BTreeMap<String, String> { string_map(self.body.get_path(&["metadata", "annotations"])) }
}

fn guard_identity(path: &[&str]) -> Result<(), PathError> {
    let touches = IDENTITY_PATHS.iter().any(|id| path.len() <= id.len() && id.starts_with(path))
        || path.is_empty();
    if touches {
        return Err(PathError::Protected(path.join(".")));
    }
    Ok(())
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(Json::as_object)
        .map(|m: &Map<String, Json>| {
            m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Object {
        Object::from_json(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod", "generation": 3, "labels": {"a": "1", "n": 5}},
            "spec": {"replicas": 2}
        }))
        .unwrap()
    }

    #[test]
    fn decodes_reference() {
        let o = deployment();
        assert_eq!(o.reference().to_string(), "apps/v1/Deployment prod/web");
        assert_eq!(o.generation(), Some(3));
        assert_eq!(o.labels().len(), 1);
    }

    #[test]
    fn missing_fields_are_reported() {
        assert_eq!(Object::from_json(json!([])), Err(ObjectError::NotAMap));
        assert_eq!(Object::from_json(json!({"kind": "X"})), Err(ObjectError::Missing("apiVersion")));
        assert_eq!(
            Object::from_json(json!({"apiVersion": "v1", "kind": "X", "metadata": {}})),
            Err(ObjectError::Missing("metadata.name"))
        );
    }

    #[test]
    fn identity_fields_are_guarded() {
        let mut o = deployment();
        assert!(o.set_path(&["metadata", "name"], json!("other")).is_err());
        assert!(o.delete_path(&["metadata"]).is_err());
        assert!(o.set_path(&["metadata", "labels", "b"], json!("2")).is_ok());
        o.set_namespace("staging").unwrap();
        assert_eq!(o.namespace(), Some("staging"));
        assert_eq!(o.get_str(&["metadata", "namespace"]), Some("staging"));
    }
}
