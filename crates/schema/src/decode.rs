//! Multi-document decoder: rendered `(name, bytes)` documents in, objects out.

use anyhow::{Context, Result};
use serde_json::Value as Json;
use tracing::{debug, trace};

use kubor_core::{Object, Project, ResourceIdentity};
use kubor_kubehub::Scope;

use crate::{DecodeError, SchemaRegistry};

/// One decoded object and where it came from (`name#fragment`).
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub source: String,
    pub object: Object,
    /// Checked against a known schema (as opposed to an ignored unknown kind).
    pub typed: bool,
}

fn is_separator(line: &str) -> bool {
    let l = line.trim_end();
    l == "---" || (l.starts_with("---") && l[3..].starts_with(char::is_whitespace))
}

/// Split a YAML stream on `---` lines. Fragments keep their position, blank ones included.
pub fn split_documents(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut start, mut offset) = (0, 0);
    for line in text.split_inclusive('\n') {
        if is_separator(line) {
            out.push(&text[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    out.push(&text[start..]);
    out
}

fn is_blank(fragment: &str) -> bool {
    fragment.lines().map(str::trim).all(|l| l.is_empty() || l.starts_with('#') || l == "...")
}

fn is_crd(gvk: &ResourceIdentity) -> bool {
    gvk.same_group_kind(&ResourceIdentity::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition"))
}

pub struct Decoder<'a> {
    schemas: SchemaRegistry,
    project: &'a Project,
}

impl<'a> Decoder<'a> {
    pub fn new(schemas: SchemaRegistry, project: &'a Project) -> Self { Self { schemas, project } }

    pub fn schemas(&self) -> &SchemaRegistry { &self.schemas }

    /// Decode one fragment. `v1/List` documents expand to their items.
    pub fn decode(&self, fragment: &str) -> Result<Vec<(Object, bool)>, DecodeError> {
        let value: Json = serde_yaml::from_str(fragment)?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let is_list = value.get("kind").and_then(Json::as_str) == Some("List") && value.get("items").is_some_and(Json::is_array);
        if is_list {
            let items = value.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
            return items.into_iter().map(|item| self.decode_value(item)).collect();
        }
        Ok(vec![self.decode_value(value)?])
    }

    fn decode_value(&self, value: Json) -> Result<(Object, bool), DecodeError> {
        let mut object = Object::from_json(value)?;
        let (scope, typed) = match self.schemas.check(&object) {
            Ok(scope) => (Some(scope), true),
            Err(DecodeError::NotRegistered(gvk)) if self.project.ignores_unknown(&gvk) => {
                trace!(gvk = %gvk, "decoding untyped");
                (None, false)
            }
            Err(DecodeError::NotRegistered(gvk)) => return Err(DecodeError::UnknownKind(gvk)),
            Err(e) => return Err(e),
        };
        if let (Some(Scope::Namespaced), None, Some(ns)) = (scope, object.namespace(), self.project.default_namespace.as_deref()) {
            object.set_namespace(ns)?;
        }
        Ok((object, typed))
    }

    /// Decode every document and hand each object to `handler`, in order.
    /// The first decode or handler error ends the pass. Returns the object count.
    pub fn dispatch<I, F>(&mut self, documents: I, mut handler: F) -> Result<usize>
    where
        I: IntoIterator<Item = Result<(String, Vec<u8>)>>,
        F: FnMut(Decoded) -> Result<()>,
    {
        let mut count = 0;
        for document in documents {
            let (name, bytes) = document?;
            let text = std::str::from_utf8(&bytes).with_context(|| format!("{name} is not UTF-8"))?;
            for (idx, fragment) in split_documents(text).into_iter().enumerate() {
                if is_blank(fragment) {
                    continue;
                }
                let source = format!("{name}#{idx}");
                let objects = self.decode(fragment).with_context(|| format!("decoding {source}"))?;
                for (object, typed) in objects {
                    if is_crd(object.gvk()) {
                        self.schemas.register_crd(&object);
                    }
                    debug!(source = %source, object = %object.reference(), typed, "decoded");
                    handler(Decoded { source: source.clone(), object, typed }).with_context(|| format!("handling {source}"))?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn decode_all<I>(&mut self, documents: I) -> Result<Vec<Decoded>>
    where
        I: IntoIterator<Item = Result<(String, Vec<u8>)>>,
    {
        let mut out = Vec::new();
        self.dispatch(documents, |d| {
            out.push(d);
            Ok(())
        })?;
        Ok(out)
    }
}
