//! Kubor transformation pipeline.
//!
//! A [`Transformation`] rewrites a target object before it is sent to the API
//! server, standalone on create or with the live object at hand on update.
//! The [`Pipeline`] runs them by ascending priority (ties by name), each one
//! switchable per object through the annotation
//! `transformation.kubor.echocat.org/<name>`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::trace;

use kubor_core::annotations::TRANSFORMATION_PREFIX;
use kubor_core::{Object, Project, ValidationError};

pub mod builtins;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type EnabledFn = Arc<dyn Fn(&Context, &Object) -> bool + Send + Sync>;
pub type CreateFn = Arc<dyn Fn(&Context, &mut Object, Option<&str>) -> Result<(), BoxError> + Send + Sync>;
pub type UpdateFn = Arc<dyn Fn(&Context, &Object, &mut Object, Option<&str>) -> Result<(), BoxError> + Send + Sync>;

/// Process environment as seen by transformations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self { Self { vars: std::env::vars().collect() } }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self { vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Everything a handler may consult besides the objects themselves.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub project: Project,
    pub env: Environment,
}

impl Context {
    pub fn new(project: Project, env: Environment) -> Self { Self { project, env } }
}

#[derive(Debug, Error)]
#[error("transformation {name} failed (argument: {argument})")]
pub struct TransformError {
    pub name: String,
    pub argument: String,
    #[source]
    pub source: BoxError,
}

static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > 63 || !NAME.is_match(name) {
        return Err(ValidationError::TransformationName(name.to_string()));
    }
    Ok(())
}

/// Per-object switch for one transformation, parsed from its annotation value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Absent or empty: the transformation's own default applies.
    Default,
    Enabled(Option<String>),
    Disabled(Option<String>),
}

impl Directive {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else { return Self::Default };
        let (head, argument) = match value.split_once(':') {
            Some((h, a)) => (h, Some(a.to_string()).filter(|a| !a.is_empty())),
            None => (value, None),
        };
        if head.eq_ignore_ascii_case("enabled") {
            Self::Enabled(argument)
        } else if head.eq_ignore_ascii_case("disabled") {
            Self::Disabled(argument)
        } else {
            Self::Enabled(Some(value.to_string()))
        }
    }

    pub fn for_object(object: &Object, name: &str) -> Self {
        Self::parse(object.annotation(&annotation_key(name)))
    }

    pub fn enabled(&self) -> Option<bool> {
        match self {
            Self::Default => None,
            Self::Enabled(_) => Some(true),
            Self::Disabled(_) => Some(false),
        }
    }

    pub fn argument(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Enabled(a) | Self::Disabled(a) => a.as_deref(),
        }
    }
}

pub fn annotation_key(name: &str) -> String { format!("{TRANSFORMATION_PREFIX}{name}") }

#[derive(Clone)]
pub struct Transformation {
    name: String,
    priority: i32,
    default_enabled: EnabledFn,
    on_create: Option<CreateFn>,
    on_update: Option<UpdateFn>,
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformation")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("on_create", &self.on_create.is_some())
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

impl Transformation {
    /// A transformation enabled by default and without handlers yet.
    pub fn new(name: &str, priority: i32) -> Result<Self, ValidationError> {
        validate_name(name)?;
        Ok(Self::unchecked(name, priority))
    }

    pub(crate) fn unchecked(name: &str, priority: i32) -> Self {
        Self { name: name.to_string(), priority, default_enabled: Arc::new(|_, _| true), on_create: None, on_update: None }
    }

    pub fn enabled_when(mut self, f: impl Fn(&Context, &Object) -> bool + Send + Sync + 'static) -> Self {
        self.default_enabled = Arc::new(f);
        self
    }

    pub fn disabled_by_default(self) -> Self { self.enabled_when(|_, _| false) }

    pub fn on_create(mut self, f: impl Fn(&Context, &mut Object, Option<&str>) -> Result<(), BoxError> + Send + Sync + 'static) -> Self {
        self.on_create = Some(Arc::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&Context, &Object, &mut Object, Option<&str>) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn priority(&self) -> i32 { self.priority }

    /// Effective enablement and argument for `target`.
    fn resolve(&self, ctx: &Context, target: &Object) -> (bool, Option<String>) {
        let directive = Directive::for_object(target, &self.name);
        let enabled = directive.enabled().unwrap_or_else(|| (self.default_enabled)(ctx, target));
        (enabled, directive.argument().map(str::to_string))
    }

    fn wrap(&self, argument: Option<&str>, source: BoxError) -> TransformError {
        TransformError { name: self.name.clone(), argument: argument.unwrap_or("<none>").to_string(), source }
    }
}

/// Create-time and update-time transformations, each sorted by (priority, name).
#[derive(Clone, Default, Debug)]
pub struct Pipeline {
    create: Vec<Transformation>,
    update: Vec<Transformation>,
}

fn sort(list: &mut [Transformation]) {
    list.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    /// Pipeline holding every built-in transformation.
    pub fn with_builtins() -> Self {
        let mut p = Self::new();
        for t in builtins::all() {
            p.register(t);
        }
        p
    }

    /// Add `t`, replacing a transformation of the same name.
    pub fn register(&mut self, t: Transformation) {
        self.create.retain(|x| x.name != t.name);
        self.update.retain(|x| x.name != t.name);
        if t.on_create.is_some() {
            self.create.push(t.clone());
            sort(&mut self.create);
        }
        if t.on_update.is_some() {
            self.update.push(t);
            sort(&mut self.update);
        }
    }

    pub fn create_names(&self) -> Vec<&str> { self.create.iter().map(|t| t.name.as_str()).collect() }
    pub fn update_names(&self) -> Vec<&str> { self.update.iter().map(|t| t.name.as_str()).collect() }

    /// Run create-time transformations on `target`. Returns the names that ran.
    pub fn run_create(&self, ctx: &Context, target: &mut Object) -> Result<Vec<String>, TransformError> {
        let mut ran = Vec::new();
        for t in &self.create {
            let (enabled, argument) = t.resolve(ctx, target);
            let Some(handler) = t.on_create.as_ref().filter(|_| enabled) else { continue };
            trace!(transformation = %t.name, object = %target.reference(), "on create");
            handler(ctx, target, argument.as_deref()).map_err(|e| t.wrap(argument.as_deref(), e))?;
            ran.push(t.name.clone());
        }
        Ok(ran)
    }

    /// Run update-time transformations on `target` with the live `existing` object.
    pub fn run_update(&self, ctx: &Context, existing: &Object, target: &mut Object) -> Result<Vec<String>, TransformError> {
        let mut ran = Vec::new();
        for t in &self.update {
            let (enabled, argument) = t.resolve(ctx, target);
            let Some(handler) = t.on_update.as_ref().filter(|_| enabled) else { continue };
            trace!(transformation = %t.name, object = %target.reference(), "on update");
            handler(ctx, existing, target, argument.as_deref()).map_err(|e| t.wrap(argument.as_deref(), e))?;
            ran.push(t.name.clone());
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(annotations: serde_json::Value) -> Object {
        Object::from_json(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "annotations": annotations}})).unwrap()
    }

    #[test]
    fn directive_grammar() {
        assert_eq!(Directive::parse(None), Directive::Default);
        assert_eq!(Directive::parse(Some("")), Directive::Default);
        assert_eq!(Directive::parse(Some("enabled:foo")), Directive::Enabled(Some("foo".into())));
        assert_eq!(Directive::parse(Some("enabled")), Directive::Enabled(None));
        assert_eq!(Directive::parse(Some("disabled")), Directive::Disabled(None));
        assert_eq!(Directive::parse(Some("disabled:x")).argument(), Some("x"));
        assert_eq!(Directive::parse(Some("bar")), Directive::Enabled(Some("bar".into())));
        assert_eq!(Directive::parse(Some("a:b")), Directive::Enabled(Some("a:b".into())));
    }

    #[test]
    fn names_are_validated() {
        assert!(Transformation::new("ownership-labels", 0).is_ok());
        for bad in ["", "-x", "x-", "Upper", "a_b", "a".repeat(64).as_str()] {
            assert!(Transformation::new(bad, 0).is_err(), "{bad}");
        }
    }

    fn mark(label: &'static str) -> impl Fn(&Context, &mut Object, Option<&str>) -> Result<(), BoxError> {
        move |_, t, _| {
            let seen: Vec<String> = t.labels().into_keys().collect();
            t.set_path(&["metadata", "labels", label], json!(seen.join(",")))?;
            Ok(())
        }
    }

    #[test]
    fn lower_priority_runs_first_regardless_of_name() {
        let mut p = Pipeline::new();
        p.register(Transformation::new("aaa", 10).unwrap().on_create(mark("second")));
        p.register(Transformation::new("zzz", 5).unwrap().on_create(mark("first")));
        p.register(Transformation::new("mmm", 5).unwrap().on_create(mark("tie")));
        assert_eq!(p.create_names(), vec!["mmm", "zzz", "aaa"]);

        let mut target = cm(json!({}));
        let ran = p.run_create(&Context::default(), &mut target).unwrap();
        assert_eq!(ran, vec!["mmm", "zzz", "aaa"]);
        assert_eq!(target.label("first"), Some("tie"));
        assert_eq!(target.label("second"), Some("first,tie"));
    }

    #[test]
    fn registering_a_name_again_replaces_it() {
        let mut p = Pipeline::new();
        p.register(Transformation::new("x", 1).unwrap().on_create(mark("a")).on_update(|_, _, _, _| Ok(())));
        p.register(Transformation::new("x", 2).unwrap().on_create(mark("b")));
        assert_eq!(p.create_names(), vec!["x"]);
        assert!(p.update_names().is_empty());
        let mut target = cm(json!({}));
        p.run_create(&Context::default(), &mut target).unwrap();
        assert!(target.label("b").is_some() && target.label("a").is_none());
    }

    #[test]
    fn annotations_override_default_enablement() {
        let mut p = Pipeline::new();
        p.register(Transformation::new("on", 0).unwrap().on_create(mark("on")));
        p.register(Transformation::new("off", 0).unwrap().disabled_by_default().on_create(mark("off")));

        let mut plain = cm(json!({}));
        p.run_create(&Context::default(), &mut plain).unwrap();
        assert!(plain.label("on").is_some() && plain.label("off").is_none());

        let mut flipped = cm(json!({
            "transformation.kubor.echocat.org/on": "disabled",
            "transformation.kubor.echocat.org/off": "enabled",
        }));
        p.run_create(&Context::default(), &mut flipped).unwrap();
        assert!(flipped.label("on").is_none() && flipped.label("off").is_some());
    }

    #[test]
    fn handler_errors_carry_name_and_argument() {
        let mut p = Pipeline::new();
        p.register(Transformation::new("fails", 0).unwrap().on_create(|_, _, arg| Err(format!("cannot use {arg:?}").into())));
        p.register(Transformation::new("never-reached", 1).unwrap().on_create(mark("late")));
        let mut target = cm(json!({"transformation.kubor.echocat.org/fails": "enabled:xyz"}));
        let err = p.run_create(&Context::default(), &mut target).unwrap_err();
        assert_eq!(err.name, "fails");
        assert_eq!(err.argument, "xyz");
        assert!(err.to_string().contains("fails") && err.to_string().contains("xyz"));
        assert!(target.label("late").is_none());
    }
}
