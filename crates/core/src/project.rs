//! Project configuration (`kubor.yaml`) with `KUBOR_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::annotations::{LABEL_ARTIFACT_ID, LABEL_GROUP_ID, LABEL_RELEASE};
use crate::error::ValidationError;
use crate::gvk::ResourceIdentity;

pub const DEFAULT_PROJECT_FILE: &str = "kubor.yaml";

/// What the ownership-labels transformation does with one label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelAction {
    #[default]
    Set,
    SetIfAbsent,
    SetIfExists,
    Leave,
    Drop,
}

impl std::str::FromStr for LabelAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "set" => Ok(Self::Set),
            "setifabsent" => Ok(Self::SetIfAbsent),
            "setifexists" => Ok(Self::SetIfExists),
            "leave" => Ok(Self::Leave),
            "drop" => Ok(Self::Drop),
            _ => Err(ValidationError::Project(format!("unknown label action {s:?}"))),
        }
    }
}

/// What happens to kubor's own annotations before an object is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationAction {
    #[default]
    Leave,
    Drop,
}

impl std::str::FromStr for AnnotationAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leave" => Ok(Self::Leave),
            "drop" => Ok(Self::Drop),
            _ => Err(ValidationError::Project(format!("unknown annotation action {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelConfig {
    pub action: LabelAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelsConfig {
    pub group_id: LabelConfig,
    pub artifact_id: LabelConfig,
    pub release: LabelConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnnotationsConfig {
    pub action: AnnotationAction,
}

/// Kinds, namespaces and names a project considers its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaimConfig {
    /// `v1/Kind` or `group/v1/Kind`. Empty: the kinds of the desired batch.
    pub kinds: Vec<String>,
    /// Explicit namespaces. Empty: every namespace of the cluster.
    pub namespaces: Vec<String>,
    /// Regular expressions, anchored, applied to discovered namespaces.
    pub namespace_patterns: Vec<String>,
    /// Regular expressions, anchored, applied to object names.
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub group_id: String,
    pub artifact_id: String,
    pub release: String,
    pub labels: LabelsConfig,
    pub annotations: AnnotationsConfig,
    pub claim: ClaimConfig,
    /// Kinds without a known schema that may still be applied untyped.
    pub ignore_unknown_kinds: Vec<String>,
    pub default_namespace: Option<String>,
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Page size for list calls.
    pub list_limit: u32,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            artifact_id: String::new(),
            release: String::new(),
            labels: LabelsConfig::default(),
            annotations: AnnotationsConfig::default(),
            claim: ClaimConfig::default(),
            ignore_unknown_kinds: Vec::new(),
            default_namespace: None,
            wait_timeout: Duration::from_secs(300),
            list_limit: 500,
        }
    }
}

static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("static regex"));

/// Kubernetes label value grammar: at most 63 characters, alphanumeric at both ends.
pub fn validate_label_value(key: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 || !LABEL_VALUE.is_match(value) {
        return Err(ValidationError::LabelValue { key: key.to_string(), value: value.to_string() });
    }
    Ok(())
}

/// Compile an anchored pattern.
pub fn anchored(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| ValidationError::Pattern { pattern: pattern.to_string(), reason: e.to_string() })
}

impl Project {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let project: Project = serde_yaml::from_str(yaml).context("parsing project file")?;
        Ok(project)
    }

    /// Load `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut project = if path.exists() {
            let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml(&yaml).with_context(|| format!("loading {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "project file not found; using defaults and environment");
            Self::default()
        };
        project.apply_env(|k| std::env::var(k).ok())?;
        project.validate()?;
        Ok(project)
    }

    /// Apply `KUBOR_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ValidationError> {
        if let Some(v) = var("KUBOR_GROUP_ID") { self.group_id = v; }
        if let Some(v) = var("KUBOR_ARTIFACT_ID") { self.artifact_id = v; }
        if let Some(v) = var("KUBOR_RELEASE") { self.release = v; }
        if let Some(v) = var("KUBOR_NAMESPACE") { self.default_namespace = Some(v).filter(|s| !s.is_empty()); }
        if let Some(v) = var("KUBOR_WAIT_TIMEOUT") {
            self.wait_timeout = humantime::parse_duration(&v)
                .map_err(|e| ValidationError::Project(format!("KUBOR_WAIT_TIMEOUT={v:?}: {e}")))?;
        }
        if let Some(v) = var("KUBOR_LIST_LIMIT") {
            self.list_limit = v.parse().map_err(|_| ValidationError::Project(format!("KUBOR_LIST_LIMIT={v:?} is not a number")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.group_id.is_empty() || self.artifact_id.is_empty() {
            return Err(ValidationError::Project("groupId and artifactId are required".into()));
        }
        validate_label_value(LABEL_GROUP_ID, &self.group_id)?;
        validate_label_value(LABEL_ARTIFACT_ID, &self.artifact_id)?;
        validate_label_value(LABEL_RELEASE, &self.release)?;
        if self.list_limit == 0 {
            return Err(ValidationError::Project("listLimit must be positive".into()));
        }
        for k in self.claim.kinds.iter().chain(self.ignore_unknown_kinds.iter()) {
            k.parse::<ResourceIdentity>()?;
        }
        for p in self.claim.names.iter().chain(self.claim.namespace_patterns.iter()) {
            anchored(p)?;
        }
        Ok(())
    }

    /// Label selector matching everything this project owns.
    pub fn ownership_selector(&self) -> String {
        format!("{}={},{}={}", LABEL_GROUP_ID, self.group_id, LABEL_ARTIFACT_ID, self.artifact_id)
    }

    pub fn ignores_unknown(&self, gvk: &ResourceIdentity) -> bool {
        self.ignore_unknown_kinds.iter().filter_map(|k| k.parse::<ResourceIdentity>().ok()).any(|k| &k == gvk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
groupId: acme
artifactId: shop
release: "1.2.3"
labels:
  release:
    action: setIfAbsent
annotations:
  action: drop
claim:
  kinds: ["apps/v1/Deployment", "v1/Service"]
  names: ["shop-.*"]
ignoreUnknownKinds: ["monitoring.coreos.com/v1/ServiceMonitor"]
waitTimeout: 90s
"#;

    #[test]
    fn parses_project_file() {
        let p = Project::from_yaml(YAML).unwrap();
        p.validate().unwrap();
        assert_eq!(p.labels.release.action, LabelAction::SetIfAbsent);
        assert_eq!(p.labels.group_id.action, LabelAction::Set);
        assert_eq!(p.annotations.action, AnnotationAction::Drop);
        assert_eq!(p.wait_timeout, Duration::from_secs(90));
        assert_eq!(p.list_limit, 500);
        assert!(p.ignores_unknown(&"MONITORING.coreos.com/v1/servicemonitor".parse().unwrap()));
        assert_eq!(p.ownership_selector(), "kubor.echocat.org/group-id=acme,kubor.echocat.org/artifact-id=shop");
    }

    #[test]
    fn environment_overrides() {
        let mut p = Project::from_yaml(YAML).unwrap();
        p.apply_env(|k| match k {
            "KUBOR_RELEASE" => Some("2.0.0".into()),
            "KUBOR_WAIT_TIMEOUT" => Some("5m".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(p.release, "2.0.0");
        assert_eq!(p.wait_timeout, Duration::from_secs(300));
        assert!(p.apply_env(|k| (k == "KUBOR_LIST_LIMIT").then(|| "many".to_string())).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut p = Project::from_yaml(YAML).unwrap();
        p.release = "not a label!".into();
        assert!(matches!(p.validate(), Err(ValidationError::LabelValue { .. })));
        let mut p = Project::from_yaml(YAML).unwrap();
        p.claim.names.push("(".into());
        assert!(matches!(p.validate(), Err(ValidationError::Pattern { .. })));
        assert!(Project::default().validate().is_err());
    }

    #[test]
    fn label_actions_parse_from_arguments() {
        assert_eq!("set-if-absent".parse::<LabelAction>().unwrap(), LabelAction::SetIfAbsent);
        assert_eq!("setIfExists".parse::<LabelAction>().unwrap(), LabelAction::SetIfExists);
        assert!("keep".parse::<LabelAction>().is_err());
    }
}
