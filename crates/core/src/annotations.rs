//! Label and annotation keys kubor reads and writes, and the parsed form of
//! its per-object control annotations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::object::Object;

/// Prefix of every kubor label and control annotation.
pub const PREFIX: &str = "kubor.echocat.org/";
/// Prefix of per-transformation directives; the transformation name follows.
pub const TRANSFORMATION_PREFIX: &str = "transformation.kubor.echocat.org/";

pub const LABEL_GROUP_ID: &str = "kubor.echocat.org/group-id";
pub const LABEL_ARTIFACT_ID: &str = "kubor.echocat.org/artifact-id";
pub const LABEL_RELEASE: &str = "kubor.echocat.org/release";

pub const ANNOTATION_STAGE: &str = "kubor.echocat.org/stage";
pub const ANNOTATION_APPLY_ON: &str = "kubor.echocat.org/apply-on";
pub const ANNOTATION_DRY_RUN_ON: &str = "kubor.echocat.org/dry-run-on";
pub const ANNOTATION_WAIT_UNTIL: &str = "kubor.echocat.org/wait-until";
pub const ANNOTATION_CLEANUP_ON: &str = "kubor.echocat.org/cleanup-on";

pub const DEFAULT_STAGE: &str = "deploy";

/// True for annotation keys owned by kubor itself.
pub fn is_bookkeeping(key: &str) -> bool {
    key.starts_with(PREFIX) || key.starts_with(TRANSFORMATION_PREFIX)
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Annotation { key: key.to_string(), value: value.to_string(), reason: reason.into() }
}

macro_rules! keyword_enum {
    ($(#[$meta:meta])* $name:ident, $key:expr, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name { $($variant),+ }

        impl $name {
            pub const VALUES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self { $(Self::$variant => $text),+ }
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(if s.eq_ignore_ascii_case($text) { return Ok(Self::$variant); })+
                Err(invalid($key, s, format!("expected one of {}", Self::VALUES.join(", "))))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
    };
}

keyword_enum!(
    /// When an object is applied.
    ApplyOn, ANNOTATION_APPLY_ON, {
        Always => "always",
        Create => "create",
        Update => "update",
        Never => "never",
    }
);

keyword_enum!(
    /// How an object takes part in a dry run.
    DryRunOn, ANNOTATION_DRY_RUN_ON, {
        Nowhere => "nowhere",
        Client => "client",
        Server => "server",
        ServerIfPossible => "serverIfPossible",
    }
);

keyword_enum!(
    /// What the apply waits for after an object was sent.
    WaitMode, ANNOTATION_WAIT_UNTIL, {
        Never => "never",
        Applied => "applied",
        Deployed => "deployed",
        Executed => "executed",
    }
);

keyword_enum!(
    /// When a live object may be deleted by kubor.
    CleanupOn, ANNOTATION_CLEANUP_ON, {
        Automatic => "automatic",
        Never => "never",
        Orphaned => "orphaned",
        Executed => "executed",
        Delete => "delete",
    }
);

impl CleanupOn {
    /// May be removed by the orphan sweep.
    pub fn on_orphaned(&self) -> bool { matches!(self, Self::Automatic | Self::Orphaned) }

    /// May be removed when the whole project is torn down.
    pub fn on_delete(&self) -> bool { matches!(self, Self::Automatic | Self::Delete | Self::Executed) }

    pub fn from_object(object: &Object) -> Result<Self, ValidationError> {
        match object.annotation(ANNOTATION_CLEANUP_ON).map(str::trim).filter(|s| !s.is_empty()) {
            Some(v) => v.parse(),
            None => Ok(Self::Automatic),
        }
    }
}

/// `wait-until` value: mode plus an optional cap on the object's share of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitUntil {
    pub mode: WaitMode,
    pub timeout: Option<Duration>,
}

impl WaitUntil {
    pub fn blocks(&self) -> bool { matches!(self.mode, WaitMode::Deployed | WaitMode::Executed) }
}

impl FromStr for WaitUntil {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, timeout) = match s.split_once(':') {
            Some((m, d)) => {
                let d = humantime::parse_duration(d.trim())
                    .map_err(|e| invalid(ANNOTATION_WAIT_UNTIL, s, format!("bad duration: {e}")))?;
                (m, Some(d))
            }
            None => (s, None),
        };
        let mode: WaitMode = mode.trim().parse().map_err(|_| invalid(ANNOTATION_WAIT_UNTIL, s, format!("expected one of {}[:duration]", WaitMode::VALUES.join(", "))))?;
        Ok(Self { mode, timeout })
    }
}

/// Parsed control annotations of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAnnotations {
    pub stages: Vec<String>,
    pub apply_on: ApplyOn,
    pub dry_run_on: DryRunOn,
    /// `None` when the object does not say; callers pick a per-kind default.
    pub wait_until: Option<WaitUntil>,
    pub cleanup_on: CleanupOn,
}

impl ControlAnnotations {
    pub fn from_object(object: &Object) -> Result<Self, ValidationError> {
        let get = |key: &str| object.annotation(key).map(str::trim).filter(|s| !s.is_empty());
        let stages = match get(ANNOTATION_STAGE) {
            Some(v) => {
                let stages: Vec<String> = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
                if stages.is_empty() {
                    return Err(invalid(ANNOTATION_STAGE, v, "no stage named"));
                }
                stages
            }
            None => vec![DEFAULT_STAGE.to_string()],
        };
        Ok(Self {
            stages,
            apply_on: get(ANNOTATION_APPLY_ON).map(str::parse).transpose()?.unwrap_or(ApplyOn::Always),
            dry_run_on: get(ANNOTATION_DRY_RUN_ON).map(str::parse).transpose()?.unwrap_or(DryRunOn::ServerIfPossible),
            wait_until: get(ANNOTATION_WAIT_UNTIL).map(str::parse).transpose()?,
            cleanup_on: CleanupOn::from_object(object)?,
        })
    }

    pub fn in_stage(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.eq_ignore_ascii_case(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_annotations(a: serde_json::Value) -> Object {
        Object::from_json(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "annotations": a}})).unwrap()
    }

    #[test]
    fn defaults_when_absent() {
        let c = ControlAnnotations::from_object(&with_annotations(json!({}))).unwrap();
        assert_eq!(c.stages, vec!["deploy"]);
        assert_eq!(c.apply_on, ApplyOn::Always);
        assert_eq!(c.dry_run_on, DryRunOn::ServerIfPossible);
        assert_eq!(c.wait_until, None);
        assert_eq!(c.cleanup_on, CleanupOn::Automatic);
    }

    #[test]
    fn parses_all_keys() {
        let c = ControlAnnotations::from_object(&with_annotations(json!({
            ANNOTATION_STAGE: "init, deploy",
            ANNOTATION_APPLY_ON: "create",
            ANNOTATION_DRY_RUN_ON: "serverifpossible",
            ANNOTATION_WAIT_UNTIL: "deployed:2m30s",
            ANNOTATION_CLEANUP_ON: "executed",
        })))
        .unwrap();
        assert!(c.in_stage("init") && c.in_stage("DEPLOY") && !c.in_stage("test"));
        assert_eq!(c.apply_on, ApplyOn::Create);
        assert_eq!(c.dry_run_on, DryRunOn::ServerIfPossible);
        assert_eq!(c.wait_until, Some(WaitUntil { mode: WaitMode::Deployed, timeout: Some(Duration::from_secs(150)) }));
        assert!(c.cleanup_on.on_delete() && !c.cleanup_on.on_orphaned());
    }

    #[test]
    fn rejects_illegal_values() {
        let err = ControlAnnotations::from_object(&with_annotations(json!({ANNOTATION_APPLY_ON: "sometimes"}))).unwrap_err();
        assert!(err.to_string().contains("always, create, update, never"), "{err}");
        assert!(ControlAnnotations::from_object(&with_annotations(json!({ANNOTATION_WAIT_UNTIL: "deployed:soon"}))).is_err());
        assert!(ControlAnnotations::from_object(&with_annotations(json!({ANNOTATION_STAGE: " , "}))).is_err());
    }

    #[test]
    fn bookkeeping_keys() {
        assert!(is_bookkeeping(ANNOTATION_STAGE));
        assert!(is_bookkeeping("transformation.kubor.echocat.org/ownership-labels"));
        assert!(!is_bookkeeping("app.kubernetes.io/name"));
    }
}
