use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use kubor_core::{ObjectReference, ValidationError};
use kubor_kubehub::ClusterError;
use kubor_transform::TransformError;

/// The cluster call an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Get,
    Create,
    Update,
    Watch,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::Create => "create",
            Self::Update => "update",
            Self::Watch => "watch",
        })
    }
}

fn human(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_millis(d.as_millis() as u64))
}

/// Failure of one unit.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{reference}: not ready after {} (budget {})", human(.elapsed), human(.budget))]
    Timeout { reference: ObjectReference, elapsed: Duration, budget: Duration },
    #[error("{reference}: {step} failed: {source}")]
    Remote {
        reference: ObjectReference,
        step: Step,
        #[source]
        source: ClusterError,
    },
    #[error("{reference}: {source}")]
    Transform {
        reference: ObjectReference,
        #[source]
        source: TransformError,
    },
    #[error("{reference}: {message}")]
    Consistency { reference: ObjectReference, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ApplyError {
    pub fn remote(reference: &ObjectReference, step: Step, source: ClusterError) -> Self {
        Self::Remote { reference: reference.clone(), step, source }
    }

    pub fn reference(&self) -> Option<&ObjectReference> {
        match self {
            Self::Timeout { reference, .. }
            | Self::Remote { reference, .. }
            | Self::Transform { reference, .. }
            | Self::Consistency { reference, .. } => Some(reference),
            Self::Validation(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, Self::Timeout { .. }) }
}

/// Result of undoing one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "error")]
pub enum RollbackOutcome {
    Deleted,
    Restored,
    Failed(String),
}

/// What a rollback sweep did, one entry per applied unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub entries: Vec<(String, RollbackOutcome)>,
}

impl RollbackReport {
    pub fn succeeded(&self) -> bool { self.entries.iter().all(|(_, o)| !matches!(o, RollbackOutcome::Failed(_))) }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(r, o)| match o {
            RollbackOutcome::Failed(e) => Some((r.as_str(), e.as_str())),
            _ => None,
        })
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.entries.len();
        if total == 0 {
            return f.write_str("nothing to roll back");
        }
        let failed: Vec<_> = self.failures().collect();
        if failed.is_empty() {
            return write!(f, "rolled back {total} object(s)");
        }
        write!(f, "rollback failed for {} of {total} object(s):", failed.len())?;
        for (reference, error) in failed {
            write!(f, " [{reference}: {error}]")?;
        }
        Ok(())
    }
}

/// Failure of a whole set: the first unit error plus what the rollback did.
#[derive(Debug, Error)]
#[error("{source}; {rollback}")]
pub struct BatchError {
    #[source]
    pub source: ApplyError,
    pub rollback: RollbackReport,
}
