//! Kubor cleanup engine.
//!
//! Lists every live resource a project's [`Claim`] covers (ownership labels,
//! claimed kinds, namespaces and names) and deletes what its [`KeepSet`] does
//! not name. Keep matching is exact-identity; twin kinds are only used to list
//! each logical resource once.

#![forbid(unsafe_code)]

use serde::Serialize;
use thiserror::Error;

use kubor_core::ResourceIdentity;
use kubor_kubehub::ClusterError;

mod keep;
mod sweep;

pub use keep::{Claim, KeepSet};
pub use sweep::Cleaner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Delete what the project owns but no longer declares.
    Orphans,
    /// Tear the project down.
    Delete,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("listing namespaces: {0}")]
    Namespaces(#[source] ClusterError),
    #[error("listing {gvk} in {}: {source}", .namespace.as_deref().unwrap_or("the cluster"))]
    List {
        gvk: ResourceIdentity,
        namespace: Option<String>,
        #[source]
        source: ClusterError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    /// Owned but protected by `cleanup-on`, or not decodable.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}
