//! Kubor core types: resource identities, untyped objects, the GVK twin
//! registry, readiness aggregation and project configuration.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod document;
pub mod error;
pub mod gvk;
pub mod object;
pub mod project;
pub mod readiness;
pub mod twins;

pub use error::{ObjectError, PathError, ValidationError};
pub use gvk::{ObjectReference, ResourceIdentity};
pub use object::Object;
pub use project::Project;
pub use readiness::{ReadinessRegistry, Readiness, ReadyState};
pub use twins::GvkRegistry;

pub mod prelude {
    pub use super::document::PathExt;
    pub use super::{GvkRegistry, Object, ObjectReference, Project, ReadinessRegistry, ResourceIdentity, ValidationError};
}
