use thiserror::Error;

/// Caller or configuration mistakes. Raised before any mutating call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("illegal resource identity {0:?} (expect v1/Kind or group/v1/Kind)")]
    Identity(String),
    #[error("illegal transformation name {0:?}")]
    TransformationName(String),
    #[error("illegal value {value:?} for label {key}")]
    LabelValue { key: String, value: String },
    #[error("illegal value {value:?} for annotation {key}: {reason}")]
    Annotation { key: String, value: String, reason: String },
    #[error("illegal pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("project: {0}")]
    Project(String),
    #[error("{first} and {second} declare the same object")]
    Duplicate { first: String, second: String },
}

/// Failure of a nested-document path operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("{path} is a {found}, not a map or list")]
    NotAContainer { path: String, found: &'static str },
    #[error("{path}: index {index} out of range")]
    IndexOutOfRange { path: String, index: usize },
    #[error("{0} is an identity field")]
    Protected(String),
    #[error("{path}: {segment:?} is not a list index")]
    NotAnIndex { path: String, segment: String },
}

/// A document that cannot be turned into an addressable object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("document is not a map")]
    NotAMap,
    #[error("document missing {0}")]
    Missing(&'static str),
    #[error(transparent)]
    Path(#[from] PathError),
}
