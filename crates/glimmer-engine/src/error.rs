use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;

/// An error that happens while fetching the bytes for one pipeline stage.
///
/// Fetch errors are local to a stage: the pipeline records them and falls through to the
/// next stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The stage has no data for the requested key, for example a disk cache miss.
    #[error("not found")]
    NotFound,
    /// No registered fetcher is able to handle the source.
    #[error("no fetcher for source `{0}`")]
    NoFetcher(String),
    /// The fetch did not complete in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch failed due to another problem, like connection loss or a failing disk.
    ///
    /// The attached string contains the fetcher's description of the problem.
    #[error("fetch failed: {0}")]
    Failed(String),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::Failed(err.to_string()),
        }
    }
}

/// An error that happens while decoding or transforming fetched bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No registered decoder handles the requested resource class.
    #[error("no decoder for resource class `{0}`")]
    NoDecoder(String),
    /// Decoders were found, but none of them produced a resource.
    #[error("no decoder produced a `{0}` resource")]
    Unhandled(String),
    /// The data was fetched successfully, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The key references a transformation that was never registered.
    #[error("unknown transformation `{0}`")]
    UnknownTransformation(String),
    /// A transformation failed.
    #[error("transformation `{id}` failed: {details}")]
    Transform { id: String, details: String },
}

/// The reason a single [`Stage`] did not produce a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageErrorKind {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A stage-local failure, tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage}: {kind}")]
pub struct StageError {
    pub stage: Stage,
    pub kind: StageErrorKind,
}

impl StageError {
    pub fn new(stage: Stage, kind: impl Into<StageErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
        }
    }

    /// Whether this error just signals that the stage had nothing to offer.
    pub fn is_miss(&self) -> bool {
        matches!(self.kind, StageErrorKind::Fetch(FetchError::NotFound))
    }
}

/// Every stage of the pipeline was attempted and none produced a resource.
///
/// The causes are kept in the order the stages were attempted in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoResultError {
    causes: Vec<StageError>,
}

impl NoResultError {
    pub fn new(causes: Vec<StageError>) -> Self {
        Self { causes }
    }

    pub fn causes(&self) -> &[StageError] {
        &self.causes
    }

    /// The last error that is not just a cache miss, which is usually the interesting one.
    pub fn root_cause(&self) -> Option<&StageError> {
        self.causes
            .iter()
            .rev()
            .find(|e| !e.is_miss())
            .or_else(|| self.causes.last())
    }
}

impl fmt::Display for NoResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load resource, {} causes", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            write!(f, "\n  {}. {cause}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for NoResultError {}

/// The terminal error delivered to a load callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// All pipeline stages failed.
    ///
    /// This is shared between every callback that was attached to the same decode.
    #[error(transparent)]
    NoResult(Arc<NoResultError>),
    /// The load was cancelled by the engine before it could complete.
    ///
    /// This is not a failure and should not be surfaced to users as one.
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn no_result(&self) -> Option<&NoResultError> {
        match self {
            Self::NoResult(err) => Some(err),
            Self::Cancelled => None,
        }
    }
}

impl From<NoResultError> for LoadError {
    fn from(err: NoResultError) -> Self {
        Self::NoResult(Arc::new(err))
    }
}
