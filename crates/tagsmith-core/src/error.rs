//! Error types for the artifact pipeline.
//!
//! Each pipeline stage owns an error enum so callers can tell *where* a unit
//! failed, and [`Error`] unifies them for propagation with `?`. The HTTP layer
//! surfaces the `Display` output of these errors verbatim.
//!
//! ## Error Cases
//! - [`IdentifierError`]: the generator could not produce a token.
//! - [`RenderError`]: payload rejected by the symbology, or the raster was not
//!   written to the scratch directory.
//! - [`TranscodeError`]: the intermediate raster is unreadable or corrupt.
//! - [`PublishError`]: upload transport/auth failure, or the local artifact
//!   vanished before upload.
//! - [`PersistError`]: constraint violation, connectivity loss, or pool
//!   exhaustion.
//! - [`Error::Validation`]: a request field is missing or out of range.
//! - [`Error::NotFound`]: lookup miss.

use crate::pipeline::Stage;

pub type Result<T> = core::result::Result<T, Error>;

/// Identifier generation failures.
#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier generator failed: {0}")]
    Generator(#[from] ferroid::generator::Error),

    /// The numeric scheme ran past its fixed width.
    #[error("numeric identifier space exhausted at {0}")]
    NumericOverflow(u64),
}

/// Symbol rendering failures.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The payload violates the active symbology's alphabet or length rules.
    #[error("payload rejected by {symbology}: {reason}")]
    Symbology {
        symbology: &'static str,
        reason: String,
    },

    /// The renderer reported success but no file exists at the scratch path.
    #[error("artifact not materialized: {path}")]
    NotMaterialized { path: String },

    /// Writing the raster to the scratch directory failed.
    #[error("failed to write raster: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode raster: {0}")]
    Encode(#[from] image::ImageError),
}

/// Raster to compact-format conversion failures.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to read intermediate image {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode compact image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to write compact image: {0}")]
    Io(#[from] std::io::Error),
}

/// Object-storage upload failures.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The local artifact was missing immediately before upload.
    #[error("artifact missing before upload: {path}")]
    MissingArtifact { path: String },

    /// The storage service answered with a non-success status.
    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The request never produced a response (DNS, TLS, reset, ...).
    #[error("upload transport failure: {0}")]
    Transport(String),

    #[error("upload timed out after {0:?}")]
    Timeout(core::time::Duration),

    #[error("failed to read artifact for upload: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    /// Whether retrying the upload may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::MissingArtifact { .. } | Self::Io(_) => false,
        }
    }

    /// Whether the upload may have landed even though no success was seen.
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Whether storage already holds an object at the key.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Rejected { status: 409, .. })
    }
}

/// Relational store failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// No connection became available within the acquire timeout.
    #[error("database pool exhausted")]
    PoolExhausted,

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database connectivity lost: {0}")]
    Connectivity(String),

    #[error("database timed out after {0:?}")]
    Timeout(core::time::Duration),

    #[error("database error: {0}")]
    Query(String),
}

impl PersistError {
    /// Whether retrying the statement may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted | Self::Connectivity(_) | Self::Timeout(_)
        )
    }

    /// Whether the statement may have committed even though no success was
    /// seen. Only a timeout leaves that open; the other variants are reported
    /// before or instead of execution.
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether a row with the same identifier already exists.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Self::Connectivity(err.to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Constraint(db.message().to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Unified error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    /// A request field is missing, empty, or out of range.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    #[error("no record for identifier {identifier}")]
    NotFound { identifier: String },

    /// A blocking stage panicked or was cancelled.
    #[error("worker failure: {0}")]
    Worker(String),
}

/// A unit failure annotated with the stage it happened in.
///
/// This is the `Failed(stage, cause)` terminal state of a unit.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl PipelineError {
    pub fn new(stage: Stage, source: impl Into<Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}
