use crate::prelude::*;
use thiserror::Error;

/// The error kinds that callers are expected to tell apart. Everything else
/// travels as a plain eyre::Report; these get downcast at the CLI boundary to
/// pick an exit code.
#[derive(Error, Debug)]
pub enum SprigError {
    #[error("invalid project manifest: {0}")]
    ManifestInvalid(String),
    #[error("no solution found for the project's requirements")]
    Unsatisfiable,
    #[error("{name} {version} requires python {requires}, which does not overlap the project's range {supported}")]
    PythonRangeDisjoint {
        name: String,
        version: Version,
        requires: String,
        supported: String,
    },
    #[error("lock file is out of sync with the manifest (content hash mismatch)")]
    LockInconsistent,
    #[error("unsupported lock file version {0}")]
    LockVersionUnknown(String),
    #[error("hash mismatch for {url}: expected {expected}, got {got}")]
    ArtifactHashMismatch {
        url: String,
        expected: String,
        got: String,
    },
    #[error("build backend failed for {name} (exit status {status})")]
    BuildFailure { name: String, status: String },
    #[error("cannot apply {operation} to {name}: {reason}")]
    EnvironmentConflict {
        operation: String,
        name: String,
        reason: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("no {kind} artifact compatible with this environment for {name} {version}")]
    NoCompatibleArtifact {
        kind: String,
        name: String,
        version: Version,
    },
    #[error("remote file does not support range requests")]
    RangesNotSupported,
}

/// Exit codes promised to the CLI frontend.
pub fn exit_code(err: &eyre::Report) -> i32 {
    match err.downcast_ref::<SprigError>() {
        Some(SprigError::Unsatisfiable) | Some(SprigError::PythonRangeDisjoint { .. }) => 1,
        Some(SprigError::LockInconsistent) | Some(SprigError::LockVersionUnknown(_)) => 2,
        Some(SprigError::ArtifactHashMismatch { .. })
        | Some(SprigError::BuildFailure { .. })
        | Some(SprigError::EnvironmentConflict { .. }) => 3,
        Some(SprigError::ManifestInvalid(_)) => 4,
        _ => 3,
    }
}
