use std::path::PathBuf;

use thiserror::Error;

/// The machine-readable error kinds. Everything travels as an
/// `eyre::Report`; callers that need to branch on the kind (the CLI, the
/// build-repository deferral loop, tests) downcast to this.
#[derive(Error, Debug)]
pub enum IpkgError {
    #[error("invalid {what}: {input:?}")]
    InvalidInput { what: &'static str, input: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("conflicting version constraints: {left} + {right}")]
    ConflictingConstraint { left: String, right: String },

    #[error("checksum mismatch for {name} ({algorithm}): got {got}, expected {expected}")]
    ChecksumMismatch {
        name: String,
        algorithm: String,
        got: String,
        expected: String,
    },

    #[error("bad archive layout in {name}: {problem}")]
    ArchiveLayoutInvalid { name: String, problem: String },

    #[error("cannot execute {command}: {kind}")]
    ExecutionFailed { command: String, kind: ExecutionError },

    #[error("dependency cycle involving {involving:?}")]
    Cycle { involving: Vec<String> },

    #[error("package {spec} is already installed")]
    AlreadyInstalled { spec: String },

    #[error("corrupt metadata file {}", .path.display())]
    MetaCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no satisfier for requirement {requirement} (required by {requester})")]
    RequirementNotFound {
        requirement: String,
        requester: String,
    },

    #[error("object {identity} was already added to the solver")]
    DuplicateObject { identity: String },
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("command not found")]
    NotFound,
    #[error("exited with code {0}")]
    NonZero(i32),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
