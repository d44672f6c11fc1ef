use std::path::PathBuf;
use thiserror::Error;

/// Problems with the sweep definition itself. Raised before any job is
/// created or dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sweep declares no parameters")]
    NoParameters,
    #[error("empty sweep: parameter '{0}' has no candidate values")]
    EmptySweep(String),
    #[error("unknown parameter '{param}' referenced by {referrer}")]
    UnknownParameter { param: String, referrer: String },
    #[error("unknown operation '{op}' referenced by {referrer}")]
    UnknownOperation { op: String, referrer: String },
    #[error("duplicate operation '{0}'")]
    DuplicateOperation(String),
    #[error("operation '{0}' depends on itself")]
    SelfDependency(String),
    #[error("operation dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("only one sample operation may be declared (found '{0}' and '{1}')")]
    MultipleSampleOperations(String, String),
    #[error("operation '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("target parameter '{param}': {reason}")]
    InvalidTarget { param: String, reason: String },
    #[error("invalid host pattern for environment '{name}': {reason}")]
    InvalidHostPattern { name: String, reason: String },
    #[error("invalid sweep config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Failures confined to a single job. They are reported per job and never
/// abort a pass over the other jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("corrupt checkpoint artifact {path}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },
    #[error("missing input for job {job}: {what}")]
    MissingInput { job: String, what: String },
    #[error("unreadable job document {path}: {reason}")]
    CorruptDocument { path: PathBuf, reason: String },
    #[error("state point at {path} does not match identity {id}")]
    IdentityCollision { id: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Stable short name used in status output.
    pub fn class(&self) -> &'static str {
        match self {
            JobError::CorruptArtifact { .. } => "corrupt_artifact",
            JobError::MissingInput { .. } => "missing_input",
            JobError::CorruptDocument { .. } => "corrupt_document",
            JobError::IdentityCollision { .. } => "identity_collision",
            JobError::Io { .. } => "io",
        }
    }
}
