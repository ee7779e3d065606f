//! Error taxonomy for materialization and site management

use std::path::PathBuf;

/// Broad classification of a failure, used to pick the process exit code
/// and the wording of the user-facing diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing directory, colliding backend identifiers, malformed settings
    Configuration,
    /// Operation requires a running topology (or similar) and it is not met
    Precondition,
    /// A container runtime, scaffolding or trust-store command failed
    ExternalTool,
    /// A bounded retry budget was exhausted
    Transient,
    /// Filesystem failure while reading or writing artifacts
    Io,
}

impl ErrorClass {
    /// Process exit code for this class
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::Configuration => 78,
            ErrorClass::Precondition => 69,
            ErrorClass::ExternalTool => 70,
            ErrorClass::Transient => 75,
            ErrorClass::Io => 74,
        }
    }

    /// Short label used as the prefix of the diagnostic
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration error",
            ErrorClass::Precondition => "not ready",
            ErrorClass::ExternalTool => "command failed",
            ErrorClass::Transient => "timed out",
            ErrorClass::Io => "i/o error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("the sites directory {} does not exist", .0.display())]
    MissingSitesDirectory(PathBuf),

    #[error("invalid settings file {}: {message}", path.display())]
    MalformedSettings { path: PathBuf, message: String },

    #[error("PHP versions {first} and {second} both map to backend '{id}'")]
    BackendCollision {
        first: String,
        second: String,
        id: String,
    },

    #[error("hostname {host} is claimed by both '{first}' and '{second}'")]
    DuplicateHost {
        host: String,
        first: String,
        second: String,
    },

    #[error("template '{0}' not found")]
    TemplateMissing(String),

    #[error("{0}")]
    Precondition(String),

    #[error("`{command}` exited with status {status}")]
    ExternalTool { command: String, status: String },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} did not become ready after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("invalid topology descriptor: {0}")]
    Topology(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_)
            | Error::MissingSitesDirectory(_)
            | Error::MalformedSettings { .. }
            | Error::BackendCollision { .. }
            | Error::DuplicateHost { .. }
            | Error::TemplateMissing(_)
            | Error::Topology(_) => ErrorClass::Configuration,
            Error::Precondition(_) => ErrorClass::Precondition,
            Error::ExternalTool { .. } | Error::Spawn { .. } | Error::Certificate(_) => {
                ErrorClass::ExternalTool
            }
            Error::Timeout { .. } => ErrorClass::Transient,
            Error::Io { .. } => ErrorClass::Io,
        }
    }

    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Extension for turning `std::io::Result` into [`Result`] with the path that failed
pub trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
