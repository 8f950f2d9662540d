use std::path::PathBuf;

/// The single error type returned by every fallible operation in this crate.
///
/// The inner representation is deliberately hidden; callers that need to
/// branch on failure mode should match on [`OrchestratorError::kind`] rather
/// than the `Debug` output.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct OrchestratorError(pub(crate) ErrorData);

impl OrchestratorError {
    /// Classify this error into one of the taxonomy members used to pick a
    /// process exit code on the command surface.
    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            ErrorData::MissingConfigFile { .. }
            | ErrorData::MalformedConfig { .. }
            | ErrorData::UnknownEnvironment { .. } => ErrorKind::Config,

            ErrorData::MissingMigrationFile { .. }
            | ErrorData::UndefinedEnvironment(..)
            | ErrorData::UnresolvablePlan { .. } => ErrorKind::Plan,

            ErrorData::Engine { .. } => ErrorKind::Engine,
            ErrorData::Sql { .. } => ErrorKind::Sql,
            ErrorData::OverlayRollbackNotSupported { .. } => ErrorKind::NotSupported,
            ErrorData::Database(_) => ErrorKind::Engine,
        }
    }
}

/// Coarse-grained classification of an [`OrchestratorError`].
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing configuration. No database contact is required
    /// to diagnose this class of error.
    Config,
    /// A referenced file is missing, a declared dependency is unknown, or a
    /// requested environment is undefined. No database mutation occurs.
    Plan,
    /// The backing migration engine reported a failure, including a dirty
    /// state it could not resolve on its own.
    Engine,
    /// Overlay SQL execution failed. Treated identically to `Engine` for
    /// audit purposes.
    Sql,
    /// The requested operation has no defined semantics (e.g. reverting an
    /// overlay migration).
    NotSupported,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorData {
    #[error("missing configuration file `{}`", path.display())]
    MissingConfigFile { path: PathBuf },

    #[error("malformed configuration file `{}`: {source}", path.display())]
    MalformedConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment `{environment}` is not declared in `{}`", path.display())]
    UnknownEnvironment { environment: String, path: PathBuf },

    #[error("migration file `{}` referenced by the plan does not exist", path.display())]
    MissingMigrationFile { path: PathBuf },

    #[error("environment `{0}` was requested but is not defined for this service")]
    UndefinedEnvironment(String),

    #[error("dependency resolution could not produce a plan: {detail}")]
    UnresolvablePlan { detail: String },

    #[error("migration engine reported a failure: {message}")]
    Engine { message: String },

    #[error("overlay migration execution failed: {message}")]
    Sql { message: String },

    #[error("reverting overlay migration `{migration}` has no defined semantics")]
    OverlayRollbackNotSupported { migration: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<ErrorData> for OrchestratorError {
    fn from(data: ErrorData) -> Self {
        Self(data)
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(error: sqlx::Error) -> Self {
        Self(ErrorData::Database(error))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
