//! Spawn error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::options::AppType;

/// Result type for spawn operations.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Errors surfaced by [`crate::SpawnManager::spawn`].
///
/// Cloneable so that a single spawner creation failure can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    /// Bad options or configuration. Reported before any process work.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A pooled spawner could not be created.
    #[error("failed to create {tier} spawner for {key}: {source}")]
    PoolCreation {
        tier: PoolTier,
        key: String,
        #[source]
        source: Arc<SpawnError>,
    },

    /// The pool was shut down before or while the spawner was created.
    #[error("{tier} spawner pool is shut down")]
    PoolClosed { tier: PoolTier },

    /// The OS-level process creation (or the helper that performs it) failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SpawnError {
    /// The launch failure at the root of this error, if any.
    pub fn launch_error(&self) -> Option<&LaunchError> {
        match self {
            SpawnError::Launch(e) => Some(e),
            SpawnError::PoolCreation { source, .. } => source.launch_error(),
            SpawnError::Config(_) | SpawnError::PoolClosed { .. } => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("app root must not be empty")]
    EmptyAppRoot,

    #[error("environment must not be empty")]
    EmptyEnvironment,

    #[error("unknown application type '{0}' (expected rails, rack or wsgi)")]
    UnknownAppType(String),

    #[error("unknown spawn method '{0}' (expected smart or conservative)")]
    UnknownSpawnMethod(String),

    #[error("no launch recipe configured for application type '{0}'")]
    MissingRecipe(AppType),

    #[error("{app_type} recipe has an empty {command} command")]
    EmptyCommand {
        app_type: AppType,
        command: &'static str,
    },

    #[error("invalid pool setting: {0}")]
    InvalidPool(String),

    #[error("spawn manager must be built inside a Tokio runtime")]
    NoRuntime,
}

/// Which pool a spawner belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolTier {
    Framework,
    Application,
}

impl fmt::Display for PoolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framework => write!(f, "framework"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Why a launch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailureKind {
    /// Executable or interpreter not found.
    NotFound,
    /// Permission denied while creating or executing the process.
    PermissionDenied,
    /// Any other I/O error from the process-creation primitive.
    Io,
    /// The process exited before it became ready.
    EarlyExit,
    /// The process did not become ready in time.
    StartupTimeout,
    /// A helper refused the request or stopped answering.
    Helper,
}

impl fmt::Display for LaunchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::Io => "io error",
            Self::EarlyExit => "exited early",
            Self::StartupTimeout => "startup timeout",
            Self::Helper => "helper failure",
        };
        f.write_str(text)
    }
}

/// A process could not be created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to launch '{program}' ({kind}): {message}")]
pub struct LaunchError {
    pub program: String,
    pub kind: LaunchFailureKind,
    pub message: String,
}

impl LaunchError {
    pub fn new(
        program: impl Into<String>,
        kind: LaunchFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            kind,
            message: message.into(),
        }
    }

    /// Classify an I/O error from `spawn()`.
    pub fn from_io(program: impl Into<String>, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => LaunchFailureKind::NotFound,
            std::io::ErrorKind::PermissionDenied => LaunchFailureKind::PermissionDenied,
            _ => LaunchFailureKind::Io,
        };
        Self::new(program, kind, err.to_string())
    }

    /// A helper-side failure.
    pub fn helper(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(program, LaunchFailureKind::Helper, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::UnknownAppType("django".to_string());
        assert_eq!(
            err.to_string(),
            "unknown application type 'django' (expected rails, rack or wsgi)"
        );
    }

    #[test]
    fn test_launch_error_from_io_classifies_kind() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            LaunchError::from_io("ruby", &err).kind,
            LaunchFailureKind::NotFound
        );

        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            LaunchError::from_io("ruby", &err).kind,
            LaunchFailureKind::PermissionDenied
        );
    }

    #[test]
    fn test_pool_creation_exposes_root_launch_error() {
        let launch = LaunchError::new("hatch-helper", LaunchFailureKind::EarlyExit, "exit 1");
        let err = SpawnError::PoolCreation {
            tier: PoolTier::Framework,
            key: "rails:default".to_string(),
            source: Arc::new(SpawnError::Launch(launch.clone())),
        };
        assert_eq!(err.launch_error(), Some(&launch));
    }
}
