use std::path::PathBuf;

use crate::helpers::command::CommandError;

/// Errors produced by the pipeline engine.
///
/// Failure policy (mirrored across the services): subprocess failures are
/// always structured (`CommandError`), read-only git introspection fails
/// soft and never surfaces here, permission fixups downgrade to warnings.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("clone failed: {0}")]
    Clone(String),

    #[error("project detection failed in {path}: {reason}")]
    Detection { path: PathBuf, reason: String },

    #[error("build failed: {0}")]
    Build(String),

    #[error("deployment failed: {0}")]
    Deploy(String),

    #[error("health check failed on port {port} after {attempts} attempts")]
    HealthCheckTimeout { port: u16, attempts: u32 },

    #[error("no free port available in range {base}..{limit}")]
    PortExhaustion { base: u16, limit: u16 },

    /// Logged as a warning by the deployer, never aborts a deployment.
    #[error("permission fixup failed: {0}")]
    Permission(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this failure was caused by a kill (timeout or cancellation)
    /// of the underlying subprocess tree.
    pub fn was_killed(&self) -> bool {
        match self {
            Self::Command(err) => err.killed,
            Self::Cancelled => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display_port_exhaustion() {
        let err = EngineError::PortExhaustion {
            base: 10000,
            limit: 11000,
        };
        let msg = format!("{err}");
        assert!(
            msg.contains("10000") && msg.contains("11000"),
            "Expected port range in: {msg}"
        );
    }

    #[test]
    fn test_engine_error_display_health_check() {
        let err = EngineError::HealthCheckTimeout {
            port: 10003,
            attempts: 30,
        };
        let msg = format!("{err}");
        assert!(msg.contains("10003"), "Expected port in: {msg}");
        assert!(msg.contains("30 attempts"), "Expected attempts in: {msg}");
    }

    #[test]
    fn test_engine_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = EngineError::from(io_err);
        assert!(matches!(err, EngineError::Io(_)));
    }
}
