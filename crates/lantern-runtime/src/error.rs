//! Error types for the Lantern sandbox.

use thiserror::Error;

/// Errors raised at the sandbox boundary.
///
/// The type is `Clone` so it can be recovered by reference from inside a
/// wrapped scripting-engine error and handed back to the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// Input rejected by the load policy (precompiled code where only
    /// source is allowed).
    #[error("{0}")]
    PolicyViolation(String),

    /// Code tried to write into the unrestricted outer namespace.
    #[error("sandbox escape attempt: cannot assign '{0}' outside the execution context")]
    SandboxEscapeAttempt(String),

    /// A wrapped primitive was called with input above its bound.
    #[error("{function}: input of {actual} bytes exceeds limit of {limit}")]
    ResourceLimitExceeded {
        function: String,
        limit: usize,
        actual: usize,
    },

    /// No module source could locate the module.
    #[error("module '{name}' not found:{diagnostics}")]
    ModuleNotFound { name: String, diagnostics: String },

    /// The compiler rejected a chunk.
    #[error("{0}")]
    CompileError(String),

    /// Operator code raised while running.
    #[error("{0}")]
    ScriptRuntimeError(String),

    /// The host's CPU-time watchdog fired.
    #[error("watchdog: cpu time limit exceeded")]
    FatalWatchdog,

    /// Options manifest failed validation.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A host capability failed.
    #[error("host error: {0}")]
    Host(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl SandboxError {
    /// Errors that no in-sandbox protected call may swallow.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::FatalWatchdog | SandboxError::SandboxEscapeAttempt(_)
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for SandboxError {
    fn from(e: toml::de::Error) -> Self {
        SandboxError::InvalidManifest(e.to_string())
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SandboxError::FatalWatchdog.is_fatal());
        assert!(SandboxError::SandboxEscapeAttempt("x".to_string()).is_fatal());
        assert!(!SandboxError::ScriptRuntimeError("boom".to_string()).is_fatal());
        assert!(!SandboxError::PolicyViolation("no".to_string()).is_fatal());
    }

    #[test]
    fn test_module_not_found_message() {
        let err = SandboxError::ModuleNotFound {
            name: "foo".to_string(),
            diagnostics: "\n\tno file 'foo.lua'\n\tno embedded module 'foo'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "module 'foo' not found:\n\tno file 'foo.lua'\n\tno embedded module 'foo'"
        );
    }
}
