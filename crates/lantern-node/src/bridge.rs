//! Conversions between engine errors and sandbox errors.

use lantern_runtime::SandboxError;

/// Find a [`SandboxError`] raised by a kernel or host function anywhere in
/// an engine error chain.
pub fn find_sandbox_error(err: &mlua::Error) -> Option<&SandboxError> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<SandboxError>(),
        mlua::Error::CallbackError { cause, .. } => find_sandbox_error(cause),
        mlua::Error::WithContext { cause, .. } => find_sandbox_error(cause),
        _ => None,
    }
}

/// Whether an engine error carries a fatal sandbox error.
pub fn is_fatal_error(err: &mlua::Error) -> bool {
    find_sandbox_error(err).is_some_and(SandboxError::is_fatal)
}

/// Classify an error that escaped script code.
///
/// Fatal errors keep their identity; everything else becomes a
/// `ScriptRuntimeError` carrying the engine's message and traceback.
pub fn script_error(err: mlua::Error) -> SandboxError {
    if let Some(inner) = find_sandbox_error(&err) {
        if inner.is_fatal() {
            return inner.clone();
        }
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => SandboxError::CompileError(message),
        other => SandboxError::ScriptRuntimeError(other.to_string()),
    }
}

/// Raise a sandbox error inside the engine.
pub fn raise(err: SandboxError) -> mlua::Error {
    mlua::Error::external(err)
}
