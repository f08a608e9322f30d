//! Load policy for script chunks.
//!
//! Untrusted origins may only supply text source. Precompiled chunks can
//! encode instruction sequences the source-level sandbox never has to
//! reason about, so they are refused before the compiler sees them unless
//! the caller explicitly allows them.
//!
//! ## Format
//!
//! ```text
//! +------------------+
//! | 0x1b 'L' 'u' 'a' |  precompiled chunk (refused by default)
//! +------------------+
//! | anything else    |  text source
//! +------------------+
//! ```

use crate::error::{SandboxError, SandboxResult};

/// First byte of every precompiled Lua chunk.
pub const BYTECODE_MARKER: u8 = 0x1b;

/// Returns true if `source` starts with the precompiled-chunk marker.
pub fn is_precompiled(source: &[u8]) -> bool {
    source.first() == Some(&BYTECODE_MARKER)
}

/// Something that turns chunk bytes into an executable unit.
pub trait ChunkCompiler {
    /// The compiled, not yet executed, unit.
    type Unit;

    /// Compile `source`. `text_only` is true when the policy forbids
    /// precompiled input; compilers that can enforce it should.
    fn compile(&self, source: &[u8], label: &str, text_only: bool) -> SandboxResult<Self::Unit>;
}

/// Policy-checking front end for a [`ChunkCompiler`].
pub struct SafeLoader<C> {
    compiler: C,
}

impl<C: ChunkCompiler> SafeLoader<C> {
    /// Wrap a compiler.
    pub fn new(compiler: C) -> Self {
        Self { compiler }
    }

    /// Compile a chunk under the precompiled-input policy.
    ///
    /// Returns `PolicyViolation` without calling the compiler when the
    /// chunk is precompiled and `allow_precompiled` is false. Otherwise the
    /// compiler's result is returned unchanged.
    pub fn compile(
        &self,
        source: &[u8],
        label: &str,
        allow_precompiled: bool,
    ) -> SandboxResult<C::Unit> {
        if !allow_precompiled && is_precompiled(source) {
            return Err(SandboxError::PolicyViolation(format!(
                "precompiled code not allowed for chunk '{}'",
                label
            )));
        }

        self.compiler.compile(source, label, !allow_precompiled)
    }

    /// Get the wrapped compiler.
    pub fn compiler(&self) -> &C {
        &self.compiler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingCompiler {
        calls: Cell<usize>,
        last_text_only: Cell<Option<bool>>,
    }

    impl ChunkCompiler for CountingCompiler {
        type Unit = usize;

        fn compile(&self, source: &[u8], _label: &str, text_only: bool) -> SandboxResult<usize> {
            self.calls.set(self.calls.get() + 1);
            self.last_text_only.set(Some(text_only));
            if source.starts_with(b"syntax error") {
                return Err(SandboxError::CompileError("unexpected symbol".to_string()));
            }
            Ok(source.len())
        }
    }

    #[test]
    fn test_precompiled_rejected_without_compiling() {
        let loader = SafeLoader::new(CountingCompiler::default());
        let err = loader
            .compile(b"\x1bLua\x54\x00junk", "node.lua", false)
            .unwrap_err();

        assert_eq!(
            err,
            SandboxError::PolicyViolation(
                "precompiled code not allowed for chunk 'node.lua'".to_string()
            )
        );
        assert_eq!(loader.compiler().calls.get(), 0);
    }

    #[test]
    fn test_precompiled_allowed_when_flagged() {
        let loader = SafeLoader::new(CountingCompiler::default());
        let unit = loader.compile(b"\x1bLua", "userlib", true).unwrap();
        assert_eq!(unit, 4);
        assert_eq!(loader.compiler().calls.get(), 1);
        assert_eq!(loader.compiler().last_text_only.get(), Some(false));
    }

    #[test]
    fn test_text_source_passes_through() {
        let loader = SafeLoader::new(CountingCompiler::default());
        assert_eq!(loader.compile(b"return 1", "x", false).unwrap(), 8);
        assert_eq!(loader.compiler().last_text_only.get(), Some(true));
    }

    #[test]
    fn test_compile_error_returned_verbatim() {
        let loader = SafeLoader::new(CountingCompiler::default());
        let err = loader.compile(b"syntax error here", "x", false).unwrap_err();
        assert_eq!(err, SandboxError::CompileError("unexpected symbol".to_string()));
    }

    #[test]
    fn test_marker_only_checked_at_start() {
        assert!(is_precompiled(b"\x1b"));
        assert!(!is_precompiled(b"-- \x1b"));
        assert!(!is_precompiled(b""));
    }
}
