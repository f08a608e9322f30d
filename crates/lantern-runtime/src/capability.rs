//! Capability manifest for script execution contexts.
//!
//! The manifest is the complete, static list of symbols a script can see.
//! Context builders copy only what is listed here; nothing is discovered
//! by walking the host's own namespace.

use crate::error::{SandboxError, SandboxResult};

/// Upper bound for subject strings handed to pattern functions and for the
/// output of repeat/format.
pub const MAX_SUBJECT_LEN: usize = 32 * 1024;

/// Upper bound for the worst-case output of a string replacement.
pub const MAX_REPLACE_OUTPUT: usize = 1024 * 1024;

/// Input bound applied before a wrapped primitive runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Byte length of the first argument.
    MaxSubjectLen(usize),

    /// Byte length of the string `rep(s, n, sep)` would produce.
    MaxRepeatOutput(usize),

    /// Subject length, plus the worst-case length of what
    /// `gsub(s, pattern, repl, n)` produces for a string `repl`.
    MaxReplaceOutput { subject: usize, output: usize },
}

impl LimitPolicy {
    /// Ceiling for the measured input.
    pub fn limit(&self) -> usize {
        match self {
            LimitPolicy::MaxSubjectLen(n) | LimitPolicy::MaxRepeatOutput(n) => *n,
            LimitPolicy::MaxReplaceOutput { subject, .. } => *subject,
        }
    }

    /// Ceiling for the estimated output, for policies that bound one.
    pub fn output_limit(&self) -> Option<usize> {
        match self {
            LimitPolicy::MaxReplaceOutput { output, .. } => Some(*output),
            _ => None,
        }
    }

    /// Fail with `ResourceLimitExceeded` if `actual` is above the ceiling.
    pub fn check(&self, function: &str, actual: usize) -> SandboxResult<()> {
        bounded(function, self.limit(), actual)
    }

    /// Fail with `ResourceLimitExceeded` if an estimated output is above
    /// the output ceiling. Policies without one accept anything.
    pub fn check_output(&self, function: &str, estimate: usize) -> SandboxResult<()> {
        match self.output_limit() {
            Some(limit) => bounded(function, limit, estimate),
            None => Ok(()),
        }
    }

    /// Length of `rep(s, count, sep)` without building it.
    pub fn repeat_output_len(len: usize, count: i64, sep_len: usize) -> usize {
        if count <= 0 {
            return 0;
        }
        let count = count as u64 as usize;
        len.saturating_mul(count)
            .saturating_add(sep_len.saturating_mul(count - 1))
    }

    /// Worst-case length of `gsub(s, pattern, repl, max)` for a string
    /// `repl`. Every position of the subject may match (empty matches
    /// included), and every `%0`-`%9` in `repl` may expand to the whole
    /// subject.
    pub fn replace_output_len(subject_len: usize, repl: &[u8], max: Option<i64>) -> usize {
        let mut per_match = 0usize;
        let mut i = 0;
        while i < repl.len() {
            if repl[i] == b'%' && i + 1 < repl.len() {
                per_match = per_match.saturating_add(if repl[i + 1].is_ascii_digit() {
                    subject_len
                } else {
                    1
                });
                i += 2;
            } else {
                per_match = per_match.saturating_add(1);
                i += 1;
            }
        }

        let positions = subject_len.saturating_add(1);
        let matches = match max {
            Some(n) if n <= 0 => 0,
            Some(n) => positions.min(n as u64 as usize),
            None => positions,
        };
        subject_len.saturating_add(matches.saturating_mul(per_match))
    }
}

fn bounded(function: &str, limit: usize, actual: usize) -> SandboxResult<()> {
    if actual > limit {
        return Err(SandboxError::ResourceLimitExceeded {
            function: function.to_string(),
            limit,
            actual,
        });
    }
    Ok(())
}

/// Host-backed capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    Print,
    LoadImage,
    LoadVideo,
    LoadFont,
    LoadFile,
    CreateShader,
    CreateSnapshot,
    CreateColoredTexture,
    CreateVnc,
    Setup,
    Clear,
    PushMatrix,
    PopMatrix,
    Rotate,
    Translate,
    Scale,
    Ortho,
    Perspective,
    Now,
    GetEnv,
    Provides,
    ClientWrite,
}

/// Capabilities implemented by the kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCall {
    Require,
    Load,
    ProtectedCall,
    ProtectedCallWithHandler,
    ProtectedResume,
    On,
    Dispatch,
    ResetError,
    Persistent,
    NodeName,
}

/// How a manifest symbol is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Copied unchanged from the platform library.
    Passthrough,

    /// Platform function wrapped with an input bound.
    Limited(LimitPolicy),

    /// Replaced by a no-op that only logs.
    Disabled,

    /// Provided by the host backend.
    Host(HostCall),

    /// Provided by the kernel.
    Kernel(KernelCall),
}

/// One manifest row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// Namespace table the symbol lives in, `None` for globals.
    pub namespace: Option<&'static str>,

    /// Symbol name.
    pub symbol: &'static str,

    /// How the symbol is provided.
    pub capability: Capability,
}

impl CapabilityEntry {
    /// Dotted name, e.g. `string.rep`.
    pub fn qualified_name(&self) -> String {
        match self.namespace {
            Some(ns) => format!("{}.{}", ns, self.symbol),
            None => self.symbol.to_string(),
        }
    }
}

const fn global(symbol: &'static str, capability: Capability) -> CapabilityEntry {
    CapabilityEntry {
        namespace: None,
        symbol,
        capability,
    }
}

const fn ns(
    namespace: &'static str,
    symbol: &'static str,
    capability: Capability,
) -> CapabilityEntry {
    CapabilityEntry {
        namespace: Some(namespace),
        symbol,
        capability,
    }
}

use Capability::{Disabled, Host, Kernel, Limited, Passthrough};

const SUBJECT: Capability = Limited(LimitPolicy::MaxSubjectLen(MAX_SUBJECT_LEN));

/// Every symbol visible to scripts.
pub static MANIFEST: &[CapabilityEntry] = &[
    // Globals
    global("assert", Passthrough),
    global("error", Passthrough),
    global("ipairs", Passthrough),
    global("next", Passthrough),
    global("pairs", Passthrough),
    global("select", Passthrough),
    global("tonumber", Passthrough),
    global("tostring", Passthrough),
    global("type", Passthrough),
    global("rawequal", Passthrough),
    global("rawget", Passthrough),
    global("rawset", Passthrough),
    global("rawlen", Passthrough),
    global("getmetatable", Passthrough),
    global("setmetatable", Passthrough),
    global("_VERSION", Passthrough),
    global("print", Host(HostCall::Print)),
    global("require", Kernel(KernelCall::Require)),
    global("load", Kernel(KernelCall::Load)),
    global("pcall", Kernel(KernelCall::ProtectedCall)),
    global("xpcall", Kernel(KernelCall::ProtectedCallWithHandler)),
    global("exit", Disabled),
    global("dofile", Disabled),
    global("loadfile", Disabled),
    global("collectgarbage", Disabled),
    // string
    ns("string", "byte", Passthrough),
    ns("string", "char", Passthrough),
    ns("string", "len", Passthrough),
    ns("string", "lower", Passthrough),
    ns("string", "upper", Passthrough),
    ns("string", "reverse", Passthrough),
    ns("string", "sub", Passthrough),
    ns("string", "find", SUBJECT),
    ns("string", "match", SUBJECT),
    ns("string", "gmatch", SUBJECT),
    ns(
        "string",
        "gsub",
        Limited(LimitPolicy::MaxReplaceOutput {
            subject: MAX_SUBJECT_LEN,
            output: MAX_REPLACE_OUTPUT,
        }),
    ),
    ns("string", "format", SUBJECT),
    ns(
        "string",
        "rep",
        Limited(LimitPolicy::MaxRepeatOutput(MAX_SUBJECT_LEN)),
    ),
    // table
    ns("table", "concat", Passthrough),
    ns("table", "insert", Passthrough),
    ns("table", "move", Passthrough),
    ns("table", "pack", Passthrough),
    ns("table", "remove", Passthrough),
    ns("table", "sort", Passthrough),
    ns("table", "unpack", Passthrough),
    // math
    ns("math", "abs", Passthrough),
    ns("math", "acos", Passthrough),
    ns("math", "asin", Passthrough),
    ns("math", "atan", Passthrough),
    ns("math", "ceil", Passthrough),
    ns("math", "cos", Passthrough),
    ns("math", "deg", Passthrough),
    ns("math", "exp", Passthrough),
    ns("math", "floor", Passthrough),
    ns("math", "fmod", Passthrough),
    ns("math", "huge", Passthrough),
    ns("math", "log", Passthrough),
    ns("math", "max", Passthrough),
    ns("math", "maxinteger", Passthrough),
    ns("math", "min", Passthrough),
    ns("math", "mininteger", Passthrough),
    ns("math", "modf", Passthrough),
    ns("math", "pi", Passthrough),
    ns("math", "rad", Passthrough),
    ns("math", "random", Passthrough),
    ns("math", "randomseed", Passthrough),
    ns("math", "sin", Passthrough),
    ns("math", "sqrt", Passthrough),
    ns("math", "tan", Passthrough),
    ns("math", "tointeger", Passthrough),
    ns("math", "type", Passthrough),
    ns("math", "ult", Passthrough),
    // coroutine
    ns("coroutine", "close", Passthrough),
    ns("coroutine", "create", Passthrough),
    ns("coroutine", "isyieldable", Passthrough),
    ns("coroutine", "resume", Kernel(KernelCall::ProtectedResume)),
    ns("coroutine", "running", Passthrough),
    ns("coroutine", "status", Passthrough),
    ns("coroutine", "wrap", Passthrough),
    ns("coroutine", "yield", Passthrough),
    // utf8
    ns("utf8", "char", Passthrough),
    ns("utf8", "charpattern", Passthrough),
    ns("utf8", "codepoint", Passthrough),
    ns("utf8", "codes", Passthrough),
    ns("utf8", "len", Passthrough),
    ns("utf8", "offset", Passthrough),
    // os
    ns("os", "clock", Passthrough),
    ns("os", "date", Passthrough),
    ns("os", "difftime", Passthrough),
    ns("os", "time", Passthrough),
    ns("os", "exit", Disabled),
    // resource
    ns("resource", "load_image", Host(HostCall::LoadImage)),
    ns("resource", "load_video", Host(HostCall::LoadVideo)),
    ns("resource", "load_font", Host(HostCall::LoadFont)),
    ns("resource", "load_file", Host(HostCall::LoadFile)),
    ns("resource", "create_shader", Host(HostCall::CreateShader)),
    ns("resource", "create_snapshot", Host(HostCall::CreateSnapshot)),
    ns(
        "resource",
        "create_colored_texture",
        Host(HostCall::CreateColoredTexture),
    ),
    ns("resource", "create_vnc", Host(HostCall::CreateVnc)),
    // gl
    ns("gl", "setup", Host(HostCall::Setup)),
    ns("gl", "clear", Host(HostCall::Clear)),
    ns("gl", "pushMatrix", Host(HostCall::PushMatrix)),
    ns("gl", "popMatrix", Host(HostCall::PopMatrix)),
    ns("gl", "rotate", Host(HostCall::Rotate)),
    ns("gl", "translate", Host(HostCall::Translate)),
    ns("gl", "scale", Host(HostCall::Scale)),
    ns("gl", "ortho", Host(HostCall::Ortho)),
    ns("gl", "perspective", Host(HostCall::Perspective)),
    // sys
    ns("sys", "now", Host(HostCall::Now)),
    ns("sys", "get_env", Host(HostCall::GetEnv)),
    ns("sys", "provides", Host(HostCall::Provides)),
    // node
    ns("node", "event", Kernel(KernelCall::On)),
    ns("node", "dispatch", Kernel(KernelCall::Dispatch)),
    ns("node", "reset_error", Kernel(KernelCall::ResetError)),
    ns("node", "persistent", Kernel(KernelCall::Persistent)),
    ns("node", "name", Kernel(KernelCall::NodeName)),
    ns("node", "client_write", Host(HostCall::ClientWrite)),
];

/// Namespace names in manifest order, without duplicates.
pub fn namespaces() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for entry in MANIFEST {
        if let Some(ns) = entry.namespace {
            if !names.contains(&ns) {
                names.push(ns);
            }
        }
    }
    names
}

/// Find the manifest row for a symbol.
pub fn lookup(namespace: Option<&str>, symbol: &str) -> Option<&'static CapabilityEntry> {
    MANIFEST
        .iter()
        .find(|e| e.namespace == namespace && e.symbol == symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_symbols() {
        let mut seen = HashSet::new();
        for entry in MANIFEST {
            assert!(
                seen.insert(entry.qualified_name()),
                "duplicate entry {}",
                entry.qualified_name()
            );
        }
    }

    #[test]
    fn test_unsafe_namespaces_absent() {
        let names = namespaces();
        for forbidden in ["io", "debug", "package"] {
            assert!(!names.contains(&forbidden));
        }
        assert!(lookup(Some("string"), "dump").is_none());
        assert!(lookup(Some("os"), "execute").is_none());
        assert!(lookup(Some("os"), "getenv").is_none());
    }

    #[test]
    fn test_exit_is_disabled() {
        assert_eq!(lookup(None, "exit").unwrap().capability, Capability::Disabled);
        assert_eq!(
            lookup(Some("os"), "exit").unwrap().capability,
            Capability::Disabled
        );
    }

    #[test]
    fn test_limit_boundary() {
        let policy = LimitPolicy::MaxSubjectLen(MAX_SUBJECT_LEN);
        assert!(policy.check("string.find", 32768).is_ok());

        let err = policy.check("string.find", 32769).unwrap_err();
        assert_eq!(
            err,
            SandboxError::ResourceLimitExceeded {
                function: "string.find".to_string(),
                limit: 32768,
                actual: 32769,
            }
        );
    }

    #[test]
    fn test_repeat_output_len() {
        assert_eq!(LimitPolicy::repeat_output_len(3, 4, 0), 12);
        assert_eq!(LimitPolicy::repeat_output_len(3, 4, 2), 18);
        assert_eq!(LimitPolicy::repeat_output_len(3, 0, 2), 0);
        assert_eq!(LimitPolicy::repeat_output_len(3, -5, 2), 0);
        assert_eq!(LimitPolicy::repeat_output_len(usize::MAX, 2, 0), usize::MAX);
    }

    #[test]
    fn test_replace_output_len() {
        assert_eq!(LimitPolicy::replace_output_len(4, b"xy", None), 4 + 5 * 2);
        assert_eq!(LimitPolicy::replace_output_len(4, b"xy", Some(1)), 4 + 2);
        assert_eq!(LimitPolicy::replace_output_len(4, b"xy", Some(0)), 4);
        assert_eq!(LimitPolicy::replace_output_len(4, b"%%", None), 4 + 5);
        assert_eq!(LimitPolicy::replace_output_len(4, b"<%0>", None), 4 + 5 * 6);
        assert_eq!(LimitPolicy::replace_output_len(0, b"", None), 0);
    }

    #[test]
    fn test_replace_policy_bounds_output() {
        let policy = LimitPolicy::MaxReplaceOutput {
            subject: MAX_SUBJECT_LEN,
            output: MAX_REPLACE_OUTPUT,
        };
        assert!(policy.check("string.gsub", 32768).is_ok());
        assert!(policy.check("string.gsub", 32769).is_err());

        let estimate = LimitPolicy::replace_output_len(32768, &[b'x'; 32768], None);
        let err = policy.check_output("string.gsub", estimate).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ResourceLimitExceeded { limit, .. } if limit == MAX_REPLACE_OUTPUT
        ));
        assert!(LimitPolicy::MaxSubjectLen(8).check_output("string.find", usize::MAX).is_ok());
    }

    #[test]
    fn test_limited_entries_are_string_functions() {
        for entry in MANIFEST {
            if let Capability::Limited(_) = entry.capability {
                assert_eq!(entry.namespace, Some("string"));
            }
        }
    }
}
