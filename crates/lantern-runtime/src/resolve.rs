//! Module resolution across ordered sources.
//!
//! `require("name")` is resolved against each source in turn:
//!
//! 1. A file `<name>.lua` provided by the host (node directory)
//! 2. The embedded bundle registry
//!
//! The first source that finds the module wins. Every source that does not
//! find it contributes one diagnostic line; when none finds it the lines
//! are reported together, in source order.

use crate::error::{SandboxError, SandboxResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of asking one source for a module.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Module source bytes and the chunk label to compile them under.
    Found { label: String, source: Vec<u8> },

    /// Not present here; the string is this source's diagnostic line.
    NotFound(String),
}

/// A place modules can come from.
pub trait ModuleSource {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Look up a module. Errors are reserved for real failures (e.g. IO),
    /// absence is reported as [`Lookup::NotFound`].
    fn lookup(&self, module: &str) -> SandboxResult<Lookup>;
}

/// Statically embedded module sources, keyed by module name.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBundles {
    bundles: BTreeMap<String, &'static str>,
}

impl EmbeddedBundles {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            bundles: BTreeMap::new(),
        }
    }

    /// Register a bundle.
    pub fn insert(&mut self, name: impl Into<String>, source: &'static str) {
        self.bundles.insert(name.into(), source);
    }

    /// Check if a bundle is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }

    /// Registered bundle names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }
}

impl ModuleSource for EmbeddedBundles {
    fn name(&self) -> &str {
        "embedded"
    }

    fn lookup(&self, module: &str) -> SandboxResult<Lookup> {
        match self.bundles.get(module) {
            Some(source) => Ok(Lookup::Found {
                label: module.to_string(),
                source: source.as_bytes().to_vec(),
            }),
            None => Ok(Lookup::NotFound(format!(
                "no embedded module '{}'",
                module
            ))),
        }
    }
}

/// Ordered list of module sources.
#[derive(Default)]
pub struct ModuleResolver {
    sources: Vec<Box<dyn ModuleSource>>,
}

impl ModuleResolver {
    /// Create a resolver with no sources.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Append a source. Sources added first have priority.
    pub fn push(&mut self, source: Box<dyn ModuleSource>) {
        self.sources.push(source);
    }

    /// Builder form of [`ModuleResolver::push`].
    pub fn with_source(mut self, source: Box<dyn ModuleSource>) -> Self {
        self.push(source);
        self
    }

    /// Number of configured sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Check if no sources are configured.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve a module to its source bytes.
    pub fn resolve(&self, module: &str) -> SandboxResult<(String, Vec<u8>)> {
        let mut diagnostics = String::new();

        for source in &self.sources {
            match source.lookup(module)? {
                Lookup::Found { label, source: bytes } => {
                    debug!(module, source = source.name(), "resolved module");
                    return Ok((label, bytes));
                }
                Lookup::NotFound(line) => {
                    diagnostics.push_str("\n\t");
                    diagnostics.push_str(&line);
                }
            }
        }

        Err(SandboxError::ModuleNotFound {
            name: module.to_string(),
            diagnostics,
        })
    }
}
