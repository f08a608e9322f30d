//! # lantern-runtime
//!
//! Engine-independent pieces of the Lantern script sandbox.
//!
//! This crate provides:
//! - The chunk load policy (`SafeLoader`)
//! - The static capability manifest scripts are restricted to
//! - Ordered multi-source module resolution
//! - The menu options manifest
//!
//! ## Security Model
//!
//! Scripts never see the host's own namespace. A context builder copies
//! exactly the symbols listed in [`capability::MANIFEST`], wrapping the ones
//! that could be abused for resource exhaustion, and all chunks pass through
//! the loader's precompiled-code policy.

pub mod capability;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod resolve;

pub use capability::{Capability, CapabilityEntry, HostCall, KernelCall, LimitPolicy, MANIFEST};
pub use error::{SandboxError, SandboxResult};
pub use loader::{is_precompiled, ChunkCompiler, SafeLoader, BYTECODE_MARKER};
pub use manifest::{OptionKind, OptionSpec, OptionValue, OptionsManifest};
pub use resolve::{EmbeddedBundles, Lookup, ModuleResolver, ModuleSource};
