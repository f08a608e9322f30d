//! # lantern-node
//!
//! Sandboxed execution kernel for Lantern display nodes.
//!
//! A node is a directory of Lua code and content files. This crate runs
//! that code inside restricted execution contexts:
//!
//! - Only symbols from the capability manifest are visible
//! - Pattern functions are bounded against oversized input
//! - `require` resolves node files first, then embedded bundles
//! - Code changes swap in a fresh context, keeping the old one on failure
//! - A persistent table and menu sessions survive reloads
//! - A CPU watchdog can abort runaway code from another thread
//!
//! ## Example
//!
//! ```no_run
//! use lantern_node::{MemoryHost, Node, NodeConfig};
//! use std::rc::Rc;
//!
//! let host = Rc::new(MemoryHost::new());
//! host.set_file("node.lua", "function node.render() end");
//!
//! let mut node = Node::new(host, NodeConfig::new("lobby")).unwrap();
//! node.boot().unwrap();
//! node.render_self(1920.0, 1080.0).unwrap();
//! ```

pub mod actions;
pub mod bridge;
pub mod environment;
pub mod events;
pub mod host;
pub mod kernel;
pub mod lifecycle;
pub mod modules;
pub mod persistent;
pub mod session;
pub mod watchdog;

pub use environment::{CapabilityEnvironment, ExecutionContext, LuaCompiler};
pub use events::{EventArg, EventBus};
pub use host::{
    ClientId, DrawOp, HostFunctions, LogLevel, MemoryHost, ResourceInfo, ResourceRequest,
};
pub use kernel::{Inventory, Kernel, NodeState};
pub use lifecycle::{default_menu, Node, NodeConfig, Viewport};
pub use session::{Menu, MenuAction, SessionIo};
pub use watchdog::WatchdogHandle;
