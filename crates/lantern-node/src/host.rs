//! Host functions exposed to node scripts.
//!
//! The kernel never touches files, GPU state or client connections itself.
//! Every side effect goes through [`HostFunctions`], which the daemon
//! implements against a real node directory and display, and which tests
//! implement with [`MemoryHost`].

use lantern_runtime::{SandboxError, SandboxResult};
use mlua::{UserData, UserDataMethods};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

/// Identifier of a connected menu client.
pub type ClientId = u64;

/// Log level for script logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A resource a script asked the host to create.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceRequest {
    Image { name: String },
    Video { name: String },
    Font { name: String },
    Shader { vertex: String, fragment: String },
    Snapshot,
    ColoredTexture { r: f64, g: f64, b: f64, a: f64 },
    Vnc { host: String, port: u16 },
}

impl ResourceRequest {
    /// Short kind name used in logs and `tostring`.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceRequest::Image { .. } => "image",
            ResourceRequest::Video { .. } => "video",
            ResourceRequest::Font { .. } => "font",
            ResourceRequest::Shader { .. } => "shader",
            ResourceRequest::Snapshot => "snapshot",
            ResourceRequest::ColoredTexture { .. } => "texture",
            ResourceRequest::Vnc { .. } => "vnc",
        }
    }

    /// Node directory file backing this resource, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            ResourceRequest::Image { name }
            | ResourceRequest::Video { name }
            | ResourceRequest::Font { name } => Some(name),
            _ => None,
        }
    }
}

/// What the host hands back for a created resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceInfo {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// One drawing command.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Clear { r: f64, g: f64, b: f64, a: f64 },
    PushMatrix,
    PopMatrix,
    Rotate { angle: f64, x: f64, y: f64, z: f64 },
    Translate { x: f64, y: f64, z: f64 },
    Scale { x: f64, y: f64, z: f64 },
    Ortho,
    Perspective { fov: f64, eye: [f64; 3], center: [f64; 3] },
    Draw {
        resource: u64,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        alpha: f64,
    },
}

/// Host functions available to node scripts.
pub trait HostFunctions {
    /// Read a file from the node directory. `Ok(None)` if it does not exist.
    fn read_file(&self, name: &str) -> SandboxResult<Option<Vec<u8>>>;

    /// Create a GPU or media resource.
    fn load_resource(&self, request: &ResourceRequest) -> SandboxResult<ResourceInfo>;

    /// Release a resource created by `load_resource`.
    fn release_resource(&self, id: u64);

    /// Submit a drawing command.
    fn draw(&self, op: DrawOp);

    /// Seconds since host start.
    fn now(&self) -> f64;

    /// Host environment lookup.
    fn env(&self, key: &str) -> Option<String>;

    /// Whether the host supports an optional feature.
    fn provides(&self, feature: &str) -> bool;

    /// Send text to a connected client.
    fn client_write(&self, client: ClientId, data: &str);

    /// Log a message (always allowed).
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "script", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "script", "{}", message),
            LogLevel::Info => tracing::info!(target: "script", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "script", "{}", message),
            LogLevel::Error => tracing::error!(target: "script", "{}", message),
        }
    }
}

/// In-memory host used by tests and headless runs.
#[derive(Default)]
pub struct MemoryHost {
    files: RefCell<HashMap<String, Vec<u8>>>,
    outputs: RefCell<BTreeMap<ClientId, String>>,
    draws: RefCell<Vec<DrawOp>>,
    logs: RefCell<Vec<(LogLevel, String)>>,
    live: RefCell<HashSet<u64>>,
    next_resource: Cell<u64>,
    clock: Cell<f64>,
    env: RefCell<HashMap<String, String>>,
    features: RefCell<HashSet<String>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node directory file.
    pub fn set_file(&self, name: &str, content: impl Into<Vec<u8>>) {
        self.files
            .borrow_mut()
            .insert(name.to_string(), content.into());
    }

    pub fn remove_file(&self, name: &str) {
        self.files.borrow_mut().remove(name);
    }

    /// Everything written to `client` so far.
    pub fn output(&self, client: ClientId) -> String {
        self.outputs
            .borrow()
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain what was written to `client`.
    pub fn take_output(&self, client: ClientId) -> String {
        self.outputs
            .borrow_mut()
            .remove(&client)
            .unwrap_or_default()
    }

    pub fn draws(&self) -> Vec<DrawOp> {
        self.draws.borrow().clone()
    }

    pub fn take_draws(&self) -> Vec<DrawOp> {
        std::mem::take(&mut *self.draws.borrow_mut())
    }

    /// Messages logged through `log`, including script `print` output.
    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.logs.borrow().clone()
    }

    /// Number of resources created and not yet released.
    pub fn live_resources(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn set_now(&self, seconds: f64) {
        self.clock.set(seconds);
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.env
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_feature(&self, feature: &str) {
        self.features.borrow_mut().insert(feature.to_string());
    }
}

impl HostFunctions for MemoryHost {
    fn read_file(&self, name: &str) -> SandboxResult<Option<Vec<u8>>> {
        Ok(self.files.borrow().get(name).cloned())
    }

    fn load_resource(&self, request: &ResourceRequest) -> SandboxResult<ResourceInfo> {
        if let Some(file) = request.file() {
            if !self.files.borrow().contains_key(file) {
                return Err(SandboxError::Host(format!("no such file '{}'", file)));
            }
        }

        let id = self.next_resource.get() + 1;
        self.next_resource.set(id);
        self.live.borrow_mut().insert(id);

        Ok(ResourceInfo {
            id,
            width: 1,
            height: 1,
        })
    }

    fn release_resource(&self, id: u64) {
        self.live.borrow_mut().remove(&id);
    }

    fn draw(&self, op: DrawOp) {
        self.draws.borrow_mut().push(op);
    }

    fn now(&self) -> f64 {
        self.clock.get()
    }

    fn env(&self, key: &str) -> Option<String> {
        self.env.borrow().get(key).cloned()
    }

    fn provides(&self, feature: &str) -> bool {
        self.features.borrow().contains(feature)
    }

    fn client_write(&self, client: ClientId, data: &str) {
        self.outputs
            .borrow_mut()
            .entry(client)
            .or_default()
            .push_str(data);
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.logs.borrow_mut().push((level, message.to_string()));
    }
}

/// Script-side handle to a host resource.
///
/// Released when the script calls `dispose` or when the Lua value is
/// collected, whichever comes first.
pub struct ResourceHandle {
    info: ResourceInfo,
    kind: &'static str,
    host: Rc<dyn HostFunctions>,
    disposed: Cell<bool>,
}

impl ResourceHandle {
    pub(crate) fn new(info: ResourceInfo, kind: &'static str, host: Rc<dyn HostFunctions>) -> Self {
        Self {
            info,
            kind,
            host,
            disposed: Cell::new(false),
        }
    }

    fn release(&self) {
        if !self.disposed.replace(true) {
            self.host.release_resource(self.info.id);
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl UserData for ResourceHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("size", |_, this, ()| Ok((this.info.width, this.info.height)));

        methods.add_method(
            "draw",
            |_, this, (x1, y1, x2, y2, alpha): (f64, f64, f64, f64, Option<f64>)| {
                if this.disposed.get() {
                    return Err(mlua::Error::external(SandboxError::Host(format!(
                        "{} resource {} was disposed",
                        this.kind, this.info.id
                    ))));
                }
                this.host.draw(DrawOp::Draw {
                    resource: this.info.id,
                    x1,
                    y1,
                    x2,
                    y2,
                    alpha: alpha.unwrap_or(1.0),
                });
                Ok(())
            },
        );

        methods.add_method("dispose", |_, this, ()| {
            this.release();
            Ok(())
        });

        methods.add_meta_method(mlua::MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{}<{}>", this.kind, this.info.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_host_files() {
        let host = MemoryHost::new();
        host.set_file("node.lua", "print(1)");
        assert_eq!(host.read_file("node.lua").unwrap(), Some(b"print(1)".to_vec()));
        host.remove_file("node.lua");
        assert_eq!(host.read_file("node.lua").unwrap(), None);
    }

    #[test]
    fn test_memory_host_resources() {
        let host = MemoryHost::new();
        let missing = host.load_resource(&ResourceRequest::Image {
            name: "logo.png".to_string(),
        });
        assert!(matches!(missing, Err(SandboxError::Host(_))));

        host.set_file("logo.png", vec![0u8; 4]);
        let info = host
            .load_resource(&ResourceRequest::Image {
                name: "logo.png".to_string(),
            })
            .unwrap();
        assert_eq!(host.live_resources(), 1);

        host.release_resource(info.id);
        assert_eq!(host.live_resources(), 0);
    }

    #[test]
    fn test_client_output_accumulates() {
        let host = MemoryHost::new();
        host.client_write(3, "a");
        host.client_write(3, "b");
        assert_eq!(host.output(3), "ab");
        assert_eq!(host.take_output(3), "ab");
        assert_eq!(host.output(3), "");
    }

    #[test]
    fn test_handle_released_once() {
        let host = Rc::new(MemoryHost::new());
        let info = host.load_resource(&ResourceRequest::Snapshot).unwrap();
        let handle = ResourceHandle::new(info, "snapshot", host.clone());
        handle.release();
        handle.release();
        drop(handle);
        assert_eq!(host.live_resources(), 0);
    }
}
