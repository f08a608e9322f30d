//! Node lifecycle.
//!
//! The host drives a [`Node`] through a small set of signals: boot, content
//! and child changes, named events, render requests and shutdown. Code
//! changes build a brand new execution context; the previous one is only
//! replaced once the new one has loaded, so a broken edit leaves the last
//! working code running.

use crate::bridge::script_error;
use crate::environment::{self, CapabilityEnvironment, ExecutionContext, StringMetatable};
use crate::events::EventArg;
use crate::host::{ClientId, DrawOp, HostFunctions};
use crate::kernel::{Kernel, NodeState, KERNEL};
use crate::watchdog::{self, WatchdogHandle};
use lantern_runtime::{OptionValue, OptionsManifest, SandboxError, SandboxResult};
use mlua::{Function, IntoLua, IntoLuaMulti, Lua, MultiValue, Value};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info};

const USERLIB: &str = include_str!("../lua/userlib.lua");
const DEFAULT_MENU: &str = include_str!("../menu.toml");

/// Default CPU limit when the menu does not declare `cpu_limit_ms`.
pub const DEFAULT_CPU_LIMIT: Duration = Duration::from_millis(2000);

/// The built-in menu.
pub fn default_menu() -> SandboxResult<OptionsManifest> {
    OptionsManifest::from_str(DEFAULT_MENU)
}

/// Node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name, visible to scripts as `node.name`.
    pub name: String,

    /// Node code files, run in order on every (re)load.
    pub scripts: Vec<String>,

    /// Accept precompiled chunks for node code.
    pub allow_precompiled: bool,

    /// Stretch output instead of keeping the aspect ratio.
    pub full_scale: bool,

    /// Lua heap limit in bytes.
    pub memory_limit: Option<usize>,

    /// Menu manifest; the built-in one when `None`.
    pub menu: Option<OptionsManifest>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: vec!["node.lua".to_string()],
            allow_precompiled: false,
            full_scale: false,
            memory_limit: None,
            menu: None,
        }
    }

    /// Apply `LANTERN_ALLOW_PRECOMPILED` and `LANTERN_FULL_SCALE`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if env_flag(lookup("LANTERN_ALLOW_PRECOMPILED")) {
            self.allow_precompiled = true;
        }
        if env_flag(lookup("LANTERN_FULL_SCALE")) {
            self.full_scale = true;
        }
        self
    }
}

fn env_flag(value: Option<String>) -> bool {
    match value {
        Some(v) => !matches!(v.trim(), "" | "0" | "false" | "no" | "off"),
        None => false,
    }
}

/// Client ids travel through scripts as Lua integers.
fn client_arg(client: ClientId) -> SandboxResult<EventArg> {
    i64::try_from(client)
        .map(EventArg::Integer)
        .map_err(|_| SandboxError::Host(format!("client id {} out of range", client)))
}

/// Placement of native-size output on the screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Viewport {
    /// Fit `native` into `screen`, centred with aspect kept, or stretched.
    pub fn fit(native: (f64, f64), screen: (f64, f64), full_scale: bool) -> Self {
        let (native_w, native_h) = native;
        let (screen_w, screen_h) = screen;

        if native_w <= 0.0 || native_h <= 0.0 {
            return Self {
                x: 0.0,
                y: 0.0,
                scale_x: 1.0,
                scale_y: 1.0,
            };
        }

        if full_scale {
            return Self {
                x: 0.0,
                y: 0.0,
                scale_x: screen_w / native_w,
                scale_y: screen_h / native_h,
            };
        }

        let scale = (screen_w / native_w).min(screen_h / native_h);
        Self {
            x: (screen_w - native_w * scale) / 2.0,
            y: (screen_h - native_h * scale) / 2.0,
            scale_x: scale,
            scale_y: scale,
        }
    }
}

/// A running node: one Lua state, its kernel and the active context.
pub struct Node {
    context: Option<ExecutionContext>,
    kernel: Rc<Kernel>,
    string_metatable: StringMetatable,
    watchdog: WatchdogHandle,
    config: NodeConfig,
    lua: Lua,
}

impl Node {
    /// Create the Lua state and kernel. Node code is not run until
    /// [`Node::boot`].
    pub fn new(host: Rc<dyn HostFunctions>, config: NodeConfig) -> SandboxResult<Self> {
        let lua = Lua::new();
        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit).map_err(script_error)?;
        }

        let string_metatable = environment::string_metatable(&lua).map_err(script_error)?;
        environment::seal_globals(&lua).map_err(script_error)?;

        let watchdog = WatchdogHandle::new();
        watchdog::install(&lua, watchdog.clone());

        let menu = match &config.menu {
            Some(menu) => menu.clone(),
            None => default_menu()?,
        };
        let kernel = Kernel::new(&lua, &config.name, host, menu)?;

        info!(node = %config.name, scripts = ?config.scripts, "Node created");

        Ok(Self {
            context: None,
            kernel,
            string_metatable,
            watchdog,
            config,
            lua,
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn kernel(&self) -> &Rc<Kernel> {
        &self.kernel
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The active execution context.
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    pub fn state(&self) -> NodeState {
        self.kernel.state()
    }

    /// Last unhandled script error, cleared by `node.reset_error()` and by
    /// a successful reload.
    pub fn fault(&self) -> Option<String> {
        self.kernel.fault()
    }

    /// Handle for the CPU watchdog monitor.
    pub fn watchdog(&self) -> &WatchdogHandle {
        &self.watchdog
    }

    /// Current menu value of an option.
    pub fn option(&self, name: &str) -> Option<OptionValue> {
        self.kernel.menu().value(name)
    }

    /// CPU limit for one script entry.
    pub fn cpu_limit(&self) -> Duration {
        match self.option("cpu_limit_ms").and_then(|v| v.as_number()) {
            Some(ms) if ms >= 0.0 => Duration::from_millis(ms as u64),
            _ => DEFAULT_CPU_LIMIT,
        }
    }

    /// `require` a module into the active context.
    pub fn require(&self, name: &str) -> SandboxResult<Value> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| SandboxError::Host("node is not running".to_string()))?;
        let _busy = self.watchdog.enter(self.cpu_limit());
        context.require(&self.lua, &self.kernel, name)
    }

    /// Build the first context and run node code.
    pub fn boot(&mut self) -> SandboxResult<()> {
        if self.state() == NodeState::Teardown {
            debug!(node = %self.kernel.name(), "Boot ignored during teardown");
            return Ok(());
        }
        self.load(true)
    }

    /// A file in the node directory appeared, changed or disappeared.
    pub fn content_update(&mut self, name: &str, added: bool) -> SandboxResult<()> {
        if self.state() == NodeState::Teardown {
            return Ok(());
        }

        if self.config.scripts.iter().any(|script| script == name) {
            if added {
                info!(node = %self.kernel.name(), file = name, "Node code changed, reloading");
                return self.load(true);
            }
            info!(node = %self.kernel.name(), file = name, "Node code removed, resetting");
            return self.load(false);
        }

        let now = self.kernel.host().now();
        if added {
            self.kernel.inventory_mut().add_content(name, now);
            self.dispatch("content_update", name.to_string())
        } else {
            self.kernel.inventory_mut().remove_content(name);
            self.dispatch("content_remove", name.to_string())
        }
    }

    /// A child node appeared or disappeared.
    pub fn child_update(&mut self, name: &str, added: bool) -> SandboxResult<()> {
        if self.state() == NodeState::Teardown {
            return Ok(());
        }

        let now = self.kernel.host().now();
        if added {
            self.kernel.inventory_mut().add_child(name, now);
            self.dispatch("child_add", name.to_string())
        } else {
            self.kernel.inventory_mut().remove_child(name);
            self.dispatch("child_remove", name.to_string())
        }
    }

    /// Dispatch a named event with host-supplied arguments.
    pub fn event(&mut self, name: &str, args: Vec<EventArg>) -> SandboxResult<()> {
        if self.state() == NodeState::Teardown {
            return Ok(());
        }

        let values = args
            .into_iter()
            .map(|arg| arg.into_lua(&self.lua))
            .collect::<mlua::Result<MultiValue>>()
            .map_err(script_error)?;
        self.dispatch(name, values)
    }

    /// A menu client connected.
    pub fn connect(&mut self, client: ClientId) -> SandboxResult<()> {
        self.event("connect", vec![client_arg(client)?])
    }

    /// A line of input from a menu client.
    pub fn input(&mut self, client: ClientId, line: &str) -> SandboxResult<()> {
        self.event("input", vec![EventArg::from(line), client_arg(client)?])
    }

    /// A menu client went away.
    pub fn disconnect(&mut self, client: ClientId) -> SandboxResult<()> {
        self.event("disconnect", vec![client_arg(client)?])
    }

    /// Draw one frame at `width` x `height`.
    pub fn render_self(&mut self, width: f64, height: f64) -> SandboxResult<()> {
        let Some(context) = &self.context else {
            return Ok(());
        };
        if self.state() == NodeState::Teardown {
            return Ok(());
        }

        let host = self.kernel.host();
        host.draw(DrawOp::Clear {
            r: 0.0,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        });

        let render = match context.env().raw_get::<Value>("node") {
            Ok(Value::Table(node)) => node.raw_get::<Option<Function>>("render").ok().flatten(),
            _ => None,
        };
        let Some(render) = render else {
            return Ok(());
        };

        host.draw(DrawOp::PushMatrix);
        if let Some(native) = context.native_size() {
            let full_scale = self.config.full_scale
                || self
                    .option("full_scale")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
            let viewport = Viewport::fit(native, (width, height), full_scale);
            host.draw(DrawOp::Translate {
                x: viewport.x,
                y: viewport.y,
                z: 0.0,
            });
            host.draw(DrawOp::Scale {
                x: viewport.scale_x,
                y: viewport.scale_y,
                z: 1.0,
            });
        }

        let result = {
            let _busy = self.watchdog.enter(self.cpu_limit());
            render.call::<()>(())
        };
        host.draw(DrawOp::PopMatrix);

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.report("render", err),
        }
    }

    /// Stop accepting signals and drop the active context.
    pub fn shutdown(&mut self) {
        info!(node = %self.kernel.name(), "Node shutting down");
        self.kernel.set_state(NodeState::Teardown);
        self.kernel.persistent().sessions().clear();
        self.context = None;
    }

    /// Build a context, run node code, and switch to it.
    fn load(&mut self, run_scripts: bool) -> SandboxResult<()> {
        let previous = self.state();
        let reloading = self.context.is_some();
        self.kernel.set_state(if reloading {
            NodeState::Reloading
        } else {
            NodeState::Booting
        });
        self.kernel.clear_fault();

        match self.build_context(run_scripts) {
            Err(err) => {
                error!(
                    target: KERNEL,
                    node = %self.kernel.name(),
                    "Failed to set up execution context: {}", err
                );
                self.reactivate_current();
                self.kernel.set_state(previous);
                Err(err)
            }
            Ok((context, None)) => {
                self.install(context);
                info!(node = %self.kernel.name(), "Node code loaded");
                self.replay_inventory()
            }
            Ok((context, Some(err))) => {
                error!(target: KERNEL, node = %self.kernel.name(), "Node code failed: {}", err);
                if err.is_fatal() {
                    self.watchdog.reset();
                }

                if reloading {
                    info!(node = %self.kernel.name(), "Keeping previously loaded code");
                    self.reactivate_current();
                    self.kernel.set_state(NodeState::Running);
                    self.kernel.set_fault(err.to_string());
                    return if err.is_fatal() { Err(err) } else { Ok(()) };
                }

                self.install(context);
                let replay = self.replay_inventory();
                self.kernel.set_fault(err.to_string());
                if err.is_fatal() {
                    return Err(err);
                }
                replay
            }
        }
    }

    /// Returns the new context and the node code error, if any. `Err` is
    /// reserved for failures before node code runs.
    fn build_context(
        &self,
        run_scripts: bool,
    ) -> SandboxResult<(ExecutionContext, Option<SandboxError>)> {
        let _busy = self.watchdog.enter(self.cpu_limit());

        let context = CapabilityEnvironment::new(&self.lua, &self.kernel).build()?;
        context
            .activate(&self.string_metatable)
            .map_err(script_error)?;
        context.exec(&self.lua, USERLIB.as_bytes(), "userlib", true)?;

        if !run_scripts {
            return Ok((context, None));
        }

        for script in &self.config.scripts {
            let source = match self.kernel.host().read_file(script) {
                Ok(Some(source)) => source,
                Ok(None) => {
                    debug!(node = %self.kernel.name(), script = %script, "Node code file absent");
                    continue;
                }
                Err(err) => return Ok((context, Some(err))),
            };

            debug!(node = %self.kernel.name(), script = %script, "Running node code");
            if let Err(err) = context.exec(&self.lua, &source, script, self.config.allow_precompiled)
            {
                return Ok((context, Some(err)));
            }
        }

        Ok((context, None))
    }

    fn install(&mut self, context: ExecutionContext) {
        self.context = Some(context);
        self.kernel.set_state(NodeState::Running);
    }

    fn reactivate_current(&self) {
        if let Some(context) = &self.context {
            if let Err(err) = context.activate(&self.string_metatable) {
                error!(target: KERNEL, "Failed to restore string metatable: {}", err);
            }
        }
    }

    /// Announce every known child and content file to a fresh context.
    fn replay_inventory(&self) -> SandboxResult<()> {
        let (children, contents) = self.kernel.inventory().snapshot();
        for child in children {
            self.dispatch("child_add", child)?;
        }
        for content in contents {
            self.dispatch("content_update", content)?;
        }
        Ok(())
    }

    fn dispatch<A>(&self, channel: &str, args: A) -> SandboxResult<()>
    where
        A: IntoLuaMulti + Clone,
    {
        let Some(context) = &self.context else {
            return Ok(());
        };

        let result = {
            let _busy = self.watchdog.enter(self.cpu_limit());
            context.bus().dispatch(channel, args)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.report(channel, err),
        }
    }

    /// Log a script failure and set the fault indicator. Fatal errors are
    /// returned to the host; everything else is absorbed.
    fn report(&self, event: &str, err: mlua::Error) -> SandboxResult<()> {
        let err = script_error(err);
        error!(target: KERNEL, node = %self.kernel.name(), event, "{}", err);
        self.kernel.set_fault(err.to_string());

        if err.is_fatal() {
            self.watchdog.reset();
            return Err(err);
        }
        Ok(())
    }
}
