//! Execution contexts.
//!
//! A context is a fresh environment table built from the capability
//! manifest and nothing else. All contexts share one Lua state; the state's
//! real globals are sealed so that no code path can write into them, and
//! the string metatable is pointed at the active context's `string` table.

use crate::bridge::{is_fatal_error, raise, script_error};
use crate::events::EventBus;
use crate::host::{ClientId, DrawOp, HostFunctions, LogLevel, ResourceHandle, ResourceRequest};
use crate::kernel::{Kernel, KERNEL};
use crate::modules::{self, ModuleCache};
use lantern_runtime::capability::namespaces;
use lantern_runtime::{
    Capability, CapabilityEntry, ChunkCompiler, HostCall, KernelCall, LimitPolicy, SafeLoader,
    SandboxError, SandboxResult, MANIFEST,
};
use mlua::{ChunkMode, FromLuaMulti, Function, Lua, MultiValue, Table, Value, Variadic};
use std::cell::Cell;
use std::rc::Rc;
use tracing::warn;

const GUARD_SOURCE: &str = include_str!("../lua/guard.lua");

/// Compiles chunks into a fixed environment table.
pub struct LuaCompiler<'lua> {
    lua: &'lua Lua,
    env: Table,
}

impl<'lua> LuaCompiler<'lua> {
    pub fn new(lua: &'lua Lua, env: Table) -> Self {
        Self { lua, env }
    }
}

impl ChunkCompiler for LuaCompiler<'_> {
    type Unit = Function;

    fn compile(&self, source: &[u8], label: &str, text_only: bool) -> SandboxResult<Function> {
        let mut chunk = self
            .lua
            .load(source.to_vec())
            .set_name(format!("={}", label))
            .set_environment(self.env.clone());
        if text_only {
            chunk = chunk.set_mode(ChunkMode::Text);
        }
        chunk.into_function().map_err(script_error)
    }
}

/// One isolated script environment.
pub struct ExecutionContext {
    env: Table,
    string_lib: Table,
    bus: EventBus,
    modules: ModuleCache,
    native_size: Rc<Cell<Option<(f64, f64)>>>,
}

impl ExecutionContext {
    /// The environment table scripts see as `_G`.
    pub fn env(&self) -> &Table {
        &self.env
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Size declared by `gl.setup`, if called.
    pub fn native_size(&self) -> Option<(f64, f64)> {
        self.native_size.get()
    }

    /// Compile and run a chunk in this context.
    pub fn exec(
        &self,
        lua: &Lua,
        source: &[u8],
        label: &str,
        allow_precompiled: bool,
    ) -> SandboxResult<()> {
        let loader = SafeLoader::new(LuaCompiler::new(lua, self.env.clone()));
        let chunk = loader.compile(source, label, allow_precompiled)?;
        chunk.call::<()>(()).map_err(script_error)
    }

    /// Evaluate a text chunk and convert its results.
    pub fn eval<R: FromLuaMulti>(&self, lua: &Lua, source: &str) -> SandboxResult<R> {
        let loader = SafeLoader::new(LuaCompiler::new(lua, self.env.clone()));
        let chunk = loader.compile(source.as_bytes(), "eval", false)?;
        chunk.call::<R>(()).map_err(script_error)
    }

    /// `require` from the host side.
    pub fn require(&self, lua: &Lua, kernel: &Kernel, name: &str) -> SandboxResult<Value> {
        modules::require(lua, kernel.modules(), &self.modules, &self.env, name)
    }

    /// Point the shared string metatable at this context's `string` table.
    /// Everything else is dropped except the arithmetic coercion
    /// metamethods.
    pub(crate) fn activate(&self, string_metatable: &StringMetatable) -> mlua::Result<()> {
        let table = &string_metatable.table;
        table.clear()?;
        for (event, handler) in &string_metatable.arithmetic {
            table.raw_set(*event, handler.clone())?;
        }
        table.raw_set("__index", self.string_lib.clone())?;
        table.raw_set("__metatable", false)
    }
}

/// Metamethods strings use to coerce themselves in arithmetic.
const STRING_ARITHMETIC: [&str; 8] = [
    "__add", "__sub", "__mul", "__div", "__mod", "__pow", "__unm", "__idiv",
];

/// The metatable shared by all strings, and the arithmetic metamethods it
/// came with.
pub(crate) struct StringMetatable {
    table: Table,
    arithmetic: Vec<(&'static str, Value)>,
}

/// Fetch the metatable shared by all strings. Must run before it is locked.
pub(crate) fn string_metatable(lua: &Lua) -> mlua::Result<StringMetatable> {
    let table = lua
        .load("return getmetatable('')")
        .set_name("=kernel")
        .eval::<Table>()?;

    let mut arithmetic = Vec::new();
    for event in STRING_ARITHMETIC {
        let handler = table.raw_get::<Value>(event)?;
        if !handler.is_nil() {
            arithmetic.push((event, handler));
        }
    }
    Ok(StringMetatable { table, arithmetic })
}

/// Make the state's real globals read-only.
pub(crate) fn seal_globals(lua: &Lua) -> mlua::Result<()> {
    let seal = lua.create_table()?;
    let newindex = lua.create_function(
        |_, (_, key, _): (Table, Value, Value)| -> mlua::Result<()> {
            let name = match key {
                Value::String(s) => s.to_string_lossy().to_string(),
                other => other.type_name().to_string(),
            };
            Err(raise(SandboxError::SandboxEscapeAttempt(name)))
        },
    )?;
    seal.raw_set("__newindex", newindex)?;
    seal.raw_set("__metatable", false)?;
    lua.globals().set_metatable(Some(seal));
    Ok(())
}

/// Kernel functions shared by several manifest entries.
struct KernelFunctions {
    on: Function,
    dispatch: Function,
    pcall: Function,
    xpcall: Function,
    resume: Function,
}

/// Builds execution contexts from the capability manifest.
pub struct CapabilityEnvironment<'a> {
    lua: &'a Lua,
    kernel: &'a Rc<Kernel>,
}

impl<'a> CapabilityEnvironment<'a> {
    pub fn new(lua: &'a Lua, kernel: &'a Rc<Kernel>) -> Self {
        Self { lua, kernel }
    }

    /// Build a fresh context.
    pub fn build(&self) -> SandboxResult<ExecutionContext> {
        self.try_build().map_err(script_error)
    }

    fn try_build(&self) -> mlua::Result<ExecutionContext> {
        let lua = self.lua;
        let globals = lua.globals();

        let env = lua.create_table()?;
        env.raw_set("_G", env.clone())?;

        let bus = EventBus::new(lua)?;
        let modules = ModuleCache::new(lua)?;
        let native_size = Rc::new(Cell::new(None));

        let (on, dispatch) = bus.script_api(lua)?;
        let (pcall, xpcall, resume) = guards(lua, &globals)?;
        let kernel_fns = KernelFunctions {
            on,
            dispatch,
            pcall,
            xpcall,
            resume,
        };

        for namespace in namespaces() {
            env.raw_set(namespace, lua.create_table()?)?;
        }

        for entry in MANIFEST {
            let value = match entry.capability {
                Capability::Passthrough => platform_value(&globals, entry)?,
                Capability::Limited(policy) => match platform_value(&globals, entry)? {
                    Value::Function(original) => Value::Function(limited(
                        lua,
                        original,
                        entry.qualified_name(),
                        policy,
                    )?),
                    _ => Value::Nil,
                },
                Capability::Disabled => Value::Function(disabled(lua, entry.qualified_name())?),
                Capability::Host(call) => self.host_value(call, &env, &native_size)?,
                Capability::Kernel(call) => self.kernel_value(call, &env, &modules, &kernel_fns)?,
            };

            if value.is_nil() {
                warn!(
                    target: KERNEL,
                    symbol = %entry.qualified_name(),
                    "Manifest symbol missing from platform library"
                );
                continue;
            }

            let target = match entry.namespace {
                Some(namespace) => env.raw_get::<Table>(namespace)?,
                None => env.clone(),
            };
            target.raw_set(entry.symbol, value)?;
        }

        self.install_session_handlers(&bus)?;

        let string_lib = env.raw_get::<Table>("string")?;
        Ok(ExecutionContext {
            env,
            string_lib,
            bus,
            modules,
            native_size,
        })
    }

    fn host_value(
        &self,
        call: HostCall,
        env: &Table,
        native_size: &Rc<Cell<Option<(f64, f64)>>>,
    ) -> mlua::Result<Value> {
        let lua = self.lua;
        let host = Rc::clone(self.kernel.host());

        let function = match call {
            HostCall::Print => {
                let tostring: Function = lua.globals().raw_get("tostring")?;
                lua.create_function(move |_, args: Variadic<Value>| {
                    let parts = args
                        .into_iter()
                        .map(|v| tostring.call::<String>(v))
                        .collect::<mlua::Result<Vec<_>>>()?;
                    host.log(LogLevel::Info, &parts.join("\t"));
                    Ok(())
                })?
            }
            HostCall::LoadImage => resource_fn(lua, host, |name: String| ResourceRequest::Image {
                name,
            })?,
            HostCall::LoadVideo => resource_fn(lua, host, |name: String| ResourceRequest::Video {
                name,
            })?,
            HostCall::LoadFont => resource_fn(lua, host, |name: String| ResourceRequest::Font {
                name,
            })?,
            HostCall::CreateShader => resource_fn(
                lua,
                host,
                |(vertex, fragment): (String, String)| ResourceRequest::Shader { vertex, fragment },
            )?,
            HostCall::CreateSnapshot => resource_fn(lua, host, |()| ResourceRequest::Snapshot)?,
            HostCall::CreateColoredTexture => resource_fn(
                lua,
                host,
                |(r, g, b, a): (f64, f64, f64, Option<f64>)| ResourceRequest::ColoredTexture {
                    r,
                    g,
                    b,
                    a: a.unwrap_or(1.0),
                },
            )?,
            HostCall::CreateVnc => resource_fn(
                lua,
                host,
                |(address, port): (String, Option<u16>)| ResourceRequest::Vnc {
                    host: address,
                    port: port.unwrap_or(5900),
                },
            )?,
            HostCall::LoadFile => lua.create_function(move |lua, name: String| {
                match host.read_file(&name).map_err(raise)? {
                    Some(bytes) => lua.create_string(&bytes),
                    None => Err(raise(SandboxError::Host(format!(
                        "no such file '{}'",
                        name
                    )))),
                }
            })?,
            HostCall::Setup => {
                let size = Rc::clone(native_size);
                lua.create_function(move |_, (env, width, height): (Table, f64, f64)| {
                    size.set(Some((width, height)));
                    env.raw_set("WIDTH", width)?;
                    env.raw_set("HEIGHT", height)
                })?
                .bind(env.clone())?
            }
            HostCall::Clear => draw_fn(lua, host, |(r, g, b, a): (f64, f64, f64, Option<f64>)| {
                DrawOp::Clear {
                    r,
                    g,
                    b,
                    a: a.unwrap_or(1.0),
                }
            })?,
            HostCall::PushMatrix => draw_fn(lua, host, |()| DrawOp::PushMatrix)?,
            HostCall::PopMatrix => draw_fn(lua, host, |()| DrawOp::PopMatrix)?,
            HostCall::Ortho => draw_fn(lua, host, |()| DrawOp::Ortho)?,
            HostCall::Rotate => draw_fn(
                lua,
                host,
                |(angle, x, y, z): (f64, f64, f64, f64)| DrawOp::Rotate { angle, x, y, z },
            )?,
            HostCall::Translate => draw_fn(lua, host, |(x, y, z): (f64, f64, Option<f64>)| {
                DrawOp::Translate {
                    x,
                    y,
                    z: z.unwrap_or(0.0),
                }
            })?,
            HostCall::Scale => draw_fn(lua, host, |(x, y, z): (f64, f64, Option<f64>)| {
                DrawOp::Scale {
                    x,
                    y,
                    z: z.unwrap_or(1.0),
                }
            })?,
            HostCall::Perspective => draw_fn(
                lua,
                host,
                |(fov, ex, ey, ez, cx, cy, cz): (f64, f64, f64, f64, f64, f64, f64)| {
                    DrawOp::Perspective {
                        fov,
                        eye: [ex, ey, ez],
                        center: [cx, cy, cz],
                    }
                },
            )?,
            HostCall::Now => lua.create_function(move |_, ()| Ok(host.now()))?,
            HostCall::GetEnv => lua.create_function(move |_, key: String| Ok(host.env(&key)))?,
            HostCall::Provides => {
                lua.create_function(move |_, feature: String| Ok(host.provides(&feature)))?
            }
            HostCall::ClientWrite => lua.create_function(
                move |_, (client, data): (ClientId, mlua::String)| {
                    host.client_write(client, &data.to_string_lossy());
                    Ok(())
                },
            )?,
        };

        Ok(Value::Function(function))
    }

    fn kernel_value(
        &self,
        call: KernelCall,
        env: &Table,
        modules: &ModuleCache,
        fns: &KernelFunctions,
    ) -> mlua::Result<Value> {
        let lua = self.lua;

        let function = match call {
            KernelCall::Require => {
                modules::script_require(lua, Rc::clone(self.kernel), modules, env)?
            }
            KernelCall::Load => lua
                .create_function(
                    |lua,
                     (default_env, chunk, name, _mode, env): (
                        Table,
                        mlua::String,
                        Option<String>,
                        Option<String>,
                        Option<Table>,
                    )| {
                        let label = name
                            .as_deref()
                            .map(|n| n.trim_start_matches(['=', '@']).to_string())
                            .unwrap_or_else(|| "load".to_string());
                        let source = chunk.as_bytes().to_vec();
                        let loader =
                            SafeLoader::new(LuaCompiler::new(lua, env.unwrap_or(default_env)));
                        match loader.compile(&source, &label, false) {
                            Ok(function) => Ok((Some(function), None)),
                            Err(err) => Ok((None, Some(err.to_string()))),
                        }
                    },
                )?
                .bind(env.clone())?,
            KernelCall::ProtectedCall => fns.pcall.clone(),
            KernelCall::ProtectedCallWithHandler => fns.xpcall.clone(),
            KernelCall::ProtectedResume => fns.resume.clone(),
            KernelCall::On => fns.on.clone(),
            KernelCall::Dispatch => fns.dispatch.clone(),
            KernelCall::ResetError => {
                let kernel = Rc::clone(self.kernel);
                lua.create_function(move |_, ()| {
                    kernel.clear_fault();
                    Ok(())
                })?
            }
            KernelCall::Persistent => {
                return Ok(Value::Table(self.kernel.persistent().table().clone()))
            }
            KernelCall::NodeName => {
                return Ok(Value::String(lua.create_string(self.kernel.name())?))
            }
        };

        Ok(Value::Function(function))
    }

    /// Seed the `connect`/`input`/`disconnect` channels with the menu.
    fn install_session_handlers(&self, bus: &EventBus) -> mlua::Result<()> {
        let lua = self.lua;

        let kernel = Rc::clone(self.kernel);
        let connect = lua.create_function(move |_, client: ClientId| {
            kernel.persistent().sessions().connect(
                client,
                Rc::clone(kernel.host()),
                Rc::clone(kernel.menu()),
            );
            Ok(())
        })?;

        let kernel = Rc::clone(self.kernel);
        let input = lua.create_function(move |_, (line, client): (mlua::String, ClientId)| {
            kernel
                .persistent()
                .sessions()
                .input(client, line.to_string_lossy().to_string());
            Ok(())
        })?;

        let kernel = Rc::clone(self.kernel);
        let disconnect = lua.create_function(move |_, client: ClientId| {
            kernel.persistent().sessions().disconnect(client);
            Ok(())
        })?;

        bus.on(lua, "connect", connect)?;
        bus.on(lua, "input", input)?;
        bus.on(lua, "disconnect", disconnect)
    }
}

/// Look a manifest symbol up in the state's own libraries.
fn platform_value(globals: &Table, entry: &CapabilityEntry) -> mlua::Result<Value> {
    match entry.namespace {
        None => globals.raw_get(entry.symbol),
        Some(namespace) => match globals.raw_get::<Value>(namespace)? {
            Value::Table(table) => table.raw_get(entry.symbol),
            _ => Ok(Value::Nil),
        },
    }
}

/// Protected-call wrappers that let fatal errors through.
fn guards(lua: &Lua, globals: &Table) -> mlua::Result<(Function, Function, Function)> {
    let pcall: Function = globals.raw_get("pcall")?;
    let xpcall: Function = globals.raw_get("xpcall")?;
    let error: Function = globals.raw_get("error")?;
    let resume: Function = globals.raw_get::<Table>("coroutine")?.raw_get("resume")?;
    let is_fatal = lua.create_function(|_, err: Value| {
        Ok(matches!(&err, Value::Error(e) if is_fatal_error(e)))
    })?;

    lua.load(GUARD_SOURCE)
        .set_name("=guard")
        .call((pcall, xpcall, resume, error, is_fatal))
}

fn string_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.as_bytes().len(),
        Value::Integer(i) => i.to_string().len(),
        Value::Number(n) => n.to_string().len(),
        _ => 0,
    }
}

/// Wrap a platform function with an input bound.
///
/// Counts are coerced the way the platform's integer argument check does,
/// so numeric strings are measured too. A count that does not coerce is
/// left to the platform function, which rejects it itself.
fn limited(
    lua: &Lua,
    original: Function,
    name: String,
    policy: LimitPolicy,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: Variadic<Value>| {
        let subject = args.first().map_or(0, string_len);
        match policy {
            LimitPolicy::MaxSubjectLen(_) => policy.check(&name, subject).map_err(raise)?,
            LimitPolicy::MaxRepeatOutput(_) => {
                let Some(count) = integer_arg(lua, args.get(1))? else {
                    return original.call::<MultiValue>(args);
                };
                let separator = args.get(2).map_or(0, string_len);
                let output = LimitPolicy::repeat_output_len(subject, count, separator);
                policy.check(&name, output).map_err(raise)?;
            }
            LimitPolicy::MaxReplaceOutput { .. } => {
                policy.check(&name, subject).map_err(raise)?;
                if let Some(Value::String(repl)) = args.get(2) {
                    let max = match args.get(3) {
                        None | Some(Value::Nil) => None,
                        Some(value) => match integer_arg(lua, Some(value))? {
                            Some(max) => Some(max),
                            None => return original.call::<MultiValue>(args),
                        },
                    };
                    let output = LimitPolicy::replace_output_len(subject, &repl.as_bytes(), max);
                    policy.check_output(&name, output).map_err(raise)?;
                }
            }
        }
        original.call::<MultiValue>(args)
    })
}

fn integer_arg(lua: &Lua, value: Option<&Value>) -> mlua::Result<Option<i64>> {
    match value {
        Some(value) => lua.coerce_integer(value.clone()),
        None => Ok(None),
    }
}

/// A no-op that logs the attempt.
fn disabled(lua: &Lua, name: String) -> mlua::Result<Function> {
    lua.create_function(move |_, _: MultiValue| {
        warn!(target: KERNEL, function = %name, "Call to disabled function ignored");
        Ok(())
    })
}

fn resource_fn<A, F>(lua: &Lua, host: Rc<dyn HostFunctions>, make: F) -> mlua::Result<Function>
where
    A: FromLuaMulti,
    F: Fn(A) -> ResourceRequest + 'static,
{
    lua.create_function(move |lua, args: A| {
        let request = make(args);
        let info = host.load_resource(&request).map_err(raise)?;
        lua.create_userdata(ResourceHandle::new(info, request.kind(), Rc::clone(&host)))
    })
}

fn draw_fn<A, F>(lua: &Lua, host: Rc<dyn HostFunctions>, op: F) -> mlua::Result<Function>
where
    A: FromLuaMulti,
    F: Fn(A) -> DrawOp + 'static,
{
    lua.create_function(move |_, args: A| {
        host.draw(op(args));
        Ok(())
    })
}
