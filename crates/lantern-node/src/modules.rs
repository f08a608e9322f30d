//! `require` for node scripts.

use crate::bridge::{raise, script_error};
use crate::environment::LuaCompiler;
use crate::host::HostFunctions;
use lantern_runtime::{
    EmbeddedBundles, Lookup, ModuleResolver, ModuleSource, SafeLoader, SandboxError, SandboxResult,
};
use mlua::{Function, Lua, Table, Value};
use std::rc::Rc;
use tracing::debug;

/// Modules compiled into the binary.
pub fn bundles() -> EmbeddedBundles {
    let mut bundles = EmbeddedBundles::new();
    bundles.insert("class", include_str!("../lua/class.lua"));
    bundles
}

/// Node directory first, then embedded bundles.
pub fn resolver(host: Rc<dyn HostFunctions>) -> ModuleResolver {
    ModuleResolver::new()
        .with_source(Box::new(HostFileSource::new(host)))
        .with_source(Box::new(bundles()))
}

/// Looks modules up as `<name>.lua` in the node directory.
pub struct HostFileSource {
    host: Rc<dyn HostFunctions>,
}

impl HostFileSource {
    pub fn new(host: Rc<dyn HostFunctions>) -> Self {
        Self { host }
    }
}

impl ModuleSource for HostFileSource {
    fn name(&self) -> &str {
        "node directory"
    }

    fn lookup(&self, module: &str) -> SandboxResult<Lookup> {
        let file = format!("{}.lua", module);
        if module.contains(['/', '\\']) || module.starts_with('.') {
            return Ok(Lookup::NotFound(format!("invalid module file '{}'", file)));
        }

        Ok(match self.host.read_file(&file)? {
            Some(source) => Lookup::Found {
                label: file,
                source,
            },
            None => Lookup::NotFound(format!("no file '{}' in node directory", file)),
        })
    }
}

/// Per-context `loaded` and `loading` tables.
pub(crate) struct ModuleCache {
    pub(crate) loaded: Table,
    pub(crate) loading: Table,
}

impl ModuleCache {
    pub(crate) fn new(lua: &Lua) -> mlua::Result<Self> {
        Ok(Self {
            loaded: lua.create_table()?,
            loading: lua.create_table()?,
        })
    }
}

/// Load `name` into the context whose environment is `env`.
///
/// A module's result is cached per context: `nil` is recorded as `true`,
/// anything else as returned. Failures are not cached.
pub(crate) fn require(
    lua: &Lua,
    resolver: &ModuleResolver,
    cache: &ModuleCache,
    env: &Table,
    name: &str,
) -> SandboxResult<Value> {
    let cached: Value = cache.loaded.raw_get(name).map_err(script_error)?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    if cache.loading.raw_get::<bool>(name).unwrap_or(false) {
        return Err(SandboxError::ScriptRuntimeError(format!(
            "loop while loading module '{}'",
            name
        )));
    }

    let (label, source) = resolver.resolve(name)?;
    debug!(module = name, source = %label, "Loading module");

    let loader = SafeLoader::new(LuaCompiler::new(lua, env.clone()));
    let chunk = loader.compile(&source, name, false)?;

    cache.loading.raw_set(name, true).map_err(script_error)?;
    let result = chunk.call::<Value>(name);
    cache.loading.raw_set(name, Value::Nil).map_err(script_error)?;

    let value = match result {
        Ok(Value::Nil) => Value::Boolean(true),
        Ok(value) => value,
        Err(err) => return Err(script_error(err)),
    };
    cache.loaded.raw_set(name, value.clone()).map_err(script_error)?;
    Ok(value)
}

/// Script-facing `require`, bound to one context's cache and environment.
pub(crate) fn script_require(
    lua: &Lua,
    kernel: Rc<crate::kernel::Kernel>,
    cache: &ModuleCache,
    env: &Table,
) -> mlua::Result<Function> {
    lua.create_function(
        move |lua, (loaded, loading, env, name): (Table, Table, Table, String)| {
            let cache = ModuleCache { loaded, loading };
            require(lua, kernel.modules(), &cache, &env, &name).map_err(raise_preserving)
        },
    )?
    .bind((cache.loaded.clone(), cache.loading.clone(), env.clone()))
}

/// Re-raise a sandbox error. Runtime errors coming out of module code are
/// passed as plain messages so the outer traceback stays readable.
fn raise_preserving(err: SandboxError) -> mlua::Error {
    match err {
        SandboxError::ScriptRuntimeError(message) => mlua::Error::RuntimeError(message),
        other => raise(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    #[test]
    fn test_host_file_source() {
        let host = Rc::new(MemoryHost::new());
        host.set_file("helper.lua", "return 1");
        let source = HostFileSource::new(host);

        match source.lookup("helper").unwrap() {
            Lookup::Found { label, source } => {
                assert_eq!(label, "helper.lua");
                assert_eq!(source, b"return 1");
            }
            other => panic!("unexpected {other:?}"),
        }

        match source.lookup("other").unwrap() {
            Lookup::NotFound(reason) => {
                assert_eq!(reason, "no file 'other.lua' in node directory")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_path_like_names_rejected() {
        let host = Rc::new(MemoryHost::new());
        host.set_file("../secret.lua", "return 1");
        let source = HostFileSource::new(host);
        assert!(matches!(
            source.lookup("../secret").unwrap(),
            Lookup::NotFound(_)
        ));
    }

    #[test]
    fn test_class_bundle_embedded() {
        assert!(bundles().contains("class"));
    }
}
