//! Named event channels.
//!
//! Each execution context owns one bus. Handlers live in a Lua table keyed
//! by channel name, so they are dropped together with the context that
//! registered them.

use mlua::{Function, IntoLua, IntoLuaMulti, Lua, MultiValue, Table, Value};

/// An argument the host passes along with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg {
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Str(String),
}

impl IntoLua for EventArg {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            EventArg::Nil => Value::Nil,
            EventArg::Bool(b) => Value::Boolean(b),
            EventArg::Integer(i) => Value::Integer(i),
            EventArg::Number(n) => Value::Number(n),
            EventArg::Str(s) => Value::String(lua.create_string(&s)?),
        })
    }
}

impl From<&str> for EventArg {
    fn from(s: &str) -> Self {
        EventArg::Str(s.to_string())
    }
}

impl From<String> for EventArg {
    fn from(s: String) -> Self {
        EventArg::Str(s)
    }
}

impl From<i64> for EventArg {
    fn from(i: i64) -> Self {
        EventArg::Integer(i)
    }
}

impl From<f64> for EventArg {
    fn from(n: f64) -> Self {
        EventArg::Number(n)
    }
}

impl From<bool> for EventArg {
    fn from(b: bool) -> Self {
        EventArg::Bool(b)
    }
}

/// Ordered handler lists keyed by channel name.
pub struct EventBus {
    channels: Table,
}

impl EventBus {
    pub fn new(lua: &Lua) -> mlua::Result<Self> {
        Ok(Self {
            channels: lua.create_table()?,
        })
    }

    /// Append `handler` to `channel`.
    pub fn on(&self, lua: &Lua, channel: &str, handler: Function) -> mlua::Result<()> {
        register(lua, &self.channels, channel, handler)
    }

    /// Invoke every handler on `channel` in registration order.
    ///
    /// Stops at the first handler error. Unknown channels are a no-op.
    pub fn dispatch<A>(&self, channel: &str, args: A) -> mlua::Result<()>
    where
        A: IntoLuaMulti + Clone,
    {
        dispatch_on(&self.channels, channel, args)
    }

    /// Number of handlers registered on `channel`.
    pub fn handler_count(&self, channel: &str) -> usize {
        match self.channels.raw_get::<Option<Table>>(channel) {
            Ok(Some(list)) => list.raw_len(),
            _ => 0,
        }
    }

    /// Script-facing `(on, dispatch)` pair bound to this bus.
    pub(crate) fn script_api(&self, lua: &Lua) -> mlua::Result<(Function, Function)> {
        let on = lua
            .create_function(
                |lua, (channels, name, handler): (Table, String, Function)| {
                    register(lua, &channels, &name, handler)
                },
            )?
            .bind(self.channels.clone())?;

        let dispatch = lua
            .create_function(|_, (channels, name, args): (Table, String, MultiValue)| {
                dispatch_on(&channels, &name, args)
            })?
            .bind(self.channels.clone())?;

        Ok((on, dispatch))
    }
}

fn register(lua: &Lua, channels: &Table, name: &str, handler: Function) -> mlua::Result<()> {
    let list = match channels.raw_get::<Option<Table>>(name)? {
        Some(list) => list,
        None => {
            let list = lua.create_table()?;
            channels.raw_set(name, list.clone())?;
            list
        }
    };
    list.raw_set(list.raw_len() + 1, handler)
}

fn dispatch_on<A>(channels: &Table, name: &str, args: A) -> mlua::Result<()>
where
    A: IntoLuaMulti + Clone,
{
    let Some(list) = channels.raw_get::<Option<Table>>(name)? else {
        return Ok(());
    };

    // Handlers registered while dispatching wait for the next event.
    let handlers = (1..=list.raw_len())
        .map(|i| list.raw_get::<Function>(i))
        .collect::<mlua::Result<Vec<_>>>()?;

    for handler in handlers {
        handler.call::<()>(args.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_run_in_order() {
        let lua = Lua::new();
        let bus = EventBus::new(&lua).unwrap();
        let log = lua.create_table().unwrap();
        lua.globals().set("log", log.clone()).unwrap();

        for tag in ["a", "b"] {
            let handler = lua
                .load(format!("return function(x) log[#log + 1] = '{tag}' .. x end"))
                .eval::<Function>()
                .unwrap();
            bus.on(&lua, "tick", handler).unwrap();
        }

        bus.dispatch("tick", 1).unwrap();
        let entries: Vec<String> = log.sequence_values().collect::<mlua::Result<_>>().unwrap();
        assert_eq!(entries, vec!["a1", "b1"]);
        assert_eq!(bus.handler_count("tick"), 2);
    }

    #[test]
    fn test_unknown_channel_is_noop() {
        let lua = Lua::new();
        let bus = EventBus::new(&lua).unwrap();
        assert!(bus.dispatch("nothing", ()).is_ok());
        assert_eq!(bus.handler_count("nothing"), 0);
    }

    #[test]
    fn test_first_error_stops_dispatch() {
        let lua = Lua::new();
        let bus = EventBus::new(&lua).unwrap();
        lua.globals().set("hits", 0).unwrap();

        let failing = lua
            .load("return function() error('first') end")
            .eval::<Function>()
            .unwrap();
        let counting = lua
            .load("return function() hits = hits + 1 end")
            .eval::<Function>()
            .unwrap();
        bus.on(&lua, "boom", failing).unwrap();
        bus.on(&lua, "boom", counting).unwrap();

        let err = bus.dispatch("boom", ()).unwrap_err();
        assert!(err.to_string().contains("first"));
        assert_eq!(lua.globals().get::<i64>("hits").unwrap(), 0);
    }

    #[test]
    fn test_script_api_shares_channels() {
        let lua = Lua::new();
        let bus = EventBus::new(&lua).unwrap();
        let (on, dispatch) = bus.script_api(&lua).unwrap();
        lua.globals().set("on", on).unwrap();
        lua.globals().set("fire", dispatch).unwrap();

        lua.load(
            r#"
            seen = nil
            on("greet", function(a, b) seen = a .. b end)
            fire("greet", "x", "y")
        "#,
        )
        .exec()
        .unwrap();

        assert_eq!(lua.globals().get::<String>("seen").unwrap(), "xy");
        assert_eq!(bus.handler_count("greet"), 1);
    }
}
