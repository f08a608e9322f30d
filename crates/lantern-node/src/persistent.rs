//! State that survives code reloads.

use crate::session::SessionTable;
use mlua::{Lua, Table};

/// Kernel-owned storage that outlives every execution context.
///
/// Scripts reach the table as `node.persistent`. Menu sessions live here
/// too, so a reload does not drop connected clients.
pub struct PersistentStore {
    table: Table,
    sessions: SessionTable,
}

impl PersistentStore {
    pub fn new(lua: &Lua) -> mlua::Result<Self> {
        Ok(Self {
            table: lua.create_table()?,
            sessions: SessionTable::new(),
        })
    }

    /// The script-visible table.
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Number of keys scripts have stored.
    pub fn key_count(&self) -> usize {
        self.table
            .clone()
            .pairs::<mlua::Value, mlua::Value>()
            .count()
    }

    /// Drop everything scripts have stored. Sessions are kept.
    pub fn clear(&self) -> mlua::Result<()> {
        self.table.clear()
    }
}
