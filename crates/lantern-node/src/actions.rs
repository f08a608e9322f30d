//! Built-in menu actions.

use crate::kernel::Kernel;
use crate::session::{MenuAction, SessionIo};
use async_trait::async_trait;
use std::rc::Weak;
use tracing::info;

/// `status`: node state, fault indicator and inventory.
pub struct StatusAction {
    kernel: Weak<Kernel>,
}

impl StatusAction {
    pub fn new(kernel: Weak<Kernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait(?Send)]
impl MenuAction for StatusAction {
    async fn run(&self, _args: &str, io: &mut SessionIo) -> Result<(), String> {
        let kernel = self
            .kernel
            .upgrade()
            .ok_or_else(|| "node is shutting down".to_string())?;

        io.writeln(&format!("node       {}", kernel.name()));
        io.writeln(&format!("state      {:?}", kernel.state()));
        match kernel.fault() {
            Some(fault) => io.writeln(&format!("fault      {}", fault)),
            None => io.writeln("fault      none"),
        }

        let inventory = kernel.inventory();
        io.writeln(&format!("children   {}", inventory.children().count()));
        for (name, since) in inventory.children() {
            io.writeln(&format!("  {} (updated {:.1})", name, since));
        }
        io.writeln(&format!("contents   {}", inventory.contents().count()));
        for (name, since) in inventory.contents() {
            io.writeln(&format!("  {} (updated {:.1})", name, since));
        }
        // The calling session is out of the table while it runs.
        io.writeln(&format!("sessions   {}", kernel.persistent().sessions().len() + 1));
        Ok(())
    }
}

/// `clear_persistent`: wipe `node.persistent` after confirmation.
pub struct ClearPersistentAction {
    kernel: Weak<Kernel>,
}

impl ClearPersistentAction {
    pub fn new(kernel: Weak<Kernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait(?Send)]
impl MenuAction for ClearPersistentAction {
    async fn run(&self, _args: &str, io: &mut SessionIo) -> Result<(), String> {
        let answer = io
            .prompt("clear all persistent script state? (yes/no) ")
            .await
            .unwrap_or_default();

        if answer.trim() != "yes" {
            io.writeln("aborted");
            return Ok(());
        }

        let kernel = self
            .kernel
            .upgrade()
            .ok_or_else(|| "node is shutting down".to_string())?;
        let keys = kernel.persistent().key_count();
        kernel.persistent().clear().map_err(|e| e.to_string())?;

        info!(keys, client = io.client(), "Persistent state cleared from menu");
        io.writeln(&format!("cleared {} keys", keys));
        Ok(())
    }
}
