//! Glue between the daemon loop and the node.
//!
//! [`Daemon`] owns the node, its directory host and the scanner, and turns
//! loop events (scan ticks, render ticks, console lines) into node
//! signals. Script failures never stop the daemon; they are logged and the
//! node keeps running whatever code last loaded.

use crate::config::Config;
use crate::host::DirectoryHost;
use crate::scanner::{Change, DirectoryScanner};
use anyhow::{Context, Result};
use lantern_node::{ClientId, HostFunctions, Node, NodeState};
use lantern_runtime::SandboxResult;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Client id of the local stdin console.
pub const CONSOLE_CLIENT: ClientId = 0;

pub struct Daemon {
    node: Node,
    host: Rc<DirectoryHost>,
    scanner: DirectoryScanner,
    config: Config,
}

impl Daemon {
    /// Create a daemon serving `config.node.path` headlessly.
    pub fn new(config: Config) -> Result<Self> {
        let host = Rc::new(DirectoryHost::new(
            config.node.path.clone(),
            (config.display.width, config.display.height),
        ));
        Self::with_host(config, host)
    }

    pub fn with_host(config: Config, host: Rc<DirectoryHost>) -> Result<Self> {
        let node_config = config.node_config(|key| std::env::var(key).ok())?;
        let node = Node::new(Rc::clone(&host) as Rc<dyn HostFunctions>, node_config)
            .context("Failed to create node")?;
        let scanner = DirectoryScanner::new(host.root().to_path_buf());

        Ok(Self {
            node,
            host,
            scanner,
            config,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn host(&self) -> &Rc<DirectoryHost> {
        &self.host
    }

    /// Record what is already in the node directory, then boot. Node code
    /// files are skipped during the first scan since boot runs them.
    pub fn start(&mut self) -> Result<()> {
        let changes = self
            .scanner
            .scan()
            .with_context(|| format!("Failed to scan {}", self.host.root().display()))?;

        for change in changes {
            if matches!(change, Change::Content { .. }) && self.is_script(change.name()) {
                continue;
            }
            self.apply(change);
        }

        let result = self.node.boot();
        self.settle("boot", result);
        info!(
            node = %self.node.kernel().name(),
            children = self.node.kernel().inventory().children().count(),
            contents = self.node.kernel().inventory().contents().count(),
            "Node started"
        );
        Ok(())
    }

    /// Rescan the node directory and forward what changed.
    pub fn rescan(&mut self) {
        match self.scanner.scan() {
            Ok(changes) => {
                for change in changes {
                    self.apply(change);
                }
            }
            Err(e) => warn!("Failed to scan {}: {}", self.host.root().display(), e),
        }
    }

    /// Draw one frame at the configured display size.
    pub fn render(&mut self) {
        let (width, height) = (self.config.display.width, self.config.display.height);
        let result = self.node.render_self(f64::from(width), f64::from(height));
        self.settle("render", result);
    }

    /// Feed a console line. A line with no session attached opens one;
    /// a blank line then only shows the banner.
    pub fn console_line(&mut self, line: &str) {
        let sessions = self.node.kernel().persistent().sessions();
        if !sessions.contains(CONSOLE_CLIENT) {
            let result = self.node.connect(CONSOLE_CLIENT);
            self.settle("connect", result);
            if line.trim().is_empty() {
                return;
            }
        }

        let result = self.node.input(CONSOLE_CLIENT, line);
        self.settle("input", result);
    }

    pub fn shutdown(&mut self) {
        if self.node.state() == NodeState::Teardown {
            return;
        }
        let result = self.node.disconnect(CONSOLE_CLIENT);
        self.settle("disconnect", result);
        self.node.shutdown();
    }

    fn is_script(&self, name: &str) -> bool {
        self.config.node.scripts.iter().any(|s| s == name)
    }

    fn apply(&mut self, change: Change) {
        debug!(?change, "Directory change");
        let result = match &change {
            Change::Child { name, added } => self.node.child_update(name, *added),
            Change::Content { name, added } => self.node.content_update(name, *added),
        };
        self.settle(change.name(), result);
    }

    fn settle(&self, what: &str, result: SandboxResult<()>) {
        if let Err(err) = result {
            if err.is_fatal() {
                error!(what, "Node aborted: {}", err);
            } else {
                error!(what, "Node call failed: {}", err);
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
