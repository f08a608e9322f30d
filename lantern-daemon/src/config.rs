//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/lantern/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use lantern_node::NodeConfig;
use lantern_runtime::OptionsManifest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// The node directory served by this daemon
    #[serde(default)]
    pub node: NodeSection,
    /// Output surface size
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Daemon loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
    /// Render ticks per second
    /// Default: 30
    pub fps: u32,
    /// How often the node directory is scanned for changes
    /// Default: 500
    pub scan_interval_ms: u64,
    /// How often the watchdog monitor looks at the node
    /// Default: 100
    pub watchdog_interval_ms: u64,
    /// Options manifest for the menu; the built-in one if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_manifest: Option<PathBuf>,
}

/// Node directory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding node code and content
    /// Default: "."
    pub path: PathBuf,
    /// Node name; the directory name if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node code files, run in order
    /// Default: ["node.lua"]
    pub scripts: Vec<String>,
    /// Accept precompiled node code
    /// Default: false
    pub allow_precompiled: bool,
    /// Stretch output instead of keeping the aspect ratio
    /// Default: false
    pub full_scale: bool,
    /// Lua heap limit in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Default: 1920
    pub width: u32,
    /// Default: 1080
    pub height: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            fps: 30,
            scan_interval_ms: 500,
            watchdog_interval_ms: 100,
            menu_manifest: None,
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            name: None,
            scripts: vec!["node.lua".to_string()],
            allow_precompiled: false,
            full_scale: false,
            memory_limit: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/lantern/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "raibid-labs", "lantern")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    pub fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# Lantern Daemon Configuration
# This file configures the lantern-daemon behavior.

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG overrides this when set.
# Default: "info"
log_level = "info"

# Render ticks per second
# Default: 30
fps = 30

# Milliseconds between two scans of the node directory
# Default: 500
scan_interval_ms = 500

# Milliseconds between two watchdog checks
# Default: 100
watchdog_interval_ms = 100

# Options manifest for the interactive menu.
# If not specified, the built-in manifest is used.
# menu_manifest = "/path/to/menu.toml"

[node]
# Directory holding node code and content files.
# LANTERN_NODE_PATH overrides this.
# Default: "."
path = "."

# Node name; defaults to the directory name
# name = "lobby"

# Node code files, run in order on every reload
# Default: ["node.lua"]
scripts = ["node.lua"]

# Accept precompiled node code.
# LANTERN_ALLOW_PRECOMPILED=1 turns this on.
# Default: false
allow_precompiled = false

# Stretch output to the display instead of keeping the aspect ratio.
# LANTERN_FULL_SCALE=1 turns this on.
# Default: false
full_scale = false

# Lua heap limit in bytes
# memory_limit = 67108864

[display]
width = 1920
height = 1080
"#
        .to_string()
    }

    /// Apply `LANTERN_NODE_PATH` and `LANTERN_LOG_LEVEL`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LANTERN_NODE_PATH").filter(|p| !p.is_empty()) {
            self.node.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("LANTERN_LOG_LEVEL").filter(|l| !l.is_empty()) {
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are valid and within acceptable ranges.
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.daemon.fps == 0 || self.daemon.fps > 240 {
            anyhow::bail!("daemon.fps must be between 1 and 240");
        }
        if self.daemon.scan_interval_ms == 0 {
            anyhow::bail!("daemon.scan_interval_ms must be greater than 0");
        }
        if self.daemon.watchdog_interval_ms == 0 {
            anyhow::bail!("daemon.watchdog_interval_ms must be greater than 0");
        }

        if self.display.width == 0 || self.display.height == 0 {
            anyhow::bail!("display.width and display.height must be greater than 0");
        }

        if self.node.scripts.is_empty() {
            anyhow::bail!("node.scripts must name at least one file");
        }
        for script in &self.node.scripts {
            if script.is_empty() || script.contains(['/', '\\']) || script.starts_with('.') {
                anyhow::bail!("node.scripts: '{}' is not a plain file name", script);
            }
        }

        Ok(())
    }

    /// Duration of one render tick
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.daemon.fps))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.scan_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.watchdog_interval_ms)
    }

    /// Node name, falling back to the directory name
    pub fn node_name(&self) -> String {
        if let Some(name) = &self.node.name {
            return name.clone();
        }
        fs::canonicalize(&self.node.path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "node".to_string())
    }

    /// Build the kernel's node settings, applying the `LANTERN_*`
    /// environment switches through `lookup`.
    pub fn node_config<F>(&self, lookup: F) -> Result<NodeConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let menu = match &self.daemon.menu_manifest {
            Some(path) => Some(OptionsManifest::from_file(path).with_context(|| {
                format!("Failed to load menu manifest: {}", path.display())
            })?),
            None => None,
        };

        let mut config = NodeConfig::new(self.node_name());
        config.scripts = self.node.scripts.clone();
        config.allow_precompiled = self.node.allow_precompiled;
        config.full_scale = self.node.full_scale;
        config.memory_limit = self.node.memory_limit;
        config.menu = menu;

        Ok(config.with_env(lookup))
    }
}
