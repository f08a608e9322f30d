//! Menu options manifest parsing.
//!
//! The interactive menu's commands are declared in a TOML manifest:
//!
//! ```toml
//! [menu]
//! title = "lantern"
//!
//! [[option]]
//! name = "full_scale"
//! type = "boolean"
//! description = "stretch output to the whole screen"
//! default = false
//!
//! [[option]]
//! name = "status"
//! type = "action"
//! description = "show node status"
//! ```

use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Command words the menu handles itself.
pub const RESERVED_COMMANDS: &[&str] = &["?", "help", "exit"];

/// Options manifest structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsManifest {
    /// Menu presentation.
    #[serde(default)]
    pub menu: MenuMetadata,

    /// Declared commands, in help order.
    #[serde(default, rename = "option")]
    pub options: Vec<OptionSpec>,
}

/// Menu presentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuMetadata {
    /// Name shown in the banner.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for MenuMetadata {
    fn default() -> Self {
        Self {
            title: default_title(),
        }
    }
}

fn default_title() -> String {
    "lantern".to_string()
}

/// Type tag of a menu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Boolean,
    String,
    Number,
    Action,
}

/// One declared command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSpec {
    /// Command word.
    pub name: String,

    /// Type tag.
    #[serde(rename = "type")]
    pub kind: OptionKind,

    /// Free-text help.
    #[serde(default)]
    pub description: String,

    /// Parameter placeholder shown in help (defaults by type).
    #[serde(default)]
    pub param: Option<String>,

    /// Initial value for boolean/string/number options.
    #[serde(default)]
    pub default: Option<toml::Value>,
}

impl OptionSpec {
    /// Placeholder text for the help table.
    pub fn placeholder(&self) -> &str {
        if let Some(param) = &self.param {
            return param;
        }
        match self.kind {
            OptionKind::Boolean => "<bool>",
            OptionKind::String => "<string>",
            OptionKind::Number => "<number>",
            OptionKind::Action => "",
        }
    }

    /// Initial bound value, `None` for actions.
    pub fn initial_value(&self) -> SandboxResult<Option<OptionValue>> {
        let value = match (self.kind, &self.default) {
            (OptionKind::Action, None) => None,
            (OptionKind::Action, Some(_)) => {
                return Err(SandboxError::InvalidManifest(format!(
                    "action '{}' cannot have a default",
                    self.name
                )))
            }
            (OptionKind::Boolean, None) => Some(OptionValue::Boolean(false)),
            (OptionKind::Boolean, Some(toml::Value::Boolean(b))) => Some(OptionValue::Boolean(*b)),
            (OptionKind::String, None) => Some(OptionValue::String(String::new())),
            (OptionKind::String, Some(toml::Value::String(s))) => {
                Some(OptionValue::String(s.clone()))
            }
            (OptionKind::Number, None) => Some(OptionValue::Number(0.0)),
            (OptionKind::Number, Some(toml::Value::Integer(i))) => {
                Some(OptionValue::Number(*i as f64))
            }
            (OptionKind::Number, Some(toml::Value::Float(f))) => Some(OptionValue::Number(*f)),
            (kind, Some(other)) => {
                return Err(SandboxError::InvalidManifest(format!(
                    "option '{}' of type {:?} has default of type {}",
                    self.name,
                    kind,
                    other.type_str()
                )))
            }
        };
        Ok(value)
    }
}

/// A bound option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Boolean(bool),
    String(String),
    Number(f64),
}

impl OptionValue {
    /// Parse user input for an option of `kind`.
    ///
    /// The error is the message echoed to the client.
    pub fn parse(kind: OptionKind, input: &str) -> Result<OptionValue, String> {
        match kind {
            OptionKind::Boolean => match input.trim() {
                "true" | "1" | "on" | "yes" => Ok(OptionValue::Boolean(true)),
                "false" | "0" | "off" | "no" => Ok(OptionValue::Boolean(false)),
                other => Err(format!("'{}' is not a boolean (use true or false)", other)),
            },
            OptionKind::Number => input
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(OptionValue::Number)
                .ok_or_else(|| format!("'{}' is not a number", input.trim())),
            OptionKind::String => Ok(OptionValue::String(input.to_string())),
            OptionKind::Action => Err("actions have no value".to_string()),
        }
    }

    /// Boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            OptionValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Boolean(b) => write!(f, "{}", b),
            OptionValue::String(s) => write!(f, "{}", s),
            OptionValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl OptionsManifest {
    /// Load a manifest from a TOML file.
    pub fn from_file(path: &Path) -> SandboxResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a manifest from a TOML string.
    pub fn from_str(content: &str) -> SandboxResult<Self> {
        let manifest: OptionsManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest.
    fn validate(&self) -> SandboxResult<()> {
        let mut seen = HashSet::new();

        for option in &self.options {
            if option.name.is_empty() {
                return Err(SandboxError::InvalidManifest(
                    "option name cannot be empty".to_string(),
                ));
            }

            if option.name.chars().any(char::is_whitespace) {
                return Err(SandboxError::InvalidManifest(format!(
                    "option name '{}' cannot contain whitespace",
                    option.name
                )));
            }

            if RESERVED_COMMANDS.contains(&option.name.as_str()) {
                return Err(SandboxError::InvalidManifest(format!(
                    "option name '{}' is reserved",
                    option.name
                )));
            }

            if !seen.insert(option.name.as_str()) {
                return Err(SandboxError::InvalidManifest(format!(
                    "duplicate option '{}'",
                    option.name
                )));
            }

            option.initial_value()?;
        }

        Ok(())
    }

    /// Get an option by command word.
    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }
}
