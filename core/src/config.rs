//! Runtime configuration for the bridge, loaded from `config.toml`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_TOML_FILE: &str = "config.toml";

const DEFAULT_DEBUGGER: &str = "lldb";
const DEFAULT_PROMPT: &str = "(lldb) ";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DETACH_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Debugger executable, resolved through `PATH` when relative.
    pub debugger_path: PathBuf,

    /// Arguments passed to every debugger subprocess. The default turns off
    /// ANSI colouring so the prompt can be matched byte for byte.
    pub debugger_args: Vec<String>,

    /// Prompt the debugger prints at the start of a line when it is ready
    /// for the next command, including its trailing delimiter.
    pub prompt: String,

    pub command_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub detach_timeout_ms: u64,

    /// Shared defaults file. When unset it lives under the user cache dir.
    pub defaults_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debugger_path: PathBuf::from(DEFAULT_DEBUGGER),
            debugger_args: vec!["--no-use-colors".to_string()],
            prompt: DEFAULT_PROMPT.to_string(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            detach_timeout_ms: DEFAULT_DETACH_TIMEOUT_MS,
            defaults_path: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `config.toml` from the bridge home, or the defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let Some(home) = find_dbg_bridge_home() else {
            return Ok(Self::default());
        };
        let path = home.join(CONFIG_TOML_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prompt.is_empty() {
            return Err(ConfigError::Invalid("prompt must not be empty".to_string()));
        }
        if self.prompt.contains(['\n', '\r']) {
            return Err(ConfigError::Invalid(
                "prompt must fit on a single line".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 || self.startup_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }

    pub fn resolved_defaults_path(&self) -> Option<PathBuf> {
        self.defaults_path
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("dbg-bridge").join("defaults.json")))
    }
}

/// `$DBG_BRIDGE_HOME` when set, otherwise `~/.dbg-bridge`.
pub fn find_dbg_bridge_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("DBG_BRIDGE_HOME")
        && !val.is_empty()
    {
        return Some(PathBuf::from(val));
    }
    dirs::home_dir().map(|home| home.join(".dbg-bridge"))
}
