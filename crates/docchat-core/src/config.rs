//! Configuration management for docchat.
//!
//! Loads configuration from ${DOCCHAT_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Embedded config template with comments.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Overlays user values onto the template so new template comments and
/// sections show up while user settings are kept.
fn merge_with_template(user_config: &str) -> Result<String> {
    use toml_edit::DocumentMut;

    let mut doc: DocumentMut = default_config_template()
        .parse()
        .context("Failed to parse default config template")?;
    let user_doc: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    merge_items(doc.as_table_mut(), user_doc.as_table());

    Ok(doc.to_string())
}

fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

pub mod paths {
    //! Path resolution for docchat configuration and data directories.
    //!
    //! `DOCCHAT_HOME` resolution order:
    //! 1. `DOCCHAT_HOME` environment variable (if set)
    //! 2. ~/.config/docchat (default)
    //! 3. ./.docchat when no home directory can be determined

    use std::path::PathBuf;

    pub fn docchat_home() -> PathBuf {
        if let Ok(home) = std::env::var("DOCCHAT_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".docchat"),
            |h| h.join(".config").join("docchat"),
        )
    }

    pub fn config_path() -> PathBuf {
        docchat_home().join("config.toml")
    }

    pub fn logs_dir() -> PathBuf {
        docchat_home().join("logs")
    }
}

/// `[ollama]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: Option<String>,
}

impl OllamaSettings {
    /// Returns the configured base URL, treating blank as unset.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// `[render]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mermaid_command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netlist_command: Option<Vec<String>>,
}

impl RenderConfig {
    const DEFAULT_TIMEOUT_SECS: u64 = 30;

    /// Per-render timeout. Zero falls back to the default.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_secs == 0 {
            Self::DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout_secs
        };
        Duration::from_secs(secs)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            mermaid_command: None,
            netlist_command: None,
        }
    }
}

/// `[timeline]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    pub url: String,
    pub poll_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl TimelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            poll_interval_ms: 500,
            max_reconnect_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_file: Option<String>,
    pub max_function_rounds: u32,
    pub ollama: OllamaSettings,
    pub render: RenderConfig,
    pub timeline: TimelineConfig,
}

impl Config {
    pub const DEFAULT_MODEL: &'static str = "llama2";
    const DEFAULT_MAX_FUNCTION_ROUNDS: u32 = 3;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Saves only the model field, keeping other fields and comments.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed, or written.
    pub fn save_model(model: &str) -> Result<()> {
        Self::save_model_to(&paths::config_path(), model)
    }

    /// Saves only the model field to a specific config file path.
    ///
    /// Creates the file from the template if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed, or written.
    pub fn save_model_to(path: &Path, model: &str) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            merge_with_template(&user_config)?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        doc["model"] = value(model);

        Self::write_config(path, &doc.to_string())
    }

    /// Returns the effective system prompt, preferring the file if both are set.
    ///
    /// # Errors
    /// Returns an error if `system_prompt_file` is set but unreadable.
    pub fn effective_system_prompt(&self) -> Result<Option<String>> {
        if let Some(path_str) = &self.system_prompt_file {
            let content = fs::read_to_string(path_str)
                .with_context(|| format!("Failed to read system prompt file: {path_str}"))?;
            let trimmed = content.trim();
            return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
        }

        let trimmed = self.system_prompt.as_deref().unwrap_or("").trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Writes config content atomically (temp file + rename), creating
    /// parent directories as needed.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            system_prompt: None,
            system_prompt_file: None,
            max_function_rounds: Self::DEFAULT_MAX_FUNCTION_ROUNDS,
            ollama: OllamaSettings::default(),
            render: RenderConfig::default(),
            timeline: TimelineConfig::default(),
        }
    }
}
