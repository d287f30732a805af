//! Settings loaded from a TOML file
//!
//! Every section is optional; a missing file yields the defaults.
//!
//! ```toml
//! [llm]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! temperature = 0.6
//! timeout_secs = 120
//! api_key_env = "OPENAI_API_KEY"
//!
//! [memory]
//! data_dir = "./data"
//!
//! [persona]
//! name = "Friday"
//! tone = "warm, proactive"
//! principles = ["clarity", "honesty"]
//! prompt_file = "config/persona.toml"
//!
//! [journal]
//! enabled = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmSettings,

    /// Memory store settings
    #[serde(default)]
    pub memory: MemorySettings,

    /// Persona used to build the system prompt
    #[serde(default)]
    pub persona: PersonaSettings,

    /// Daily conversation journal
    #[serde(default)]
    pub journal: JournalSettings,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load settings from a TOML file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse settings from a TOML string
    pub fn parse(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.llm.model.trim().is_empty() {
            return Err(SettingsError::Validation("llm.model must not be empty".into()));
        }
        if self.llm.timeout_secs == 0 {
            return Err(SettingsError::Validation(
                "llm.timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// OpenAI-compatible API root
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> Option<f32> {
    Some(0.6)
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Directory holding `memory.db` or `memory.jsonl`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Persona configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSettings {
    #[serde(default = "default_persona_name")]
    pub name: String,

    #[serde(default = "default_tone")]
    pub tone: String,

    #[serde(default = "default_principles")]
    pub principles: Vec<String>,

    /// Persona TOML whose system prompt replaces the composed one
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
}

fn default_persona_name() -> String {
    "Friday".to_string()
}

fn default_tone() -> String {
    "warm, proactive".to_string()
}

fn default_principles() -> Vec<String> {
    vec!["clarity".to_string(), "honesty".to_string()]
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            tone: default_tone(),
            principles: default_principles(),
            prompt_file: None,
        }
    }
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSettings {
    /// Write `<data_dir>/journal/<day>.md` after every exchange
    #[serde(default = "default_journal_enabled")]
    pub enabled: bool,
}

fn default_journal_enabled() -> bool {
    true
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            enabled: default_journal_enabled(),
        }
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
