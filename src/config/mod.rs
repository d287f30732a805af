//! Application configuration
//!
//! Environment variables win over the settings file; the settings file wins
//! over built-in defaults.

pub mod persona;
pub mod settings;

use std::env;
use std::path::PathBuf;

pub use settings::{LlmSettings, PersonaSettings, Settings};

use crate::providers::OpenAICompatConfig;

const DEFAULT_SETTINGS_PATH: &str = "config/settings.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub data_dir: PathBuf,
    pub llm: LlmSettings,
    pub persona: PersonaSettings,
    pub journal_enabled: bool,
    /// Whether a settings file was found and parsed
    pub settings_loaded: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let settings_path = env::var("FRIDAY_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let settings = Settings::load_or_default(&settings_path)?;

        let mut config = Self::from_settings(settings, |name| env::var(name).ok());
        config.settings_loaded = settings_path.is_file();
        Ok(config)
    }

    /// Settings for the model provider
    pub fn provider_config(&self) -> OpenAICompatConfig {
        OpenAICompatConfig {
            base_url: self.llm.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            timeout_secs: self.llm.timeout_secs,
        }
    }

    /// Layer environment lookups over parsed settings
    pub(crate) fn from_settings(mut settings: Settings, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = var("FRIDAY_MODEL") {
            settings.llm.model = model;
        }
        if let Some(base_url) = var("FRIDAY_LLM_BASE_URL") {
            settings.llm.base_url = base_url;
        }
        if let Some(path) = var("FRIDAY_PERSONA") {
            settings.persona.prompt_file = Some(PathBuf::from(path));
        }

        Self {
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(8000),
            api_key: var(&settings.llm.api_key_env).filter(|k| !k.trim().is_empty()),
            data_dir: var("FRIDAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| settings.memory.data_dir.clone()),
            llm: settings.llm,
            persona: settings.persona,
            journal_enabled: settings.journal.enabled,
            settings_loaded: false,
        }
    }
}
