//! Persona and system prompt
//!
//! The system prompt is opaque configuration. It comes from, in order:
//!
//! 1. a persona TOML file (`[system_prompt] content`),
//! 2. the `[persona]` settings (name, tone, principles),
//! 3. [`builtin::DEFAULT`].
//!
//! # Example Persona File
//!
//! ```toml
//! [persona]
//! name = "Friday"
//! description = "Personal assistant"
//!
//! [system_prompt]
//! content = """
//! You are Friday, a personal assistant...
//! """
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use super::settings::PersonaSettings;

/// A persona file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaTemplate {
    pub persona: PersonaInfo,
    pub system_prompt: SystemPrompt,
}

/// Persona metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaInfo {
    /// Display name of the persona
    pub name: String,

    /// Brief description
    #[serde(default)]
    pub description: String,
}

/// System prompt content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    /// The full system prompt content
    pub content: String,
}

impl PersonaTemplate {
    /// Load a persona directly from a file path
    pub async fn load_from_file(path: &Path) -> Result<Self, PersonaError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PersonaError::IoError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| PersonaError::ParseError(e.to_string()))
    }
}

/// Errors from persona loading
#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Build the prompt from `[persona]` settings
pub fn compose(settings: &PersonaSettings) -> String {
    if settings.name.trim().is_empty() {
        return builtin::DEFAULT.to_string();
    }

    let mut prompt = format!("You are {}.\nTone: {}.", settings.name, settings.tone);
    if !settings.principles.is_empty() {
        prompt.push_str("\nPrinciples:");
        for principle in &settings.principles {
            prompt.push_str("\n- ");
            prompt.push_str(principle);
        }
    }
    prompt
}

/// Resolve the system prompt. A broken persona file is logged and skipped.
pub async fn resolve_system_prompt(settings: &PersonaSettings) -> String {
    if let Some(path) = &settings.prompt_file {
        match PersonaTemplate::load_from_file(path).await {
            Ok(template) => {
                tracing::info!(
                    persona = %template.persona.name,
                    description = %template.persona.description,
                    "loaded persona file"
                );
                return template.system_prompt.content;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persona file unusable, composing prompt");
            }
        }
    }
    compose(settings)
}

/// Built-in prompts that don't require files
pub mod builtin {
    /// Default general-purpose assistant prompt
    pub const DEFAULT: &str = "You are Friday, a personal assistant. You can save, search, list and forget notes in long-term memory using tools. Be warm, concise and confident.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template() {
        let toml_content = r#"
[persona]
name = "Test Persona"
description = "A test persona"

[system_prompt]
content = "You are a test assistant."
"#;

        let template: PersonaTemplate = toml::from_str(toml_content).unwrap();
        assert_eq!(template.persona.name, "Test Persona");
        assert_eq!(template.system_prompt.content, "You are a test assistant.");
    }

    #[test]
    fn test_compose_from_settings() {
        let prompt = compose(&PersonaSettings::default());
        assert_eq!(
            prompt,
            "You are Friday.\nTone: warm, proactive.\nPrinciples:\n- clarity\n- honesty"
        );

        let nameless = PersonaSettings {
            name: " ".into(),
            ..Default::default()
        };
        assert_eq!(compose(&nameless), builtin::DEFAULT);
    }

    #[tokio::test]
    async fn test_persona_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.toml");
        std::fs::write(
            &path,
            "[persona]\nname = \"Edith\"\n\n[system_prompt]\ncontent = \"You are Edith.\"\n",
        )
        .unwrap();

        let settings = PersonaSettings {
            prompt_file: Some(path),
            ..Default::default()
        };
        assert_eq!(resolve_system_prompt(&settings).await, "You are Edith.");
    }

    #[tokio::test]
    async fn test_broken_persona_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PersonaSettings {
            prompt_file: Some(dir.path().join("missing.toml")),
            ..Default::default()
        };
        assert!(resolve_system_prompt(&settings).await.starts_with("You are Friday."));
    }
}
