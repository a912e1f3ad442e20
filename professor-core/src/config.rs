//! Session configuration (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProfessorError, Result};
use crate::transport::ConnectOptions;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Puck";
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

const DEFAULT_INSTRUCTION_TEMPLATE: &str = "You are a friendly, patient professor. \
The student has just studied the following lecture material:\n{context}\n\
Answer their questions by voice, refer back to the material, and keep replies short.";

const DEFAULT_READY_PROMPT: &str =
    "The study material is loaded. Greet the student and ask what they would like to discuss.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    /// System instruction; `{context}` is replaced by the session context.
    pub system_instruction_template: String,
    /// Text sent after the attachments so the remote side knows context is loaded.
    pub ready_prompt: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            system_instruction_template: DEFAULT_INSTRUCTION_TEMPLATE.into(),
            ready_prompt: DEFAULT_READY_PROMPT.into(),
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

impl SessionConfig {
    pub fn normalize(&mut self) {
        let defaults = SessionConfig::default();
        self.model = non_empty_or(&self.model, defaults.model);
        self.voice = non_empty_or(&self.voice, defaults.voice);
        self.ready_prompt = non_empty_or(&self.ready_prompt, defaults.ready_prompt);
        if self.system_instruction_template.trim().is_empty() {
            self.system_instruction_template = defaults.system_instruction_template;
        } else if !self.system_instruction_template.contains(CONTEXT_PLACEHOLDER) {
            warn!("system instruction template has no {CONTEXT_PLACEHOLDER}; appending context");
            self.system_instruction_template.push_str("\n{context}");
        }
        self.preferred_input_device = trimmed_option(self.preferred_input_device.take());
        self.preferred_output_device = trimmed_option(self.preferred_output_device.take());
    }

    /// Environment overrides win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("PROFESSOR_MODEL") {
            self.model = model;
        }
        if let Ok(voice) = std::env::var("PROFESSOR_VOICE") {
            self.voice = voice;
        }
        self.normalize();
    }

    pub fn system_instruction(&self, context: &str) -> String {
        self.system_instruction_template
            .replace(CONTEXT_PLACEHOLDER, context.trim())
    }

    pub fn connect_options(&self, context: &str) -> ConnectOptions {
        ConnectOptions::new(
            self.model.clone(),
            self.voice.clone(),
            self.system_instruction(context),
        )
    }
}

fn non_empty_or(raw: &str, fallback: String) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

fn trimmed_option(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Professor")
            .join("session.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("professor")
            .join("session.json")
    }
}

/// Missing or unreadable files yield the defaults.
pub fn load_config(path: &Path) -> SessionConfig {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<SessionConfig>(&raw).unwrap_or_else(|e| {
            warn!(path = ?path, "ignoring invalid config file: {e}");
            SessionConfig::default()
        }),
        Err(_) => SessionConfig::default(),
    };
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &SessionConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json =
        serde_json::to_string_pretty(config).map_err(|e| ProfessorError::Config(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_restores_blank_fields_and_trims_devices() {
        let mut cfg = SessionConfig {
            model: "  ".into(),
            voice: " Kore ".into(),
            system_instruction_template: String::new(),
            ready_prompt: String::new(),
            preferred_input_device: Some("   ".into()),
            preferred_output_device: Some(" Speakers ".into()),
        };
        cfg.normalize();

        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.voice, "Kore");
        assert!(cfg.system_instruction_template.contains(CONTEXT_PLACEHOLDER));
        assert!(!cfg.ready_prompt.is_empty());
        assert_eq!(cfg.preferred_input_device, None);
        assert_eq!(cfg.preferred_output_device.as_deref(), Some("Speakers"));
    }

    #[test]
    fn template_without_placeholder_gets_context_appended() {
        let mut cfg = SessionConfig {
            system_instruction_template: "Be brief.".into(),
            ..SessionConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.system_instruction("photosynthesis"), "Be brief.\nphotosynthesis");
    }

    #[test]
    fn connect_options_embed_context() {
        let cfg = SessionConfig::default();
        let opts = cfg.connect_options("  Chapter 3: Cells  ");
        assert!(opts.system_instruction.contains("Chapter 3: Cells"));
        assert!(!opts.system_instruction.contains(CONTEXT_PLACEHOLDER));
        assert_eq!(opts.voice, DEFAULT_VOICE);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: SessionConfig = serde_json::from_str(r#"{"voice":"Charon"}"#).unwrap();
        assert_eq!(cfg.voice, "Charon");
        assert_eq!(cfg.model, DEFAULT_MODEL);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("professor-config-{}", std::process::id()));
        let path = dir.join("session.json");
        let cfg = SessionConfig {
            voice: "Aoede".into(),
            preferred_input_device: Some("USB Mic".into()),
            ..SessionConfig::default()
        };

        save_config(&path, &cfg).unwrap();
        let loaded = load_config(&path);
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let loaded = load_config(Path::new("/definitely/not/here/session.json"));
        assert_eq!(loaded, SessionConfig::default());
    }
}
