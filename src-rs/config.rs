use crate::error::AnalysisError;
use crate::response::ValidationMode;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_MLLM_COMMAND: &str = "mllm-generate";

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "bug",
    "crash",
    "error",
    "broken",
    "glitch",
    "issue",
    "stuck",
    "not working",
    "doesn't work",
    "fails to",
    "unable to",
    "can't",
];

/// Settings file contents. Only `mllm.model_name`, `mllm.device` and
/// `mllm.max_new_tokens` are required.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub mllm: MllmSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MllmSettings {
    pub model_name: String,
    pub device: String,
    pub max_new_tokens: u32,
    #[serde(default = "default_num_beams")]
    pub num_beams: u32,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Task token prepended to the prompt, e.g. `<MORE_DETAILED_OCR>` for Florence-2.
    #[serde(default)]
    pub task_prefix: Option<String>,
    /// Unset means the generation call blocks until the model exits.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default)]
    pub validation: ValidationMode,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            validation: ValidationMode::default(),
            keywords: default_keywords(),
        }
    }
}

fn default_num_beams() -> u32 {
    3
}

fn default_command() -> String {
    DEFAULT_MLLM_COMMAND.to_string()
}

fn default_keywords() -> Vec<String> {
    DEFAULT_KEYWORDS.iter().map(ToString::to_string).collect()
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        if !path.exists() {
            return Err(AnalysisError::Config(format!(
                "Configuration file not found at {}. Please create it.",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).map_err(|err| {
            AnalysisError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, AnalysisError> {
        let settings: Settings = serde_yaml::from_str(raw)
            .map_err(|err| AnalysisError::Config(format!("invalid settings YAML: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        if self.mllm.model_name.trim().is_empty() {
            return Err(AnalysisError::Config("mllm.model_name is empty".to_string()));
        }
        if self.mllm.device.trim().is_empty() {
            return Err(AnalysisError::Config("mllm.device is empty".to_string()));
        }
        if self.mllm.max_new_tokens == 0 {
            return Err(AnalysisError::Config(
                "mllm.max_new_tokens must be positive".to_string(),
            ));
        }
        if self.mllm.num_beams == 0 {
            return Err(AnalysisError::Config(
                "mllm.num_beams must be at least 1".to_string(),
            ));
        }
        if self.mllm.command.trim().is_empty() {
            return Err(AnalysisError::Config("mllm.command is empty".to_string()));
        }
        Ok(())
    }
}
