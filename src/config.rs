//! Service configuration.
//!
//! Defaults are read from the environment (and `.env`) at startup. The browser
//! may override any of them per request; the merged values are passed
//! explicitly into each client call and never mutated afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::error::{FormatError, OcrError};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Prompt used when neither the request nor `PROMPT_TEMPLATE_PATH` supplies one.
pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"Below is the raw OCR output of a patient intake form. Rewrite it as a clinical note using exactly these sections:

Chief Complaint:
History of Present Illness:
Past Medical History:
Medications:
Allergies:
Social History:
Family History:
Review of Systems:
Assessment / Notes:

Only use information present in the form. Write "Not documented" for empty sections. Checked boxes appear as "label: selected".

--- INTAKE FORM ---
{{OCR_RESULT}}
--- END INTAKE FORM ---"#;

/// Connection settings for the document-analysis service.
#[derive(Clone, Default, Deserialize)]
pub struct OcrConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Analysis model; `prebuilt-layout` when unset.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Page range forwarded as `pages=`, e.g. `1-`.
    #[serde(default)]
    pub pages: Option<String>,
}

impl OcrConfig {
    /// Check required fields before any network call.
    pub fn validate(&self) -> Result<(), OcrError> {
        if self.endpoint.trim().is_empty() {
            return Err(OcrError::ConfigIncomplete("OCR endpoint"));
        }
        if self.api_key.trim().is_empty() {
            return Err(OcrError::ConfigIncomplete("OCR API key"));
        }
        Ok(())
    }

    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Self {
        Self {
            endpoint: pick(&overrides.ocr_endpoint, &self.endpoint),
            api_key: pick(&overrides.ocr_api_key, &self.api_key),
            model_id: pick_opt(&overrides.model_id, &self.model_id),
            pages: self.pages.clone(),
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &redacted(&self.api_key))
            .field("model_id", &self.model_id)
            .field("pages", &self.pages)
            .finish()
    }
}

/// Sampling parameters sent with every chat-completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// OCR text longer than this (in characters) is truncated before substitution.
    pub max_input_chars: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1500,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_input_chars: 3000,
        }
    }
}

/// Connection settings for the chat-completion service.
#[derive(Clone, Default, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment_name: String,
    /// Pin a single API version instead of probing the known ones.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.endpoint.trim().is_empty() {
            return Err(FormatError::ConfigIncomplete("language model endpoint"));
        }
        if self.api_key.trim().is_empty() {
            return Err(FormatError::ConfigIncomplete("language model API key"));
        }
        // A full chat/completions URL already names its deployment.
        if self.deployment_name.trim().is_empty() && !self.endpoint.contains("/chat/completions")
        {
            return Err(FormatError::ConfigIncomplete("deployment name"));
        }
        Ok(())
    }

    /// True when enough is set to attempt formatting at all.
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Self {
        Self {
            endpoint: pick(&overrides.llm_endpoint, &self.endpoint),
            api_key: pick(&overrides.llm_api_key, &self.api_key),
            deployment_name: pick(&overrides.deployment, &self.deployment_name),
            api_version: self.api_version.clone(),
            params: self.params.clone(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &redacted(&self.api_key))
            .field("deployment_name", &self.deployment_name)
            .field("api_version", &self.api_version)
            .field("params", &self.params)
            .finish()
    }
}

/// Per-request values sent by the browser. Blank fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub ocr_endpoint: Option<String>,
    #[serde(default)]
    pub ocr_api_key: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub llm_endpoint: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
}

impl ConfigOverrides {
    /// Accept a multipart/query field by name. Returns false for unknown names.
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "ocr_endpoint" => &mut self.ocr_endpoint,
            "ocr_api_key" => &mut self.ocr_api_key,
            "model_id" => &mut self.model_id,
            "llm_endpoint" => &mut self.llm_endpoint,
            "llm_api_key" => &mut self.llm_api_key,
            "deployment" => &mut self.deployment,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Server-side defaults loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ocr: OcrConfig,
    pub llm: LlmConfig,
    pub prompt_template: String,
    pub bind_addr: String,
}

impl Settings {
    /// Read settings from environment variables. Credentials are optional here
    /// because the browser may send its own.
    pub fn from_env() -> Result<Self> {
        let ocr = OcrConfig {
            endpoint: env_or_default("DOCINTEL_ENDPOINT"),
            api_key: env_or_default("DOCINTEL_API_KEY"),
            model_id: env_opt("DOCINTEL_MODEL_ID"),
            pages: env_opt("DOCINTEL_PAGES"),
        };

        let llm = LlmConfig {
            endpoint: env_or_default("AZURE_OPENAI_ENDPOINT"),
            api_key: env_or_default("AZURE_OPENAI_API_KEY"),
            deployment_name: env_or_default("AZURE_OPENAI_DEPLOYMENT"),
            api_version: env_opt("AZURE_OPENAI_API_VERSION"),
            params: GenerationParams::default(),
        };

        let prompt_template = match env_opt("PROMPT_TEMPLATE_PATH") {
            Some(path) => load_template(Path::new(&path))?,
            None => DEFAULT_PROMPT_TEMPLATE.to_string(),
        };

        let bind_addr = env_opt("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        Ok(Self {
            ocr,
            llm,
            prompt_template,
            bind_addr,
        })
    }
}

/// Load a prompt template from disk.
pub fn load_template(path: &Path) -> Result<String> {
    let template = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt template: {:?}", path))?;
    if template.trim().is_empty() {
        anyhow::bail!("Prompt template is empty: {:?}", path);
    }
    info!("Loaded prompt template from {:?}", path);
    Ok(template)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or_default(key: &str) -> String {
    env_opt(key).unwrap_or_default()
}

fn pick(value: &Option<String>, fallback: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

fn pick_opt(value: &Option<String>, fallback: &Option<String>) -> Option<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => fallback.clone(),
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}
