//! Upload pipeline: OCR, flatten, then format into a clinical note.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{LlmConfig, OcrConfig};
use crate::error::{FormatError, OcrError};
use crate::llm::ChatClient;
use crate::ocr::document_intelligence::DocumentIntelligenceClient;
use crate::ocr::fallback::analyze_document;
use crate::ocr::{AnalysisBackend, Payload};
use crate::text_extract;

/// Result of one upload. OCR text is kept even when formatting fails.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub id: String,
    pub filename: String,
    pub content_hash: String,
    pub extracted_text: String,
    pub formatted_note: Option<String>,
    pub format_error: Option<String>,
}

/// Pipeline orchestrator.
pub struct Pipeline<B: AnalysisBackend = DocumentIntelligenceClient> {
    backend: B,
    chat: ChatClient,
}

impl<B: AnalysisBackend> Pipeline<B> {
    pub fn new(backend: B, chat: ChatClient) -> Self {
        Self { backend, chat }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// OCR a file and flatten the result into text.
    pub async fn extract_text(
        &self,
        payload: &Payload,
        config: &OcrConfig,
    ) -> Result<String, OcrError> {
        let result = analyze_document(&self.backend, payload, config).await?;
        let text = text_extract::extract(&result);
        if text.trim().is_empty() {
            return Err(OcrError::NoTextFound);
        }
        info!(
            "Extracted {} chars from {} via {} ({} paragraphs, {} tables)",
            text.chars().count(),
            payload.filename,
            result.model_id.as_deref().unwrap_or("unknown model"),
            result.paragraphs.len(),
            result.all_tables().count()
        );
        Ok(text)
    }

    pub async fn format(
        &self,
        text: &str,
        template: &str,
        config: &LlmConfig,
    ) -> Result<String, FormatError> {
        self.chat.format(text, template, config).await
    }

    /// Run the whole upload. OCR failures are fatal; formatting failures are
    /// reported in the outcome next to the OCR text. Formatting is skipped
    /// when no language model config is given.
    pub async fn process(
        &self,
        payload: &Payload,
        ocr_config: &OcrConfig,
        llm_config: Option<&LlmConfig>,
        template: &str,
    ) -> Result<ProcessingOutcome, OcrError> {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Processing upload {}: {}", id, payload.filename);

        let extracted_text = self.extract_text(payload, ocr_config).await?;

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(extracted_text.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let (formatted_note, format_error) = match llm_config {
            None => (None, None),
            Some(cfg) => match self.format(&extracted_text, template, cfg).await {
                Ok(note) => (Some(note), None),
                Err(e) => {
                    warn!("Formatting failed for upload {}: {}", id, e);
                    (None, Some(e.to_string()))
                }
            },
        };

        info!("Upload {} complete", id);

        Ok(ProcessingOutcome {
            id,
            filename: payload.filename.clone(),
            content_hash,
            extracted_text,
            formatted_note,
            format_error,
        })
    }
}
