//! OCR against the remote document-analysis service.
//!
//! [`AnalysisBackend`] is the submit/poll seam; [`document_intelligence`]
//! implements it over HTTP and [`fallback`] drives it across the candidate
//! endpoints produced by [`crate::endpoints`].

pub mod document_intelligence;
pub mod fallback;

use std::time::Duration;

use crate::analysis::AnalysisResult;
use crate::config::OcrConfig;
use crate::endpoints::CandidateEndpoint;
use crate::error::OcrError;

/// An uploaded file ready to be submitted.
#[derive(Debug, Clone)]
pub struct Payload {
    pub filename: String,
    /// MIME type reported by the browser, if any.
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            data,
        }
    }

    /// MIME type to send: the reported one, else a guess from the extension,
    /// else `application/octet-stream`.
    pub fn mime(&self) -> String {
        match self.content_type.as_deref().map(str::trim) {
            Some(ct) if !ct.is_empty() => ct.to_string(),
            _ => mime_guess::from_path(&self.filename)
                .first_or_octet_stream()
                .to_string(),
        }
    }
}

/// A submitted analysis job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub operation_location: String,
    pub api_version: String,
}

/// How often and how long to poll a job.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

/// Submit and poll one analysis job.
#[async_trait::async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn submit(
        &self,
        candidate: &CandidateEndpoint,
        payload: &Payload,
        config: &OcrConfig,
    ) -> Result<JobHandle, OcrError>;

    async fn poll(&self, job: &JobHandle, config: &OcrConfig) -> Result<AnalysisResult, OcrError>;
}
