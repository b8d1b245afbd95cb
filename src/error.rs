//! Error types for the OCR and formatting clients.

use thiserror::Error;

/// Failures of the OCR side: configuration, submit, polling, fallback.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR configuration incomplete: {0} is required")]
    ConfigIncomplete(&'static str),

    #[error("no candidate endpoints could be built from the OCR configuration")]
    NoCandidates,

    #[error("OCR request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("OCR service returned {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("OCR service accepted the document but returned no operation-location header")]
    MissingJobLocation,

    #[error("analysis job failed: {reason}")]
    JobFailed { reason: String },

    #[error("analysis job did not finish after {attempts} polls")]
    PollTimeout { attempts: u32 },

    #[error("all {attempted} OCR endpoints failed; last error: {last_error}")]
    AllCandidatesExhausted {
        attempted: usize,
        last_error: Box<OcrError>,
    },

    #[error("unexpected OCR response: {0}")]
    InvalidResponseShape(String),

    #[error("no text could be extracted from the document")]
    NoTextFound,
}

/// Failures of the language-model formatting client.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("language model configuration incomplete: {0} is required")]
    ConfigIncomplete(&'static str),

    #[error("prompt template must contain the {0} placeholder")]
    InvalidTemplate(&'static str),

    #[error("language model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("language model returned {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("language model still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("language model returned no completion")]
    EmptyCompletion,

    #[error("unexpected language model response: {0}")]
    InvalidResponseShape(String),
}
