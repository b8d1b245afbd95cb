//! Probe candidate endpoints in order until one completes an analysis.

use tracing::{info, warn};

use super::{AnalysisBackend, Payload};
use crate::analysis::AnalysisResult;
use crate::config::OcrConfig;
use crate::endpoints::{resolve_candidates, CandidateEndpoint};
use crate::error::OcrError;

/// Validate the configuration, resolve candidates and run [`try_all`].
pub async fn analyze_document<B: AnalysisBackend + ?Sized>(
    backend: &B,
    payload: &Payload,
    config: &OcrConfig,
) -> Result<AnalysisResult, OcrError> {
    config.validate()?;
    let candidates = resolve_candidates(&config.endpoint, config.model_id.as_deref());
    try_all(backend, &candidates, payload, config).await
}

/// Submit and poll against each candidate in order; the first success wins.
///
/// Failures of individual candidates are logged and swallowed. Only when
/// every candidate has failed is the last error returned, wrapped in
/// [`OcrError::AllCandidatesExhausted`].
pub async fn try_all<B: AnalysisBackend + ?Sized>(
    backend: &B,
    candidates: &[CandidateEndpoint],
    payload: &Payload,
    config: &OcrConfig,
) -> Result<AnalysisResult, OcrError> {
    if candidates.is_empty() {
        return Err(OcrError::NoCandidates);
    }

    let mut last_error = None;

    for (i, candidate) in candidates.iter().enumerate() {
        info!(
            "OCR candidate {}/{}: {} (api-version {})",
            i + 1,
            candidates.len(),
            candidate.url,
            candidate.api_version
        );

        let outcome = match backend.submit(candidate, payload, config).await {
            Ok(job) => backend.poll(&job, config).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                info!("OCR succeeded via {} ({})", candidate.url, candidate.api_version);
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "OCR candidate {} ({}) failed: {}",
                    candidate.url, candidate.api_version, e
                );
                last_error = Some(e);
            }
        }
    }

    Err(OcrError::AllCandidatesExhausted {
        attempted: candidates.len(),
        last_error: Box::new(last_error.unwrap_or(OcrError::NoCandidates)),
    })
}
