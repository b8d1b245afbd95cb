//! Candidate endpoint resolution for the document-analysis service.
//!
//! The same resource may be provisioned against any of three API
//! generations. Rather than asking the user which one, we build every
//! plausible URL + version pair, newest first, and let the fallback
//! orchestrator probe them in order.

use serde::Serialize;

pub const DEFAULT_MODEL_ID: &str = "prebuilt-layout";

/// Current "document models" API under `/documentintelligence`.
const CURRENT_VERSIONS: &[&str] = &["2024-11-30", "2024-02-29-preview"];
/// Named-model API under `/formrecognizer/documentModels`.
const MID_VERSIONS: &[&str] = &["2023-07-31", "2022-08-31"];
/// Path-based API; the version lives in the path.
const LEGACY_VERSION: &str = "v2.1";

/// One URL + API version guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateEndpoint {
    pub url: String,
    pub api_version: String,
    pub is_legacy_path: bool,
}

impl CandidateEndpoint {
    /// Full submit URL including query parameters.
    pub fn request_url(&self, pages: Option<&str>) -> String {
        let pages = pages.map(str::trim).filter(|p| !p.is_empty());
        match (self.is_legacy_path, pages) {
            (true, None) => self.url.clone(),
            (true, Some(pages)) => format!("{}?pages={}", self.url, pages),
            (false, None) => format!("{}?api-version={}", self.url, self.api_version),
            (false, Some(pages)) => format!(
                "{}?api-version={}&pages={}",
                self.url, self.api_version, pages
            ),
        }
    }
}

/// Trim, drop trailing slashes and default the scheme to https.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Build the ordered candidate list for an analyze call.
///
/// Returns an empty list when the endpoint or model id is empty.
pub fn resolve_candidates(base: &str, model_id: Option<&str>) -> Vec<CandidateEndpoint> {
    let base = normalize_endpoint(base);
    let model = model_id.map(str::trim).unwrap_or(DEFAULT_MODEL_ID);
    if base.is_empty() || model.is_empty() {
        return Vec::new();
    }

    let mut candidates = Vec::with_capacity(CURRENT_VERSIONS.len() + MID_VERSIONS.len() + 1);

    for version in CURRENT_VERSIONS {
        candidates.push(CandidateEndpoint {
            url: format!("{}/documentintelligence/documentModels/{}:analyze", base, model),
            api_version: version.to_string(),
            is_legacy_path: false,
        });
    }

    for version in MID_VERSIONS {
        candidates.push(CandidateEndpoint {
            url: format!("{}/formrecognizer/documentModels/{}:analyze", base, model),
            api_version: version.to_string(),
            is_legacy_path: false,
        });
    }

    let legacy_url = if model == DEFAULT_MODEL_ID {
        format!("{}/formrecognizer/{}/layout/analyze", base, LEGACY_VERSION)
    } else {
        format!(
            "{}/formrecognizer/{}/custom/models/{}/analyze",
            base, LEGACY_VERSION, model
        )
    };
    candidates.push(CandidateEndpoint {
        url: legacy_url,
        api_version: LEGACY_VERSION.to_string(),
        is_legacy_path: true,
    });

    candidates
}

/// URLs that list the models of a resource, newest API first.
pub fn model_catalog_candidates(base: &str) -> Vec<String> {
    let base = normalize_endpoint(base);
    if base.is_empty() {
        return Vec::new();
    }
    vec![
        format!(
            "{}/documentintelligence/documentModels?api-version={}",
            base, CURRENT_VERSIONS[0]
        ),
        format!(
            "{}/formrecognizer/documentModels?api-version={}",
            base, MID_VERSIONS[0]
        ),
    ]
}

/// How a suggested model id relates to the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMatch {
    pub model_id: String,
    pub kind: MatchKind,
}

/// Find the best available model for a requested id.
///
/// Tiers, first hit wins: exact, case-insensitive exact, case-insensitive
/// substring in either direction. Inside a tier the lexicographically
/// smallest id is chosen so the answer never depends on listing order.
pub fn suggest_model(requested: &str, available: &[String]) -> Option<ModelMatch> {
    let requested = requested.trim();
    if requested.is_empty() {
        return None;
    }
    let wanted = requested.to_lowercase();

    let smallest = |pred: &dyn Fn(&str) -> bool| -> Option<String> {
        available
            .iter()
            .filter(|id| pred(id.as_str()))
            .min()
            .cloned()
    };

    if let Some(id) = smallest(&|id: &str| id == requested) {
        return Some(ModelMatch {
            model_id: id,
            kind: MatchKind::Exact,
        });
    }
    if let Some(id) = smallest(&|id: &str| id.to_lowercase() == wanted) {
        return Some(ModelMatch {
            model_id: id,
            kind: MatchKind::CaseInsensitive,
        });
    }
    smallest(&|id: &str| {
        let lower = id.to_lowercase();
        !lower.is_empty() && (lower.contains(&wanted) || wanted.contains(&lower))
    })
    .map(|id| ModelMatch {
        model_id: id,
        kind: MatchKind::Partial,
    })
}
