// Request identity and dedup exemptions.

use std::fmt;

use reqwest::Method;

use crate::transport::RequestBody;

/// Deterministic identity of a request: method, path, sorted query
/// parameters and serialized body. Two logically identical requests
/// produce equal fingerprints regardless of parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(
        method: &Method,
        path: &str,
        params: &[(String, String)],
        body: &RequestBody,
    ) -> Self {
        let mut sorted: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        sorted.sort_unstable();
        let params_json = serde_json::to_string(&sorted).unwrap_or_default();

        let body_json = match body {
            RequestBody::Empty => String::new(),
            // serde_json maps keep keys ordered, so this is canonical.
            RequestBody::Json(value) => value.to_string(),
            RequestBody::Multipart(_) | RequestBody::Binary { .. } => "<opaque>".to_owned(),
        };

        Self(format!("{method} {path} ?{params_json} {body_json}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Exemptions ───────────────────────────────────────────────────────

/// Requests that bypass dedup bookkeeping entirely.
///
/// A request is exempt when its path contains any configured pattern, or
/// when its body is opaque (multipart or raw bytes). Exempt requests are
/// dispatched immediately and never cancelled by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptionRules {
    pub path_patterns: Vec<String>,
}

impl Default for ExemptionRules {
    fn default() -> Self {
        Self {
            path_patterns: vec![
                "/upload".into(),
                "/stream".into(),
                "/notifications".into(),
            ],
        }
    }
}

impl ExemptionRules {
    pub fn none() -> Self {
        Self {
            path_patterns: Vec::new(),
        }
    }

    pub fn is_exempt(&self, path: &str, body: &RequestBody) -> bool {
        body.is_opaque()
            || self
                .path_patterns
                .iter()
                .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()))
    }
}
