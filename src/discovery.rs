//! Discovery client — HTTP client for combiner assignment
//!
//! One round-trip against the control plane: the client posts its identity
//! and receives the combiner endpoint it has been assigned to. No retry at
//! this layer; a failed assignment aborts startup.

use serde::Deserialize;

use crate::config::ControllerConfig;

/// Environment variable overriding the Authorization scheme for the
/// assignment request (default `Bearer`).
pub const AUTH_SCHEME_ENV: &str = "FEDN_AUTH_SCHEME";

/// Assignment errors. Fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Controller returned status {0}")]
    ServerError(reqwest::StatusCode),
    #[error("Malformed assignment response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Combiner endpoint returned by the controller.
///
/// `port` is only populated for insecure deployments; `fqdn` names an L7
/// proxy fronting the combiner when one is in place.
#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    pub host: String,
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// HTTP client for the control plane.
#[derive(Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl DiscoveryClient {
    /// Create a new discovery client for the given control-plane config.
    pub fn new(config: &ControllerConfig) -> Result<Self, AssignmentError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// Request assignment to a combiner.
    ///
    /// Issues exactly one `POST {api_url}/api/v1/clients/add`. The
    /// `Authorization` header is attached iff the token is non-empty, with
    /// the scheme taken from `FEDN_AUTH_SCHEME` (default `Bearer`).
    /// Redirects are followed.
    pub async fn assign(&self, config: &ControllerConfig) -> Result<Assignment, AssignmentError> {
        let body = serde_json::json!({
            "client_id": config.client_id,
            "name": config.name,
            "package": config.package,
            "preferred_combiner": config.preferred_combiner,
        });

        let mut req = self
            .http
            .post(format!("{}/api/v1/clients/add", self.api_url))
            .header("Content-Type", "application/json")
            .json(&body);

        if !self.token.is_empty() {
            let scheme =
                std::env::var(AUTH_SCHEME_ENV).unwrap_or_else(|_| "Bearer".to_string());
            req = req.header("Authorization", format!("{} {}", scheme, self.token));
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            return Err(AssignmentError::ServerError(resp.status()));
        }

        let bytes = resp.bytes().await?;
        let assignment: Assignment = serde_json::from_slice(&bytes)?;
        Ok(assignment)
    }

    /// Control-plane origin, for logging.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}
