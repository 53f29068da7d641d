//! Org Policy v2 REST collaborator.
//!
//! [`OrgPolicyProvider`] obtains a bearer token once per batch and hands out
//! an [`OrgPolicyClient`] carrying it; the client resolves effective policies
//! with `GET {endpoint}/{name}:getEffectivePolicy`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use effpol_core::{LookupError, LookupProvider, PolicyLookup, PolicySpec, ResourceName, SharedLookup};
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ENDPOINT: &str = "https://orgpolicy.googleapis.com/v2";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Where the bearer token for a batch comes from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A fixed token, e.g. from `EFFPOL_ACCESS_TOKEN`.
    Static(String),
    /// The instance metadata server, asked for `scope`.
    Metadata { url: String, scope: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// The subset of the `Policy` resource this service reads.
#[derive(Debug, Deserialize)]
struct Policy {
    #[serde(default)]
    name: String,
    #[serde(default)]
    spec: Option<PolicySpec>,
}

pub struct OrgPolicyProvider {
    http: reqwest::Client,
    endpoint: Url,
    tokens: TokenSource,
}

impl OrgPolicyProvider {
    pub fn new(endpoint: String, tokens: TokenSource, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Connect(format!("failed to build HTTP client: {e}")))?;
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|e| LookupError::Connect(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(LookupError::Connect(format!(
                "invalid endpoint {endpoint}: not a base URL"
            )));
        }
        Ok(Self {
            http,
            endpoint,
            tokens,
        })
    }

    async fn fetch_token(&self) -> Result<String, LookupError> {
        let (url, scope) = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url, scope } => (url, scope),
        };

        let resp = self
            .http
            .get(url)
            .query(&[("scopes", scope.as_str())])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| LookupError::Connect(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LookupError::Connect(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| LookupError::Connect(format!("malformed token response: {e}")))?;
        Ok(token.access_token)
    }
}

impl LookupProvider for OrgPolicyProvider {
    fn connect<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SharedLookup, LookupError>> + Send + 'a>> {
        Box::pin(async move {
            let token = self.fetch_token().await?;
            tracing::debug!(endpoint = %self.endpoint, "Opened Org Policy client");
            let client: SharedLookup = Arc::new(OrgPolicyClient {
                http: self.http.clone(),
                endpoint: self.endpoint.clone(),
                token,
            });
            Ok(client)
        })
    }
}

/// Per-batch Org Policy handle. Dropping it forgets the batch's token.
pub struct OrgPolicyClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl OrgPolicyClient {
    /// `{endpoint}/{name}:getEffectivePolicy`, with every name segment
    /// percent-encoded so the name can only address a path below the endpoint.
    fn url_for(&self, name: &ResourceName) -> Result<Url, LookupError> {
        let invalid = |reason| LookupError::InvalidName {
            name: name.to_string(),
            reason,
        };

        let segments: Vec<&str> = name.as_str().split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(invalid("relative path segment"));
        }
        let Some((last, parents)) = segments.split_last() else {
            return Err(invalid("empty path segment"));
        };

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| invalid("endpoint cannot carry a path"))?
            .pop_if_empty()
            .extend(parents)
            .push(&format!("{last}:getEffectivePolicy"));
        Ok(url)
    }

    async fn fetch(&self, name: &ResourceName) -> Result<PolicySpec, LookupError> {
        let url = self.url_for(name)?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LookupError::Status { status, body });
        }

        let policy: Policy = resp
            .json()
            .await
            .map_err(|e| LookupError::Decode(e.to_string()))?;
        tracing::trace!(name = %name, policy = %policy.name, "Fetched effective policy");
        Ok(policy.spec.unwrap_or_default())
    }
}

impl PolicyLookup for OrgPolicyClient {
    type Spec = PolicySpec;

    fn get<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a ResourceName,
    ) -> Pin<Box<dyn Future<Output = Result<PolicySpec, LookupError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LookupError::Cancelled),
                result = self.fetch(name) => result,
            }
        })
    }
}
