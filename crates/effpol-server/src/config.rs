use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use effpol_core::{LookupProvider, RateLimiter, StaticProvider};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::orgpolicy::{
    CLOUD_PLATFORM_SCOPE, DEFAULT_ENDPOINT, METADATA_TOKEN_URL, OrgPolicyProvider, TokenSource,
};

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "effpol.toml";

/// Environment variable that overrides `lookup.access_token`.
pub const ACCESS_TOKEN_ENV: &str = "EFFPOL_ACCESS_TOKEN";

#[derive(Debug, Default, Deserialize)]
pub struct EffpolConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_rate_per_second() -> f64 {
    50.0
}
fn default_burst_size() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_second: default_rate_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LookupConfig {
    #[serde(default)]
    pub provider: LookupKind,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub access_token: Option<String>,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_token_url() -> String {
    METADATA_TOKEN_URL.into()
}
fn default_scope() -> String {
    CLOUD_PLATFORM_SCOPE.into()
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            provider: LookupKind::default(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            access_token: None,
            token_url: default_token_url(),
            scope: default_scope(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum LookupKind {
    #[default]
    #[serde(rename = "org-policy")]
    OrgPolicy,
    #[serde(rename = "stub")]
    Stub,
}

impl EffpolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the config from `explicit`, `./effpol.toml`, or
    /// `<config dir>/effpol/effpol.toml`, in that order. Falls back to
    /// built-in defaults when none exists. An explicit path must exist.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let cwd = std::env::current_dir().ok();
        let user_dir = dirs::config_dir().map(|d| d.join("effpol"));
        Self::discover_in(explicit, cwd.as_deref(), user_dir.as_deref())
    }

    fn discover_in(
        explicit: Option<&Path>,
        cwd: Option<&Path>,
        user_dir: Option<&Path>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        let candidates = [cwd, user_dir]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(CONFIG_FILE_NAME));
        for candidate in candidates {
            if candidate.is_file() {
                let config = Self::from_file(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }

        Ok((Self::default(), None))
    }

    pub fn bind_addr(&self, override_bind: Option<&str>) -> Result<SocketAddr, ConfigError> {
        let raw = override_bind.unwrap_or(&self.server.bind);
        raw.parse()
            .map_err(|e| ConfigError::Invalid(format!("bind address {raw:?}: {e}")))
    }

    pub fn build_limiter(&self) -> Result<RateLimiter, ConfigError> {
        RateLimiter::new(self.rate_limit.rate_per_second, self.rate_limit.burst_size)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn build_provider(&self) -> Result<Arc<dyn LookupProvider>, ConfigError> {
        let env_token = std::env::var(ACCESS_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        self.build_provider_with_token(env_token)
    }

    fn build_provider_with_token(
        &self,
        env_token: Option<String>,
    ) -> Result<Arc<dyn LookupProvider>, ConfigError> {
        match self.lookup.provider {
            LookupKind::OrgPolicy => {
                let tokens = match env_token.or_else(|| self.lookup.access_token.clone()) {
                    Some(token) => TokenSource::Static(token),
                    None => TokenSource::Metadata {
                        url: self.lookup.token_url.clone(),
                        scope: self.lookup.scope.clone(),
                    },
                };
                let provider = OrgPolicyProvider::new(
                    self.lookup.endpoint.clone(),
                    tokens,
                    Duration::from_secs(self.lookup.timeout_secs),
                )
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(provider))
            }
            LookupKind::Stub => Ok(Arc::new(StaticProvider::default())),
        }
    }
}
