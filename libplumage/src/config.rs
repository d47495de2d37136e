//! Configuration management for Plumage
//!
//! All configuration comes from the environment. The three secrets the
//! engine cannot run without (database URL, OAuth client id, encryption
//! key) are required and validated at startup; everything else has a
//! default tuned for the public network.

use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Minimum length of the at-rest encryption secret, in bytes.
pub const MIN_ENCRYPTION_KEY_BYTES: usize = 32;

/// Main configuration structure for the Plumage engine
#[derive(Clone)]
pub struct Config {
    /// SQLite database URL (e.g. `sqlite:/var/lib/plumage/plumage.db`)
    pub database_url: String,

    /// OAuth client id: the HTTPS URL of the public client-metadata document
    pub client_id: String,

    /// OAuth client secret. Empty for public clients.
    pub client_secret: String,

    /// Secret material the token cipher key is derived from
    pub encryption_key: String,

    /// Base URL of the network's PDS / entryway
    pub service_url: String,

    /// OAuth authorization endpoint
    pub authorize_endpoint: String,

    /// OAuth token endpoint
    pub token_endpoint: String,

    /// Redirect URI registered in the client metadata
    pub redirect_uri: String,

    /// OAuth scope requested at authorization
    pub scope: String,

    /// Seconds between dispatcher scans
    pub poll_interval_secs: u64,

    /// Maximum due posts fetched per scan
    pub batch_size: u32,

    /// Posts executed concurrently within a scan
    pub sub_batch_size: usize,

    /// Retry budget per post
    pub max_retries: u32,

    /// Grace period for draining an in-flight scan at shutdown
    pub shutdown_grace_secs: u64,

    /// Lifetime granted to refresh tokens we store
    pub refresh_token_ttl_secs: i64,

    /// BCP-47 language tags attached to published records
    pub post_langs: Vec<String>,
}

impl std::fmt::Debug for Config {
    // Secrets stay out of Debug output
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("client_id", &self.client_id)
            .field("service_url", &self.service_url)
            .field("token_endpoint", &self.token_endpoint)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or fails
    /// validation. Startup should treat any error here as fatal.
    pub fn from_env() -> Result<Self> {
        let database_url = require("PLUMAGE_DATABASE_URL")?;
        let client_id = require("PLUMAGE_CLIENT_ID")?;
        let encryption_key = require("PLUMAGE_ENCRYPTION_KEY")?;

        if encryption_key.len() < MIN_ENCRYPTION_KEY_BYTES {
            return Err(ConfigError::InvalidVar {
                var: "PLUMAGE_ENCRYPTION_KEY".to_string(),
                reason: format!(
                    "must be at least {} bytes, got {}",
                    MIN_ENCRYPTION_KEY_BYTES,
                    encryption_key.len()
                ),
            }
            .into());
        }

        if !client_id.starts_with("https://") {
            return Err(ConfigError::InvalidVar {
                var: "PLUMAGE_CLIENT_ID".to_string(),
                reason: "must be the HTTPS URL of the client metadata document".to_string(),
            }
            .into());
        }

        let service_url = optional("PLUMAGE_SERVICE_URL", "https://bsky.social");
        let authorize_endpoint = optional(
            "PLUMAGE_AUTHORIZE_ENDPOINT",
            &format!("{}/oauth/authorize", service_url.trim_end_matches('/')),
        );
        let token_endpoint = optional(
            "PLUMAGE_TOKEN_ENDPOINT",
            &format!("{}/oauth/token", service_url.trim_end_matches('/')),
        );

        let post_langs = optional("PLUMAGE_POST_LANGS", "en")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            client_id,
            client_secret: optional("PLUMAGE_CLIENT_SECRET", ""),
            encryption_key,
            service_url,
            authorize_endpoint,
            token_endpoint,
            redirect_uri: optional("PLUMAGE_REDIRECT_URI", ""),
            scope: optional("PLUMAGE_SCOPE", "atproto transition:generic"),
            poll_interval_secs: parse_var("PLUMAGE_POLL_INTERVAL_SECS", 60)?,
            batch_size: parse_var("PLUMAGE_BATCH_SIZE", 100)?,
            sub_batch_size: parse_var("PLUMAGE_SUB_BATCH_SIZE", 10)?,
            max_retries: parse_var("PLUMAGE_MAX_RETRIES", 3)?,
            shutdown_grace_secs: parse_var("PLUMAGE_SHUTDOWN_GRACE_SECS", 30)?,
            refresh_token_ttl_secs: parse_var(
                "PLUMAGE_REFRESH_TTL_SECS",
                30 * 24 * 3600_i64,
            )?,
            post_langs,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn require(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var.to_string()).into()),
    }
}

fn optional(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
            ConfigError::InvalidVar {
                var: var.to_string(),
                reason: format!("could not parse {:?}", raw),
            }
            .into()
        }),
        _ => Ok(default),
    }
}

/// Build a config without touching the process environment, for tests
/// elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        client_id: "https://plumage.example/client-metadata.json".to_string(),
        client_secret: String::new(),
        encryption_key: "0123456789abcdef0123456789abcdef".to_string(),
        service_url: "https://bsky.social".to_string(),
        authorize_endpoint: "https://bsky.social/oauth/authorize".to_string(),
        token_endpoint: "https://bsky.social/oauth/token".to_string(),
        redirect_uri: "https://plumage.example/auth/callback".to_string(),
        scope: "atproto transition:generic".to_string(),
        poll_interval_secs: 60,
        batch_size: 100,
        sub_batch_size: 10,
        max_retries: 3,
        shutdown_grace_secs: 30,
        refresh_token_ttl_secs: 30 * 24 * 3600,
        post_langs: vec!["en".to_string()],
    }
}
