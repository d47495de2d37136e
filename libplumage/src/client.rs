//! Authenticated request execution against the network's XRPC API
//!
//! Every outbound call goes through [`XrpcClient::send`]: load the
//! caller's active session, refresh the access token if it is about to
//! expire, pass the rate gate, mint a DPoP proof, and classify the
//! outcome. At most one nonce retry and one reactive refresh happen per
//! top-level call.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::dpop::DpopKey;
use crate::error::{AuthError, NetworkError, PlumageError, Result};
use crate::nonce::NonceCache;
use crate::oauth::{OAuthClient, ACCESS_TOKEN_SKEW_SECS};
use crate::rate_gate::{RateGate, CLASS_API, CLASS_OAUTH};
use crate::token_store::TokenStore;

/// Per-attempt timeout on record-endpoint calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback wait when a 429 arrives without a Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Identifiers of a successfully created record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CreatedRecord {
    pub uri: String,
    pub cid: String,
}

/// The session owner's identity as the network currently reports it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub did: String,
    pub handle: String,
}

pub struct XrpcClient {
    http: reqwest::Client,
    config: Arc<Config>,
    store: TokenStore,
    oauth: Arc<OAuthClient>,
    gate: Arc<RateGate>,
    nonces: Arc<NonceCache>,
}

impl XrpcClient {
    pub fn new(
        config: Arc<Config>,
        store: TokenStore,
        oauth: Arc<OAuthClient>,
        gate: Arc<RateGate>,
        nonces: Arc<NonceCache>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            store,
            oauth,
            gate,
            nonces,
        }
    }

    /// Publish a record into the caller's repository.
    pub async fn create_record(
        &self,
        user_id: &str,
        repo_did: &str,
        collection: &str,
        record: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<CreatedRecord> {
        let body = serde_json::json!({
            "repo": repo_did,
            "collection": collection,
            "record": record,
        });

        let response = self
            .send(
                user_id,
                Method::POST,
                "/xrpc/com.atproto.repo.createRecord",
                Some(&body),
                cancel,
            )
            .await?;

        serde_json::from_value(response).map_err(|e| {
            NetworkError::Permanent {
                status: 200,
                body: format!("unparseable createRecord response: {}", e),
            }
            .into()
        })
    }

    /// Ask the network who the caller's stored session belongs to.
    /// Useful for detecting handle changes and for liveness probes.
    pub async fn get_session(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionInfo> {
        let response = self
            .send(
                user_id,
                Method::GET,
                "/xrpc/com.atproto.server.getSession",
                None,
                cancel,
            )
            .await?;

        serde_json::from_value(response).map_err(|e| {
            NetworkError::Permanent {
                status: 200,
                body: format!("unparseable getSession response: {}", e),
            }
            .into()
        })
    }

    /// Execute one authenticated call.
    pub async fn send(
        &self,
        user_id: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut material = self.store.get_most_recent_active(user_id).await?;

        // Proactive refresh when the access token is about to lapse
        let now = chrono::Utc::now().timestamp();
        if material.access_expires_at - now < ACCESS_TOKEN_SKEW_SECS {
            debug!(user_id = %user_id, "Access token near expiry, refreshing before call");
            material = self.oauth.refresh(&material.session_id, None).await?;
        }

        self.gate.wait_for(endpoint_class(path), 1, cancel).await?;

        let url = format!(
            "{}{}",
            self.config.service_url.trim_end_matches('/'),
            path
        );
        let host = host_of(&url);

        let mut key = DpopKey::from_private_jwk(&material.dpop_private_jwk)?;
        let mut nonce = self.nonces.get(user_id, &host);
        let mut nonce_retried = false;
        let mut refresh_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(PlumageError::Cancelled);
            }

            let proof = key.proof(method.as_str(), &url, nonce.as_deref())?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("DPoP {}", material.access_token))
                .header("DPoP", proof)
                .timeout(REQUEST_TIMEOUT);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = tokio::select! {
                result = request.send() => {
                    result.map_err(|e| NetworkError::Transient(e.to_string()))?
                }
                _ = cancel.cancelled() => return Err(PlumageError::Cancelled),
            };

            if let Some(fresh) = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
            {
                self.nonces.store(user_id, &host, fresh);
                nonce = Some(fresh.to_string());
            }

            let status = response.status();

            if status.is_success() {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| NetworkError::Transient(e.to_string()))?;
                if bytes.is_empty() {
                    return Ok(serde_json::Value::Null);
                }
                return serde_json::from_slice(&bytes).map_err(|e| {
                    NetworkError::Permanent {
                        status: status.as_u16(),
                        body: format!("unparseable response body: {}", e),
                    }
                    .into()
                });
            }

            if status.as_u16() == 429 {
                let retry_after_secs = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                return Err(NetworkError::RateLimited { retry_after_secs }.into());
            }

            let body_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 401 || status.as_u16() == 400 {
                match error_code_of(&body_text).as_deref() {
                    Some("use_dpop_nonce") => {
                        if nonce_retried || nonce.is_none() {
                            return Err(AuthError::NonceRetryExhausted.into());
                        }
                        debug!(user_id = %user_id, "Server requested a DPoP nonce, retrying once");
                        nonce_retried = true;
                        continue;
                    }
                    Some("invalid_token") | Some("expired_access_token") | Some("ExpiredToken")
                        if status.as_u16() == 401 =>
                    {
                        if refresh_retried {
                            warn!(user_id = %user_id, "Access token rejected twice, revoking session");
                            self.store
                                .revoke(&material.session_id, "token_rejected")
                                .await?;
                            return Err(
                                AuthError::SessionExpired(material.session_id.clone()).into()
                            );
                        }
                        debug!(user_id = %user_id, "Access token rejected, refreshing once");
                        refresh_retried = true;
                        material = self
                            .oauth
                            .refresh(&material.session_id, Some(material.access_expires_at))
                            .await?;
                        key = DpopKey::from_private_jwk(&material.dpop_private_jwk)?;
                        continue;
                    }
                    _ => {}
                }
            }

            if status.is_server_error() {
                return Err(
                    NetworkError::Transient(format!("{}: {}", status, body_text)).into(),
                );
            }

            return Err(NetworkError::Permanent {
                status: status.as_u16(),
                body: body_text,
            }
            .into());
        }
    }
}

fn endpoint_class(path: &str) -> &'static str {
    if path.starts_with("/oauth") {
        CLASS_OAUTH
    } else {
        CLASS_API
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn error_code_of(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}
