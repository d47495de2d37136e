//! OAuth 2.0 authorization against the network
//!
//! Implements the PKCE-bound authorization-code flow the network
//! requires, with DPoP proofs on every token-endpoint call, and owns
//! token refresh for stored sessions. Refreshes are single-flight per
//! session: concurrent callers wait on the in-flight refresh and reuse
//! its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::dpop::DpopKey;
use crate::error::{AuthError, NetworkError, PlumageError, Result};
use crate::nonce::NonceCache;
use crate::rate_gate::{RateGate, CLASS_OAUTH};
use crate::token_store::{NewSession, SessionMaterial, TokenStore};
use crate::types::User;

/// Access tokens within this many seconds of expiry are treated as
/// expired and refreshed before use.
pub const ACCESS_TOKEN_SKEW_SECS: i64 = 30;

/// How long a started authorization may sit before the callback.
const STATE_TTL_SECS: i64 = 600;

/// Upper bound on concurrently pending authorizations.
const STATE_CACHE_MAX: usize = 10_000;

/// Per-attempt timeout on token-endpoint calls.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Retry budget for transient token-endpoint failures.
const TOKEN_RETRY_ATTEMPTS: u32 = 3;

/// Nonce-cache scope used before a user identity exists.
const NONCE_SCOPE_ANON: &str = "";

// ----------------------------------------------------------------------
// PKCE
// ----------------------------------------------------------------------

/// Generate a PKCE code verifier: 64 random bytes, base64url encoded
/// to 86 unreserved characters.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for a verifier: base64url(SHA-256(verifier)), no
/// padding.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// RFC 7636 verifier shape: 43 to 128 unreserved characters.
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    let len = verifier.len();
    (43..=128).contains(&len)
        && verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

// ----------------------------------------------------------------------
// Pending-authorization state
// ----------------------------------------------------------------------

struct PendingAuth {
    verifier: String,
    redirect_uri: String,
    expires_at: i64,
}

/// Bounded in-memory map of started authorizations, keyed by the
/// opaque `state` value. Entries are single use and expire after ten
/// minutes; the dispatcher's maintenance task sweeps leftovers.
#[derive(Default)]
pub struct StateCache {
    inner: std::sync::Mutex<HashMap<String, PendingAuth>>,
}

impl StateCache {
    fn insert(&self, state: String, verifier: String, redirect_uri: String, now: i64) {
        let mut map = self.inner.lock().expect("state cache lock poisoned");

        if map.len() >= STATE_CACHE_MAX {
            map.retain(|_, pending| pending.expires_at > now);
        }
        if map.len() >= STATE_CACHE_MAX {
            // Still full of live entries: drop the one closest to expiry
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, p)| p.expires_at)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }

        map.insert(
            state,
            PendingAuth {
                verifier,
                redirect_uri,
                expires_at: now + STATE_TTL_SECS,
            },
        );
    }

    /// Remove and return the entry for `state`. Expired entries are
    /// treated as absent.
    fn take(&self, state: &str, now: i64) -> Option<PendingAuth> {
        let mut map = self.inner.lock().expect("state cache lock poisoned");
        let pending = map.remove(state)?;
        if pending.expires_at <= now {
            return None;
        }
        Some(pending)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self, now: i64) -> usize {
        let mut map = self.inner.lock().expect("state cache lock poisoned");
        let before = map.len();
        map.retain(|_, pending| pending.expires_at > now);
        before - map.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

// ----------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetSessionResponse {
    did: String,
    handle: String,
}

/// Everything the HTTP boundary needs to send the user off to the
/// network's consent screen: the URL itself plus the state and
/// verifier it should pin in cookies.
#[derive(Debug)]
pub struct AuthorizationStart {
    pub authorize_url: String,
    pub state: String,
    pub code_verifier: String,
}

/// Result of a completed authorization.
#[derive(Debug)]
pub struct AuthorizedSession {
    pub user: User,
    pub session_id: String,
}

// ----------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------

pub struct OAuthClient {
    http: reqwest::Client,
    config: Arc<Config>,
    db: Database,
    store: TokenStore,
    nonces: Arc<NonceCache>,
    gate: Arc<RateGate>,
    states: StateCache,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl OAuthClient {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        store: TokenStore,
        nonces: Arc<NonceCache>,
        gate: Arc<RateGate>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            db,
            store,
            nonces,
            gate,
            states: StateCache::default(),
            refresh_locks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn state_cache(&self) -> &StateCache {
        &self.states
    }

    /// Start an authorization: mint verifier and state, remember them,
    /// and build the consent URL.
    pub fn begin_authorization(&self, redirect_uri: Option<&str>) -> Result<AuthorizationStart> {
        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);

        let mut state_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        let redirect_uri = redirect_uri
            .filter(|uri| !uri.is_empty())
            .unwrap_or(&self.config.redirect_uri)
            .to_string();

        let mut url = reqwest::Url::parse(&self.config.authorize_endpoint)
            .map_err(|e| AuthError::TokenExchange(format!("bad authorize endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        self.states.insert(
            state.clone(),
            verifier.clone(),
            redirect_uri,
            chrono::Utc::now().timestamp(),
        );

        debug!("Started authorization");
        Ok(AuthorizationStart {
            authorize_url: url.to_string(),
            state,
            code_verifier: verifier,
        })
    }

    /// Finish an authorization: verify the callback, exchange the code,
    /// learn who authorized us, and persist the session.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        verifier: &str,
        user_agent: Option<&str>,
        source_addr: Option<&str>,
    ) -> Result<AuthorizedSession> {
        let now = chrono::Utc::now().timestamp();

        let pending = self
            .states
            .take(state, now)
            .ok_or(AuthError::StateInvalid)?;
        if pending.verifier != verifier {
            return Err(AuthError::VerifierMismatch.into());
        }

        let key = DpopKey::generate();

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier),
        ];
        let tokens = self
            .send_token_request(&form, &key, NONCE_SCOPE_ANON)
            .await?;

        let identity = self.fetch_identity(&tokens.access_token, &key).await?;
        let user = self
            .db
            .upsert_user(&identity.did, &identity.handle, None)
            .await?;

        let access_expires_at = now + tokens.expires_in;
        let refresh_expires_at = now + self.config.refresh_token_ttl_secs;
        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            AuthError::TokenExchange("token response missing refresh_token".to_string())
        })?;

        let session_id = self
            .store
            .put(NewSession {
                user_id: &user.id,
                access_token: &tokens.access_token,
                refresh_token: &refresh_token,
                dpop_private_jwk: &key.private_jwk(),
                dpop_public_jwk: &serde_json::to_string(&key.public_jwk())
                    .expect("public jwk serializes"),
                dpop_key_id: &key.thumbprint(),
                access_expires_at: access_expires_at.min(refresh_expires_at),
                refresh_expires_at,
                user_agent,
                source_addr,
            })
            .await?;

        info!(user_id = %user.id, handle = %user.handle, "Authorization complete");
        Ok(AuthorizedSession { user, session_id })
    }

    /// Refresh a session's tokens, serialized per session id.
    ///
    /// Callers that arrive while a refresh is in flight block on the
    /// same lock and, once inside, find the work already done and
    /// return the rotated material without a second outbound request.
    ///
    /// `observed_access_expires_at` distinguishes the two triggers.
    /// `None` is a proactive refresh: skipped when the stored token is
    /// still comfortably fresh. `Some(exp)` is a reactive refresh after
    /// the server rejected a token: skipped only when the stored expiry
    /// no longer matches `exp`, meaning another flight already rotated.
    pub async fn refresh(
        &self,
        session_id: &str,
        observed_access_expires_at: Option<i64>,
    ) -> Result<SessionMaterial> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(session_id, observed_access_expires_at)
                .await
        };

        // Evict the lock entry once nobody else holds a handle, so the
        // map does not accumulate one entry per session ever refreshed
        drop(lock);
        {
            let mut locks = self.refresh_locks.lock().await;
            if let Some(entry) = locks.get(session_id) {
                if Arc::strong_count(entry) == 1 {
                    locks.remove(session_id);
                }
            }
        }

        result
    }

    /// The body of [`refresh`](Self::refresh), run under the session's
    /// single-flight lock.
    async fn refresh_locked(
        &self,
        session_id: &str,
        observed_access_expires_at: Option<i64>,
    ) -> Result<SessionMaterial> {
        let material = self.store.get(session_id).await?;
        let now = chrono::Utc::now().timestamp();
        let already_done = match observed_access_expires_at {
            None => material.access_expires_at > now + ACCESS_TOKEN_SKEW_SECS,
            Some(observed) => material.access_expires_at != observed,
        };
        if already_done {
            return Ok(material);
        }

        let key = DpopKey::from_private_jwk(&material.dpop_private_jwk)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", material.refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("scope", self.config.scope.as_str()),
        ];

        let mut attempt = 0;
        let tokens = loop {
            attempt += 1;
            match self
                .send_token_request(&form, &key, &material.user_id)
                .await
            {
                Ok(tokens) => break tokens,
                Err(PlumageError::Auth(AuthError::RefreshRejected(msg))) => {
                    warn!(session_id = %session_id, "Refresh rejected, revoking session");
                    self.store.revoke(session_id, "refresh_rejected").await?;
                    return Err(AuthError::RefreshRejected(msg).into());
                }
                Err(e) if e.is_retryable() && attempt < TOKEN_RETRY_ATTEMPTS => {
                    let delay = Duration::from_secs(2_u64.pow(attempt - 1));
                    warn!(
                        session_id = %session_id,
                        attempt, "Transient refresh failure: {}. Retrying in {:?}", e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let now = chrono::Utc::now().timestamp();
        let refresh_expires_at = now + self.config.refresh_token_ttl_secs;
        let access_expires_at = (now + tokens.expires_in).min(refresh_expires_at);
        let new_refresh = tokens
            .refresh_token
            .as_deref()
            .unwrap_or(material.refresh_token.as_str());

        self.store
            .rotate(
                session_id,
                &tokens.access_token,
                new_refresh,
                access_expires_at,
                refresh_expires_at,
                None,
            )
            .await?;

        debug!(session_id = %session_id, "Refreshed session tokens");
        self.store.get(session_id).await
    }

    /// POST to the token endpoint with a DPoP proof, renegotiating the
    /// server nonce at most once.
    async fn send_token_request(
        &self,
        form: &[(&str, &str)],
        key: &DpopKey,
        nonce_scope: &str,
    ) -> Result<TokenResponse> {
        let endpoint = &self.config.token_endpoint;
        let host = host_of(endpoint);

        self.gate.wait_for(CLASS_OAUTH, 1, &self.shutdown).await?;

        let mut nonce = self.nonces.get(nonce_scope, &host);
        let mut nonce_retried = false;

        loop {
            let proof = key.proof("POST", endpoint, nonce.as_deref())?;

            let response = self
                .http
                .post(endpoint)
                .header("DPoP", proof)
                .form(form)
                .timeout(TOKEN_TIMEOUT)
                .send()
                .await
                .map_err(|e| NetworkError::Transient(e.to_string()))?;

            if let Some(fresh) = header_str(&response, "DPoP-Nonce") {
                self.nonces.store(nonce_scope, &host, &fresh);
                nonce = Some(fresh);
            }

            let status = response.status();
            if status.is_success() {
                return response.json::<TokenResponse>().await.map_err(|e| {
                    AuthError::TokenExchange(format!("unparseable token response: {}", e)).into()
                });
            }

            let body = response.text().await.unwrap_or_default();
            let error_code = error_code_of(&body);

            if matches!(status.as_u16(), 400 | 401) && error_code.as_deref() == Some("use_dpop_nonce")
            {
                if nonce_retried || nonce.is_none() {
                    return Err(AuthError::NonceRetryExhausted.into());
                }
                debug!("Token endpoint requested a nonce, retrying once");
                nonce_retried = true;
                continue;
            }

            if error_code.as_deref() == Some("invalid_grant") {
                return Err(AuthError::RefreshRejected(body).into());
            }

            if status.is_server_error() {
                return Err(NetworkError::Transient(format!("{}: {}", status, body)).into());
            }

            return Err(AuthError::TokenExchange(format!("{}: {}", status, body)).into());
        }
    }

    /// Ask the network who the new tokens belong to.
    async fn fetch_identity(
        &self,
        access_token: &str,
        key: &DpopKey,
    ) -> Result<GetSessionResponse> {
        let url = format!(
            "{}/xrpc/com.atproto.server.getSession",
            self.config.service_url.trim_end_matches('/')
        );
        let host = host_of(&url);

        let mut nonce = self.nonces.get(NONCE_SCOPE_ANON, &host);
        let mut nonce_retried = false;

        loop {
            let proof = key.proof("GET", &url, nonce.as_deref())?;

            let response = self
                .http
                .get(&url)
                .header("Authorization", format!("DPoP {}", access_token))
                .header("DPoP", proof)
                .timeout(TOKEN_TIMEOUT)
                .send()
                .await
                .map_err(|e| NetworkError::Transient(e.to_string()))?;

            if let Some(fresh) = header_str(&response, "DPoP-Nonce") {
                self.nonces.store(NONCE_SCOPE_ANON, &host, &fresh);
                nonce = Some(fresh);
            }

            let status = response.status();
            if status.is_success() {
                return response.json::<GetSessionResponse>().await.map_err(|e| {
                    AuthError::IdentityFetch(format!("unparseable session response: {}", e)).into()
                });
            }

            let body = response.text().await.unwrap_or_default();
            if matches!(status.as_u16(), 400 | 401)
                && error_code_of(&body).as_deref() == Some("use_dpop_nonce")
                && !nonce_retried
                && nonce.is_some()
            {
                nonce_retried = true;
                continue;
            }

            return Err(AuthError::IdentityFetch(format!("{}: {}", status, body)).into());
        }
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_code_of(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::crypto::TokenCipher;
    use crate::db::test_db;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const TEST_SECRET: &str = "a-test-secret-that-is-at-least-32-bytes";

    // ------------------------------------------------------------------
    // PKCE
    // ------------------------------------------------------------------

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_code_verifier();
        assert!(is_valid_code_verifier(&verifier));
        assert_eq!(verifier.len(), 86);
    }

    #[test]
    fn test_verifiers_are_unique() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
    }

    #[test]
    fn test_challenge_matches_rfc_vector() {
        // RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_validation_bounds() {
        assert!(!is_valid_code_verifier(&"a".repeat(42)));
        assert!(is_valid_code_verifier(&"a".repeat(43)));
        assert!(is_valid_code_verifier(&"a".repeat(128)));
        assert!(!is_valid_code_verifier(&"a".repeat(129)));
        assert!(!is_valid_code_verifier(&format!("{}@", "a".repeat(43))));
    }

    // ------------------------------------------------------------------
    // State cache
    // ------------------------------------------------------------------

    #[test]
    fn test_state_is_single_use() {
        let cache = StateCache::default();
        cache.insert("s1".into(), "v1".into(), "https://cb".into(), 1000);

        let taken = cache.take("s1", 1001).unwrap();
        assert_eq!(taken.verifier, "v1");
        assert!(cache.take("s1", 1001).is_none());
    }

    #[test]
    fn test_state_expires() {
        let cache = StateCache::default();
        cache.insert("s1".into(), "v1".into(), "https://cb".into(), 1000);

        assert!(cache.take("s1", 1000 + STATE_TTL_SECS + 1).is_none());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = StateCache::default();
        cache.insert("old".into(), "v".into(), "https://cb".into(), 1000);
        cache.insert(
            "fresh".into(),
            "v".into(),
            "https://cb".into(),
            1000 + STATE_TTL_SECS,
        );

        let removed = cache.sweep(1000 + STATE_TTL_SECS + 1);
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.take("fresh", 1000 + STATE_TTL_SECS + 2).is_some());
    }

    // ------------------------------------------------------------------
    // Flow, against a mock network
    // ------------------------------------------------------------------

    struct Harness {
        _tmp: tempfile::TempDir,
        db: Database,
        store: TokenStore,
        client: OAuthClient,
        server: MockServer,
    }

    async fn harness() -> Harness {
        let (tmp, db) = test_db().await;
        let server = MockServer::start().await;

        let mut cfg = config::test_config();
        cfg.service_url = server.uri();
        cfg.authorize_endpoint = format!("{}/oauth/authorize", server.uri());
        cfg.token_endpoint = format!("{}/oauth/token", server.uri());
        let cfg = Arc::new(cfg);

        let cipher = TokenCipher::new(TEST_SECRET).unwrap();
        let store = TokenStore::new(db.clone(), cipher);
        let client = OAuthClient::new(
            cfg,
            db.clone(),
            store.clone(),
            Arc::new(NonceCache::new()),
            Arc::new(RateGate::new()),
            CancellationToken::new(),
        );

        Harness {
            _tmp: tmp,
            db,
            store,
            client,
            server,
        }
    }

    fn token_json(access: &str, refresh: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 3600,
            "scope": "atproto transition:generic",
        })
    }

    async fn mount_get_session(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.server.getSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "did": "did:plc:flowtest",
                "handle": "flow.bsky.social",
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_begin_authorization_builds_pkce_url() {
        let cfg = Arc::new(config::test_config());
        let (_tmp, db) = test_db().await;
        let store = TokenStore::new(db.clone(), TokenCipher::new(TEST_SECRET).unwrap());
        let client = OAuthClient::new(
            cfg,
            db,
            store,
            Arc::new(NonceCache::new()),
            Arc::new(RateGate::new()),
            CancellationToken::new(),
        );

        let start = client.begin_authorization(None).unwrap();
        let url = reqwest::Url::parse(&start.authorize_url).unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], start.state);
        assert_eq!(pairs["code_challenge"], code_challenge(&start.code_verifier));
        assert!(is_valid_code_verifier(&start.code_verifier));
    }

    #[tokio::test]
    async fn test_complete_authorization_persists_user_and_session() {
        let h = harness().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(header_exists("DPoP"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-1", "refresh-1")),
            )
            .expect(1)
            .mount(&h.server)
            .await;
        mount_get_session(&h.server).await;

        let start = h.client.begin_authorization(None).unwrap();
        let authorized = h
            .client
            .complete_authorization("the-code", &start.state, &start.code_verifier, None, None)
            .await
            .unwrap();

        assert_eq!(authorized.user.did, "did:plc:flowtest");
        assert_eq!(authorized.user.handle, "flow.bsky.social");

        let material = h.store.get(&authorized.session_id).await.unwrap();
        assert_eq!(material.access_token, "access-1");
        assert_eq!(material.refresh_token, "refresh-1");
        assert!(material.access_expires_at <= material.refresh_expires_at);

        // User row exists
        let user = h.db.get_user_by_did("did:plc:flowtest").await.unwrap();
        assert!(user.is_some());
    }

    #[tokio::test]
    async fn test_callback_rejects_unknown_state() {
        let h = harness().await;

        let result = h
            .client
            .complete_authorization("code", "never-issued", "verifier", None, None)
            .await;
        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::StateInvalid))
        ));
    }

    #[tokio::test]
    async fn test_callback_rejects_verifier_mismatch() {
        let h = harness().await;
        let start = h.client.begin_authorization(None).unwrap();

        let result = h
            .client
            .complete_authorization("code", &start.state, "a-different-verifier", None, None)
            .await;
        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::VerifierMismatch))
        ));

        // State was consumed by the failed attempt
        let result = h
            .client
            .complete_authorization("code", &start.state, &start.code_verifier, None, None)
            .await;
        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::StateInvalid))
        ));
    }

    #[tokio::test]
    async fn test_token_exchange_retries_once_on_nonce_challenge() {
        let h = harness().await;

        // First call: challenge with a fresh nonce. Second call: accept.
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("DPoP-Nonce", "nonce-abc")
                    .set_body_json(serde_json::json!({"error": "use_dpop_nonce"})),
            )
            .up_to_n_times(1)
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-1", "refresh-1")),
            )
            .expect(1)
            .mount(&h.server)
            .await;
        mount_get_session(&h.server).await;

        let start = h.client.begin_authorization(None).unwrap();
        let authorized = h
            .client
            .complete_authorization("code", &start.state, &start.code_verifier, None, None)
            .await
            .unwrap();

        assert_eq!(authorized.user.did, "did:plc:flowtest");
    }

    #[tokio::test]
    async fn test_second_consecutive_nonce_challenge_is_hard_failure() {
        let h = harness().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("DPoP-Nonce", "nonce-spin")
                    .set_body_json(serde_json::json!({"error": "use_dpop_nonce"})),
            )
            .mount(&h.server)
            .await;

        let start = h.client.begin_authorization(None).unwrap();
        let result = h
            .client
            .complete_authorization("code", &start.state, &start.code_verifier, None, None)
            .await;

        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::NonceRetryExhausted))
        ));
    }

    async fn seed_expired_session(h: &Harness) -> String {
        let user = h
            .db
            .upsert_user("did:plc:refresh", "refresh.bsky.social", None)
            .await
            .unwrap();
        let key = DpopKey::generate();
        let now = chrono::Utc::now().timestamp();
        h.store
            .put(NewSession {
                user_id: &user.id,
                access_token: "stale-access",
                refresh_token: "live-refresh",
                dpop_private_jwk: &key.private_jwk(),
                dpop_public_jwk: &serde_json::to_string(&key.public_jwk()).unwrap(),
                dpop_key_id: &key.thumbprint(),
                access_expires_at: now - 10,
                refresh_expires_at: now + 100_000,
                user_agent: None,
                source_addr: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=live-refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-2", "refresh-2")),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        let material = h.client.refresh(&session_id, None).await.unwrap();
        assert_eq!(material.access_token, "access-2");
        assert_eq!(material.refresh_token, "refresh-2");

        // The rotation is durable
        let reloaded = h.store.get(&session_id).await.unwrap();
        assert_eq!(reloaded.access_token, "access-2");
    }

    #[tokio::test]
    async fn test_refresh_single_flight_under_contention() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_json("access-2", "refresh-2"))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        let client = Arc::new(h.client);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            let session_id = session_id.clone();
            handles.push(tokio::spawn(
                async move { client.refresh(&session_id, None).await },
            ));
        }

        for handle in handles {
            let material = handle.await.unwrap().unwrap();
            assert_eq!(material.access_token, "access-2");
        }
        // wiremock's expect(1) verifies exactly one outbound request on drop
    }

    #[tokio::test]
    async fn test_refresh_lock_entry_evicted_after_use() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-2", "refresh-2")),
            )
            .mount(&h.server)
            .await;

        h.client.refresh(&session_id, None).await.unwrap();
        assert!(h.client.refresh_locks.lock().await.is_empty());

        // Contention drains too: the last caller out evicts the entry
        let client = Arc::new(h.client);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            let session_id = session_id.clone();
            handles.push(tokio::spawn(async move {
                client.refresh(&session_id, None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(client.refresh_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant_revokes_session() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&h.server)
            .await;

        let result = h.client.refresh(&session_id, None).await;
        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::RefreshRejected(_)))
        ));

        // Session is gone for good
        let result = h.store.get(&session_id).await;
        assert!(matches!(
            result,
            Err(PlumageError::Auth(AuthError::SessionExpired(_)))
        ));

        let row = sqlx::query("SELECT revoke_reason FROM auth_sessions WHERE id = ?")
            .bind(&session_id)
            .fetch_one(h.db.pool())
            .await
            .unwrap();
        use sqlx::Row;
        assert_eq!(
            row.get::<String, _>("revoke_reason"),
            "refresh_rejected"
        );
    }

    #[tokio::test]
    async fn test_refresh_retries_transient_then_succeeds() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream sad"))
            .up_to_n_times(1)
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-2", "refresh-2")),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        let material = h.client.refresh(&session_id, None).await.unwrap();
        assert_eq!(material.access_token, "access-2");
    }

    #[tokio::test]
    async fn test_refresh_proof_carries_known_nonce() {
        let h = harness().await;
        let session_id = seed_expired_session(&h).await;

        // Pre-seed a nonce for this user and host, as a prior call would
        let material = h.store.get(&session_id).await.unwrap();
        let host = host_of(&h.server.uri());
        h.client.nonces.store(&material.user_id, &host, "seeded-nonce");

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_json("access-2", "refresh-2")),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        h.client.refresh(&session_id, None).await.unwrap();

        // Inspect the DPoP proof the mock saw
        let requests = h.server.received_requests().await.unwrap();
        let token_request: &Request = requests
            .iter()
            .find(|r| r.url.path() == "/oauth/token")
            .unwrap();
        let proof = token_request.headers.get("DPoP").unwrap().to_str().unwrap();
        let payload_b64 = proof.split('.').nth(1).unwrap();
        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64).unwrap()).unwrap();

        assert_eq!(payload["nonce"], "seeded-nonce");
        assert_eq!(payload["htm"], "POST");
        assert!(payload["htu"].as_str().unwrap().ends_with("/oauth/token"));
    }
}
