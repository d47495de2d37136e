//! Encrypted persistence for authorization sessions
//!
//! The token store is the only component that reads or writes
//! `auth_sessions` rows and the only place plaintext tokens exist
//! outside a request in flight. Rotation is a single transaction:
//! either every field of the new token set lands, or none do.

use tracing::{debug, warn};

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{AuthError, DbError, Result};
use crate::types::AuthSession;

use sqlx::Row;

/// Reason recorded when a session is closed because its stored
/// material could not be decrypted.
pub const REVOKE_CRYPTO_FAILURE: &str = "crypto_failure";

/// Decrypted session material handed to the auth and network layers.
/// Never persisted and never logged.
#[derive(Clone)]
pub struct SessionMaterial {
    pub session_id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_private_jwk: String,
    pub dpop_public_jwk: String,
    pub dpop_key_id: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

impl std::fmt::Debug for SessionMaterial {
    // Token material stays out of Debug output
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("dpop_key_id", &self.dpop_key_id)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

/// Plaintext inputs for a new session row.
pub struct NewSession<'a> {
    pub user_id: &'a str,
    pub access_token: &'a str,
    pub refresh_token: &'a str,
    pub dpop_private_jwk: &'a str,
    pub dpop_public_jwk: &'a str,
    pub dpop_key_id: &'a str,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
    pub user_agent: Option<&'a str>,
    pub source_addr: Option<&'a str>,
}

/// Replacement key material supplied when a refresh also rotated the
/// DPoP key pair.
pub struct KeyRotation<'a> {
    pub private_jwk: &'a str,
    pub public_jwk: &'a str,
    pub key_id: &'a str,
}

#[derive(Clone)]
pub struct TokenStore {
    db: Database,
    cipher: TokenCipher,
}

impl TokenStore {
    pub fn new(db: Database, cipher: TokenCipher) -> Self {
        Self { db, cipher }
    }

    /// Persist a freshly authorized session. Access token, refresh
    /// token, and private key are encrypted independently, each under
    /// its own IV. Returns the new session id.
    pub async fn put(&self, session: NewSession<'_>) -> Result<String> {
        if session.access_expires_at > session.refresh_expires_at {
            return Err(crate::error::PlumageError::InvalidInput(
                "access token expiry cannot exceed refresh token expiry".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let access_enc = self.cipher.encrypt(session.access_token)?;
        let refresh_enc = self.cipher.encrypt(session.refresh_token)?;
        let dpop_enc = self.cipher.encrypt(session.dpop_private_jwk)?;

        sqlx::query(
            r#"
            INSERT INTO auth_sessions (
                id, user_id, access_token_enc, refresh_token_enc,
                dpop_private_jwk_enc, dpop_public_jwk, dpop_key_id,
                access_expires_at, refresh_expires_at, is_active,
                last_used_at, user_agent, source_addr, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(session.user_id)
        .bind(&access_enc)
        .bind(&refresh_enc)
        .bind(&dpop_enc)
        .bind(session.dpop_public_jwk)
        .bind(session.dpop_key_id)
        .bind(session.access_expires_at)
        .bind(session.refresh_expires_at)
        .bind(now)
        .bind(session.user_agent)
        .bind(session.source_addr)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        debug!(session_id = %id, user_id = %session.user_id, "Stored new auth session");
        Ok(id)
    }

    /// Replace the token set (and optionally the DPoP key pair) in one
    /// transaction. Prior ciphertexts are overwritten; no history is
    /// kept.
    pub async fn rotate(
        &self,
        session_id: &str,
        new_access: &str,
        new_refresh: &str,
        access_expires_at: i64,
        refresh_expires_at: i64,
        key_rotation: Option<KeyRotation<'_>>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let access_enc = self.cipher.encrypt(new_access)?;
        let refresh_enc = self.cipher.encrypt(new_refresh)?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let affected = match &key_rotation {
            Some(rotation) => {
                let dpop_enc = self.cipher.encrypt(rotation.private_jwk)?;
                sqlx::query(
                    r#"
                    UPDATE auth_sessions
                    SET access_token_enc = ?, refresh_token_enc = ?,
                        dpop_private_jwk_enc = ?, dpop_public_jwk = ?, dpop_key_id = ?,
                        access_expires_at = ?, refresh_expires_at = ?, last_used_at = ?
                    WHERE id = ? AND is_active = 1
                    "#,
                )
                .bind(&access_enc)
                .bind(&refresh_enc)
                .bind(&dpop_enc)
                .bind(rotation.public_jwk)
                .bind(rotation.key_id)
                .bind(access_expires_at)
                .bind(refresh_expires_at)
                .bind(now)
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?
                .rows_affected()
            }
            None => sqlx::query(
                r#"
                UPDATE auth_sessions
                SET access_token_enc = ?, refresh_token_enc = ?,
                    access_expires_at = ?, refresh_expires_at = ?, last_used_at = ?
                WHERE id = ? AND is_active = 1
                "#,
            )
            .bind(&access_enc)
            .bind(&refresh_enc)
            .bind(access_expires_at)
            .bind(refresh_expires_at)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?
            .rows_affected(),
        };

        if affected == 0 {
            return Err(AuthError::SessionExpired(session_id.to_string()).into());
        }

        let detail = if key_rotation.is_some() {
            "tokens and dpop key rotated"
        } else {
            "tokens rotated"
        };
        sqlx::query(
            "INSERT INTO audit_log (session_id, event, detail, created_at) VALUES (?, 'token_rotation', ?, ?)",
        )
        .bind(session_id)
        .bind(detail)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        debug!(session_id = %session_id, "Rotated session tokens");
        Ok(())
    }

    /// Load and decrypt a session by id.
    pub async fn get(&self, session_id: &str) -> Result<SessionMaterial> {
        let row = sqlx::query("SELECT * FROM auth_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?
            .ok_or_else(|| AuthError::SessionExpired(session_id.to_string()))?;

        self.open_session(map_session_row(&row)).await
    }

    /// The most recently used active session for a user, decrypted.
    pub async fn get_most_recent_active(&self, user_id: &str) -> Result<SessionMaterial> {
        let row = sqlx::query(
            r#"
            SELECT * FROM auth_sessions
            WHERE user_id = ? AND is_active = 1
            ORDER BY last_used_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?
        .ok_or_else(|| AuthError::NoSession(user_id.to_string()))?;

        self.open_session(map_session_row(&row)).await
    }

    /// Mark a session inactive. Idempotent: revoking an already revoked
    /// session leaves it unchanged.
    pub async fn revoke(&self, session_id: &str, reason: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let affected = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET is_active = 0, revoked_at = ?, revoke_reason = ?
            WHERE id = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        if affected > 0 {
            sqlx::query(
                "INSERT INTO audit_log (session_id, event, detail, created_at) VALUES (?, 'session_revoked', ?, ?)",
            )
            .bind(session_id)
            .bind(reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        if affected > 0 {
            debug!(session_id = %session_id, reason = %reason, "Revoked session");
        }
        Ok(())
    }

    /// Deactivate every active session whose refresh token has expired.
    /// Returns the number of sessions closed.
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET is_active = 0, revoked_at = ?, revoke_reason = 'refresh_expired'
            WHERE is_active = 1 AND refresh_expires_at < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        if affected > 0 {
            debug!(count = affected, "Purged expired sessions");
        }
        Ok(affected)
    }

    /// Validate and decrypt a loaded session row.
    ///
    /// A decryption failure is terminal for the session: it is revoked
    /// on the spot and the caller sees an authentication error, never a
    /// retry.
    async fn open_session(&self, session: AuthSession) -> Result<SessionMaterial> {
        if !session.is_active {
            return Err(AuthError::SessionExpired(session.id.clone()).into());
        }
        let now = chrono::Utc::now().timestamp();
        if session.refresh_expires_at <= now {
            return Err(AuthError::SessionExpired(session.id.clone()).into());
        }

        let decrypted = self.decrypt_material(&session);
        match decrypted {
            Ok(material) => Ok(material),
            Err(e) => {
                warn!(session_id = %session.id, "Session material failed to decrypt, revoking");
                self.revoke(&session.id, REVOKE_CRYPTO_FAILURE).await?;
                Err(AuthError::CryptoFailure(e.to_string()).into())
            }
        }
    }

    fn decrypt_material(&self, session: &AuthSession) -> Result<SessionMaterial> {
        Ok(SessionMaterial {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            access_token: self.cipher.decrypt(&session.access_token_enc)?,
            refresh_token: self.cipher.decrypt(&session.refresh_token_enc)?,
            dpop_private_jwk: self.cipher.decrypt(&session.dpop_private_jwk_enc)?,
            dpop_public_jwk: session.dpop_public_jwk.clone(),
            dpop_key_id: session.dpop_key_id.clone(),
            access_expires_at: session.access_expires_at,
            refresh_expires_at: session.refresh_expires_at,
        })
    }
}

fn map_session_row(r: &sqlx::sqlite::SqliteRow) -> AuthSession {
    AuthSession {
        id: r.get("id"),
        user_id: r.get("user_id"),
        access_token_enc: r.get("access_token_enc"),
        refresh_token_enc: r.get("refresh_token_enc"),
        dpop_private_jwk_enc: r.get("dpop_private_jwk_enc"),
        dpop_public_jwk: r.get("dpop_public_jwk"),
        dpop_key_id: r.get("dpop_key_id"),
        access_expires_at: r.get("access_expires_at"),
        refresh_expires_at: r.get("refresh_expires_at"),
        is_active: r.get("is_active"),
        last_used_at: r.get("last_used_at"),
        user_agent: r.get("user_agent"),
        source_addr: r.get("source_addr"),
        revoked_at: r.get("revoked_at"),
        revoke_reason: r.get("revoke_reason"),
        created_at: r.get("created_at"),
    }
}
