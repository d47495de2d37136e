//! Core domain types for Plumage

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum post body length, in Unicode code points.
pub const MAX_POST_CHARS: usize = 300;

/// A network account that has delegated posting authority to us.
///
/// Created on first successful authorization. The decentralized
/// identifier (`did`) is the stable identity; the handle can change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

/// A persisted authorization session: rotating OAuth tokens plus the
/// DPoP key pair bound to them. Token and private-key columns hold
/// ciphertext; only the token store sees plaintext.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: String,
    pub access_token_enc: String,
    pub refresh_token_enc: String,
    pub dpop_private_jwk_enc: String,
    pub dpop_public_jwk: String,
    pub dpop_key_id: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
    pub is_active: bool,
    pub last_used_at: i64,
    pub user_agent: Option<String>,
    pub source_addr: Option<String>,
    pub revoked_at: Option<i64>,
    pub revoke_reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Executing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Executing => "executing",
            PostStatus::Retrying => "retrying",
            PostStatus::Completed => "completed",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PostStatus::Pending),
            "executing" => Some(PostStatus::Executing),
            "retrying" => Some(PostStatus::Retrying),
            "completed" => Some(PostStatus::Completed),
            "failed" => Some(PostStatus::Failed),
            "cancelled" => Some(PostStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the post can legally move from this status to `next`.
    ///
    /// Completed, failed, and cancelled are terminal. The executing to
    /// pending edge exists for watchdog recovery of interrupted claims.
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Cancelled)
                | (Executing, Completed)
                | (Executing, Retrying)
                | (Executing, Pending)
                | (Executing, Failed)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Completed | PostStatus::Failed | PostStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A post waiting to be published at its scheduled time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub user_id: String,
    pub body: String,
    pub scheduled_at: i64,
    pub status: PostStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub executed_at: Option<i64>,
    pub error_msg: Option<String>,
    pub retry_count: i64,
    /// `at://` URI of the published record, set on completion
    pub record_uri: Option<String>,
    /// Trailing path segment of `record_uri`
    pub record_rkey: Option<String>,
    /// Content hash of the published record, needed for reply pointers
    pub record_cid: Option<String>,
    pub parent_post_id: Option<String>,
    pub thread_root_id: Option<String>,
    pub is_thread_root: bool,
    pub thread_index: i64,
    /// Earliest instant a retry may run; None means no deferral
    pub not_before: Option<i64>,
    pub can_execute: bool,
    pub is_deleted: bool,
}

impl ScheduledPost {
    pub fn new(user_id: String, body: String, scheduled_at: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            body,
            scheduled_at,
            status: PostStatus::Pending,
            created_at: now,
            updated_at: now,
            executed_at: None,
            error_msg: None,
            retry_count: 0,
            record_uri: None,
            record_rkey: None,
            record_cid: None,
            parent_post_id: None,
            thread_root_id: None,
            is_thread_root: false,
            thread_index: 0,
            not_before: None,
            can_execute: true,
            is_deleted: false,
        }
    }

    /// Whether the post belongs to a thread, either as root or member.
    pub fn is_threaded(&self) -> bool {
        self.is_thread_root || self.thread_root_id.is_some()
    }
}

/// Append-only record of a failed publication attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Option<i64>,
    pub post_id: String,
    pub error: String,
    pub created_at: i64,
}

/// Validate a post body against the network's length rules.
///
/// Length is counted in Unicode code points, matching how the network
/// itself counts. Returns the count on success.
pub fn validate_post_body(body: &str) -> Result<usize, String> {
    let count = body.chars().count();
    if count == 0 {
        return Err("Post body cannot be empty".to_string());
    }
    if count > MAX_POST_CHARS {
        return Err(format!(
            "Post body exceeds the {} character limit (current: {})",
            MAX_POST_CHARS, count
        ));
    }
    Ok(count)
}

/// Minimum lead time for user-submitted schedules, in seconds.
pub const MIN_SCHEDULE_LEAD_SECS: i64 = 5 * 60;

/// Validate a user-submitted schedule instant: it must be at least
/// five minutes out, so the creating request cannot race the scan.
pub fn validate_schedule_time(scheduled_at: i64, now: i64) -> Result<(), String> {
    if scheduled_at <= now + MIN_SCHEDULE_LEAD_SECS {
        return Err(format!(
            "Scheduled time must be at least {} minutes in the future",
            MIN_SCHEDULE_LEAD_SECS / 60
        ));
    }
    Ok(())
}

/// Extract the record key (trailing path segment) from an `at://` URI.
pub fn rkey_from_uri(uri: &str) -> Option<&str> {
    uri.trim_end_matches('/').rsplit('/').next().filter(|s| {
        !s.is_empty() && !s.contains(':')
    })
}
