//! Per-post execution: claim, publish, record the outcome
//!
//! One call to [`PostingService::execute`] is one attempted
//! publication. The pending-to-executing transition is a compare-and-set
//! on the row, so two workers racing for the same post produce exactly
//! one network write. Threads are walked in order by a single worker;
//! the first terminal failure cancels everything after it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CreatedRecord, XrpcClient};
use crate::db::Database;
use crate::error::{PlumageError, Result};
use crate::types::{rkey_from_uri, PostStatus, ScheduledPost};

/// Reason stamped on thread members cancelled because an earlier
/// member failed.
pub const CANCEL_REASON_PARENT_FAILED: &str = "parent post failed";

/// The network's record collection for microblog posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Pointer to a published record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordRef {
    pub uri: String,
    pub cid: String,
}

/// Reply position of a record inside a thread.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub root: RecordRef,
    pub parent: RecordRef,
}

/// The record body handed to the publisher.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub langs: Vec<String>,
    pub reply: Option<ReplyRef>,
}

impl PostRecord {
    pub fn to_value(&self) -> serde_json::Value {
        let mut record = serde_json::json!({
            "$type": POST_COLLECTION,
            "text": self.text,
            "createdAt": self.created_at.to_rfc3339(),
            "langs": self.langs,
        });
        if let Some(reply) = &self.reply {
            record["reply"] = serde_json::to_value(reply).expect("reply ref serializes");
        }
        record
    }
}

/// Seam between post execution and the network. The production
/// implementation signs and sends over XRPC; tests swap in
/// [`MockPublisher`].
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(
        &self,
        user_id: &str,
        record: &PostRecord,
        cancel: &CancellationToken,
    ) -> Result<CreatedRecord>;
}

/// Publishes through the authenticated XRPC client into the owner's
/// repository.
pub struct NetworkPublisher {
    client: Arc<XrpcClient>,
    db: Database,
}

impl NetworkPublisher {
    pub fn new(client: Arc<XrpcClient>, db: Database) -> Self {
        Self { client, db }
    }
}

#[async_trait]
impl RecordPublisher for NetworkPublisher {
    async fn publish(
        &self,
        user_id: &str,
        record: &PostRecord,
        cancel: &CancellationToken,
    ) -> Result<CreatedRecord> {
        let user = self
            .db
            .get_user(user_id)
            .await?
            .ok_or_else(|| PlumageError::InvalidInput(format!("unknown user: {}", user_id)))?;

        self.client
            .create_record(user_id, &user.did, POST_COLLECTION, record.to_value(), cancel)
            .await
    }
}

/// What happened to one post in one execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Published; record identifiers persisted.
    Completed,
    /// Recoverable failure; back in the queue with a deferral.
    Rescheduled,
    /// Terminal failure; failure record written.
    Failed,
    /// Another worker holds the claim, or the post was cancelled.
    AlreadyClaimed,
    /// Shutdown arrived before the network write began.
    Cancelled,
}

/// Deferral before retry attempt `retry_count + 1`: 30 s, 2 min, 8 min.
pub fn retry_backoff_secs(retry_count: i64) -> i64 {
    30 * 4_i64.pow(retry_count.clamp(0, 8) as u32)
}

#[derive(Clone)]
pub struct PostingService {
    db: Database,
    publisher: Arc<dyn RecordPublisher>,
    max_retries: i64,
    langs: Vec<String>,
}

impl PostingService {
    pub fn new(
        db: Database,
        publisher: Arc<dyn RecordPublisher>,
        max_retries: u32,
        langs: Vec<String>,
    ) -> Self {
        Self {
            db,
            publisher,
            max_retries: max_retries as i64,
            langs,
        }
    }

    /// Execute one scheduled post (or, for thread members, the thread
    /// walk that contains it) on behalf of `acting_user_id`.
    ///
    /// Acting on another user's post is a hard error, never retried.
    pub async fn execute(
        &self,
        post: &ScheduledPost,
        acting_user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if post.user_id != acting_user_id {
            return Err(PlumageError::Forbidden(format!(
                "post {} does not belong to user {}",
                post.id, acting_user_id
            )));
        }

        // Creation already validated the body; re-check here so a row
        // edited behind the API can never reach the network
        if let Err(reason) = crate::types::validate_post_body(&post.body) {
            return self.fail_unpublishable(post, &reason).await;
        }

        if post.is_threaded() {
            self.execute_thread(post, cancel).await
        } else {
            let reply = match self.reply_for_parent(post).await {
                Ok(reply) => reply,
                Err(reason) => return self.fail_unpublishable(post, &reason).await,
            };
            self.execute_one(post, reply, cancel).await
        }
    }

    /// Claim and publish a single post.
    async fn execute_one(
        &self,
        post: &ScheduledPost,
        reply: Option<ReplyRef>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let now = chrono::Utc::now().timestamp();
        if !self.db.claim_post(&post.id, now).await? {
            debug!(post_id = %post.id, "Post already claimed, skipping");
            return Ok(ExecutionOutcome::AlreadyClaimed);
        }

        if cancel.is_cancelled() {
            self.db.unclaim_post(&post.id, now).await?;
            return Ok(ExecutionOutcome::Cancelled);
        }

        let record = PostRecord {
            text: post.body.clone(),
            created_at: chrono::Utc::now(),
            langs: self.langs.clone(),
            reply,
        };

        match self.publisher.publish(&post.user_id, &record, cancel).await {
            Ok(created) => {
                let rkey = rkey_from_uri(&created.uri).unwrap_or_default();
                let now = chrono::Utc::now().timestamp();
                self.db
                    .mark_completed(&post.id, &created.uri, rkey, &created.cid, now)
                    .await?;
                info!(post_id = %post.id, uri = %created.uri, "Published post");
                Ok(ExecutionOutcome::Completed)
            }
            Err(PlumageError::Cancelled) => {
                // Nothing went out; hand the claim back untouched
                let now = chrono::Utc::now().timestamp();
                self.db.unclaim_post(&post.id, now).await?;
                Ok(ExecutionOutcome::Cancelled)
            }
            Err(e) if e.is_retryable() && post.retry_count + 1 < self.max_retries => {
                let now = chrono::Utc::now().timestamp();
                let backoff = retry_backoff_secs(post.retry_count)
                    .max(e.retry_after_secs().unwrap_or(0) as i64);
                warn!(
                    post_id = %post.id,
                    attempt = post.retry_count + 1,
                    "Publish failed, rescheduling in {}s: {}", backoff, e
                );
                self.db
                    .mark_retry(&post.id, &e.to_string(), now + backoff, now)
                    .await?;
                Ok(ExecutionOutcome::Rescheduled)
            }
            Err(e) if e.is_retryable() => {
                let now = chrono::Utc::now().timestamp();
                warn!(post_id = %post.id, "Retry budget exhausted: {}", e);
                self.db
                    .mark_failed_budget_exhausted(&post.id, &e.to_string(), now)
                    .await?;
                Ok(ExecutionOutcome::Failed)
            }
            Err(e) => {
                let now = chrono::Utc::now().timestamp();
                warn!(post_id = %post.id, "Publish failed permanently: {}", e);
                self.db.mark_failed(&post.id, &e.to_string(), now).await?;
                Ok(ExecutionOutcome::Failed)
            }
        }
    }

    /// Walk a thread in `(thread_index, created_at)` order, starting
    /// wherever previous passes left off, chaining reply pointers from
    /// one published member to the next. A terminal failure cancels
    /// every later member; a recoverable failure pauses the walk until
    /// the failed member's deferral elapses.
    async fn execute_thread(
        &self,
        start: &ScheduledPost,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let root_id = start
            .thread_root_id
            .clone()
            .unwrap_or_else(|| start.id.clone());
        let members = self.db.thread_posts(&root_id).await?;

        let mut root_ref: Option<RecordRef> = None;
        let mut prev_ref: Option<RecordRef> = None;
        let mut start_outcome = ExecutionOutcome::AlreadyClaimed;
        let now = chrono::Utc::now().timestamp();

        for member in &members {
            if member.user_id != start.user_id {
                return Err(PlumageError::Forbidden(format!(
                    "thread {} contains posts from multiple users",
                    root_id
                )));
            }

            match member.status {
                PostStatus::Completed => {
                    if let (Some(uri), Some(cid)) = (&member.record_uri, &member.record_cid) {
                        let record_ref = RecordRef {
                            uri: uri.clone(),
                            cid: cid.clone(),
                        };
                        if root_ref.is_none() {
                            root_ref = Some(record_ref.clone());
                        }
                        prev_ref = Some(record_ref);
                    }
                    continue;
                }
                PostStatus::Cancelled => continue,
                PostStatus::Failed => {
                    // A dead member means everything after it is
                    // unpublishable
                    self.db
                        .cancel_thread_after(
                            &root_id,
                            member.thread_index,
                            CANCEL_REASON_PARENT_FAILED,
                            now,
                        )
                        .await?;
                    break;
                }
                PostStatus::Executing => break,
                PostStatus::Pending | PostStatus::Retrying => {
                    // A sibling still inside its retry deferral pauses
                    // the walk; order beats promptness within a thread
                    if member.id != start.id
                        && member.not_before.map(|nb| nb > now).unwrap_or(false)
                    {
                        break;
                    }
                }
            }

            let reply = match (&root_ref, &prev_ref) {
                (Some(root), Some(parent)) => Some(ReplyRef {
                    root: root.clone(),
                    parent: parent.clone(),
                }),
                _ => None,
            };

            let outcome = self.execute_one(member, reply, cancel).await?;
            if member.id == start.id {
                start_outcome = outcome;
            }

            match outcome {
                ExecutionOutcome::Completed => {
                    let published = self.db.get_post(&member.id).await?.ok_or_else(|| {
                        PlumageError::InvalidInput(format!("post {} vanished", member.id))
                    })?;
                    if let (Some(uri), Some(cid)) = (&published.record_uri, &published.record_cid)
                    {
                        let record_ref = RecordRef {
                            uri: uri.clone(),
                            cid: cid.clone(),
                        };
                        if root_ref.is_none() {
                            root_ref = Some(record_ref.clone());
                        }
                        prev_ref = Some(record_ref);
                    }
                }
                ExecutionOutcome::Failed => {
                    let cancelled = self
                        .db
                        .cancel_thread_after(
                            &root_id,
                            member.thread_index,
                            CANCEL_REASON_PARENT_FAILED,
                            now,
                        )
                        .await?;
                    if cancelled > 0 {
                        info!(
                            thread_root = %root_id,
                            cancelled, "Cancelled remaining thread members after failure"
                        );
                    }
                    break;
                }
                ExecutionOutcome::Rescheduled
                | ExecutionOutcome::Cancelled
                | ExecutionOutcome::AlreadyClaimed => break,
            }
        }

        Ok(start_outcome)
    }

    /// Build reply pointers for a standalone post that references a
    /// parent. A missing or unpublished parent makes the child
    /// unpublishable.
    async fn reply_for_parent(
        &self,
        post: &ScheduledPost,
    ) -> std::result::Result<Option<ReplyRef>, String> {
        let Some(parent_id) = &post.parent_post_id else {
            return Ok(None);
        };

        let parent = match self.db.get_post(parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => return Err(format!("parent post {} not found", parent_id)),
            Err(e) => return Err(format!("parent post {} unreadable: {}", parent_id, e)),
        };

        if parent.user_id != post.user_id {
            return Err(format!(
                "parent post {} belongs to a different user",
                parent_id
            ));
        }

        match (parent.status, &parent.record_uri, &parent.record_cid) {
            (PostStatus::Completed, Some(uri), Some(cid)) => {
                let parent_ref = RecordRef {
                    uri: uri.clone(),
                    cid: cid.clone(),
                };
                Ok(Some(ReplyRef {
                    root: parent_ref.clone(),
                    parent: parent_ref,
                }))
            }
            _ => Err(format!("parent post {} is not published", parent_id)),
        }
    }

    /// Claim the post purely to fail it: used when its inputs make
    /// publication impossible.
    async fn fail_unpublishable(
        &self,
        post: &ScheduledPost,
        reason: &str,
    ) -> Result<ExecutionOutcome> {
        let now = chrono::Utc::now().timestamp();
        if !self.db.claim_post(&post.id, now).await? {
            return Ok(ExecutionOutcome::AlreadyClaimed);
        }
        warn!(post_id = %post.id, "Post cannot be published: {}", reason);
        self.db.mark_failed(&post.id, reason, now).await?;
        Ok(ExecutionOutcome::Failed)
    }
}

// ----------------------------------------------------------------------
// Mock publisher
// ----------------------------------------------------------------------

/// Scripted publisher response, consumed in order.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Success,
    Transient(String),
    Permanent(String),
    RateLimited(u64),
    Cancelled,
}

/// In-memory publisher for tests and dry runs. Responses are consumed
/// front to back; once the script is empty every publish succeeds.
#[derive(Default)]
pub struct MockPublisher {
    script: std::sync::Mutex<std::collections::VecDeque<MockResponse>>,
    calls: std::sync::Mutex<Vec<(String, PostRecord)>>,
    counter: std::sync::atomic::AtomicU64,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, response: MockResponse) {
        self.script
            .lock()
            .expect("mock script lock poisoned")
            .push_back(response);
    }

    /// Every publish call observed so far, as (user id, record) pairs.
    pub fn calls(&self) -> Vec<(String, PostRecord)> {
        self.calls.lock().expect("mock calls lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock calls lock poisoned").len()
    }
}

#[async_trait]
impl RecordPublisher for MockPublisher {
    async fn publish(
        &self,
        user_id: &str,
        record: &PostRecord,
        _cancel: &CancellationToken,
    ) -> Result<CreatedRecord> {
        self.calls
            .lock()
            .expect("mock calls lock poisoned")
            .push((user_id.to_string(), record.clone()));

        let next = self
            .script
            .lock()
            .expect("mock script lock poisoned")
            .pop_front();

        match next.unwrap_or(MockResponse::Success) {
            MockResponse::Success => {
                let n = self
                    .counter
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(CreatedRecord {
                    uri: format!("at://did:plc:mock/{}/{}", POST_COLLECTION, 1000 + n),
                    cid: format!("bafymock{}", 1000 + n),
                })
            }
            MockResponse::Transient(msg) => {
                Err(crate::error::NetworkError::Transient(msg).into())
            }
            MockResponse::Permanent(body) => Err(crate::error::NetworkError::Permanent {
                status: 400,
                body,
            }
            .into()),
            MockResponse::RateLimited(retry_after_secs) => {
                Err(crate::error::NetworkError::RateLimited { retry_after_secs }.into())
            }
            MockResponse::Cancelled => Err(PlumageError::Cancelled),
        }
    }
}
