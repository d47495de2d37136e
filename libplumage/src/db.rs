//! Database operations for Plumage
//!
//! One `Database` handle wraps the SQLite pool and owns every query the
//! engine issues. Session rows are written only through the token store;
//! post rows only through the posting service and dispatcher.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::types::{FailureRecord, PostStatus, ScheduledPost, User};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the database at `url` and run
    /// pending migrations.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true);

        // create_if_missing handles the file, not its directory
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert or update a user by decentralized identifier.
    ///
    /// The DID is the stable identity; handle and display name follow
    /// whatever the network currently reports.
    pub async fn upsert_user(
        &self,
        did: &str,
        handle: &str,
        display_name: Option<&str>,
    ) -> Result<User> {
        let now = chrono::Utc::now().timestamp();
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO users (id, did, handle, display_name, is_active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            ON CONFLICT(did)
            DO UPDATE SET handle = excluded.handle,
                          display_name = excluded.display_name,
                          is_active = 1
            "#,
        )
        .bind(&id)
        .bind(did)
        .bind(handle)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.get_user_by_did(did).await?.ok_or_else(|| {
            DbError::SqlxError(sqlx::Error::RowNotFound).into()
        })
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| map_user_row(&r)))
    }

    pub async fn get_user_by_did(&self, did: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| map_user_row(&r)))
    }

    // ------------------------------------------------------------------
    // Scheduled posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &ScheduledPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_posts (
                id, user_id, body, scheduled_at, status, created_at, updated_at,
                executed_at, error_msg, retry_count, record_uri, record_rkey,
                record_cid, parent_post_id, thread_root_id, is_thread_root,
                thread_index, not_before, can_execute, is_deleted
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.body)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .bind(post.updated_at)
        .bind(post.executed_at)
        .bind(&post.error_msg)
        .bind(post.retry_count)
        .bind(&post.record_uri)
        .bind(&post.record_rkey)
        .bind(&post.record_cid)
        .bind(&post.parent_post_id)
        .bind(&post.thread_root_id)
        .bind(post.is_thread_root)
        .bind(post.thread_index)
        .bind(post.not_before)
        .bind(post.can_execute)
        .bind(post.is_deleted)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query("SELECT * FROM scheduled_posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| map_post_row(&r)))
    }

    /// Posts eligible for execution: pending, due, past any retry
    /// deferral, directly executable, not deleted, and owned by an
    /// active user. Oldest scheduled first.
    pub async fn due_posts(&self, now: i64, limit: u32) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM scheduled_posts p
            JOIN users u ON u.id = p.user_id
            WHERE p.status = 'pending'
              AND p.scheduled_at <= ?
              AND (p.not_before IS NULL OR p.not_before <= ?)
              AND p.can_execute = 1
              AND p.is_deleted = 0
              AND u.is_active = 1
            ORDER BY p.scheduled_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(map_post_row).collect())
    }

    /// Atomically claim a pending post for execution.
    ///
    /// Returns false when the row was already claimed, cancelled, or
    /// deleted. Callers that lose this race must skip the post.
    pub async fn claim_post(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'executing', updated_at = ?
            WHERE id = ? AND status = 'pending' AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a claimed post to the queue without consuming retry
    /// budget. Used when execution is cancelled before any network
    /// effect.
    pub async fn unclaim_post(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'pending', updated_at = ?
            WHERE id = ? AND status = 'executing'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(
        &self,
        post_id: &str,
        uri: &str,
        rkey: &str,
        cid: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'completed', executed_at = ?, updated_at = ?,
                record_uri = ?, record_rkey = ?, record_cid = ?, error_msg = NULL
            WHERE id = ? AND status = 'executing'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(uri)
        .bind(rkey)
        .bind(cid)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Record a recoverable failure: back to pending with the retry
    /// counter advanced and a deferral window.
    pub async fn mark_retry(
        &self,
        post_id: &str,
        error: &str,
        not_before: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'pending', retry_count = retry_count + 1,
                error_msg = ?, not_before = ?, updated_at = ?, can_execute = 1
            WHERE id = ? AND status = 'executing'
            "#,
        )
        .bind(error)
        .bind(not_before)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Terminal failure. The status change and the failure record land
    /// in one transaction.
    pub async fn mark_failed(&self, post_id: &str, error: &str, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'failed', error_msg = ?, updated_at = ?
            WHERE id = ? AND status = 'executing'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            "INSERT INTO failure_records (post_id, error, created_at) VALUES (?, ?, ?)",
        )
        .bind(post_id)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Terminal failure on the attempt that exhausted the retry
    /// budget: the final attempt still counts.
    pub async fn mark_failed_budget_exhausted(
        &self,
        post_id: &str,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'failed', retry_count = retry_count + 1,
                error_msg = ?, updated_at = ?
            WHERE id = ? AND status = 'executing'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            "INSERT INTO failure_records (post_id, error, created_at) VALUES (?, ?, ?)",
        )
        .bind(post_id)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Cancel a post. Only pending posts can be cancelled.
    pub async fn cancel_post(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel every not-yet-published member of a thread after the
    /// given index. Completed members are untouched.
    pub async fn cancel_thread_after(
        &self,
        thread_root_id: &str,
        after_index: i64,
        reason: &str,
        now: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'cancelled', error_msg = ?, updated_at = ?
            WHERE thread_root_id = ? AND thread_index > ?
              AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(thread_root_id)
        .bind(after_index)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// All members of a thread in publication order. The root row is
    /// included whether or not it references itself.
    pub async fn thread_posts(&self, thread_root_id: &str) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduled_posts
            WHERE (thread_root_id = ? OR id = ?) AND is_deleted = 0
            ORDER BY thread_index ASC, created_at ASC
            "#,
        )
        .bind(thread_root_id)
        .bind(thread_root_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(map_post_row).collect())
    }

    /// Revert posts stuck in `executing` since before `cutoff` back to
    /// pending, retry budget untouched. Recovers claims orphaned by a
    /// crash or kill.
    pub async fn revert_stale_executing(&self, cutoff: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'pending', updated_at = ?
            WHERE status = 'executing' AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn archive_completed_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts SET is_deleted = 1
            WHERE status = 'completed' AND executed_at < ? AND is_deleted = 0
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn archive_failed_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts SET is_deleted = 1
            WHERE status = 'failed' AND updated_at < ? AND is_deleted = 0
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Failure records and audit log
    // ------------------------------------------------------------------

    pub async fn record_failure(&self, post_id: &str, error: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO failure_records (post_id, error, created_at) VALUES (?, ?, ?)",
        )
        .bind(post_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn failure_records_for(&self, post_id: &str) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query(
            "SELECT id, post_id, error, created_at FROM failure_records WHERE post_id = ? ORDER BY created_at ASC",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| FailureRecord {
                id: Some(r.get("id")),
                post_id: r.get("post_id"),
                error: r.get("error"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn purge_failure_records_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM failure_records WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn append_audit(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
        event: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (user_id, session_id, event, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(event)
        .bind(detail)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn map_user_row(r: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: r.get("id"),
        did: r.get("did"),
        handle: r.get("handle"),
        display_name: r.get("display_name"),
        is_active: r.get("is_active"),
        created_at: r.get("created_at"),
    }
}

fn map_post_row(r: &sqlx::sqlite::SqliteRow) -> ScheduledPost {
    ScheduledPost {
        id: r.get("id"),
        user_id: r.get("user_id"),
        body: r.get("body"),
        scheduled_at: r.get("scheduled_at"),
        status: PostStatus::parse(r.get::<String, _>("status").as_str())
            .unwrap_or(PostStatus::Pending),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        executed_at: r.get("executed_at"),
        error_msg: r.get("error_msg"),
        retry_count: r.get("retry_count"),
        record_uri: r.get("record_uri"),
        record_rkey: r.get("record_rkey"),
        record_cid: r.get("record_cid"),
        parent_post_id: r.get("parent_post_id"),
        thread_root_id: r.get("thread_root_id"),
        is_thread_root: r.get("is_thread_root"),
        thread_index: r.get("thread_index"),
        not_before: r.get("not_before"),
        can_execute: r.get("can_execute"),
        is_deleted: r.get("is_deleted"),
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> (tempfile::TempDir, Database) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&format!("sqlite:{}", db_path.to_string_lossy()))
        .await
        .unwrap();
    (temp_dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_user(db: &Database) -> User {
        db.upsert_user("did:plc:tester", "tester.bsky.social", None)
            .await
            .unwrap()
    }

    fn pending_post(user_id: &str, scheduled_at: i64) -> ScheduledPost {
        ScheduledPost::new(user_id.to_string(), "hello".to_string(), scheduled_at)
    }

    #[tokio::test]
    async fn test_upsert_user_is_idempotent_on_did() {
        let (_tmp, db) = test_db().await;

        let first = db
            .upsert_user("did:plc:abc", "old.bsky.social", None)
            .await
            .unwrap();
        let second = db
            .upsert_user("did:plc:abc", "new.bsky.social", Some("New Name"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.handle, "new.bsky.social");
        assert_eq!(second.display_name, Some("New Name".to_string()));
    }

    #[tokio::test]
    async fn test_post_round_trip() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.body, "hello");
        assert_eq!(loaded.status, PostStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();

        assert!(db.claim_post(&post.id, 200).await.unwrap());
        // Second claim loses the race
        assert!(!db.claim_post(&post.id, 201).await.unwrap());

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Executing);
    }

    #[tokio::test]
    async fn test_claim_rejects_cancelled_post() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        assert!(db.cancel_post(&post.id, 150).await.unwrap());

        assert!(!db.claim_post(&post.id, 200).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_posts_filters_and_orders() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let mut early = pending_post(&user.id, 100);
        early.id = "early".to_string();
        let mut late = pending_post(&user.id, 200);
        late.id = "late".to_string();
        let mut future = pending_post(&user.id, 9_999);
        future.id = "future".to_string();
        let mut deferred = pending_post(&user.id, 100);
        deferred.id = "deferred".to_string();
        deferred.not_before = Some(5_000);
        let mut held = pending_post(&user.id, 100);
        held.id = "held".to_string();
        held.can_execute = false;

        for p in [&early, &late, &future, &deferred, &held] {
            db.create_post(p).await.unwrap();
        }

        let due = db.due_posts(300, 100).await.unwrap();
        let ids: Vec<_> = due.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_mark_completed_sets_record_fields() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 200).await.unwrap();
        db.mark_completed(
            &post.id,
            "at://did:plc:tester/app.bsky.feed.post/3k1",
            "3k1",
            "bafycid",
            250,
        )
        .await
        .unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Completed);
        assert_eq!(loaded.executed_at, Some(250));
        assert_eq!(
            loaded.record_uri.as_deref(),
            Some("at://did:plc:tester/app.bsky.feed.post/3k1")
        );
        assert_eq!(loaded.record_rkey.as_deref(), Some("3k1"));
    }

    #[tokio::test]
    async fn test_mark_retry_increments_and_defers() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 200).await.unwrap();
        db.mark_retry(&post.id, "503 from host", 260, 200).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.not_before, Some(260));
        assert_eq!(loaded.error_msg.as_deref(), Some("503 from host"));

        // Deferred posts do not come back before their window
        assert!(db.due_posts(210, 100).await.unwrap().is_empty());
        assert_eq!(db.due_posts(300, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_writes_failure_record() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 200).await.unwrap();
        db.mark_failed(&post.id, "400 InvalidRequest", 250).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);

        let failures = db.failure_records_for(&post.id).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, "400 InvalidRequest");
    }

    #[tokio::test]
    async fn test_cancel_thread_after_spares_completed() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let root_id = "thread-root".to_string();
        for (idx, id) in ["thread-root", "child-1", "child-2"].iter().enumerate() {
            let mut p = pending_post(&user.id, 100);
            p.id = id.to_string();
            p.thread_root_id = Some(root_id.clone());
            p.is_thread_root = idx == 0;
            p.thread_index = idx as i64;
            p.can_execute = idx == 0;
            db.create_post(&p).await.unwrap();
        }

        // Root published, child-1 failed, child-2 gets cancelled
        let cancelled = db
            .cancel_thread_after(&root_id, 1, "parent post failed", 300)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let child2 = db.get_post("child-2").await.unwrap().unwrap();
        assert_eq!(child2.status, PostStatus::Cancelled);
        let root = db.get_post("thread-root").await.unwrap().unwrap();
        assert_eq!(root.status, PostStatus::Pending);
    }

    #[tokio::test]
    async fn test_revert_stale_executing() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 200).await.unwrap();

        // Nothing newer than the cutoff is touched
        assert_eq!(db.revert_stale_executing(200, 900).await.unwrap(), 0);
        // The stale claim is reclaimed once it ages past the cutoff
        assert_eq!(db.revert_stale_executing(500, 900).await.unwrap(), 1);

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
    }

    #[tokio::test]
    async fn test_archival_is_logical_delete() {
        let (_tmp, db) = test_db().await;
        let user = seed_user(&db).await;

        let post = pending_post(&user.id, 100);
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 200).await.unwrap();
        db.mark_completed(&post.id, "at://x/app.bsky.feed.post/1", "1", "cid", 250)
            .await
            .unwrap();

        assert_eq!(db.archive_completed_before(300).await.unwrap(), 1);

        // Row survives, flagged deleted
        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert!(loaded.is_deleted);
    }

    #[tokio::test]
    async fn test_purge_failure_records() {
        let (_tmp, db) = test_db().await;
        db.record_failure("p1", "boom", 100).await.unwrap();
        db.record_failure("p1", "boom again", 500).await.unwrap();

        assert_eq!(db.purge_failure_records_before(200).await.unwrap(), 1);
        assert_eq!(db.failure_records_for("p1").await.unwrap().len(), 1);
    }
}
