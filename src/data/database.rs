//! SQLite database operations
//!
//! All database access goes through this module. The unique-identity
//! invariants the protocol relies on (duplicate create of the same URI
//! is a success-no-op) are enforced here with unique indexes and
//! `INSERT OR IGNORE`: every `insert_*_if_absent` returns whether a
//! row was actually written, and counter increments are gated on that.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sqlx::{Pool, Sqlite, SqlitePool};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
    /// Narrow per-poll locks guarding vote-tally read-increment-write.
    /// No other operation needs locking: everything else is
    /// create-if-absent or an idempotent update keyed by unique identity.
    poll_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self {
            pool,
            poll_locks: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert or update an actor keyed by URI.
    pub async fn upsert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (id, uri, username, domain, inbox_url, shared_inbox_url,
                                public_key_pem, private_key_pem, is_local, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                inbox_url = excluded.inbox_url,
                shared_inbox_url = excluded.shared_inbox_url,
                public_key_pem = excluded.public_key_pem,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.is_local)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert an actor only if the URI is not yet known.
    ///
    /// Returns true if a row was written.
    pub async fn insert_actor_if_absent(&self, actor: &Actor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO actors (id, uri, username, domain, inbox_url, shared_inbox_url,
                                          public_key_pem, private_key_pem, is_local, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.is_local)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    pub async fn find_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE username = ? AND is_local = 1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// Any local actor; the shared inbox routes to it when a request
    /// carries no username.
    pub async fn find_any_local_actor(&self) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE is_local = 1 ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Refresh the cached endpoints and key of a remote actor.
    pub async fn refresh_remote_actor(
        &self,
        uri: &str,
        inbox_url: &str,
        shared_inbox_url: Option<&str>,
        public_key_pem: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors
            SET inbox_url = ?, shared_inbox_url = ?, public_key_pem = ?, updated_at = ?
            WHERE uri = ? AND is_local = 0
            "#,
        )
        .bind(inbox_url)
        .bind(shared_inbox_url)
        .bind(public_key_pem)
        .bind(chrono::Utc::now())
        .bind(uri)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Record an activity if its URI has not been seen.
    ///
    /// Returns false for a replayed URI; the caller treats that as
    /// duplicate suppression, not an error.
    pub async fn insert_activity_if_absent(&self, activity: &Activity) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO activities
                (id, uri, kind, actor_uri, object_uri, target_uri, payload, published,
                 is_local, attempt_count, last_error, delivered, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.uri)
        .bind(&activity.kind)
        .bind(&activity.actor_uri)
        .bind(&activity.object_uri)
        .bind(&activity.target_uri)
        .bind(&activity.payload)
        .bind(activity.published)
        .bind(activity.is_local)
        .bind(activity.attempt_count)
        .bind(&activity.last_error)
        .bind(activity.delivered)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_activity_by_uri(&self, uri: &str) -> Result<Option<Activity>, AppError> {
        let activity = sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(activity)
    }

    pub async fn count_activities_of_kind(
        &self,
        kind: &str,
        is_local: bool,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activities WHERE kind = ? AND is_local = ?",
        )
        .bind(kind)
        .bind(is_local)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Increment the attempt counter for an issued network call.
    ///
    /// Never called for local validation failures.
    pub async fn record_delivery_attempt(
        &self,
        activity_uri: &str,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE activities SET attempt_count = attempt_count + 1, last_error = ? WHERE uri = ?",
        )
        .bind(error)
        .bind(activity_uri)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_activity_delivered(&self, activity_uri: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET delivered = 1, last_error = NULL WHERE uri = ?")
            .bind(activity_uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record the bookkeeping row for one issued send.
    pub async fn insert_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (id, activity_uri, inbox_url, attempt_number, outcome, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.activity_uri)
        .bind(&attempt.inbox_url)
        .bind(attempt.attempt_number)
        .bind(&attempt.outcome)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_delivery_attempts(
        &self,
        activity_uri: &str,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE activity_uri = ? ORDER BY attempt_number",
        )
        .bind(activity_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    /// Record a permanent delivery failure marker.
    pub async fn record_permanent_failure(
        &self,
        activity_uri: &str,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET delivered = 0, last_error = ? WHERE uri = ?")
            .bind(error)
            .bind(activity_uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Content objects
    // =========================================================================

    /// Persist an object if its URI is new.
    ///
    /// A tombstoned row keeps occupying the URI, so a replayed Create
    /// after a Delete is still rejected here.
    pub async fn insert_object_if_absent(&self, object: &ContentObject) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO objects
                (id, uri, actor_uri, visibility, content, in_reply_to_uri, quote_of_uri,
                 reply_count, like_count, announce_count, tombstoned, published, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&object.id)
        .bind(&object.uri)
        .bind(&object.actor_uri)
        .bind(&object.visibility)
        .bind(&object.content)
        .bind(&object.in_reply_to_uri)
        .bind(&object.quote_of_uri)
        .bind(object.reply_count)
        .bind(object.like_count)
        .bind(object.announce_count)
        .bind(object.tombstoned)
        .bind(object.published)
        .bind(object.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_object_by_uri(&self, uri: &str) -> Result<Option<ContentObject>, AppError> {
        let object = sqlx::query_as::<_, ContentObject>("SELECT * FROM objects WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(object)
    }

    /// Replace mutable fields on an existing object (inbound Update).
    pub async fn update_object_content(&self, uri: &str, content: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET content = ? WHERE uri = ? AND tombstoned = 0")
            .bind(content)
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Tombstone an object: the URI stays reserved, the content is gone.
    pub async fn tombstone_object(&self, uri: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET tombstoned = 1, content = '' WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_object_quote(&self, uri: &str, quote_of_uri: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET quote_of_uri = ? WHERE uri = ?")
            .bind(quote_of_uri)
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn increment_reply_count(&self, uri: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET reply_count = reply_count + 1 WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn adjust_like_count(&self, uri: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET like_count = MAX(0, like_count + ?) WHERE uri = ?")
            .bind(delta)
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn adjust_announce_count(&self, uri: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET announce_count = MAX(0, announce_count + ?) WHERE uri = ?")
            .bind(delta)
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Follow edges
    // =========================================================================

    /// Create a follow edge if none exists for the actor pair.
    pub async fn insert_follow_if_absent(&self, follow: &FollowEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO follows (id, source_uri, target_uri, activity_uri, accepted, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.source_uri)
        .bind(&follow.target_uri)
        .bind(&follow.activity_uri)
        .bind(follow.accepted)
        .bind(follow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_follow(
        &self,
        source_uri: &str,
        target_uri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let follow = sqlx::query_as::<_, FollowEdge>(
            "SELECT * FROM follows WHERE source_uri = ? AND target_uri = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(source_uri)
        .bind(target_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    pub async fn find_follow_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let follow = sqlx::query_as::<_, FollowEdge>("SELECT * FROM follows WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(follow)
    }

    /// Flip a follow edge to accepted.
    ///
    /// Accepting an already-accepted edge is a no-op, which is what
    /// makes re-delivered Accepts harmless.
    pub async fn accept_follow(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE follows SET accepted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_follow(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM follows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove any follow edges in both directions between two actors.
    pub async fn delete_follows_between(&self, a: &str, b: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM follows
            WHERE (source_uri = ?1 AND target_uri = ?2)
               OR (source_uri = ?2 AND target_uri = ?1)
            "#,
        )
        .bind(a)
        .bind(b)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove follow edges whose far side lives on the given domain.
    ///
    /// Used when a peer is marked unavailable after a 410.
    pub async fn delete_follows_for_domain(&self, domain: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM follows
            WHERE source_uri IN (SELECT uri FROM actors WHERE domain = ?1 AND is_local = 0)
               OR target_uri IN (SELECT uri FROM actors WHERE domain = ?1 AND is_local = 0)
            "#,
        )
        .bind(domain)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Block edges
    // =========================================================================

    pub async fn insert_block_if_absent(&self, block: &BlockEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO blocks (id, source_uri, target_uri, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&block.id)
        .bind(&block.source_uri)
        .bind(&block.target_uri)
        .bind(block.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Has `source` blocked `target`?
    pub async fn is_blocked(&self, source_uri: &str, target_uri: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM blocks WHERE source_uri = ? AND target_uri = ?",
        )
        .bind(source_uri)
        .bind(target_uri)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn delete_block(&self, source_uri: &str, target_uri: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM blocks WHERE source_uri = ? AND target_uri = ?")
            .bind(source_uri)
            .bind(target_uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_domain_block(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO domain_blocks (id, domain, created_at) VALUES (?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(domain)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM domain_blocks WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Like / Announce edges
    // =========================================================================

    pub async fn insert_like_if_absent(&self, like: &LikeEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO likes (id, actor_uri, object_uri, activity_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&like.id)
        .bind(&like.actor_uri)
        .bind(&like.object_uri)
        .bind(&like.activity_uri)
        .bind(like.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_like(
        &self,
        actor_uri: &str,
        object_uri: &str,
    ) -> Result<Option<LikeEdge>, AppError> {
        let like = sqlx::query_as::<_, LikeEdge>(
            "SELECT * FROM likes WHERE actor_uri = ? AND object_uri = ?",
        )
        .bind(actor_uri)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(like)
    }

    pub async fn find_like_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<LikeEdge>, AppError> {
        let like = sqlx::query_as::<_, LikeEdge>("SELECT * FROM likes WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(like)
    }

    pub async fn delete_like(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM likes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_announce_if_absent(
        &self,
        announce: &AnnounceEdge,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO announces (id, actor_uri, object_uri, activity_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&announce.id)
        .bind(&announce.actor_uri)
        .bind(&announce.object_uri)
        .bind(&announce.activity_uri)
        .bind(announce.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_announce(
        &self,
        actor_uri: &str,
        object_uri: &str,
    ) -> Result<Option<AnnounceEdge>, AppError> {
        let announce = sqlx::query_as::<_, AnnounceEdge>(
            "SELECT * FROM announces WHERE actor_uri = ? AND object_uri = ?",
        )
        .bind(actor_uri)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(announce)
    }

    pub async fn find_announce_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<AnnounceEdge>, AppError> {
        let announce =
            sqlx::query_as::<_, AnnounceEdge>("SELECT * FROM announces WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(announce)
    }

    pub async fn delete_announce(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM announces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Create sub-resources
    // =========================================================================

    pub async fn insert_mention_if_absent(
        &self,
        object_uri: &str,
        actor_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO mentions (id, object_uri, actor_uri, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(object_uri)
        .bind(actor_uri)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_attachment(&self, attachment: &Attachment) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO attachments (id, object_uri, url, media_type, description, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attachment.id)
        .bind(&attachment.object_uri)
        .bind(&attachment.url)
        .bind(&attachment.media_type)
        .bind(&attachment.description)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_attachments(&self, object_uri: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments WHERE object_uri = ?")
                .bind(object_uri)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn insert_emoji_if_absent(&self, emoji: &CustomEmoji) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO custom_emojis (id, shortcode, domain, image_url, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&emoji.id)
        .bind(&emoji.shortcode)
        .bind(&emoji.domain)
        .bind(&emoji.image_url)
        .bind(emoji.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Polls
    // =========================================================================

    pub async fn insert_poll_if_absent(&self, poll: &Poll) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO polls (id, object_uri, multiple, expires_at, expired, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.object_uri)
        .bind(poll.multiple)
        .bind(poll.expires_at)
        .bind(poll.expired)
        .bind(poll.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_poll_option(&self, option: &PollOption) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO poll_options (id, poll_id, position, title, votes_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&option.id)
        .bind(&option.poll_id)
        .bind(option.position)
        .bind(&option.title)
        .bind(option.votes_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_poll_by_object_uri(&self, object_uri: &str) -> Result<Option<Poll>, AppError> {
        let poll = sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE object_uri = ?")
            .bind(object_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(poll)
    }

    pub async fn find_poll_options(&self, poll_id: &str) -> Result<Vec<PollOption>, AppError> {
        let options = sqlx::query_as::<_, PollOption>(
            "SELECT * FROM poll_options WHERE poll_id = ? ORDER BY position",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(options)
    }

    /// Record a vote under the poll's tally lock.
    ///
    /// The lock is held only across the read-increment-write of one
    /// option so concurrent votes on the same poll cannot lose updates.
    pub async fn record_poll_vote(&self, poll_id: &str, position: i64) -> Result<(), AppError> {
        let lock = {
            let mut locks = self.poll_locks.lock().await;
            locks
                .entry(poll_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = lock.lock().await;

        let current = sqlx::query_scalar::<_, i64>(
            "SELECT votes_count FROM poll_options WHERE poll_id = ? AND position = ?",
        )
        .bind(poll_id)
        .bind(position)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Validation("Unknown poll option".to_string()))?;

        sqlx::query("UPDATE poll_options SET votes_count = ? WHERE poll_id = ? AND position = ?")
            .bind(current + 1)
            .bind(poll_id)
            .bind(position)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_poll_expired(&self, poll_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE polls SET expired = 1 WHERE id = ?")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, kind, origin_actor_uri, object_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.kind)
        .bind(&notification.origin_actor_uri)
        .bind(&notification.object_uri)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_notifications(&self, kind: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notifications WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Unavailable peers
    // =========================================================================

    /// Mark a domain dead. Returns true if this call created the record.
    pub async fn mark_peer_unavailable(
        &self,
        domain: &str,
        reason: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO unavailable_peers (id, domain, reason, marked_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(domain)
        .bind(reason)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_peer_unavailable(&self, domain: &str) -> Result<bool, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM unavailable_peers WHERE domain = ?")
                .bind(domain)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    pub async fn count_unavailable_peers(&self, domain: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM unavailable_peers WHERE domain = ?")
                .bind(domain)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn clear_unavailable_peer(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM unavailable_peers WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Relay subscriptions
    // =========================================================================

    pub async fn insert_relay_subscription(
        &self,
        subscription: &RelaySubscription,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO relay_subscriptions (id, inbox_url, activity_uri, accepted, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subscription.id)
        .bind(&subscription.inbox_url)
        .bind(&subscription.activity_uri)
        .bind(subscription.accepted)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_relay_subscription_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<RelaySubscription>, AppError> {
        let subscription = sqlx::query_as::<_, RelaySubscription>(
            "SELECT * FROM relay_subscriptions WHERE activity_uri = ?",
        )
        .bind(activity_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    pub async fn accept_relay_subscription(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE relay_subscriptions SET accepted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_relay_subscription(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM relay_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
