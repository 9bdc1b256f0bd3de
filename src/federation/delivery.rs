//! Outbound activity delivery
//!
//! Serializes an activity, signs the request, POSTs it to remote
//! inboxes, classifies the response, and drives retry/backoff or
//! permanent-failure bookkeeping. Deliveries to distinct inboxes run
//! in parallel under a concurrency cap; the retry sequence for one
//! inbox is strictly sequential so a retried stale activity can never
//! overtake its successor at the same peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::data::Database;
use crate::error::AppError;
use crate::jobs::{Job, JobSender};
use crate::metrics::DELIVERY_ATTEMPTS_TOTAL;

use super::ACTIVITY_CONTENT_TYPE;
use super::resolver::{RemoteActorResolver, url_domain};
use super::signature::sign_post_request;

/// Classification of one send attempt.
///
/// `PermanentFailure` here means the attempt failed before any network
/// call was issued (serialization or signing); the attempt counter is
/// not incremented for it. The retry/backoff loop is the caller's
/// concern, driven by `RetryAfter`.
#[derive(Debug)]
pub enum SendOutcome {
    Delivered,
    RetryAfter(Duration),
    Gone,
    PermanentFailure(String),
}

/// Final per-inbox result of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Peer answered 410; domain recorded as unavailable
    Unavailable,
    PermanentFailure,
}

/// One delivery destination.
///
/// `actor_uri` enables the one-time actor refresh after a 404-class
/// failure; shared inboxes have no single owning actor and skip it.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub inbox_url: String,
    pub actor_uri: Option<String>,
}

impl DeliveryTarget {
    pub fn inbox(inbox_url: impl Into<String>) -> Self {
        Self {
            inbox_url: inbox_url.into(),
            actor_uri: None,
        }
    }

    pub fn actor_inbox(inbox_url: impl Into<String>, actor_uri: impl Into<String>) -> Self {
        Self {
            inbox_url: inbox_url.into(),
            actor_uri: Some(actor_uri.into()),
        }
    }
}

/// Delivery engine tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Ceiling on attempts per inbox
    pub max_attempts: u32,
    /// Attempt n backs off n^2 of these units (a minute in production)
    pub backoff_unit: Duration,
    /// Concurrent inboxes per activity
    pub max_concurrent: usize,
}

/// Backoff before the attempt after `attempt`: attempt-squared units.
fn backoff_for_attempt(attempt: u32, unit: Duration) -> Duration {
    unit * attempt.saturating_mul(attempt)
}

fn observe_send(started: std::time::Instant, outcome: &str) {
    crate::metrics::DELIVERY_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());
}

/// Activity delivery engine
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    resolver: Arc<RemoteActorResolver>,
    jobs: JobSender,
    /// Key ID for signatures
    key_id: String,
    /// Private key for signing
    private_key_pem: String,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        resolver: Arc<RemoteActorResolver>,
        jobs: JobSender,
        key_id: String,
        private_key_pem: String,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            db,
            http_client,
            resolver,
            jobs,
            key_id,
            private_key_pem,
            config,
        }
    }

    /// Deliver a stored activity to a set of inboxes.
    ///
    /// Inboxes on domains already marked unavailable are skipped
    /// outright. Per-inbox results are returned in completion order;
    /// the activity is marked delivered when every remaining target
    /// succeeded.
    pub async fn deliver(
        &self,
        activity_uri: &str,
        targets: Vec<DeliveryTarget>,
    ) -> Result<Vec<(String, DeliveryOutcome)>, AppError> {
        let activity = self
            .db
            .find_activity_by_uri(activity_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut live_targets = Vec::new();
        for target in targets {
            let dead = match url_domain(&target.inbox_url) {
                Some(domain) => self.db.is_peer_unavailable(&domain).await?,
                None => false,
            };
            if dead {
                tracing::info!(
                    inbox = %target.inbox_url,
                    activity = %activity_uri,
                    "Skipping delivery to unavailable peer"
                );
            } else {
                live_targets.push(target);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let payload: Arc<[u8]> = Arc::from(activity.payload.clone().into_bytes());

        let mut tasks = Vec::new();
        for target in live_targets {
            let semaphore = semaphore.clone();
            let payload = payload.clone();
            let engine = self.clone();
            let activity = activity.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let outcome = engine.deliver_to_inbox(&activity, &target, &payload).await;
                (target.inbox_url, outcome)
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            if let Ok(result) = task.await {
                results.push(result);
            }
        }

        let delivered = results
            .iter()
            .filter(|(_, outcome)| *outcome == DeliveryOutcome::Delivered)
            .count();
        if !results.is_empty() && delivered == results.len() {
            self.db.mark_activity_delivered(activity_uri).await?;
        }

        tracing::info!(
            activity = %activity_uri,
            delivered,
            failed = results.len() - delivered,
            "Delivery batch complete"
        );

        Ok(results)
    }

    /// Drive the sequential retry loop for one inbox.
    async fn deliver_to_inbox(
        &self,
        activity: &crate::data::Activity,
        target: &DeliveryTarget,
        payload: &[u8],
    ) -> DeliveryOutcome {
        let mut inbox_url = target.inbox_url.clone();
        let mut refreshed_actor = false;
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            let outcome = self.send_once(&inbox_url, payload, attempt).await;

            match outcome {
                SendOutcome::Delivered => {
                    self.record_attempt(&activity.uri, &inbox_url, attempt, "delivered", None)
                        .await;
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["delivered"]).inc();
                    tracing::info!(inbox = %inbox_url, activity = %activity.uri, "Delivered");
                    return DeliveryOutcome::Delivered;
                }
                SendOutcome::Gone => {
                    self.record_attempt(&activity.uri, &inbox_url, attempt, "gone", Some("HTTP 410"))
                        .await;
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["gone"]).inc();
                    self.handle_gone_peer(&inbox_url).await;
                    return DeliveryOutcome::Unavailable;
                }
                SendOutcome::RetryAfter(backoff) => {
                    last_error = format!("delivery to {} failed", inbox_url);
                    self.record_attempt(
                        &activity.uri,
                        &inbox_url,
                        attempt,
                        "retry",
                        Some(last_error.as_str()),
                    )
                    .await;
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["retry"]).inc();

                    if attempt == self.config.max_attempts {
                        break;
                    }

                    // Stale cached actor data commonly shows up as 404;
                    // refresh once before the first retry, not on every
                    // retry, to avoid piling onto a struggling peer.
                    if !refreshed_actor {
                        refreshed_actor = true;
                        if let Some(new_inbox) = self.try_refresh_actor(target).await {
                            inbox_url = new_inbox;
                        }
                    }

                    tracing::debug!(
                        inbox = %inbox_url,
                        activity = %activity.uri,
                        attempt,
                        backoff_secs = backoff.as_secs_f64(),
                        "Delivery failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                SendOutcome::PermanentFailure(error) => {
                    // Local validation failure: no network call was
                    // issued, so the attempt counter stays put.
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["permanent"]).inc();
                    self.record_permanent_failure(activity, &error).await;
                    return DeliveryOutcome::PermanentFailure;
                }
            }
        }

        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["permanent"]).inc();
        self.record_permanent_failure(activity, &last_error).await;
        DeliveryOutcome::PermanentFailure
    }

    /// Issue exactly one signed POST and classify the response.
    async fn send_once(&self, inbox_url: &str, payload: &[u8], attempt: u32) -> SendOutcome {
        let started = std::time::Instant::now();
        let headers = match sign_post_request(
            inbox_url,
            payload,
            ACTIVITY_CONTENT_TYPE,
            &self.private_key_pem,
            &self.key_id,
        ) {
            Ok(headers) => headers,
            Err(error) => return SendOutcome::PermanentFailure(error.to_string()),
        };

        let mut request = self
            .http_client
            .post(inbox_url)
            .timeout(self.config.timeout)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }

        let backoff = backoff_for_attempt(attempt, self.config.backoff_unit);

        let response = match request.body(payload.to_vec()).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(inbox = %inbox_url, %error, "Delivery request failed");
                observe_send(started, "error");
                return SendOutcome::RetryAfter(backoff);
            }
        };

        let status = response.status();
        if status.is_success() {
            observe_send(started, "success");
            SendOutcome::Delivered
        } else if status.as_u16() == 410 {
            observe_send(started, "gone");
            SendOutcome::Gone
        } else {
            tracing::warn!(inbox = %inbox_url, %status, "Inbox rejected delivery");
            observe_send(started, "rejected");
            SendOutcome::RetryAfter(backoff)
        }
    }

    /// Bookkeeping for one issued network call: increments the
    /// activity's attempt counter and writes the per-send record.
    async fn record_attempt(
        &self,
        activity_uri: &str,
        inbox_url: &str,
        attempt: u32,
        outcome: &str,
        error: Option<&str>,
    ) {
        if let Err(db_error) = self.db.record_delivery_attempt(activity_uri, error).await {
            tracing::error!(error = %db_error, "Failed to record delivery attempt");
        }
        if let Err(db_error) = self
            .db
            .insert_delivery_attempt(&crate::data::DeliveryAttempt {
                id: crate::data::EntityId::new().0,
                activity_uri: activity_uri.to_string(),
                inbox_url: inbox_url.to_string(),
                attempt_number: attempt as i64,
                outcome: outcome.to_string(),
                created_at: chrono::Utc::now(),
            })
            .await
        {
            tracing::error!(error = %db_error, "Failed to record delivery attempt row");
        }
    }

    /// Record the target domain as dead and schedule relationship
    /// cleanup. Exactly one unavailable-peer record per domain; the
    /// cleanup job is only scheduled by the call that created it.
    async fn handle_gone_peer(&self, inbox_url: &str) {
        let Some(domain) = url_domain(inbox_url) else {
            return;
        };

        match self.db.mark_peer_unavailable(&domain, "HTTP 410").await {
            Ok(true) => {
                tracing::warn!(domain, "Peer marked unavailable after 410");
                self.jobs.enqueue(Job::CleanupPeer {
                    domain: domain.clone(),
                });
            }
            Ok(false) => {}
            Err(error) => {
                tracing::error!(%error, domain, "Failed to record unavailable peer");
            }
        }
    }

    /// Permanent-failure bookkeeping, plus the cascade for activity
    /// types whose failed delivery invalidates local state: an
    /// outbound Follow that can never be confirmed must not leave a
    /// pending edge stuck forever.
    async fn record_permanent_failure(&self, activity: &crate::data::Activity, error: &str) {
        if let Err(db_error) = self.db.record_permanent_failure(&activity.uri, error).await {
            tracing::error!(error = %db_error, "Failed to record permanent delivery failure");
        }

        if activity.kind == "Follow" && activity.is_local {
            self.discard_unconfirmed_follow(&activity.uri).await;
        }
    }

    async fn discard_unconfirmed_follow(&self, activity_uri: &str) {
        match self.db.find_follow_by_activity_uri(activity_uri).await {
            Ok(Some(edge)) if !edge.accepted => {
                if let Err(error) = self.db.delete_follow(&edge.id).await {
                    tracing::error!(%error, "Failed to discard unconfirmed follow edge");
                } else {
                    tracing::info!(
                        activity = %activity_uri,
                        target = %edge.target_uri,
                        "Discarded pending follow after permanent delivery failure"
                    );
                }
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(%error, "Failed to look up follow edge for failed delivery");
            }
        }
    }

    async fn try_refresh_actor(&self, target: &DeliveryTarget) -> Option<String> {
        let actor_uri = target.actor_uri.as_deref()?;

        match self.resolver.refresh_actor(actor_uri).await {
            Ok(actor) => {
                if let Err(error) = self
                    .db
                    .refresh_remote_actor(
                        actor_uri,
                        &actor.inbox_url,
                        actor.shared_inbox_url.as_deref(),
                        &actor.public_key_pem,
                    )
                    .await
                {
                    tracing::error!(%error, actor_uri, "Failed to persist refreshed actor");
                }
                tracing::debug!(actor_uri, inbox = %actor.inbox_url, "Refreshed remote actor");
                Some(actor.inbox_url)
            }
            Err(error) => {
                tracing::debug!(%error, actor_uri, "Actor refresh failed");
                None
            }
        }
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity wrapping the accepted object
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity wrapping the rejected object
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity wrapping the undone activity
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Announce activity
    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc
        })
    }

    /// Build a Create activity wrapping an object
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Delete activity with a Tombstone object
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": to,
            "cc": cc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_attempt_squared() {
        let unit = Duration::from_secs(60);
        assert_eq!(backoff_for_attempt(1, unit), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(2, unit), Duration::from_secs(240));
        assert_eq!(backoff_for_attempt(3, unit), Duration::from_secs(540));
    }

    #[test]
    fn delivery_target_constructors_set_fields() {
        let plain = DeliveryTarget::inbox("https://remote.example/inbox");
        assert!(plain.actor_uri.is_none());

        let with_actor = DeliveryTarget::actor_inbox(
            "https://remote.example/users/alice/inbox",
            "https://remote.example/users/alice",
        );
        assert_eq!(
            with_actor.actor_uri.as_deref(),
            Some("https://remote.example/users/alice")
        );
    }

    #[test]
    fn builder_delete_wraps_tombstone() {
        let activity = builder::delete(
            "https://local.example/delete/1",
            "https://local.example/users/self",
            "https://local.example/notes/1",
            vec![],
            vec![],
        );
        assert_eq!(activity["object"]["type"], "Tombstone");
        assert_eq!(activity["object"]["id"], "https://local.example/notes/1");
    }
}
