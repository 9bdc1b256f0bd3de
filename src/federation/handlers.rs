//! Inbound activity handlers
//!
//! One handler per activity type, each a small state transition
//! against local storage. Every handler is idempotent on replay of the
//! same activity URI: the dispatcher records each URI once and passes
//! a `replayed` flag, and edge/object creation is create-if-absent at
//! the persistence layer.
//!
//! Only the Follow handler acts on a replayed URI (re-accepting a
//! pending edge for peers that retry before seeing our Accept). For
//! every other type a replay is a no-op, which is what makes an Undo
//! win over a late duplicate of the activity it undid.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::data::{
    Activity, Actor, Attachment, BlockEdge, ContentObject, CustomEmoji, Database, EntityId,
    FollowEdge, LikeEdge, AnnounceEdge, Notification, NotificationKind, Poll, PollOption,
};
use crate::error::AppError;
use crate::jobs::{Job, JobSender};

use super::audience::infer_visibility;
use super::delivery::{DeliveryTarget, builder};
use super::resolver::RemoteActorResolver;

/// Closed set of activity types the engine understands.
///
/// `Unknown` maps to the 202-no-op path: the protocol mandates
/// accepting unrecognized activity types rather than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Follow,
    Accept,
    Reject,
    Undo,
    Block,
    Create,
    Update,
    Delete,
    Announce,
    Like,
    Unknown,
}

impl ActivityKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Block" => Self::Block,
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Announce" => Self::Announce,
            "Like" => Self::Like,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Block => "Block",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Announce => "Announce",
            Self::Like => "Like",
            Self::Unknown => "Unknown",
        }
    }
}

/// Extract the object reference from an activity: either a bare URI
/// string or an embedded object's `id`.
fn extract_object_uri(activity: &serde_json::Value) -> Option<String> {
    let object = activity.get("object")?;
    object
        .as_str()
        .or_else(|| object.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
}

/// Delete carries its target as a string, a Tombstone, or an object.
fn extract_delete_target_uri(activity: &serde_json::Value) -> Option<String> {
    let object = activity.get("object")?;

    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    object
        .get("id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

/// Read `to`/`cc`-style fields that may be a string or an array.
fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Actor URIs mentioned via `tag` entries of type Mention.
fn mention_targets(object: &serde_json::Value) -> Vec<String> {
    object
        .get("tag")
        .and_then(|tags| tags.as_array())
        .map(|tags| {
            tags.iter()
                .filter(|tag| {
                    tag.get("type")
                        .and_then(|t| t.as_str())
                        .is_some_and(|t| t == "Mention")
                })
                .filter_map(|tag| tag.get("href").and_then(|href| href.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Quote references appear under several names in the wild.
fn quote_reference(object: &serde_json::Value) -> Option<String> {
    for key in ["quoteUrl", "quoteUri", "_misskey_quote"] {
        if let Some(uri) = object.get(key).and_then(|value| value.as_str()) {
            return Some(uri.to_string());
        }
    }
    None
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Inbound activity processor
///
/// Dispatches verified activities to type-specific handlers.
pub struct InboxProcessor {
    db: Arc<Database>,
    resolver: Arc<RemoteActorResolver>,
    jobs: JobSender,
}

impl InboxProcessor {
    pub fn new(db: Arc<Database>, resolver: Arc<RemoteActorResolver>, jobs: JobSender) -> Self {
        Self { db, resolver, jobs }
    }

    /// Process one verified inbound activity.
    ///
    /// `sender` is the remote actor proven by the request signature;
    /// `target` is the local actor whose inbox received the request.
    pub async fn process(
        &self,
        activity: serde_json::Value,
        sender: &Actor,
        target: &Actor,
    ) -> Result<ActivityKind, AppError> {
        let uri = activity
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?
            .to_string();

        let kind = activity
            .get("type")
            .and_then(|t| t.as_str())
            .map(ActivityKind::parse)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        if kind == ActivityKind::Unknown {
            tracing::debug!(activity = %uri, "Accepted unknown activity type without action");
            return Ok(kind);
        }

        // Record the URI idempotently; a replay is duplicate
        // suppression, never an error surfaced to the peer.
        let record = Activity {
            id: EntityId::new().0,
            uri: uri.clone(),
            kind: kind.as_str().to_string(),
            actor_uri: sender.uri.clone(),
            object_uri: extract_object_uri(&activity),
            target_uri: Some(target.uri.clone()),
            payload: activity.to_string(),
            published: Utc::now(),
            is_local: false,
            attempt_count: 0,
            last_error: None,
            delivered: false,
            created_at: Utc::now(),
        };
        let replayed = !self.db.insert_activity_if_absent(&record).await?;

        match kind {
            ActivityKind::Follow => self.handle_follow(&activity, sender, target, replayed).await?,
            ActivityKind::Accept => self.handle_accept(&activity, replayed).await?,
            ActivityKind::Reject => self.handle_reject(&activity, replayed).await?,
            ActivityKind::Undo => self.handle_undo(&activity, sender, target, replayed).await?,
            ActivityKind::Block => self.handle_block(&activity, sender, replayed).await?,
            ActivityKind::Create => self.handle_create(&activity, sender, target, replayed).await?,
            ActivityKind::Update => self.handle_update(&activity, sender, replayed).await?,
            ActivityKind::Delete => self.handle_delete(&activity, sender, replayed).await?,
            ActivityKind::Announce => {
                self.handle_announce(&activity, sender, target, replayed).await?
            }
            ActivityKind::Like => self.handle_like(&activity, sender, target, replayed).await?,
            ActivityKind::Unknown => unreachable!("unknown handled above"),
        }

        Ok(kind)
    }

    // =========================================================================
    // Follow / Accept / Reject
    // =========================================================================

    /// Inbound Follow: auto-accept policy.
    ///
    /// An accepted edge makes this a no-op; a pending edge is
    /// re-accepted (peers retry before seeing our Accept); a missing
    /// edge is created accepted and answered with a synthesized
    /// Accept. A replayed URI with no edge means an Undo already won:
    /// no edge is revived.
    async fn handle_follow(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        target: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        let follow_uri = activity
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?;
        let Some(followee_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Follow".to_string()));
        };

        if followee_uri != target.uri {
            tracing::debug!(
                follow = %follow_uri,
                object = %followee_uri,
                "Follow does not target the inbox owner; ignoring"
            );
            return Ok(());
        }

        match self.db.find_follow(&sender.uri, &target.uri).await? {
            Some(edge) if edge.accepted => {
                tracing::debug!(follow = %follow_uri, "Follow edge already accepted");
                Ok(())
            }
            Some(edge) => {
                self.db.accept_follow(&edge.id).await?;
                self.schedule_accept(follow_uri, sender, target).await?;
                tracing::info!(follower = %sender.uri, "Re-accepted pending follow");
                Ok(())
            }
            None => {
                // A replayed URI with no surviving edge means an Undo
                // already removed it; the Undo wins even when the
                // duplicate Follow arrives after it.
                if replayed {
                    tracing::debug!(follow = %follow_uri, "Replay of an undone follow; not reviving edge");
                    return Ok(());
                }

                let edge = FollowEdge {
                    id: EntityId::new().0,
                    source_uri: sender.uri.clone(),
                    target_uri: target.uri.clone(),
                    activity_uri: follow_uri.to_string(),
                    accepted: true,
                    created_at: Utc::now(),
                };
                if !self.db.insert_follow_if_absent(&edge).await? {
                    // Raced with a concurrent duplicate; the winner
                    // already answered.
                    return Ok(());
                }

                self.db
                    .insert_notification(&Notification {
                        id: EntityId::new().0,
                        kind: NotificationKind::Follow.as_str().to_string(),
                        origin_actor_uri: sender.uri.clone(),
                        object_uri: None,
                        created_at: Utc::now(),
                    })
                    .await?;

                if target.is_local && !sender.is_local {
                    self.schedule_accept(follow_uri, sender, target).await?;
                }

                tracing::info!(follower = %sender.uri, target = %target.uri, "Follow accepted");
                Ok(())
            }
        }
    }

    /// Synthesize an Accept for a Follow and schedule its delivery.
    async fn schedule_accept(
        &self,
        follow_uri: &str,
        sender: &Actor,
        target: &Actor,
    ) -> Result<(), AppError> {
        let accept_uri = format!("{}/activities/{}", target.uri, EntityId::new().0);
        let payload = builder::accept(
            &accept_uri,
            &target.uri,
            serde_json::json!({
                "type": "Follow",
                "id": follow_uri,
                "actor": sender.uri,
                "object": target.uri,
            }),
        );

        let record = Activity {
            id: EntityId::new().0,
            uri: accept_uri.clone(),
            kind: "Accept".to_string(),
            actor_uri: target.uri.clone(),
            object_uri: Some(follow_uri.to_string()),
            target_uri: Some(sender.uri.clone()),
            payload: payload.to_string(),
            published: Utc::now(),
            is_local: true,
            attempt_count: 0,
            last_error: None,
            delivered: false,
            created_at: Utc::now(),
        };
        self.db.insert_activity_if_absent(&record).await?;

        self.jobs.enqueue(Job::Deliver {
            activity_uri: accept_uri,
            targets: vec![DeliveryTarget::actor_inbox(
                sender.inbox_url.clone(),
                sender.uri.clone(),
            )],
        });

        Ok(())
    }

    /// Inbound Accept of an outstanding Follow (or relay subscription)
    /// the local actor sent, correlated by the outbound activity URI
    /// recorded at send time.
    async fn handle_accept(
        &self,
        activity: &serde_json::Value,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(accepted_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Accept".to_string()));
        };

        if let Some(edge) = self.db.find_follow_by_activity_uri(&accepted_uri).await? {
            self.db.accept_follow(&edge.id).await?;
            tracing::info!(follow = %accepted_uri, "Outbound follow confirmed");
            return Ok(());
        }

        if let Some(subscription) = self
            .db
            .find_relay_subscription_by_activity_uri(&accepted_uri)
            .await?
        {
            self.db.accept_relay_subscription(&subscription.id).await?;
            tracing::info!(subscription = %accepted_uri, "Relay subscription confirmed");
            return Ok(());
        }

        tracing::debug!(object = %accepted_uri, "Accept matched no outstanding follow or subscription");
        Ok(())
    }

    /// Inbound Reject destroys the pending edge it answers.
    async fn handle_reject(
        &self,
        activity: &serde_json::Value,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(rejected_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Reject".to_string()));
        };

        if let Some(edge) = self.db.find_follow_by_activity_uri(&rejected_uri).await? {
            self.db.delete_follow(&edge.id).await?;
            tracing::info!(follow = %rejected_uri, "Outbound follow rejected");
            return Ok(());
        }

        if let Some(subscription) = self
            .db
            .find_relay_subscription_by_activity_uri(&rejected_uri)
            .await?
        {
            self.db.delete_relay_subscription(&subscription.id).await?;
            tracing::info!(subscription = %rejected_uri, "Relay subscription rejected");
            return Ok(());
        }

        Ok(())
    }

    // =========================================================================
    // Undo
    // =========================================================================

    /// Undo dispatches again on the embedded object's type and removes
    /// the corresponding relationship record.
    async fn handle_undo(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        target: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(object) = activity.get("object") else {
            return Err(AppError::Validation("Missing object in Undo".to_string()));
        };

        let embedded_kind = object
            .get("type")
            .and_then(|t| t.as_str())
            .map(ActivityKind::parse);
        let embedded_uri = object
            .as_str()
            .map(str::to_string)
            .or_else(|| object.get("id").and_then(|id| id.as_str()).map(str::to_string));

        match embedded_kind {
            Some(ActivityKind::Follow) => {
                self.undo_follow(object, embedded_uri.as_deref(), sender, target)
                    .await
            }
            Some(ActivityKind::Block) => {
                let blocked = extract_object_uri(object).unwrap_or_else(|| target.uri.clone());
                self.db.delete_block(&sender.uri, &blocked).await?;
                tracing::info!(source = %sender.uri, target = %blocked, "Block undone");
                Ok(())
            }
            Some(ActivityKind::Like) => self.undo_like(object, embedded_uri.as_deref(), sender).await,
            Some(ActivityKind::Announce) => {
                self.undo_announce(object, embedded_uri.as_deref(), sender).await
            }
            // Bare URI with no type: probe each relationship keyed by
            // the activity URI.
            None if embedded_uri.is_some() => {
                let Some(uri) = embedded_uri else {
                    return Ok(());
                };
                if let Some(edge) = self.db.find_follow_by_activity_uri(&uri).await? {
                    if edge.source_uri == sender.uri {
                        self.db.delete_follow(&edge.id).await?;
                    }
                } else if let Some(like) = self.db.find_like_by_activity_uri(&uri).await? {
                    self.db.delete_like(&like.id).await?;
                    self.db.adjust_like_count(&like.object_uri, -1).await?;
                } else if let Some(announce) = self.db.find_announce_by_activity_uri(&uri).await? {
                    self.db.delete_announce(&announce.id).await?;
                    self.db.adjust_announce_count(&announce.object_uri, -1).await?;
                }
                Ok(())
            }
            _ => {
                tracing::debug!("Undo with unsupported embedded object; ignoring");
                Ok(())
            }
        }
    }

    /// Undo-Follow: exact match on the embedded activity URI first.
    /// Senders do not always echo the original URI, so fall back to
    /// the most recent edge between the two actors.
    async fn undo_follow(
        &self,
        object: &serde_json::Value,
        embedded_uri: Option<&str>,
        sender: &Actor,
        target: &Actor,
    ) -> Result<(), AppError> {
        if let Some(uri) = embedded_uri {
            if let Some(edge) = self.db.find_follow_by_activity_uri(uri).await? {
                if edge.source_uri == sender.uri {
                    self.db.delete_follow(&edge.id).await?;
                    tracing::info!(follower = %sender.uri, "Follow undone (exact match)");
                    return Ok(());
                }
            }
        }

        let followee = extract_object_uri(object).unwrap_or_else(|| target.uri.clone());
        if let Some(edge) = self.db.find_follow(&sender.uri, &followee).await? {
            self.db.delete_follow(&edge.id).await?;
            tracing::info!(follower = %sender.uri, "Follow undone (actor-pair fallback)");
        }
        Ok(())
    }

    async fn undo_like(
        &self,
        object: &serde_json::Value,
        embedded_uri: Option<&str>,
        sender: &Actor,
    ) -> Result<(), AppError> {
        let edge = match embedded_uri {
            Some(uri) => self.db.find_like_by_activity_uri(uri).await?,
            None => None,
        };
        let edge = match edge {
            Some(edge) => Some(edge),
            None => match extract_object_uri(object) {
                Some(liked_uri) => self.db.find_like(&sender.uri, &liked_uri).await?,
                None => None,
            },
        };

        if let Some(edge) = edge {
            self.db.delete_like(&edge.id).await?;
            self.db.adjust_like_count(&edge.object_uri, -1).await?;
            tracing::info!(actor = %sender.uri, object = %edge.object_uri, "Like undone");
        }
        Ok(())
    }

    async fn undo_announce(
        &self,
        object: &serde_json::Value,
        embedded_uri: Option<&str>,
        sender: &Actor,
    ) -> Result<(), AppError> {
        let edge = match embedded_uri {
            Some(uri) => self.db.find_announce_by_activity_uri(uri).await?,
            None => None,
        };
        let edge = match edge {
            Some(edge) => Some(edge),
            None => match extract_object_uri(object) {
                Some(announced_uri) => self.db.find_announce(&sender.uri, &announced_uri).await?,
                None => None,
            },
        };

        if let Some(edge) = edge {
            self.db.delete_announce(&edge.id).await?;
            self.db.adjust_announce_count(&edge.object_uri, -1).await?;
            tracing::info!(actor = %sender.uri, object = %edge.object_uri, "Announce undone");
        }
        Ok(())
    }

    // =========================================================================
    // Block
    // =========================================================================

    /// Inbound Block creates the edge and, as an explicit side effect,
    /// destroys any follow edges in both directions.
    async fn handle_block(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(blocked_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Block".to_string()));
        };

        let edge = BlockEdge {
            id: EntityId::new().0,
            source_uri: sender.uri.clone(),
            target_uri: blocked_uri.clone(),
            created_at: Utc::now(),
        };
        self.db.insert_block_if_absent(&edge).await?;

        let severed = self
            .db
            .delete_follows_between(&sender.uri, &blocked_uri)
            .await?;
        if severed > 0 {
            tracing::info!(
                source = %sender.uri,
                target = %blocked_uri,
                severed,
                "Block severed existing follow edges"
            );
        }

        Ok(())
    }

    // =========================================================================
    // Create / Update / Delete
    // =========================================================================

    /// Inbound Create persists the object once, with visibility
    /// inferred before persistence, then processes mentions,
    /// attachments, emoji tags, polls, and quote references as
    /// independent, individually-failable sub-steps. A malformed poll
    /// option must not roll back the base object.
    async fn handle_create(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        target: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            tracing::debug!("Create without an embedded object; ignoring");
            return Ok(());
        };

        let object_type = object
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown");
        if !matches!(object_type, "Note" | "Article" | "Question") {
            return Ok(());
        }

        let Some(object_uri) = object.get("id").and_then(|id| id.as_str()) else {
            return Err(AppError::Validation("Missing object id in Create".to_string()));
        };

        if let Some(attributed_to) = object.get("attributedTo").and_then(|a| a.as_str()) {
            if attributed_to != sender.uri {
                tracing::warn!(
                    object = %object_uri,
                    attributed_to,
                    sender = %sender.uri,
                    "Create attribution does not match verified sender; ignoring"
                );
                return Ok(());
            }
        }

        // A URI already taken (including by a tombstone) means this
        // Create was already processed or its object deleted: no-op.
        if self.db.find_object_by_uri(object_uri).await?.is_some() {
            return Ok(());
        }

        let to = string_list(object.get("to"));
        let cc = string_list(object.get("cc"));
        let mentions = mention_targets(object);
        // Visibility must be fixed before the row exists; it is
        // immutable afterwards.
        let visibility = infer_visibility(&to, &cc, &mentions);

        let content = object
            .get("content")
            .and_then(|c| c.as_str())
            .map(sanitize_remote_html)
            .unwrap_or_default();
        let published = object
            .get("published")
            .and_then(|p| p.as_str())
            .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
            .map(|p| p.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let in_reply_to_uri = object
            .get("inReplyTo")
            .and_then(|r| r.as_str())
            .map(str::to_string);

        let row = ContentObject {
            id: EntityId::new().0,
            uri: object_uri.to_string(),
            actor_uri: sender.uri.clone(),
            visibility: visibility.as_str().to_string(),
            content,
            in_reply_to_uri: in_reply_to_uri.clone(),
            quote_of_uri: None,
            reply_count: 0,
            like_count: 0,
            announce_count: 0,
            tombstoned: false,
            published,
            created_at: Utc::now(),
        };
        if !self.db.insert_object_if_absent(&row).await? {
            return Ok(());
        }

        // Sub-steps: each failure is logged and skipped; none may fail
        // the enclosing Create.
        if let Err(error) = self.process_mentions(object_uri, &mentions, sender, target).await {
            tracing::warn!(%error, object = %object_uri, "Mention processing failed");
        }
        if let Err(error) = self.process_attachments(object_uri, object).await {
            tracing::warn!(%error, object = %object_uri, "Attachment processing failed");
        }
        if let Err(error) = self.process_emoji_tags(object, sender).await {
            tracing::warn!(%error, object = %object_uri, "Emoji tag processing failed");
        }
        if object_type == "Question" {
            if let Err(error) = self.process_poll(object_uri, object).await {
                tracing::warn!(%error, object = %object_uri, "Poll processing failed");
            }
        }
        if let Err(error) = self.process_quote(object_uri, object).await {
            tracing::warn!(%error, object = %object_uri, "Quote processing failed");
        }

        if let Some(parent_uri) = &in_reply_to_uri {
            if self.db.find_object_by_uri(parent_uri).await?.is_some() {
                self.db.increment_reply_count(parent_uri).await?;
            }
        }

        tracing::info!(object = %object_uri, visibility = visibility.as_str(), "Object created");
        Ok(())
    }

    async fn process_mentions(
        &self,
        object_uri: &str,
        mentions: &[String],
        sender: &Actor,
        target: &Actor,
    ) -> Result<(), AppError> {
        for mention_uri in mentions {
            self.db.insert_mention_if_absent(object_uri, mention_uri).await?;

            if mention_uri == &target.uri {
                self.db
                    .insert_notification(&Notification {
                        id: EntityId::new().0,
                        kind: NotificationKind::Mention.as_str().to_string(),
                        origin_actor_uri: sender.uri.clone(),
                        object_uri: Some(object_uri.to_string()),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_attachments(
        &self,
        object_uri: &str,
        object: &serde_json::Value,
    ) -> Result<(), AppError> {
        let Some(attachments) = object.get("attachment").and_then(|a| a.as_array()) else {
            return Ok(());
        };

        for attachment in attachments {
            let Some(url) = attachment.get("url").and_then(|u| u.as_str()) else {
                tracing::debug!(object = %object_uri, "Attachment without url; skipping");
                continue;
            };

            self.db
                .insert_attachment(&Attachment {
                    id: EntityId::new().0,
                    object_uri: object_uri.to_string(),
                    url: url.to_string(),
                    media_type: attachment
                        .get("mediaType")
                        .and_then(|m| m.as_str())
                        .map(str::to_string),
                    description: attachment
                        .get("name")
                        .and_then(|n| n.as_str())
                        .map(str::to_string),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn process_emoji_tags(
        &self,
        object: &serde_json::Value,
        sender: &Actor,
    ) -> Result<(), AppError> {
        let Some(tags) = object.get("tag").and_then(|t| t.as_array()) else {
            return Ok(());
        };

        for tag in tags {
            if tag.get("type").and_then(|t| t.as_str()) != Some("Emoji") {
                continue;
            }
            let Some(name) = tag.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let Some(image_url) = tag
                .get("icon")
                .and_then(|icon| icon.get("url"))
                .and_then(|u| u.as_str())
            else {
                continue;
            };

            self.db
                .insert_emoji_if_absent(&CustomEmoji {
                    id: EntityId::new().0,
                    shortcode: name.trim_matches(':').to_string(),
                    domain: sender.domain.clone(),
                    image_url: image_url.to_string(),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn process_poll(
        &self,
        object_uri: &str,
        object: &serde_json::Value,
    ) -> Result<(), AppError> {
        let (options, multiple) = match (object.get("oneOf"), object.get("anyOf")) {
            (Some(one_of), _) => (one_of, false),
            (None, Some(any_of)) => (any_of, true),
            (None, None) => {
                return Err(AppError::Validation(
                    "Question without oneOf or anyOf options".to_string(),
                ));
            }
        };
        let options = options
            .as_array()
            .ok_or_else(|| AppError::Validation("Poll options must be an array".to_string()))?;

        let expires_at = object
            .get("endTime")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        let poll = Poll {
            id: EntityId::new().0,
            object_uri: object_uri.to_string(),
            multiple,
            expires_at,
            expired: false,
            created_at: Utc::now(),
        };
        if !self.db.insert_poll_if_absent(&poll).await? {
            return Ok(());
        }

        for (position, option) in options.iter().enumerate() {
            let title = option
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| AppError::Validation("Poll option without name".to_string()))?;

            self.db
                .insert_poll_option(&PollOption {
                    id: EntityId::new().0,
                    poll_id: poll.id.clone(),
                    position: position as i64,
                    title: title.to_string(),
                    votes_count: 0,
                })
                .await?;
        }

        if let Some(at) = expires_at {
            self.jobs.enqueue(Job::ExpirePoll {
                poll_id: poll.id.clone(),
                at,
            });
        }

        Ok(())
    }

    async fn process_quote(
        &self,
        object_uri: &str,
        object: &serde_json::Value,
    ) -> Result<(), AppError> {
        if let Some(quoted_uri) = quote_reference(object) {
            self.db.set_object_quote(object_uri, &quoted_uri).await?;
        }
        Ok(())
    }

    /// Inbound Update replaces mutable fields on an object the sender
    /// owns.
    async fn handle_update(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(());
        };
        let Some(object_uri) = object.get("id").and_then(|id| id.as_str()) else {
            return Err(AppError::Validation("Missing object id in Update".to_string()));
        };

        let Some(stored) = self.db.find_object_by_uri(object_uri).await? else {
            return Ok(());
        };
        if stored.actor_uri != sender.uri {
            tracing::warn!(
                object = %object_uri,
                sender = %sender.uri,
                "Update from non-owner; ignoring"
            );
            return Ok(());
        }

        if let Some(content) = object.get("content").and_then(|c| c.as_str()) {
            self.db
                .update_object_content(object_uri, &sanitize_remote_html(content))
                .await?;
            tracing::info!(object = %object_uri, "Object updated");
        }
        Ok(())
    }

    /// Inbound Delete tombstones the object: the URI stays reserved so
    /// a replayed Create of the same URI is still rejected.
    async fn handle_delete(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let Some(target_uri) = extract_delete_target_uri(activity) else {
            return Err(AppError::Validation("Missing object in Delete".to_string()));
        };

        let Some(stored) = self.db.find_object_by_uri(&target_uri).await? else {
            return Ok(());
        };
        if stored.actor_uri != sender.uri {
            tracing::warn!(
                object = %target_uri,
                sender = %sender.uri,
                "Delete from non-owner; ignoring"
            );
            return Ok(());
        }

        self.db.tombstone_object(&target_uri).await?;
        tracing::info!(object = %target_uri, "Object tombstoned");
        Ok(())
    }

    // =========================================================================
    // Announce / Like
    // =========================================================================

    /// Inbound Like: locate the object (resolving remotely if not
    /// cached), create the edge idempotently, and increment the
    /// counter exactly once per edge.
    async fn handle_like(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        target: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let activity_uri = activity
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?;
        let Some(object_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Like".to_string()));
        };

        let Some(object) = self.locate_object(&object_uri).await? else {
            tracing::debug!(object = %object_uri, "Like of unresolvable object; ignoring");
            return Ok(());
        };

        let edge = LikeEdge {
            id: EntityId::new().0,
            actor_uri: sender.uri.clone(),
            object_uri: object.uri.clone(),
            activity_uri: activity_uri.to_string(),
            created_at: Utc::now(),
        };
        if self.db.insert_like_if_absent(&edge).await? {
            self.db.adjust_like_count(&object.uri, 1).await?;

            if object.actor_uri == target.uri {
                self.db
                    .insert_notification(&Notification {
                        id: EntityId::new().0,
                        kind: NotificationKind::Favourite.as_str().to_string(),
                        origin_actor_uri: sender.uri.clone(),
                        object_uri: Some(object.uri.clone()),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Inbound Announce: same shape as Like with a reblog edge.
    async fn handle_announce(
        &self,
        activity: &serde_json::Value,
        sender: &Actor,
        target: &Actor,
        replayed: bool,
    ) -> Result<(), AppError> {
        if replayed {
            return Ok(());
        }
        let activity_uri = activity
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?;
        let Some(object_uri) = extract_object_uri(activity) else {
            return Err(AppError::Validation("Missing object in Announce".to_string()));
        };

        let Some(object) = self.locate_object(&object_uri).await? else {
            tracing::debug!(object = %object_uri, "Announce of unresolvable object; ignoring");
            return Ok(());
        };

        let edge = AnnounceEdge {
            id: EntityId::new().0,
            actor_uri: sender.uri.clone(),
            object_uri: object.uri.clone(),
            activity_uri: activity_uri.to_string(),
            created_at: Utc::now(),
        };
        if self.db.insert_announce_if_absent(&edge).await? {
            self.db.adjust_announce_count(&object.uri, 1).await?;

            if object.actor_uri == target.uri {
                self.db
                    .insert_notification(&Notification {
                        id: EntityId::new().0,
                        kind: NotificationKind::Reblog.as_str().to_string(),
                        origin_actor_uri: sender.uri.clone(),
                        object_uri: Some(object.uri.clone()),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Find an object locally, fetching and persisting it from the
    /// origin server when it is not cached. Resolution failures are
    /// reported as None; the caller ignores the activity rather than
    /// failing the request.
    async fn locate_object(&self, object_uri: &str) -> Result<Option<ContentObject>, AppError> {
        if let Some(object) = self.db.find_object_by_uri(object_uri).await? {
            if object.tombstoned {
                return Ok(None);
            }
            return Ok(Some(object));
        }

        let document = match self.resolver.resolve_object(object_uri).await {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(%error, object = %object_uri, "Remote object resolution failed");
                return Ok(None);
            }
        };

        let Some(actor_uri) = document.get("attributedTo").and_then(|a| a.as_str()) else {
            return Ok(None);
        };
        let to = string_list(document.get("to"));
        let cc = string_list(document.get("cc"));
        let mentions = mention_targets(&document);

        let row = ContentObject {
            id: EntityId::new().0,
            uri: object_uri.to_string(),
            actor_uri: actor_uri.to_string(),
            visibility: infer_visibility(&to, &cc, &mentions).as_str().to_string(),
            content: document
                .get("content")
                .and_then(|c| c.as_str())
                .map(sanitize_remote_html)
                .unwrap_or_default(),
            in_reply_to_uri: None,
            quote_of_uri: None,
            reply_count: 0,
            like_count: 0,
            announce_count: 0,
            tombstoned: false,
            published: Utc::now(),
            created_at: Utc::now(),
        };
        self.db.insert_object_if_absent(&row).await?;
        self.db.find_object_by_uri(object_uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_kind_parses_known_types_and_defaults_unknown() {
        assert_eq!(ActivityKind::parse("Follow"), ActivityKind::Follow);
        assert_eq!(ActivityKind::parse("Create"), ActivityKind::Create);
        assert_eq!(ActivityKind::parse("EmojiReact"), ActivityKind::Unknown);
        assert_eq!(ActivityKind::parse(""), ActivityKind::Unknown);
    }

    #[test]
    fn extract_object_uri_reads_string_and_embedded_forms() {
        let bare = serde_json::json!({ "object": "https://remote.example/notes/1" });
        assert_eq!(
            extract_object_uri(&bare).as_deref(),
            Some("https://remote.example/notes/1")
        );

        let embedded = serde_json::json!({ "object": { "id": "https://remote.example/notes/2" } });
        assert_eq!(
            extract_object_uri(&embedded).as_deref(),
            Some("https://remote.example/notes/2")
        );

        let missing = serde_json::json!({ "object": 42 });
        assert_eq!(extract_object_uri(&missing), None);
    }

    #[test]
    fn string_list_accepts_string_or_array() {
        let single = serde_json::json!("https://remote.example/users/alice");
        assert_eq!(
            string_list(Some(&single)),
            vec!["https://remote.example/users/alice".to_string()]
        );

        let many = serde_json::json!(["a", "b", 3]);
        assert_eq!(string_list(Some(&many)), vec!["a".to_string(), "b".to_string()]);

        assert!(string_list(None).is_empty());
    }

    #[test]
    fn mention_targets_reads_mention_tags_only() {
        let object = serde_json::json!({
            "tag": [
                { "type": "Mention", "href": "https://remote.example/users/bob" },
                { "type": "Hashtag", "href": "https://remote.example/tags/rust" },
                { "type": "Mention" }
            ]
        });
        assert_eq!(
            mention_targets(&object),
            vec!["https://remote.example/users/bob".to_string()]
        );
    }

    #[test]
    fn quote_reference_checks_known_keys() {
        let object = serde_json::json!({ "quoteUrl": "https://remote.example/notes/9" });
        assert_eq!(
            quote_reference(&object).as_deref(),
            Some("https://remote.example/notes/9")
        );

        let misskey = serde_json::json!({ "_misskey_quote": "https://remote.example/notes/10" });
        assert_eq!(
            quote_reference(&misskey).as_deref(),
            Some("https://remote.example/notes/10")
        );

        assert_eq!(quote_reference(&serde_json::json!({})), None);
    }

    #[test]
    fn extract_delete_target_reads_tombstone_id() {
        let tombstone = serde_json::json!({
            "object": { "type": "Tombstone", "id": "https://remote.example/notes/1" }
        });
        assert_eq!(
            extract_delete_target_uri(&tombstone).as_deref(),
            Some("https://remote.example/notes/1")
        );
    }
}
