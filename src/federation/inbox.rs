//! Inbound federation endpoints
//!
//! The dispatcher pipeline, terminal states Accepted/Rejected/Forbidden:
//! content-type check (415) -> target actor resolution (404) -> JSON
//! parse (400) -> signature verification (401) -> lazy sender creation
//! -> block check (403) -> type-specific handler. Recognized requests
//! answer 202, including unknown activity types and idempotent
//! duplicates.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::Utc;
use http::HeaderMap;

use crate::AppState;
use crate::data::{Actor, EntityId};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED_TOTAL, INBOX_OUTCOMES_TOTAL, SIGNATURE_VERIFICATIONS_TOTAL};

use super::ACTIVITY_CONTENT_TYPE;
use super::handlers::InboxProcessor;
use super::resolver::extract_actor_domain;
use super::signature::{extract_signature_key_id, key_id_matches_actor, verify_request};

/// Create federation router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn federation_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor_document))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// Accepted request media types: the protocol's JSON type or the
/// ld+json form carrying the ActivityStreams profile.
fn is_activity_content_type(content_type: &str) -> bool {
    let normalized = content_type.to_ascii_lowercase();
    normalized.contains("application/activity+json")
        || (normalized.contains("application/ld+json")
            && normalized.contains("activitystreams"))
}

/// Step 1 of the pipeline: the request must claim a protocol media
/// type before anything else is looked at.
fn ensure_activity_content_type(headers: &HeaderMap) -> Result<(), AppError> {
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_activity_content_type(content_type) {
        INBOX_OUTCOMES_TOTAL.with_label_values(&["unsupported_media_type"]).inc();
        return Err(AppError::UnsupportedMediaType);
    }
    Ok(())
}

/// GET /users/:username
///
/// Returns the actor document remote peers fetch to verify our
/// signatures and discover our inboxes.
async fn actor_document(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .db
        .find_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let base_url = state.config.server.base_url();
    let document = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor.uri,
        "preferredUsername": actor.username,
        "inbox": actor.inbox_url,
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "followers": actor.followers_uri(),
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.uri,
            "publicKeyPem": actor.public_key_pem
        }
    });

    Ok((
        [(http::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        Json(document),
    )
        .into_response())
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ensure_activity_content_type(&headers)?;

    // An unknown recipient is a plain 404.
    let target = state
        .db
        .find_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let path = format!("/users/{}/inbox", username);
    dispatch_inbound(&state, target, &path, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox: one endpoint per server, cheaper for remote peers
/// delivering to several local recipients at once.
async fn shared_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ensure_activity_content_type(&headers)?;

    let target = state
        .db
        .find_any_local_actor()
        .await?
        .ok_or(AppError::NotFound)?;

    dispatch_inbound(&state, target, "/inbox", &headers, &body).await
}

/// The dispatcher state machine shared by both inbox endpoints.
async fn dispatch_inbound(
    state: &AppState,
    target: Actor,
    path: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<StatusCode, AppError> {
    // Content-type (step 1) and target resolution (step 2) happened
    // in the route handlers.

    // 3. Parse the activity envelope.
    let activity: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_uri = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
        .to_string();

    // 4. Verify the signature. The keyId must belong to the claimed
    //    actor before any key material is fetched.
    let key_id = extract_signature_key_id(headers)?;
    if !key_id_matches_actor(&key_id, &actor_uri) {
        SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["rejected"]).inc();
        INBOX_OUTCOMES_TOTAL.with_label_values(&["unauthorized"]).inc();
        return Err(AppError::Signature(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    let resolved = state.resolver.resolve_key(&key_id).await.map_err(|error| {
        // A key we cannot resolve is an unverifiable signature, not a
        // server error: this request fails closed as 401.
        SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["rejected"]).inc();
        match error {
            AppError::Signature(msg) => AppError::Signature(msg),
            other => AppError::Signature(format!("Failed to resolve signing key: {}", other)),
        }
    })?;

    if let Err(error) = verify_request(
        "POST",
        path,
        headers,
        Some(body.as_ref()),
        &resolved.public_key_pem,
    ) {
        SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["rejected"]).inc();
        INBOX_OUTCOMES_TOTAL.with_label_values(&["unauthorized"]).inc();
        return Err(error);
    }
    SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["verified"]).inc();

    // 5. Resolve or lazily create the sending actor record.
    let sender_domain = extract_actor_domain(&actor_uri)?;
    let sender_row = Actor {
        id: EntityId::new().0,
        uri: actor_uri.clone(),
        username: resolved
            .preferred_username
            .clone()
            .unwrap_or_else(|| actor_uri.clone()),
        domain: sender_domain.clone(),
        inbox_url: resolved.inbox_url.clone(),
        shared_inbox_url: resolved.shared_inbox_url.clone(),
        public_key_pem: resolved.public_key_pem.clone(),
        private_key_pem: None,
        is_local: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    state.db.insert_actor_if_absent(&sender_row).await?;
    let sender = state
        .db
        .find_actor_by_uri(&actor_uri)
        .await?
        .unwrap_or(sender_row);

    // 6. Reject blocked senders, actor-level and domain-level.
    if state.db.is_blocked(&target.uri, &sender.uri).await?
        || state.db.is_domain_blocked(&sender.domain).await?
    {
        INBOX_OUTCOMES_TOTAL.with_label_values(&["forbidden"]).inc();
        return Err(AppError::Forbidden);
    }

    // 7. Dispatch to the type-specific handler.
    let processor = InboxProcessor::new(
        state.db.clone(),
        state.resolver.clone(),
        state.jobs.clone(),
    );
    let kind = processor.process(activity, &sender, &target).await?;

    ACTIVITIES_RECEIVED_TOTAL.with_label_values(&[kind.as_str()]).inc();
    INBOX_OUTCOMES_TOTAL.with_label_values(&["accepted"]).inc();

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::is_activity_content_type;

    #[test]
    fn activity_json_media_types_are_accepted() {
        assert!(is_activity_content_type("application/activity+json"));
        assert!(is_activity_content_type(
            "application/activity+json; charset=utf-8"
        ));
        assert!(is_activity_content_type(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
    }

    #[test]
    fn other_media_types_are_rejected() {
        assert!(!is_activity_content_type("application/json"));
        assert!(!is_activity_content_type("text/html"));
        assert!(!is_activity_content_type(""));
    }
}
