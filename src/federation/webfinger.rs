//! WebFinger discovery
//!
//! Answers `acct:user@domain` lookups with the local actor URI so
//! remote peers can find us before their first delivery.

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Generate the JRD response for a local actor.
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_uri: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_uri.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some("application/activity+json".to_string()),
            href: Some(actor_uri.to_string()),
        }],
    }
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// Parse `acct:user@domain` (the `acct:` prefix is optional in the
/// wild) into username and domain.
fn parse_acct_resource(resource: &str) -> Option<(&str, &str)> {
    let acct = resource.strip_prefix("acct:").unwrap_or(resource);
    let (username, domain) = acct.split_once('@')?;
    if username.is_empty() || domain.is_empty() {
        return None;
    }
    Some((username, domain))
}

/// GET /.well-known/webfinger?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<WebFingerResponse>, AppError> {
    let (username, domain) = parse_acct_resource(&query.resource)
        .ok_or_else(|| AppError::Validation("Invalid webfinger resource".to_string()))?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let actor = state
        .db
        .find_local_actor_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(generate_webfinger_response(
        &actor.username,
        &state.config.server.domain,
        &actor.uri,
    )))
}

/// Create the well-known router.
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}
