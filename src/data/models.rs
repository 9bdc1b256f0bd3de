//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Visibility
// =============================================================================

/// Content visibility level
///
/// Set once at object creation (inferred from the inbound audience
/// fields for remote objects) and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Unlisted,
    Followers,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Followers => "followers",
            Self::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "unlisted" => Some(Self::Unlisted),
            "followers" => Some(Self::Followers),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A protocol participant, local or remote
///
/// Local actors always carry a private key; remote actors only ever
/// hold a cached public key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// Stable, globally unique actor URI
    pub uri: String,
    pub username: String,
    pub domain: String,
    /// Personal inbox endpoint
    pub inbox_url: String,
    /// Per-server shared inbox endpoint, if advertised
    pub shared_inbox_url: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format), local actors only
    pub private_key_pem: Option<String>,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Key ID advertised in this actor's document
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    /// URI of this actor's followers collection
    pub fn followers_uri(&self) -> String {
        format!("{}/followers", self.uri)
    }
}

// =============================================================================
// Activity
// =============================================================================

/// A single protocol message (Follow/Like/Create/...)
///
/// The URI is the idempotency key: a duplicate inbound activity with
/// the same URI is a no-op, not an error. `payload` holds the full
/// JSON document so outbound deliveries can be retried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: String,
    pub uri: String,
    /// Activity type tag ("Follow", "Create", ...)
    pub kind: String,
    pub actor_uri: String,
    pub object_uri: Option<String>,
    pub target_uri: Option<String>,
    /// Serialized activity JSON
    pub payload: String,
    pub published: DateTime<Utc>,
    pub is_local: bool,
    /// Issued network calls only; never incremented on local failure
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Content Object
// =============================================================================

/// A federated note/post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentObject {
    pub id: String,
    pub uri: String,
    pub actor_uri: String,
    /// One of Visibility::as_str(); immutable after creation
    pub visibility: String,
    /// Sanitized HTML content
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    pub quote_of_uri: Option<String>,
    pub reply_count: i64,
    pub like_count: i64,
    pub announce_count: i64,
    /// Tombstoned rows keep their URI so replayed Creates stay rejected
    pub tombstoned: bool,
    pub published: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relationship edges
// =============================================================================

/// Directed follow edge between two actors
///
/// Transitions pending -> accepted exactly once per surviving edge.
/// `activity_uri` is recorded at send time so a later Accept/Reject
/// can be correlated back to this edge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub id: String,
    pub source_uri: String,
    pub target_uri: String,
    pub activity_uri: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

/// Directed block edge between two actors
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlockEdge {
    pub id: String,
    pub source_uri: String,
    pub target_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Favourite edge (actor -> object)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LikeEdge {
    pub id: String,
    pub actor_uri: String,
    pub object_uri: String,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Reblog edge (actor -> object)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnnounceEdge {
    pub id: String,
    pub actor_uri: String,
    pub object_uri: String,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Relay subscription keyed by the outbound activity URI
///
/// Folded by inbound Accept/Reject exactly like an outstanding Follow.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RelaySubscription {
    pub id: String,
    pub inbox_url: String,
    pub activity_uri: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Create sub-resources
// =============================================================================

/// Poll attached to a Question object
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Poll {
    pub id: String,
    pub object_uri: String,
    pub multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
}

/// One poll option with its running tally
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollOption {
    pub id: String,
    pub poll_id: String,
    pub position: i64,
    pub title: String,
    pub votes_count: i64,
}

/// Media attachment metadata on an object
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Attachment {
    pub id: String,
    pub object_uri: String,
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Custom emoji referenced by a remote object
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomEmoji {
    pub id: String,
    pub shortcode: String,
    pub domain: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification for local-actor interactions
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    /// Type: follow, mention, favourite, reblog
    pub kind: String,
    pub origin_actor_uri: String,
    pub object_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Notification types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Follow,
    Mention,
    Favourite,
    Reblog,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Mention => "mention",
            Self::Favourite => "favourite",
            Self::Reblog => "reblog",
        }
    }
}

// =============================================================================
// Delivery bookkeeping
// =============================================================================

/// Bookkeeping for one outbound send
///
/// Written only for actually-issued network calls, never for local
/// validation failures.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: String,
    pub activity_uri: String,
    pub inbox_url: String,
    pub attempt_number: i64,
    /// Response classification: delivered, gone, retry
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Peer availability
// =============================================================================

/// A domain marked dead after a 410 response
///
/// Presence of a record suppresses further delivery attempts to the
/// domain until it is cleared.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UnavailablePeer {
    pub id: String,
    pub domain: String,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
}
