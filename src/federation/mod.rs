//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (sign + verify)
//! - Audience resolution (visibility <-> to/cc)
//! - Remote actor resolution and caching
//! - Inbound dispatch and per-type activity handlers
//! - Outbound delivery with retry/backoff and dead-peer detection
//! - Shared-inbox routing optimization
//! - WebFinger discovery

mod audience;
pub mod delivery;
mod handlers;
mod inbox;
mod resolver;
mod routing;
mod signature;
mod webfinger;

/// Media type used for protocol requests and responses.
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

pub use audience::{PUBLIC_COLLECTION, infer_visibility, resolve_audience};
pub use delivery::{DeliveryConfig, DeliveryEngine, DeliveryOutcome, DeliveryTarget, SendOutcome};
pub use handlers::{ActivityKind, InboxProcessor};
pub use inbox::federation_router;
pub use resolver::{
    ActorFetcher, FetchResponse, HttpActorFetcher, RemoteActorResolver, ResolvedActor,
    SignatureRequiredCache, extract_actor_domain, url_domain,
};
pub use routing::{Recipient, collapse_inboxes};
pub use signature::{
    SignatureHeaders, extract_signature_key_id, generate_digest, key_id_matches_actor,
    parse_signature_header, sign_get_request, sign_post_request, verify_request,
};
pub use webfinger::{WebFingerResponse, generate_webfinger_response, wellknown_router};
