//! Remote actor resolution
//!
//! Fetches and caches remote actor documents: inbox endpoints and
//! public key material. Invoked synchronously during inbound signature
//! verification, so results are cached with a TTL.
//!
//! Some servers answer unsigned GET fetches with HTML, 401, 403, 404
//! or 500 even though the same fetch succeeds when signed. The
//! resolver first tries unsigned; when it sees one of those answers it
//! marks the domain "signature required" (long TTL) and retries
//! signed. Later fetches to a marked domain skip straight to signed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::AppError;

/// Media type requested when fetching protocol documents.
pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

// =============================================================================
// Host validation
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Extract and validate the remote domain from an actor URL or key ID.
///
/// Rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Extract the domain from any URL without host policy checks.
pub fn url_domain(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
}

async fn validate_remote_fetch_url(url: &url::Url) -> Result<(), AppError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(
            "Remote URL must use http or https".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(AppError::Validation(
            "Remote URL must not include user info".to_string(),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Remote URL must include a host".to_string()))?
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Validation(
            "Remote URL host is not allowed".to_string(),
        ));
    }

    // Resolve DNS and reject hosts that look public but point inward.
    let port = url.port_or_known_default().ok_or_else(|| {
        AppError::Validation("Remote URL must include a known default port".to_string())
    })?;
    let mut resolved_any = false;
    let resolved = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|error| {
            AppError::Federation(format!("Failed to resolve remote host {}: {}", host, error))
        })?;
    for address in resolved {
        resolved_any = true;
        if is_disallowed_ip(address.ip()) {
            return Err(AppError::Validation(
                "Remote URL host is not allowed".to_string(),
            ));
        }
    }
    if !resolved_any {
        return Err(AppError::Federation(format!(
            "Remote host did not resolve to any IP addresses: {}",
            host
        )));
    }

    Ok(())
}

// =============================================================================
// Fetcher seam
// =============================================================================

/// Raw result of one remote GET.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Parsed JSON body, when the response carried one
    pub body: Option<serde_json::Value>,
}

impl FetchResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"))
    }
}

/// Performs the actual GET of a remote document, unsigned or signed.
///
/// Split out as a trait so resolver behavior (fallback, caching) can
/// be tested without a network.
pub trait ActorFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, signed: bool)
    -> BoxFuture<'a, Result<FetchResponse, AppError>>;
}

/// Production fetcher backed by reqwest.
pub struct HttpActorFetcher {
    client: Arc<reqwest::Client>,
    key_id: String,
    private_key_pem: String,
}

impl HttpActorFetcher {
    pub fn new(client: Arc<reqwest::Client>, key_id: String, private_key_pem: String) -> Self {
        Self {
            client,
            key_id,
            private_key_pem,
        }
    }
}

impl ActorFetcher for HttpActorFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        signed: bool,
    ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
        Box::pin(async move {
            let parsed = url::Url::parse(url)
                .map_err(|e| AppError::Validation(format!("Invalid remote URL: {}", e)))?;
            validate_remote_fetch_url(&parsed).await?;

            let mut request = self.client.get(url).header("Accept", ACTIVITY_ACCEPT);

            if signed {
                let headers = super::signature::sign_get_request(
                    url,
                    ACTIVITY_ACCEPT,
                    &self.private_key_pem,
                    &self.key_id,
                )?;
                request = request
                    .header("Date", headers.date)
                    .header("Signature", headers.signature);
            }

            let response = request.send().await.map_err(|e| {
                AppError::Federation(format!("Remote fetch failed for {}: {}", url, e))
            })?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string);
            let body = response.json::<serde_json::Value>().await.ok();

            Ok(FetchResponse {
                status,
                content_type,
                body,
            })
        })
    }
}

// =============================================================================
// Signature-required cache
// =============================================================================

/// Per-domain learned state: does this domain reject unsigned fetches?
///
/// An explicit cache abstraction rather than module-level global state
/// so it can be injected, swapped, and unit-tested deterministically.
pub struct SignatureRequiredCache {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl SignatureRequiredCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn is_marked(&self, domain: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(domain)
            .is_some_and(|marked_at| marked_at.elapsed() < self.ttl)
    }

    pub async fn mark(&self, domain: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(domain.to_string(), Instant::now());
        tracing::debug!(domain, "Marked domain as requiring signed fetches");
    }

    pub async fn prune_expired(&self) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        entries.retain(|_, marked_at| marked_at.elapsed() < ttl);
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// A resolved remote actor: the fields the engine needs for delivery
/// and signature verification.
#[derive(Debug, Clone)]
pub struct ResolvedActor {
    pub uri: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub public_key_pem: String,
    /// Key id the actor document advertises
    pub key_id: Option<String>,
    pub preferred_username: Option<String>,
}

#[derive(Clone)]
struct CachedActor {
    actor: ResolvedActor,
    cached_at: Instant,
}

/// Remote actor resolver with TTL cache and signed-fetch fallback.
pub struct RemoteActorResolver {
    fetcher: Arc<dyn ActorFetcher>,
    cache: RwLock<HashMap<String, CachedActor>>,
    signature_required: SignatureRequiredCache,
    ttl: Duration,
}

impl RemoteActorResolver {
    pub fn new(
        fetcher: Arc<dyn ActorFetcher>,
        signature_required: SignatureRequiredCache,
        ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            cache: RwLock::new(HashMap::new()),
            signature_required,
            ttl,
        }
    }

    /// Resolve an actor URI to its endpoints and key material.
    ///
    /// Checks the cache first; fetches and caches on miss or expiry.
    pub async fn resolve_actor(&self, actor_uri: &str) -> Result<ResolvedActor, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(actor_uri) {
                if cached.cached_at.elapsed() < self.ttl {
                    tracing::debug!(actor_uri, "Actor cache hit");
                    return Ok(cached.actor.clone());
                }
            }
        }

        let document = self.fetch_document(actor_uri).await?;
        let actor = parse_actor_document(actor_uri, &document)?;

        let mut cache = self.cache.write().await;
        cache.insert(
            actor_uri.to_string(),
            CachedActor {
                actor: actor.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(actor)
    }

    /// Resolve a signature keyId to the owning actor.
    ///
    /// Strips the key fragment, resolves the actor, and rejects keys
    /// whose advertised id does not match the requested one.
    pub async fn resolve_key(&self, key_id: &str) -> Result<ResolvedActor, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        let actor = self.resolve_actor(actor_uri).await?;

        if key_id.contains('#') {
            let advertised = actor.key_id.as_deref().ok_or_else(|| {
                AppError::Signature("Actor document is missing publicKey.id".to_string())
            })?;
            if advertised != key_id {
                return Err(AppError::Signature(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
        }

        Ok(actor)
    }

    /// Drop the cache entry and re-fetch.
    ///
    /// Used by the delivery engine before the first retry after a
    /// 404-class failure, since stale inbox URLs and rotated keys are
    /// a common cause of spurious delivery errors.
    pub async fn refresh_actor(&self, actor_uri: &str) -> Result<ResolvedActor, AppError> {
        {
            let mut cache = self.cache.write().await;
            cache.remove(actor_uri);
        }
        self.resolve_actor(actor_uri).await
    }

    /// Fetch an arbitrary remote object document (not cached).
    pub async fn resolve_object(&self, object_uri: &str) -> Result<serde_json::Value, AppError> {
        self.fetch_document(object_uri).await
    }

    /// Drop expired cache entries; called from a background task.
    pub async fn prune_expired(&self) {
        let ttl = self.ttl;
        {
            let mut cache = self.cache.write().await;
            cache.retain(|_, cached| cached.cached_at.elapsed() < ttl);
        }
        self.signature_required.prune_expired().await;
    }

    /// GET a protocol document, falling back to a signed fetch when
    /// the domain demands it.
    async fn fetch_document(&self, url: &str) -> Result<serde_json::Value, AppError> {
        let domain = extract_actor_domain(url)?;

        if self.signature_required.is_marked(&domain).await {
            let response = self.fetcher.fetch(url, true).await?;
            return document_from(response, url);
        }

        let response = self.fetcher.fetch(url, false).await?;

        if needs_signed_retry(&response) {
            tracing::debug!(url, status = response.status, "Unsigned fetch refused, retrying signed");
            self.signature_required.mark(&domain).await;
            let response = self.fetcher.fetch(url, true).await?;
            return document_from(response, url);
        }

        document_from(response, url)
    }
}

/// Responses that mean "this server wants signed fetches": an auth
/// error, a 404/500 masking one, or HTML despite our Accept header.
fn needs_signed_retry(response: &FetchResponse) -> bool {
    matches!(response.status, 401 | 403 | 404 | 500) || (response.is_success() && response.is_html())
}

fn document_from(response: FetchResponse, url: &str) -> Result<serde_json::Value, AppError> {
    if !response.is_success() {
        return Err(AppError::Federation(format!(
            "Remote fetch failed for {}: HTTP {}",
            url, response.status
        )));
    }
    if response.is_html() {
        return Err(AppError::Federation(format!(
            "Remote fetch for {} returned HTML instead of a protocol document",
            url
        )));
    }
    response.body.ok_or_else(|| {
        AppError::Federation(format!("Remote fetch for {} returned no JSON body", url))
    })
}

fn parse_actor_document(
    actor_uri: &str,
    document: &serde_json::Value,
) -> Result<ResolvedActor, AppError> {
    let uri = document
        .get("id")
        .and_then(|value| value.as_str())
        .unwrap_or(actor_uri)
        .to_string();

    let inbox_url = document
        .get("inbox")
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            AppError::Federation(format!("Actor document for {} is missing inbox", actor_uri))
        })?
        .to_string();

    let shared_inbox_url = document
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(|value| value.as_str())
        .map(ToString::to_string);

    let public_key = document.get("publicKey").ok_or_else(|| {
        AppError::Federation(format!(
            "Actor document for {} is missing publicKey",
            actor_uri
        ))
    })?;

    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            AppError::Federation(format!(
                "Actor document for {} is missing publicKeyPem",
                actor_uri
            ))
        })?
        .to_string();

    let key_id = public_key
        .get("id")
        .and_then(|value| value.as_str())
        .map(ToString::to_string);

    let preferred_username = document
        .get("preferredUsername")
        .and_then(|value| value.as_str())
        .map(ToString::to_string);

    Ok(ResolvedActor {
        uri,
        inbox_url,
        shared_inbox_url,
        public_key_pem,
        key_id,
        preferred_username,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn actor_document(uri: &str) -> serde_json::Value {
        serde_json::json!({
            "id": uri,
            "preferredUsername": "alice",
            "inbox": format!("{uri}/inbox"),
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "publicKey": {
                "id": format!("{uri}#main-key"),
                "owner": uri,
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----"
            }
        })
    }

    /// Fetcher that refuses unsigned requests the way shy servers do.
    struct SignatureDemandingFetcher {
        unsigned_status: u16,
        unsigned_content_type: Option<String>,
        unsigned_calls: AtomicUsize,
        signed_calls: AtomicUsize,
    }

    impl SignatureDemandingFetcher {
        fn new(unsigned_status: u16, unsigned_content_type: Option<&str>) -> Self {
            Self {
                unsigned_status,
                unsigned_content_type: unsigned_content_type.map(ToString::to_string),
                unsigned_calls: AtomicUsize::new(0),
                signed_calls: AtomicUsize::new(0),
            }
        }
    }

    impl ActorFetcher for SignatureDemandingFetcher {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            signed: bool,
        ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
            Box::pin(async move {
                if signed {
                    self.signed_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(FetchResponse {
                        status: 200,
                        content_type: Some("application/activity+json".to_string()),
                        body: Some(actor_document(url.split('#').next().unwrap())),
                    })
                } else {
                    self.unsigned_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(FetchResponse {
                        status: self.unsigned_status,
                        content_type: self.unsigned_content_type.clone(),
                        body: None,
                    })
                }
            })
        }
    }

    /// Fetcher that always answers unsigned requests.
    struct OpenFetcher {
        calls: AtomicUsize,
    }

    impl ActorFetcher for OpenFetcher {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            _signed: bool,
        ) -> BoxFuture<'a, Result<FetchResponse, AppError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(FetchResponse {
                    status: 200,
                    content_type: Some("application/activity+json".to_string()),
                    body: Some(actor_document(url)),
                })
            })
        }
    }

    fn resolver_with(fetcher: Arc<dyn ActorFetcher>) -> RemoteActorResolver {
        RemoteActorResolver::new(
            fetcher,
            SignatureRequiredCache::new(Duration::from_secs(3600)),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn unsigned_refusal_falls_back_to_signed_and_marks_domain() {
        let fetcher = Arc::new(SignatureDemandingFetcher::new(401, None));
        let resolver = resolver_with(fetcher.clone());

        let actor = resolver
            .resolve_actor("https://remote.example/users/alice")
            .await
            .expect("signed fallback should succeed");
        assert_eq!(actor.inbox_url, "https://remote.example/users/alice/inbox");
        assert_eq!(fetcher.unsigned_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.signed_calls.load(Ordering::SeqCst), 1);

        // The domain is now marked: another fetch goes straight to signed.
        resolver
            .resolve_actor("https://remote.example/users/bob")
            .await
            .expect("second resolve should succeed");
        assert_eq!(fetcher.unsigned_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.signed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn html_response_despite_accept_header_triggers_signed_retry() {
        let fetcher = Arc::new(SignatureDemandingFetcher::new(200, Some("text/html")));
        let resolver = resolver_with(fetcher.clone());

        resolver
            .resolve_actor("https://remote.example/users/alice")
            .await
            .expect("signed fallback should succeed");
        assert_eq!(fetcher.signed_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolved_actor_is_cached_until_ttl() {
        let fetcher = Arc::new(OpenFetcher {
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver_with(fetcher.clone());

        for _ in 0..3 {
            resolver
                .resolve_actor("https://remote.example/users/alice")
                .await
                .expect("resolve should succeed");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_bypasses_the_cache() {
        let fetcher = Arc::new(OpenFetcher {
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver_with(fetcher.clone());

        resolver
            .resolve_actor("https://remote.example/users/alice")
            .await
            .unwrap();
        resolver
            .refresh_actor("https://remote.example/users/alice")
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_key_rejects_mismatched_advertised_key_id() {
        let fetcher = Arc::new(OpenFetcher {
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver_with(fetcher);

        let error = resolver
            .resolve_key("https://remote.example/users/alice#other-key")
            .await
            .expect_err("mismatched key id must fail");
        assert!(matches!(error, AppError::Signature(_)));
    }

    #[test]
    fn extract_actor_domain_rejects_localhost() {
        match extract_actor_domain("https://localhost/users/alice#main-key") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for localhost, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_rejects_private_ip() {
        match extract_actor_domain("http://192.168.1.10/users/alice#main-key") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for private ip, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_accepts_public_host() {
        let domain = extract_actor_domain("https://example.com/users/alice#main-key")
            .expect("public host should be accepted");
        assert_eq!(domain, "example.com");
    }

    #[tokio::test]
    async fn signature_required_cache_expires_entries() {
        let cache = SignatureRequiredCache::new(Duration::from_millis(50));
        cache.mark("remote.example").await;
        assert!(cache.is_marked("remote.example").await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.is_marked("remote.example").await);

        cache.prune_expired().await;
    }
}
