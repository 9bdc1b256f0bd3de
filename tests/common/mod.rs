//! Common test utilities for integration tests

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;

use windward::federation::{ActorFetcher, FetchResponse};
use windward::{AppState, config};

/// Generate a small RSA keypair for test signing.
pub fn generate_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation");
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private key pem")
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .expect("public key pem");

    (private_key_pem, public_key_pem)
}

/// Build the actor document a remote server would serve.
pub fn remote_actor_document(actor_uri: &str, public_key_pem: &str) -> serde_json::Value {
    serde_json::json!({
        "id": actor_uri,
        "type": "Person",
        "preferredUsername": "alice",
        "inbox": format!("{actor_uri}/inbox"),
        "endpoints": { "sharedInbox": "https://remote.test/inbox" },
        "publicKey": {
            "id": format!("{actor_uri}#main-key"),
            "owner": actor_uri,
            "publicKeyPem": public_key_pem
        }
    })
}

/// Fetcher that serves scripted documents instead of the network.
pub struct StubFetcher {
    documents: HashMap<String, serde_json::Value>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self {
            documents: HashMap::new(),
        }
    }

    pub fn with_document(mut self, url: &str, document: serde_json::Value) -> Self {
        self.documents.insert(url.to_string(), document);
        self
    }
}

impl ActorFetcher for StubFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        _signed: bool,
    ) -> BoxFuture<'a, Result<FetchResponse, windward::error::AppError>> {
        Box::pin(async move {
            match self.documents.get(url) {
                Some(document) => Ok(FetchResponse {
                    status: 200,
                    content_type: Some("application/activity+json".to_string()),
                    body: Some(document.clone()),
                }),
                None => Ok(FetchResponse {
                    status: 404,
                    content_type: None,
                    body: None,
                }),
            }
        })
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a test server with a scripted actor fetcher.
    pub async fn with_fetcher(fetcher: Arc<dyn ActorFetcher>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let state = AppState::with_fetcher(config, fetcher).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = windward::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for the server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get full URL for a request path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

/// Test configuration on a scratch database.
///
/// Backoff is collapsed to zero and the attempt ceiling kept at the
/// default so retry tests run in milliseconds.
pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "localhost".to_string(),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        federation: config::FederationConfig {
            local_username: "admin".to_string(),
            user_agent: "Windward-Test/0.1.0".to_string(),
            request_timeout_seconds: 5,
            delivery_max_attempts: 3,
            delivery_backoff_seconds: 0,
            max_concurrent_deliveries: 4,
            actor_cache_ttl_seconds: 3600,
            signature_required_ttl_seconds: 3600,
            key_bits: 2048,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
