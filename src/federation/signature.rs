//! HTTP Signatures
//!
//! Builds and verifies HTTP message signatures and body digests for
//! federation requests. Signing and verification are pure CPU work;
//! key material is read-only after actor creation, so nothing here
//! needs locking.
//!
//! Signed header sets are fixed: POST requests sign
//! `(request-target) host date digest content-type`, GET requests sign
//! `(request-target) host date accept` (no digest, GET has no body).
//! Every failure maps to [`AppError::Signature`], which the dispatcher
//! turns into HTTP 401 -- a client-caused condition, never 5xx.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

/// Maximum allowed clock skew on the signed Date header.
const DATE_SKEW_SECS: i64 = 300;

/// Headers to add to a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (POST only)
    pub digest: Option<String>,
}

fn split_host_and_target(method: &str, url: &str) -> Result<(String, String), AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Signature(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Signature("Missing host in URL".to_string()))?;
    // A non-default port is part of the Host header the peer sees and
    // must be signed with it.
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = parsed_url.path();
    let path_and_query = if let Some(q) = parsed_url.query() {
        format!("{}?{}", path, q)
    } else {
        path.to_string()
    };

    Ok((host, format!("{} {}", method.to_lowercase(), path_and_query)))
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn sign_canonical_string(
    signing_string: &str,
    private_key_pem: &str,
) -> Result<String, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Signature(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

fn build_signature_header(key_id: &str, headers: &[&str], signature_b64: &str) -> String {
    format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers.join(" "),
        signature_b64
    )
}

/// Sign an outbound POST delivery.
///
/// Signs `(request-target) host date digest content-type`, with
/// `(request-target)` always first in the signed-headers list.
pub fn sign_post_request(
    url: &str,
    body: &[u8],
    content_type: &str,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let (host, request_target) = split_host_and_target("POST", url)?;
    let date = http_date_now();
    let digest = generate_digest(body);

    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
        format!("digest: {}", digest),
        format!("content-type: {}", content_type),
    ]
    .join("\n");

    let signature_b64 = sign_canonical_string(&signing_string, private_key_pem)?;
    let signature = build_signature_header(
        key_id,
        &["(request-target)", "host", "date", "digest", "content-type"],
        &signature_b64,
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest: Some(digest),
    })
}

/// Sign a GET fetch of a remote object or actor document.
///
/// Signs `(request-target) host date accept`; no digest, GET carries
/// no body.
pub fn sign_get_request(
    url: &str,
    accept: &str,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let (host, request_target) = split_host_and_target("GET", url)?;
    let date = http_date_now();

    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
        format!("accept: {}", accept),
    ]
    .join("\n");

    let signature_b64 = sign_canonical_string(&signing_string, private_key_pem)?;
    let signature = build_signature_header(
        key_id,
        &["(request-target)", "host", "date", "accept"],
        &signature_b64,
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest: None,
    })
}

/// Verify an inbound request signature
///
/// Reconstructs the canonical signing string from the set of headers
/// the `Signature` header declares, recomputes the body digest, and
/// verifies the RSA-SHA256 signature. Fails closed: any parse error,
/// missing header, digest mismatch, or cryptographic failure is an
/// [`AppError::Signature`].
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    // 1. Parse Signature header.
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Signature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    let mut required = vec!["(request-target)", "host", "date"];
    if body.is_some() {
        required.push("digest");
        required.push("content-type");
    } else if method.eq_ignore_ascii_case("GET") {
        required.push("accept");
    }
    for name in required {
        if !parsed.headers.iter().any(|h| h == name) {
            return Err(AppError::Signature(format!(
                "Signed headers must include: {}",
                name
            )));
        }
    }

    // 3. Verify Date is recent.
    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::Signature("Invalid Date format".to_string()))?;
    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > DATE_SKEW_SECS {
        return Err(AppError::Signature(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body {
        let expected_digest = generate_digest(body_data);
        if header_str(headers, "digest")? != expected_digest {
            return Err(AppError::Signature("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::new();
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" | "accept" => {
                header_str(headers, header_name)?.to_string()
            }
            _ => {
                return Err(AppError::Signature(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Signature("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Signature(format!("Invalid public key: {}", e)))?;

    // Use new_unprefixed for compatibility with widely-deployed peers.
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Signature(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Signature("Signature verification failed".to_string()))?;

    Ok(())
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Signature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Signature(format!("Invalid {} header", name)))
}

/// Extract keyId from the Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Validate that the signature keyId points to the same actor as the
/// activity's actor field.
pub fn key_id_matches_actor(key_id: &str, actor_uri: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_uri.split('#').next().unwrap_or(actor_uri);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Signature("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Signature("Missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Signature("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Signature("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest header value for a body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";
    const CONTENT_TYPE: &str = "application/activity+json";
    const ACCEPT: &str = "application/activity+json";

    fn generate_test_keypair() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
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

    fn path_and_query(url: &str) -> String {
        let parsed = url::Url::parse(url).expect("valid test url");
        match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        }
    }

    fn signed_post_headers(url: &str, body: &[u8], private_key_pem: &str) -> HeaderMap {
        let signed =
            sign_post_request(url, body, CONTENT_TYPE, private_key_pem, KEY_ID).expect("signed");
        let parsed = url::Url::parse(url).expect("valid test url");

        let mut headers = HeaderMap::new();
        headers.insert(
            "host",
            HeaderValue::from_str(parsed.host_str().unwrap()).unwrap(),
        );
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert(
            "digest",
            HeaderValue::from_str(signed.digest.as_deref().unwrap()).unwrap(),
        );
        headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE));
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());
        headers
    }

    fn signed_get_headers(url: &str, private_key_pem: &str) -> HeaderMap {
        let signed = sign_get_request(url, ACCEPT, private_key_pem, KEY_ID).expect("signed");
        let parsed = url::Url::parse(url).expect("valid test url");

        let mut headers = HeaderMap::new();
        headers.insert(
            "host",
            HeaderValue::from_str(parsed.host_str().unwrap()).unwrap(),
        );
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert("accept", HeaderValue::from_static(ACCEPT));
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());
        headers
    }

    #[test]
    fn post_signature_round_trips() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://remote.example/inbox?foo=bar";
        let headers = signed_post_headers(url, body, &private_key_pem);

        let result = verify_request(
            "POST",
            &path_and_query(url),
            &headers,
            Some(body),
            &public_key_pem,
        );
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn get_signature_round_trips_without_digest() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let url = "https://remote.example/users/alice";
        let headers = signed_get_headers(url, &private_key_pem);

        let result = verify_request("GET", &path_and_query(url), &headers, None, &public_key_pem);
        assert!(result.is_ok(), "valid GET signature should verify: {result:?}");
    }

    #[test]
    fn verify_rejects_tampered_body_digest() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://remote.example/inbox";
        let headers = signed_post_headers(url, body, &private_key_pem);

        let tampered = br#"{"type":"Delete"}"#;
        match verify_request(
            "POST",
            &path_and_query(url),
            &headers,
            Some(tampered),
            &public_key_pem,
        ) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Digest mismatch")),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_missing_date_header() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://remote.example/inbox";
        let mut headers = signed_post_headers(url, body, &private_key_pem);
        headers.remove("date");

        match verify_request(
            "POST",
            &path_and_query(url),
            &headers,
            Some(body),
            &public_key_pem,
        ) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Missing date header")),
            other => panic!("expected missing date header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (private_key_pem, _) = generate_test_keypair();
        let (_, other_public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://remote.example/inbox";
        let headers = signed_post_headers(url, body, &private_key_pem);

        match verify_request(
            "POST",
            &path_and_query(url),
            &headers,
            Some(body),
            &other_public_key_pem,
        ) {
            Err(AppError::Signature(msg)) => {
                assert!(msg.contains("Signature verification failed"))
            }
            other => panic!("expected verification failure, got: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_signature_missing_content_type_for_post() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://remote.example/inbox";
        let mut headers = signed_post_headers(url, body, &private_key_pem);

        let parsed =
            parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host date digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify_request(
            "POST",
            &path_and_query(url),
            &headers,
            Some(body),
            &public_key_pem,
        ) {
            Err(AppError::Signature(msg)) => {
                assert!(msg.contains("Signed headers must include: content-type"))
            }
            other => panic!("expected missing content-type error, got: {other:?}"),
        }
    }

    #[test]
    fn extract_signature_key_id_reads_key_id() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            HeaderValue::from_static(
                "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"ZmFrZQ==\"",
            ),
        );

        let key_id = extract_signature_key_id(&headers).expect("keyId should be parsed");
        assert_eq!(key_id, "https://remote.example/users/alice#main-key");
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn generate_digest_is_prefixed_base64_sha256() {
        let digest = generate_digest(b"hello");
        assert!(digest.starts_with("SHA-256="));
        assert_eq!(digest, format!("SHA-256={}", {
            use sha2::Digest as _;
            BASE64.encode(Sha256::digest(b"hello"))
        }));
    }
}
