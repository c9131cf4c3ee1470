//! Minimal ACME (RFC 8555) client for HTTP-01 certificate provisioning
//!
//! Signs JWS requests with a P-256 account key and answers challenges from
//! the plain-HTTP listener via the shared [`ChallengeStore`]. Only the
//! http-01 flow is implemented; that is all a single-host PaaS needs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{FaztError, Result};

/// Pending http-01 challenges: token -> key authorization
#[derive(Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.clone())
    }

    fn put(&self, token: String, key_auth: String) {
        self.tokens.insert(token, key_auth);
    }

    fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }
}

/// Provisioned certificate material in PEM form
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// ACME account client
pub struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
    contact_email: String,
    account_key: SigningKey,
    account_kid: tokio::sync::Mutex<Option<String>>,
}

struct AcmeResponse {
    body: Value,
    headers: std::collections::HashMap<String, String>,
}

impl AcmeClient {
    pub fn new(directory_url: &str, contact_email: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            directory_url: directory_url.to_string(),
            contact_email: contact_email.to_string(),
            account_key: SigningKey::random(&mut rand::rngs::OsRng),
            account_kid: tokio::sync::Mutex::new(None),
        }
    }

    /// Provision a certificate for one domain via http-01.
    ///
    /// `challenges` must be consulted by the port-80 listener for
    /// `/.well-known/acme-challenge/{token}` while this runs.
    pub async fn provision(&self, domain: &str, challenges: &ChallengeStore) -> Result<IssuedCert> {
        let directory = self.fetch_directory().await?;
        let new_nonce = directory_str(&directory, "newNonce")?;
        let new_account = directory_str(&directory, "newAccount")?;
        let new_order = directory_str(&directory, "newOrder")?;

        let mut nonce = self.fresh_nonce(&new_nonce).await?;

        // Account registration is idempotent for the same key
        let kid = {
            let mut cached = self.account_kid.lock().await;
            match cached.clone() {
                Some(kid) => kid,
                None => {
                    let payload = json!({
                        "termsOfServiceAgreed": true,
                        "contact": [format!("mailto:{}", self.contact_email)],
                    });
                    let (response, next_nonce) = self
                        .post_jws(&new_account, &payload, &nonce, None)
                        .await?;
                    nonce = next_nonce;
                    let kid = response
                        .headers
                        .get("location")
                        .cloned()
                        .ok_or_else(|| acme_err("newAccount response missing Location"))?;
                    *cached = Some(kid.clone());
                    kid
                }
            }
        };

        // Order for a single identifier
        let order_payload = json!({
            "identifiers": [{"type": "dns", "value": domain}],
        });
        let (order, next_nonce) = self
            .post_jws(&new_order, &order_payload, &nonce, Some(&kid))
            .await?;
        nonce = next_nonce;
        let order_url = order
            .headers
            .get("location")
            .cloned()
            .ok_or_else(|| acme_err("newOrder response missing Location"))?;
        let authz_url = order.body["authorizations"]
            .get(0)
            .and_then(|a| a.as_str())
            .ok_or_else(|| acme_err("order has no authorizations"))?
            .to_string();
        let finalize_url = order.body["finalize"]
            .as_str()
            .ok_or_else(|| acme_err("order has no finalize URL"))?
            .to_string();

        // Fetch the authorization and pick its http-01 challenge
        let (authz, next_nonce) = self
            .post_jws(&authz_url, &Value::Null, &nonce, Some(&kid))
            .await?;
        nonce = next_nonce;
        let challenge = authz.body["challenges"]
            .as_array()
            .and_then(|cs| cs.iter().find(|c| c["type"] == "http-01"))
            .ok_or_else(|| acme_err("no http-01 challenge offered"))?;
        let token = challenge["token"]
            .as_str()
            .ok_or_else(|| acme_err("challenge missing token"))?
            .to_string();
        let challenge_url = challenge["url"]
            .as_str()
            .ok_or_else(|| acme_err("challenge missing url"))?
            .to_string();

        let key_auth = format!("{token}.{}", self.key_thumbprint());
        challenges.put(token.clone(), key_auth);
        debug!(domain, "http-01 challenge staged");

        // Tell the CA to validate, then poll the authorization
        let (_, next_nonce) = self
            .post_jws(&challenge_url, &json!({}), &nonce, Some(&kid))
            .await?;
        nonce = next_nonce;
        nonce = self
            .poll_status(&authz_url, &nonce, &kid, "valid", 20)
            .await?;
        challenges.remove(&token);

        // Finalize with a fresh key and CSR, then download the chain
        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| acme_err(&format!("key generation: {e}")))?;
        let csr_der = rcgen::CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| acme_err(&format!("csr params: {e}")))?
            .serialize_request(&cert_key)
            .map_err(|e| acme_err(&format!("csr: {e}")))?;
        let finalize_payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der.der()) });
        let (_, next_nonce) = self
            .post_jws(&finalize_url, &finalize_payload, &nonce, Some(&kid))
            .await?;
        nonce = next_nonce;
        nonce = self
            .poll_status(&order_url, &nonce, &kid, "valid", 20)
            .await?;

        let (order, next_nonce) = self
            .post_jws(&order_url, &Value::Null, &nonce, Some(&kid))
            .await?;
        nonce = next_nonce;
        let cert_url = order.body["certificate"]
            .as_str()
            .ok_or_else(|| acme_err("order has no certificate URL"))?
            .to_string();
        let (cert, _, _) = self
            .post_jws_raw(&cert_url, &Value::Null, &nonce, Some(&kid))
            .await?;

        info!(domain, "certificate issued");
        Ok(IssuedCert {
            cert_pem: cert,
            key_pem: cert_key.serialize_pem(),
        })
    }

    async fn fetch_directory(&self) -> Result<Value> {
        self.http
            .get(&self.directory_url)
            .send()
            .await
            .map_err(|e| acme_err(&format!("directory fetch: {e}")))?
            .json()
            .await
            .map_err(|e| acme_err(&format!("directory body: {e}")))
    }

    async fn fresh_nonce(&self, new_nonce_url: &str) -> Result<String> {
        let response = self
            .http
            .head(new_nonce_url)
            .send()
            .await
            .map_err(|e| acme_err(&format!("nonce fetch: {e}")))?;
        nonce_from(response.headers()).ok_or_else(|| acme_err("no Replay-Nonce header"))
    }

    /// Poll a resource until its status field matches, returning the last
    /// usable nonce.
    async fn poll_status(
        &self,
        url: &str,
        nonce: &str,
        kid: &str,
        wanted: &str,
        attempts: u32,
    ) -> Result<String> {
        let mut nonce = nonce.to_string();
        for _ in 0..attempts {
            let (response, next_nonce) = self.post_jws(url, &Value::Null, &nonce, Some(kid)).await?;
            nonce = next_nonce;
            match response.body["status"].as_str() {
                Some(s) if s == wanted => return Ok(nonce),
                Some("invalid") => {
                    return Err(acme_err(&format!(
                        "authorization failed: {}",
                        response.body
                    )))
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
        Err(acme_err("validation polling timed out"))
    }

    /// POST a signed JWS; parse the body as JSON
    async fn post_jws(
        &self,
        url: &str,
        payload: &Value,
        nonce: &str,
        kid: Option<&str>,
    ) -> Result<(AcmeResponse, String)> {
        let (body, next_nonce, headers) = self.post_jws_raw(url, payload, nonce, kid).await?;
        let parsed: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(Value::Null)
        };
        Ok((
            AcmeResponse {
                body: parsed,
                headers,
            },
            next_nonce,
        ))
    }

    /// POST a signed JWS; return the raw body (certificate downloads)
    async fn post_jws_raw(
        &self,
        url: &str,
        payload: &Value,
        nonce: &str,
        kid: Option<&str>,
    ) -> Result<(String, String, std::collections::HashMap<String, String>)> {
        let protected = match kid {
            Some(kid) => json!({
                "alg": "ES256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => json!({
                "alg": "ES256",
                "jwk": self.jwk(),
                "nonce": nonce,
                "url": url,
            }),
        };
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
        // POST-as-GET uses an empty payload
        let payload_b64 = if payload.is_null() {
            String::new()
        } else {
            URL_SAFE_NO_PAD.encode(payload.to_string())
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature: Signature = self.account_key.sign(signing_input.as_bytes());
        let jws = json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        });

        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(jws.to_string())
            .send()
            .await
            .map_err(|e| acme_err(&format!("POST {url}: {e}")))?;

        let next_nonce =
            nonce_from(response.headers()).ok_or_else(|| acme_err("response missing nonce"))?;

        let mut headers = std::collections::HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), v.to_string());
            }
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| acme_err(&format!("body read: {e}")))?;
        if status.is_client_error() || status.is_server_error() {
            return Err(acme_err(&format!("{url} returned {status}: {body}")));
        }
        Ok((body, next_nonce, headers))
    }

    /// Public account key as a JWK
    fn jwk(&self) -> Value {
        let point = self.account_key.verifying_key().to_encoded_point(false);
        json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point")),
            "y": URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point")),
        })
    }

    /// RFC 7638 JWK thumbprint used in key authorizations
    fn key_thumbprint(&self) -> String {
        let jwk = self.jwk();
        // Thumbprint input must have lexicographically ordered keys
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            jwk["x"].as_str().expect("jwk x"),
            jwk["y"].as_str().expect("jwk y"),
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

fn directory_str(directory: &Value, key: &str) -> Result<String> {
    directory[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| acme_err(&format!("directory missing {key}")))
}

fn nonce_from(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("replay-nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn acme_err(msg: &str) -> FaztError {
    FaztError::CertProvision(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_store_round_trip() {
        let store = ChallengeStore::new();
        store.put("tok".into(), "tok.thumb".into());
        assert_eq!(store.answer("tok").unwrap(), "tok.thumb");
        store.remove("tok");
        assert!(store.answer("tok").is_none());
    }

    #[test]
    fn thumbprint_is_stable_for_a_key() {
        let client = AcmeClient::new("https://example.org/dir", "ops@example.org");
        let a = client.key_thumbprint();
        let b = client.key_thumbprint();
        assert_eq!(a, b);
        assert!(!a.contains('='), "thumbprint must be unpadded base64url");
    }

    #[test]
    fn jwk_has_ec_shape() {
        let client = AcmeClient::new("https://example.org/dir", "ops@example.org");
        let jwk = client.jwk();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert!(jwk["x"].as_str().unwrap().len() > 20);
    }
}
