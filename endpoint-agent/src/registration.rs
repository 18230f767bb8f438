//! Registration handshake with the collector
//!
//! Generates a fresh box key pair, sends the signed public key with a PUT to
//! `/endpoint/{id}/register` and verifies the signed reply before trusting
//! the collector's public key. Also parses the registration keys an operator
//! hands to the `register` command.

use crate::config::{ConfigData, ConfigStore};
use crate::crypto::{constant_time_eq, rand_str, sign, KeyPair};
use crate::errors::{AgentError, ErrorData};
use crate::nonce::NonceValidator;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "endpoint-agent";
const TIMESTAMP_WINDOW: i64 = 300;
const MIN_URI_PATH: usize = 32;

/// Request and response body of the register call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterData {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub signature: String,
}

impl RegisterData {
    fn auth_parts(&self) -> [String; 3] {
        [
            self.timestamp.to_string(),
            self.nonce.clone(),
            self.public_key.clone(),
        ]
    }

    /// Signed request for `public_key` at `timestamp`
    pub fn signed(secret: &str, timestamp: i64, nonce: String, public_key: String) -> Result<Self, AgentError> {
        let mut data = Self {
            timestamp,
            nonce,
            public_key,
            signature: String::new(),
        };
        let parts = data.auth_parts();
        data.signature = sign(secret, &[&parts[0], &parts[1], &parts[2]])?;
        Ok(data)
    }
}

/// Check a register response against the shared secret
///
/// Bounds are tested before the nonce is recorded, and the nonce is recorded
/// before the signature is compared.
pub fn verify_response(
    secret: &str,
    resp: &RegisterData,
    now: i64,
    nonces: &NonceValidator,
) -> Result<(), AgentError> {
    if !(16..=128).contains(&resp.nonce.len()) {
        return Err(AgentError::authentication(
            "endpoint: Invalid authentication nonce",
        ));
    }

    if !(16..=512).contains(&resp.public_key.len()) {
        return Err(AgentError::authentication("endpoint: Invalid public key"));
    }

    if (now - resp.timestamp).abs() > TIMESTAMP_WINDOW {
        return Err(AgentError::authentication(
            "endpoint: Authentication timestamp outside window",
        ));
    }

    nonces.validate(&resp.nonce)?;

    let parts = resp.auth_parts();
    let expected = sign(secret, &[&parts[0], &parts[1], &parts[2]])?;
    if !constant_time_eq(&expected, &resp.signature) {
        return Err(AgentError::authentication(
            "endpoint: Response signature invalid",
        ));
    }

    Ok(())
}

fn client() -> Result<reqwest::Client, AgentError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .pool_max_idle_per_host(0)
        .no_proxy()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| AgentError::request_with("endpoint: Failed to build client", e))
}

/// Run the handshake and persist the new key material
pub async fn register(store: &ConfigStore, nonces: &NonceValidator) -> Result<(), AgentError> {
    let data = store.get();
    data.validate_registration()?;
    let host = data.remote_host().unwrap_or_default();

    let keys = KeyPair::generate()?;
    let req_data = RegisterData::signed(
        &data.secret,
        Utc::now().timestamp(),
        rand_str(64)?,
        keys.public_key.clone(),
    )?;

    let url = format!(
        "{}://{}/endpoint/{}/register",
        data.transport.http_scheme(),
        host,
        data.id
    );

    let resp = client()?
        .put(&url)
        .json(&req_data)
        .send()
        .await
        .map_err(|e| AgentError::request_with("endpoint: Request put error", e))?;

    let status = resp.status();
    if status != StatusCode::OK {
        if status == StatusCode::NOT_FOUND {
            error!(
                error_code = "endpoint_not_found",
                error_msg = "Endpoint does not exist",
                "endpoint: Register error"
            );
        } else if status.is_client_error() {
            if let Ok(err_data) = resp.json::<ErrorData>().await {
                error!(
                    error_code = %err_data.error,
                    error_msg = %err_data.message,
                    "endpoint: Register error"
                );
            }
        }
        return Err(AgentError::request(format!(
            "endpoint: Bad status {} code from server",
            status.as_u16()
        )));
    }

    let resp_data: RegisterData = resp
        .json()
        .await
        .map_err(|e| AgentError::parse_with("endpoint: Failed to parse response body", e))?;

    verify_response(&data.secret, &resp_data, Utc::now().timestamp(), nonces)?;

    store.set(|c| {
        c.public_key = keys.public_key;
        c.private_key = keys.private_key;
        c.server_public_key = resp_data.public_key;
    });
    store.save().await?;

    info!(endpoint_id = %data.id, host = %host, "endpoint: Registered with collector");
    Ok(())
}

/// Ensure key material exists, registering when any of it is missing
pub async fn init(store: &ConfigStore, nonces: &NonceValidator) -> Result<(), AgentError> {
    let data = store.get();
    data.validate_registration()?;

    if !data.needs_registration() {
        return Ok(());
    }

    register(store, nonces).await
}

/// Host and `{id}_{secret}` pair supplied by an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationKey {
    pub host: String,
    pub id: String,
    pub secret: String,
}

fn split_key(key: &str, msg: &str) -> Result<(String, String), AgentError> {
    let parts: Vec<&str> = key.split('_').collect();
    match parts.as_slice() {
        [id, secret] => Ok((id.to_string(), secret.to_string())),
        _ => Err(AgentError::parse(msg)),
    }
}

impl RegistrationKey {
    /// Parse `https://{host}/{id}_{secret}`
    pub fn from_uri(uri: &str) -> Result<Self, AgentError> {
        let url = Url::parse(uri)
            .map_err(|e| AgentError::parse_with("endpoint: Failed to parse register uri", e))?;

        let path = url.path();
        if path.len() < MIN_URI_PATH {
            return Err(AgentError::parse("endpoint: Invalid register key in uri"));
        }
        let (id, secret) = split_key(&path[1..], "endpoint: Invalid register key in uri")?;

        let host = host_with_port(&url)
            .ok_or_else(|| AgentError::parse("endpoint: Invalid hostname"))?;

        Ok(Self { host, id, secret })
    }

    /// Parse a bare hostname (or `https://` URL) plus a registration key
    pub fn from_parts(host: &str, key: &str) -> Result<Self, AgentError> {
        let host = host.trim();
        let host = if host.starts_with("https://") {
            let url = Url::parse(host)
                .map_err(|e| AgentError::parse_with("endpoint: Failed to parse input", e))?;
            host_with_port(&url).unwrap_or_default()
        } else {
            host.to_string()
        };

        if host.is_empty() {
            return Err(AgentError::parse("endpoint: Invalid hostname"));
        }

        let key = key.trim();
        if key.is_empty() {
            return Err(AgentError::parse("endpoint: Invalid registration key"));
        }
        let (id, secret) = split_key(key, "endpoint: Invalid register key")?;

        Ok(Self { host, id, secret })
    }

    /// Store the key and clear key material so the next start registers
    pub fn apply(&self, data: &mut ConfigData) {
        data.remote_hosts = vec![self.host.clone()];
        data.id = self.id.clone();
        data.secret = self.secret.clone();
        data.public_key.clear();
        data.private_key.clear();
        data.server_public_key.clear();
    }
}

fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Persist a registration key, used by the `register` command
pub async fn save_registration_key(
    store: &ConfigStore,
    key: &RegistrationKey,
) -> Result<(), AgentError> {
    store.set(|c| key.apply(c));
    store.save().await?;

    info!(
        endpoint_id = %key.id,
        remote_host = %key.host,
        "endpoint: Registration key saved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "registration-secret";
    const NOW: i64 = 1_700_000_000;

    fn response(nonce: &str, public_key: &str, timestamp: i64) -> RegisterData {
        RegisterData::signed(SECRET, timestamp, nonce.to_string(), public_key.to_string()).unwrap()
    }

    fn valid() -> RegisterData {
        response(&"n".repeat(32), &"k".repeat(44), NOW)
    }

    #[test]
    fn test_valid_response_accepted() {
        let nonces = NonceValidator::new();
        assert!(verify_response(SECRET, &valid(), NOW, &nonces).is_ok());
        assert!(verify_response(SECRET, &response(&"a".repeat(16), &"k".repeat(16), NOW + 300), NOW, &nonces).is_ok());
        assert!(verify_response(SECRET, &response(&"b".repeat(128), &"k".repeat(512), NOW - 300), NOW, &nonces).is_ok());
    }

    #[test]
    fn test_nonce_length_rejected() {
        let nonces = NonceValidator::new();
        let err = verify_response(SECRET, &response(&"n".repeat(15), &"k".repeat(44), NOW), NOW, &nonces).unwrap_err();
        assert_eq!(err.kind(), "authentication");
        assert!(verify_response(SECRET, &response(&"n".repeat(129), &"k".repeat(44), NOW), NOW, &nonces).is_err());
    }

    #[test]
    fn test_public_key_length_rejected() {
        let nonces = NonceValidator::new();
        assert!(verify_response(SECRET, &response(&"n".repeat(32), &"k".repeat(15), NOW), NOW, &nonces).is_err());
        assert!(verify_response(SECRET, &response(&"m".repeat(32), &"k".repeat(513), NOW), NOW, &nonces).is_err());
    }

    #[test]
    fn test_timestamp_window_rejected() {
        let nonces = NonceValidator::new();
        assert!(verify_response(SECRET, &response(&"n".repeat(32), &"k".repeat(44), NOW - 301), NOW, &nonces).is_err());
        assert!(verify_response(SECRET, &response(&"m".repeat(32), &"k".repeat(44), NOW + 301), NOW, &nonces).is_err());
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let nonces = NonceValidator::new();
        assert!(verify_response(SECRET, &valid(), NOW, &nonces).is_ok());
        let err = verify_response(SECRET, &valid(), NOW, &nonces).unwrap_err();
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn test_bad_signature_rejected() {
        let nonces = NonceValidator::new();
        let mut resp = valid();
        resp.signature = sign("other-secret", &[&NOW.to_string(), &resp.nonce, &resp.public_key]).unwrap();
        assert!(verify_response(SECRET, &resp, NOW, &nonces).is_err());

        let mut resp = response(&"x".repeat(32), &"k".repeat(44), NOW);
        resp.public_key = "j".repeat(44);
        assert!(verify_response(SECRET, &resp, NOW, &nonces).is_err());
    }

    #[test]
    fn test_key_from_uri() {
        let key = RegistrationKey::from_uri(
            "https://zero.example.com/5f3c1a2b9d8e7f60_0123456789abcdef0123",
        )
        .unwrap();
        assert_eq!(key.host, "zero.example.com");
        assert_eq!(key.id, "5f3c1a2b9d8e7f60");
        assert_eq!(key.secret, "0123456789abcdef0123");

        let with_port =
            RegistrationKey::from_uri("https://127.0.0.1:9443/5f3c1a2b9d8e7f60_0123456789abcdef01").unwrap();
        assert_eq!(with_port.host, "127.0.0.1:9443");

        assert!(RegistrationKey::from_uri("https://zero.example.com/short_key").is_err());
        assert!(RegistrationKey::from_uri(
            "https://zero.example.com/5f3c1a2b9d8e7f60_0123456789_abcdef0123"
        )
        .is_err());
        assert!(RegistrationKey::from_uri("not a uri").is_err());
    }

    #[test]
    fn test_key_from_parts() {
        let key = RegistrationKey::from_parts("https://zero.example.com/", "abc_def").unwrap();
        assert_eq!(key.host, "zero.example.com");
        assert_eq!(key.secret, "def");

        assert!(RegistrationKey::from_parts("", "abc_def").is_err());
        assert!(RegistrationKey::from_parts("zero.example.com", "").is_err());
        assert!(RegistrationKey::from_parts("zero.example.com", "abcdef").is_err());
    }

    #[test]
    fn test_apply_clears_key_material() {
        let mut data = ConfigData {
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
            server_public_key: "srv".to_string(),
            ..Default::default()
        };
        RegistrationKey::from_parts("zero.example.com", "abc_def")
            .unwrap()
            .apply(&mut data);

        assert_eq!(data.remote_hosts, vec!["zero.example.com".to_string()]);
        assert!(data.needs_registration());
        assert!(data.public_key.is_empty() && data.server_public_key.is_empty());
        assert!(data.validate_registration().is_ok());
    }
}
