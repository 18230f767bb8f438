/*!
Mock collector for endpoint-agent tests

Serves the two collector endpoints the agent talks to:
- `PUT /endpoint/{id}/register`: verifies the HMAC signature, remembers the
  agent public key and answers with a signed collector key
- `GET /endpoint/{id}/comm`: verifies the auth headers, upgrades to a
  websocket, opens every sealed record and seals pushed configuration

Behaviour can be bent per test with [`RegisterMode`],
[`MockCollector::close_after`] and [`MockCollector::stall_next`].
*/

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha512;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const NONCE_LEN: usize = 24;

/// How the register endpoint answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    Valid,
    /// Response signed with the wrong secret
    BadSignature,
    /// Response timestamp ten minutes in the past
    StaleTimestamp,
    /// 404 with no body
    NotFound,
    /// 400 with a structured error body
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
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

struct CollectorState {
    secret: String,
    secret_key: SecretKey,
    public_key: String,
    mode: Mutex<RegisterMode>,
    agent_key: Mutex<Option<PublicKey>>,
    records: Mutex<Vec<String>>,
    connections: AtomicUsize,
    rejected: AtomicUsize,
    close_after: Mutex<Option<usize>>,
    stall_next: Mutex<Option<Duration>>,
    comm_nonces: Mutex<Vec<String>>,
    outbound_tx: broadcast::Sender<Outbound>,
}

#[derive(Debug, Clone)]
enum Outbound {
    /// JSON sealed for the agent
    Conf(String),
    /// Bytes sent exactly as given
    Raw(Vec<u8>),
}

fn hmac_sha512(secret: &str, parts: &[&str]) -> Vec<u8> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(parts.join("&").as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn random_nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn decode_public_key(encoded: &str) -> Option<PublicKey> {
    let raw: [u8; 32] = STANDARD.decode(encoded).ok()?.try_into().ok()?;
    Some(PublicKey::from(raw))
}

fn error_body(status: StatusCode, error: &str, error_msg: &str) -> Response {
    (status, Json(json!({ "error": error, "error_msg": error_msg }))).into_response()
}

impl CollectorState {
    fn cipher(&self) -> Option<SalsaBox> {
        let agent_key = self.agent_key.lock().unwrap().clone()?;
        Some(SalsaBox::new(&agent_key, &self.secret_key))
    }
}

/// Seal `msg` as `nonce || ciphertext`
pub fn seal(cipher: &SalsaBox, msg: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut frame);
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&frame), msg)
        .expect("sealing in memory cannot fail");
    frame.extend_from_slice(&sealed);
    frame
}

pub fn open(cipher: &SalsaBox, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 32 {
        return Err(anyhow!("frame too short: {}", frame.len()));
    }
    let (nonce, body) = frame.split_at(NONCE_LEN);
    cipher
        .decrypt(GenericArray::from_slice(nonce), body)
        .map_err(|_| anyhow!("failed to open frame"))
}

async fn register(
    State(state): State<Arc<CollectorState>>,
    Path(id): Path<String>,
    Json(req): Json<RegisterData>,
) -> Response {
    let mode = *state.mode.lock().unwrap();
    match mode {
        RegisterMode::NotFound => return StatusCode::NOT_FOUND.into_response(),
        RegisterMode::Reject => {
            return error_body(StatusCode::BAD_REQUEST, "endpoint_disabled", "Endpoint is disabled")
        }
        _ => {}
    }

    let expected = STANDARD.encode(hmac_sha512(
        &state.secret,
        &[&req.timestamp.to_string(), &req.nonce, &req.public_key],
    ));
    if !bool::from(expected.as_bytes().ct_eq(req.signature.as_bytes())) {
        log::warn!("register {}: bad signature", id);
        return error_body(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid signature");
    }

    let Some(agent_key) = decode_public_key(&req.public_key) else {
        return error_body(StatusCode::BAD_REQUEST, "invalid_key", "Invalid public key");
    };
    *state.agent_key.lock().unwrap() = Some(agent_key);
    log::info!("register {}: agent key accepted", id);

    let mut timestamp = chrono::Utc::now().timestamp();
    if mode == RegisterMode::StaleTimestamp {
        timestamp -= 600;
    }
    let nonce = random_nonce(32);
    let secret = match mode {
        RegisterMode::BadSignature => "not-the-secret",
        _ => state.secret.as_str(),
    };
    let signature = STANDARD.encode(hmac_sha512(
        secret,
        &[&timestamp.to_string(), &nonce, &state.public_key],
    ));

    Json(RegisterData {
        timestamp,
        nonce,
        public_key: state.public_key.clone(),
        signature,
    })
    .into_response()
}

/// Nonce of a correctly signed comm request
fn verify_comm_headers(secret: &str, headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(timestamp), Some(nonce), Some(signature)) = (
        header("Pritunl-Endpoint-Timestamp"),
        header("Pritunl-Endpoint-Nonce"),
        header("Pritunl-Endpoint-Signature"),
    ) else {
        return None;
    };

    let expected = URL_SAFE.encode(hmac_sha512(secret, &[timestamp, nonce, "communicate"]));
    let valid: bool = expected.as_bytes().ct_eq(signature.as_bytes()).into();
    valid.then(|| nonce.to_string())
}

async fn comm(
    State(state): State<Arc<CollectorState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(nonce) = verify_comm_headers(&state.secret, &headers) else {
        state.rejected.fetch_add(1, Ordering::SeqCst);
        log::warn!("comm {}: bad auth headers", id);
        return error_body(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid signature");
    };
    state.comm_nonces.lock().unwrap().push(nonce);

    let Some(cipher) = state.cipher() else {
        state.rejected.fetch_add(1, Ordering::SeqCst);
        return error_body(StatusCode::NOT_FOUND, "endpoint_not_found", "Endpoint not registered");
    };

    ws.on_upgrade(move |socket| session(socket, state, cipher))
}

async fn session(mut socket: WebSocket, state: Arc<CollectorState>, cipher: SalsaBox) {
    let mut outbound_rx = state.outbound_tx.subscribe();
    let close_after = state.close_after.lock().unwrap().take();
    let stall = state.stall_next.lock().unwrap().take();
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut received = 0;

    if let Some(stall) = stall {
        // Never reading means pings are never answered
        log::info!("comm: stalling connection for {:?}", stall);
        tokio::time::sleep(stall).await;
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Binary(data))) => match open(&cipher, &data) {
                    Ok(plain) => {
                        state
                            .records
                            .lock()
                            .unwrap()
                            .push(String::from_utf8_lossy(&plain).into_owned());
                        received += 1;
                        if close_after.is_some_and(|limit| received >= limit) {
                            log::info!("comm: closing after {} records", received);
                            return;
                        }
                    }
                    Err(e) => log::warn!("comm: {}", e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            outbound = outbound_rx.recv() => match outbound {
                Ok(outbound) => {
                    let frame = match outbound {
                        Outbound::Conf(conf) => seal(&cipher, conf.as_bytes()),
                        Outbound::Raw(raw) => raw,
                    };
                    if socket.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// Loopback collector bound to an ephemeral port
pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
    handle: JoinHandle<()>,
}

impl MockCollector {
    pub async fn start(secret: &str) -> Result<Self> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let secret_key = SecretKey::from(raw);
        let public_key = STANDARD.encode(secret_key.public_key().as_bytes());
        let (outbound_tx, _) = broadcast::channel(16);

        let state = Arc::new(CollectorState {
            secret: secret.to_string(),
            secret_key,
            public_key,
            mode: Mutex::new(RegisterMode::Valid),
            agent_key: Mutex::new(None),
            records: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            close_after: Mutex::new(None),
            stall_next: Mutex::new(None),
            comm_nonces: Mutex::new(Vec::new()),
            outbound_tx,
        });

        let app = Router::new()
            .route("/endpoint/{id}/register", put(register))
            .route("/endpoint/{id}/comm", get(comm))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("mock collector stopped: {}", e);
            }
        });

        log::info!("mock collector listening on {}", addr);
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    /// `host:port` as stored in the agent config
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn public_key(&self) -> &str {
        &self.state.public_key
    }

    pub fn set_register_mode(&self, mode: RegisterMode) {
        *self.state.mode.lock().unwrap() = mode;
    }

    /// Accept an agent that registered out of band
    pub fn trust_agent(&self, public_key: &str) -> Result<()> {
        let key = decode_public_key(public_key).ok_or_else(|| anyhow!("invalid agent key"))?;
        *self.state.agent_key.lock().unwrap() = Some(key);
        Ok(())
    }

    pub fn agent_public_key(&self) -> Option<String> {
        self.state
            .agent_key
            .lock()
            .unwrap()
            .as_ref()
            .map(|key| STANDARD.encode(key.as_bytes()))
    }

    /// Decrypted records in arrival order, duplicates included
    pub fn records(&self) -> Vec<String> {
        self.state.records.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn rejected_connections(&self) -> usize {
        self.state.rejected.load(Ordering::SeqCst)
    }

    /// Drop the next connection once it delivered `records` records
    pub fn close_after(&self, records: usize) {
        *self.state.close_after.lock().unwrap() = Some(records);
    }

    /// Accept the next connection but never read from it for `duration`
    pub fn stall_next(&self, duration: Duration) {
        *self.state.stall_next.lock().unwrap() = Some(duration);
    }

    /// Auth nonces of accepted comm requests, oldest first
    pub fn comm_nonces(&self) -> Vec<String> {
        self.state.comm_nonces.lock().unwrap().clone()
    }

    /// Seal and send a configuration document to every open connection
    pub fn push_conf(&self, conf: &serde_json::Value) -> Result<usize> {
        self.push(Outbound::Conf(conf.to_string()))
    }

    /// Send `frame` unsealed to every open connection
    pub fn push_raw(&self, frame: &[u8]) -> Result<usize> {
        self.push(Outbound::Raw(frame.to_vec()))
    }

    fn push(&self, outbound: Outbound) -> Result<usize> {
        self.state
            .outbound_tx
            .send(outbound)
            .map_err(|_| anyhow!("no open connection"))
    }

    /// Wait until at least `count` records arrived
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.records();
            if records.len() >= count {
                return Ok(records);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "expected {} records, got {}",
                    count,
                    records.len()
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
