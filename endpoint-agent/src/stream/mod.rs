//! Encrypted duplex transport to the collector
//!
//! One [`Stream`] exists per process. Producers hand records to
//! [`Stream::append`]; a background loop started with [`Stream::run`] keeps a
//! websocket open, seals and writes records in tier order, and applies
//! configuration documents pushed by the collector.
//!
//! Connection lifecycle:
//! 1. Sign `timestamp&nonce&communicate` and upgrade `/endpoint/{id}/comm`
//! 2. Read and write halves run side by side until either fails; a due ping
//!    is always written ahead of queued records
//! 3. In-flight records are drained back into the secondary tier
//! 4. Sleep the reconnect delay and start over

pub mod buffer;
pub mod conf;

pub use buffer::{InFlight, TierQueue};
pub use conf::{ActiveConf, Check, CheckDefinition, Conf, Header, HttpMethod, ProbeKind};

use crate::config::{ConfigStore, Identity, TransportOptions};
use crate::crypto::{rand_str, sign_url, Sealer};
use crate::docs::Doc;
use crate::errors::{AgentError, ErrorData};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const TIMESTAMP_HEADER: &str = "pritunl-endpoint-timestamp";
pub const NONCE_HEADER: &str = "pritunl-endpoint-nonce";
pub const SIGNATURE_HEADER: &str = "pritunl-endpoint-signature";

/// Fixed last element of the signed connect string
pub const COMM_SCOPE: &str = "communicate";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where an appended record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Primary,
    Secondary,
    Dropped,
}

#[derive(Debug)]
struct Shared {
    primary: TierQueue,
    secondary: TierQueue,
    dropped: AtomicU64,
    conf: ActiveConf,
    store: Arc<ConfigStore>,
    options: TransportOptions,
}

/// Cheap to clone handle on the single transport
#[derive(Debug, Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    pub fn new(store: Arc<ConfigStore>, conf: ActiveConf) -> Self {
        let options = store.get().transport;
        let margin = options.overflow_margin;

        Self {
            shared: Arc::new(Shared {
                primary: TierQueue::new(options.primary_capacity, margin),
                secondary: TierQueue::new(options.secondary_capacity, margin),
                dropped: AtomicU64::new(0),
                conf,
                store,
                options,
            }),
        }
    }

    /// Configuration slot updated by inbound pushes
    pub fn conf(&self) -> &ActiveConf {
        &self.shared.conf
    }

    /// Stamp a record with the current time and queue it, never blocking
    pub fn append(&self, mut doc: Doc) -> Ingest {
        doc.set_timestamp(Utc::now());

        let doc = match self.shared.primary.try_push(doc) {
            Ok(()) => return Ingest::Primary,
            Err(doc) => doc,
        };

        match self.shared.secondary.try_push(doc) {
            Ok(()) => Ingest::Secondary,
            Err(doc) => {
                self.record_drop(&doc);
                Ingest::Dropped
            }
        }
    }

    /// Queue directly on the secondary tier, keeping the existing timestamp
    pub fn append_secondary(&self, doc: Doc) -> Ingest {
        match self.shared.secondary.try_push(doc) {
            Ok(()) => Ingest::Secondary,
            Err(doc) => {
                self.record_drop(&doc);
                Ingest::Dropped
            }
        }
    }

    fn record_drop(&self, doc: &Doc) {
        let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            doc_type = doc.type_tag(),
            dropped = total,
            "stream: Buffer full, dropping record"
        );
    }

    /// Records dropped because both tiers were full
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn primary_len(&self) -> usize {
        self.shared.primary.len()
    }

    pub fn secondary_len(&self) -> usize {
        self.shared.secondary.len()
    }

    /// Connection loop; never returns
    pub async fn run(self) {
        let options = &self.shared.options;
        let mut in_flight = InFlight::new(
            options.in_flight_capacity,
            options.overflow_margin,
            options.swap_interval(),
        );

        loop {
            if let Err(e) = self.connect_and_serve(&mut in_flight).await {
                error!(error = %e, kind = e.kind(), "stream: Connection error");
            }

            let recovered = self.recover(&mut in_flight);
            if recovered > 0 {
                info!(length = recovered, "stream: Recovered in-flight records");
            }

            tokio::time::sleep(options.reconnect_delay()).await;
        }
    }

    /// Move every unconfirmed record back to the secondary tier, oldest first
    pub fn recover(&self, in_flight: &mut InFlight) -> usize {
        let docs = in_flight.drain();
        let count = docs.len();
        for doc in docs {
            self.append_secondary(doc);
        }
        count
    }

    async fn connect_and_serve(&self, in_flight: &mut InFlight) -> Result<(), AgentError> {
        // Key material is re-read on every attempt so re-registration takes effect
        let identity = self.shared.store.get().identity()?;
        let sealer = Sealer::new(&identity.private_key, &identity.server_public_key)?;

        let socket = self.connect(&identity).await?;
        info!(host = %identity.remote_host, "stream: Connected");

        let (mut sink, source) = socket.split();
        let result = tokio::select! {
            res = self.read_loop(source, &sealer) => res,
            res = self.write_loop(&mut sink, in_flight, &sealer) => res,
        };

        let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        result
    }

    async fn connect(&self, identity: &Identity) -> Result<Socket, AgentError> {
        let options = &self.shared.options;
        let url = format!(
            "{}://{}/endpoint/{}/comm",
            options.ws_scheme(),
            identity.remote_host,
            identity.id
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::parse_with("stream: Failed to parse comm url", e))?;

        let timestamp = Utc::now().timestamp().to_string();
        let nonce = rand_str(64)?;
        let signature = sign_url(&identity.secret, &[&timestamp, &nonce, COMM_SCOPE])?;

        let headers = request.headers_mut();
        for (name, value) in [
            (TIMESTAMP_HEADER, timestamp),
            (NONCE_HEADER, nonce),
            (SIGNATURE_HEADER, signature),
        ] {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| AgentError::parse_with("stream: Invalid auth header", e))?;
            headers.insert(name, value);
        }

        match timeout(options.handshake_timeout(), connect_async(request)).await {
            Err(_) => Err(AgentError::timeout("stream: Connection handshake timed out")),
            Ok(Err(WsError::Http(resp))) => {
                let status = resp.status();
                let data: ErrorData = resp
                    .body()
                    .as_deref()
                    .and_then(|body| serde_json::from_slice(body).ok())
                    .unwrap_or_default();
                error!(
                    status = status.as_u16(),
                    server_error = %data.error,
                    server_error_msg = %data.message,
                    "stream: Collector rejected connection"
                );
                Err(AgentError::connection(
                    "stream: Bad response status",
                    status.as_u16(),
                ))
            }
            Ok(Err(e)) => Err(AgentError::connection("stream: Failed to connect", e)),
            Ok(Ok((socket, _))) => Ok(socket),
        }
    }

    /// Inbound side: liveness acks and sealed configuration pushes
    async fn read_loop(
        &self,
        mut source: SplitStream<Socket>,
        sealer: &Sealer,
    ) -> Result<(), AgentError> {
        let wait = self.shared.options.ping_wait();
        let mut deadline = Instant::now() + wait;

        loop {
            let msg = match timeout_at(deadline, source.next()).await {
                Err(_) => return Err(AgentError::timeout("stream: Read deadline exceeded")),
                Ok(None) => {
                    return Err(AgentError::read("stream: Failed to read message", "closed"))
                }
                Ok(Some(Err(e))) => {
                    return Err(AgentError::read("stream: Failed to read message", e))
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Pong(_) => deadline = Instant::now() + wait,
                Message::Binary(data) => self.handle_conf(sealer, &data),
                Message::Text(text) => self.handle_conf(sealer, text.as_bytes()),
                Message::Close(frame) => {
                    return Err(AgentError::read(
                        "stream: Connection closed by collector",
                        format!("{:?}", frame),
                    ))
                }
                _ => {}
            }
        }
    }

    fn handle_conf(&self, sealer: &Sealer, frame: &[u8]) {
        match decode_conf(sealer, frame) {
            Ok(conf) => {
                info!(checks = conf.checks().len(), "stream: Received conf");
                self.shared.conf.replace(conf);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    kind = e.kind(),
                    length = frame.len(),
                    "stream: Failed to process conf message"
                );
            }
        }
    }

    /// Outbound side: a due liveness probe first, then primary, then secondary
    async fn write_loop(
        &self,
        sink: &mut SplitSink<Socket, Message>,
        in_flight: &mut InFlight,
        sealer: &Sealer,
    ) -> Result<(), AgentError> {
        let period = self.shared.options.ping_interval();
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let msg = tokio::select! {
                biased;
                _ = ping.tick() => Some(Message::Ping(Vec::new())),
                doc = self.shared.primary.recv() => seal_doc(doc, in_flight, sealer)?,
                doc = self.shared.secondary.recv() => seal_doc(doc, in_flight, sealer)?,
            };

            if let Some(msg) = msg {
                self.send(sink, msg).await?;
            }
        }
    }

    async fn send(
        &self,
        sink: &mut SplitSink<Socket, Message>,
        msg: Message,
    ) -> Result<(), AgentError> {
        match timeout(self.shared.options.write_timeout(), sink.send(msg)).await {
            Err(_) => Err(AgentError::timeout("stream: Write deadline exceeded")),
            Ok(Err(e)) => Err(AgentError::write("stream: Failed to write message", e)),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Encode, track in flight and seal one record
///
/// A record that cannot be encoded is dropped here. Once tracked, any later
/// failure leaves it in `in_flight` for recovery.
fn seal_doc(
    doc: Doc,
    in_flight: &mut InFlight,
    sealer: &Sealer,
) -> Result<Option<Message>, AgentError> {
    let data = match doc.encode() {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, doc_type = doc.type_tag(), "stream: Failed to encode record");
            return Ok(None);
        }
    };

    in_flight.record(doc);
    let frame = sealer.seal(&data)?;
    debug!(length = frame.len(), "stream: Sending record");
    Ok(Some(Message::Binary(frame)))
}

fn decode_conf(sealer: &Sealer, frame: &[u8]) -> Result<Conf, AgentError> {
    let data = sealer.open(frame)?;
    serde_json::from_slice(&data).map_err(|e| AgentError::parse_with("stream: Failed to parse conf", e))
}
