//! Broker session management
//!
//! The session owns the connection lifecycle towards the MQTT broker and the
//! policy that decides when to (re)connect. Connection state lives in a
//! process-wide [`ConnectionRegister`] that both the session and the broker
//! event callback advance through a fixed transition table:
//!
//! ```text
//!            ConnectRequested          Acknowledged
//!   Idle ─────────────────────▶ Connecting ───────────▶ Connected
//!    ▲                             │  ▲                     │
//!    │                ConnectFailed│  │ConnectRequested     │ Lost / Teardown
//!    │                             ▼  │                     │
//!    │                           Failed                     │
//!    └──────────────────────────────────────────────────────┘
//! ```
//!
//! Connect and publish calls are blocking and run on the calling task.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::reading::FilteredReading;
use crate::telemetry::{format_envelope, format_scalar, Field};
use crate::topics::TopicNamespace;

/// Configured connection policy, consulted on every publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Telemetry suppressed, publishes succeed without touching the network
    Disabled,
    /// Connect once, never reconnect
    ConnectNoReconnect,
    /// Reconnect on the next publish after any loss
    #[default]
    AutoReconnect,
}

impl ConnectionMode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ConnectionMode::Disabled),
            1 => Some(ConnectionMode::ConnectNoReconnect),
            2 => Some(ConnectionMode::AutoReconnect),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ConnectionMode::Disabled => 0,
            ConnectionMode::ConnectNoReconnect => 1,
            ConnectionMode::AutoReconnect => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Idle,
        }
    }
}

/// Inputs that move the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    Acknowledged,
    ConnectFailed,
    Lost,
    Teardown,
}

/// Transition table; `None` for events that are not legal in `state`
pub fn next_state(state: ConnectionState, event: LinkEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use LinkEvent::*;

    match (state, event) {
        (Idle, ConnectRequested) | (Failed, ConnectRequested) => Some(Connecting),
        (Connecting, Acknowledged) => Some(Connected),
        (Connecting, ConnectFailed) => Some(Failed),
        (Connected, Lost) | (Connected, Teardown) => Some(Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition: {event:?} in state {state:?}")]
pub struct IllegalTransition {
    pub state: ConnectionState,
    pub event: LinkEvent,
}

/// Process-wide connection state
///
/// Written by the session and the broker event callback, read by every task.
#[derive(Debug)]
pub struct ConnectionRegister {
    state: AtomicU8,
}

impl Default for ConnectionRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegister {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Idle as u8),
        }
    }

    pub fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Apply `event` atomically, returning the new state
    pub fn apply(&self, event: LinkEvent) -> Result<ConnectionState, IllegalTransition> {
        let mut observed = self.state.load(Ordering::SeqCst);
        loop {
            let state = ConnectionState::from_u8(observed);
            let Some(next) = next_state(state, event) else {
                debug!("MQTT state: ignoring {:?} in {:?}", event, state);
                return Err(IllegalTransition { state, event });
            };
            match self.state.compare_exchange(
                observed,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!("MQTT state: {:?} -> {:?} ({:?})", state, next, event);
                    return Ok(next);
                }
                Err(actual) => observed = actual,
            }
        }
    }
}

/// Network readiness signal, raised by the Wi-Fi layer once an IP is bound
#[derive(Debug, Default)]
pub struct NetworkReady(AtomicBool);

impl NetworkReady {
    pub fn new(ready: bool) -> Self {
        Self(AtomicBool::new(ready))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Broker URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportScheme {
    #[default]
    Tcp,
    Tls,
    WebSocket,
    SecureWebSocket,
}

impl TransportScheme {
    /// Accepts the URL scheme names plus the `tcp` / `ssl` aliases
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(TransportScheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(TransportScheme::Tls),
            "ws" => Some(TransportScheme::WebSocket),
            "wss" => Some(TransportScheme::SecureWebSocket),
            _ => None,
        }
    }

    pub fn url_scheme(self) -> &'static str {
        match self {
            TransportScheme::Tcp => "mqtt",
            TransportScheme::Tls => "mqtts",
            TransportScheme::WebSocket => "ws",
            TransportScheme::SecureWebSocket => "wss",
        }
    }

    pub fn requires_encryption(self) -> bool {
        matches!(
            self,
            TransportScheme::Tls | TransportScheme::SecureWebSocket
        )
    }
}

/// Broker address and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: TransportScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
}

impl BrokerEndpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme.url_scheme(), self.host, self.port)
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("url", &self.url())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Message the broker publishes on our behalf if the session drops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: &'static str,
    pub retain: bool,
}

/// Everything the transport needs for one connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub url: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM trust anchor; always present for encrypted schemes
    pub trust_anchor: Option<String>,
    pub last_will: Option<LastWill>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out waiting for broker acknowledgement")]
    Timeout,
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("not connected")]
    NotConnected,
    #[error("trust anchor storage: {0}")]
    Storage(String),
}

/// Loader/saver for the broker CA certificate at its well-known location
pub trait TrustAnchorStore {
    fn load(&self) -> Result<Option<String>, TransportError>;
    fn save(&self, pem: &str) -> Result<(), TransportError>;
}

/// Store for deployments that only ever use plaintext brokers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrustAnchor;

impl TrustAnchorStore for NoTrustAnchor {
    fn load(&self) -> Result<Option<String>, TransportError> {
        Ok(None)
    }

    fn save(&self, _pem: &str) -> Result<(), TransportError> {
        Err(TransportError::Storage("no trust anchor storage".into()))
    }
}

/// MQTT client binding
///
/// `connect` blocks until the broker acknowledged or the attempt failed. The
/// implementation forwards broker lifecycle events (loss of connection in
/// particular) to `register`.
pub trait BrokerTransport {
    fn connect(
        &mut self,
        options: &ConnectOptions,
        register: &Arc<ConnectionRegister>,
    ) -> Result<(), TransportError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Stop and release the client
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("network not ready")]
    NetworkDown,
    #[error("connection lost and reconnect is disabled")]
    ReconnectDisabled,
    #[error("encrypted transport requested but no trust anchor is stored")]
    MissingTrustAnchor,
    #[error("connection attempt already in progress")]
    Busy,
    #[error(transparent)]
    Connect(TransportError),
    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        source: TransportError,
    },
    #[error("encoding {what} failed: {reason}")]
    Encode { what: &'static str, reason: String },
    #[error("{failed} of {attempted} publishes failed")]
    PartialPublish { failed: usize, attempted: usize },
}

/// Publish counters, shared with the status monitor
#[derive(Debug, Default)]
pub struct PublishStats {
    published: AtomicU32,
    failed: AtomicU32,
    connects: AtomicU32,
}

impl PublishStats {
    pub fn published(&self) -> u32 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Connect attempts that reached the transport
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::Relaxed)
    }

    fn record(&self, ok: bool) {
        if ok {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Outcome of one reading publish round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed_topics: Vec<String>,
    /// True when the connection mode suppressed the round
    pub suppressed: bool,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Scalars plus the aggregated message
const MESSAGES_PER_READING: usize = Field::ALL.len() + 1;

pub struct Session<T, A = NoTrustAnchor>
where
    T: BrokerTransport,
    A: TrustAnchorStore,
{
    transport: T,
    trust: A,
    endpoint: BrokerEndpoint,
    last_will: Option<LastWill>,
    register: Arc<ConnectionRegister>,
    network: Arc<NetworkReady>,
    stats: Arc<PublishStats>,
    connect_attempted: bool,
    /// The transport holds a client from a successful connect
    client_live: bool,
}

impl<T, A> Session<T, A>
where
    T: BrokerTransport,
    A: TrustAnchorStore,
{
    pub fn new(
        transport: T,
        trust: A,
        endpoint: BrokerEndpoint,
        register: Arc<ConnectionRegister>,
        network: Arc<NetworkReady>,
    ) -> Self {
        Self {
            transport,
            trust,
            endpoint,
            last_will: None,
            register,
            network,
            stats: Arc::new(PublishStats::default()),
            connect_attempted: false,
            client_live: false,
        }
    }

    /// Announce `offline` on `topic` if the session drops uncleanly
    pub fn with_last_will(mut self, topic: String) -> Self {
        self.last_will = Some(LastWill {
            topic,
            payload: "offline",
            retain: true,
        });
        self
    }

    /// Replace broker settings; takes effect on the next connect
    pub fn set_endpoint(&mut self, endpoint: BrokerEndpoint) {
        if endpoint != self.endpoint {
            info!("MQTT broker settings changed: {:?}", endpoint);
            self.endpoint = endpoint;
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.register.current()
    }

    pub fn register(&self) -> Arc<ConnectionRegister> {
        self.register.clone()
    }

    pub fn stats(&self) -> Arc<PublishStats> {
        self.stats.clone()
    }

    /// Make sure a connection exists, honoring `mode`
    pub fn ensure_connected(&mut self, mode: ConnectionMode) -> Result<(), SessionError> {
        if mode == ConnectionMode::Disabled || self.register.is_connected() {
            return Ok(());
        }

        // The client never reconnects on its own; a lost one is released here
        if self.client_live {
            info!("MQTT: connection lost, releasing client");
            self.transport.disconnect();
            self.client_live = false;
        }

        if mode == ConnectionMode::ConnectNoReconnect && self.connect_attempted {
            return Err(SessionError::ReconnectDisabled);
        }

        if !self.network.is_ready() {
            warn!("MQTT: network not ready, not connecting");
            return Err(SessionError::NetworkDown);
        }

        self.connect()
    }

    fn connect(&mut self) -> Result<(), SessionError> {
        self.register
            .apply(LinkEvent::ConnectRequested)
            .map_err(|_| SessionError::Busy)?;
        self.connect_attempted = true;

        let options = match self.connect_options() {
            Ok(options) => options,
            Err(e) => {
                error!("MQTT: cannot connect to {}: {}", self.endpoint.url(), e);
                self.register.apply(LinkEvent::ConnectFailed).ok();
                return Err(e);
            }
        };

        info!("MQTT: connecting to {}", options.url);
        self.stats.connects.fetch_add(1, Ordering::Relaxed);

        match self.transport.connect(&options, &self.register) {
            Ok(()) => {
                if self.register.current() == ConnectionState::Connecting {
                    self.register.apply(LinkEvent::Acknowledged).ok();
                }
                self.client_live = true;
                info!("MQTT connected");
                Ok(())
            }
            Err(e) => {
                warn!("MQTT connect to {} failed: {}", options.url, e);
                self.transport.disconnect();
                if self.register.current() == ConnectionState::Connecting {
                    self.register.apply(LinkEvent::ConnectFailed).ok();
                }
                Err(SessionError::Connect(e))
            }
        }
    }

    fn connect_options(&self) -> Result<ConnectOptions, SessionError> {
        let trust_anchor = if self.endpoint.scheme.requires_encryption() {
            match self.trust.load() {
                Ok(Some(pem)) if !pem.trim().is_empty() => Some(pem),
                Ok(_) => return Err(SessionError::MissingTrustAnchor),
                Err(e) => return Err(SessionError::Connect(e)),
            }
        } else {
            None
        };

        Ok(ConnectOptions {
            url: self.endpoint.url(),
            client_id: self.endpoint.client_id.clone(),
            username: non_empty(&self.endpoint.username),
            password: non_empty(&self.endpoint.password),
            trust_anchor,
            last_will: self.last_will.clone(),
        })
    }

    /// Publish one message, connecting first if the policy allows
    pub fn publish(
        &mut self,
        mode: ConnectionMode,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), SessionError> {
        if mode == ConnectionMode::Disabled {
            debug!("MQTT disabled, dropping message for {}", topic);
            return Ok(());
        }

        if let Err(e) = self.ensure_connected(mode) {
            self.stats.record(false);
            return Err(e);
        }

        self.send(topic, payload, retain)
    }

    fn send(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), SessionError> {
        let result = self
            .transport
            .publish(topic, payload.as_bytes(), QoS::AtLeastOnce, retain);
        self.stats.record(result.is_ok());

        result.map_err(|source| {
            warn!("Topic {} not published: {}", topic, source);
            if source == TransportError::NotConnected {
                self.register.apply(LinkEvent::Lost).ok();
            }
            SessionError::Publish {
                topic: topic.to_string(),
                source,
            }
        })
    }

    /// Publish every scalar field and the aggregated message
    ///
    /// The connection is checked once for the round. Each message is then sent
    /// independently; a failure is logged and counted without stopping the
    /// rest.
    pub fn publish_reading(
        &mut self,
        mode: ConnectionMode,
        topics: &TopicNamespace,
        reading: &FilteredReading,
    ) -> Result<PublishReport, SessionError> {
        if mode == ConnectionMode::Disabled {
            debug!("MQTT disabled, reading not published");
            return Ok(PublishReport {
                suppressed: true,
                ..Default::default()
            });
        }

        if let Err(e) = self.ensure_connected(mode) {
            for _ in 0..MESSAGES_PER_READING {
                self.stats.record(false);
            }
            error!("MQTT unavailable, skipping sensor data publish: {}", e);
            return Err(e);
        }

        let mut report = PublishReport::default();

        for field in Field::ALL {
            let topic = topics.scalar(field);
            match self.send(&topic, &format_scalar(reading, field), false) {
                Ok(()) => report.published += 1,
                Err(_) => report.failed_topics.push(topic),
            }
        }

        let topic = topics.envelope();
        let sent = format_envelope(reading)
            .to_json()
            .map_err(|e| SessionError::Encode {
                what: "sensor envelope",
                reason: e.to_string(),
            })
            .and_then(|payload| self.send(&topic, &payload, true));
        match sent {
            Ok(()) => report.published += 1,
            Err(_) => report.failed_topics.push(topic),
        }

        if report.failed_topics.is_empty() {
            info!("MQTT sensor data published successfully");
            Ok(report)
        } else {
            error!(
                "There were errors when publishing sensor data to MQTT: {:?}",
                report.failed_topics
            );
            Err(SessionError::PartialPublish {
                failed: report.failed_topics.len(),
                attempted: MESSAGES_PER_READING,
            })
        }
    }

    /// Stop, then release the client
    pub fn teardown(&mut self) {
        info!("MQTT session teardown");
        self.transport.disconnect();
        self.client_live = false;
        self.register.apply(LinkEvent::Teardown).ok();
    }
}
