use crate::config::{MqttConfig, TlsMode};
use crate::normalize::{normalize, Normalized, SkipReason};
use crate::pipeline::{IngestStats, SinkHandle};
use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_util::sync::CancellationToken;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl LinkState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Reconnecting,
            4 => LinkState::Closed,
            _ => LinkState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued(usize),
    Skipped(SkipReason),
    Malformed,
    UnexpectedTopic,
    SinkClosed,
}

/// Turns one publish into queued measurements. Stateless apart from counters,
/// so one bad message cannot affect the next.
pub struct UplinkHandler {
    filters: Vec<String>,
    sink: SinkHandle,
    stats: Arc<IngestStats>,
}

impl UplinkHandler {
    pub fn new(filters: Vec<String>, sink: SinkHandle) -> Self {
        let stats = sink.stats();
        Self {
            filters,
            sink,
            stats,
        }
    }

    pub async fn handle_publish(&self, topic: &str, mut payload: Vec<u8>) -> PublishOutcome {
        if !self
            .filters
            .iter()
            .any(|filter| topic_matches(filter, topic))
        {
            self.stats.envelopes_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(topic, "ignoring publish on unexpected topic");
            return PublishOutcome::UnexpectedTopic;
        }

        self.stats.envelopes_received.fetch_add(1, Ordering::Relaxed);
        let len = payload.len();
        let envelope = match simd_json::to_borrowed_value(&mut payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats
                    .envelopes_malformed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error=%err, topic, len, "discarding malformed uplink payload");
                return PublishOutcome::Malformed;
            }
        };

        let measurements = match normalize(&envelope, Utc::now()) {
            Normalized::Measurements(measurements) => measurements,
            Normalized::Skipped(reason) => {
                if reason.is_error() {
                    self.stats
                        .envelopes_malformed
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(topic, reason = reason.as_str(), "discarding uplink envelope");
                } else {
                    self.stats.envelopes_skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(topic, reason = reason.as_str(), "skipped uplink envelope");
                }
                return PublishOutcome::Skipped(reason);
            }
        };

        let count = measurements.len();
        for measurement in measurements {
            if let Err(err) = self.sink.enqueue(measurement).await {
                tracing::warn!(error=%err, topic, "sink closed while handling uplink");
                return PublishOutcome::SinkClosed;
            }
        }
        tracing::debug!(topic, count, "queued uplink measurements");
        PublishOutcome::Enqueued(count)
    }
}

/// MQTT topic filter matching with `+` and trailing `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Broker subscription that feeds every uplink through an [`UplinkHandler`].
pub struct MqttSource {
    link: MqttLink,
    filters: Vec<String>,
}

/// The still-open broker connection, released after the sink has drained.
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    stats: Arc<IngestStats>,
}

impl MqttSource {
    /// Builds the client. No network traffic happens until [`MqttSource::run`].
    pub fn new(config: &MqttConfig, stats: Arc<IngestStats>) -> Result<Self> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keepalive());
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        options.set_transport(transport(&config.tls)?);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        stats.set_link_state(LinkState::Disconnected);
        Ok(Self {
            link: MqttLink {
                client,
                eventloop,
                stats,
            },
            filters: config.topics.clone(),
        })
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Polls the broker until `cancel` fires, then hands the connection back.
    pub async fn run(self, handler: UplinkHandler, cancel: CancellationToken) -> MqttLink {
        let MqttSource { mut link, filters } = self;
        let mut monitor = ConnectionMonitor::new(filters, link.stats.clone());

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = link.eventloop.poll() => event,
            };

            if let Ok(Event::Incoming(Incoming::Publish(publish))) = &event {
                handler
                    .handle_publish(&publish.topic, publish.payload.to_vec())
                    .await;
                continue;
            }

            match monitor.on_event(&event) {
                LinkAction::Subscribe(filters) => {
                    for filter in filters {
                        match link.client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                            Ok(()) => tracing::info!(topic=%filter, "subscribed to uplink feed"),
                            Err(err) => {
                                tracing::warn!(error=%err, topic=%filter, "failed to queue subscription")
                            }
                        }
                    }
                }
                LinkAction::Retry(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
                LinkAction::Continue => {}
            }
        }

        tracing::info!("stopped reading from MQTT broker");
        link
    }
}

/// What the poll loop does after a connection-level event.
#[derive(Debug, PartialEq, Eq)]
enum LinkAction {
    /// Queue these subscriptions. The session is clean, so every CONNACK needs them.
    Subscribe(Vec<String>),
    /// Wait this long before polling again.
    Retry(Duration),
    Continue,
}

/// Link state and reconnect backoff for one broker connection.
struct ConnectionMonitor {
    filters: Vec<String>,
    backoff: Duration,
    stats: Arc<IngestStats>,
}

impl ConnectionMonitor {
    fn new(filters: Vec<String>, stats: Arc<IngestStats>) -> Self {
        stats.set_link_state(LinkState::Connecting);
        Self {
            filters,
            backoff: RECONNECT_MIN,
            stats,
        }
    }

    fn on_event(&mut self, event: &Result<Event, ConnectionError>) -> LinkAction {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                self.backoff = RECONNECT_MIN;
                self.stats.set_link_state(LinkState::Connected);
                self.stats.clear_error();
                tracing::info!(session_present = ack.session_present, "connected to MQTT broker");
                LinkAction::Subscribe(self.filters.clone())
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    self.stats.record_error("broker refused a subscription");
                    tracing::warn!(pkid = ack.pkid, "broker refused a subscription");
                }
                LinkAction::Continue
            }
            Ok(_) => LinkAction::Continue,
            Err(err) => {
                let delay = self.backoff;
                self.backoff = (delay * 2).min(RECONNECT_MAX);
                self.stats.set_link_state(LinkState::Reconnecting);
                self.stats.record_error(format!("mqtt: {err}"));
                tracing::warn!(
                    error=%err,
                    retry_in_ms = delay.as_millis() as u64,
                    "MQTT connection dropped; reconnecting"
                );
                LinkAction::Retry(delay)
            }
        }
    }
}

/// A broker connection that outlives its source so it can be closed last.
pub trait BrokerLink: Sized {
    async fn release(self, limit: Duration);
}

impl BrokerLink for MqttLink {
    /// Sends DISCONNECT and waits up to `limit` for it to go out.
    async fn release(mut self, limit: Duration) {
        if let Err(err) = self.client.try_disconnect() {
            tracing::warn!(error=%err, "failed to queue MQTT disconnect");
        } else {
            let sent = timeout(limit, async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
            .await;
            if sent.is_err() {
                tracing::warn!("timed out waiting for MQTT disconnect");
            }
        }
        self.stats.set_link_state(LinkState::Closed);
        tracing::info!("released MQTT connection");
    }
}

fn transport(mode: &TlsMode) -> Result<Transport> {
    match mode {
        TlsMode::Disabled => Ok(Transport::Tcp),
        TlsMode::Strict => {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            let config = tls_builder()?
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )))
        }
        TlsMode::Insecure => {
            tracing::warn!("MQTT TLS certificate verification is disabled");
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = rustls::ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .context("failed to configure MQTT TLS")?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
                .with_no_client_auth();
            Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )))
        }
    }
}

/// Pins the ring provider; the process-wide default is ambiguous when more than
/// one rustls backend is compiled in.
fn tls_builder() -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>> {
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("failed to configure MQTT TLS")
}

/// Skips certificate chain and name checks but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
