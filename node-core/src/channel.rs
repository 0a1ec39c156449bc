//! Network and broker session used for publishing telemetry and receiving commands.
//!
//! Transport details stay behind [`NetworkLink`] and [`BrokerSession`]; this
//! module owns the topic layout, connection ordering, timeouts and the inbound
//! message pump. Every failure here is a connectivity failure: it is logged and
//! the wake cycle carries on to its suspend decision.

use core::fmt::{self, Write};
use core::ops::ControlFlow;
use core::time::Duration;

use heapless::{String, Vec};
use log::{debug, info, warn};

use crate::clock::{Clock, Deadline};
use crate::config::DeviceConfig;
use crate::telemetry::{
    Chemistry, DiscoveryField, Reading, write_aggregate_json, write_discovery_payload,
    write_discovery_topic,
};

pub const DEFAULT_TOPIC_BASE: &str = "battery/monitor";
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
pub const BROKER_TIMEOUT: Duration = Duration::from_secs(15);
/// Interval between broker polls while pumping inbound messages.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on flushing outstanding publishes before teardown.
pub const TEARDOWN_FLUSH: Duration = Duration::from_millis(200);

pub const TOPIC_BASE_CAPACITY: usize = 48;
pub const TOPIC_CAPACITY: usize = 96;
pub const PAYLOAD_CAPACITY: usize = 128;

const AVAILABILITY_ONLINE: &[u8] = b"online";
const AVAILABILITY_OFFLINE: &[u8] = b"offline";

pub type TopicName = String<TOPIC_CAPACITY>;

/// Logical topics under the configured base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topic {
    Voltage,
    Percentage,
    Status,
    Type,
    Boot,
    Json,
    Availability,
    /// Inbound update command; cleared by publishing an empty retained payload.
    Update,
    /// Inbound configuration reset command.
    Reset,
    /// Inbound chemistry change command.
    Chemistry,
    /// Retained acknowledgement of the active chemistry.
    ChemistryState,
}

impl Topic {
    /// Topics the node subscribes to after connecting.
    pub const INBOUND: [Topic; 3] = [Topic::Update, Topic::Reset, Topic::Chemistry];

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Topic::Voltage => "voltage",
            Topic::Percentage => "percentage",
            Topic::Status => "status",
            Topic::Type => "type",
            Topic::Boot => "boot",
            Topic::Json => "json",
            Topic::Availability => "availability",
            Topic::Update => "ota",
            Topic::Reset => "reset",
            Topic::Chemistry => "config/chemistry",
            Topic::ChemistryState => "config/chemistry/state",
        }
    }

    const fn discovery_field(self) -> Option<DiscoveryField> {
        match self {
            Topic::Voltage => Some(DiscoveryField::Voltage),
            Topic::Percentage => Some(DiscoveryField::Percentage),
            Topic::Status => Some(DiscoveryField::Status),
            Topic::Boot => Some(DiscoveryField::BootCount),
            _ => None,
        }
    }
}

/// Topic layout rooted at a configurable base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSet {
    base: String<TOPIC_BASE_CAPACITY>,
}

impl TopicSet {
    /// Creates a topic set; `None` when `base` exceeds the capacity or is empty.
    #[must_use]
    pub fn new(base: &str) -> Option<Self> {
        let base = base.trim_end_matches('/');
        if base.is_empty() {
            return None;
        }
        let mut owned = String::new();
        owned.push_str(base).ok()?;
        Some(Self { base: owned })
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full topic name for `topic`.
    #[must_use]
    pub fn name(&self, topic: Topic) -> TopicName {
        let mut name = TopicName::new();
        // base and suffix together always fit TOPIC_CAPACITY.
        let _ = write!(name, "{}/{}", self.base, topic.suffix());
        name
    }

    /// Maps a full inbound topic name back to its logical topic.
    #[must_use]
    pub fn classify(&self, topic: &str) -> Option<Topic> {
        let suffix = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        Topic::INBOUND
            .into_iter()
            .find(|candidate| candidate.suffix() == suffix)
    }
}

impl Default for TopicSet {
    fn default() -> Self {
        let mut base = String::new();
        let _ = base.push_str(DEFAULT_TOPIC_BASE);
        Self { base }
    }
}

/// Transport-level failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    Timeout,
    Refused,
    NotConnected,
    /// The broker or stack refused a publish or subscription.
    Rejected,
    PayloadTooLarge,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Timeout => f.write_str("timed out"),
            LinkError::Refused => f.write_str("connection refused"),
            LinkError::NotConnected => f.write_str("not connected"),
            LinkError::Rejected => f.write_str("rejected"),
            LinkError::PayloadTooLarge => f.write_str("payload too large"),
        }
    }
}

/// Credentials handed to the network link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkCredentials<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

/// Wireless network link provided by the platform.
pub trait NetworkLink {
    /// Joins the network, giving up after `timeout`.
    fn connect(
        &mut self,
        credentials: &NetworkCredentials<'_>,
        timeout: Duration,
    ) -> Result<(), LinkError>;

    fn disconnect(&mut self);

    /// Received signal strength in dBm, when known.
    fn rssi(&self) -> Option<i8>;
}

/// Delivery guarantee requested for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Message the broker publishes on our behalf after an unclean disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub retain: bool,
}

/// Parameters for opening a broker session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions<'a> {
    pub host: &'a str,
    pub port: u16,
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// `false` asks the broker to keep subscriptions across reconnects.
    pub clean_session: bool,
    pub last_will: LastWill<'a>,
    pub timeout: Duration,
}

/// Message received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: TopicName,
    pub payload: Vec<u8, PAYLOAD_CAPACITY>,
}

impl InboundMessage {
    /// Builds a message; `None` when either part exceeds its capacity.
    #[must_use]
    pub fn new(topic: &str, payload: &[u8]) -> Option<Self> {
        let mut name = TopicName::new();
        name.push_str(topic).ok()?;
        Some(Self {
            topic: name,
            payload: Vec::from_slice(payload).ok()?,
        })
    }
}

/// Broker protocol session provided by the platform.
pub trait BrokerSession {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), LinkError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    /// Queues a publish; delivery is not awaited.
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError>;

    /// Returns the next received message without blocking.
    fn poll(&mut self) -> Option<InboundMessage>;

    /// Drives outstanding publishes for at most `timeout`.
    fn flush(&mut self, timeout: Duration);

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Publishing surface handed to command handlers.
pub trait CommandLink {
    fn topics(&self) -> &TopicSet;

    fn publish_to(&mut self, topic: Topic, payload: &[u8], retain: bool) -> Result<(), LinkError>;

    fn flush(&mut self, timeout: Duration);
}

/// Per-field result of a telemetry publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub attempted: u8,
    pub failed: Vec<Topic, 8>,
}

impl PublishReport {
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }

    fn note(&mut self, topic: Topic, result: Result<(), LinkError>) {
        self.attempted = self.attempted.saturating_add(1);
        if let Err(err) = result {
            warn!("publish to {} failed: {err}", topic.suffix());
            // Vec holds every published topic.
            let _ = self.failed.push(topic);
        }
    }
}

/// Network plus broker session for one wake cycle.
pub struct CommandChannel<N, B> {
    network: N,
    broker: B,
    topics: TopicSet,
    network_up: bool,
}

impl<N, B> CommandChannel<N, B> {
    pub fn new(network: N, broker: B, topics: TopicSet) -> Self {
        Self {
            network,
            broker,
            topics,
            network_up: false,
        }
    }

    /// Replaces the topic layout; takes effect on the next broker connect.
    pub fn set_topics(&mut self, topics: TopicSet) {
        self.topics = topics;
    }

    pub fn is_network_up(&self) -> bool {
        self.network_up
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }
}

impl<N, B> CommandChannel<N, B>
where
    N: NetworkLink,
    B: BrokerSession,
{
    /// Joins the configured network within [`NETWORK_TIMEOUT`].
    pub fn connect_network(&mut self, config: &DeviceConfig) -> bool {
        if self.network_up {
            return true;
        }

        let credentials = NetworkCredentials {
            ssid: &config.wifi_ssid,
            password: &config.wifi_password,
        };
        match self.network.connect(&credentials, NETWORK_TIMEOUT) {
            Ok(()) => {
                info!("network {:?} joined", config.wifi_ssid.as_str());
                self.network_up = true;
            }
            Err(err) => warn!("network {:?} unavailable: {err}", config.wifi_ssid.as_str()),
        }
        self.network_up
    }

    /// Opens the broker session, subscribes to command topics and announces availability.
    pub fn connect_broker(&mut self, config: &DeviceConfig) -> bool {
        if !self.network_up {
            return false;
        }
        if self.broker.is_connected() {
            return true;
        }

        let availability = self.topics.name(Topic::Availability);
        let options = SessionOptions {
            host: &config.broker_host,
            port: config.broker_port,
            client_id: &config.client_id,
            username: non_empty(&config.broker_user),
            password: non_empty(&config.broker_password),
            clean_session: false,
            last_will: LastWill {
                topic: &availability,
                payload: AVAILABILITY_OFFLINE,
                retain: true,
            },
            timeout: BROKER_TIMEOUT,
        };

        if let Err(err) = self.broker.connect(&options) {
            warn!(
                "broker {}:{} unavailable: {err}",
                config.broker_host.as_str(),
                config.broker_port
            );
            return false;
        }
        info!(
            "broker {}:{} connected as {}",
            config.broker_host.as_str(),
            config.broker_port,
            config.client_id.as_str()
        );

        for topic in Topic::INBOUND {
            let name = self.topics.name(topic);
            if let Err(err) = self.broker.subscribe(&name, QoS::AtLeastOnce) {
                warn!("subscribe to {name} failed: {err}");
            }
        }

        if let Err(err) = self.broker.publish(&availability, AVAILABILITY_ONLINE, true) {
            warn!("availability publish failed: {err}");
        }
        self.announce(&config.client_id, &availability);
        true
    }

    fn announce(&mut self, client_id: &str, availability: &str) {
        let mut topic: String<TOPIC_CAPACITY> = String::new();
        let mut payload: String<384> = String::new();
        for field_topic in [Topic::Voltage, Topic::Percentage, Topic::Status, Topic::Boot] {
            let Some(field) = field_topic.discovery_field() else {
                continue;
            };
            topic.clear();
            payload.clear();
            let state_topic = self.topics.name(field_topic);
            if write_discovery_topic(&mut topic, client_id, field).is_err()
                || write_discovery_payload(&mut payload, client_id, &state_topic, availability, field)
                    .is_err()
            {
                warn!("discovery document for {} does not fit", field.object_id());
                continue;
            }
            if let Err(err) = self.broker.publish(&topic, payload.as_bytes(), true) {
                debug!("discovery publish for {} failed: {err}", field.object_id());
            }
        }
    }

    /// Publishes each reading field and the aggregate document, all retained.
    ///
    /// One failed field never prevents the others from being attempted.
    pub fn publish_reading(
        &mut self,
        reading: &Reading,
        boot_count: u32,
        chemistry: Chemistry,
    ) -> PublishReport {
        let mut report = PublishReport::default();
        let mut value: String<PAYLOAD_CAPACITY> = String::new();

        let _ = write!(value, "{:.2}", reading.voltage);
        report.note(Topic::Voltage, self.publish_to(Topic::Voltage, value.as_bytes(), true));

        value.clear();
        let _ = write!(value, "{:.1}", reading.percentage);
        report.note(
            Topic::Percentage,
            self.publish_to(Topic::Percentage, value.as_bytes(), true),
        );

        report.note(
            Topic::Status,
            self.publish_to(Topic::Status, reading.status.as_str().as_bytes(), true),
        );
        report.note(
            Topic::Type,
            self.publish_to(Topic::Type, chemistry.display_name().as_bytes(), true),
        );

        value.clear();
        let _ = write!(value, "{boot_count}");
        report.note(Topic::Boot, self.publish_to(Topic::Boot, value.as_bytes(), true));

        value.clear();
        let json = write_aggregate_json(&mut value, reading, chemistry, boot_count, self.network.rssi())
            .map_err(|_| LinkError::PayloadTooLarge)
            .and_then(|()| self.publish_to(Topic::Json, value.as_bytes(), true));
        report.note(Topic::Json, json);

        report
    }

    /// Delivers inbound messages to `handler` until `window` elapses, the
    /// handler breaks, or the session drops. Returns the number handled.
    pub fn pump<C, F>(&mut self, clock: &mut C, window: Duration, mut handler: F) -> usize
    where
        C: Clock,
        F: FnMut(&mut Self, &InboundMessage, C::Instant) -> ControlFlow<()>,
    {
        let deadline = Deadline::after(clock.now(), window);
        let mut handled = 0;

        loop {
            while let Some(message) = self.broker.poll() {
                handled += 1;
                debug!("inbound {} ({} bytes)", message.topic, message.payload.len());
                if handler(self, &message, clock.now()).is_break() {
                    return handled;
                }
            }

            if !self.broker.is_connected() {
                warn!("broker session dropped while waiting for commands");
                return handled;
            }
            if deadline.expired(clock.now()) {
                return handled;
            }
            clock.delay(POLL_INTERVAL);
        }
    }

    /// Closes only the broker session, announcing `offline` first.
    pub fn disconnect_broker(&mut self) {
        if !self.broker.is_connected() {
            return;
        }
        if let Err(err) = self.publish_to(Topic::Availability, AVAILABILITY_OFFLINE, true) {
            debug!("offline announcement failed: {err}");
        }
        self.broker.flush(TEARDOWN_FLUSH);
        self.broker.disconnect();
        info!("broker session closed");
    }

    /// Tears down the broker session and then the network link.
    pub fn disconnect(&mut self) {
        self.disconnect_broker();
        if self.network_up {
            self.network.disconnect();
            self.network_up = false;
            info!("network link closed");
        }
    }
}

impl<N, B> CommandLink for CommandChannel<N, B>
where
    B: BrokerSession,
{
    fn topics(&self) -> &TopicSet {
        &self.topics
    }

    fn publish_to(&mut self, topic: Topic, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        let name = self.topics.name(topic);
        self.broker.publish(&name, payload, retain)
    }

    fn flush(&mut self, timeout: Duration) {
        self.broker.flush(timeout);
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}
