#![allow(dead_code)]

use core::ops::Add;
use core::time::Duration;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use node_core::channel::{
    BrokerSession, InboundMessage, LinkError, NetworkCredentials, NetworkLink, QoS,
    SessionOptions,
};
use node_core::clock::Clock;
use node_core::config::DeviceConfig;
use node_core::dispatch::ClearConfiguration;
use node_core::orchestrator::{Platform, PlatformParts, WakeCycleOrchestrator};
use node_core::storage::{KeyValueStore, MemoryStore, StoreError};
use node_core::telemetry::SensorSource;
use node_core::trigger::{PersistentTrigger, TriggerRecord};
use node_core::update::{FetchError, FirmwareFetcher, PushError, PushProgress, PushUpdateService};
use node_core::version::FirmwareVersion;

pub const FIRMWARE: FirmwareVersion = FirmwareVersion::new(1, 2, 0);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(pub u64);

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

/// Virtual clock shared with the test body.
#[derive(Clone, Default)]
pub struct MockClock {
    pub now_ms: Rc<Cell<u64>>,
}

impl Clock for MockClock {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        MockInstant(self.now_ms.get())
    }

    fn delay(&mut self, duration: Duration) {
        self.now_ms
            .set(self.now_ms.get() + duration.as_millis() as u64);
    }
}

/// Store handle whose clones share one backing store, so tests can inspect
/// durable state while the orchestrator owns it.
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Rc<RefCell<MemoryStore>>,
}

impl SharedStore {
    pub fn power_loss(&self) {
        self.inner.borrow_mut().power_loss();
    }

    pub fn set_available(&self, available: bool) {
        self.inner.borrow_mut().set_available(available);
    }

    pub fn trigger(&self) -> TriggerRecord {
        PersistentTrigger::new(self.clone()).peek()
    }
}

impl KeyValueStore for SharedStore {
    fn read(&self, key: &str, buffer: &mut [u8]) -> Result<Option<usize>, StoreError> {
        self.inner.borrow().read(key, buffer)
    }

    fn stage(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.borrow_mut().stage(key, value)
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.inner.borrow_mut().erase_all()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.borrow_mut().commit()
    }
}

#[derive(Default)]
pub struct NetworkState {
    pub reachable: bool,
    pub connected: bool,
    pub connects: u32,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    pub state: Rc<RefCell<NetworkState>>,
}

impl NetworkLink for MockNetwork {
    fn connect(
        &mut self,
        _credentials: &NetworkCredentials<'_>,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        state.connects += 1;
        if state.reachable {
            state.connected = true;
            Ok(())
        } else {
            Err(LinkError::Timeout)
        }
    }

    fn disconnect(&mut self) {
        self.state.borrow_mut().connected = false;
    }

    fn rssi(&self) -> Option<i8> {
        self.state.borrow().connected.then_some(-61)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Default)]
pub struct BrokerState {
    pub reachable: bool,
    pub connected: bool,
    pub connects: u32,
    pub subscriptions: Vec<String>,
    pub inbox: VecDeque<InboundMessage>,
    pub published: Vec<Published>,
    pub will_topic: Option<String>,
}

impl BrokerState {
    pub fn published_to(&self, topic: &str) -> Option<&Published> {
        self.published.iter().rev().find(|entry| entry.topic == topic)
    }
}

#[derive(Clone, Default)]
pub struct MockBroker {
    pub state: Rc<RefCell<BrokerState>>,
}

impl MockBroker {
    pub fn queue(&self, topic: &str, payload: &[u8]) {
        let message = InboundMessage::new(topic, payload).expect("message fits");
        self.state.borrow_mut().inbox.push_back(message);
    }
}

impl BrokerSession for MockBroker {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        state.connects += 1;
        if !state.reachable {
            return Err(LinkError::Refused);
        }
        assert!(!options.clean_session);
        state.will_topic = Some(options.last_will.topic.into());
        state.connected = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        self.state.borrow_mut().subscriptions.push(topic.into());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.published.push(Published {
            topic: topic.into(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return None;
        }
        state.inbox.pop_front()
    }

    fn flush(&mut self, _timeout: Duration) {}

    fn disconnect(&mut self) {
        self.state.borrow_mut().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }
}

#[derive(Clone)]
pub struct MockSensor {
    pub voltage: Rc<Cell<f32>>,
}

impl Default for MockSensor {
    fn default() -> Self {
        Self {
            voltage: Rc::new(Cell::new(12.6)),
        }
    }
}

impl SensorSource for MockSensor {
    fn sample_voltage(&mut self) -> f32 {
        self.voltage.get()
    }

    fn uptime_ms(&self) -> u64 {
        120
    }
}

/// What the fetcher observed when it was invoked.
#[derive(Clone, Debug)]
pub struct FetchAttempt {
    pub url: String,
    pub trigger_at_fetch: TriggerRecord,
    pub broker_connected_at_fetch: bool,
    pub broker_connects_at_fetch: u32,
}

#[derive(Clone)]
pub struct MockFetcher {
    pub result: Rc<Cell<Result<(), FetchError>>>,
    pub attempts: Rc<RefCell<Vec<FetchAttempt>>>,
    trigger_store: SharedStore,
    broker: Rc<RefCell<BrokerState>>,
}

impl FirmwareFetcher for MockFetcher {
    fn fetch_and_apply(&mut self, url: &str, _timeout: Duration) -> Result<(), FetchError> {
        let broker = self.broker.borrow();
        self.attempts.borrow_mut().push(FetchAttempt {
            url: url.into(),
            trigger_at_fetch: self.trigger_store.trigger(),
            broker_connected_at_fetch: broker.connected,
            broker_connects_at_fetch: broker.connects,
        });
        self.result.get()
    }
}

#[derive(Clone, Default)]
pub struct MockPush {
    pub complete_after_polls: Rc<Cell<Option<u32>>>,
    pub opened_as: Rc<RefCell<Option<String>>>,
    polls: Rc<Cell<u32>>,
}

impl PushUpdateService for MockPush {
    fn open(&mut self, hostname: &str) -> Result<(), PushError> {
        *self.opened_as.borrow_mut() = Some(hostname.into());
        self.polls.set(0);
        Ok(())
    }

    fn poll(&mut self) -> Result<PushProgress, PushError> {
        self.polls.set(self.polls.get() + 1);
        match self.complete_after_polls.get() {
            Some(limit) if self.polls.get() >= limit => Ok(PushProgress::Completed),
            _ => Ok(PushProgress::Waiting),
        }
    }

    fn close(&mut self) {}
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type ConfigStorage = SharedStore;
    type TriggerStorage = SharedStore;
    type Network = MockNetwork;
    type Broker = MockBroker;
    type Sensor = MockSensor;
    type Fetcher = MockFetcher;
    type Push = MockPush;
    type Clock = MockClock;
    type Reset = ClearConfiguration;
}

/// Handles onto every collaborator of a test node.
#[derive(Clone)]
pub struct Rig {
    pub config_store: SharedStore,
    pub trigger_store: SharedStore,
    pub network: MockNetwork,
    pub broker: MockBroker,
    pub sensor: MockSensor,
    pub fetcher: MockFetcher,
    pub push: MockPush,
    pub clock: MockClock,
}

impl Rig {
    /// Network and broker reachable, fetches succeed.
    pub fn online() -> Self {
        let rig = Self::offline();
        rig.network.state.borrow_mut().reachable = true;
        rig.broker.state.borrow_mut().reachable = true;
        rig
    }

    pub fn offline() -> Self {
        let trigger_store = SharedStore::default();
        let broker = MockBroker::default();
        let fetcher = MockFetcher {
            result: Rc::new(Cell::new(Ok(()))),
            attempts: Rc::default(),
            trigger_store: trigger_store.clone(),
            broker: broker.state.clone(),
        };
        Self {
            config_store: SharedStore::default(),
            trigger_store,
            network: MockNetwork::default(),
            broker,
            sensor: MockSensor::default(),
            fetcher,
            push: MockPush::default(),
            clock: MockClock::default(),
        }
    }

    /// Builds a node over the shared handles, as if the device had just booted.
    pub fn boot(&self) -> WakeCycleOrchestrator<TestPlatform> {
        self.boot_with(FIRMWARE)
    }

    pub fn boot_with(&self, firmware: FirmwareVersion) -> WakeCycleOrchestrator<TestPlatform> {
        let parts = PlatformParts::<TestPlatform> {
            config_storage: self.config_store.clone(),
            trigger_storage: self.trigger_store.clone(),
            network: self.network.clone(),
            broker: self.broker.clone(),
            sensor: self.sensor.clone(),
            fetcher: self.fetcher.clone(),
            push: self.push.clone(),
            clock: self.clock.clone(),
            reset: ClearConfiguration,
        };
        WakeCycleOrchestrator::new(parts, firmware).with_defaults(defaults())
    }

    pub fn fetch_attempts(&self) -> Vec<FetchAttempt> {
        self.fetcher.attempts.borrow().clone()
    }
}

pub fn defaults() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.wifi_ssid.push_str("garage").expect("fits");
    config.broker_host.push_str("10.0.0.2").expect("fits");
    config
}

pub fn topic(suffix: &str) -> String {
    format!("battery/monitor/{suffix}")
}
