//! Host stand-ins for every platform seam of the node.
//!
//! Transports share one [`World`] so the session can flip connectivity and
//! inspect broker state between cycles. Time is virtual: waits advance the
//! [`SimClock`] instantly.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use node_core::channel::{
    BrokerSession, InboundMessage, LinkError, NetworkCredentials, NetworkLink, QoS,
    SessionOptions,
};
use node_core::clock::Clock;
use node_core::config::DeviceConfig;
use node_core::dispatch::ClearConfiguration;
use node_core::orchestrator::{Platform, PlatformParts, WakeCycleOrchestrator};
use node_core::storage::{KeyValueStore, StoreError};
use node_core::telemetry::SensorSource;
use node_core::update::{FetchError, FirmwareFetcher, PushError, PushProgress, PushUpdateService};
use node_core::version::FirmwareVersion;

pub const CONFIG_FILE: &str = "config.json";
pub const TRIGGER_FILE: &str = "trigger.json";

const SIM_RSSI: i8 = -58;
/// Polls before a pushed image finishes arriving.
const PUSH_POLLS_TO_COMPLETE: u32 = 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, String>,
}

/// Durable store persisted as a JSON document, replaced atomically on commit.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
    erase_pending: bool,
    unreadable: bool,
}

impl FileStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    ///
    /// A file that does not decode leaves the store unreadable until the next
    /// successful commit.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let (committed, unreadable) = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => (snapshot.entries, false),
                Err(err) => {
                    warn!("{}: cannot decode store ({err})", path.display());
                    (BTreeMap::new(), true)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => (BTreeMap::new(), false),
            Err(err) => return Err(err),
        };

        Ok(Self {
            path,
            committed,
            staged: BTreeMap::new(),
            erase_pending: false,
            unreadable,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.committed
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    fn write_atomically(&self, entries: &BTreeMap<String, String>) -> io::Result<()> {
        let snapshot = Snapshot {
            entries: entries.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&snapshot)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, encoded)?;
        fs::rename(&staging, &self.path)
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str, buffer: &mut [u8]) -> Result<Option<usize>, StoreError> {
        if self.unreadable {
            return Err(StoreError::Corrupt);
        }
        let Some(value) = self.committed.get(key) else {
            return Ok(None);
        };
        let target = buffer
            .get_mut(..value.len())
            .ok_or(StoreError::ValueTooLarge)?;
        target.copy_from_slice(value.as_bytes());
        Ok(Some(value.len()))
    }

    fn stage(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let text = std::str::from_utf8(value).map_err(|_| StoreError::Corrupt)?;
        self.staged.insert(key.to_owned(), text.to_owned());
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.staged.clear();
        self.erase_pending = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut next = if self.erase_pending {
            BTreeMap::new()
        } else {
            self.committed.clone()
        };
        next.extend(
            self.staged
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        let written = self.write_atomically(&next);
        self.staged.clear();
        self.erase_pending = false;
        written.map_err(|err| {
            error!("{}: commit failed ({err}); staged changes dropped", self.path.display());
            StoreError::Unavailable
        })?;
        debug!("{}: committed {} key(s)", self.path.display(), next.len());

        self.committed = next;
        self.unreadable = false;
        Ok(())
    }
}

/// Conditions outside the device, adjusted from the session.
#[derive(Debug)]
pub struct SimWorld {
    pub network_up: bool,
    pub broker_up: bool,
    pub fetch_ok: bool,
    pub push_ok: bool,
    pub voltage: f32,
    /// Retained messages held by the broker, by topic.
    pub retained: BTreeMap<String, Vec<u8>>,
    /// URLs handed to the fetcher, oldest first.
    pub fetched: Vec<String>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self {
            network_up: true,
            broker_up: true,
            fetch_ok: true,
            push_ok: true,
            voltage: 12.62,
            retained: BTreeMap::new(),
            fetched: Vec::new(),
        }
    }
}

pub type World = Rc<RefCell<SimWorld>>;

/// Virtual monotonic clock; instants are offsets from session start.
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now: Rc<Cell<Duration>>,
}

impl SimClock {
    /// Jumps ahead without running anything, e.g. across a suspend.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for SimClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.now.get()
    }

    fn delay(&mut self, duration: Duration) {
        self.advance(duration);
    }
}

pub struct SimNetwork {
    world: World,
    connected: bool,
}

impl NetworkLink for SimNetwork {
    fn connect(
        &mut self,
        credentials: &NetworkCredentials<'_>,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        if !self.world.borrow().network_up {
            return Err(LinkError::Timeout);
        }
        debug!("joined simulated network {:?}", credentials.ssid);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn rssi(&self) -> Option<i8> {
        self.connected.then_some(SIM_RSSI)
    }
}

/// Broker session that keeps retained messages in the [`World`] and replays
/// them on subscribe.
pub struct SimBroker {
    world: World,
    connected: bool,
    inbox: VecDeque<InboundMessage>,
}

impl BrokerSession for SimBroker {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), LinkError> {
        if !self.world.borrow().broker_up {
            return Err(LinkError::Refused);
        }
        info!(
            "broker session to {}:{} as {}",
            options.host, options.port, options.client_id
        );
        self.connected = true;
        self.inbox.clear();
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        let world = self.world.borrow();
        if let Some(payload) = world.retained.get(topic) {
            let message = InboundMessage::new(topic, payload).ok_or(LinkError::PayloadTooLarge)?;
            self.inbox.push_back(message);
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        debug!("publish {topic} ({} bytes, retain={retain})", payload.len());
        if retain {
            let mut world = self.world.borrow_mut();
            if payload.is_empty() {
                world.retained.remove(topic);
            } else {
                world.retained.insert(topic.to_owned(), payload.to_vec());
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        if self.connected {
            self.inbox.pop_front()
        } else {
            None
        }
    }

    fn flush(&mut self, _timeout: Duration) {}

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

pub struct SimSensor {
    world: World,
    clock: SimClock,
}

impl SensorSource for SimSensor {
    fn sample_voltage(&mut self) -> f32 {
        self.world.borrow().voltage
    }

    fn uptime_ms(&self) -> u64 {
        u64::try_from(self.clock.now().as_millis()).unwrap_or(u64::MAX)
    }
}

pub struct SimFetcher {
    world: World,
}

impl FirmwareFetcher for SimFetcher {
    fn fetch_and_apply(&mut self, url: &str, _timeout: Duration) -> Result<(), FetchError> {
        let mut world = self.world.borrow_mut();
        world.fetched.push(url.to_owned());
        if !world.network_up {
            return Err(FetchError::Transport);
        }
        if world.fetch_ok {
            info!("simulated image written from {url}");
            Ok(())
        } else {
            Err(FetchError::Status(404))
        }
    }
}

pub struct SimPush {
    world: World,
    polls: u32,
}

impl PushUpdateService for SimPush {
    fn open(&mut self, hostname: &str) -> Result<(), PushError> {
        if !self.world.borrow().network_up {
            return Err(PushError::Unavailable);
        }
        info!("accepting pushed image as {hostname}");
        self.polls = 0;
        Ok(())
    }

    fn poll(&mut self) -> Result<PushProgress, PushError> {
        if !self.world.borrow().push_ok {
            return Ok(PushProgress::Waiting);
        }
        self.polls += 1;
        Ok(match self.polls {
            1 => PushProgress::Waiting,
            n if n < PUSH_POLLS_TO_COMPLETE => PushProgress::Receiving,
            _ => PushProgress::Completed,
        })
    }

    fn close(&mut self) {
        self.polls = 0;
    }
}

pub struct HostPlatform;

impl Platform for HostPlatform {
    type ConfigStorage = FileStore;
    type TriggerStorage = FileStore;
    type Network = SimNetwork;
    type Broker = SimBroker;
    type Sensor = SimSensor;
    type Fetcher = SimFetcher;
    type Push = SimPush;
    type Clock = SimClock;
    type Reset = ClearConfiguration;
}

/// Factory defaults of the simulated device.
#[must_use]
pub fn default_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    // Both literals fit their fields.
    let _ = config.wifi_ssid.push_str("sim-net");
    let _ = config.broker_host.push_str("127.0.0.1");
    config
}

/// Builds a node over the stores in `state_dir`, as a fresh program image would.
pub fn boot(
    state_dir: &Path,
    world: &World,
    clock: &SimClock,
    firmware: FirmwareVersion,
) -> io::Result<WakeCycleOrchestrator<HostPlatform>> {
    fs::create_dir_all(state_dir)?;
    let parts = PlatformParts::<HostPlatform> {
        config_storage: FileStore::open(state_dir.join(CONFIG_FILE))?,
        trigger_storage: FileStore::open(state_dir.join(TRIGGER_FILE))?,
        network: SimNetwork {
            world: world.clone(),
            connected: false,
        },
        broker: SimBroker {
            world: world.clone(),
            connected: false,
            inbox: VecDeque::new(),
        },
        sensor: SimSensor {
            world: world.clone(),
            clock: clock.clone(),
        },
        fetcher: SimFetcher {
            world: world.clone(),
        },
        push: SimPush {
            world: world.clone(),
            polls: 0,
        },
        clock: clock.clone(),
        reset: ClearConfiguration,
    };

    let mut node = WakeCycleOrchestrator::new(parts, firmware).with_defaults(default_config());
    node.load_config();
    Ok(node)
}
