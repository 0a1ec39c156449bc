//! Durable device configuration.
//!
//! Every field lives under its own key so an image that introduces a new field
//! picks up that field's default while every previously customised key is
//! preserved. Edits are two-phase: [`ConfigStore::set`] touches only the
//! in-memory copy and [`ConfigStore::save`] writes everything in one commit.
//! Commands that change and persist a single field use
//! [`ConfigStore::save_key`] so pending edits are not swept along.

use core::fmt::{self, Write};

use heapless::String;
use log::{debug, info, warn};

use crate::storage::{KeyValueStore, MAX_VALUE_LEN, StoreError, read_str};
use crate::telemetry::Chemistry;
use crate::version::FirmwareVersion;

pub const SSID_CAPACITY: usize = 32;
pub const SECRET_CAPACITY: usize = 64;
pub const HOST_CAPACITY: usize = 64;
pub const NAME_CAPACITY: usize = 32;
pub const VERSION_CAPACITY: usize = 16;

/// Marker key written on first boot; its absence means "never initialised".
pub const INITIALIZED_KEY: &str = "initialized";

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "battery-monitor";

/// Closed set of configuration keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    WifiSsid,
    WifiPassword,
    BrokerHost,
    BrokerPort,
    BrokerUser,
    BrokerPassword,
    ClientId,
    LowPower,
    UpdateTarget,
    Chemistry,
}

impl SettingKey {
    pub const ALL: [SettingKey; 10] = [
        SettingKey::WifiSsid,
        SettingKey::WifiPassword,
        SettingKey::BrokerHost,
        SettingKey::BrokerPort,
        SettingKey::BrokerUser,
        SettingKey::BrokerPassword,
        SettingKey::ClientId,
        SettingKey::LowPower,
        SettingKey::UpdateTarget,
        SettingKey::Chemistry,
    ];

    /// Key used in durable storage.
    #[must_use]
    pub const fn storage_key(self) -> &'static str {
        match self {
            SettingKey::WifiSsid => "wifi_ssid",
            SettingKey::WifiPassword => "wifi_pass",
            SettingKey::BrokerHost => "mqtt_srv",
            SettingKey::BrokerPort => "mqtt_port",
            SettingKey::BrokerUser => "mqtt_user",
            SettingKey::BrokerPassword => "mqtt_pass",
            SettingKey::ClientId => "mqtt_id",
            SettingKey::LowPower => "deep_sleep",
            SettingKey::UpdateTarget => "ota_target",
            SettingKey::Chemistry => "chemistry",
        }
    }

    /// Canonical console name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SettingKey::WifiSsid => "wifi_ssid",
            SettingKey::WifiPassword => "wifi_password",
            SettingKey::BrokerHost => "broker_host",
            SettingKey::BrokerPort => "broker_port",
            SettingKey::BrokerUser => "broker_user",
            SettingKey::BrokerPassword => "broker_password",
            SettingKey::ClientId => "client_id",
            SettingKey::LowPower => "low_power",
            SettingKey::UpdateTarget => "update_target",
            SettingKey::Chemistry => "chemistry",
        }
    }

    /// Alternative spellings accepted by the console.
    #[must_use]
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            SettingKey::WifiSsid => &["ssid"],
            SettingKey::WifiPassword => &["wifi_pass", "password"],
            SettingKey::BrokerHost => &["mqtt_server", "server"],
            SettingKey::BrokerPort => &["mqtt_port", "port"],
            SettingKey::BrokerUser => &["mqtt_user", "user"],
            SettingKey::BrokerPassword => &["mqtt_password", "mqtt_pass"],
            SettingKey::ClientId => &["mqtt_client_id", "id"],
            SettingKey::LowPower => &["deep_sleep"],
            SettingKey::UpdateTarget => &["ota_version", "ota_target", "otaver"],
            SettingKey::Chemistry => &["battery_type", "type"],
        }
    }

    /// Looks up a key by canonical name or alias (case insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| {
            key.name().eq_ignore_ascii_case(name)
                || key
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(name))
        })
    }

    /// Secrets are masked whenever configuration is displayed.
    #[must_use]
    pub const fn is_secret(self) -> bool {
        matches!(self, SettingKey::WifiPassword | SettingKey::BrokerPassword)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validation failures for a single setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingError {
    Empty,
    TooLong { capacity: usize },
    InvalidPort,
    InvalidBool,
    InvalidVersion,
    UnknownChemistry,
}

impl fmt::Display for SettingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingError::Empty => f.write_str("value must not be empty"),
            SettingError::TooLong { capacity } => {
                write!(f, "value longer than {capacity} bytes")
            }
            SettingError::InvalidPort => f.write_str("port must be 1-65535"),
            SettingError::InvalidBool => {
                f.write_str("expected true/false, 1/0, on/off or enable/disable")
            }
            SettingError::InvalidVersion => f.write_str("expected <major>.<minor>.<patch>"),
            SettingError::UnknownChemistry => {
                f.write_str("unknown chemistry (try lead-acid or lifepo4)")
            }
        }
    }
}

/// Parses the boolean vocabulary accepted for switches.
pub fn parse_switch(text: &str) -> Result<bool, SettingError> {
    const ON: [&str; 4] = ["true", "1", "on", "enable"];
    const OFF: [&str; 4] = ["false", "0", "off", "disable"];

    let text = text.trim();
    if ON.iter().any(|word| word.eq_ignore_ascii_case(text)) {
        Ok(true)
    } else if OFF.iter().any(|word| word.eq_ignore_ascii_case(text)) {
        Ok(false)
    } else {
        Err(SettingError::InvalidBool)
    }
}

/// Runtime configuration of the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub wifi_ssid: String<SSID_CAPACITY>,
    pub wifi_password: String<SECRET_CAPACITY>,
    pub broker_host: String<HOST_CAPACITY>,
    pub broker_port: u16,
    pub broker_user: String<NAME_CAPACITY>,
    pub broker_password: String<SECRET_CAPACITY>,
    pub client_id: String<NAME_CAPACITY>,
    pub low_power_enabled: bool,
    pub update_target_version: String<VERSION_CAPACITY>,
    pub chemistry: Chemistry,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut client_id = String::new();
        // DEFAULT_CLIENT_ID is shorter than NAME_CAPACITY.
        let _ = client_id.push_str(DEFAULT_CLIENT_ID);

        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            broker_host: String::new(),
            broker_port: DEFAULT_BROKER_PORT,
            broker_user: String::new(),
            broker_password: String::new(),
            client_id,
            low_power_enabled: true,
            update_target_version: String::new(),
            chemistry: Chemistry::default(),
        }
    }
}

impl DeviceConfig {
    /// Validates `value` and stores it in the field named by `key`.
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<(), SettingError> {
        match key {
            SettingKey::WifiSsid => assign(&mut self.wifi_ssid, value, true),
            SettingKey::WifiPassword => assign(&mut self.wifi_password, value, false),
            SettingKey::BrokerHost => assign(&mut self.broker_host, value.trim(), true),
            SettingKey::BrokerPort => {
                self.broker_port = parse_port(value)?;
                Ok(())
            }
            SettingKey::BrokerUser => assign(&mut self.broker_user, value, false),
            SettingKey::BrokerPassword => assign(&mut self.broker_password, value, false),
            SettingKey::ClientId => assign(&mut self.client_id, value.trim(), true),
            SettingKey::LowPower => {
                self.low_power_enabled = parse_switch(value)?;
                Ok(())
            }
            SettingKey::UpdateTarget => self.set_update_target(value),
            SettingKey::Chemistry => {
                self.chemistry = Chemistry::from_alias(value).ok_or(SettingError::UnknownChemistry)?;
                Ok(())
            }
        }
    }

    /// Sets the automatic-update target; an empty value disables the check.
    pub fn set_update_target(&mut self, value: &str) -> Result<(), SettingError> {
        let value = value.trim();
        if value.is_empty() {
            self.update_target_version.clear();
            return Ok(());
        }

        let version = FirmwareVersion::parse(value).map_err(|_| SettingError::InvalidVersion)?;
        let mut rendered: String<VERSION_CAPACITY> = String::new();
        write!(rendered, "{version}").map_err(|_| SettingError::TooLong {
            capacity: VERSION_CAPACITY,
        })?;
        self.update_target_version = rendered;
        Ok(())
    }

    /// Writes the stored representation of `key`.
    pub fn write_value<W: Write>(&self, key: SettingKey, writer: &mut W) -> fmt::Result {
        match key {
            SettingKey::WifiSsid => writer.write_str(&self.wifi_ssid),
            SettingKey::WifiPassword => writer.write_str(&self.wifi_password),
            SettingKey::BrokerHost => writer.write_str(&self.broker_host),
            SettingKey::BrokerPort => write!(writer, "{}", self.broker_port),
            SettingKey::BrokerUser => writer.write_str(&self.broker_user),
            SettingKey::BrokerPassword => writer.write_str(&self.broker_password),
            SettingKey::ClientId => writer.write_str(&self.client_id),
            SettingKey::LowPower => writer.write_str(if self.low_power_enabled { "1" } else { "0" }),
            SettingKey::UpdateTarget => writer.write_str(&self.update_target_version),
            SettingKey::Chemistry => writer.write_str(self.chemistry.slug()),
        }
    }
}

fn assign<const N: usize>(
    slot: &mut String<N>,
    value: &str,
    required: bool,
) -> Result<(), SettingError> {
    if required && value.trim().is_empty() {
        return Err(SettingError::Empty);
    }
    let mut next = String::new();
    next.push_str(value)
        .map_err(|_| SettingError::TooLong { capacity: N })?;
    *slot = next;
    Ok(())
}

fn parse_port(value: &str) -> Result<u16, SettingError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(SettingError::InvalidPort),
        Ok(port) => Ok(port),
    }
}

/// How the last [`ConfigStore::load`] resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSource {
    /// Nothing was stored; defaults were written durably.
    FirstBoot,
    /// Stored values were read, defaults fill missing keys. `rejected`
    /// counts stored values that failed validation and kept their default.
    Stored { rejected: u8 },
    /// Storage failed; compiled-in defaults are in use.
    Fallback(StoreError),
}

/// Configuration backed by a durable [`KeyValueStore`].
pub struct ConfigStore<S> {
    store: S,
    config: DeviceConfig,
    defaults: DeviceConfig,
}

impl<S> ConfigStore<S> {
    /// Creates a store holding `DeviceConfig::default()` until [`load`](Self::load).
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: DeviceConfig::default(),
            defaults: DeviceConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigStore<S>
where
    S: KeyValueStore,
{
    /// Loads configuration, initialising storage with `defaults` on first boot.
    ///
    /// Never fails: storage errors fall back to `defaults` with a warning.
    pub fn load(&mut self, defaults: DeviceConfig) -> LoadSource {
        self.defaults = defaults;
        self.config = self.defaults.clone();

        match self.try_load() {
            Ok(source) => source,
            Err(err) => {
                warn!("configuration storage unavailable ({err}); using defaults");
                self.config = self.defaults.clone();
                LoadSource::Fallback(err)
            }
        }
    }

    fn try_load(&mut self) -> Result<LoadSource, StoreError> {
        let mut buffer = [0u8; MAX_VALUE_LEN];
        if read_str(&self.store, INITIALIZED_KEY, &mut buffer)?.is_none() {
            info!("no stored configuration; writing defaults");
            self.persist()?;
            return Ok(LoadSource::FirstBoot);
        }

        let mut rejected = 0u8;
        for key in SettingKey::ALL {
            match read_str(&self.store, key.storage_key(), &mut buffer) {
                Ok(Some(text)) => match self.config.set(key, text) {
                    Ok(()) => {}
                    // Required keys are stored empty until someone sets them.
                    Err(SettingError::Empty) => debug!("{key} unset; using default"),
                    Err(err) => {
                        warn!("stored {key} rejected ({err}); keeping default");
                        rejected = rejected.saturating_add(1);
                    }
                },
                Ok(None) => debug!("{key} not stored; using default"),
                Err(StoreError::Corrupt) => warn!("stored {key} is corrupt; keeping default"),
                Err(err) => return Err(err),
            }
        }

        Ok(LoadSource::Stored { rejected })
    }

    /// Persists every field in a single commit.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.persist()?;
        info!("configuration saved");
        Ok(())
    }

    /// Persists only `key`; other in-memory edits stay unsaved.
    pub fn save_key(&mut self, key: SettingKey) -> Result<(), StoreError> {
        let mut rendered: String<MAX_VALUE_LEN> = String::new();
        self.config
            .write_value(key, &mut rendered)
            .map_err(|_| StoreError::ValueTooLarge)?;
        self.store.stage(key.storage_key(), rendered.as_bytes())?;
        self.store.stage(INITIALIZED_KEY, b"1")?;
        self.store.commit()?;
        debug!("{key} saved");
        Ok(())
    }

    /// Erases all stored configuration; the next load behaves like first boot.
    ///
    /// The in-memory copy reverts to the defaults from the last load.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.store.erase_all()?;
        self.store.commit()?;
        self.config = self.defaults.clone();
        warn!("configuration cleared");
        Ok(())
    }

    /// Updates one field in memory; call [`save`](Self::save) to persist it.
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<(), SettingError> {
        self.config.set(key, value)
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let mut rendered: String<MAX_VALUE_LEN> = String::new();
        for key in SettingKey::ALL {
            rendered.clear();
            self.config
                .write_value(key, &mut rendered)
                .map_err(|_| StoreError::ValueTooLarge)?;
            self.store.stage(key.storage_key(), rendered.as_bytes())?;
        }
        self.store.stage(INITIALIZED_KEY, b"1")?;
        self.store.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn defaults() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config
            .set(SettingKey::WifiSsid, "factory-net")
            .expect("valid ssid");
        config
            .set(SettingKey::BrokerHost, "broker.local")
            .expect("valid host");
        config
    }

    #[test]
    fn first_boot_writes_defaults_and_marker() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        assert_eq!(store.load(defaults()), LoadSource::FirstBoot);
        assert_eq!(store.config(), &defaults());

        let mut buffer = [0u8; 8];
        assert_eq!(
            read_str(store.store(), INITIALIZED_KEY, &mut buffer),
            Ok(Some("1"))
        );
        assert_eq!(store.store().commit_count(), 1);
    }

    #[test]
    fn stored_values_override_defaults() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        store.load(defaults());
        store.set(SettingKey::BrokerPort, "8883").expect("port");
        store.set(SettingKey::LowPower, "off").expect("switch");
        store.save().expect("save");

        let mut reloaded = ConfigStore::new(store.into_inner());
        assert_eq!(reloaded.load(defaults()), LoadSource::Stored { rejected: 0 });
        assert_eq!(reloaded.config().broker_port, 8883);
        assert!(!reloaded.config().low_power_enabled);
        assert_eq!(reloaded.config().wifi_ssid.as_str(), "factory-net");
    }

    #[test]
    fn unsaved_edits_do_not_survive_reload() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        store.load(defaults());
        store.set(SettingKey::ClientId, "node-9").expect("client id");

        let mut reloaded = ConfigStore::new(store.into_inner());
        reloaded.load(defaults());
        assert_eq!(reloaded.config().client_id.as_str(), DEFAULT_CLIENT_ID);
    }

    #[test]
    fn missing_key_uses_default_while_others_persist() {
        let mut raw: MemoryStore<16> = MemoryStore::new();
        raw.stage(INITIALIZED_KEY, b"1").expect("stage");
        raw.stage("mqtt_srv", b"10.0.0.2").expect("stage");
        raw.commit().expect("commit");

        let mut store = ConfigStore::new(raw);
        assert_eq!(store.load(defaults()), LoadSource::Stored { rejected: 0 });
        assert_eq!(store.config().broker_host.as_str(), "10.0.0.2");
        assert_eq!(store.config().wifi_ssid.as_str(), "factory-net");
        assert_eq!(store.config().chemistry, Chemistry::LeadAcid);
    }

    #[test]
    fn invalid_stored_value_falls_back_per_field() {
        let mut raw: MemoryStore<16> = MemoryStore::new();
        raw.stage(INITIALIZED_KEY, b"1").expect("stage");
        raw.stage("mqtt_port", b"99999").expect("stage");
        raw.stage("chemistry", b"lifepo4").expect("stage");
        raw.commit().expect("commit");

        let mut store = ConfigStore::new(raw);
        assert_eq!(store.load(defaults()), LoadSource::Stored { rejected: 1 });
        assert_eq!(store.config().broker_port, DEFAULT_BROKER_PORT);
        assert_eq!(store.config().chemistry, Chemistry::LiFePo4);
    }

    #[test]
    fn blank_first_boot_reloads_cleanly() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        assert_eq!(store.load(DeviceConfig::default()), LoadSource::FirstBoot);

        let mut reloaded = ConfigStore::new(store.into_inner());
        assert_eq!(
            reloaded.load(defaults()),
            LoadSource::Stored { rejected: 0 }
        );
        assert_eq!(reloaded.config().wifi_ssid.as_str(), "factory-net");
        assert_eq!(reloaded.config().broker_host.as_str(), "broker.local");
    }

    #[test]
    fn save_key_writes_only_that_key() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        store.load(defaults());
        store.set(SettingKey::BrokerPort, "8883").expect("port");
        store.set(SettingKey::Chemistry, "lfp").expect("chemistry");
        store.save_key(SettingKey::Chemistry).expect("save chemistry");

        let mut reloaded = ConfigStore::new(store.into_inner());
        reloaded.load(defaults());
        assert_eq!(reloaded.config().chemistry, Chemistry::LiFePo4);
        assert_eq!(reloaded.config().broker_port, DEFAULT_BROKER_PORT);
    }

    #[test]
    fn unavailable_storage_falls_back_to_defaults() {
        let mut raw: MemoryStore<16> = MemoryStore::new();
        raw.set_available(false);
        let mut store = ConfigStore::new(raw);
        assert_eq!(
            store.load(defaults()),
            LoadSource::Fallback(StoreError::Unavailable)
        );
        assert_eq!(store.config(), &defaults());
    }

    #[test]
    fn clear_makes_next_load_a_first_boot() {
        let mut store = ConfigStore::new(MemoryStore::<16>::new());
        store.load(defaults());
        store.set(SettingKey::WifiSsid, "custom").expect("ssid");
        store.save().expect("save");
        store.clear().expect("clear");
        assert_eq!(store.config().wifi_ssid.as_str(), "factory-net");

        let mut reloaded = ConfigStore::new(store.into_inner());
        assert_eq!(reloaded.load(defaults()), LoadSource::FirstBoot);
    }

    #[test]
    fn setters_validate_their_input() {
        let mut config = DeviceConfig::default();
        assert_eq!(
            config.set(SettingKey::BrokerPort, "0"),
            Err(SettingError::InvalidPort)
        );
        assert_eq!(
            config.set(SettingKey::LowPower, "maybe"),
            Err(SettingError::InvalidBool)
        );
        assert_eq!(
            config.set(SettingKey::UpdateTarget, "1.2"),
            Err(SettingError::InvalidVersion)
        );
        assert_eq!(
            config.set(SettingKey::Chemistry, "nimh"),
            Err(SettingError::UnknownChemistry)
        );
        assert_eq!(
            config.set(SettingKey::WifiSsid, "   "),
            Err(SettingError::Empty)
        );
        assert_eq!(
            config.set(SettingKey::WifiSsid, "an-ssid-that-is-longer-than-32-bytes"),
            Err(SettingError::TooLong {
                capacity: SSID_CAPACITY
            })
        );

        config
            .set(SettingKey::UpdateTarget, "v1.4.0")
            .expect("prefixed version");
        assert_eq!(config.update_target_version.as_str(), "1.4.0");
    }

    #[test]
    fn keys_resolve_through_aliases() {
        assert_eq!(SettingKey::from_name("SSID"), Some(SettingKey::WifiSsid));
        assert_eq!(SettingKey::from_name("otaver"), Some(SettingKey::UpdateTarget));
        assert_eq!(SettingKey::from_name("mqtt_pass"), Some(SettingKey::BrokerPassword));
        assert_eq!(SettingKey::from_name("flux"), None);
    }
}
