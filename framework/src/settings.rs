//! Typed access to the persistent key/value settings
//!
//! Keys live in the `settings` namespace and are limited to 15 characters by
//! the flash storage backend. [`init_defaults`] seeds every absent key on
//! boot; after that the loaders treat a missing or out-of-range value as a
//! fault and the caller skips its cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::reading::SensorCalibration;
use crate::sampler::SamplingPolicy;
use crate::session::{BrokerEndpoint, ConnectionMode, TransportScheme};

pub const NAMESPACE: &str = "settings";

/// Longest key the storage backend accepts
pub const MAX_KEY_LEN: usize = 15;

pub mod keys {
    pub const DEVICE_ID: &str = "device_id";
    pub const DEVICE_SERIAL: &str = "device_serial";
    pub const MQTT_SERVER: &str = "mqtt_server";
    pub const MQTT_PORT: &str = "mqtt_port";
    pub const MQTT_PROTOCOL: &str = "mqtt_protocol";
    pub const MQTT_USER: &str = "mqtt_user";
    pub const MQTT_PASSWORD: &str = "mqtt_password";
    pub const MQTT_PREFIX: &str = "mqtt_prefix";
    pub const MQTT_MODE: &str = "mqtt_mode";
    pub const HA_PREFIX: &str = "ha_prefix";
    pub const SENSOR_OFFSET: &str = "sensor_offset";
    pub const SENSOR_MULTIPLIER: &str = "sensor_multipl";
    pub const SAMPLE_COUNT: &str = "sensor_samples";
    pub const SAMPLE_INTERVAL: &str = "sensor_smp_int";
    pub const DEVIATION: &str = "sensor_deviate";
    pub const READ_INTERVAL: &str = "sensor_intervl";
}

pub mod defaults {
    pub const MQTT_SERVER: &str = "127.0.0.1";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_PROTOCOL: &str = "mqtt";
    pub const MQTT_PREFIX: &str = "pressure_sensor/";
    pub const HA_PREFIX: &str = "homeassistant";
    pub const MQTT_MODE: u16 = 2;
    pub const READ_INTERVAL_MS: u32 = 5000;
}

pub const DEVICE_ID_LEN: usize = 12;
pub const SERIAL_LEN: usize = 32;
const SERIAL_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("settings storage error: {0}")]
    Storage(String),
    #[error("key '{0}' holds a value of another type")]
    TypeMismatch(String),
    #[error("key '{0}' is longer than 15 characters")]
    KeyTooLong(String),
    #[error("key '{0}' not found")]
    Missing(&'static str),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Key/value store backing the node settings
///
/// Methods take `&self`; implementations synchronise internally so one store
/// can be shared between tasks.
pub trait SettingsStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set_str(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    fn get_u16(&self, key: &str) -> Result<Option<u16>, SettingsError>;
    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError>;
    fn get_u32(&self, key: &str) -> Result<Option<u32>, SettingsError>;
    fn set_u32(&self, key: &str, value: u32) -> Result<(), SettingsError>;
    fn get_f32(&self, key: &str) -> Result<Option<f32>, SettingsError>;
    fn set_f32(&self, key: &str, value: f32) -> Result<(), SettingsError>;
}

impl<T: SettingsStore + ?Sized> SettingsStore for Arc<T> {
    fn get_str(&self, key: &str) -> Result<Option<String>, SettingsError> {
        (**self).get_str(key)
    }
    fn set_str(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        (**self).set_str(key, value)
    }
    fn get_u16(&self, key: &str) -> Result<Option<u16>, SettingsError> {
        (**self).get_u16(key)
    }
    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError> {
        (**self).set_u16(key, value)
    }
    fn get_u32(&self, key: &str) -> Result<Option<u32>, SettingsError> {
        (**self).get_u32(key)
    }
    fn set_u32(&self, key: &str, value: u32) -> Result<(), SettingsError> {
        (**self).set_u32(key, value)
    }
    fn get_f32(&self, key: &str) -> Result<Option<f32>, SettingsError> {
        (**self).get_f32(key)
    }
    fn set_f32(&self, key: &str, value: f32) -> Result<(), SettingsError> {
        (**self).set_f32(key, value)
    }
}

pub fn check_key(key: &str) -> Result<(), SettingsError> {
    if key.len() > MAX_KEY_LEN {
        return Err(SettingsError::KeyTooLong(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    Str(String),
    U16(u16),
    U32(u32),
    F32(f32),
}

/// Volatile store for host runs and tests
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, StoredValue>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, SettingsError> {
        check_key(key)?;
        let values = self
            .values
            .lock()
            .map_err(|_| SettingsError::Storage("lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<(), SettingsError> {
        check_key(key)?;
        self.values
            .lock()
            .map_err(|_| SettingsError::Storage("lock poisoned".into()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

macro_rules! memory_accessors {
    ($get:ident, $set:ident, $variant:ident, $ty:ty) => {
        fn $get(&self, key: &str) -> Result<Option<$ty>, SettingsError> {
            match self.get(key)? {
                None => Ok(None),
                Some(StoredValue::$variant(v)) => Ok(Some(v)),
                Some(_) => Err(SettingsError::TypeMismatch(key.to_string())),
            }
        }

        fn $set(&self, key: &str, value: $ty) -> Result<(), SettingsError> {
            self.set(key, StoredValue::$variant(value))
        }
    };
}

impl SettingsStore for MemorySettings {
    fn get_str(&self, key: &str) -> Result<Option<String>, SettingsError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::Str(v)) => Ok(Some(v)),
            Some(_) => Err(SettingsError::TypeMismatch(key.to_string())),
        }
    }

    fn set_str(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.set(key, StoredValue::Str(value.to_string()))
    }

    memory_accessors!(get_u16, set_u16, U16, u16);
    memory_accessors!(get_u32, set_u32, U32, u32);
    memory_accessors!(get_f32, set_f32, F32, f32);
}

/// Hardware random number generator
pub trait RandomSource {
    fn next_u32(&mut self) -> u32;
}

/// Stable identity of the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Station MAC as 12 uppercase hex characters
    pub device_id: String,
    /// Random 32 character `[A-Z0-9]` serial, generated once
    pub serial: String,
}

pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02X}", b)).collect()
}

pub fn generate_serial(rng: &mut impl RandomSource) -> String {
    (0..SERIAL_LEN)
        .map(|_| SERIAL_ALPHABET[rng.next_u32() as usize % SERIAL_ALPHABET.len()] as char)
        .collect()
}

fn seed_str(store: &impl SettingsStore, key: &'static str, value: &str) -> Result<(), SettingsError> {
    match store.get_str(key)? {
        Some(_) => debug!("Found parameter {} in NVS", key),
        None => {
            warn!("Unable to find parameter {} in NVS. Initiating...", key);
            store.set_str(key, value)?;
            info!("Created key {} with value {}", key, value);
        }
    }
    Ok(())
}

fn seed_u16(store: &impl SettingsStore, key: &'static str, value: u16) -> Result<(), SettingsError> {
    if store.get_u16(key)?.is_none() {
        warn!("Unable to find parameter {} in NVS. Initiating...", key);
        store.set_u16(key, value)?;
    }
    Ok(())
}

fn seed_u32(store: &impl SettingsStore, key: &'static str, value: u32) -> Result<(), SettingsError> {
    if store.get_u32(key)?.is_none() {
        warn!("Unable to find parameter {} in NVS. Initiating...", key);
        store.set_u32(key, value)?;
    }
    Ok(())
}

fn seed_f32(store: &impl SettingsStore, key: &'static str, value: f32) -> Result<(), SettingsError> {
    if store.get_f32(key)?.is_none() {
        warn!("Unable to find parameter {} in NVS. Initiating...", key);
        store.set_f32(key, value)?;
    }
    Ok(())
}

/// Write defaults for every absent key and establish the device identity
///
/// Existing values are never overwritten; the serial is generated only on
/// the first boot.
pub fn init_defaults(
    store: &impl SettingsStore,
    mac: [u8; 6],
    rng: &mut impl RandomSource,
) -> Result<DeviceIdentity, SettingsError> {
    let calibration = SensorCalibration::default();
    let policy = SamplingPolicy::default();

    seed_f32(store, keys::SENSOR_OFFSET, calibration.voltage_offset)?;
    seed_u32(store, keys::SENSOR_MULTIPLIER, calibration.linear_multiplier)?;
    seed_u16(store, keys::SAMPLE_COUNT, policy.sample_count)?;
    seed_u16(store, keys::SAMPLE_INTERVAL, policy.sample_interval_ms)?;
    seed_f32(store, keys::DEVIATION, policy.deviation_threshold_percent)?;
    seed_u32(store, keys::READ_INTERVAL, defaults::READ_INTERVAL_MS)?;
    seed_str(store, keys::MQTT_SERVER, defaults::MQTT_SERVER)?;
    seed_u16(store, keys::MQTT_PORT, defaults::MQTT_PORT)?;
    seed_str(store, keys::MQTT_PROTOCOL, defaults::MQTT_PROTOCOL)?;
    seed_str(store, keys::MQTT_USER, "")?;
    seed_str(store, keys::MQTT_PASSWORD, "")?;
    seed_str(store, keys::MQTT_PREFIX, defaults::MQTT_PREFIX)?;
    seed_u16(store, keys::MQTT_MODE, defaults::MQTT_MODE)?;
    seed_str(store, keys::HA_PREFIX, defaults::HA_PREFIX)?;
    seed_str(store, keys::DEVICE_ID, &device_id_from_mac(mac))?;

    if store.get_str(keys::DEVICE_SERIAL)?.is_none() {
        let serial = generate_serial(rng);
        store.set_str(keys::DEVICE_SERIAL, &serial)?;
        info!("Generated device serial {}", serial);
    }

    device_identity(store)
}

pub fn device_identity(store: &impl SettingsStore) -> Result<DeviceIdentity, SettingsError> {
    Ok(DeviceIdentity {
        device_id: non_empty_str(store, keys::DEVICE_ID)?,
        serial: non_empty_str(store, keys::DEVICE_SERIAL)?,
    })
}

fn required<T>(key: &'static str, value: Option<T>) -> Result<T, SettingsError> {
    value.ok_or(SettingsError::Missing(key))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

fn non_empty_str(store: &impl SettingsStore, key: &'static str) -> Result<String, SettingsError> {
    let value = required(key, store.get_str(key)?)?;
    if value.trim().is_empty() {
        return Err(invalid(key, "empty"));
    }
    Ok(value)
}

pub fn sampling_policy(store: &impl SettingsStore) -> Result<SamplingPolicy, SettingsError> {
    let policy = SamplingPolicy {
        sample_count: required(keys::SAMPLE_COUNT, store.get_u16(keys::SAMPLE_COUNT)?)?,
        sample_interval_ms: required(keys::SAMPLE_INTERVAL, store.get_u16(keys::SAMPLE_INTERVAL)?)?,
        deviation_threshold_percent: required(keys::DEVIATION, store.get_f32(keys::DEVIATION)?)?,
    };
    if policy.sample_count == 0 {
        return Err(invalid(keys::SAMPLE_COUNT, "must be at least 1"));
    }
    if !policy.deviation_threshold_percent.is_finite() || policy.deviation_threshold_percent < 0.0 {
        return Err(invalid(
            keys::DEVIATION,
            format!("{} is not a non-negative percentage", policy.deviation_threshold_percent),
        ));
    }
    Ok(policy)
}

pub fn sensor_calibration(store: &impl SettingsStore) -> Result<SensorCalibration, SettingsError> {
    let voltage_offset = required(keys::SENSOR_OFFSET, store.get_f32(keys::SENSOR_OFFSET)?)?;
    if !voltage_offset.is_finite() {
        return Err(invalid(keys::SENSOR_OFFSET, "not a finite voltage"));
    }
    Ok(SensorCalibration {
        voltage_offset,
        linear_multiplier: required(keys::SENSOR_MULTIPLIER, store.get_u32(keys::SENSOR_MULTIPLIER)?)?,
    })
}

pub fn connection_mode(store: &impl SettingsStore) -> Result<ConnectionMode, SettingsError> {
    let raw = required(keys::MQTT_MODE, store.get_u16(keys::MQTT_MODE)?)?;
    ConnectionMode::from_u16(raw).ok_or_else(|| invalid(keys::MQTT_MODE, format!("unknown mode {}", raw)))
}

pub fn broker_endpoint(
    store: &impl SettingsStore,
    identity: &DeviceIdentity,
) -> Result<BrokerEndpoint, SettingsError> {
    let protocol = required(keys::MQTT_PROTOCOL, store.get_str(keys::MQTT_PROTOCOL)?)?;
    let scheme = TransportScheme::parse(&protocol)
        .ok_or_else(|| invalid(keys::MQTT_PROTOCOL, format!("unknown protocol '{}'", protocol)))?;
    let host = non_empty_str(store, keys::MQTT_SERVER)?;
    let username = required(keys::MQTT_USER, store.get_str(keys::MQTT_USER)?)?;
    let password = required(keys::MQTT_PASSWORD, store.get_str(keys::MQTT_PASSWORD)?)?;

    Ok(BrokerEndpoint {
        scheme,
        host: host.trim().to_string(),
        port: required(keys::MQTT_PORT, store.get_u16(keys::MQTT_PORT)?)?,
        username: Some(username).filter(|u| !u.is_empty()),
        password: Some(password).filter(|p| !p.is_empty()),
        client_id: Some(identity.device_id.clone()),
    })
}

pub fn mqtt_prefix(store: &impl SettingsStore) -> Result<String, SettingsError> {
    non_empty_str(store, keys::MQTT_PREFIX)
}

pub fn hub_prefix(store: &impl SettingsStore) -> Result<String, SettingsError> {
    non_empty_str(store, keys::HA_PREFIX)
}

/// Pause between measurement cycles (ms)
pub fn read_interval_ms(store: &impl SettingsStore) -> Result<u32, SettingsError> {
    required(keys::READ_INTERVAL, store.get_u32(keys::READ_INTERVAL)?)
}
