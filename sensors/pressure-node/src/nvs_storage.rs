//! Non-volatile storage for the node settings.

use std::sync::{Mutex, MutexGuard};

use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::EspError;
use log::info;
use pressure_telemetry::settings::{check_key, SettingsError, SettingsStore, NAMESPACE};

fn storage_error(key: &str, e: EspError) -> SettingsError {
    SettingsError::Storage(format!("{}: {}", key, e))
}

/// NVS-backed settings store, shared by every task
pub struct NvsSettings {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsSettings {
    pub fn new(partition: EspNvsPartition<NvsDefault>) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        info!("NVS settings namespace '{}' opened", NAMESPACE);
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }

    fn lock(&self, key: &str) -> Result<MutexGuard<'_, EspNvs<NvsDefault>>, SettingsError> {
        check_key(key)?;
        self.nvs
            .lock()
            .map_err(|_| SettingsError::Storage("NVS lock poisoned".into()))
    }
}

impl SettingsStore for NvsSettings {
    fn get_str(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let nvs = self.lock(key)?;
        let Some(len) = nvs.str_len(key).map_err(|e| storage_error(key, e))? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len + 1];
        let value = nvs
            .get_str(key, &mut buf)
            .map_err(|e| storage_error(key, e))?;
        Ok(value.map(|v| v.trim_end_matches('\0').to_string()))
    }

    fn set_str(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.lock(key)?
            .set_str(key, value)
            .map_err(|e| storage_error(key, e))
    }

    fn get_u16(&self, key: &str) -> Result<Option<u16>, SettingsError> {
        self.lock(key)?.get_u16(key).map_err(|e| storage_error(key, e))
    }

    fn set_u16(&self, key: &str, value: u16) -> Result<(), SettingsError> {
        self.lock(key)?
            .set_u16(key, value)
            .map_err(|e| storage_error(key, e))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, SettingsError> {
        self.lock(key)?.get_u32(key).map_err(|e| storage_error(key, e))
    }

    fn set_u32(&self, key: &str, value: u32) -> Result<(), SettingsError> {
        self.lock(key)?
            .set_u32(key, value)
            .map_err(|e| storage_error(key, e))
    }

    /// Stored as the 4 little-endian bytes of the value
    fn get_f32(&self, key: &str) -> Result<Option<f32>, SettingsError> {
        let nvs = self.lock(key)?;
        let mut buf = [0u8; 4];
        let Some(bytes) = nvs.get_raw(key, &mut buf).map_err(|e| storage_error(key, e))? else {
            return Ok(None);
        };
        if bytes.len() != 4 {
            return Err(SettingsError::TypeMismatch(key.to_string()));
        }
        let value = f32::from_le_bytes(buf);
        if value.is_nan() {
            return Err(SettingsError::Storage(format!("{}: stored value is NaN", key)));
        }
        Ok(Some(value))
    }

    fn set_f32(&self, key: &str, value: f32) -> Result<(), SettingsError> {
        self.lock(key)?
            .set_raw(key, &value.to_le_bytes())
            .map(|_| ())
            .map_err(|e| storage_error(key, e))
    }
}
