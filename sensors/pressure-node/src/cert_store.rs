//! Broker CA certificate on the SPIFFS partition

use std::fs;
use std::io::ErrorKind;

use esp_idf_svc::sys::{self, esp, EspError};
use log::{info, warn};
use pressure_telemetry::session::{TransportError, TrustAnchorStore};

pub const MOUNT_POINT: &core::ffi::CStr = c"/spiffs";
pub const CA_PATH: &str = "/spiffs/mqtt_ca.pem";

/// Mount the default SPIFFS partition, formatting it if it cannot be mounted
pub fn mount_spiffs() -> Result<(), EspError> {
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: MOUNT_POINT.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 2,
        format_if_mount_failed: true,
    };
    esp!(unsafe { sys::esp_vfs_spiffs_register(&conf) })?;

    let (mut total, mut used) = (0usize, 0usize);
    if esp!(unsafe { sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used) }).is_ok() {
        info!("SPIFFS mounted: {} of {} bytes used", used, total);
    }
    Ok(())
}

/// PEM file at [`CA_PATH`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SpiffsTrustAnchor;

impl TrustAnchorStore for SpiffsTrustAnchor {
    fn load(&self) -> Result<Option<String>, TransportError> {
        match fs::read_to_string(CA_PATH) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("No broker CA certificate at {}", CA_PATH);
                Ok(None)
            }
            Err(e) => Err(TransportError::Storage(format!("{}: {}", CA_PATH, e))),
        }
    }

    fn save(&self, pem: &str) -> Result<(), TransportError> {
        fs::write(CA_PATH, pem).map_err(|e| TransportError::Storage(format!("{}: {}", CA_PATH, e)))?;
        info!("Broker CA certificate stored ({} bytes)", pem.len());
        Ok(())
    }
}
