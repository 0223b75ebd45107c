//! Heap and uptime monitoring, hardware RNG
use std::sync::{Arc, Mutex};

use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::sys;
use log::{debug, info, warn};
use pressure_telemetry::session::TrustAnchorStore;
use pressure_telemetry::settings::RandomSource;
use pressure_telemetry::telemetry::format_device_snapshot;
use pressure_telemetry::{
    settings, BrokerTransport, ConnectionRegister, ReadingStore, Session, SettingsStore,
    SystemStatus, TopicNamespace,
};

/// Current heap and uptime figures
pub fn system_status() -> SystemStatus {
    unsafe {
        SystemStatus {
            free_heap: sys::esp_get_free_heap_size(),
            min_free_heap: sys::esp_get_minimum_free_heap_size(),
            time_since_boot: (sys::esp_timer_get_time() / 1000) as u64,
        }
    }
}

/// `esp_random`, true random once the radio is running
pub struct EspRandom;

impl RandomSource for EspRandom {
    fn next_u32(&mut self) -> u32 {
        unsafe { sys::esp_random() }
    }
}

/// Shared state the status monitor reports on
pub struct StatusMonitor<T, A, S>
where
    T: BrokerTransport,
    A: TrustAnchorStore,
    S: SettingsStore,
{
    pub session: Arc<Mutex<Session<T, A>>>,
    pub register: Arc<ConnectionRegister>,
    pub readings: Arc<ReadingStore>,
    pub settings: S,
    pub topics: TopicNamespace,
    pub interval_ms: u32,
}

impl<T, A, S> StatusMonitor<T, A, S>
where
    T: BrokerTransport,
    A: TrustAnchorStore,
    S: SettingsStore,
{
    /// Log heap and uptime every interval; publish them while connected
    pub fn run(self) -> ! {
        loop {
            let status = system_status();
            info!(
                "=== System Status === free heap {} B, min free heap {} B, uptime {} s",
                status.free_heap,
                status.min_free_heap,
                status.time_since_boot / 1000
            );

            if self.register.is_connected() {
                self.publish(&status);
            } else {
                debug!("MQTT not connected, diagnostics not published");
            }

            FreeRtos::delay_ms(self.interval_ms);
        }
    }

    fn publish(&self, status: &SystemStatus) {
        let mode = match settings::connection_mode(&self.settings) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Settings: {}", e);
                return;
            }
        };

        let latest = self.readings.latest();
        let payload = match format_device_snapshot(status, latest.as_ref()).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Diagnostics encoding failed: {}", e);
                return;
            }
        };

        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stats = session.stats();
        match session.publish(mode, &self.topics.diagnostics(), &payload, false) {
            Ok(()) => debug!(
                "Diagnostics published ({} ok / {} failed so far)",
                stats.published(),
                stats.failed()
            ),
            Err(e) => warn!("Diagnostics publish failed: {}", e),
        }
    }
}
