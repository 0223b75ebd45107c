/// Compile-time configuration of the pressure node
///
/// Broker, topic and sampling parameters are runtime settings stored in NVS
/// (see `pressure_telemetry::settings`). Only what must be known before NVS
/// and the network are up lives here.
use pressure_telemetry::sensors::{AdcChannel, Attenuation};
use pressure_telemetry::RegistrarConfig;

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network to join in station mode
    pub wifi_ssid: &'static str,
    /// WiFi password (empty for an open network)
    pub wifi_password: &'static str,
    /// Retry delay while the access point is unreachable (ms)
    pub retry_interval_ms: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            // Placeholders - set via environment variables at build time
            wifi_ssid: "PressureNode",
            wifi_password: "",
            retry_interval_ms: 5000,
        }
    }
}

/// Analog front end
#[derive(Debug, Clone, Copy)]
pub struct AdcConfig {
    /// ADC1 channel the transducer is wired to (GPIO3 on the ESP32-C6)
    pub channel: AdcChannel,
    pub attenuation: Attenuation,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            channel: AdcChannel(3),
            attenuation: Attenuation::Db2_5,
        }
    }
}

/// Background task sizing
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    pub sampler_stack: usize,
    pub registrar_stack: usize,
    pub status_stack: usize,
    /// Period of the heap/uptime report (ms)
    pub status_interval_ms: u32,
    /// Pause before re-reading settings after a configuration fault (ms)
    pub settings_retry_ms: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sampler_stack: 8192,
            registrar_stack: 8192,
            status_stack: 4096,
            status_interval_ms: 10_000,
            settings_retry_ms: 5000,
        }
    }
}

/// Master system configuration
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub network: NetworkConfig,
    pub adc: AdcConfig,
    pub tasks: TaskConfig,
    pub registrar: RegistrarConfig,
}

impl SystemConfig {
    /// Create configuration from environment variables (compile-time)
    ///
    /// ```bash
    /// export WIFI_SSID="YourNetworkName"
    /// export WIFI_PASSWORD="YourPassword"
    /// export DISCOVERY_INTERVAL_MS="60000"   # optional
    /// cargo build --release
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.network.wifi_ssid = ssid;
        }
        if let Some(password) = option_env!("WIFI_PASSWORD") {
            config.network.wifi_password = password;
        }
        if let Some(interval) = option_env!("DISCOVERY_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            config.registrar.interval_ms = interval;
        }
        if let Some(interval) = option_env!("STATUS_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            config.tasks.status_interval_ms = interval;
        }

        config
    }
}
