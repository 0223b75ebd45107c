/// WiFi station manager
///
/// Publishes link state through the shared [`NetworkReady`] flag so the MQTT
/// session can fail fast while the network is down.
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::anyhow;
use esp_idf_hal::peripheral;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_svc::sys::{self, esp};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use log::{info, warn};
use pressure_telemetry::NetworkReady;

pub struct WifiManager {
    wifi: BlockingWifi<EspWifi<'static>>,
    ready: Arc<NetworkReady>,
}

impl WifiManager {
    pub fn new(
        modem: impl peripheral::Peripheral<P = esp_idf_hal::modem::Modem> + 'static,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        ready: Arc<NetworkReady>,
    ) -> anyhow::Result<Self> {
        let wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), nvs)?, sysloop)?;
        Ok(Self { wifi, ready })
    }

    /// Connect to an existing WiFi network (STA mode)
    pub fn connect(&mut self, ssid: &str, password: &str) -> anyhow::Result<Ipv4Addr> {
        info!("Setting WiFi configuration (STA mode)");
        let wifi_config = Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("SSID too long: {}", ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("WiFi password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });

        self.wifi.set_configuration(&wifi_config)?;

        if !self.wifi.is_started()? {
            info!("Starting WiFi");
            self.wifi.start()?;
        }

        info!("Connecting to AP {}", ssid);
        self.wifi.connect()?;

        info!("Waiting for DHCP lease");
        self.wifi.wait_netif_up()?;

        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        info!("WiFi connected! IP: {}", ip_info.ip);

        self.ready.set(true);
        Ok(ip_info.ip)
    }

    /// Station MAC from eFuse, the source of the device id
    ///
    /// Readable before the radio is started or associated.
    pub fn mac() -> anyhow::Result<[u8; 6]> {
        let mut mac = [0u8; 6];
        esp!(unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA) })?;
        Ok(mac)
    }

    /// Current station address, `None` until DHCP completed
    pub fn ip(&self) -> Option<Ipv4Addr> {
        if !self.wifi.is_connected().unwrap_or(false) {
            return None;
        }
        let ip = self.wifi.wifi().sta_netif().get_ip_info().ok()?.ip;
        (!ip.is_unspecified()).then_some(ip)
    }

    /// Refresh the readiness flag, reconnecting if the link dropped
    pub fn supervise(&mut self, ssid: &str, password: &str) -> bool {
        if self.wifi.is_connected().unwrap_or(false) {
            self.ready.set(true);
            return true;
        }

        self.ready.set(false);
        if self.wifi.is_started().unwrap_or(false) {
            warn!("WiFi link down, reconnecting");
        }
        match self.connect(ssid, password) {
            Ok(_) => true,
            Err(e) => {
                warn!("WiFi reconnect failed: {:?}", e);
                false
            }
        }
    }
}
