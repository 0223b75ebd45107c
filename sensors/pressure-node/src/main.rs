mod adc;
mod cert_store;
mod config;
mod mqtt;
mod nvs_storage;
mod system;
mod wifi;

use std::ffi::CStr;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;

use adc::{EspCalibration, OneshotAdc};
use anyhow::Context;
use cert_store::SpiffsTrustAnchor;
use config::{AdcConfig, SystemConfig};
use esp_idf_hal::{delay::FreeRtos, peripherals::Peripherals};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use log::{error, info, warn};
use mqtt::EspMqttTransport;
use nvs_storage::NvsSettings;
use pressure_telemetry::{
    run_cycle, settings, CalibrationAdapter, ConnectionRegister, CycleError, DeviceIdentity,
    DeviceProfile, NetworkReady, ReadingStore, Registrar, RegistrarConfig, Sampler, Session,
    TopicNamespace,
};
use system::{EspRandom, StatusMonitor};
use wifi::WifiManager;

type NodeSession = Session<EspMqttTransport, SpiffsTrustAnchor>;
/// Station address once DHCP completed
type SharedAddress = Arc<Mutex<Option<Ipv4Addr>>>;

fn main() {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = run() {
        error!("Startup failed: {:?}", e);
        error!("Restarting in 10s");
        FreeRtos::delay_ms(10_000);
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn run() -> anyhow::Result<()> {
    let config = SystemConfig::from_env();

    info!("=== Pressure Telemetry Node ===");
    info!(
        "SSID: {}, ADC channel {}, status every {}s",
        config.network.wifi_ssid,
        config.adc.channel.0,
        config.tasks.status_interval_ms / 1000
    );

    let peripherals = Peripherals::take().context("peripherals already taken")?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let store = Arc::new(NvsSettings::new(nvs_partition.clone())?);

    if let Err(e) = cert_store::mount_spiffs() {
        warn!("SPIFFS unavailable, TLS brokers cannot be used: {}", e);
    }

    let identity = settings::init_defaults(&store, WifiManager::mac()?, &mut EspRandom)?;
    info!(
        "Device id {}, serial {}",
        identity.device_id, identity.serial
    );

    let topics = TopicNamespace::new(&settings::mqtt_prefix(&store)?, &identity.device_id)?;
    let endpoint = settings::broker_endpoint(&store, &identity)?;
    info!("MQTT broker: {:?}", endpoint);

    let network = Arc::new(NetworkReady::new(false));
    let register = Arc::new(ConnectionRegister::new());
    let session: Arc<Mutex<NodeSession>> = Arc::new(Mutex::new(
        Session::new(
            EspMqttTransport::new(),
            SpiffsTrustAnchor,
            endpoint,
            register.clone(),
            network.clone(),
        )
        .with_last_will(topics.availability()),
    ));
    let readings = Arc::new(ReadingStore::new());
    let address: SharedAddress = Arc::new(Mutex::new(None));

    spawn_sampler(
        &config,
        store.clone(),
        session.clone(),
        readings.clone(),
        topics.clone(),
        identity.clone(),
    )?;
    spawn_registrar(
        &config,
        store.clone(),
        session.clone(),
        register.clone(),
        topics.clone(),
        identity,
        address.clone(),
    )?;

    let monitor = StatusMonitor {
        session,
        register,
        readings,
        settings: store,
        topics,
        interval_ms: config.tasks.status_interval_ms,
    };
    thread::Builder::new()
        .name("status".into())
        .stack_size(config.tasks.status_stack)
        .spawn(move || monitor.run())
        .context("spawning status task")?;

    info!("All tasks started, initializing WiFi");
    let mut wifi = WifiManager::new(peripherals.modem, sysloop, Some(nvs_partition), network)?;

    loop {
        if wifi.supervise(config.network.wifi_ssid, config.network.wifi_password) {
            *address.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = wifi.ip();
        }
        FreeRtos::delay_ms(config.network.retry_interval_ms);
    }
}

fn spawn_sampler(
    config: &SystemConfig,
    store: Arc<NvsSettings>,
    session: Arc<Mutex<NodeSession>>,
    readings: Arc<ReadingStore>,
    topics: TopicNamespace,
    identity: DeviceIdentity,
) -> anyhow::Result<()> {
    let adc_config = config.adc;
    let retry_ms = config.tasks.settings_retry_ms;
    thread::Builder::new()
        .name("sampler".into())
        .stack_size(config.tasks.sampler_stack)
        .spawn(move || {
            sampler_task(adc_config, retry_ms, store, session, readings, topics, identity)
        })
        .context("spawning sampler task")?;
    Ok(())
}

/// Measure, store and publish, forever
///
/// The ADC and calibration handles are raw driver pointers, so they are
/// created on this thread and never leave it.
fn sampler_task(
    adc_config: AdcConfig,
    retry_ms: u32,
    store: Arc<NvsSettings>,
    session: Arc<Mutex<NodeSession>>,
    readings: Arc<ReadingStore>,
    topics: TopicNamespace,
    identity: DeviceIdentity,
) {
    let source = match OneshotAdc::new(adc_config.channel, adc_config.attenuation) {
        Ok(source) => source,
        Err(e) => {
            error!("ADC init failed: {}", e);
            return;
        }
    };
    let adapter = CalibrationAdapter::init(EspCalibration, adc_config.channel, adc_config.attenuation);
    let mut sampler = Sampler::new(source, adapter, FreeRtos);
    if !sampler.is_calibrated() {
        warn!("ADC not calibrated, readings use the nominal attenuation range");
    }

    loop {
        match run_cycle(&store, &identity, &mut sampler, &session, &topics, &readings) {
            Ok((_, report)) if report.suppressed => {}
            Ok((_, report)) => info!("Published {} messages", report.published),
            Err(e @ CycleError::Settings(_)) => warn!("{}", e),
            Err(e) => warn!("Cycle failed: {}", e),
        }

        let interval = match settings::read_interval_ms(&store) {
            Ok(interval) => interval,
            Err(e) => {
                warn!("Read interval: {}, retrying in {}ms", e, retry_ms);
                retry_ms
            }
        };
        FreeRtos::delay_ms(interval);
    }
}

fn spawn_registrar(
    config: &SystemConfig,
    store: Arc<NvsSettings>,
    session: Arc<Mutex<NodeSession>>,
    register: Arc<ConnectionRegister>,
    topics: TopicNamespace,
    identity: DeviceIdentity,
    address: SharedAddress,
) -> anyhow::Result<()> {
    let registrar_config: RegistrarConfig = config.registrar;
    let sw = idf_version();
    thread::Builder::new()
        .name("registrar".into())
        .stack_size(config.tasks.registrar_stack)
        .spawn(move || {
            let mut announced = Ipv4Addr::UNSPECIFIED;
            let mut registrar = Registrar::new(
                register,
                DeviceProfile::new(announced, sw.clone()),
                registrar_config,
                FreeRtos,
            );
            loop {
                let ip = *address.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(ip) = ip.filter(|ip| *ip != announced) {
                    registrar.set_profile(DeviceProfile::new(ip, sw.clone()));
                    announced = ip;
                }

                let (mode, hub_prefix) =
                    match (settings::connection_mode(&store), settings::hub_prefix(&store)) {
                        (Ok(mode), Ok(prefix)) => (mode, prefix),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!("Discovery settings: {}, round skipped", e);
                            FreeRtos::delay_ms(registrar.config().interval_ms);
                            continue;
                        }
                    };

                match registrar.publish_discovery(&session, mode, &identity, &topics, &hub_prefix) {
                    Ok(0) => {}
                    Ok(count) => info!("Discovery: {} sensors announced", count),
                    Err(e) => warn!("Discovery failed: {}", e),
                }

                FreeRtos::delay_ms(registrar.config().interval_ms);
            }
        })
        .context("spawning registrar task")?;
    Ok(())
}

/// ESP-IDF version string, reported as the discovery origin
fn idf_version() -> String {
    unsafe { CStr::from_ptr(esp_idf_svc::sys::esp_get_idf_version()) }
        .to_string_lossy()
        .into_owned()
}
