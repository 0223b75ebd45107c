//! Runs the acquisition and publishing pipeline of one node on the host
//!
//! A simulated transducer produces a slowly rising voltage with noise and the
//! occasional spike. Each cycle is sampled, filtered, stored and published to
//! an in-process broker that prints every message, followed by one discovery
//! round.
//!
//! Run with: cargo run -p pressure-telemetry --example node_sim

use std::sync::{Arc, Mutex};

use embedded_hal::delay::DelayNs;
use pressure_telemetry::calibration::CalibrationError;
use pressure_telemetry::session::{ConnectOptions, LinkEvent, NoTrustAnchor, QoS, TransportError};
use pressure_telemetry::run_cycle;
use pressure_telemetry::settings::{self, RandomSource};
use pressure_telemetry::{
    AdcChannel, AnalogSource, Attenuation, BrokerTransport, CalibrationAdapter, CalibrationBackend,
    CalibrationScheme, ConnectionRegister, DeviceProfile, MemorySettings, NetworkReady,
    ReadingStore, Registrar, RegistrarConfig, Sampler, SensorError, Session, SettingsStore,
    TopicNamespace,
};

/// Simple pseudo-random generator (deterministic for reproducibility)
struct Lcg {
    state: u32,
}

impl Lcg {
    fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Uniform in [-amplitude, +amplitude]
    fn noise(&mut self, amplitude: f32) -> f32 {
        let normalized = (self.next_u32() as f32 / u32::MAX as f32) * 2.0 - 1.0;
        normalized * amplitude
    }
}

impl RandomSource for Lcg {
    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1103515245).wrapping_add(12345);
        self.state
    }
}

/// Transducer at 0.5 V plus a ramp, with a spike every 7th read
struct SimulatedTransducer {
    reads: u32,
    noise: Lcg,
}

impl AnalogSource for SimulatedTransducer {
    fn read_raw(&mut self) -> Result<i32, SensorError> {
        self.reads += 1;
        let mut mv = 500.0 + self.reads as f32 * 0.2 + self.noise.noise(3.0);
        if self.reads % 7 == 0 {
            mv *= 1.6;
        }
        Ok((mv / 1250.0 * 4095.0) as i32)
    }

    fn channel(&self) -> AdcChannel {
        AdcChannel(3)
    }

    fn attenuation(&self) -> Attenuation {
        Attenuation::Db2_5
    }
}

/// Curve fitting with a fixed +4 mV correction
struct SimulatedCalibration;

impl CalibrationBackend for SimulatedCalibration {
    type Handle = ();

    fn create_scheme(
        &mut self,
        scheme: CalibrationScheme,
        _channel: AdcChannel,
        _attenuation: Attenuation,
    ) -> Result<(), CalibrationError> {
        match scheme {
            CalibrationScheme::CurveFitting => Ok(()),
            CalibrationScheme::LineFitting => Err(CalibrationError::NotSupported),
        }
    }

    fn raw_to_millivolts(&mut self, _handle: &(), raw: i32) -> Result<i32, CalibrationError> {
        Ok(Attenuation::Db2_5.uncorrected_mv(raw) + 4)
    }

    fn delete_scheme(&mut self, scheme: CalibrationScheme, _handle: ()) {
        println!("  released {} scheme", scheme.name());
    }
}

/// Broker that prints what it receives
struct PrintingBroker;

impl BrokerTransport for PrintingBroker {
    fn connect(
        &mut self,
        options: &ConnectOptions,
        register: &Arc<ConnectionRegister>,
    ) -> Result<(), TransportError> {
        println!("  CONNECT {} (client {:?})", options.url, options.client_id);
        register.apply(LinkEvent::Acknowledged).ok();
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        println!(
            "  {} {} = {}",
            if retain { "RETAIN " } else { "PUBLISH" },
            topic,
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        println!("  DISCONNECT");
    }
}

struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

fn main() {
    println!("=== Pressure Node Simulation ===\n");

    let store = MemorySettings::new();
    let mut rng = Lcg::new(42);
    let identity = match settings::init_defaults(&store, [0x24, 0x58, 0x7C, 0x11, 0x22, 0x33], &mut rng) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("settings: {}", e);
            return;
        }
    };
    println!("Device {} serial {}\n", identity.device_id, identity.serial);

    let topics = match settings::mqtt_prefix(&store)
        .map_err(|e| e.to_string())
        .and_then(|prefix| TopicNamespace::new(&prefix, &identity.device_id).map_err(|e| e.to_string()))
    {
        Ok(topics) => topics,
        Err(e) => {
            eprintln!("topics: {}", e);
            return;
        }
    };

    let register = Arc::new(ConnectionRegister::new());
    let network = Arc::new(NetworkReady::new(true));
    let endpoint = match settings::broker_endpoint(&store, &identity) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("broker settings: {}", e);
            return;
        }
    };
    let session = Mutex::new(
        Session::new(PrintingBroker, NoTrustAnchor, endpoint, register.clone(), network)
            .with_last_will(topics.availability()),
    );

    let source = SimulatedTransducer {
        reads: 0,
        noise: Lcg::new(7),
    };
    let adapter = CalibrationAdapter::init(SimulatedCalibration, source.channel(), source.attenuation());
    let mut sampler = Sampler::new(source, adapter, NoDelay);
    let readings = ReadingStore::new();

    for cycle in 1..=5 {
        println!("Cycle {}", cycle);
        if cycle == 3 {
            // Unknown mode: the cycle is skipped, nothing is sampled or sent
            let mode = store.get_u16(settings::keys::MQTT_MODE).ok().flatten();
            store.set_u16(settings::keys::MQTT_MODE, 7).ok();
            if let Err(e) = run_cycle(&store, &identity, &mut sampler, &session, &topics, &readings) {
                println!("  {}", e);
            }
            if let Some(mode) = mode {
                store.set_u16(settings::keys::MQTT_MODE, mode).ok();
            }
            continue;
        }

        match run_cycle(&store, &identity, &mut sampler, &session, &topics, &readings) {
            Ok((reading, report)) => println!(
                "  {:.3} V -> {:.2} Pa, {} messages",
                reading.voltage, reading.pressure, report.published
            ),
            Err(e) => eprintln!("  cycle failed: {}", e),
        }
    }

    println!("\nDiscovery");
    let (hub_prefix, mode) = match (settings::hub_prefix(&store), settings::connection_mode(&store)) {
        (Ok(prefix), Ok(mode)) => (prefix, mode),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("discovery settings: {}", e);
            return;
        }
    };
    let mut registrar = Registrar::new(
        register,
        DeviceProfile::new("192.168.4.1", "v5.2.2"),
        RegistrarConfig::default(),
        NoDelay,
    );
    match registrar.publish_discovery(&session, mode, &identity, &topics, &hub_prefix) {
        Ok(count) => println!("  {} discovery documents", count),
        Err(e) => eprintln!("  discovery failed: {}", e),
    }

    if let Some(latest) = readings.latest() {
        println!("\nLatest: {:.3} V -> {:.2} Pa", latest.voltage, latest.pressure);
    }

    let stats = session.lock().unwrap_or_else(|p| p.into_inner()).stats();
    println!(
        "Published {} messages, {} failed, {} connects",
        stats.published(),
        stats.failed(),
        stats.connects()
    );

    session.lock().unwrap_or_else(|p| p.into_inner()).teardown();
}
