//! One measurement cycle: settings, sampling, store update, publish
//!
//! Settings are read before the ADC is touched. A missing or invalid value
//! aborts the cycle; nothing is sampled, stored or published.

use std::sync::Mutex;

use embedded_hal::delay::DelayNs;
use log::{debug, info};

use crate::calibration::CalibrationBackend;
use crate::reading::{FilteredReading, ReadingStore, SensorCalibration};
use crate::sampler::{Sampler, SamplingError, SamplingPolicy};
use crate::sensors::AnalogSource;
use crate::session::{
    BrokerEndpoint, BrokerTransport, ConnectionMode, PublishReport, Session, SessionError,
    TrustAnchorStore,
};
use crate::settings::{self, DeviceIdentity, SettingsError, SettingsStore};
use crate::topics::TopicNamespace;

/// Everything one cycle reads from settings
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSettings {
    pub policy: SamplingPolicy,
    pub calibration: SensorCalibration,
    pub mode: ConnectionMode,
    pub endpoint: BrokerEndpoint,
}

impl CycleSettings {
    pub fn load(
        store: &impl SettingsStore,
        identity: &DeviceIdentity,
    ) -> Result<Self, SettingsError> {
        Ok(Self {
            policy: settings::sampling_policy(store)?,
            calibration: settings::sensor_calibration(store)?,
            mode: settings::connection_mode(store)?,
            endpoint: settings::broker_endpoint(store, identity)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    #[error("configuration fault, cycle skipped: {0}")]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    /// The reading was stored but not (completely) published
    #[error(transparent)]
    Publish(#[from] SessionError),
}

/// Run one cycle and return the reading together with the publish report
pub fn run_cycle<St, S, B, D, T, A>(
    store: &St,
    identity: &DeviceIdentity,
    sampler: &mut Sampler<S, B, D>,
    session: &Mutex<Session<T, A>>,
    topics: &TopicNamespace,
    readings: &ReadingStore,
) -> Result<(FilteredReading, PublishReport), CycleError>
where
    St: SettingsStore,
    S: AnalogSource,
    B: CalibrationBackend,
    D: DelayNs,
    T: BrokerTransport,
    A: TrustAnchorStore,
{
    let config = CycleSettings::load(store, identity)?;

    let batch = sampler.sample(&config.policy)?;
    let reading = FilteredReading::from_millivolts(batch.millivolts, &config.calibration);
    info!(
        "Pressure {:.2} Pa, {:.3} V ({}/{} samples kept)",
        reading.pressure, reading.voltage, batch.retained, batch.total
    );
    readings.update(reading);

    let mut session = session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    session.set_endpoint(config.endpoint);
    let report = session.publish_reading(config.mode, topics, &reading)?;
    debug!("Cycle published {} messages", report.published);

    Ok((reading, report))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::calibration::tests::FakeBackend;
    use crate::calibration::{CalibrationAdapter, CalibrationScheme};
    use crate::sensors::{AdcChannel, Attenuation, SensorError};
    use crate::session::tests::{session, MockTransport};
    use crate::settings::{keys, MemorySettings, RandomSource};

    /// Constant code; counts how often the ADC was read
    struct CountingSource {
        code: i32,
        reads: Arc<AtomicUsize>,
    }

    impl AnalogSource for CountingSource {
        fn read_raw(&mut self) -> Result<i32, SensorError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.code)
        }

        fn channel(&self) -> AdcChannel {
            AdcChannel(3)
        }

        fn attenuation(&self) -> Attenuation {
            Attenuation::Db2_5
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    struct Counter(u32);

    impl RandomSource for Counter {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0
        }
    }

    struct Node {
        store: MemorySettings,
        identity: DeviceIdentity,
        sampler: Sampler<CountingSource, FakeBackend, NoDelay>,
        reads: Arc<AtomicUsize>,
        transport: MockTransport,
        session: Mutex<Session<MockTransport>>,
        topics: TopicNamespace,
        readings: ReadingStore,
    }

    fn node() -> Node {
        let store = MemorySettings::new();
        let identity = settings::init_defaults(&store, [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6], &mut Counter(0))
            .unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let adapter = CalibrationAdapter::init(
            FakeBackend::with(&[CalibrationScheme::CurveFitting]),
            AdcChannel(3),
            Attenuation::Db2_5,
        );
        let sampler = Sampler::new(
            CountingSource {
                code: 500,
                reads: reads.clone(),
            },
            adapter,
            NoDelay,
        );
        let transport = MockTransport::default();
        let session = Mutex::new(session(&transport));
        let topics = TopicNamespace::new("pressure_sensor/", &identity.device_id).unwrap();

        Node {
            store,
            identity,
            sampler,
            reads,
            transport,
            session,
            topics,
            readings: ReadingStore::new(),
        }
    }

    fn run(n: &mut Node) -> Result<(FilteredReading, PublishReport), CycleError> {
        run_cycle(
            &n.store,
            &n.identity,
            &mut n.sampler,
            &n.session,
            &n.topics,
            &n.readings,
        )
    }

    #[test]
    fn test_cycle_samples_stores_and_publishes() {
        let mut n = node();
        let (reading, report) = run(&mut n).unwrap();

        assert_eq!(n.reads.load(Ordering::SeqCst), 10);
        assert_eq!(reading.voltage_raw, 500);
        assert_eq!(n.readings.latest(), Some(reading));
        assert_eq!(report.published, 6);
        assert_eq!(n.transport.wire.lock().unwrap().messages.len(), 6);
    }

    #[test]
    fn test_missing_calibration_key_aborts_cycle() {
        let mut n = node();
        let store = MemorySettings::new();
        for key in [keys::SAMPLE_COUNT, keys::SAMPLE_INTERVAL, keys::MQTT_MODE] {
            store.set_u16(key, n.store.get_u16(key).unwrap().unwrap()).unwrap();
        }
        store
            .set_f32(keys::DEVIATION, n.store.get_f32(keys::DEVIATION).unwrap().unwrap())
            .unwrap();
        n.store = store;

        assert_eq!(
            run(&mut n),
            Err(CycleError::Settings(SettingsError::Missing(
                keys::SENSOR_OFFSET
            )))
        );
        assert_eq!(n.reads.load(Ordering::SeqCst), 0);
        assert_eq!(n.readings.latest(), None);
        let wire = n.transport.wire.lock().unwrap();
        assert_eq!(wire.connects, 0);
        assert!(wire.messages.is_empty());
    }

    #[test]
    fn test_unknown_mode_is_not_treated_as_reconnect() {
        let mut n = node();
        n.store.set_u16(keys::MQTT_MODE, 9).unwrap();

        assert!(matches!(
            run(&mut n),
            Err(CycleError::Settings(SettingsError::InvalidValue {
                key: "mqtt_mode",
                ..
            }))
        ));
        assert_eq!(n.transport.wire.lock().unwrap().connects, 0);
        assert!(n.transport.wire.lock().unwrap().messages.is_empty());
    }

    #[test]
    fn test_cycle_recovers_once_settings_are_fixed() {
        let mut n = node();
        n.store.set_u16(keys::SAMPLE_COUNT, 0).unwrap();
        assert!(run(&mut n).is_err());
        assert_eq!(n.reads.load(Ordering::SeqCst), 0);

        n.store.set_u16(keys::SAMPLE_COUNT, 3).unwrap();
        let (_, report) = run(&mut n).unwrap();
        assert_eq!(n.reads.load(Ordering::SeqCst), 3);
        assert_eq!(report.published, 6);
    }

    #[test]
    fn test_publish_failure_keeps_stored_reading() {
        let mut n = node();
        n.transport.refuse_connect.store(true, Ordering::SeqCst);

        assert!(matches!(run(&mut n), Err(CycleError::Publish(_))));
        assert!(n.readings.latest().is_some());
    }
}
