//! Pressure Telemetry Framework
//!
//! Hardware-independent core of an analog pressure telemetry node: turn raw
//! ADC codes into calibrated, outlier-filtered pressure readings and publish
//! them over MQTT together with Home Assistant discovery documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ AnalogSource │──▶│ Calibration  │──▶│   Sampler    │
//! └──────────────┘   │   Adapter    │   │ (median/out- │
//!                    └──────────────┘   │  lier filter)│
//!                                       └──────┬───────┘
//!                                              ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Registrar   │──▶│   Session    │◀──│ ReadingStore │
//! │ (discovery)  │   │ (MQTT state) │   │ + formatter  │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! Hardware is reached only through traits ([`sensors::AnalogSource`],
//! [`calibration::CalibrationBackend`], [`session::BrokerTransport`],
//! [`settings::SettingsStore`]) so the whole pipeline runs on the host.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pressure_telemetry::{settings, FilteredReading, MemorySettings, SettingsStore, TopicNamespace};
//!
//! let store = MemorySettings::new();
//! store.set_f32(settings::keys::SENSOR_OFFSET, 0.471).unwrap();
//! store.set_u32(settings::keys::SENSOR_MULTIPLIER, 250_000).unwrap();
//! let calibration = settings::sensor_calibration(&store).unwrap();
//! let reading = FilteredReading::from_millivolts(512.0, &calibration);
//!
//! let topics = TopicNamespace::new("pressure_sensor/", "A1B2C3D4E5F6").unwrap();
//! println!("{} -> {:.2} Pa", topics.envelope(), reading.pressure);
//! ```
//!
//! ## Modules
//!
//! - [`sensors`] - ADC source trait and attenuation ranges
//! - [`calibration`] - Calibration scheme selection and code conversion
//! - [`sampler`] - Median and outlier rejection over one cycle
//! - [`reading`] - Pressure derivation and the latest-reading store
//! - [`cycle`] - One measurement cycle from settings to publish
//! - [`telemetry`] - Scalar and JSON wire formats
//! - [`topics`] - Topic namespace
//! - [`session`] - Broker connection state machine and reconnect policy
//! - [`discovery`] - Home Assistant discovery documents
//! - [`registrar`] - Periodic discovery publication
//! - [`settings`] - Persistent settings model and device identity

pub mod calibration;
pub mod cycle;
pub mod discovery;
pub mod reading;
pub mod registrar;
pub mod sampler;
pub mod sensors;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod topics;

// Re-export commonly used types
pub use calibration::{CalibrationAdapter, CalibrationBackend, CalibrationScheme, RawSample};
pub use cycle::{run_cycle, CycleError, CycleSettings};
pub use discovery::{DeviceProfile, DiscoveryDocument, DiscoveryError};
pub use reading::{FilteredReading, ReadingStore, SensorCalibration};
pub use registrar::{Registrar, RegistrarConfig};
pub use sampler::{SampleBatch, Sampler, SamplingError, SamplingPolicy};
pub use sensors::{AdcChannel, AnalogSource, Attenuation, SensorError};
pub use session::{
    BrokerEndpoint, BrokerTransport, ConnectionMode, ConnectionRegister, ConnectionState,
    NetworkReady, Session, SessionError, TransportScheme,
};
pub use settings::{DeviceIdentity, MemorySettings, SettingsError, SettingsStore};
pub use telemetry::{Envelope, Field, SystemStatus};
pub use topics::TopicNamespace;
