//! Home Assistant MQTT discovery documents
//!
//! One retained configuration document per advertised metric. Consumers
//! extract the metric from the aggregated state message through
//! `value_template`, so every metric name must be a key of that message.

use serde::Serialize;

use crate::settings::DeviceIdentity;
use crate::topics::{TopicError, TopicNamespace};

pub const MANUFACTURER: &str = "espressif";
pub const MODEL: &str = "esp32";
pub const ORIGIN_NAME: &str = "ESP-IDF";
pub const ORIGIN_URL: &str = "https://github.com/espressif/esp-idf";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("broker not connected, discovery skipped")]
    NotConnected,
    #[error("discovery field '{0}' is empty")]
    MissingField(&'static str),
    #[error("metric name '{0}' must match [a-z0-9_]+")]
    InvalidMetricName(String),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("serialize discovery document: {0}")]
    Serialize(String),
    #[error("{failed} of {attempted} discovery messages failed")]
    Publish { failed: usize, attempted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Pressure,
    Voltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
}

/// A metric advertised to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metric {
    /// Key in the aggregated state message
    pub name: &'static str,
    pub unit: &'static str,
    pub device_class: DeviceClass,
    pub state_class: StateClass,
}

pub const PRESSURE: Metric = Metric {
    name: "pressure",
    unit: "Pa",
    device_class: DeviceClass::Pressure,
    state_class: StateClass::Measurement,
};

pub const VOLTAGE: Metric = Metric {
    name: "voltage",
    unit: "V",
    device_class: DeviceClass::Voltage,
    state_class: StateClass::Measurement,
};

pub const VOLTAGE_RAW: Metric = Metric {
    name: "voltage_raw",
    unit: "mV",
    device_class: DeviceClass::Voltage,
    state_class: StateClass::Measurement,
};

pub const VOLTAGE_OFFSET: Metric = Metric {
    name: "voltage_offset",
    unit: "V",
    device_class: DeviceClass::Voltage,
    state_class: StateClass::Measurement,
};

pub const ADVERTISED_METRICS: [Metric; 4] = [PRESSURE, VOLTAGE, VOLTAGE_RAW, VOLTAGE_OFFSET];

pub fn validate_metric_name(name: &str) -> Result<(), DiscoveryError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(DiscoveryError::InvalidMetricName(name.to_string()))
    }
}

/// Static description of the hardware, shared by every document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub manufacturer: String,
    pub model: String,
    /// `http://<ip>/`
    pub configuration_url: String,
    pub origin_sw: String,
}

impl DeviceProfile {
    /// `origin_sw` is the ESP-IDF version string the firmware runs on
    pub fn new(ip: impl std::fmt::Display, origin_sw: impl Into<String>) -> Self {
        Self {
            manufacturer: MANUFACTURER.into(),
            model: MODEL.into(),
            configuration_url: format!("http://{}/", ip),
            origin_sw: origin_sw.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    configuration_url: String,
    manufacturer: String,
    model: String,
    name: String,
    via_device: String,
    identifiers: [String; 1],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    name: String,
    sw: String,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    topic: String,
}

/// Complete configuration document; only obtainable through [`DiscoveryBuilder`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDocument {
    device: Device,
    origin: Origin,
    availability: [Availability; 1],
    device_class: DeviceClass,
    enabled_by_default: bool,
    json_attributes_topic: String,
    object_id: String,
    state_class: StateClass,
    state_topic: String,
    unique_id: String,
    unit_of_measurement: String,
    value_template: String,
}

impl DiscoveryDocument {
    pub fn builder() -> DiscoveryBuilder {
        DiscoveryBuilder::default()
    }

    /// Document for `metric` of the node described by the other arguments
    pub fn for_metric(
        profile: &DeviceProfile,
        identity: &DeviceIdentity,
        topics: &TopicNamespace,
        metric: &Metric,
    ) -> Result<Self, DiscoveryError> {
        Self::builder()
            .profile(profile)
            .identity(identity)
            .topics(topics)
            .metric(metric)
            .build()
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn to_json(&self) -> Result<String, DiscoveryError> {
        serde_json::to_string(self).map_err(|e| DiscoveryError::Serialize(e.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryBuilder {
    profile: Option<DeviceProfile>,
    identity: Option<DeviceIdentity>,
    state_topic: Option<String>,
    availability_topic: Option<String>,
    metric: Option<Metric>,
}

fn required(name: &'static str, value: &str) -> Result<String, DiscoveryError> {
    if value.trim().is_empty() {
        Err(DiscoveryError::MissingField(name))
    } else {
        Ok(value.to_string())
    }
}

impl DiscoveryBuilder {
    pub fn profile(mut self, profile: &DeviceProfile) -> Self {
        self.profile = Some(profile.clone());
        self
    }

    pub fn identity(mut self, identity: &DeviceIdentity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    /// State and availability topics of the node
    pub fn topics(mut self, topics: &TopicNamespace) -> Self {
        self.state_topic = Some(topics.envelope());
        self.availability_topic = Some(topics.availability());
        self
    }

    pub fn metric(mut self, metric: &Metric) -> Self {
        self.metric = Some(*metric);
        self
    }

    /// Fails unless every string field of the document is non-empty
    pub fn build(self) -> Result<DiscoveryDocument, DiscoveryError> {
        let profile = self.profile.ok_or(DiscoveryError::MissingField("device"))?;
        let identity = self.identity.ok_or(DiscoveryError::MissingField("name"))?;
        let state_topic = self
            .state_topic
            .ok_or(DiscoveryError::MissingField("state_topic"))?;
        let availability_topic = self
            .availability_topic
            .ok_or(DiscoveryError::MissingField("availability"))?;
        let metric = self.metric.ok_or(DiscoveryError::MissingField("metric"))?;

        validate_metric_name(metric.name)?;
        let device_id = required("name", &identity.device_id)?;
        let serial = required("identifiers", &identity.serial)?;

        Ok(DiscoveryDocument {
            device: Device {
                configuration_url: required("configuration_url", &profile.configuration_url)?,
                manufacturer: required("manufacturer", &profile.manufacturer)?,
                model: required("model", &profile.model)?,
                name: device_id.clone(),
                via_device: device_id.clone(),
                identifiers: [serial.clone()],
            },
            origin: Origin {
                name: ORIGIN_NAME.into(),
                sw: required("sw", &profile.origin_sw)?,
                url: ORIGIN_URL.into(),
            },
            availability: [Availability {
                topic: required("availability", &availability_topic)?,
            }],
            device_class: metric.device_class,
            enabled_by_default: true,
            json_attributes_topic: required("json_attributes_topic", &state_topic)?,
            object_id: format!("{}_{}", device_id, metric.name),
            state_class: metric.state_class,
            state_topic,
            unique_id: format!("{}_{}_{}", device_id, serial, metric.name),
            unit_of_measurement: required("unit_of_measurement", metric.unit)?,
            value_template: format!("{{{{ value_json.{} }}}}", metric.name),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reading::{FilteredReading, SensorCalibration};
    use crate::telemetry::format_envelope;

    pub(crate) fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "A1B2C3D4E5F6".into(),
            serial: "Q7W3E9R1T5Y2U8I4O6P0A3S5D7F9G1H2".into(),
        }
    }

    pub(crate) fn topics() -> TopicNamespace {
        TopicNamespace::new("pressure_sensor/", "A1B2C3D4E5F6").unwrap()
    }

    #[test]
    fn test_pressure_document() {
        let doc =
            DiscoveryDocument::for_metric(&DeviceProfile::new("192.168.1.50", "v5.2.2"), &identity(), &topics(), &PRESSURE)
                .unwrap();
        let json: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_eq!(json["object_id"], "A1B2C3D4E5F6_pressure");
        assert_eq!(
            json["unique_id"],
            "A1B2C3D4E5F6_Q7W3E9R1T5Y2U8I4O6P0A3S5D7F9G1H2_pressure"
        );
        assert_eq!(json["value_template"], "{{ value_json.pressure }}");
        assert_eq!(json["unit_of_measurement"], "Pa");
        assert_eq!(json["device_class"], "pressure");
        assert_eq!(json["state_class"], "measurement");
        assert_eq!(json["enabled_by_default"], true);
        assert_eq!(json["state_topic"], "pressure_sensor/A1B2C3D4E5F6/sensor");
        assert_eq!(
            json["json_attributes_topic"],
            "pressure_sensor/A1B2C3D4E5F6/sensor"
        );
        assert_eq!(
            json["availability"][0]["topic"],
            "pressure_sensor/A1B2C3D4E5F6/status"
        );
        assert_eq!(json["device"]["configuration_url"], "http://192.168.1.50/");
        assert_eq!(json["device"]["manufacturer"], "espressif");
        assert_eq!(
            json["device"]["identifiers"][0],
            "Q7W3E9R1T5Y2U8I4O6P0A3S5D7F9G1H2"
        );
        assert_eq!(json["origin"]["url"], ORIGIN_URL);
        assert_eq!(json["origin"]["name"], "ESP-IDF");
        assert_eq!(json["origin"]["sw"], "v5.2.2");
    }

    #[test]
    fn test_voltage_raw_document_units() {
        let doc = DiscoveryDocument::for_metric(
            &DeviceProfile::new("10.0.0.2", "v5.2.2"),
            &identity(),
            &topics(),
            &VOLTAGE_RAW,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(json["unit_of_measurement"], "mV");
        assert_eq!(json["device_class"], "voltage");
        assert_eq!(doc.object_id(), "A1B2C3D4E5F6_voltage_raw");
    }

    #[test]
    fn test_advertised_metrics_are_envelope_keys() {
        let reading = FilteredReading::from_millivolts(500.0, &SensorCalibration::default());
        let envelope: serde_json::Value =
            serde_json::from_str(&format_envelope(&reading).to_json().unwrap()).unwrap();
        for metric in ADVERTISED_METRICS {
            assert!(validate_metric_name(metric.name).is_ok());
            assert!(envelope.get(metric.name).is_some(), "{}", metric.name);
        }
    }

    #[test]
    fn test_incomplete_document_is_rejected() {
        let mut profile = DeviceProfile::new("10.0.0.2", "v5.2.2");
        profile.configuration_url.clear();
        assert_eq!(
            DiscoveryDocument::for_metric(&profile, &identity(), &topics(), &VOLTAGE),
            Err(DiscoveryError::MissingField("configuration_url"))
        );

        assert_eq!(
            DiscoveryDocument::for_metric(&DeviceProfile::new("10.0.0.2", ""), &identity(), &topics(), &VOLTAGE),
            Err(DiscoveryError::MissingField("sw"))
        );

        let mut blank = identity();
        blank.serial = String::new();
        assert_eq!(
            DiscoveryDocument::for_metric(&DeviceProfile::new("10.0.0.2", "v5.2.2"), &blank, &topics(), &VOLTAGE),
            Err(DiscoveryError::MissingField("identifiers"))
        );

        assert_eq!(
            DiscoveryDocument::builder()
                .identity(&identity())
                .metric(&VOLTAGE)
                .build(),
            Err(DiscoveryError::MissingField("device"))
        );
    }

    #[test]
    fn test_metric_name_charset() {
        assert!(validate_metric_name("voltage_raw").is_ok());
        assert!(validate_metric_name("pm25").is_ok());
        assert!(validate_metric_name("").is_err());
        assert!(validate_metric_name("Voltage").is_err());
        assert!(validate_metric_name("value json").is_err());
        assert!(validate_metric_name("volt}}").is_err());
    }
}
