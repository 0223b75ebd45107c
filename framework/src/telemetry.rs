//! Wire formatting of readings
//!
//! Scalars go out one per topic as plain text with a fixed number of decimals.
//! The aggregated message carries every field as JSON and is what the
//! discovery documents' value templates extract from.

use serde::Serialize;

use crate::reading::FilteredReading;

/// Reading fields published as individual scalar messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Voltage,
    VoltageRaw,
    VoltageOffset,
    Pressure,
    LinearMultiplier,
}

impl Field {
    /// Publish order of the scalar messages
    pub const ALL: [Field; 5] = [
        Field::Voltage,
        Field::VoltageRaw,
        Field::VoltageOffset,
        Field::Pressure,
        Field::LinearMultiplier,
    ];

    /// Last topic segment for this field
    pub fn topic_leaf(self) -> &'static str {
        match self {
            Field::Voltage => "voltage",
            Field::VoltageRaw => "voltage_raw",
            Field::VoltageOffset => "voltage_offset",
            Field::Pressure => "pressure",
            Field::LinearMultiplier => "multiplier",
        }
    }
}

/// Render one field: 3 decimals for voltages, 2 for pressure, integers otherwise
pub fn format_scalar(reading: &FilteredReading, field: Field) -> String {
    match field {
        Field::Voltage => format!("{:.3}", reading.voltage),
        Field::VoltageRaw => reading.voltage_raw.to_string(),
        Field::VoltageOffset => format!("{:.3}", reading.voltage_offset),
        Field::Pressure => format!("{:.2}", reading.pressure),
        Field::LinearMultiplier => reading.linear_multiplier.to_string(),
    }
}

/// Aggregated state message
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Envelope {
    pub pressure: f32,
    pub voltage: f32,
    pub voltage_offset: f32,
    pub sensor_linear_multiplier: u32,
    pub voltage_raw: i32,
}

impl Envelope {
    /// Shortest round-trip rendering of the f32 fields
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn format_envelope(reading: &FilteredReading) -> Envelope {
    Envelope {
        pressure: reading.pressure,
        voltage: reading.voltage,
        voltage_offset: reading.voltage_offset,
        sensor_linear_multiplier: reading.linear_multiplier,
        voltage_raw: reading.voltage_raw,
    }
}

/// Heap and uptime snapshot of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SystemStatus {
    /// Free heap (bytes)
    pub free_heap: u32,
    /// Lowest free heap since boot (bytes)
    pub min_free_heap: u32,
    /// Time since boot (ms)
    pub time_since_boot: u64,
}

/// Sensor state and system status in one document
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub sensor: Option<Envelope>,
    pub status: SystemStatus,
}

impl DeviceSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn format_device_snapshot(
    status: &SystemStatus,
    reading: Option<&FilteredReading>,
) -> DeviceSnapshot {
    DeviceSnapshot {
        sensor: reading.map(format_envelope),
        status: *status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{FilteredReading, SensorCalibration};

    fn reading() -> FilteredReading {
        FilteredReading::from_millivolts(500.0, &SensorCalibration::default())
    }

    #[test]
    fn test_scalar_precision() {
        let r = reading();
        assert_eq!(format_scalar(&r, Field::Voltage), "0.500");
        assert_eq!(format_scalar(&r, Field::VoltageRaw), "500");
        assert_eq!(format_scalar(&r, Field::VoltageOffset), "0.471");
        assert_eq!(format_scalar(&r, Field::LinearMultiplier), "250000");

        let pressure = format_scalar(&r, Field::Pressure);
        let (_, decimals) = pressure.split_once('.').unwrap();
        assert_eq!(decimals.len(), 2);
        assert!((pressure.parse::<f32>().unwrap() - 7250.0).abs() < 0.5);
    }

    #[test]
    fn test_voltage_scenario_renders_three_decimals() {
        let r = FilteredReading::from_millivolts(100.0, &SensorCalibration::default());
        assert_eq!(format_scalar(&r, Field::Voltage), "0.100");
    }

    #[test]
    fn test_envelope_fields() {
        let json = format_envelope(&reading()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj.len(), 5);
        assert_eq!(obj["sensor_linear_multiplier"], 250000);
        assert_eq!(obj["voltage_raw"], 500);
        assert!(obj["pressure"].is_f64());
        assert!(obj["voltage"].is_f64());
        assert!(obj["voltage_offset"].is_f64());
    }

    #[test]
    fn test_envelope_keeps_f32_digits_short() {
        let json = format_envelope(&reading()).to_json().unwrap();
        assert!(json.contains("\"voltage_offset\":0.471"), "{}", json);
        assert!(json.contains("\"voltage\":0.5"), "{}", json);
    }

    #[test]
    fn test_topic_leaves_are_unique() {
        for (i, a) in Field::ALL.iter().enumerate() {
            for b in &Field::ALL[i + 1..] {
                assert_ne!(a.topic_leaf(), b.topic_leaf());
            }
        }
    }

    #[test]
    fn test_device_snapshot() {
        let status = SystemStatus {
            free_heap: 120_000,
            min_free_heap: 90_000,
            time_since_boot: 61_000,
        };
        let json = format_device_snapshot(&status, Some(&reading()))
            .to_json()
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["status"]["free_heap"], 120_000);
        assert_eq!(doc["status"]["time_since_boot"], 61_000);
        assert_eq!(doc["sensor"]["voltage_raw"], 500);

        let empty: serde_json::Value =
            serde_json::from_str(&format_device_snapshot(&status, None).to_json().unwrap())
                .unwrap();
        assert!(empty["sensor"].is_null());
    }
}
