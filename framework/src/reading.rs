//! Latest filtered reading and the conversion from voltage to pressure

use std::sync::{Mutex, MutexGuard};

/// Linear transducer parameters, read from settings every cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorCalibration {
    /// Output voltage at zero pressure (V)
    pub voltage_offset: f32,
    /// Pascal per volt above the offset
    pub linear_multiplier: u32,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            voltage_offset: 0.471,
            linear_multiplier: 250_000,
        }
    }
}

impl SensorCalibration {
    /// `(voltage - offset) * multiplier`
    pub fn pressure(&self, voltage: f32) -> f32 {
        (voltage - self.voltage_offset) * self.linear_multiplier as f32
    }
}

/// One measurement cycle's result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredReading {
    /// Filtered voltage (V)
    pub voltage: f32,
    /// Filtered voltage rounded (not truncated) to whole millivolts
    pub voltage_raw: i32,
    /// Derived pressure (Pa)
    pub pressure: f32,
    /// Offset the pressure was derived with (V)
    pub voltage_offset: f32,
    /// Multiplier the pressure was derived with
    pub linear_multiplier: u32,
}

impl FilteredReading {
    pub fn from_millivolts(millivolts: f32, calibration: &SensorCalibration) -> Self {
        let voltage = millivolts / 1000.0;
        Self {
            voltage,
            voltage_raw: millivolts.round() as i32,
            pressure: calibration.pressure(voltage),
            voltage_offset: calibration.voltage_offset,
            linear_multiplier: calibration.linear_multiplier,
        }
    }
}

/// Thread-safe holder for the most recent reading
///
/// The sampler overwrites the value once per cycle; any task may take a copy.
#[derive(Debug, Default)]
pub struct ReadingStore {
    latest: Mutex<Option<FilteredReading>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, reading: FilteredReading) {
        *self.lock() = Some(reading);
    }

    /// Copy of the latest reading, `None` before the first cycle completes
    pub fn latest(&self) -> Option<FilteredReading> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<FilteredReading>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_from_reference_point() {
        let cal = SensorCalibration::default();
        let reading = FilteredReading::from_millivolts(500.0, &cal);

        assert!((reading.voltage - 0.5).abs() < 1e-6);
        assert_eq!(reading.voltage_raw, 500);
        assert!(
            (reading.pressure - 7250.0).abs() < 0.5,
            "pressure {}",
            reading.pressure
        );
    }

    #[test]
    fn test_pressure_with_negative_offset() {
        let cal = SensorCalibration {
            voltage_offset: -0.25,
            linear_multiplier: 1000,
        };
        let reading = FilteredReading::from_millivolts(750.0, &cal);
        assert!((reading.pressure - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn test_pressure_below_offset_is_negative() {
        let cal = SensorCalibration::default();
        let reading = FilteredReading::from_millivolts(100.0, &cal);
        assert!(reading.pressure < 0.0);
        assert_eq!(
            reading.pressure,
            (reading.voltage - reading.voltage_offset) * reading.linear_multiplier as f32
        );
    }

    #[test]
    fn test_voltage_raw_rounds_filtered_value() {
        let reading = FilteredReading::from_millivolts(50.25, &SensorCalibration::default());
        assert_eq!(reading.voltage_raw, 50);
        assert!((reading.voltage - 0.05025).abs() < 1e-6);

        let reading = FilteredReading::from_millivolts(50.6, &SensorCalibration::default());
        assert_eq!(reading.voltage_raw, 51);
    }

    #[test]
    fn test_store_overwrites() {
        let store = ReadingStore::new();
        assert!(store.latest().is_none());

        let cal = SensorCalibration::default();
        store.update(FilteredReading::from_millivolts(100.0, &cal));
        store.update(FilteredReading::from_millivolts(200.0, &cal));
        assert_eq!(store.latest().unwrap().voltage_raw, 200);
    }
}
