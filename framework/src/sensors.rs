/// Analog front-end abstraction for hardware independence
/// Enables host-side testing and simulation of the acquisition path

/// Largest code produced by a 12-bit SAR ADC
pub const ADC_MAX_CODE: i32 = 4095;

/// ADC input attenuation
///
/// Attenuation sets the measurable input range. The full-scale values are the
/// nominal ranges for the ESP32-C6 and are only used when no calibration
/// scheme is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attenuation {
    Db0,
    #[default]
    Db2_5,
    Db6,
    Db12,
}

impl Attenuation {
    /// Nominal full-scale input voltage in millivolts
    pub fn full_scale_mv(self) -> i32 {
        match self {
            Attenuation::Db0 => 950,
            Attenuation::Db2_5 => 1250,
            Attenuation::Db6 => 1750,
            Attenuation::Db12 => 3100,
        }
    }

    /// Uncorrected linear conversion of a raw code
    pub fn uncorrected_mv(self, code: i32) -> i32 {
        let code = code.clamp(0, ADC_MAX_CODE) as i64;
        (code * self.full_scale_mv() as i64 / ADC_MAX_CODE as i64) as i32
    }
}

/// ADC channel number on unit 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcChannel(pub u8);

/// Errors that can occur when reading the analog front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("ADC read failed (esp_err {0})")]
    Read(i32),
    #[error("ADC not initialized")]
    NotReady,
}

/// Abstraction for a single analog input
/// Implementations: ESP-IDF oneshot ADC, simulated sources
pub trait AnalogSource {
    /// Perform one conversion and return the raw code
    fn read_raw(&mut self) -> Result<i32, SensorError>;

    /// Channel this source samples
    fn channel(&self) -> AdcChannel;

    /// Attenuation configured on the channel
    fn attenuation(&self) -> Attenuation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncorrected_conversion_spans_full_scale() {
        let atten = Attenuation::Db2_5;
        assert_eq!(atten.uncorrected_mv(0), 0);
        assert_eq!(atten.uncorrected_mv(ADC_MAX_CODE), 1250);
        assert_eq!(atten.uncorrected_mv(ADC_MAX_CODE / 2), 624);
    }

    #[test]
    fn uncorrected_conversion_clamps_out_of_range_codes() {
        assert_eq!(Attenuation::Db12.uncorrected_mv(-5), 0);
        assert_eq!(Attenuation::Db12.uncorrected_mv(10_000), 3100);
    }
}
