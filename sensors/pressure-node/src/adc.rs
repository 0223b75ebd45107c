//! ESP-IDF oneshot ADC and calibration drivers
//!
//! Wraps the `esp_adc` C API directly. The handles are raw pointers, so both
//! types are created on the task that uses them.

use core::ptr;

use esp_idf_svc::sys::{self, esp, EspError};
use log::{info, warn};
use pressure_telemetry::calibration::CalibrationError;
use pressure_telemetry::sensors::{AdcChannel, AnalogSource, Attenuation, SensorError};
use pressure_telemetry::{CalibrationBackend, CalibrationScheme};

fn sys_attenuation(attenuation: Attenuation) -> sys::adc_atten_t {
    match attenuation {
        Attenuation::Db0 => sys::adc_atten_t_ADC_ATTEN_DB_0,
        Attenuation::Db2_5 => sys::adc_atten_t_ADC_ATTEN_DB_2_5,
        Attenuation::Db6 => sys::adc_atten_t_ADC_ATTEN_DB_6,
        Attenuation::Db12 => sys::adc_atten_t_ADC_ATTEN_DB_12,
    }
}

/// ADC1 in oneshot mode with a single configured channel
pub struct OneshotAdc {
    unit: sys::adc_oneshot_unit_handle_t,
    channel: AdcChannel,
    attenuation: Attenuation,
}

impl OneshotAdc {
    pub fn new(channel: AdcChannel, attenuation: Attenuation) -> Result<Self, EspError> {
        let mut unit: sys::adc_oneshot_unit_handle_t = ptr::null_mut();
        let unit_config = sys::adc_oneshot_unit_init_cfg_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            ..Default::default()
        };
        esp!(unsafe { sys::adc_oneshot_new_unit(&unit_config, &mut unit) })?;

        let channel_config = sys::adc_oneshot_chan_cfg_t {
            atten: sys_attenuation(attenuation),
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_DEFAULT,
        };
        if let Err(e) = esp!(unsafe {
            sys::adc_oneshot_config_channel(unit, channel.0 as sys::adc_channel_t, &channel_config)
        }) {
            unsafe { sys::adc_oneshot_del_unit(unit) };
            return Err(e);
        }

        info!("ADC1 channel {} configured ({:?})", channel.0, attenuation);
        Ok(Self {
            unit,
            channel,
            attenuation,
        })
    }
}

impl AnalogSource for OneshotAdc {
    fn read_raw(&mut self) -> Result<i32, SensorError> {
        let mut raw = 0;
        esp!(unsafe {
            sys::adc_oneshot_read(self.unit, self.channel.0 as sys::adc_channel_t, &mut raw)
        })
        .map_err(|e| SensorError::Read(e.code()))?;
        Ok(raw)
    }

    fn channel(&self) -> AdcChannel {
        self.channel
    }

    fn attenuation(&self) -> Attenuation {
        self.attenuation
    }
}

impl Drop for OneshotAdc {
    fn drop(&mut self) {
        if let Err(e) = esp!(unsafe { sys::adc_oneshot_del_unit(self.unit) }) {
            warn!("ADC unit release failed: {}", e);
        }
    }
}

const ERR_NOT_SUPPORTED: sys::esp_err_t = sys::ESP_ERR_NOT_SUPPORTED as sys::esp_err_t;
const ERR_INVALID_ARG: sys::esp_err_t = sys::ESP_ERR_INVALID_ARG as sys::esp_err_t;
const ERR_NO_MEM: sys::esp_err_t = sys::ESP_ERR_NO_MEM as sys::esp_err_t;

fn calibration_error(err: EspError, not_supported: CalibrationError) -> CalibrationError {
    match err.code() {
        ERR_NOT_SUPPORTED => not_supported,
        ERR_INVALID_ARG | ERR_NO_MEM => CalibrationError::InvalidArg,
        code => CalibrationError::Driver(code),
    }
}

/// Calibration schemes of the `esp_adc` driver
///
/// Curve fitting exists on the ESP32-C3/C6/S3/H2, line fitting on the
/// ESP32/S2. The other scheme reports [`CalibrationError::NotSupported`].
#[derive(Debug, Default)]
pub struct EspCalibration;

impl CalibrationBackend for EspCalibration {
    type Handle = sys::adc_cali_handle_t;

    fn create_scheme(
        &mut self,
        scheme: CalibrationScheme,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<Self::Handle, CalibrationError> {
        match scheme {
            CalibrationScheme::CurveFitting => curve_fitting::create(channel, attenuation),
            CalibrationScheme::LineFitting => line_fitting::create(channel, attenuation),
        }
    }

    fn raw_to_millivolts(&mut self, handle: &Self::Handle, raw: i32) -> Result<i32, CalibrationError> {
        let mut millivolts = 0;
        esp!(unsafe { sys::adc_cali_raw_to_voltage(*handle, raw, &mut millivolts) })
            .map_err(|e| calibration_error(e, CalibrationError::NotSupported))?;
        Ok(millivolts)
    }

    fn delete_scheme(&mut self, scheme: CalibrationScheme, handle: Self::Handle) {
        let result = match scheme {
            CalibrationScheme::CurveFitting => curve_fitting::delete(handle),
            CalibrationScheme::LineFitting => line_fitting::delete(handle),
        };
        match result {
            Ok(()) => info!("Deregistered {} calibration scheme", scheme.name()),
            Err(e) => warn!("Releasing {} calibration failed: {}", scheme.name(), e),
        }
    }
}

#[cfg(any(esp32c3, esp32c6, esp32s3, esp32h2))]
mod curve_fitting {
    use super::*;

    pub fn create(
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<sys::adc_cali_handle_t, CalibrationError> {
        let config = sys::adc_cali_curve_fitting_config_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            chan: channel.0 as sys::adc_channel_t,
            atten: sys_attenuation(attenuation),
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_DEFAULT,
        };
        let mut handle: sys::adc_cali_handle_t = ptr::null_mut();
        esp!(unsafe { sys::adc_cali_create_scheme_curve_fitting(&config, &mut handle) })
            .map_err(|e| calibration_error(e, CalibrationError::EfuseNotBurnt))?;
        Ok(handle)
    }

    pub fn delete(handle: sys::adc_cali_handle_t) -> Result<(), EspError> {
        esp!(unsafe { sys::adc_cali_delete_scheme_curve_fitting(handle) })
    }
}

#[cfg(not(any(esp32c3, esp32c6, esp32s3, esp32h2)))]
mod curve_fitting {
    use super::*;

    pub fn create(
        _channel: AdcChannel,
        _attenuation: Attenuation,
    ) -> Result<sys::adc_cali_handle_t, CalibrationError> {
        Err(CalibrationError::NotSupported)
    }

    pub fn delete(_handle: sys::adc_cali_handle_t) -> Result<(), EspError> {
        Ok(())
    }
}

#[cfg(any(esp32, esp32s2))]
mod line_fitting {
    use super::*;

    pub fn create(
        _channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<sys::adc_cali_handle_t, CalibrationError> {
        let config = sys::adc_cali_line_fitting_config_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            atten: sys_attenuation(attenuation),
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_DEFAULT,
            ..Default::default()
        };
        let mut handle: sys::adc_cali_handle_t = ptr::null_mut();
        esp!(unsafe { sys::adc_cali_create_scheme_line_fitting(&config, &mut handle) })
            .map_err(|e| calibration_error(e, CalibrationError::EfuseNotBurnt))?;
        Ok(handle)
    }

    pub fn delete(handle: sys::adc_cali_handle_t) -> Result<(), EspError> {
        esp!(unsafe { sys::adc_cali_delete_scheme_line_fitting(handle) })
    }
}

#[cfg(not(any(esp32, esp32s2)))]
mod line_fitting {
    use super::*;

    pub fn create(
        _channel: AdcChannel,
        _attenuation: Attenuation,
    ) -> Result<sys::adc_cali_handle_t, CalibrationError> {
        Err(CalibrationError::NotSupported)
    }

    pub fn delete(_handle: sys::adc_cali_handle_t) -> Result<(), EspError> {
        Ok(())
    }
}
