//! ADC calibration adapter
//!
//! Converts raw ADC codes to millivolts using the best calibration scheme the
//! chip offers. Curve fitting is tried first, then line fitting. When neither
//! is available (unsupported chip, or the eFuse calibration values were never
//! burnt) the adapter keeps working with the uncorrected linear conversion and
//! reports itself as uncalibrated.
//!
//! The adapter never fails the acquisition pipeline. Callers check
//! [`RawSample::is_calibrated`] or [`CalibrationAdapter::is_calibrated`] to
//! judge how far a value can be trusted.

use log::{info, warn};

use crate::sensors::{AdcChannel, Attenuation};

/// Hardware calibration schemes in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationScheme {
    CurveFitting,
    LineFitting,
}

impl CalibrationScheme {
    /// Schemes in the order they are attempted
    pub const PREFERENCE: [CalibrationScheme; 2] =
        [CalibrationScheme::CurveFitting, CalibrationScheme::LineFitting];

    pub fn name(self) -> &'static str {
        match self {
            CalibrationScheme::CurveFitting => "Curve Fitting",
            CalibrationScheme::LineFitting => "Line Fitting",
        }
    }
}

/// Reasons a calibration scheme could not be created or applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration scheme not supported on this chip")]
    NotSupported,
    #[error("eFuse calibration values not burnt")]
    EfuseNotBurnt,
    #[error("invalid argument or out of memory")]
    InvalidArg,
    #[error("calibration driver error (esp_err {0})")]
    Driver(i32),
}

/// Chip-specific calibration driver
///
/// `Handle` is whatever the driver needs to keep a scheme alive. The adapter
/// owns the handle from [`create_scheme`](Self::create_scheme) until it hands
/// it back to [`delete_scheme`](Self::delete_scheme).
pub trait CalibrationBackend {
    type Handle;

    fn create_scheme(
        &mut self,
        scheme: CalibrationScheme,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<Self::Handle, CalibrationError>;

    fn raw_to_millivolts(
        &mut self,
        handle: &Self::Handle,
        raw: i32,
    ) -> Result<i32, CalibrationError>;

    fn delete_scheme(&mut self, scheme: CalibrationScheme, handle: Self::Handle);
}

/// One converted ADC read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Raw ADC code
    pub code: i32,
    /// Calibrated value, present only if a scheme converted this code
    pub calibrated_mv: Option<i32>,
    /// Linear estimate from the nominal attenuation range
    pub uncorrected_mv: i32,
}

impl RawSample {
    /// Best available millivolt value
    pub fn millivolts(&self) -> i32 {
        self.calibrated_mv.unwrap_or(self.uncorrected_mv)
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated_mv.is_some()
    }
}

/// Calibration-aware raw code converter
///
/// Dropping the adapter releases whichever scheme was initialized.
pub struct CalibrationAdapter<B: CalibrationBackend> {
    backend: B,
    active: Option<(CalibrationScheme, B::Handle)>,
    attenuation: Attenuation,
}

impl<B: CalibrationBackend> CalibrationAdapter<B> {
    /// Select the best available scheme for `channel`
    pub fn init(mut backend: B, channel: AdcChannel, attenuation: Attenuation) -> Self {
        let mut active = None;

        for scheme in CalibrationScheme::PREFERENCE {
            info!("ADC calibration scheme version is {}", scheme.name());
            match backend.create_scheme(scheme, channel, attenuation) {
                Ok(handle) => {
                    active = Some((scheme, handle));
                    break;
                }
                Err(CalibrationError::NotSupported) | Err(CalibrationError::EfuseNotBurnt) => {
                    continue;
                }
                Err(e) => {
                    warn!("ADC calibration {} failed: {}", scheme.name(), e);
                }
            }
        }

        match &active {
            Some((scheme, _)) => info!("ADC calibration success ({})", scheme.name()),
            None => warn!("eFuse not burnt or no scheme available, skip software calibration"),
        }

        Self {
            backend,
            active,
            attenuation,
        }
    }

    /// Convert a raw code, falling back to the uncorrected estimate
    pub fn convert(&mut self, code: i32) -> RawSample {
        let uncorrected_mv = self.attenuation.uncorrected_mv(code);

        let calibrated_mv = match &self.active {
            Some((_, handle)) => match self.backend.raw_to_millivolts(handle, code) {
                Ok(mv) => Some(mv),
                Err(e) => {
                    warn!("ADC calibrated conversion of code {} failed: {}", code, e);
                    None
                }
            },
            None => None,
        };

        RawSample {
            code,
            calibrated_mv,
            uncorrected_mv,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.active.is_some()
    }

    /// Scheme currently in use, if any
    pub fn scheme(&self) -> Option<CalibrationScheme> {
        self.active.as_ref().map(|(scheme, _)| *scheme)
    }
}

impl<B: CalibrationBackend> Drop for CalibrationAdapter<B> {
    fn drop(&mut self) {
        if let Some((scheme, handle)) = self.active.take() {
            info!("Deregister {} calibration scheme", scheme.name());
            self.backend.delete_scheme(scheme, handle);
        }
    }
}
