//! Outlier-robust averaging of analog reads
//!
//! One measurement cycle collects `sample_count` reads through the
//! calibration adapter, computes their median, discards samples that deviate
//! from the median by more than the configured percentage, and averages the
//! rest. If nothing survives the filter the median itself is the reading.

use embedded_hal::delay::DelayNs;
use log::{debug, warn};

use crate::calibration::{CalibrationAdapter, CalibrationBackend};
use crate::sensors::{AnalogSource, SensorError};

/// Sampling parameters, read fresh from settings every cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    /// Reads per measurement cycle (>= 1)
    pub sample_count: u16,
    /// Delay between consecutive reads (ms)
    pub sample_interval_ms: u16,
    /// Maximum deviation from the median to keep a sample (%)
    pub deviation_threshold_percent: f32,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            sample_count: 10,
            sample_interval_ms: 50,
            deviation_threshold_percent: 10.0,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<(), SamplingError> {
        if self.sample_count == 0 {
            return Err(SamplingError::InvalidPolicy("sample_count must be at least 1"));
        }
        if !self.deviation_threshold_percent.is_finite() || self.deviation_threshold_percent < 0.0
        {
            return Err(SamplingError::InvalidPolicy(
                "deviation threshold must be a non-negative number",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("invalid sampling policy: {0}")]
    InvalidPolicy(&'static str),
    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// Median of `values`, sorting them in place
///
/// Even-length input yields the arithmetic mean of the two central elements.
/// Returns `None` for an empty slice.
pub fn median(values: &mut [i32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] as f32 + values[mid] as f32) / 2.0)
    } else {
        Some(values[mid] as f32)
    }
}

/// Result of median-based outlier rejection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterOutcome {
    /// Mean of the retained samples, or the median if none were retained
    pub value: f32,
    /// Number of samples that passed the filter
    pub retained: usize,
}

/// Average the samples within `threshold_percent` of `median`
///
/// A zero median makes the percentage deviation undefined. In that case every
/// sample is kept and the plain mean is returned.
pub fn reject_outliers(values: &[i32], median: f32, threshold_percent: f32) -> FilterOutcome {
    if values.is_empty() {
        return FilterOutcome {
            value: median,
            retained: 0,
        };
    }

    if median == 0.0 {
        warn!("Median of samples is zero, keeping all {} samples", values.len());
        let sum: f64 = values.iter().map(|&v| v as f64).sum();
        return FilterOutcome {
            value: (sum / values.len() as f64) as f32,
            retained: values.len(),
        };
    }

    let mut sum = 0.0f64;
    let mut retained = 0usize;
    for &sample in values {
        let deviation = ((sample as f32 - median) / median * 100.0).abs();
        if deviation <= threshold_percent {
            sum += sample as f64;
            retained += 1;
        }
    }

    if retained == 0 {
        warn!("No valid samples after filtering, falling back to median");
        return FilterOutcome {
            value: median,
            retained: 0,
        };
    }

    FilterOutcome {
        value: (sum / retained as f64) as f32,
        retained,
    }
}

/// One filtered measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleBatch {
    /// Filtered value (mV)
    pub millivolts: f32,
    /// Median of the batch (mV)
    pub median: f32,
    /// Samples that passed the deviation filter
    pub retained: usize,
    /// Samples collected
    pub total: usize,
    /// Whether every sample in the batch went through a calibration scheme
    pub calibrated: bool,
}

/// Drives repeated reads through the calibration adapter
pub struct Sampler<S, B, D>
where
    S: AnalogSource,
    B: CalibrationBackend,
    D: DelayNs,
{
    source: S,
    adapter: CalibrationAdapter<B>,
    delay: D,
    buffer: Vec<i32>,
}

impl<S, B, D> Sampler<S, B, D>
where
    S: AnalogSource,
    B: CalibrationBackend,
    D: DelayNs,
{
    pub fn new(source: S, adapter: CalibrationAdapter<B>, delay: D) -> Self {
        Self {
            source,
            adapter,
            delay,
            buffer: Vec::new(),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.adapter.is_calibrated()
    }

    /// Run one measurement cycle
    pub fn sample(&mut self, policy: &SamplingPolicy) -> Result<SampleBatch, SamplingError> {
        policy.validate()?;

        let count = policy.sample_count as usize;
        self.buffer.clear();
        self.buffer.reserve(count);

        let mut calibrated = true;
        for i in 0..count {
            let code = self.source.read_raw()?;
            let sample = self.adapter.convert(code);
            calibrated &= sample.is_calibrated();
            self.buffer.push(sample.millivolts());

            if i + 1 < count {
                self.delay.delay_ms(policy.sample_interval_ms as u32);
            }
        }

        let median = median(&mut self.buffer).unwrap_or(0.0);
        let filtered = reject_outliers(&self.buffer, median, policy.deviation_threshold_percent);

        debug!(
            "Sampling: {} samples, median {:.1} mV, kept {}, result {:.2} mV",
            count, median, filtered.retained, filtered.value
        );

        Ok(SampleBatch {
            millivolts: filtered.value,
            median,
            retained: filtered.retained,
            total: count,
            calibrated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;
    use crate::calibration::tests::FakeBackend;
    use crate::calibration::CalibrationScheme;
    use crate::sensors::{AdcChannel, Attenuation};

    struct ScriptedSource {
        codes: VecDeque<i32>,
    }

    impl AnalogSource for ScriptedSource {
        fn read_raw(&mut self) -> Result<i32, SensorError> {
            self.codes.pop_front().ok_or(SensorError::NotReady)
        }

        fn channel(&self) -> AdcChannel {
            AdcChannel(3)
        }

        fn attenuation(&self) -> Attenuation {
            Attenuation::Db2_5
        }
    }

    #[derive(Default)]
    struct RecordingDelay {
        calls: Vec<u32>,
    }

    impl DelayNs for RecordingDelay {
        fn delay_ns(&mut self, _ns: u32) {}

        fn delay_ms(&mut self, ms: u32) {
            self.calls.push(ms);
        }
    }

    fn sampler(codes: &[i32]) -> Sampler<ScriptedSource, FakeBackend, RecordingDelay> {
        let backend = FakeBackend::with(&[CalibrationScheme::CurveFitting]);
        let adapter = CalibrationAdapter::init(backend, AdcChannel(3), Attenuation::Db2_5);
        Sampler::new(
            ScriptedSource {
                codes: codes.iter().copied().collect(),
            },
            adapter,
            RecordingDelay::default(),
        )
    }

    fn policy(count: u16, threshold: f32) -> SamplingPolicy {
        SamplingPolicy {
            sample_count: count,
            sample_interval_ms: 20,
            deviation_threshold_percent: threshold,
        }
    }

    fn reference_median(values: &[i32]) -> f32 {
        let mut sorted = values.to_vec();
        sorted.sort();
        let n = sorted.len();
        if n % 2 == 1 {
            sorted[n / 2] as f32
        } else {
            (sorted[n / 2 - 1] as f32 + sorted[n / 2] as f32) / 2.0
        }
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&mut [3, 1, 2]), Some(2.0));
        assert_eq!(median(&mut [4, 1, 3, 2]), Some(2.5));
        assert_eq!(median(&mut [7]), Some(7.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_tight_cluster_keeps_everything() {
        let mut s = sampler(&[100, 102, 98, 101, 99]);
        let batch = s.sample(&policy(5, 10.0)).unwrap();

        assert_eq!(batch.median, 100.0);
        assert_eq!(batch.retained, 5);
        assert!((batch.millivolts - 100.0).abs() < 1e-4);
        assert!(batch.calibrated);
    }

    #[test]
    fn test_spike_is_rejected() {
        let mut s = sampler(&[50, 200, 52, 48, 51]);
        let batch = s.sample(&policy(5, 10.0)).unwrap();

        assert_eq!(batch.median, 51.0);
        assert_eq!(batch.retained, 4);
        assert!((batch.millivolts - 50.25).abs() < 1e-4);
    }

    #[test]
    fn test_single_sample_is_its_own_reading() {
        let mut s = sampler(&[321]);
        let batch = s.sample(&policy(1, 0.0)).unwrap();

        assert_eq!(batch.median, 321.0);
        assert_eq!(batch.millivolts, 321.0);
        assert!(s.delay.calls.is_empty());
    }

    #[test]
    fn test_zero_threshold_keeps_only_median_matches() {
        let outcome = reject_outliers(&[10, 20, 20, 30, 20], 20.0, 0.0);
        assert_eq!(outcome.retained, 3);
        assert_eq!(outcome.value, 20.0);
    }

    #[test]
    fn test_nothing_retained_falls_back_to_median() {
        // Even count: median 25 sits between the two clusters
        let outcome = reject_outliers(&[10, 10, 40, 40], 25.0, 5.0);
        assert_eq!(outcome.retained, 0);
        assert_eq!(outcome.value, 25.0);
    }

    #[test]
    fn test_zero_median_keeps_all_samples() {
        let mut s = sampler(&[0, 0, 0, 6, 9]);
        let batch = s.sample(&policy(5, 10.0)).unwrap();

        assert_eq!(batch.median, 0.0);
        assert_eq!(batch.retained, 5);
        assert!((batch.millivolts - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_delay_between_reads_only() {
        let mut s = sampler(&[1, 2, 3, 4]);
        s.sample(&policy(4, 100.0)).unwrap();
        assert_eq!(s.delay.calls, vec![20, 20, 20]);
    }

    #[test]
    fn test_invalid_policy_aborts_cycle() {
        let mut s = sampler(&[1]);
        assert!(matches!(
            s.sample(&policy(0, 10.0)),
            Err(SamplingError::InvalidPolicy(_))
        ));
        assert!(matches!(
            s.sample(&policy(1, -1.0)),
            Err(SamplingError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_sensor_error_propagates() {
        let mut s = sampler(&[1, 2]);
        assert_eq!(
            s.sample(&policy(3, 10.0)),
            Err(SamplingError::Sensor(SensorError::NotReady))
        );
    }

    proptest! {
        #[test]
        fn median_matches_reference(values in prop::collection::vec(-5000i32..5000, 1..64)) {
            let mut work = values.clone();
            prop_assert_eq!(median(&mut work), Some(reference_median(&values)));
        }

        #[test]
        fn threshold_of_100_bounds_kept_within_double_median(values in prop::collection::vec(1i32..3000, 1..64)) {
            let mut work = values.clone();
            let m = median(&mut work).unwrap();
            let outcome = reject_outliers(&values, m, 100.0);
            // Samples up to twice the median are within 100 %; above that they may drop
            let expected = values.iter().filter(|&&v| (v as f32) <= 2.0 * m).count();
            prop_assert_eq!(outcome.retained, expected);
        }

        #[test]
        fn filtered_value_stays_within_sample_range(values in prop::collection::vec(1i32..3000, 1..64), threshold in 0.0f32..200.0) {
            let mut work = values.clone();
            let m = median(&mut work).unwrap();
            let outcome = reject_outliers(&values, m, threshold);
            let lo = *values.iter().min().unwrap() as f32;
            let hi = *values.iter().max().unwrap() as f32;
            prop_assert!(outcome.value >= lo - 1e-3 && outcome.value <= hi + 1e-3);
        }
    }
}
