// src/extras/multi_sample.rs
// Sampling strategy: how many descents to make at one point and how to
// combine them.

use log::debug;

use crate::core_traits::Axis;
use crate::error::{ConfigError, ProbeError};
use crate::extras::probe::PrinterProbe;
use crate::extras::probe_params::MAX_SAMPLES;
use crate::extras::samples::{weighted_double, SampleSet};
use crate::extras::sensorless::SensorlessAdjustment;

/// Lowest descent target when Z cannot be trusted.
const UNTRUSTED_LOW_POINT: f64 = -10.0;

/// Margin above the deploy clearance where the fast approach stops.
const FAST_APPROACH_MARGIN: f64 = 5.0;

impl PrinterProbe {
    /// Measures the raw trigger height (nozzle Z at contact) at the current
    /// XY. The probe must already be deployed.
    ///
    /// With `sanity_check`, a contact above `-z_offset` plus the relevant
    /// clearance fails the whole measurement.
    pub fn run_z_probe(&mut self, sanity_check: bool) -> Result<f64, ProbeError> {
        let total = self.params.samples;
        if total == 0 || total > MAX_SAMPLES {
            return Err(ConfigError::ValidationError(format!("samples must be 1..={}, got {}", MAX_SAMPLES, total)).into());
        }
        let offset_z = self.params.offset[2];
        let (fast, slow) = (self.params.fast_speed, self.params.speed);
        let mut adj = SensorlessAdjustment::new(self.params.sensorless_offsets, self.params.sensorless_delta);

        let low_point = if self.hw.motion.is_trusted(Axis::Z) {
            -offset_z + self.params.low_point
        } else {
            UNTRUSTED_LOW_POINT
        };
        debug!("run_z_probe: {} samples, low point Z{:.3}", total, low_point);

        let mut first_probe_z = None;
        if total == 2 {
            let clearance = self.params.clearance_between;
            self.try_to_probe("FAST", low_point, fast, sanity_check, clearance, &mut adj)?;
            let z = self.current_z() - adj.correction();
            debug!("1st Probe Z: {:.4}", z);
            let raise = self.current_z() + self.params.clearance_multi;
            self.hw.motion.move_blocking_axis(Axis::Z, raise, fast);
            first_probe_z = Some(z);
        } else if fast != slow {
            let mut approach = self.params.clearance_deploy + FAST_APPROACH_MARGIN;
            if offset_z < 0.0 {
                approach -= offset_z;
            }
            if self.current_z() > approach {
                match self.probe_down_to_z(approach, fast, &mut adj) {
                    Ok(()) => {
                        let raise = self.current_z() + self.params.clearance_between;
                        self.hw.motion.move_blocking_axis(Axis::Z, raise, fast);
                    }
                    Err(ProbeError::NoTrigger) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let slow_samples = if total == 2 { 1 } else { total };
        let mut samples = SampleSet::new();
        for p in 0..slow_samples {
            let clearance = self.params.clearance_multi;
            self.try_to_probe("SLOW", low_point, slow, sanity_check, clearance, &mut adj)?;
            let z = self.current_z() - adj.correction();
            debug!("Probe sample {}: Z{:.4}", p + 1, z);
            samples
                .insert(z)
                .map_err(|_| ConfigError::ValidationError("too many samples".to_string()))?;
            if total > 2 && p + 1 < slow_samples {
                self.hw.motion.move_blocking_axis(Axis::Z, z + self.params.clearance_multi, fast);
            }
        }

        let measured = match first_probe_z {
            Some(fast_z) => {
                let slow_z = samples.median();
                debug!("2nd Probe Z: {:.4} Discrepancy: {:.4}", slow_z, fast_z - slow_z);
                weighted_double(fast_z, slow_z)
            }
            None => samples.trimmed_mean(self.params.extra_samples),
        };
        debug!("run_z_probe result: {:.4}", measured);
        Ok(measured)
    }

    /// One descent plus the early-contact check, made on the raw contact Z.
    fn try_to_probe(
        &mut self,
        label: &str,
        z_probe_low_point: f64,
        feedrate: f64,
        sanity_check: bool,
        clearance: f64,
        adj: &mut SensorlessAdjustment,
    ) -> Result<(), ProbeError> {
        let result = self.probe_down_to_z(z_probe_low_point, feedrate, adj);
        let z = self.current_z();
        let limit = -self.params.offset[2] + clearance;
        match result {
            Err(ProbeError::NoTrigger) => {
                debug!("{} Probe fail! - No trigger.", label);
                Err(ProbeError::NoTrigger)
            }
            Err(e) => Err(e),
            Ok(()) if sanity_check && z > limit => {
                debug!("{} Probe fail! - Triggered early (Z{:.3} > {:.3}).", label, z, limit);
                Err(ProbeError::TriggeredEarly { z, limit })
            }
            Ok(()) => Ok(()),
        }
    }
}
