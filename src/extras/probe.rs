// src/extras/probe.rs
// Bed probe controller: measures bed height at an XY point.
//
// Deploy/stow handling lives in deploy_stow.rs, a single descent in
// probe_move.rs and the sampling strategy in multi_sample.rs. All of them are
// `impl PrinterProbe` blocks over the state defined here.

use std::collections::HashMap;

use log::{debug, error, info, warn};

use crate::configfile::Configfile;
use crate::core_traits::{Axis, PinResolver, ProbeHardware};
use crate::error::ProbeError;
use crate::extras::compensation::{self, HeightCompensation};
use crate::extras::mechanism::ProbeMechanism;
use crate::extras::probe_params::ProbeParams;
use crate::mathutil::{xy_sub, Vector3d};

/// Raise used by `ProbePtRaise::BigRaise`, in mm.
pub const BIG_RAISE_DISTANCE: f64 = 25.0;

/// What to do with the probe once a point has been measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePtRaise {
    /// Stay where the probe triggered.
    None,
    /// Raise by the between-probes clearance.
    Raise,
    /// Raise by `BIG_RAISE_DISTANCE`.
    BigRaise,
    Stow,
    /// Stow after the last point of a series.
    LastStow,
}

pub struct PrinterProbe {
    pub params: ProbeParams,
    pub(crate) mechanism: ProbeMechanism,
    pub(crate) hw: ProbeHardware,
    compensations: Vec<Box<dyn HeightCompensation>>,
    /// X/Y trust recorded when steppers were switched off for a quiet descent.
    pub(crate) paused_trusted: Option<[bool; 2]>,
    last_z_result: f64,
    last_query_state: bool,
}

impl PrinterProbe {
    pub fn new(params: ProbeParams, hw: ProbeHardware, pins: &mut dyn PinResolver) -> Self {
        let mechanism = ProbeMechanism::from_config(&params.mechanism, pins);
        let compensations = compensation::from_params(&params);
        Self {
            params,
            mechanism,
            hw,
            compensations,
            paused_trusted: None,
            last_z_result: 0.0,
            last_query_state: false,
        }
    }

    pub fn load_config(
        config: &Configfile,
        hw: ProbeHardware,
        pins: &mut dyn PinResolver,
    ) -> Result<Self, ProbeError> {
        let params = ProbeParams::new(config)?;
        Ok(PrinterProbe::new(params, hw, pins))
    }

    /// Puts the mechanism in its resting state and marks the probe stowed.
    pub fn init(&mut self) {
        self.mechanism.init(self.hw.reactor.as_mut());
        self.hw.trigger.set_monitoring(false);
        info!(
            "Probe '{}' ready, offset X{:.2} Y{:.2} Z{:.3}",
            self.mechanism.name(),
            self.params.offset[0],
            self.params.offset[1],
            self.params.offset[2]
        );
    }

    pub fn add_compensation(&mut self, comp: Box<dyn HeightCompensation>) {
        self.compensations.push(comp);
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.mechanism.name()
    }

    pub(crate) fn current_z(&self) -> f64 {
        self.hw.motion.current_position()[2]
    }

    /// Both the nozzle and the probe tip must be able to reach the point.
    pub fn can_reach(&self, pos: Vector3d, probe_relative: bool) -> bool {
        let off = self.params.offset;
        let nozzle = if probe_relative { xy_sub(pos, off) } else { pos };
        let tip = [nozzle[0] + off[0], nozzle[1] + off[1], nozzle[2]];
        self.hw.motion.is_reachable(nozzle) && self.hw.motion.is_reachable(tip)
    }

    /// Measures the bed height at (`x`, `y`).
    ///
    /// With `probe_relative` the point is where the probe tip should land,
    /// otherwise it is a nozzle position. The returned height is relative to
    /// the nozzle with the probe offset and all compensations applied.
    ///
    /// An unreachable point fails before anything moves. Other recoverable
    /// failures stow the probe and are reported; with `retry_and_recover`
    /// they come back as `Ok(NaN)` so the caller can retry. Fatal errors are
    /// always returned.
    pub fn probe_at_point(
        &mut self,
        x: f64,
        y: f64,
        raise_after: ProbePtRaise,
        verbose_level: u8,
        probe_relative: bool,
        sanity_check: bool,
    ) -> Result<f64, ProbeError> {
        debug!(
            "probe_at_point({:.2}, {:.2}, {:?}, {}, {}) current {:?}",
            x,
            y,
            raise_after,
            verbose_level,
            probe_relative,
            self.hw.motion.current_position()
        );

        let mut npos = [x, y, self.current_z()];
        if !self.can_reach(npos, probe_relative) {
            debug!("Position Not Reachable");
            return Err(ProbeError::NotReachable { x, y });
        }

        if let ProbeMechanism::Touch(touch) = &mut self.mechanism {
            if touch.high_speed_mode() && self.hw.trigger.is_triggered() {
                touch.reset(self.hw.reactor.as_mut());
            }
        }

        if probe_relative {
            npos = xy_sub(npos, self.params.offset);
        }
        self.hw.motion.move_blocking(npos, self.params.travel_speed);

        if let Some(sensor) = self.mechanism.distance_sensor() {
            let distance = sensor.read_distance();
            let z = self.current_z() - distance;
            self.last_z_result = z;
            if verbose_level > 2 {
                info!("Bed X: {:.3} Y: {:.3} Z: {:.3}", x, y, z);
            }
            return Ok(z);
        }

        let mut stow_attempted = false;
        let result = self.measure(npos, sanity_check).and_then(|z| {
            match raise_after {
                ProbePtRaise::Raise | ProbePtRaise::BigRaise => {
                    let raise =
                        if raise_after == ProbePtRaise::BigRaise { BIG_RAISE_DISTANCE } else { self.params.clearance_between };
                    let target = self.current_z() + raise;
                    self.hw.motion.move_blocking_axis(Axis::Z, target, self.params.fast_speed);
                }
                ProbePtRaise::Stow | ProbePtRaise::LastStow => {
                    stow_attempted = true;
                    self.stow()?;
                }
                ProbePtRaise::None => {}
            }
            Ok(z)
        });

        match result {
            Ok(z) => {
                if verbose_level > 2 {
                    info!("Bed X: {:.3} Y: {:.3} Z: {:.3}", x, y, z);
                }
                self.last_z_result = z;
                Ok(z)
            }
            Err(e) => {
                if !e.is_fatal() && !stow_attempted {
                    if let Err(stow_err) = self.stow() {
                        warn!("Stow after failed probe: {}", stow_err);
                    }
                }
                if let Some(prompt) = self.hw.prompt.as_mut() {
                    prompt.notify("Probing Failed");
                }
                self.last_z_result = f64::NAN;
                if e.is_fatal() || !self.params.retry_and_recover {
                    error!("Probing Failed: {}", e);
                    Err(e)
                } else {
                    warn!("Probing Failed: {}, retry requested", e);
                    Ok(f64::NAN)
                }
            }
        }
    }

    /// Deploy, sample and correct at the nozzle position `npos`.
    fn measure(&mut self, npos: Vector3d, sanity_check: bool) -> Result<f64, ProbeError> {
        self.deploy()?;
        let measured = self.run_z_probe(sanity_check)? + self.params.offset[2];
        let point = [npos[0] + self.params.offset[0], npos[1] + self.params.offset[1]];
        let mut z = measured;
        for comp in self.compensations.iter() {
            let delta = comp.correction(point, self.hw.thermal.as_ref());
            debug!("{} compensation at X{:.2} Y{:.2}: {:+.4}", comp.name(), point[0], point[1], delta);
            z += delta;
        }
        Ok(z)
    }

    /// Sets the sensorless offset of every tower in the sensitivity mask.
    pub fn set_offset_sensorless_adj(&mut self, sz: f64) {
        let mask = self.params.sensitivity;
        for (idx, enabled) in [mask.x, mask.y, mask.z].into_iter().enumerate() {
            if enabled {
                self.params.sensorless_offsets[idx] = sz;
            }
        }
        debug!("Sensorless offsets now {:?}", self.params.sensorless_offsets);
    }

    /// Reads the live probe signal.
    pub fn query_probe(&mut self) -> bool {
        self.last_query_state = self.hw.trigger.is_triggered();
        info!("probe: {}", if self.last_query_state { "TRIGGERED" } else { "open" });
        self.last_query_state
    }

    pub fn last_z_result(&self) -> f64 {
        self.last_z_result
    }

    pub fn get_status(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert("name".to_string(), serde_json::Value::String(self.mechanism.name().to_string()));
        status.insert("last_query".to_string(), serde_json::Value::Bool(self.last_query_state));
        status.insert(
            "last_z_result".to_string(),
            serde_json::Number::from_f64(self.last_z_result).map_or(serde_json::Value::Null, serde_json::Value::Number),
        );
        status.insert("deployed".to_string(), serde_json::Value::Bool(self.is_deployed()));
        status.insert("samples".to_string(), serde_json::Value::from(self.params.samples));
        status.insert(
            "offset".to_string(),
            serde_json::Value::from(self.params.offset.to_vec()),
        );
        status
    }
}
