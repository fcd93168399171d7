// src/extras/compensation.rs
// Corrections applied to a measured height after sampling.

use crate::core_traits::{HeaterChannel, ThermalGate};
use crate::extras::probe_params::{ProbeParams, ThermalDriftConfig, TwistConfig};
use crate::mathutil::interpolate_even;

pub trait HeightCompensation {
    fn name(&self) -> &str;
    /// Value added to the height measured with the probe at `point`.
    fn correction(&self, point: [f64; 2], thermal: &dyn ThermalGate) -> f64;
}

/// X-axis twist: a per-X correction table over evenly spaced points.
pub struct TwistCompensation {
    config: TwistConfig,
}

impl TwistCompensation {
    pub fn new(config: TwistConfig) -> Self {
        TwistCompensation { config }
    }
}

impl HeightCompensation for TwistCompensation {
    fn name(&self) -> &str {
        "axis_twist"
    }

    fn correction(&self, point: [f64; 2], _thermal: &dyn ThermalGate) -> f64 {
        interpolate_even(self.config.start_x, self.config.spacing, &self.config.values, point[0])
    }
}

/// Probe temperature drift. The table holds how far the trigger point has
/// moved at each temperature step above `start_temp`.
pub struct ThermalDriftCompensation {
    config: ThermalDriftConfig,
}

impl ThermalDriftCompensation {
    pub fn new(config: ThermalDriftConfig) -> Self {
        ThermalDriftCompensation { config }
    }
}

impl HeightCompensation for ThermalDriftCompensation {
    fn name(&self) -> &str {
        "probe_temp"
    }

    fn correction(&self, _point: [f64; 2], thermal: &dyn ThermalGate) -> f64 {
        let temp = thermal.current_temperature(HeaterChannel::Probe);
        if temp < self.config.start_temp {
            return 0.0;
        }
        -interpolate_even(self.config.start_temp, self.config.step, &self.config.values, temp)
    }
}

/// Compensations configured in `params`, in the order they are applied.
pub fn from_params(params: &ProbeParams) -> Vec<Box<dyn HeightCompensation>> {
    let mut list: Vec<Box<dyn HeightCompensation>> = Vec::new();
    if let Some(drift) = &params.thermal_drift {
        list.push(Box::new(ThermalDriftCompensation::new(drift.clone())));
    }
    if let Some(twist) = &params.twist {
        list.push(Box::new(TwistCompensation::new(twist.clone())));
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimMachine};

    #[test]
    fn twist_interpolates_by_x() {
        let sim = SimMachine::new(SimConfig::default());
        let hw = sim.hardware();
        let twist = TwistCompensation::new(TwistConfig { start_x: 20.0, spacing: 90.0, values: vec![0.0, 0.09, 0.18] });
        assert!((twist.correction([65.0, 10.0], hw.thermal.as_ref()) - 0.045).abs() < 1e-12);
        assert_eq!(twist.correction([20.0, 200.0], hw.thermal.as_ref()), 0.0);
    }

    #[test]
    fn thermal_drift_only_above_start() {
        let sim = SimMachine::new(SimConfig { probe_temp: 20.0, ..SimConfig::default() });
        let hw = sim.hardware();
        let drift = ThermalDriftCompensation::new(ThermalDriftConfig {
            start_temp: 30.0,
            step: 10.0,
            values: vec![0.0, 0.05, 0.1],
        });
        assert_eq!(drift.correction([0.0, 0.0], hw.thermal.as_ref()), 0.0);
        sim.set_temperature(HeaterChannel::Probe, 40.0);
        assert!((drift.correction([0.0, 0.0], hw.thermal.as_ref()) + 0.05).abs() < 1e-12);
    }
}
