// src/extras/sensorless.rs
// Per-tower height correction for stall-based probing on parallel kinematics.

use log::debug;

use crate::core_traits::endstop_bits;

/// Below any plausible probe height, so the first fired tower always wins.
const ADJ_REFERENCE: f64 = -3.0;

/// Tower offsets `{a, b, c}` and the largest one among the towers that fired
/// on the most recent contact. Lives for one `run_z_probe` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorlessAdjustment {
    offsets: [f64; 3],
    largest: f64,
    enabled: bool,
}

impl SensorlessAdjustment {
    pub fn new(offsets: [f64; 3], enabled: bool) -> Self {
        SensorlessAdjustment { offsets, largest: 0.0, enabled }
    }

    pub fn disabled() -> Self {
        Self::new([0.0; 3], false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn largest(&self) -> f64 {
        self.largest
    }

    /// Recompute the largest adjustment from the towers whose endstop fired.
    pub fn refresh(&mut self, trigger_bits: u32) {
        self.largest = ADJ_REFERENCE;
        let towers = [
            (endstop_bits::X_MAX, "X"),
            (endstop_bits::Y_MAX, "Y"),
            (endstop_bits::Z_MAX, "Z"),
        ];
        for (idx, (bit, tower)) in towers.iter().enumerate() {
            if trigger_bits & bit != 0 {
                self.largest = self.largest.max(self.offsets[idx]);
                debug!("Endstop_{}: {} Tower{}", tower, self.largest, tower);
            }
        }
    }

    /// Height to subtract from a raw contact Z.
    pub fn correction(&self) -> f64 {
        if self.enabled {
            self.largest
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_takes_max_of_fired_towers() {
        let mut adj = SensorlessAdjustment::new([0.1, 0.4, -0.2], true);
        adj.refresh(endstop_bits::X_MAX | endstop_bits::Z_MAX);
        assert_eq!(adj.largest(), 0.1);
        adj.refresh(endstop_bits::TOWERS);
        assert_eq!(adj.largest(), 0.4);
        assert_eq!(adj.correction(), 0.4);
    }

    #[test]
    fn refresh_without_towers_keeps_reference() {
        let mut adj = SensorlessAdjustment::new([-5.0, -5.0, -5.0], true);
        adj.refresh(endstop_bits::Z_MAX);
        assert_eq!(adj.largest(), -3.0);
        adj.refresh(endstop_bits::Z_MIN_PROBE);
        assert_eq!(adj.largest(), -3.0);
    }

    #[test]
    fn disabled_adjustment_never_corrects() {
        let mut adj = SensorlessAdjustment::new([1.0, 1.0, 1.0], false);
        adj.refresh(endstop_bits::TOWERS);
        assert_eq!(adj.correction(), 0.0);
        assert_eq!(SensorlessAdjustment::disabled().correction(), 0.0);
    }
}
