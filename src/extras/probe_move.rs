// src/extras/probe_move.rs
// One monitored descent, with everything that must be set up around it.

use log::{debug, info, trace};

use crate::core_traits::{endstop_bits, Axis, HeaterChannel};
use crate::error::ProbeError;
use crate::extras::probe::PrinterProbe;
use crate::extras::sensorless::SensorlessAdjustment;

impl PrinterProbe {
    /// Moves Z down towards `z` at `feedrate` until the probe fires.
    ///
    /// The logical Z is synced to where the steppers stopped, so after a
    /// contact `current_position()[2]` is the raw contact height. Fails with
    /// `NoTrigger` if `z` was reached without contact.
    pub fn probe_down_to_z(
        &mut self,
        z: f64,
        feedrate: f64,
        adj: &mut SensorlessAdjustment,
    ) -> Result<(), ProbeError> {
        debug!("probe_down_to_z({:.3}, {:.2}) from Z{:.3}", z, feedrate, self.current_z());

        self.wait_for_heaters();

        if let Some(gauge) = self.mechanism.strain_gauge() {
            gauge.tare(self.hw.trigger.as_mut(), self.hw.reactor.as_mut())?;
        }

        if let Some(touch) = self.mechanism.low_speed_touch() {
            if let Err(e) = touch.set_deployed(true, self.hw.trigger.as_ref(), self.hw.reactor.as_mut()) {
                return Err(self.halt(e));
            }
        }

        let stall_state = self.arm_stall_detection();

        self.set_probing_paused(true);
        self.hw.motion.move_blocking_axis(Axis::Z, z, feedrate);

        let bits = self.hw.trigger.trigger_bitmask();
        let triggered = if self.params.sensorless_delta {
            bits & endstop_bits::TOWERS != 0
        } else {
            bits & endstop_bits::Z_MIN_PROBE != 0
        };
        if self.params.sensorless_delta && triggered {
            adj.refresh(bits);
        }

        self.set_probing_paused(false);
        self.disarm_stall_detection(stall_state);

        if triggered {
            if let Some(touch) = self.mechanism.low_speed_touch() {
                if let Err(e) = touch.set_deployed(false, self.hw.trigger.as_ref(), self.hw.reactor.as_mut()) {
                    return Err(self.halt(e));
                }
            }
        }

        self.hw.trigger.clear_latched();
        self.hw.motion.sync_position_from_mechanism(Axis::Z);
        trace!("descent ended at Z{:.4} bits={:#x}", self.current_z(), bits);

        if triggered {
            Ok(())
        } else {
            Err(ProbeError::NoTrigger)
        }
    }

    fn wait_for_heaters(&mut self) {
        if self.params.wait_for_bed {
            self.hw.thermal.block_until_stable(HeaterChannel::Bed);
        }
        if self.params.wait_for_hotend {
            self.hw.thermal.block_until_stable(HeaterChannel::Hotend(0));
        }
        let settings = &self.params.settings;
        if settings.turn_heaters_off && settings.stabilize_temperatures_after_probing && self.hw.motion.job_in_progress()
        {
            info!("Waiting to heat-up again before continuing");
            if let Some(prompt) = self.hw.prompt.as_mut() {
                prompt.notify("Waiting to heat-up again before continuing");
            }
            self.hw.thermal.block_until_stable(HeaterChannel::Hotend(0));
            self.hw.thermal.block_until_stable(HeaterChannel::Bed);
        }
    }

    /// Returns the driver modes to restore, indexed by axis.
    fn arm_stall_detection(&mut self) -> [Option<bool>; 3] {
        let mut prior = [None; 3];
        if !self.params.sensorless {
            return prior;
        }
        let Some(stall) = self.hw.stall.as_mut() else {
            return prior;
        };
        let mask = self.params.sensitivity;
        let wanted = if self.params.sensorless_delta {
            [mask.x, mask.y, mask.z]
        } else {
            [false, false, mask.z]
        };
        for axis in Axis::ALL {
            if wanted[axis.index()] {
                prior[axis.index()] = Some(stall.enable(axis));
            }
        }
        stall.set_homing_current_profile(true);
        prior
    }

    fn disarm_stall_detection(&mut self, prior: [Option<bool>; 3]) {
        if !self.params.sensorless {
            return;
        }
        let Some(stall) = self.hw.stall.as_mut() else {
            return;
        };
        for axis in Axis::ALL {
            if let Some(state) = prior[axis.index()] {
                stall.disable(axis, state);
            }
        }
        stall.set_homing_current_profile(false);
    }

    /// Silences heaters, fans and steppers for a descent (`pause`) and
    /// brings them back afterwards.
    pub fn set_probing_paused(&mut self, pause: bool) {
        let quiet = &self.params.quiet;
        if !quiet.is_enabled(&self.params.settings) {
            return;
        }
        debug!("set_probing_paused({})", pause);
        if self.params.settings.turn_heaters_off {
            self.hw.thermal.pause_heaters(pause);
        }
        if quiet.fans_off {
            self.hw.thermal.set_fans_paused(pause);
        }
        if quiet.esteppers_off && pause {
            self.hw.motion.disable_extruders();
        }
        if quiet.steppers_off && !self.params.parallel_kinematics {
            let motion = self.hw.motion.as_mut();
            if pause {
                self.paused_trusted = Some([motion.is_trusted(Axis::X), motion.is_trusted(Axis::Y)]);
                motion.disable_axis(Axis::X);
                motion.disable_axis(Axis::Y);
            } else if let Some(trusted) = self.paused_trusted.take() {
                for (axis, was_trusted) in [(Axis::X, trusted[0]), (Axis::Y, trusted[1])] {
                    if was_trusted {
                        motion.enable_axis(axis);
                    }
                    motion.set_trusted(axis, was_trusted);
                }
            }
        }
        if pause {
            self.hw.reactor.pause(quiet.delay_before_probing);
        }
    }
}
