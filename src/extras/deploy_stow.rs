// src/extras/deploy_stow.rs
// Deploying and stowing the probe, with the clearance, homing, user-pause,
// preheat and self-test steps around the mechanism action.

use std::sync::atomic::Ordering;

use log::{debug, error, info};

use crate::core_traits::{Axis, HeaterChannel, WaitFlags};
use crate::error::ProbeError;
use crate::extras::mechanism::ProbeMechanism;
use crate::extras::probe::PrinterProbe;

const TEMP_WINDOW: f64 = 1.0;
const TEMP_BED_WINDOW: f64 = 1.0;

impl PrinterProbe {
    pub fn deploy(&mut self) -> Result<(), ProbeError> {
        self.set_deployed(true)
    }

    pub fn stow(&mut self) -> Result<(), ProbeError> {
        self.set_deployed(false)
    }

    /// The endstop is monitored exactly while the probe counts as deployed.
    pub fn is_deployed(&self) -> bool {
        self.hw.trigger.is_monitoring()
    }

    /// Brings the probe into the requested state. Does nothing, not even a
    /// move, when it is already there.
    pub fn set_deployed(&mut self, deploy: bool) -> Result<(), ProbeError> {
        debug!(
            "set_deployed({}) at {:?}",
            if deploy { "deploy" } else { "stow" },
            self.hw.motion.current_position()
        );
        if self.is_deployed() == deploy {
            return Ok(());
        }

        let z_raise_wanted =
            !self.mechanism.raises_only_for_deploy() || self.params.pause_before_deploy_stow || deploy;
        if z_raise_wanted {
            self.do_z_raise(self.params.clearance_between.max(self.params.clearance_deploy));
        }

        let unhomed: String = self
            .mechanism
            .homing_required()
            .iter()
            .filter(|axis| !self.hw.motion.is_homed(**axis))
            .map(|axis| axis.name())
            .collect();
        if !unhomed.is_empty() {
            error!("Home {} first", unhomed);
            if let Some(prompt) = self.hw.prompt.as_mut() {
                prompt.notify(&format!("Home {} first", unhomed));
            }
            return Err(ProbeError::HomingRequired(unhomed));
        }

        let old_pos = self.hw.motion.current_position();

        if self.params.triggered_when_stowed_test {
            if self.hw.trigger.is_triggered() == deploy {
                if !deploy {
                    self.hw.trigger.set_monitoring(false);
                }
                self.probe_specific_action(deploy)?;
            }
            if self.hw.trigger.is_triggered() == deploy {
                let err = if deploy { ProbeError::DeployFailed } else { ProbeError::StowFailed };
                return Err(self.halt(err));
            }
        } else {
            self.probe_specific_action(deploy)?;
        }

        if deploy && self.params.preheat_before_probing {
            let settings = self.params.settings.clone();
            self.preheat_for_probing(settings.preheat_hotend_temp, settings.preheat_bed_temp, false);
        }

        let z = self.current_z();
        self.hw.motion.move_blocking([old_pos[0], old_pos[1], z], 0.0);
        self.hw.trigger.set_monitoring(deploy);
        Ok(())
    }

    /// Stops the machine on a failed mechanism self-test.
    pub(crate) fn halt(&mut self, err: ProbeError) -> ProbeError {
        error!("Z-Probe failed: {}", err);
        if let Some(prompt) = self.hw.prompt.as_mut() {
            prompt.notify("Err: ZPROBE");
        }
        self.hw.motion.emergency_stop();
        err
    }

    fn probe_specific_action(&mut self, deploy: bool) -> Result<(), ProbeError> {
        if self.params.pause_before_deploy_stow {
            self.pause_for_user(deploy)?;
        }
        if let ProbeMechanism::Touch(touch) = &mut self.mechanism {
            if let Err(e) = touch.set_deployed(deploy, self.hw.trigger.as_ref(), self.hw.reactor.as_mut()) {
                return Err(self.halt(e));
            }
            return Ok(());
        }
        self.mechanism.actuate(deploy, self.hw.motion.as_mut(), self.hw.reactor.as_mut());
        Ok(())
    }

    fn pause_for_user(&mut self, deploy: bool) -> Result<(), ProbeError> {
        if deploy && self.params.preheat_before_probing {
            let bed = self.params.settings.preheat_bed_temp;
            self.preheat_for_probing(0.0, bed, true);
        }
        let msg = if deploy { "Deploy Z-Probe" } else { "Stow Z-Probe" };
        info!("{}", msg);
        let flags = match self.hw.prompt.as_mut() {
            Some(prompt) => {
                prompt.notify(msg);
                prompt.wait_flags()
            }
            None => return Ok(()),
        };

        flags.proceed.store(false, Ordering::SeqCst);
        if self.params.pause_when_triggered {
            while deploy == self.hw.trigger.is_triggered() && !flags.proceed.load(Ordering::SeqCst) {
                if flags.abort.load(Ordering::SeqCst) {
                    return Err(ProbeError::UserCancelled);
                }
                self.hw.reactor.idle();
            }
            flags.proceed.store(false, Ordering::SeqCst);
        }
        if let Some(prompt) = self.hw.prompt.as_mut() {
            prompt.prompt_continue(msg);
        }
        self.wait_for_user(&flags)
    }

    /// Keeps the machine serviced until the user confirms or the wait is
    /// abandoned.
    pub fn wait_for_user(&mut self, flags: &WaitFlags) -> Result<(), ProbeError> {
        loop {
            if flags.abort.load(Ordering::SeqCst) {
                info!("Wait for user cancelled");
                return Err(ProbeError::UserCancelled);
            }
            if flags.proceed.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            self.hw.reactor.idle();
        }
    }

    /// Raises the nozzle so the probe tip has `z_raise` mm of clearance.
    /// Never lowers.
    pub fn do_z_raise(&mut self, z_raise: f64) {
        debug!("do_z_raise({})", z_raise);
        let mut z_dest = z_raise;
        if self.params.offset[2] < 0.0 {
            z_dest -= self.params.offset[2];
        }
        if z_dest > self.current_z() {
            self.hw.motion.move_blocking_axis(Axis::Z, z_dest, self.params.fast_speed);
        }
    }

    /// Raises heater targets that are below the probing temperatures and,
    /// unless `early`, waits for any heater still colder than requested.
    pub fn preheat_for_probing(&mut self, hotend_temp: f64, bed_temp: f64, early: bool) {
        let hotend = HeaterChannel::Hotend(0);
        if !early {
            info!("Preheating for probing: hotend {:.0} bed {:.0}", hotend_temp, bed_temp);
            if let Some(prompt) = self.hw.prompt.as_mut() {
                prompt.notify("Preheating...");
            }
        }
        let thermal = self.hw.thermal.as_mut();
        if hotend_temp > thermal.current_target(hotend) {
            thermal.set_target(hotend, hotend_temp);
        }
        if bed_temp > thermal.current_target(HeaterChannel::Bed) {
            thermal.set_target(HeaterChannel::Bed, bed_temp);
        }
        if early {
            return;
        }
        if hotend_temp > thermal.current_temperature(hotend) + TEMP_WINDOW {
            thermal.block_until_stable(hotend);
        }
        if bed_temp > thermal.current_temperature(HeaterChannel::Bed) + TEMP_BED_WINDOW {
            thermal.block_until_stable(HeaterChannel::Bed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extras::probe::tests::{probe_on, sim_with};
    use crate::sim::{SimConfig, SimEvent, SimMachine};
    use pretty_assertions::assert_eq;

    fn solenoid_sim() -> SimMachine {
        sim_with(SimConfig { probe_pin: Some("sol".to_string()), ..SimConfig::default() })
    }

    #[test]
    fn deploy_twice_is_a_no_op() {
        let sim = solenoid_sim();
        let mut probe = probe_on(&sim, "mechanism = solenoid\npin = sol");
        probe.deploy().unwrap();
        let after_first = sim.events().len();
        probe.deploy().unwrap();
        assert_eq!(sim.events().len(), after_first);
        probe.stow().unwrap();
        let after_stow = sim.events().len();
        probe.stow().unwrap();
        assert_eq!(sim.events().len(), after_stow);
    }

    #[test]
    fn deploy_raises_for_tip_clearance_and_returns_xy() {
        let sim = sim_with(SimConfig { start_position: [40.0, 50.0, 3.0], ..SimConfig::default() });
        let mut probe = probe_on(
            &sim,
            "mechanism = sled\nsled_docking_x = 200\nclearance_deploy = 10\nclearance_between = 5",
        );
        probe.deploy().unwrap();
        let moves = sim.moves();
        // z offset -2: raise to 10 + 2
        assert_eq!(moves[0].target, [40.0, 50.0, 12.0]);
        assert_eq!(moves[1].target[0], 200.0);
        assert_eq!(moves.last().unwrap().target, [40.0, 50.0, 12.0]);
        assert!(probe.is_deployed());
    }

    #[test]
    fn raise_never_lowers() {
        let sim = sim_with(SimConfig { start_position: [40.0, 50.0, 30.0], ..SimConfig::default() });
        let mut probe = probe_on(&sim, "");
        probe.do_z_raise(10.0);
        assert_eq!(sim.move_count(), 0);
    }

    #[test]
    fn fixed_probe_stow_skips_raise() {
        let sim = sim_with(SimConfig { start_position: [40.0, 50.0, 3.0], ..SimConfig::default() });
        let mut probe = probe_on(&sim, "");
        probe.deploy().unwrap();
        sim.clear_events();
        probe.hw.motion.move_blocking_axis(Axis::Z, 5.0, 0.0);
        probe.stow().unwrap();
        assert_eq!(sim.moves().iter().map(|m| m.target[2]).collect::<Vec<_>>(), vec![5.0, 5.0]);
    }

    #[test]
    fn unhomed_sled_needs_homing() {
        let sim = sim_with(SimConfig::default());
        sim.set_homed(Axis::X, false);
        let mut probe = probe_on(&sim, "mechanism = sled\nsled_docking_x = 200");
        assert_eq!(probe.deploy(), Err(ProbeError::HomingRequired("X".to_string())));
        assert!(!probe.is_deployed());
        assert!(!sim.is_stopped());
    }

    #[test]
    fn stowed_trigger_test_detects_failed_deploy() {
        let sim = sim_with(SimConfig {
            probe_pin: Some("sol".to_string()),
            triggered_when_stowed: true,
            ..SimConfig::default()
        });
        let mut probe = probe_on(&sim, "mechanism = solenoid\npin = sol\ntriggered_when_stowed_test = true");
        sim.set_stuck_trigger(true);
        assert_eq!(probe.deploy(), Err(ProbeError::DeployFailed));
        assert!(sim.is_stopped());
        assert!(sim.messages().contains(&"Err: ZPROBE".to_string()));
    }

    #[test]
    fn stowed_trigger_test_passes_for_working_probe() {
        let sim = sim_with(SimConfig {
            probe_pin: Some("sol".to_string()),
            triggered_when_stowed: true,
            ..SimConfig::default()
        });
        let mut probe = probe_on(&sim, "mechanism = solenoid\npin = sol\ntriggered_when_stowed_test = true");
        probe.deploy().unwrap();
        probe.stow().unwrap();
        assert_eq!(sim.pin_events("sol").len(), 2);
        assert!(!sim.is_stopped());
    }

    #[test]
    fn pause_before_deploy_waits_for_user() {
        let sim = solenoid_sim();
        let mut probe = probe_on(&sim, "mechanism = solenoid\npin = sol\npause_before_deploy_stow = true");
        probe.deploy().unwrap();
        let messages = sim.messages();
        assert_eq!(messages, vec!["Deploy Z-Probe".to_string(), "Deploy Z-Probe".to_string()]);
        assert!(probe.is_deployed());
    }

    #[test]
    fn cancelled_pause_aborts_deploy() {
        let sim = sim_with(SimConfig {
            probe_pin: Some("sol".to_string()),
            confirm_after_idles: None,
            abort_after_idles: Some(2),
            ..SimConfig::default()
        });
        let mut probe = probe_on(&sim, "mechanism = solenoid\npin = sol\npause_before_deploy_stow = true");
        assert_eq!(probe.deploy(), Err(ProbeError::UserCancelled));
        assert!(!probe.is_deployed());
        assert!(sim.pin_events("sol").is_empty());
    }

    fn pause_events(sim: &SimMachine) -> Vec<SimEvent> {
        sim.events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Notify(_) | SimEvent::Prompt(_) | SimEvent::Idle | SimEvent::Digital(..)))
            .collect()
    }

    #[test]
    fn pause_waits_for_trigger_to_release_before_prompt() {
        let sim = sim_with(SimConfig {
            probe_pin: Some("sol".to_string()),
            release_after_idles: Some(2),
            confirm_after_idles: Some(5),
            ..SimConfig::default()
        });
        let mut probe = probe_on(
            &sim,
            "mechanism = solenoid\npin = sol\npause_before_deploy_stow = true\npause_when_triggered = true",
        );
        sim.set_stuck_trigger(true);
        probe.deploy().unwrap();
        let msg = "Deploy Z-Probe".to_string();
        let mut expected = vec![SimEvent::Notify(msg.clone()), SimEvent::Idle, SimEvent::Idle, SimEvent::Prompt(msg)];
        expected.extend(std::iter::repeat(SimEvent::Idle).take(5));
        expected.push(SimEvent::Digital("sol".to_string(), true));
        assert_eq!(pause_events(&sim), expected);
        assert!(probe.is_deployed());
    }

    #[test]
    fn abort_while_waiting_for_trigger_release() {
        let sim = sim_with(SimConfig {
            probe_pin: Some("sol".to_string()),
            confirm_after_idles: None,
            abort_after_idles: Some(2),
            ..SimConfig::default()
        });
        let mut probe = probe_on(
            &sim,
            "mechanism = solenoid\npin = sol\npause_before_deploy_stow = true\npause_when_triggered = true",
        );
        sim.set_stuck_trigger(true);
        assert_eq!(probe.deploy(), Err(ProbeError::UserCancelled));
        assert_eq!(
            pause_events(&sim),
            vec![SimEvent::Notify("Deploy Z-Probe".to_string()), SimEvent::Idle, SimEvent::Idle]
        );
        assert!(!probe.is_deployed());
    }

    #[test]
    fn preheat_raises_targets_only_upwards() {
        let sim = sim_with(SimConfig::default());
        let mut probe = probe_on(&sim, "");
        probe.hw.thermal.set_target(HeaterChannel::Bed, 80.0);
        sim.clear_events();
        probe.preheat_for_probing(200.0, 60.0, false);
        // bed target stays at 80 but the bed is still cold
        assert_eq!(
            sim.events()
                .into_iter()
                .filter(|e| !matches!(e, SimEvent::Notify(_)))
                .collect::<Vec<_>>(),
            vec![
                SimEvent::SetTarget(HeaterChannel::Hotend(0), 200.0),
                SimEvent::WaitStable(HeaterChannel::Hotend(0)),
                SimEvent::WaitStable(HeaterChannel::Bed),
            ]
        );
    }

    #[test]
    fn preheat_skips_wait_for_warm_heaters() {
        let sim = sim_with(SimConfig::default());
        let mut probe = probe_on(&sim, "");
        probe.hw.thermal.set_target(HeaterChannel::Bed, 60.0);
        sim.set_temperature(HeaterChannel::Bed, 59.5);
        sim.clear_events();
        probe.preheat_for_probing(0.0, 60.0, false);
        assert_eq!(sim.events(), vec![SimEvent::Notify("Preheating...".to_string())]);
    }

    #[test]
    fn early_preheat_does_not_wait() {
        let sim = sim_with(SimConfig::default());
        let mut probe = probe_on(&sim, "");
        sim.clear_events();
        probe.preheat_for_probing(0.0, 60.0, true);
        assert_eq!(sim.events(), vec![SimEvent::SetTarget(HeaterChannel::Bed, 60.0)]);
    }

    #[test]
    fn deploy_preheats_when_configured() {
        let sim = sim_with(SimConfig::default());
        let mut probe = probe_on(&sim, "preheat_before_probing = true\npreheat_hotend_temp = 180\npreheat_bed_temp = 55");
        probe.deploy().unwrap();
        let waits: Vec<_> = sim.events().into_iter().filter(|e| matches!(e, SimEvent::WaitStable(_))).collect();
        assert_eq!(waits, vec![SimEvent::WaitStable(HeaterChannel::Hotend(0)), SimEvent::WaitStable(HeaterChannel::Bed)]);
    }
}
