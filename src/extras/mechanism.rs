// src/extras/mechanism.rs
// Physical deploy/stow actions, one variant per kind of probe hardware.
//
// The variant is chosen once from the config and never changes. Actions here
// only drive hardware; checking that the probe really moved is done by the
// deploy/stow controller.

use log::debug;

use crate::core_traits::{Axis, DigitalOut, DistanceSensor, MotionDriver, PinResolver, Reactor, ServoOut, TriggerSource};
use crate::error::ProbeError;
use crate::extras::probe_params::MechanismConfig;
use crate::mathutil::Vector3d;

pub const MAX_WAYPOINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub position: Vector3d,
    pub feedrate: f64, // mm/s, 0 = current feedrate
}

/// Up to five optional waypoints, always visited in slot order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaypointSequence {
    steps: [Option<Waypoint>; MAX_WAYPOINTS],
}

impl WaypointSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: usize, waypoint: Waypoint) {
        self.steps[slot] = Some(waypoint);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.steps.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self, motion: &mut dyn MotionDriver) {
        for wp in self.iter() {
            motion.move_blocking(wp.position, wp.feedrate);
        }
    }
}

pub struct Solenoid {
    pin: Box<dyn DigitalOut>,
}

pub struct ServoArm {
    servo: Box<dyn ServoOut>,
    deploy_angle: f64,
    stow_angle: f64,
}

/// Sled parked at the X end of travel and picked up by a solenoid on the carriage.
pub struct DockSled {
    release: Option<Box<dyn DigitalOut>>,
    docking_x: f64,
    docking_offset: f64,
}

/// Magnetically latched probe released by a short pulse.
pub struct MagLatch {
    trigger_pin: Box<dyn DigitalOut>,
    pulse_time: f64,
    idle_z: f64,
}

pub struct WaypointLinkage {
    deploy: WaypointSequence,
    stow: WaypointSequence,
}

pub struct StrainGauge {
    tare_pin: Box<dyn DigitalOut>,
    tare_time: f64,
    tare_delay: f64,
    only_while_inactive: bool,
}

pub struct RackAndPinion {
    deploy_x: f64,
    retract_x: f64,
}

/// Pin-commanded touch probe. In low-speed mode it is deployed for each
/// contact and stowed right after it.
pub struct TouchProbe {
    control: Box<dyn ServoOut>,
    high_speed_mode: bool,
    command_delay: f64,
}

pub struct DistanceProbe {
    sensor: Box<dyn DistanceSensor>,
}

pub enum ProbeMechanism {
    Fixed,
    NozzleAsProbe,
    Solenoid(Solenoid),
    Servo(ServoArm),
    Sled(DockSled),
    MagLatch(MagLatch),
    Waypoints(WaypointLinkage),
    StrainGauge(StrainGauge),
    RackAndPinion(RackAndPinion),
    Touch(TouchProbe),
    DistanceSensor(DistanceProbe),
}

impl TouchProbe {
    pub const DEPLOY_ANGLE: f64 = 10.0;
    pub const STOW_ANGLE: f64 = 90.0;
    pub const RESET_ANGLE: f64 = 160.0;

    fn command(&mut self, angle: f64, reactor: &mut dyn Reactor) {
        self.control.set_angle(angle);
        reactor.pause(self.command_delay);
    }

    /// Sends the deploy or stow command. An asserted signal right after the
    /// command is an alarm: reset once and retry before giving up.
    pub fn set_deployed(
        &mut self,
        deploy: bool,
        trigger: &dyn TriggerSource,
        reactor: &mut dyn Reactor,
    ) -> Result<(), ProbeError> {
        let angle = if deploy { Self::DEPLOY_ANGLE } else { Self::STOW_ANGLE };
        self.command(angle, reactor);
        if !trigger.is_triggered() {
            return Ok(());
        }
        debug!("Touch probe alarm after {} command, resetting", if deploy { "deploy" } else { "stow" });
        self.command(Self::RESET_ANGLE, reactor);
        if deploy {
            self.command(Self::STOW_ANGLE, reactor);
        }
        self.command(angle, reactor);
        if trigger.is_triggered() {
            return Err(if deploy { ProbeError::DeployFailed } else { ProbeError::StowFailed });
        }
        Ok(())
    }

    /// Clears a latched alarm left over from a previous contact.
    pub fn reset(&mut self, reactor: &mut dyn Reactor) {
        self.command(Self::RESET_ANGLE, reactor);
    }

    pub fn high_speed_mode(&self) -> bool {
        self.high_speed_mode
    }
}

impl StrainGauge {
    /// Zeroes the gauge before a measurement.
    pub fn tare(&mut self, trigger: &mut dyn TriggerSource, reactor: &mut dyn Reactor) -> Result<(), ProbeError> {
        if self.only_while_inactive && trigger.is_triggered() {
            return Err(ProbeError::TareFailed("Cannot tare an active probe".to_string()));
        }
        debug!("Taring probe");
        self.tare_pin.set_digital(true);
        reactor.pause(self.tare_time);
        self.tare_pin.set_digital(false);
        reactor.pause(self.tare_delay);
        trigger.clear_latched();
        Ok(())
    }
}

impl ProbeMechanism {
    pub fn from_config(config: &MechanismConfig, pins: &mut dyn PinResolver) -> Self {
        match config {
            MechanismConfig::Fixed => ProbeMechanism::Fixed,
            MechanismConfig::NozzleAsProbe => ProbeMechanism::NozzleAsProbe,
            MechanismConfig::Solenoid { pin } => ProbeMechanism::Solenoid(Solenoid { pin: pins.digital_out(pin) }),
            MechanismConfig::Servo { pin, deploy_angle, stow_angle } => ProbeMechanism::Servo(ServoArm {
                servo: pins.servo(pin),
                deploy_angle: *deploy_angle,
                stow_angle: *stow_angle,
            }),
            MechanismConfig::Sled { release_pin, docking_x, docking_offset } => ProbeMechanism::Sled(DockSled {
                release: release_pin.as_deref().map(|p| pins.digital_out(p)),
                docking_x: *docking_x,
                docking_offset: *docking_offset,
            }),
            MechanismConfig::MagLatch { trigger_pin, pulse_time, idle_z } => ProbeMechanism::MagLatch(MagLatch {
                trigger_pin: pins.digital_out(trigger_pin),
                pulse_time: *pulse_time,
                idle_z: *idle_z,
            }),
            MechanismConfig::Waypoints { deploy, stow } => ProbeMechanism::Waypoints(WaypointLinkage {
                deploy: deploy.clone(),
                stow: stow.clone(),
            }),
            MechanismConfig::StrainGauge { tare_pin, tare_time, tare_delay, only_while_inactive } => {
                ProbeMechanism::StrainGauge(StrainGauge {
                    tare_pin: pins.digital_out(tare_pin),
                    tare_time: *tare_time,
                    tare_delay: *tare_delay,
                    only_while_inactive: *only_while_inactive,
                })
            }
            MechanismConfig::RackAndPinion { deploy_x, retract_x } => {
                ProbeMechanism::RackAndPinion(RackAndPinion { deploy_x: *deploy_x, retract_x: *retract_x })
            }
            MechanismConfig::Touch { pin, high_speed_mode, command_delay } => ProbeMechanism::Touch(TouchProbe {
                control: pins.servo(pin),
                high_speed_mode: *high_speed_mode,
                command_delay: *command_delay,
            }),
            MechanismConfig::DistanceSensor { sensor } => {
                ProbeMechanism::DistanceSensor(DistanceProbe { sensor: pins.distance_sensor(sensor) })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProbeMechanism::Fixed => "fixed",
            ProbeMechanism::NozzleAsProbe => "nozzle",
            ProbeMechanism::Solenoid(_) => "solenoid",
            ProbeMechanism::Servo(_) => "servo",
            ProbeMechanism::Sled(_) => "sled",
            ProbeMechanism::MagLatch(_) => "maglev",
            ProbeMechanism::Waypoints(_) => "waypoints",
            ProbeMechanism::StrainGauge(_) => "strain_gauge",
            ProbeMechanism::RackAndPinion(_) => "rack_and_pinion",
            ProbeMechanism::Touch(_) => "touch",
            ProbeMechanism::DistanceSensor(_) => "distance_sensor",
        }
    }

    /// Put the hardware into its power-on resting state.
    pub fn init(&mut self, reactor: &mut dyn Reactor) {
        match self {
            ProbeMechanism::Servo(arm) => arm.servo.set_angle(arm.stow_angle),
            ProbeMechanism::Touch(touch) => touch.command(TouchProbe::STOW_ANGLE, reactor),
            ProbeMechanism::StrainGauge(gauge) => gauge.tare_pin.set_digital(false),
            _ => {}
        }
    }

    /// Drive the mechanism towards deployed (`true`) or stowed (`false`).
    pub fn actuate(&mut self, deploy: bool, motion: &mut dyn MotionDriver, reactor: &mut dyn Reactor) {
        debug!("Probe mechanism '{}': {}", self.name(), if deploy { "deploy" } else { "stow" });
        match self {
            ProbeMechanism::Fixed
            | ProbeMechanism::NozzleAsProbe
            | ProbeMechanism::StrainGauge(_)
            | ProbeMechanism::DistanceSensor(_) => {}
            ProbeMechanism::Solenoid(sol) => sol.pin.set_digital(deploy),
            ProbeMechanism::Servo(arm) => arm.servo.set_angle(if deploy { arm.deploy_angle } else { arm.stow_angle }),
            ProbeMechanism::Sled(sled) => {
                // Dock a bit closer on stow so the sled is captured.
                let stow_bias = if deploy { 0.0 } else { 1.0 };
                motion.move_blocking_axis(Axis::X, sled.docking_x + sled.docking_offset - stow_bias, 0.0);
                if let Some(release) = sled.release.as_mut() {
                    release.set_digital(deploy);
                }
            }
            ProbeMechanism::MagLatch(latch) => {
                if deploy {
                    latch.trigger_pin.set_digital(true);
                    reactor.pause(latch.pulse_time);
                    latch.trigger_pin.set_digital(false);
                } else {
                    motion.move_blocking_axis(Axis::Z, latch.idle_z, 0.0);
                }
            }
            ProbeMechanism::Waypoints(linkage) => {
                if deploy {
                    linkage.deploy.run(motion);
                } else {
                    linkage.stow.run(motion);
                }
            }
            ProbeMechanism::RackAndPinion(rack) => {
                motion.move_blocking_axis(Axis::X, if deploy { rack.deploy_x } else { rack.retract_x }, 0.0)
            }
            ProbeMechanism::Touch(touch) => {
                touch.command(if deploy { TouchProbe::DEPLOY_ANGLE } else { TouchProbe::STOW_ANGLE }, reactor)
            }
        }
    }

    /// Fix-mounted probes only need clearance when deploying.
    pub fn raises_only_for_deploy(&self) -> bool {
        matches!(self, ProbeMechanism::Fixed | ProbeMechanism::NozzleAsProbe)
    }

    /// Axes that must be homed before the mechanism may move the tool.
    pub fn homing_required(&self) -> &'static [Axis] {
        match self {
            ProbeMechanism::Sled(_) => &[Axis::X],
            ProbeMechanism::Waypoints(_) => &Axis::ALL,
            _ => &[],
        }
    }

    /// Touch probe that must be deployed and stowed around every contact.
    pub fn low_speed_touch(&mut self) -> Option<&mut TouchProbe> {
        match self {
            ProbeMechanism::Touch(touch) if !touch.high_speed_mode => Some(touch),
            _ => None,
        }
    }

    pub fn strain_gauge(&mut self) -> Option<&mut StrainGauge> {
        match self {
            ProbeMechanism::StrainGauge(gauge) => Some(gauge),
            _ => None,
        }
    }

    pub fn distance_sensor(&mut self) -> Option<&mut dyn DistanceSensor> {
        match self {
            ProbeMechanism::DistanceSensor(probe) => Some(probe.sensor.as_mut()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimEvent, SimMachine};

    fn machine() -> SimMachine {
        SimMachine::new(SimConfig::default())
    }

    #[test]
    fn waypoint_sequence_skips_empty_slots_in_order() {
        let mut seq = WaypointSequence::new();
        seq.set(4, Waypoint { position: [5.0, 0.0, 20.0], feedrate: 0.0 });
        seq.set(1, Waypoint { position: [1.0, 0.0, 20.0], feedrate: 10.0 });
        let xs: Vec<f64> = seq.iter().map(|w| w.position[0]).collect();
        assert_eq!(xs, vec![1.0, 5.0]);
        assert_eq!(seq.len(), 2);
        assert!(WaypointSequence::new().is_empty());
    }

    #[test]
    fn solenoid_drives_pin() {
        let sim = machine();
        let mut hw = sim.hardware();
        let mut mech = ProbeMechanism::from_config(&MechanismConfig::Solenoid { pin: "sol".to_string() }, &mut sim.pins());
        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        mech.actuate(false, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(
            sim.pin_events("sol"),
            vec![SimEvent::Digital("sol".to_string(), true), SimEvent::Digital("sol".to_string(), false)]
        );
        assert_eq!(sim.move_count(), 0);
    }

    #[test]
    fn servo_arm_angles() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::Servo { pin: "servo0".to_string(), deploy_angle: 70.0, stow_angle: 5.0 };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        mech.init(hw.reactor.as_mut());
        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(
            sim.pin_events("servo0"),
            vec![SimEvent::Angle("servo0".to_string(), 5.0), SimEvent::Angle("servo0".to_string(), 70.0)]
        );
    }

    #[test]
    fn sled_docks_then_switches_release() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::Sled { release_pin: Some("sol1".to_string()), docking_x: 200.0, docking_offset: 2.0 };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        mech.actuate(false, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(hw.motion.current_position()[0], 201.0);
        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(hw.motion.current_position()[0], 202.0);
        assert_eq!(
            sim.pin_events("sol1"),
            vec![SimEvent::Digital("sol1".to_string(), false), SimEvent::Digital("sol1".to_string(), true)]
        );
        assert_eq!(mech.homing_required(), &[Axis::X]);
    }

    #[test]
    fn maglatch_pulses_on_deploy_and_raises_on_stow() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::MagLatch { trigger_pin: "mag".to_string(), pulse_time: 0.015, idle_z: 10.0 };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        let before = hw.reactor.monotonic();
        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        assert!((hw.reactor.monotonic() - before - 0.015).abs() < 1e-9);
        assert_eq!(sim.pin_events("mag").len(), 2);
        assert_eq!(sim.move_count(), 0);

        mech.actuate(false, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(sim.pin_events("mag").len(), 2);
        assert_eq!(hw.motion.current_position()[2], 10.0);
    }

    #[test]
    fn waypoints_run_deploy_and_stow_sequences() {
        let sim = machine();
        let mut hw = sim.hardware();
        let mut deploy = WaypointSequence::new();
        deploy.set(0, Waypoint { position: [30.0, 0.0, 20.0], feedrate: 50.0 });
        deploy.set(2, Waypoint { position: [10.0, 0.0, 20.0], feedrate: 5.0 });
        let mut stow = WaypointSequence::new();
        stow.set(0, Waypoint { position: [0.0, 5.0, 20.0], feedrate: 0.0 });
        let mut mech = ProbeMechanism::from_config(&MechanismConfig::Waypoints { deploy, stow }, &mut sim.pins());

        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(sim.moves().iter().map(|m| m.target).collect::<Vec<_>>(), vec![[30.0, 0.0, 20.0], [10.0, 0.0, 20.0]]);
        mech.actuate(false, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(sim.move_count(), 3);
        assert_eq!(hw.motion.current_position(), [0.0, 5.0, 20.0]);
        assert_eq!(mech.homing_required().len(), 3);
    }

    #[test]
    fn rack_and_pinion_moves_x() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::RackAndPinion { deploy_x: 15.0, retract_x: 2.0 };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(hw.motion.current_position()[0], 15.0);
        mech.actuate(false, hw.motion.as_mut(), hw.reactor.as_mut());
        assert_eq!(hw.motion.current_position()[0], 2.0);
    }

    #[test]
    fn fixed_mechanisms_do_nothing() {
        let sim = machine();
        let mut hw = sim.hardware();
        for config in [MechanismConfig::Fixed, MechanismConfig::NozzleAsProbe] {
            let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
            mech.actuate(true, hw.motion.as_mut(), hw.reactor.as_mut());
            assert!(mech.raises_only_for_deploy());
        }
        assert_eq!(sim.move_count(), 0);
    }

    #[test]
    fn strain_gauge_raises_for_stow_too() {
        let sim = machine();
        let config = MechanismConfig::StrainGauge {
            tare_pin: "tare".to_string(),
            tare_time: 0.1,
            tare_delay: 0.2,
            only_while_inactive: false,
        };
        let mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        assert!(!mech.raises_only_for_deploy());
    }

    #[test]
    fn touch_probe_retries_after_alarm() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::Touch { pin: "touch".to_string(), high_speed_mode: false, command_delay: 0.0 };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        sim.set_stuck_trigger(true);
        let touch = mech.low_speed_touch().unwrap();
        assert_eq!(touch.set_deployed(true, hw.trigger.as_ref(), hw.reactor.as_mut()), Err(ProbeError::DeployFailed));
        let angles: Vec<SimEvent> = sim.pin_events("touch");
        assert_eq!(angles.len(), 4); // deploy, reset, stow, deploy

        sim.set_stuck_trigger(false);
        assert!(touch.set_deployed(false, hw.trigger.as_ref(), hw.reactor.as_mut()).is_ok());
    }

    #[test]
    fn strain_gauge_tare() {
        let sim = machine();
        let mut hw = sim.hardware();
        let config = MechanismConfig::StrainGauge {
            tare_pin: "tare".to_string(),
            tare_time: 0.1,
            tare_delay: 0.2,
            only_while_inactive: true,
        };
        let mut mech = ProbeMechanism::from_config(&config, &mut sim.pins());
        let gauge = mech.strain_gauge().unwrap();
        assert!(gauge.tare(hw.trigger.as_mut(), hw.reactor.as_mut()).is_ok());
        assert_eq!(sim.pin_events("tare").len(), 2);
        assert!((hw.reactor.monotonic() - 0.3).abs() < 1e-9);

        sim.set_stuck_trigger(true);
        assert!(matches!(
            gauge.tare(hw.trigger.as_mut(), hw.reactor.as_mut()),
            Err(ProbeError::TareFailed(_))
        ));
    }
}
