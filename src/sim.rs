// src/sim.rs
// In-memory printer used by the probe-sim binary and by the tests.
//
// One shared state sits behind a mutex and every hardware interface is a thin
// handle onto it, so a test can inspect what the probe did after the fact.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::core_traits::{
    endstop_bits, Axis, DigitalOut, DistanceSensor, HeaterChannel, MotionDriver, PinResolver, ProbeHardware, Reactor,
    ServoOut, StallDetect, ThermalGate, TriggerSource, UserPrompt, WaitFlags,
};
use crate::mathutil::Vector3d;

/// Servo angles below this extend the tip of a pin-controlled probe.
const TIP_EXTEND_MAX_ANGLE: f64 = 45.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedPlane {
    pub z0: f64,
    pub slope_x: f64,
    pub slope_y: f64,
}

impl BedPlane {
    pub fn flat(z0: f64) -> Self {
        BedPlane { z0, slope_x: 0.0, slope_y: 0.0 }
    }

    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        self.z0 + self.slope_x * x + self.slope_y * y
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub min: Vector3d,
    pub max: Vector3d,
    pub start_position: Vector3d,
    pub homed: bool,
    pub z_trusted: bool,
    /// Physical offset of the probe tip from the nozzle.
    pub probe_offset: Vector3d,
    pub bed: BedPlane,
    /// Flat bed heights met by successive probing descents, one per descent.
    /// Once used up the last one stays.
    pub descent_beds: Vec<f64>,
    /// Output that extends the probe tip. Without one the tip is always out.
    pub probe_pin: Option<String>,
    /// Probe signal reads asserted while the tip is retracted.
    pub triggered_when_stowed: bool,
    /// Nozzle height at which the probe fires whatever the bed height.
    pub early_trigger_z: Option<f64>,
    pub dead_probe: bool,
    /// Endstops latched on contact while stall detection is armed.
    pub stall_bits: u32,
    pub ambient_temp: f64,
    pub probe_temp: f64,
    /// The user answers a prompt after this many idle rounds.
    pub confirm_after_idles: Option<usize>,
    pub abort_after_idles: Option<usize>,
    /// A stuck trigger frees itself after this many idle rounds.
    pub release_after_idles: Option<usize>,
    pub job_in_progress: bool,
    pub with_stall: bool,
    pub with_prompt: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            min: [0.0, 0.0, -20.0],
            max: [220.0, 220.0, 250.0],
            start_position: [110.0, 110.0, 20.0],
            homed: true,
            z_trusted: true,
            probe_offset: [0.0, 0.0, 0.0],
            bed: BedPlane::flat(0.0),
            descent_beds: Vec::new(),
            probe_pin: None,
            triggered_when_stowed: false,
            early_trigger_z: None,
            dead_probe: false,
            stall_bits: endstop_bits::TOWERS,
            ambient_temp: 25.0,
            probe_temp: 25.0,
            confirm_after_idles: Some(3),
            abort_after_idles: None,
            release_after_idles: None,
            job_in_progress: false,
            with_stall: true,
            with_prompt: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimMove {
    pub target: Vector3d,
    pub feedrate: f64,
    /// Z where an endstop stopped the move.
    pub stopped_at: Option<f64>,
}

/// Everything the probe asked of the machine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Move(SimMove),
    Digital(String, bool),
    Angle(String, f64),
    Monitoring(bool),
    ClearLatched,
    Sync(Axis),
    SetTarget(HeaterChannel, f64),
    WaitStable(HeaterChannel),
    HeatersPaused(bool),
    FansPaused(bool),
    AxisEnabled(Axis, bool),
    ExtrudersDisabled,
    StallArmed(Axis, bool),
    HomingCurrent(bool),
    Pause(f64),
    Idle,
    Notify(String),
    Prompt(String),
    EmergencyStop,
}

struct SimState {
    config: SimConfig,
    position: Vector3d,
    mech_z: f64,
    homed: [bool; 3],
    trusted: [bool; 3],
    enabled: [bool; 3],
    stopped: bool,
    monitoring: bool,
    latched: u32,
    stuck: bool,
    tip_extended: bool,
    tip_jammed: bool,
    stall_armed: [bool; 3],
    descent_beds: VecDeque<f64>,
    targets: HashMap<HeaterChannel, f64>,
    temps: HashMap<HeaterChannel, f64>,
    clock: f64,
    idles: usize,
    flags: WaitFlags,
    events: Vec<SimEvent>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let homed = config.homed;
        SimState {
            position: config.start_position,
            mech_z: config.start_position[2],
            homed: [homed; 3],
            trusted: [homed, homed, homed && config.z_trusted],
            enabled: [homed; 3],
            stopped: false,
            monitoring: false,
            latched: 0,
            stuck: false,
            tip_extended: config.probe_pin.is_none(),
            tip_jammed: false,
            stall_armed: [false; 3],
            descent_beds: config.descent_beds.iter().copied().collect(),
            targets: HashMap::new(),
            temps: HashMap::new(),
            clock: 0.0,
            idles: 0,
            flags: WaitFlags::default(),
            events: Vec::new(),
            config,
        }
    }

    /// Nozzle height at which the probe tip meets something at the current XY.
    fn contact_z(&self) -> f64 {
        let off = self.config.probe_offset;
        let bed = self.config.bed.height_at(self.position[0] + off[0], self.position[1] + off[1]) - off[2];
        match self.config.early_trigger_z {
            Some(early) => bed.max(early),
            None => bed,
        }
    }

    fn probe_fires_at(&self, z: f64) -> bool {
        self.tip_extended && !self.config.dead_probe && z <= self.contact_z() + 1e-9
    }

    fn is_triggered(&self) -> bool {
        self.stuck || (self.config.triggered_when_stowed && !self.tip_extended) || self.probe_fires_at(self.mech_z)
    }

    fn do_move(&mut self, target: Vector3d, feedrate: f64) {
        if self.stopped {
            warn!("Move to {:?} ignored: machine stopped", target);
            return;
        }
        let start_z = self.mech_z;
        self.position[0] = target[0];
        self.position[1] = target[1];

        let stall_armed = self.stall_armed.iter().any(|&armed| armed);
        let mut stopped_at = None;
        if (self.monitoring || stall_armed) && target[2] < start_z {
            if let Some(z0) = self.descent_beds.pop_front() {
                self.config.bed = BedPlane::flat(z0);
            }
            let contact = if self.stuck { start_z } else { self.contact_z().min(start_z) };
            let probe_fires = self.monitoring && (self.stuck || self.probe_fires_at(contact));
            let bed_reached = stall_armed && contact >= target[2];
            if (probe_fires || bed_reached) && contact >= target[2] {
                stopped_at = Some(contact);
                if probe_fires {
                    self.latched |= endstop_bits::Z_MIN_PROBE;
                }
                if stall_armed {
                    self.latched |= self.config.stall_bits;
                }
            }
        }
        self.mech_z = stopped_at.unwrap_or(target[2]);
        self.position[2] = target[2];
        trace!("sim move to {:?} F{} stopped_at={:?}", target, feedrate, stopped_at);
        self.events.push(SimEvent::Move(SimMove { target, feedrate, stopped_at }));
    }

    fn set_pin(&mut self, name: &str, extend: bool, event: SimEvent) {
        if !self.tip_jammed && self.config.probe_pin.as_deref() == Some(name) {
            self.tip_extended = extend;
        }
        self.events.push(event);
    }
}

/// Handle implementing every machine interface on the shared state.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl MotionDriver for SimHandle {
    fn move_blocking(&mut self, position: Vector3d, feedrate: f64) {
        self.state.lock().do_move(position, feedrate);
    }

    fn move_blocking_axis(&mut self, axis: Axis, value: f64, feedrate: f64) {
        let mut state = self.state.lock();
        let mut target = state.position;
        target[axis.index()] = value;
        state.do_move(target, feedrate);
    }

    fn is_reachable(&self, position: Vector3d) -> bool {
        let state = self.state.lock();
        (0..3).all(|i| position[i] >= state.config.min[i] && position[i] <= state.config.max[i])
    }

    fn current_position(&self) -> Vector3d {
        self.state.lock().position
    }

    fn sync_position_from_mechanism(&mut self, axis: Axis) {
        let mut state = self.state.lock();
        if axis == Axis::Z {
            state.position[2] = state.mech_z;
        }
        state.events.push(SimEvent::Sync(axis));
    }

    fn is_homed(&self, axis: Axis) -> bool {
        self.state.lock().homed[axis.index()]
    }

    fn is_trusted(&self, axis: Axis) -> bool {
        self.state.lock().trusted[axis.index()]
    }

    fn set_trusted(&mut self, axis: Axis, trusted: bool) {
        self.state.lock().trusted[axis.index()] = trusted;
    }

    fn enable_axis(&mut self, axis: Axis) {
        let mut state = self.state.lock();
        state.enabled[axis.index()] = true;
        state.events.push(SimEvent::AxisEnabled(axis, true));
    }

    fn disable_axis(&mut self, axis: Axis) {
        let mut state = self.state.lock();
        state.enabled[axis.index()] = false;
        state.trusted[axis.index()] = false;
        state.events.push(SimEvent::AxisEnabled(axis, false));
    }

    fn disable_extruders(&mut self) {
        self.state.lock().events.push(SimEvent::ExtrudersDisabled);
    }

    fn job_in_progress(&self) -> bool {
        self.state.lock().config.job_in_progress
    }

    fn emergency_stop(&mut self) {
        let mut state = self.state.lock();
        warn!("sim: emergency stop");
        state.stopped = true;
        state.events.push(SimEvent::EmergencyStop);
    }
}

impl TriggerSource for SimHandle {
    fn is_triggered(&self) -> bool {
        self.state.lock().is_triggered()
    }

    fn trigger_bitmask(&self) -> u32 {
        self.state.lock().latched
    }

    fn set_monitoring(&mut self, enabled: bool) {
        let mut state = self.state.lock();
        state.monitoring = enabled;
        state.events.push(SimEvent::Monitoring(enabled));
    }

    fn is_monitoring(&self) -> bool {
        self.state.lock().monitoring
    }

    fn clear_latched(&mut self) {
        let mut state = self.state.lock();
        state.latched = 0;
        state.events.push(SimEvent::ClearLatched);
    }
}

impl ThermalGate for SimHandle {
    fn set_target(&mut self, channel: HeaterChannel, temp: f64) {
        let mut state = self.state.lock();
        state.targets.insert(channel, temp);
        state.events.push(SimEvent::SetTarget(channel, temp));
    }

    fn current_target(&self, channel: HeaterChannel) -> f64 {
        self.state.lock().targets.get(&channel).copied().unwrap_or(0.0)
    }

    fn current_temperature(&self, channel: HeaterChannel) -> f64 {
        let state = self.state.lock();
        let idle = match channel {
            HeaterChannel::Probe => state.config.probe_temp,
            _ => state.config.ambient_temp,
        };
        state.temps.get(&channel).copied().unwrap_or(idle)
    }

    fn block_until_stable(&mut self, channel: HeaterChannel) {
        let mut state = self.state.lock();
        if let Some(target) = state.targets.get(&channel).copied() {
            if target > 0.0 {
                state.temps.insert(channel, target);
            }
        }
        state.clock += 1.0;
        state.events.push(SimEvent::WaitStable(channel));
    }

    fn pause_heaters(&mut self, pause: bool) {
        self.state.lock().events.push(SimEvent::HeatersPaused(pause));
    }

    fn set_fans_paused(&mut self, pause: bool) {
        self.state.lock().events.push(SimEvent::FansPaused(pause));
    }
}

impl Reactor for SimHandle {
    fn monotonic(&self) -> f64 {
        self.state.lock().clock
    }

    fn pause(&mut self, seconds: f64) {
        let mut state = self.state.lock();
        state.clock += seconds;
        state.events.push(SimEvent::Pause(seconds));
    }

    fn idle(&mut self) {
        let mut state = self.state.lock();
        state.idles += 1;
        state.events.push(SimEvent::Idle);
        if state.config.release_after_idles.map_or(false, |n| state.idles >= n) {
            state.stuck = false;
        }
        if state.config.abort_after_idles.map_or(false, |n| state.idles >= n) {
            state.flags.abort.store(true, Ordering::SeqCst);
        } else if state.config.confirm_after_idles.map_or(false, |n| state.idles >= n) {
            state.flags.proceed.store(true, Ordering::SeqCst);
        }
    }
}

impl StallDetect for SimHandle {
    fn enable(&mut self, axis: Axis) -> bool {
        let mut state = self.state.lock();
        state.stall_armed[axis.index()] = true;
        state.events.push(SimEvent::StallArmed(axis, true));
        true
    }

    fn disable(&mut self, axis: Axis, _prior_state: bool) {
        let mut state = self.state.lock();
        state.stall_armed[axis.index()] = false;
        state.events.push(SimEvent::StallArmed(axis, false));
    }

    fn set_homing_current_profile(&mut self, homing: bool) {
        self.state.lock().events.push(SimEvent::HomingCurrent(homing));
    }
}

impl UserPrompt for SimHandle {
    fn notify(&mut self, message: &str) {
        debug!("sim: message '{}'", message);
        self.state.lock().events.push(SimEvent::Notify(message.to_string()));
    }

    fn prompt_continue(&mut self, message: &str) {
        let mut state = self.state.lock();
        state.idles = 0;
        state.events.push(SimEvent::Prompt(message.to_string()));
    }

    fn wait_flags(&self) -> WaitFlags {
        self.state.lock().flags.clone()
    }
}

struct SimPin {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl DigitalOut for SimPin {
    fn set_digital(&mut self, high: bool) {
        self.state.lock().set_pin(&self.name, high, SimEvent::Digital(self.name.clone(), high));
    }
}

impl ServoOut for SimPin {
    fn set_angle(&mut self, degrees: f64) {
        let extend = degrees < TIP_EXTEND_MAX_ANGLE;
        self.state.lock().set_pin(&self.name, extend, SimEvent::Angle(self.name.clone(), degrees));
    }
}

struct SimDistance {
    state: Arc<Mutex<SimState>>,
}

impl DistanceSensor for SimDistance {
    fn read_distance(&mut self) -> f64 {
        let state = self.state.lock();
        state.mech_z - state.config.bed.height_at(state.position[0], state.position[1])
    }
}

pub struct SimPins {
    state: Arc<Mutex<SimState>>,
}

impl PinResolver for SimPins {
    fn digital_out(&mut self, pin_name: &str) -> Box<dyn DigitalOut> {
        Box::new(SimPin { name: pin_name.to_string(), state: Arc::clone(&self.state) })
    }

    fn servo(&mut self, pin_name: &str) -> Box<dyn ServoOut> {
        Box::new(SimPin { name: pin_name.to_string(), state: Arc::clone(&self.state) })
    }

    fn distance_sensor(&mut self, _sensor_name: &str) -> Box<dyn DistanceSensor> {
        Box::new(SimDistance { state: Arc::clone(&self.state) })
    }
}

/// Owner of the simulated printer. Hand out interfaces with `hardware()` and
/// `pins()`, then inspect the recorded events.
pub struct SimMachine {
    state: Arc<Mutex<SimState>>,
}

impl SimMachine {
    pub fn new(config: SimConfig) -> Self {
        SimMachine { state: Arc::new(Mutex::new(SimState::new(config))) }
    }

    fn handle(&self) -> SimHandle {
        SimHandle { state: Arc::clone(&self.state) }
    }

    pub fn hardware(&self) -> ProbeHardware {
        let (with_stall, with_prompt) = {
            let state = self.state.lock();
            (state.config.with_stall, state.config.with_prompt)
        };
        ProbeHardware {
            motion: Box::new(self.handle()),
            trigger: Box::new(self.handle()),
            thermal: Box::new(self.handle()),
            reactor: Box::new(self.handle()),
            stall: if with_stall { Some(Box::new(self.handle())) } else { None },
            prompt: if with_prompt { Some(Box::new(self.handle())) } else { None },
        }
    }

    pub fn pins(&self) -> SimPins {
        SimPins { state: Arc::clone(&self.state) }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn pin_events(&self, name: &str) -> Vec<SimEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Digital(pin, _) | SimEvent::Angle(pin, _) if pin == name))
            .collect()
    }

    pub fn moves(&self) -> Vec<SimMove> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Move(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn move_count(&self) -> usize {
        self.moves().len()
    }

    /// Messages shown to the user, prompts included.
    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Notify(m) | SimEvent::Prompt(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self) -> Vector3d {
        self.state.lock().position
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_tip_extended(&self) -> bool {
        self.state.lock().tip_extended
    }

    pub fn set_stuck_trigger(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    /// Freezes the tip where it is, whatever the probe pin does.
    pub fn set_tip_jammed(&self, jammed: bool) {
        self.state.lock().tip_jammed = jammed;
    }

    pub fn set_bed(&self, bed: BedPlane) {
        self.state.lock().config.bed = bed;
    }

    pub fn set_early_trigger(&self, z: Option<f64>) {
        self.state.lock().config.early_trigger_z = z;
    }

    pub fn set_dead_probe(&self, dead: bool) {
        self.state.lock().config.dead_probe = dead;
    }

    pub fn set_temperature(&self, channel: HeaterChannel, temp: f64) {
        let mut state = self.state.lock();
        match channel {
            HeaterChannel::Probe => state.config.probe_temp = temp,
            _ => {
                state.temps.insert(channel, temp);
            }
        }
    }

    pub fn set_homed(&self, axis: Axis, homed: bool) {
        let mut state = self.state.lock();
        state.homed[axis.index()] = homed;
        state.trusted[axis.index()] = homed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitored_descent_stops_at_contact() {
        let sim = SimMachine::new(SimConfig { bed: BedPlane::flat(0.4), ..SimConfig::default() });
        let mut hw = sim.hardware();
        hw.trigger.set_monitoring(true);
        hw.motion.move_blocking_axis(Axis::Z, -5.0, 5.0);
        assert_eq!(hw.motion.current_position()[2], -5.0);
        assert_ne!(hw.trigger.trigger_bitmask() & endstop_bits::Z_MIN_PROBE, 0);
        assert!(hw.trigger.is_triggered());
        hw.motion.sync_position_from_mechanism(Axis::Z);
        assert!((hw.motion.current_position()[2] - 0.4).abs() < 1e-12);
        assert_eq!(sim.moves()[0].stopped_at, Some(0.4));
    }

    #[test]
    fn unmonitored_descent_runs_to_target() {
        let sim = SimMachine::new(SimConfig::default());
        let mut hw = sim.hardware();
        hw.motion.move_blocking_axis(Axis::Z, 2.0, 0.0);
        hw.motion.sync_position_from_mechanism(Axis::Z);
        assert_eq!(hw.motion.current_position()[2], 2.0);
        assert_eq!(hw.trigger.trigger_bitmask(), 0);
    }

    #[test]
    fn probe_pin_controls_tip() {
        let config = SimConfig {
            probe_pin: Some("probe".to_string()),
            triggered_when_stowed: true,
            ..SimConfig::default()
        };
        let sim = SimMachine::new(config);
        let hw = sim.hardware();
        assert!(hw.trigger.is_triggered());
        let mut pin = sim.pins().digital_out("probe");
        pin.set_digital(true);
        assert!(sim.is_tip_extended());
        assert!(!hw.trigger.is_triggered());
    }

    #[test]
    fn reactor_confirms_prompt_after_idles() {
        let sim = SimMachine::new(SimConfig::default());
        let mut hw = sim.hardware();
        let flags = hw.prompt.as_ref().unwrap().wait_flags();
        hw.reactor.idle();
        hw.reactor.idle();
        assert!(!flags.proceed.load(Ordering::SeqCst));
        hw.reactor.idle();
        assert!(flags.proceed.load(Ordering::SeqCst));
    }

    #[test]
    fn descent_beds_change_per_descent() {
        let sim = SimMachine::new(SimConfig { descent_beds: vec![0.4, 0.3], ..SimConfig::default() });
        let mut hw = sim.hardware();
        hw.trigger.set_monitoring(true);
        for _ in 0..3 {
            hw.motion.move_blocking_axis(Axis::Z, -5.0, 5.0);
            hw.motion.sync_position_from_mechanism(Axis::Z);
            hw.motion.move_blocking_axis(Axis::Z, 5.0, 5.0);
        }
        let stops: Vec<Option<f64>> = sim.moves().iter().step_by(2).map(|m| m.stopped_at).collect();
        assert_eq!(stops, vec![Some(0.4), Some(0.3), Some(0.3)]);
    }

    #[test]
    fn stuck_trigger_releases_after_idles() {
        let sim = SimMachine::new(SimConfig {
            release_after_idles: Some(2),
            confirm_after_idles: None,
            ..SimConfig::default()
        });
        let mut hw = sim.hardware();
        sim.set_stuck_trigger(true);
        hw.reactor.idle();
        assert!(hw.trigger.is_triggered());
        hw.reactor.idle();
        assert!(!hw.trigger.is_triggered());
    }

    #[test]
    fn emergency_stop_freezes_motion() {
        let sim = SimMachine::new(SimConfig::default());
        let mut hw = sim.hardware();
        hw.motion.emergency_stop();
        hw.motion.move_blocking([0.0, 0.0, 0.0], 0.0);
        assert!(sim.is_stopped());
        assert_eq!(sim.move_count(), 0);
        assert_eq!(sim.position(), [110.0, 110.0, 20.0]);
    }

    #[test]
    fn reachability_envelope() {
        let sim = SimMachine::new(SimConfig::default());
        let hw = sim.hardware();
        assert!(hw.motion.is_reachable([0.0, 220.0, 5.0]));
        assert!(!hw.motion.is_reachable([-1.0, 100.0, 5.0]));
        assert!(!hw.motion.is_reachable([100.0, 221.0, 5.0]));
    }
}
