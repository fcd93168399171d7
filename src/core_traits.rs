// src/core_traits.rs
// Interfaces of the machine services the probe drives but does not own:
// motion, endstops, heaters, stall detection, user prompts and pins.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::mathutil::Vector3d;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        }
    }
}

/// Bits of `TriggerSource::trigger_bitmask`.
pub mod endstop_bits {
    pub const X_MAX: u32 = 1 << 0;
    pub const Y_MAX: u32 = 1 << 1;
    pub const Z_MAX: u32 = 1 << 2;
    pub const Z_MIN_PROBE: u32 = 1 << 3;

    /// Tower endstops watched for a stall on parallel-kinematics machines.
    pub const TOWERS: u32 = X_MAX | Y_MAX | Z_MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaterChannel {
    Hotend(u8),
    Bed,
    /// Temperature sensor on the probe itself (read only).
    Probe,
}

// --- Motion ---
/// Blocking access to the motion planner. Every move returns once the
/// machine has arrived (or was stopped by an endstop).
///
/// A feedrate of `0.0` means "use the planner's current feedrate".
pub trait MotionDriver {
    fn move_blocking(&mut self, position: Vector3d, feedrate: f64);
    fn move_blocking_axis(&mut self, axis: Axis, value: f64, feedrate: f64);
    /// Whether the tool reference point may travel to `position`.
    fn is_reachable(&self, position: Vector3d) -> bool;
    fn current_position(&self) -> Vector3d;
    /// Replace the logical position of `axis` with the position the steppers
    /// actually reached, e.g. after an endstop interrupted a move.
    fn sync_position_from_mechanism(&mut self, axis: Axis);
    fn is_homed(&self, axis: Axis) -> bool;
    fn is_trusted(&self, axis: Axis) -> bool;
    fn set_trusted(&mut self, axis: Axis, trusted: bool);
    fn enable_axis(&mut self, axis: Axis);
    fn disable_axis(&mut self, axis: Axis);
    fn disable_extruders(&mut self);
    /// True while commands are queued, moves are planned or a print job runs.
    fn job_in_progress(&self) -> bool;
    /// Machine-level stop. No further motion is accepted afterwards.
    fn emergency_stop(&mut self);
}

// --- Endstops ---
pub trait TriggerSource {
    /// Live state of the probe contact signal.
    fn is_triggered(&self) -> bool;
    /// Endstops latched during the last move (see `endstop_bits`).
    fn trigger_bitmask(&self) -> u32;
    fn set_monitoring(&mut self, enabled: bool);
    /// Whether the probe endstop is being monitored. This is the record of
    /// whether the probe counts as deployed.
    fn is_monitoring(&self) -> bool;
    fn clear_latched(&mut self);
}

// --- Heaters ---
pub trait ThermalGate {
    fn set_target(&mut self, channel: HeaterChannel, temp: f64);
    fn current_target(&self, channel: HeaterChannel) -> f64;
    fn current_temperature(&self, channel: HeaterChannel) -> f64;
    fn block_until_stable(&mut self, channel: HeaterChannel);
    fn pause_heaters(&mut self, pause: bool);
    fn set_fans_paused(&mut self, pause: bool);
}

// --- Stall detection ---
pub trait StallDetect {
    /// Arm stall detection on `axis`, returning the driver mode to restore.
    fn enable(&mut self, axis: Axis) -> bool;
    fn disable(&mut self, axis: Axis, prior_state: bool);
    fn set_homing_current_profile(&mut self, homing: bool);
}

// --- User interaction ---
/// Flags shared with the host/UI while the control thread waits for the user.
#[derive(Debug, Clone, Default)]
pub struct WaitFlags {
    /// Set by the user interface when the user presses "continue".
    pub proceed: Arc<AtomicBool>,
    /// Set when the wait must be abandoned (e.g. print cancelled).
    pub abort: Arc<AtomicBool>,
}

pub trait UserPrompt {
    fn notify(&mut self, message: &str);
    /// Show a message with a "continue" choice. The answer arrives through `wait_flags`.
    fn prompt_continue(&mut self, message: &str);
    fn wait_flags(&self) -> WaitFlags;
}

// --- Event loop ---
/// Cooperative housekeeping hooks of the command thread.
pub trait Reactor {
    fn monotonic(&self) -> f64;
    /// Delay that keeps thermal regulation and host keepalive running.
    fn pause(&mut self, seconds: f64);
    /// Run one round of background housekeeping without sleeping.
    fn idle(&mut self);
}

// --- Pins ---
pub trait DigitalOut {
    fn set_digital(&mut self, high: bool);
}

pub trait ServoOut {
    fn set_angle(&mut self, degrees: f64);
}

pub trait DistanceSensor {
    /// Distance in mm between the nozzle and the surface below it.
    fn read_distance(&mut self) -> f64;
}

/// Looks up the output devices named in the configuration.
pub trait PinResolver {
    fn digital_out(&mut self, pin_name: &str) -> Box<dyn DigitalOut>;
    fn servo(&mut self, pin_name: &str) -> Box<dyn ServoOut>;
    fn distance_sensor(&mut self, sensor_name: &str) -> Box<dyn DistanceSensor>;
}

/// Every collaborator a probe needs, owned for the lifetime of the probe.
pub struct ProbeHardware {
    pub motion: Box<dyn MotionDriver>,
    pub trigger: Box<dyn TriggerSource>,
    pub thermal: Box<dyn ThermalGate>,
    pub reactor: Box<dyn Reactor>,
    pub stall: Option<Box<dyn StallDetect>>,
    pub prompt: Option<Box<dyn UserPrompt>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_index_and_name() {
        assert_eq!(Axis::ALL.map(Axis::index), [0, 1, 2]);
        assert_eq!(Axis::Z.name(), "Z");
    }

    #[test]
    fn tower_bits_exclude_probe() {
        assert_eq!(endstop_bits::TOWERS & endstop_bits::Z_MIN_PROBE, 0);
        assert_eq!(endstop_bits::TOWERS.count_ones(), 3);
    }
}
