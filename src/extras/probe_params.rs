// src/extras/probe_params.rs
// Options of the [probe] config section.

use crate::configfile::Configfile;
use crate::error::{ConfigError, ProbeError};
use crate::extras::mechanism::{Waypoint, WaypointSequence, MAX_WAYPOINTS};
use crate::mathutil::Vector3d;

const SECTION: &str = "probe";

/// Upper bound on samples per point, sized for the fixed sample buffer.
pub const MAX_SAMPLES: usize = 16;

/// Temperatures and heater policy that apply while probing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub preheat_hotend_temp: f64,
    pub preheat_bed_temp: f64,
    pub turn_heaters_off: bool,
    pub stabilize_temperatures_after_probing: bool,
}

/// Which stepper drivers watch for a stall during sensorless probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensitivityMask {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl Default for SensitivityMask {
    fn default() -> Self {
        SensitivityMask { x: true, y: true, z: true }
    }
}

impl SensitivityMask {
    /// Parses a subset of "xyz", e.g. `z` or `xy`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut mask = SensitivityMask { x: false, y: false, z: false };
        for c in spec.trim().chars() {
            match c.to_ascii_lowercase() {
                'x' => mask.x = true,
                'y' => mask.y = true,
                'z' => mask.z = true,
                _ => {
                    return Err(ConfigError::ParseError(
                        "sensitivity".to_string(),
                        spec.to_string(),
                        "axis letters x/y/z".to_string(),
                    ))
                }
            }
        }
        Ok(mask)
    }
}

/// Noise sources silenced during each descent.
#[derive(Debug, Clone, PartialEq)]
pub struct QuietProbing {
    pub fans_off: bool,
    pub esteppers_off: bool,
    pub steppers_off: bool,
    pub delay_before_probing: f64, // seconds
}

impl QuietProbing {
    pub fn is_enabled(&self, settings: &ProbeSettings) -> bool {
        settings.turn_heaters_off || self.fans_off || self.esteppers_off || self.steppers_off
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MechanismConfig {
    Fixed,
    NozzleAsProbe,
    Solenoid { pin: String },
    Servo { pin: String, deploy_angle: f64, stow_angle: f64 },
    Sled { release_pin: Option<String>, docking_x: f64, docking_offset: f64 },
    MagLatch { trigger_pin: String, pulse_time: f64, idle_z: f64 },
    Waypoints { deploy: WaypointSequence, stow: WaypointSequence },
    StrainGauge { tare_pin: String, tare_time: f64, tare_delay: f64, only_while_inactive: bool },
    RackAndPinion { deploy_x: f64, retract_x: f64 },
    Touch { pin: String, high_speed_mode: bool, command_delay: f64 },
    DistanceSensor { sensor: String },
}

const MECHANISMS: &[&str] = &[
    "fixed",
    "nozzle",
    "solenoid",
    "servo",
    "sled",
    "maglev",
    "waypoints",
    "strain_gauge",
    "rack_and_pinion",
    "touch",
    "distance_sensor",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TwistConfig {
    pub start_x: f64,
    pub spacing: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalDriftConfig {
    pub start_temp: f64,
    pub step: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeParams {
    pub offset: Vector3d,
    pub mechanism: MechanismConfig,
    /// Total descents per point.
    pub samples: usize,
    /// Descents discarded as outliers when more than two are taken.
    pub extra_samples: usize,
    pub speed: f64,
    pub fast_speed: f64,
    pub travel_speed: f64,
    pub clearance_deploy: f64,
    pub clearance_between: f64,
    pub clearance_multi: f64,
    pub low_point: f64,
    pub sanity_check: bool,
    pub retry_and_recover: bool,
    pub pause_before_deploy_stow: bool,
    pub pause_when_triggered: bool,
    pub triggered_when_stowed_test: bool,
    pub preheat_before_probing: bool,
    pub settings: ProbeSettings,
    pub wait_for_hotend: bool,
    pub wait_for_bed: bool,
    pub quiet: QuietProbing,
    pub parallel_kinematics: bool,
    pub sensorless: bool,
    pub sensorless_delta: bool,
    pub sensitivity: SensitivityMask,
    pub sensorless_offsets: [f64; 3],
    pub thermal_drift: Option<ThermalDriftConfig>,
    pub twist: Option<TwistConfig>,
}

impl ProbeParams {
    pub fn new(config: &Configfile) -> Result<Self, ProbeError> {
        if !config.has_section(SECTION) {
            return Err(ConfigError::SectionNotFound(SECTION.to_string()).into());
        }
        let getf = |opt: &str, default: Option<f64>| config.getfloat(SECTION, opt, default, None, None);
        let positive = |opt: &str, default: Option<f64>| config.getfloat(SECTION, opt, default, Some(f64::MIN_POSITIVE), None);
        let getb = |opt: &str, default: bool| config.getboolean(SECTION, opt, Some(default));

        let offset = [getf("x_offset", Some(0.0))?, getf("y_offset", Some(0.0))?, getf("z_offset", None)?];

        let samples = config.getint(SECTION, "samples", Some(1), Some(1), Some(MAX_SAMPLES as i64))? as usize;
        let extra_samples = config.getint(SECTION, "extra_samples", Some(0), Some(0), None)? as usize;
        if extra_samples > 0 && (samples <= 2 || extra_samples >= samples - 1) {
            return Err(ConfigError::ValidationError(format!(
                "'extra_samples' ({}) needs more than two samples and must leave at least two ({} configured)",
                extra_samples, samples
            ))
            .into());
        }

        let speed = positive("speed", Some(5.0))?;
        let fast_speed = positive("fast_speed", Some(speed * 2.0))?;
        let travel_speed = positive("travel_speed", Some(133.0))?;

        let clearance_deploy = config.getfloat(SECTION, "clearance_deploy", Some(10.0), Some(0.0), None)?;
        let clearance_between = config.getfloat(SECTION, "clearance_between", Some(5.0), Some(0.0), None)?;
        let clearance_multi = config.getfloat(SECTION, "clearance_multi", Some(clearance_between), Some(0.0), None)?;
        let low_point = getf("low_point", Some(-2.0))?;

        let turn_heaters_off = getb("turn_heaters_off", false)?;
        let settings = ProbeSettings {
            preheat_hotend_temp: config.getfloat(SECTION, "preheat_hotend_temp", Some(0.0), Some(0.0), None)?,
            preheat_bed_temp: config.getfloat(SECTION, "preheat_bed_temp", Some(0.0), Some(0.0), None)?,
            turn_heaters_off,
            stabilize_temperatures_after_probing: getb("stabilize_temperatures_after_probing", false)?,
        };

        let delay_ms = config.getfloat(SECTION, "delay_before_probing", Some(25.0), Some(0.0), None)?;
        let quiet = QuietProbing {
            fans_off: getb("fans_off", false)?,
            esteppers_off: getb("esteppers_off", false)?,
            steppers_off: getb("steppers_off", false)?,
            delay_before_probing: delay_ms.max(25.0) / 1000.0,
        };

        let sensorless = getb("sensorless", false)?;
        let sensorless_delta = getb("sensorless_delta", false)?;
        if sensorless_delta && !sensorless {
            return Err(ConfigError::ValidationError("'sensorless_delta' requires 'sensorless'".to_string()).into());
        }
        let sensitivity = SensitivityMask::parse(&config.get(SECTION, "sensitivity", Some("xyz"))?)?;

        let params = ProbeParams {
            offset,
            mechanism: Self::parse_mechanism(config)?,
            samples,
            extra_samples,
            speed,
            fast_speed,
            travel_speed,
            clearance_deploy,
            clearance_between,
            clearance_multi,
            low_point,
            sanity_check: getb("sanity_check", true)?,
            retry_and_recover: getb("retry_and_recover", false)?,
            pause_before_deploy_stow: getb("pause_before_deploy_stow", false)?,
            pause_when_triggered: getb("pause_when_triggered", false)?,
            triggered_when_stowed_test: getb("triggered_when_stowed_test", false)?,
            preheat_before_probing: getb("preheat_before_probing", false)?,
            settings,
            wait_for_hotend: getb("wait_for_hotend", false)?,
            wait_for_bed: getb("wait_for_bed", false)?,
            quiet,
            parallel_kinematics: getb("parallel_kinematics", sensorless_delta)?,
            sensorless,
            sensorless_delta,
            sensitivity,
            sensorless_offsets: [
                getf("sensorless_offset_a", Some(0.0))?,
                getf("sensorless_offset_b", Some(0.0))?,
                getf("sensorless_offset_c", Some(0.0))?,
            ],
            thermal_drift: Self::parse_thermal_drift(config)?,
            twist: Self::parse_twist(config)?,
        };
        Ok(params)
    }

    fn parse_mechanism(config: &Configfile) -> Result<MechanismConfig, ProbeError> {
        let kind = config.getchoice(SECTION, "mechanism", MECHANISMS, Some("fixed"))?;
        let pin = |opt: &str| config.get(SECTION, opt, None);
        let ms = |opt: &str, default: f64| -> Result<f64, ConfigError> {
            Ok(config.getfloat(SECTION, opt, Some(default), Some(0.0), None)? / 1000.0)
        };

        let mechanism = match kind.as_str() {
            "fixed" => MechanismConfig::Fixed,
            "nozzle" => MechanismConfig::NozzleAsProbe,
            "solenoid" => MechanismConfig::Solenoid { pin: pin("pin")? },
            "servo" => MechanismConfig::Servo {
                pin: pin("servo_pin")?,
                deploy_angle: config.getfloat(SECTION, "servo_deploy_angle", Some(70.0), Some(0.0), Some(180.0))?,
                stow_angle: config.getfloat(SECTION, "servo_stow_angle", Some(0.0), Some(0.0), Some(180.0))?,
            },
            "sled" => MechanismConfig::Sled {
                release_pin: config.get(SECTION, "release_pin", None).ok(),
                docking_x: config.getfloat(SECTION, "sled_docking_x", None, None, None)?,
                docking_offset: config.getfloat(SECTION, "sled_docking_offset", Some(0.0), None, None)?,
            },
            "maglev" => MechanismConfig::MagLatch {
                trigger_pin: pin("trigger_pin")?,
                pulse_time: ms("maglev_trigger_ms", 15.0)?,
                idle_z: config.getfloat(SECTION, "maglev_idle_z", Some(10.0), None, None)?,
            },
            "waypoints" => {
                let deploy = Self::parse_waypoints(config, "deploy")?;
                if deploy.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "mechanism 'waypoints' needs at least one deploy_N option".to_string(),
                    )
                    .into());
                }
                MechanismConfig::Waypoints { deploy, stow: Self::parse_waypoints(config, "stow")? }
            }
            "strain_gauge" => MechanismConfig::StrainGauge {
                tare_pin: pin("tare_pin")?,
                tare_time: ms("tare_time_ms", 100.0)?,
                tare_delay: ms("tare_delay_ms", 200.0)?,
                only_while_inactive: config.getboolean(SECTION, "tare_only_while_inactive", Some(false))?,
            },
            "rack_and_pinion" => MechanismConfig::RackAndPinion {
                deploy_x: config.getfloat(SECTION, "rack_deploy_x", None, None, None)?,
                retract_x: config.getfloat(SECTION, "rack_retract_x", None, None, None)?,
            },
            "touch" => MechanismConfig::Touch {
                pin: pin("control_pin")?,
                high_speed_mode: config.getboolean(SECTION, "touch_high_speed", Some(false))?,
                command_delay: ms("touch_delay_ms", 500.0)?,
            },
            "distance_sensor" => MechanismConfig::DistanceSensor { sensor: pin("sensor")? },
            other => {
                return Err(ConfigError::ValidationError(format!("unknown probe mechanism '{}'", other)).into());
            }
        };
        Ok(mechanism)
    }

    /// Reads `<prefix>_1` .. `<prefix>_5`, each `x, y, z[, feedrate]`.
    fn parse_waypoints(config: &Configfile, prefix: &str) -> Result<WaypointSequence, ConfigError> {
        let mut seq = WaypointSequence::new();
        for step in 0..MAX_WAYPOINTS {
            let option = format!("{}_{}", prefix, step + 1);
            if !config.has_option(SECTION, &option) {
                continue;
            }
            let values = config.getfloatlist(SECTION, &option, None)?;
            let waypoint = match values.as_slice() {
                [x, y, z] => Waypoint { position: [*x, *y, *z], feedrate: 0.0 },
                [x, y, z, f] if *f >= 0.0 => Waypoint { position: [*x, *y, *z], feedrate: *f },
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "Option '{}' in section '[{}]' must be 'x, y, z[, feedrate]'",
                        option, SECTION
                    )))
                }
            };
            seq.set(step, waypoint);
        }
        Ok(seq)
    }

    fn parse_twist(config: &Configfile) -> Result<Option<TwistConfig>, ConfigError> {
        if !config.has_option(SECTION, "twist_values") {
            return Ok(None);
        }
        Ok(Some(TwistConfig {
            start_x: config.getfloat(SECTION, "twist_start_x", None, None, None)?,
            spacing: config.getfloat(SECTION, "twist_spacing", None, Some(f64::MIN_POSITIVE), None)?,
            values: config.getfloatlist(SECTION, "twist_values", None)?,
        }))
    }

    fn parse_thermal_drift(config: &Configfile) -> Result<Option<ThermalDriftConfig>, ConfigError> {
        if !config.has_option(SECTION, "ptc_values") {
            return Ok(None);
        }
        Ok(Some(ThermalDriftConfig {
            start_temp: config.getfloat(SECTION, "ptc_start_temp", None, None, None)?,
            step: config.getfloat(SECTION, "ptc_step", None, Some(f64::MIN_POSITIVE), None)?,
            values: config.getfloatlist(SECTION, "ptc_values", None)?,
        }))
    }

    /// Samples that contribute to the average.
    pub fn used_samples(&self) -> usize {
        self.samples - self.extra_samples
    }
}
