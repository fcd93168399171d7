// src/error.rs
// Error kinds raised while reading probe configuration or probing the bed.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Section not found: [{0}]")]
    SectionNotFound(String),
    #[error("Option '{1}' not found in section '[{0}]'")]
    OptionNotFound(String, String),
    #[error("Failed to parse option '{0}' value '{1}' as {2}")]
    ParseError(String, String, String), // option, value, type_expected
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Failure of a deploy, stow or sampling operation.
///
/// `DeployFailed` and `StowFailed` coming from a mechanism self-test are
/// fatal: the machine has already been stopped when they are returned.
/// Everything else is recovered at the `probe_at_point` boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("Position not reachable: X{x:.3} Y{y:.3}")]
    NotReachable { x: f64, y: f64 },
    #[error("Home {0} first")]
    HomingRequired(String),
    #[error("Z-Probe failed to deploy")]
    DeployFailed,
    #[error("Z-Probe failed to stow")]
    StowFailed,
    #[error("Probe did not trigger")]
    NoTrigger,
    #[error("Probe triggered early at Z{z:.3} (limit Z{limit:.3})")]
    TriggeredEarly { z: f64, limit: f64 },
    #[error("Probe tare failed: {0}")]
    TareFailed(String),
    #[error("Cancelled by user")]
    UserCancelled,
    #[error("Probe configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ProbeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::DeployFailed | ProbeError::StowFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_mechanism_faults_are_fatal() {
        assert!(ProbeError::DeployFailed.is_fatal());
        assert!(ProbeError::StowFailed.is_fatal());
        assert!(!ProbeError::NoTrigger.is_fatal());
        assert!(!ProbeError::HomingRequired("X".to_string()).is_fatal());
        assert!(!ProbeError::NotReachable { x: 1.0, y: 2.0 }.is_fatal());
    }

    #[test]
    fn config_error_converts_and_displays() {
        let err: ProbeError = ConfigError::OptionNotFound("probe".to_string(), "z_offset".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Probe configuration error: Option 'z_offset' not found in section '[probe]'"
        );
    }
}
