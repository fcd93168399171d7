// src/extras/mod.rs
// Probe support: configuration, mechanisms, the deploy/stow controller and
// the sampling pipeline.

pub mod compensation;
pub mod deploy_stow;
pub mod mechanism;
pub mod multi_sample;
pub mod probe;
pub mod probe_move;
pub mod probe_params;
pub mod samples;
pub mod sensorless;
