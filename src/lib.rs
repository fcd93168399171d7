// src/lib.rs

// Bed probing for 3D printers: measuring bed height at XY points with a
// deployable Z probe.

pub mod configfile;
pub mod core_traits;
pub mod error;
pub mod mathutil;
pub mod sim;

pub mod extras;

pub use error::{ConfigError, ProbeError};
pub use extras::probe::{PrinterProbe, ProbePtRaise};
