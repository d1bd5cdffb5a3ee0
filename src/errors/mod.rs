//! Error handling for detectors and engines

pub mod engine_error;

pub use engine_error::*;
