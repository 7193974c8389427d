//! Utility library for the AQM sweep project

pub mod other;
pub mod serde;
