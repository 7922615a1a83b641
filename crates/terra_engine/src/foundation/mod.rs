//! Foundation utilities shared by every engine layer
//!
//! Math aliases, typed registry keys and logging helpers.

pub mod collections;
pub mod logging;
pub mod math;
