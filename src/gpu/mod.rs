//! Accelerator discovery.
//!
//! - [`device`]: device enumeration and Device-tier budgeting

pub mod device;
