#![deny(dead_code)]
#![deny(unused_imports)]

pub mod artifact;
pub mod config;
pub mod data;
pub mod histogram;
pub mod metrics;
pub mod pattern;
pub mod report;
pub mod roc;
pub mod threshold;
pub mod weights;
// No global functions here; settings are scoped to owning modules.
