#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

#[path = "../calibrate/mod.rs"]
pub mod calibrate;

pub mod pipeline;
