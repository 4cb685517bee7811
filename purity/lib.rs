#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod artifacts;
pub mod config;
pub mod genes;
pub mod io;
pub mod orient;
pub mod pipeline;
pub mod rank;
pub mod remote;
pub mod types;
pub mod variance;
