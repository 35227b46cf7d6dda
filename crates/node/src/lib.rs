//! In-process beacon network.
//!
//! This crate wires the protocol coordinators into runnable nodes:
//! - Loading the protocol configuration
//! - Running an epoch's DKG over an in-memory network, or restoring it from checkpoints
//! - Driving beacon rounds and reporting each round's seed

pub mod config;
pub mod simulation;

pub use config::{load_config, ConfigOverrides};
pub use simulation::{simulate, SimulationOptions, SimulationReport};
