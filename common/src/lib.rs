//! Shared types for the blockchain mirror daemon and its offload worker.

#[macro_use]
extern crate log;

pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod upstream;
