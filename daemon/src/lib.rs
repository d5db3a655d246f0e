//! Blockchain mirror daemon: synchronization engine, storage layer, and
//! the consistency/rewind machinery that keeps the mirror a consistent
//! prefix of the upstream chain.

#[macro_use]
extern crate log;

pub mod config;
pub mod core;
