//! Slot Sentinel command-line host: config files, HTTP polling, relay telemetry, simulations.

pub mod commands;
pub mod config;
pub mod http_transport;
pub mod marker;
pub mod output;
pub mod relay;
pub mod scenario;
