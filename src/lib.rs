#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! modemctl library, the device-control core for a cellular modem.
//!
//! The building blocks, leaves first:
//! - `channel`: TCP/serial byte stream with reconnect backoff and AT line framing
//! - `command`: command descriptors, terminators and the AT command table
//! - `parser`: pure parsers from response text to typed values
//! - `dispatcher`: single-worker queue, one command in flight at a time
//! - `events`: broadcast bus for realtime subscribers
//! - `monitor`: background telemetry polling
//! - `scan`: detach / scan / restore state machine
//! - `device`: the adapter-facing command surface
//! - `config`: configuration loading

pub mod channel;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod monitor;
pub mod parser;
pub mod probe;
pub mod scan;

#[cfg(test)]
mod testing;

// Re-export key types at crate root for convenience.
pub use channel::ConnectionState;
pub use config::Config;
pub use device::Device;
pub use dispatcher::Dispatcher;
pub use error::ModemError;
pub use events::{DeviceEvent, EventBus};
pub use monitor::{DeviceMonitor, MonitorSnapshot};
pub use scan::{ScanError, ScanOrchestrator, ScanPhase, ScanSession};
