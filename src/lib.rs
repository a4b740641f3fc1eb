#![cfg_attr(docsrs, feature(doc_cfg))]
//! # battmon_lib
//!
//! This crate models multi-cell battery packs as a tree of elements carrying typed readings,
//! and fills those readings from battery management hardware on an I2C bus.
//!
//! - [`reading`]: per-element stores of primitive and derived readings.
//! - [`battery`]: single cells and packs, with value-changed notifications that propagate to
//!   the root of the tree.
//! - [`bus`]: an asynchronous connection on top of a blocking native I2C transport.
//! - [`smbus`]: SMBus transactions and a smart battery adapter.
//! - [`ltc6804`]: the LTC6804 chip pack and its adapter.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `battmon`
//!   command-line tool.
//! - `buspirate`: Enables a transport for a Bus Pirate in binary I2C mode using the
//!   `serialport` crate.
//! - `bin-dependencies`: Enables all features required by the `battmon` binary executable.

/// Contains error types for the library.
mod error;

/// Outcome of adapter read operations.
pub mod acquisition;
pub mod battery;
pub mod bus;
pub mod ltc6804;
/// Value-changed notifications.
pub mod notify;
pub mod reading;
pub mod smbus;

pub use error::{Direction, Error, Result, TransferFailure};
