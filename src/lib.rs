#![deny(missing_docs)]
//! Serve a serial port over TCP.
//!
//! One serial port is bridged to one TCP listener.
//! Bytes written by any connected client are written to the port,
//! bytes read from the port are sent to every connected client.
//!
//! There is no authentication or encryption, only use this in trusted networks.

/// Code relating to setting up the server which accepts connections and spawns handlers for them.
pub mod server;

/// Copies bytes between one TCP connection and the serial port.
pub mod connection;

/// The command line interface.
pub mod cli;

/// Mocked serial port driver.
pub mod mock;

/// Serial port driver.
pub mod serial;

/// Relates to config files and serial settings.
pub mod config;

/// An endpoint- i.e. something bytes can be read from and written to, such as a serial port.
/// But can also be mocked in memory.
pub mod endpoint;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
