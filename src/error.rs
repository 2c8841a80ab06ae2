use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors which stop the bridge from running.
///
/// Problems with a single connection are not represented here,
/// see [`crate::connection::ConnectionError`].
#[derive(Debug, Error)]
pub enum Error {
    /// A serial setting was not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(#[from] ConfigError),

    /// The configuration file could not be used.
    #[error("Could not load configuration file `{path}`. Problem: {problem}")]
    ConfigFile {
        /// Path to the file.
        path: String,

        /// What went wrong.
        problem: String,
    },

    /// The serial port could not be opened.
    #[error("Could not open serial port `{path}`: {source}")]
    SerialOpen {
        /// The tty/COM path.
        path: String,

        /// The driver error.
        #[source]
        source: tokio_serial::Error,
    },

    /// The serial configuration is valid, but the driver can't apply it.
    #[error("The serial port `{path}` can't be opened with {setting}: not supported by the serial driver")]
    Unsupported {
        /// The tty/COM path.
        path: String,

        /// The offending setting.
        setting: String,
    },

    /// The endpoint could not be opened for reasons other than the driver.
    #[error("The endpoint `{0}` is not available")]
    Unavailable(String),

    /// The TCP listener could not be bound.
    #[error("Could not listen on `{address}`: {source}")]
    Listen {
        /// The requested bind address.
        address: String,

        /// The socket error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// If the error is a [`ConfigError`], return it.
    pub fn try_into_bad_config(self) -> Option<ConfigError> {
        if let Self::BadConfig(v) = self {
            Some(v)
        } else {
            None
        }
    }
}
