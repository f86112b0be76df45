//! Errors raised by the hardware-facing side of the daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Serial port could not be opened or configured.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Stream or directory I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial device reported end-of-stream (unplugged, closed).
    #[error("serial stream closed")]
    StreamClosed,

    /// A device attribute could not be read after retrying.
    #[error("failed to read {}: {source}", path.display())]
    Attribute {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A device attribute held something other than a number.
    #[error("unparsable value {raw:?} in {}", path.display())]
    Parse { path: PathBuf, raw: String },

    /// A voltage attribute the humidity formula cannot use (zero or non-finite).
    #[error("implausible value {value} in {}", path.display())]
    Implausible { path: PathBuf, value: f64 },

    /// GPIO setup, read or write failure. Only the rppal backend raises it.
    #[cfg_attr(not(feature = "gpio"), allow(dead_code))]
    #[error("GPIO error: {0}")]
    Gpio(String),
}

#[cfg(feature = "gpio")]
impl From<rppal::gpio::Error> for Error {
    fn from(e: rppal::gpio::Error) -> Self {
        Error::Gpio(e.to_string())
    }
}
