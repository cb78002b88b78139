/*!
Crate-level error type aggregating the errors of every component.
*/

use thiserror::Error;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bit field error: {0}")]
    BitField(#[from] crate::bitfield::BitFieldError),

    #[error("layout error: {0}")]
    Layout(#[from] crate::layout::LayoutError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("mask error: {0}")]
    MaskShape(#[from] crate::mask::MaskShapeError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("decode error: {0}")]
    Decode(#[from] crate::readout::DecodeError),

    #[error("injection error: {0}")]
    Injection(#[from] crate::injection::InjectionConfigError),

    #[error("voltage board error: {0}")]
    Voltage(#[from] crate::voltage::VoltageConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation needs a setup step that has not run
    #[error("session not ready: {0}")]
    NotReady(String),

    /// The scratch-register test read back the wrong value
    #[error("I/O test failed: wrote {wrote:#04x}, read back {read:#04x}")]
    TestIo { wrote: u8, read: u8 },
}

impl Error {
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }
}
