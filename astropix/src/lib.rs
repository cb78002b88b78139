/*!
# AstroPix Host Library

Host-side control and readout for AstroPix monolithic pixel-detector ASICs on
their carrier board.

## Core Types

- [`ConfigLayout`] - Named parameter table of the ASIC configuration shift register
- [`AsicConfig`] - Settings overlay and pixel registers, encoded to a [`ConfigBitstream`]
- [`ReadoutDecoder`] - Stateful readout-stream decoder producing [`HitRecord`]s
- [`Session`] - Typed setup sequence and readout loop over a [`Transport`]

## Modules

- [`bitfield`] - Fixed-width bit field packing
- [`layout`] - Configuration layout tables
- [`mask`] - Digital masks and per-column pixel registers
- [`config`] - Settings overlays and the configuration encoder
- [`hit`] - Decoded hit records
- [`readout`] - Frame layouts and the readout decoder
- [`protocol`] - Bridge register protocol
- [`transport`] - Byte links: TCP, log replay and an in-process simulator
- [`voltage`] - Voltage board DAC codes
- [`injection`] - Injection pulse generator
- [`budget`] - Decode error budget
- [`session`] - Chip session
- [`error`] - Crate error type
*/

pub mod bitfield;
pub mod budget;
pub mod config;
pub mod error;
pub mod hit;
pub mod injection;
pub mod layout;
pub mod mask;
pub mod protocol;
pub mod readout;
pub mod session;
pub mod transport;
pub mod voltage;

// Re-export commonly used types
pub use budget::ErrorBudget;
pub use config::{
    AsicConfig, AsicSettings, BiasSettings, ConfigBitstream, ConfigEncoder, ConfigError, DacSettings, DigitalSettings,
};
pub use error::{Error, Result};
pub use hit::{HitField, HitObserver, HitRecord, LogObserver, PixelAddress, DEFAULT_SAMPLE_CLOCK_NS};
pub use injection::{InjectionConfig, InjectionController, InjectionState};
pub use layout::{ConfigLayout, Geometry, LayoutError, LayoutSpec, ParameterSpec, SectionKind};
pub use mask::{DigitalMask, PixelConfig};
pub use protocol::RegisterProtocol;
pub use readout::{decode_stream, DecodeError, DecoderStats, FrameLayout, FrameResult, ReadoutDecoder};
pub use session::{ReadoutEvent, RunOptions, RunSummary, Session, SessionOptions, StopReason};
pub use transport::{ReplayTransport, SimulatedChip, TcpTransport, Transport, TransportError};
pub use voltage::{Calibration, VoltageBoardConfig};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
