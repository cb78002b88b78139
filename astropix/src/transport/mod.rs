/*!
Byte-channel boundary to the carrier-board bridge.

The protocol core only needs an opaque duplex byte channel. Implementations:

- [`SimulatedChip`] - in-process bridge and chip emulator
- [`TcpTransport`] - network-attached bridge
- [`ReplayTransport`] - replays a recorded run log
- [`SharedTransport`] - mutex-guarded handle for multi-threaded callers
*/

mod replay;
mod sim;
mod tcp;

pub use replay::{parse_log, ReplayTransport};
pub use sim::{astropix_hit_frames, SimulatedChip};
pub use tcp::TcpTransport;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("timed out after {waited:?} waiting for {expected} bytes, got {received}")]
    Timeout { expected: usize, received: usize, waited: Duration },

    #[error("short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("replay log line {line}: {reason}")]
    Replay { line: usize, reason: String },

    #[error("transport lock poisoned")]
    Poisoned,
}

/// Opaque duplex byte channel
pub trait Transport {
    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max` bytes that are already available; may return none
    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError>;

    /// Bytes that can be read without blocking
    fn available(&mut self) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max)
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        (**self).available()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max)
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        (**self).available()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

/// Cloneable handle; every call takes the lock for its duration.
///
/// The lock is released between calls, so a register read (command write, then
/// response read) through one clone can have its response drained by another.
/// Run request/response round trips on the guard returned by
/// [`SharedTransport::lock`]; the per-call impl is only safe for writes.
#[derive(Debug)]
pub struct SharedTransport<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SharedTransport<T> {
    pub fn new(link: T) -> Self {
        Self { inner: Arc::new(Mutex::new(link)) }
    }

    /// Exclusive access across several operations
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, TransportError> {
        self.inner.lock().map_err(|_| TransportError::Poisoned)
    }
}

impl<T> Clone for SharedTransport<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Transport> Transport for SharedTransport<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.lock()?.write(data)
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        self.lock()?.read(max)
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        self.lock()?.available()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.lock()?.close()
    }
}
