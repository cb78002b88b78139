//! Replays a recorded run log as if it came from the bridge.

use regex::Regex;
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

use super::{Transport, TransportError};

/// `<index> <hex>`, also accepting the `b'<hex>'` form of older logs
const READOUT_LINE: &str = r"^\s*(\d+)\s+(?:b')?([0-9a-fA-F]*)'?\s*$";

/// Parse every readout line of a run log. Header lines are skipped.
pub fn parse_log(text: &str) -> Result<Vec<(u64, Vec<u8>)>, TransportError> {
    let re = Regex::new(READOUT_LINE).map_err(|e| TransportError::Replay { line: 0, reason: e.to_string() })?;

    let mut readouts = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let index = caps[1]
            .parse::<u64>()
            .map_err(|e| TransportError::Replay { line: n + 1, reason: e.to_string() })?;
        let bytes = hex::decode(&caps[2]).map_err(|e| TransportError::Replay { line: n + 1, reason: e.to_string() })?;
        readouts.push((index, bytes));
    }
    Ok(readouts)
}

/// Serves one recorded readout per `available`/`read` cycle. Writes are ignored.
#[derive(Debug, Clone, Default)]
pub struct ReplayTransport {
    pending: VecDeque<(u64, Vec<u8>)>,
    /// Logged index of the readout in `current`
    index: Option<u64>,
    current: VecDeque<u8>,
    at_boundary: bool,
    closed: bool,
}

impl ReplayTransport {
    pub fn new(readouts: Vec<(u64, Vec<u8>)>) -> Self {
        Self { pending: readouts.into(), ..Self::default() }
    }

    pub fn parse(text: &str) -> Result<Self, TransportError> {
        Ok(Self::new(parse_log(text)?))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let replay = Self::parse(&text)?;
        debug!("Replaying {} readouts from {}", replay.remaining(), path.as_ref().display());
        Ok(replay)
    }

    /// Readouts not yet served
    pub fn remaining(&self) -> usize {
        self.pending.len() + usize::from(!self.current.is_empty())
    }

    /// Logged index of the readout being served
    pub fn index(&self) -> Option<u64> {
        self.index
    }

    /// Take the rest of the current readout, or the next one, with its logged index
    pub fn next_readout(&mut self) -> Option<(u64, Vec<u8>)> {
        self.at_boundary = false;
        if let (false, Some(index)) = (self.current.is_empty(), self.index) {
            return Some((index, self.current.drain(..).collect()));
        }
        let (index, bytes) = self.pending.pop_front()?;
        self.index = Some(index);
        Some((index, bytes))
    }

    fn advance(&mut self) {
        if self.current.is_empty() {
            if let Some((index, bytes)) = self.pending.pop_front() {
                self.index = Some(index);
                self.current = bytes.into();
            }
        }
    }
}

impl Transport for ReplayTransport {
    fn write(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.advance();
        let n = max.min(self.current.len());
        let out: Vec<u8> = self.current.drain(..n).collect();
        if n > 0 && self.current.is_empty() {
            self.at_boundary = true;
        }
        Ok(out)
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.at_boundary {
            self.at_boundary = false;
            return Ok(0);
        }
        self.advance();
        Ok(self.current.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
