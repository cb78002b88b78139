//! In-process emulator of the bridge and an attached AstroPix chip.

use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use super::{Transport, TransportError};
use crate::bitfield::{reverse_bits, Bits, BitsRef};
use crate::protocol::{asic_pins, registers, vb_pins, CMD_READ, CMD_WRITE, HEADER_LEN, SPI_ENABLE};

/// Wire form of the AstroPix idle byte
const WIRE_IDLE: u8 = 0xBC;

/// Wire bytes of one AstroPix hit: a row frame followed by a column frame
pub fn astropix_hit_frames(col: u8, row: u8, timestamp: u8, tot: u16) -> Vec<u8> {
    let frame = |is_col: bool, location: u8| {
        [
            4u8,
            ((is_col as u8) << 7) | (location & 0x3F),
            timestamp,
            ((tot >> 8) & 0x0F) as u8,
            tot as u8,
        ]
    };
    let mut logical = frame(false, row).to_vec();
    logical.extend(frame(true, col));
    reverse_bits(&logical)
}

/// Reconstructs shifted bits from the pin pattern
#[derive(Debug, Clone, Default)]
struct ShiftCapture {
    pins: u8,
    sampled: bool,
    shifted: Bits,
    latched: Option<Bits>,
    loads: usize,
}

impl ShiftCapture {
    fn rising(&self, pins: u8, mask: u8) -> bool {
        pins & mask != 0 && self.pins & mask == 0
    }

    fn clock_asic(&mut self, pins: u8) {
        use asic_pins::*;
        if self.rising(pins, CK1) {
            self.sampled = pins & SIN != 0;
        }
        if self.rising(pins, CK2) && pins & RB == 0 {
            self.shifted.push(self.sampled);
        }
        if self.rising(pins, LD) && pins & RB == 0 {
            self.latch();
        }
        self.pins = pins;
    }

    fn clock_vb(&mut self, pins: u8) {
        use vb_pins::*;
        if self.rising(pins, CK) {
            self.shifted.push(pins & SIN != 0);
        }
        if self.rising(pins, LD) {
            self.latch();
        }
        self.pins = pins;
    }

    fn latch(&mut self) {
        self.latched = Some(std::mem::take(&mut self.shifted));
        self.loads += 1;
    }
}

/// Emulated bridge: register file, shift-register capture and readout FIFO
#[derive(Debug, Clone)]
pub struct SimulatedChip {
    registers: [u8; 256],
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    readout: VecDeque<u8>,
    asic: ShiftCapture,
    boards: BTreeMap<u8, ShiftCapture>,
    injection_frames: Vec<u8>,
    idle_byte: u8,
    writes: usize,
    closed: bool,
    unresponsive: bool,
}

impl SimulatedChip {
    pub fn new() -> Self {
        Self {
            registers: [0; 256],
            tx: Vec::new(),
            rx: VecDeque::new(),
            readout: VecDeque::new(),
            asic: ShiftCapture::default(),
            boards: BTreeMap::new(),
            injection_frames: astropix_hit_frames(0, 0, 0, 100),
            idle_byte: WIRE_IDLE,
            writes: 0,
            closed: false,
            unresponsive: false,
        }
    }

    /// Frames queued each time readout is clocked while injection runs
    pub fn with_injection_frames(mut self, frames: Vec<u8>) -> Self {
        self.injection_frames = frames;
        self
    }

    /// Filler clocked out when the chip has nothing to send
    pub fn with_idle_byte(mut self, idle: u8) -> Self {
        self.idle_byte = idle;
        self
    }

    /// Queue chip-side readout bytes
    pub fn push_readout(&mut self, bytes: &[u8]) {
        self.readout.extend(bytes);
    }

    /// Stop answering reads
    pub fn set_unresponsive(&mut self, unresponsive: bool) {
        self.unresponsive = unresponsive;
    }

    pub fn register(&self, address: u8) -> u8 {
        self.registers[address as usize]
    }

    /// Last latched ASIC configuration, in wire order
    pub fn latched_config(&self) -> Option<&BitsRef> {
        self.asic.latched.as_deref()
    }

    /// Number of latch pulses seen by the ASIC shift register
    pub fn config_loads(&self) -> usize {
        self.asic.loads
    }

    /// Last latched voltage-board bits for `slot`
    pub fn latched_voltage_board(&self, slot: u8) -> Option<&BitsRef> {
        self.boards.get(&slot).and_then(|b| b.latched.as_deref())
    }

    /// Transport writes accepted so far
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn injecting(&self) -> bool {
        self.registers[registers::INJ_CONTROL as usize] & 1 != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn process(&mut self) {
        while self.tx.len() >= HEADER_LEN {
            let cmd = self.tx[0];
            let address = self.tx[1];
            let len = u16::from_be_bytes([self.tx[2], self.tx[3]]) as usize;
            match cmd {
                CMD_WRITE => {
                    if self.tx.len() < HEADER_LEN + len {
                        break;
                    }
                    let payload: Vec<u8> = self.tx.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
                    self.handle_write(address, &payload);
                }
                CMD_READ => {
                    self.tx.drain(..HEADER_LEN);
                    self.handle_read(address, len);
                }
                other => {
                    warn!("Simulated bridge dropped unknown command byte {:#04x}", other);
                    self.tx.remove(0);
                }
            }
        }
    }

    fn handle_write(&mut self, address: u8, payload: &[u8]) {
        match address {
            registers::ASIC_SR => {
                let before = self.asic.loads;
                for &pins in payload {
                    self.asic.clock_asic(pins);
                }
                if self.asic.loads > before {
                    debug!("Simulated chip latched {} configuration bits", self.latched_config().map_or(0, |b| b.len()));
                }
            }
            registers::SPI_MOSI => self.clock_readout(payload.len()),
            a if registers::is_port(a) => {
                let board = self.boards.entry(a - registers::VB_SR_BASE).or_default();
                for &pins in payload {
                    board.clock_vb(pins);
                }
            }
            _ => {
                for (i, &value) in payload.iter().enumerate() {
                    if let Some(slot) = self.registers.get_mut(address as usize + i) {
                        *slot = value;
                    }
                }
                if address == registers::CHIP_CONTROL && payload.first().is_some_and(|v| v & 1 != 0) {
                    self.readout.clear();
                }
                return;
            }
        }
        if let Some(&last) = payload.last() {
            self.registers[address as usize] = last;
        }
    }

    fn handle_read(&mut self, address: u8, len: usize) {
        if self.unresponsive {
            return;
        }
        for i in 0..len {
            let a = address as usize + i;
            let value = if a == registers::INTERRUPT as usize {
                (self.readout.is_empty() && !self.injecting()) as u8
            } else {
                self.registers.get(a).copied().unwrap_or(0)
            };
            self.rx.push_back(value);
        }
    }

    fn clock_readout(&mut self, n: usize) {
        if self.registers[registers::SPI_CONFIG as usize] & SPI_ENABLE == 0 {
            return;
        }
        if self.injecting() {
            self.readout.extend(&self.injection_frames);
        }
        for _ in 0..n {
            let byte = self.readout.pop_front().unwrap_or(self.idle_byte);
            self.rx.push_back(byte);
        }
    }
}

impl Default for SimulatedChip {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedChip {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writes += 1;
        self.tx.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let n = max.min(self.rx.len());
        Ok(self.rx.drain(..n).collect())
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.rx.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
