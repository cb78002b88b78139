/*!
Register protocol of the carrier-board bridge.

Every transaction is a command frame `[cmd, address, len_hi, len_lo, payload..]`.
Writes to the shift-register ports (`ASIC_SR`, `VB_SR(slot)`) and to `SPI_MOSI`
stream the payload into that port; writes to any other address fill
consecutive registers starting at `address`. A read returns exactly `len`
bytes.

Shift registers are driven bit by bit through their pin bytes. A failed write
is reported and never retried here: repeating a half-shifted load could latch
a torn configuration into the chip.
*/

use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use crate::bitfield::BitsRef;
use crate::config::ConfigBitstream;
use crate::transport::{Transport, TransportError};

/// Command byte for writes
pub const CMD_WRITE: u8 = 0x00;

/// Command byte for reads
pub const CMD_READ: u8 = 0x80;

/// Length of the command header
pub const HEADER_LEN: usize = 4;

/// Largest payload a single command frame carries
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Value written to the scratch register by the I/O test
pub const TEST_PATTERN: u8 = 0x55;

/// Register map
pub mod registers {
    /// ASIC configuration shift-register port
    pub const ASIC_SR: u8 = 0x00;
    /// Scratch register
    pub const TEST: u8 = 0x09;
    /// First injection timing register
    pub const INJ_BASE: u8 = 0x10;
    /// Injection enable
    pub const INJ_CONTROL: u8 = 0x18;
    /// First voltage-board shift port; slot `n` is at `VB_SR_BASE + n`
    pub const VB_SR_BASE: u8 = 0x20;
    pub const SPI_CONFIG: u8 = 0x30;
    /// SPI clock divider (100 MHz / div)
    pub const SPI_CLKDIV: u8 = 0x31;
    pub const SPI_ROUTING: u8 = 0x32;
    /// Writing n bytes clocks n readout bytes out of the chip
    pub const SPI_MOSI: u8 = 0x33;
    pub const CHIP_CONTROL: u8 = 0x40;
    /// Reads 0 while the chip has hits pending
    pub const INTERRUPT: u8 = 0x46;

    /// Shift port of the voltage board in `slot`
    pub fn vb_sr(slot: u8) -> u8 {
        VB_SR_BASE + slot
    }

    /// Addresses that stream their payload into a port
    pub fn is_port(address: u8) -> bool {
        address == ASIC_SR || address == SPI_MOSI || (VB_SR_BASE + 1..=VB_SR_BASE + 8).contains(&address)
    }
}

/// ASIC shift-register pins
pub mod asic_pins {
    pub const SIN: u8 = 0x01;
    pub const CK1: u8 = 0x02;
    pub const CK2: u8 = 0x04;
    pub const LD: u8 = 0x08;
    pub const RB: u8 = 0x10;
}

/// Voltage-board shift-register pins
pub mod vb_pins {
    pub const SIN: u8 = 0x01;
    pub const CK: u8 = 0x02;
    pub const LD: u8 = 0x04;
}

/// `SPI_CONFIG` bits
pub const SPI_ENABLE: u8 = 0x01;
pub const SPI_RESET: u8 = 0x02;

/// Routing command that connects the chip's SPI lines to the readout
pub const ROUTING_COMMAND: u8 = 0x02;

/// Default SPI clock divider used for readout
pub const DEFAULT_SPI_CLKDIV: u8 = 255;

/// Build one command frame
pub fn command_frame(cmd: u8, address: u8, len: usize, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(cmd);
    frame.push(address);
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Pin pattern shifting `bits` into the ASIC, one bit per `SIN, CK1, SIN, CK2` cycle
pub fn asic_shift_pattern(bits: &BitsRef, clkdiv: usize, readback: bool) -> Vec<u8> {
    use asic_pins::*;
    let rb = if readback { RB } else { 0 };
    let mut pattern = Vec::with_capacity(bits.len() * 4 * clkdiv);
    for bit in bits.iter().by_vals() {
        let sin = (if bit { SIN } else { 0 }) | rb;
        for pins in [sin, sin | CK1, sin, sin | CK2] {
            pattern.extend(std::iter::repeat(pins).take(clkdiv));
        }
    }
    pattern
}

/// Pin pattern shifting `bits` into a voltage board
pub fn vb_shift_pattern(bits: &BitsRef, clkdiv: usize) -> Vec<u8> {
    use vb_pins::*;
    let mut pattern = Vec::with_capacity(bits.len() * 2 * clkdiv);
    for bit in bits.iter().by_vals() {
        let sin = if bit { SIN } else { 0 };
        for pins in [sin, sin | CK] {
            pattern.extend(std::iter::repeat(pins).take(clkdiv));
        }
    }
    pattern
}

/// Blocking register access over a [`Transport`]
#[derive(Debug)]
pub struct RegisterProtocol<T: Transport> {
    link: T,
    sr_clkdiv: usize,
    read_timeout: Duration,
    poll_interval: Duration,
}

impl<T: Transport> RegisterProtocol<T> {
    pub fn new(link: T) -> Self {
        Self {
            link,
            sr_clkdiv: 16,
            read_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Repetitions of every shift-register pin state
    pub fn with_sr_clkdiv(mut self, clkdiv: usize) -> Self {
        self.sr_clkdiv = clkdiv.max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn sr_clkdiv(&self) -> usize {
        self.sr_clkdiv
    }

    pub fn link(&self) -> &T {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut T {
        &mut self.link
    }

    pub fn into_inner(self) -> T {
        self.link
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        trace!("-> {}", hex::encode(frame));
        self.link.write(frame).map_err(|e| {
            error!("Transport write failed: {}", e);
            e
        })
    }

    pub fn write_register(&mut self, address: u8, value: u8) -> Result<(), TransportError> {
        self.write_registers(address, &[value])
    }

    /// Burst write starting at `address`, or a stream into a port
    pub fn write_registers(&mut self, address: u8, payload: &[u8]) -> Result<(), TransportError> {
        for chunk in payload.chunks(MAX_PAYLOAD) {
            self.send(&command_frame(CMD_WRITE, address, chunk.len(), chunk))?;
        }
        Ok(())
    }

    pub fn read_register(&mut self, address: u8) -> Result<u8, TransportError> {
        let bytes = self.read_registers(address, 1)?;
        Ok(bytes[0])
    }

    /// Request `len` bytes and wait for all of them
    pub fn read_registers(&mut self, address: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        self.send(&command_frame(CMD_READ, address, len, &[]))?;

        let started = Instant::now();
        let mut buf = Vec::with_capacity(len);
        while buf.len() < len {
            let chunk = self.link.read(len - buf.len())?;
            if chunk.is_empty() {
                let waited = started.elapsed();
                if waited >= self.read_timeout {
                    return Err(TransportError::Timeout { expected: len, received: buf.len(), waited });
                }
                thread::sleep(self.poll_interval);
            } else {
                buf.extend_from_slice(&chunk);
            }
        }
        trace!("<- {:#04x}: {}", address, hex::encode(&buf));
        Ok(buf)
    }

    /// Shift a configuration into the ASIC and latch it
    pub fn load_config(&mut self, stream: &ConfigBitstream) -> Result<(), TransportError> {
        let wire = stream.to_wire();
        let pattern = asic_shift_pattern(&wire, self.sr_clkdiv, false);
        debug!("Loading {} configuration bits ({} pattern bytes)", wire.len(), pattern.len());
        self.write_registers(registers::ASIC_SR, &pattern)?;
        self.write_register(registers::ASIC_SR, asic_pins::LD)?;
        self.write_register(registers::ASIC_SR, 0)
    }

    /// Shift a configuration with readback held; nothing is latched
    pub fn readback_config(&mut self, stream: &ConfigBitstream) -> Result<(), TransportError> {
        let pattern = asic_shift_pattern(&stream.to_wire(), self.sr_clkdiv, true);
        self.write_registers(registers::ASIC_SR, &pattern)?;
        self.write_register(registers::ASIC_SR, 0)
    }

    /// Shift `bits` into the voltage board in `slot` and latch them
    pub fn load_voltage_board(&mut self, slot: u8, bits: &BitsRef) -> Result<(), TransportError> {
        let port = registers::vb_sr(slot);
        debug!("Loading {} bits into voltage board slot {}", bits.len(), slot);
        self.write_registers(port, &vb_shift_pattern(bits, self.sr_clkdiv))?;
        self.write_register(port, vb_pins::LD)?;
        self.write_register(port, 0)
    }

    pub fn chip_reset(&mut self) -> Result<(), TransportError> {
        debug!("Resetting chip");
        self.write_register(registers::CHIP_CONTROL, 1)?;
        self.write_register(registers::CHIP_CONTROL, 0)
    }

    pub fn spi_enable(&mut self, enable: bool) -> Result<(), TransportError> {
        self.write_register(registers::SPI_CONFIG, if enable { SPI_ENABLE } else { 0 })
    }

    /// Pulse the SPI reset bit, keeping the enable bit
    pub fn spi_reset(&mut self) -> Result<(), TransportError> {
        let config = self.read_register(registers::SPI_CONFIG)? & SPI_ENABLE;
        self.write_register(registers::SPI_CONFIG, config | SPI_RESET)?;
        self.write_register(registers::SPI_CONFIG, config)
    }

    pub fn spi_clkdiv(&mut self, div: u8) -> Result<(), TransportError> {
        self.write_register(registers::SPI_CLKDIV, div)
    }

    pub fn send_routing_cmd(&mut self) -> Result<(), TransportError> {
        self.write_register(registers::SPI_ROUTING, ROUTING_COMMAND)
    }

    /// Clock `n` readout bytes out of the chip into the bridge buffer
    pub fn clock_out(&mut self, n: usize) -> Result<(), TransportError> {
        self.write_registers(registers::SPI_MOSI, &vec![0u8; n])
    }

    /// True while the chip signals pending hits
    pub fn interrupt_pending(&mut self) -> Result<bool, TransportError> {
        Ok(self.read_register(registers::INTERRUPT)? == 0)
    }

    /// Write [`TEST_PATTERN`] to the scratch register and return what reads back
    pub fn test_io(&mut self) -> Result<u8, TransportError> {
        self.write_register(registers::TEST, TEST_PATTERN)?;
        let value = self.read_register(registers::TEST)?;
        debug!("I/O test read back {:#04x}", value);
        Ok(value)
    }

    /// Take every byte currently buffered on the link
    pub fn drain(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        loop {
            let pending = self.link.available()?;
            if pending == 0 {
                break;
            }
            let chunk = self.link.read(pending)?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        self.link.close()
    }
}
