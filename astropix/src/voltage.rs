/*!
Voltage boards on the carrier.

A board holds a bank of 16-bit DACs loaded through its shift port. Voltages
are converted to codes against the board calibration and shifted last DAC
first, each code MSB first.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bitfield::{write_field, BitOrder, Bits};

/// Highest threshold the front end tolerates
pub const MAX_THRESHOLD_V: f64 = 1.7;

/// Width of one board DAC
pub const DAC_BITS: usize = 16;

/// Carrier slots that can hold a board
pub const SLOTS: std::ops::RangeInclusive<u8> = 1..=8;

/// Default slot of the main bias board
pub const DEFAULT_SLOT: u8 = 4;

/// Errors in a voltage board configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoltageConfigError {
    #[error("slot {0} is not a carrier position (1..=8)")]
    InvalidSlot(u8),

    #[error("threshold {0} V exceeds 1.7 V")]
    ThresholdOutOfRange(f64),

    #[error("DAC {index} voltage {volts} V is outside 0..={max:.3} V")]
    VoltageOutOfRange { index: usize, volts: f64, max: f64 },

    #[error("calibration vcal={vcal} vsupply={vsupply} must be positive")]
    InvalidCalibration { vcal: f64, vsupply: f64 },

    #[error("voltage board has no DACs")]
    NoDacs,
}

/// Board calibration constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub vcal: f64,
    pub vsupply: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { vcal: 0.989, vsupply: 2.7 }
    }
}

impl Calibration {
    /// Highest voltage a DAC can produce
    pub fn full_scale(&self) -> f64 {
        self.vcal * self.vsupply
    }

    /// 16-bit DAC code for `volts`
    pub fn code(&self, index: usize, volts: f64) -> Result<u16, VoltageConfigError> {
        if !(self.vcal > 0.0 && self.vsupply > 0.0) {
            return Err(VoltageConfigError::InvalidCalibration { vcal: self.vcal, vsupply: self.vsupply });
        }
        let code = (volts / self.vcal / self.vsupply * 65535.0).round();
        if !(0.0..=65535.0).contains(&code) {
            return Err(VoltageConfigError::VoltageOutOfRange { index, volts, max: self.full_scale() });
        }
        Ok(code as u16)
    }
}

/// Voltage board settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageBoardConfig {
    pub slot: u8,
    #[serde(default)]
    pub calibration: Calibration,
    /// Replaces the last DAC when set
    #[serde(default)]
    pub vthreshold: Option<f64>,
    pub dacs: Vec<f64>,
}

impl Default for VoltageBoardConfig {
    fn default() -> Self {
        Self {
            slot: DEFAULT_SLOT,
            calibration: Calibration::default(),
            vthreshold: None,
            dacs: vec![0.0, 0.0, 1.1, 1.0, 0.0, 0.0, 1.0, 1.4],
        }
    }
}

impl VoltageBoardConfig {
    /// Threshold given in millivolts, as on the command line
    pub fn with_threshold_mv(mut self, millivolts: f64) -> Self {
        self.vthreshold = Some(millivolts / 1000.0);
        self
    }

    /// DAC voltages with the threshold applied
    pub fn effective_dacs(&self) -> Vec<f64> {
        let mut dacs = self.dacs.clone();
        if let (Some(threshold), Some(last)) = (self.vthreshold, dacs.last_mut()) {
            *last = threshold;
        }
        dacs
    }

    pub fn validate(&self) -> Result<VoltageCodes, VoltageConfigError> {
        if !SLOTS.contains(&self.slot) {
            return Err(VoltageConfigError::InvalidSlot(self.slot));
        }
        if self.dacs.is_empty() {
            return Err(VoltageConfigError::NoDacs);
        }
        if let Some(threshold) = self.vthreshold {
            if threshold > MAX_THRESHOLD_V {
                return Err(VoltageConfigError::ThresholdOutOfRange(threshold));
            }
        }
        let codes = self
            .effective_dacs()
            .iter()
            .enumerate()
            .map(|(i, &v)| self.calibration.code(i, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VoltageCodes { slot: self.slot, codes })
    }
}

/// Validated DAC codes of one board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoltageCodes {
    pub slot: u8,
    pub codes: Vec<u16>,
}

impl VoltageCodes {
    /// Shift-order bits: last DAC first, each code MSB first
    pub fn to_bits(&self) -> Bits {
        let mut bits = Bits::repeat(false, self.codes.len() * DAC_BITS);
        for (i, &code) in self.codes.iter().rev().enumerate() {
            // 16-bit codes always fit their slot
            let _ = write_field(&mut bits, i * DAC_BITS, DAC_BITS, code as u64, BitOrder::MsbFirst);
        }
        debug!("Voltage board slot {} codes {:?}", self.slot, self.codes);
        bits
    }
}
