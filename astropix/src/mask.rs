/*!
Pixel mask handling.

The matrix is configured through one register per column. From most to least
significant bit a register holds `ampout`, `inj_col`, one disable bit per row
(row `rows-1` first) and `inj_row`. A set row bit disables the pixel.

Injection rows are addressed through the register of the same index: the
`inj_row` bit of column register `r` selects row `r` for injection.
*/

use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bitfield::{pack_grid, write_field, BitFieldError, BitOrder, Bits, BitsRef};
use crate::layout::{ConfigLayout, Geometry};

/// A textual digital mask does not match the pixel matrix
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskShapeError {
    #[error("mask has {found} rows, expected {expected}")]
    RowCount { expected: usize, found: usize },

    #[error("mask row {row} has {found} cells, expected {expected}")]
    RowLength { row: usize, expected: usize, found: usize },

    #[error("mask row {row} column {col}: invalid cell '{found}', expected '0' or '1'")]
    InvalidCell { row: usize, col: usize, found: char },
}

/// Boolean pixel grid parsed from the newline-separated text form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitalMask {
    geometry: Geometry,
    rows: Vec<Vec<bool>>,
}

impl DigitalMask {
    /// Parse a mask; line `i` configures column register `i`
    pub fn parse(text: &str, geometry: Geometry) -> Result<Self, MaskShapeError> {
        let lines: Vec<&str> = text.trim_end().lines().map(str::trim_end).collect();
        if lines.len() != geometry.cols {
            return Err(MaskShapeError::RowCount { expected: geometry.cols, found: lines.len() });
        }

        let mut rows = Vec::with_capacity(lines.len());
        for (row, line) in lines.iter().enumerate() {
            let found = line.chars().count();
            if found != geometry.rows {
                return Err(MaskShapeError::RowLength { row, expected: geometry.rows, found });
            }
            let cells = line
                .chars()
                .enumerate()
                .map(|(col, c)| match c {
                    '0' => Ok(false),
                    '1' => Ok(true),
                    found => Err(MaskShapeError::InvalidCell { row, col, found }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(cells);
        }

        Ok(Self { geometry, rows })
    }

    /// Build a mask from a boolean grid
    pub fn from_rows(rows: Vec<Vec<bool>>, geometry: Geometry) -> Result<Self, MaskShapeError> {
        if rows.len() != geometry.cols {
            return Err(MaskShapeError::RowCount { expected: geometry.cols, found: rows.len() });
        }
        if let Some((row, cells)) = rows.iter().enumerate().find(|(_, r)| r.len() != geometry.rows) {
            return Err(MaskShapeError::RowLength { row, expected: geometry.rows, found: cells.len() });
        }
        Ok(Self { geometry, rows })
    }

    /// Load a mask text file
    pub fn load_from_file<P: AsRef<Path>>(path: P, geometry: Geometry) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mask = Self::parse(&text, geometry)?;
        debug!("Loaded digital mask from {}", path.as_ref().display());
        Ok(mask)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn rows(&self) -> &[Vec<bool>] {
        &self.rows
    }

    /// Cell `col` of text line `line`
    pub fn get(&self, line: usize, col: usize) -> Option<bool> {
        self.rows.get(line).and_then(|r| r.get(col)).copied()
    }

    /// Row-major bit form of the grid
    pub fn to_bits(&self) -> Bits {
        pack_grid(&self.rows)
    }

    /// Text form, one line per register
    pub fn to_text(&self) -> String {
        self.rows
            .iter()
            .map(|r| r.iter().map(|&b| if b { '1' } else { '0' }).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Per-column mask registers of the pixel matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelConfig {
    geometry: Geometry,
    registers: Vec<u64>,
}

impl PixelConfig {
    /// All pixels disabled, no injection, no amplifier output
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            registers: vec![Self::disabled_register(geometry); geometry.cols],
        }
    }

    /// Analog mode: column 0 routed to the amplifier output with row 0 enabled
    pub fn analog(geometry: Geometry, inject: bool) -> Self {
        let mut config = Self::new(geometry);
        config.enable_ampout_col(0);
        config.enable_inj_col(0);
        config.enable_pixel(0, 0);
        if inject {
            config.enable_inj_row(0);
        }
        config
    }

    /// Registers taken directly from a digital mask
    pub fn from_mask(mask: &DigitalMask, inject: bool) -> Self {
        let geometry = mask.geometry();
        let registers = mask
            .rows()
            .iter()
            .map(|line| {
                let rows = line.iter().fold(0u64, |acc, &b| (acc << 1) | b as u64);
                (rows << 1) | inject as u64
            })
            .collect();
        Self { geometry, registers }
    }

    fn disabled_register(geometry: Geometry) -> u64 {
        ((1u64 << geometry.rows) - 1) << 1
    }

    fn ampout_bit(&self) -> u64 {
        1 << (self.geometry.rows + 2)
    }

    fn inj_col_bit(&self) -> u64 {
        1 << (self.geometry.rows + 1)
    }

    fn in_range(&self, col: usize, row: usize) -> bool {
        col < self.geometry.cols && row < self.geometry.rows
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn registers(&self) -> &[u64] {
        &self.registers
    }

    pub fn register(&self, col: usize) -> Option<u64> {
        self.registers.get(col).copied()
    }

    pub fn enable_pixel(&mut self, col: usize, row: usize) {
        if !self.in_range(col, row) {
            warn!("Pixel col={} row={} outside {}x{} matrix, ignored", col, row, self.geometry.cols, self.geometry.rows);
            return;
        }
        self.registers[col] &= !(2u64 << row);
    }

    pub fn disable_pixel(&mut self, col: usize, row: usize) {
        if !self.in_range(col, row) {
            warn!("Pixel col={} row={} outside {}x{} matrix, ignored", col, row, self.geometry.cols, self.geometry.rows);
            return;
        }
        self.registers[col] |= 2u64 << row;
    }

    pub fn enable_inj_row(&mut self, row: usize) {
        match self.registers.get_mut(row) {
            Some(reg) => *reg |= 1,
            None => warn!("Injection row {} out of range, ignored", row),
        }
    }

    pub fn disable_inj_row(&mut self, row: usize) {
        match self.registers.get_mut(row) {
            Some(reg) => *reg &= !1,
            None => warn!("Injection row {} out of range, ignored", row),
        }
    }

    pub fn enable_inj_col(&mut self, col: usize) {
        let bit = self.inj_col_bit();
        match self.registers.get_mut(col) {
            Some(reg) => *reg |= bit,
            None => warn!("Injection column {} out of range, ignored", col),
        }
    }

    pub fn disable_inj_col(&mut self, col: usize) {
        let bit = self.inj_col_bit();
        match self.registers.get_mut(col) {
            Some(reg) => *reg &= !bit,
            None => warn!("Injection column {} out of range, ignored", col),
        }
    }

    /// Route `col` to the amplifier output. Only one column can drive it.
    pub fn enable_ampout_col(&mut self, col: usize) {
        if col >= self.geometry.cols {
            warn!("Amplifier column {} out of range, ignored", col);
            return;
        }
        let bit = self.ampout_bit();
        for reg in &mut self.registers {
            *reg &= !bit;
        }
        self.registers[col] |= bit;
    }

    /// `Some(true)` if the pixel is enabled, `None` outside the matrix
    pub fn get_pixel(&self, col: usize, row: usize) -> Option<bool> {
        if !self.in_range(col, row) {
            return None;
        }
        Some((self.registers[col] >> (row + 1)) & 1 == 0)
    }

    /// Disable every pixel and clear injection and amplifier routing
    pub fn reset(&mut self) {
        let value = Self::disabled_register(self.geometry);
        self.registers.iter_mut().for_each(|reg| *reg = value);
    }

    /// Write all column registers into the mask region of `bits`
    pub fn write_into(&self, bits: &mut BitsRef, layout: &ConfigLayout) -> Result<(), BitFieldError> {
        let width = layout.geometry().mask_register_width();
        for (col, &reg) in self.registers.iter().enumerate() {
            let range = layout.mask_register_range(col);
            write_field(bits, range.start, width, reg, BitOrder::MsbFirst)?;
        }
        Ok(())
    }
}
