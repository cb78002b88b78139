/*!
Configuration layout tables.

A chip revision is described by a [`LayoutSpec`]: the ordered digital, bias and
DAC parameters (name, width, default code) followed by one pixel-mask register
per column. [`ConfigLayout`] resolves the spec into fixed `(offset, width)`
slots inside the configuration bitstream. Tables are plain data so that new
chip revisions can be loaded from TOML without code changes.
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::bitfield::{fits, MAX_FIELD_WIDTH};
use crate::hit::HitField;

/// Parameter sections, in shift-register order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Digital,
    Bias,
    Dac,
}

impl SectionKind {
    pub const ALL: [SectionKind; 3] = [SectionKind::Digital, SectionKind::Bias, SectionKind::Dac];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Digital => "digital",
            Self::Bias => "bias",
            Self::Dac => "dac",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel matrix dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: usize,
    pub rows: usize,
}

impl Geometry {
    /// AstroPix 2 matrix
    pub const ASTROPIX2: Geometry = Geometry { cols: 35, rows: 35 };

    /// Width of one column register: ampout, inj_col, one bit per row, inj_row
    pub fn mask_register_width(&self) -> usize {
        self.rows + 3
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::ASTROPIX2
    }
}

/// One named parameter in a layout spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub width: usize,
    #[serde(default)]
    pub default: u64,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, width: usize, default: u64) -> Self {
        Self { name: name.into(), width, default }
    }
}

/// Serializable description of a chip revision's configuration register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSpec {
    pub name: String,

    /// Shift the logical vector MSB first. AstroPix shifts LSB first.
    #[serde(default)]
    pub shift_msb_first: bool,

    pub geometry: Geometry,

    #[serde(default)]
    pub digital: Vec<ParameterSpec>,

    #[serde(default)]
    pub bias: Vec<ParameterSpec>,

    #[serde(default)]
    pub dac: Vec<ParameterSpec>,
}

impl LayoutSpec {
    fn section(&self, kind: SectionKind) -> &[ParameterSpec] {
        match kind {
            SectionKind::Digital => &self.digital,
            SectionKind::Bias => &self.bias,
            SectionKind::Dac => &self.dac,
        }
    }

    /// AstroPix 2 table
    pub fn astropix2() -> Self {
        let mut digital = vec![ParameterSpec::new("interrupt_pushpull", 1, 1)];
        digital.extend((1..=18).map(|i| ParameterSpec::new(format!("En_Inj{i}"), 1, 0)));
        digital.push(ParameterSpec::new("ResetB", 1, 0));
        digital.extend((0..=14).map(|i| ParameterSpec::new(format!("Extrabit{i}"), 1, u64::from(i < 8))));

        let bias = [("DisHiDR", 0), ("q01", 0), ("qon0", 0), ("qon1", 1), ("qon2", 0), ("qon3", 1)]
            .into_iter()
            .map(|(name, default)| ParameterSpec::new(name, 1, default))
            .collect();

        let dac = [
            ("blres", 0),
            ("nu1", 0),
            ("vn1", 20),
            ("vnfb", 1),
            ("vnfoll", 10),
            ("nu5", 0),
            ("nu6", 0),
            ("nu7", 0),
            ("nu8", 0),
            ("vn2", 0),
            ("vnfoll2", 1),
            ("vnbias", 0),
            ("vpload", 5),
            ("nu13", 0),
            ("vncomp", 2),
            ("vpfoll", 60),
            ("nu16", 0),
            ("vprec", 30),
            ("vnrec", 30),
        ]
        .into_iter()
        .map(|(name, default)| ParameterSpec::new(name, 6, default))
        .collect();

        Self {
            name: "astropix2".to_string(),
            shift_msb_first: false,
            geometry: Geometry::ASTROPIX2,
            digital,
            bias,
            dac,
        }
    }
}

/// Errors in a layout table
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("{section} parameter '{name}' has width {width}, expected 1..=64")]
    InvalidWidth { section: SectionKind, name: String, width: usize },

    #[error("{section} parameter '{name}' default {default} does not fit in {width} bits")]
    DefaultOutOfRange { section: SectionKind, name: String, default: u64, width: usize },

    #[error("duplicate {section} parameter '{name}'")]
    DuplicateName { section: SectionKind, name: String },

    #[error("geometry {cols}x{rows} is empty or too large for a column register")]
    InvalidGeometry { cols: usize, rows: usize },

    #[error("unknown frame layout '{0}'")]
    UnknownFrameLayout(String),

    #[error("frame layout '{0}' is too short for its sync strategy")]
    EmptyFrame(String),

    #[error("frame field {field} at bit {offset} width {width} does not fit a {frame_bits}-bit frame")]
    FrameFieldOutOfBounds { field: HitField, offset: usize, width: usize, frame_bits: usize },

    #[error("frame field {field} is {width} bits wide, at most {max} fit a hit record")]
    FrameFieldTooWide { field: HitField, width: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse layout TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize layout TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A parameter resolved to its position in the bitstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSlot {
    pub name: String,
    pub section: SectionKind,
    pub offset: usize,
    pub width: usize,
    pub default: u64,
}

impl ParameterSlot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.width
    }
}

/// Resolved configuration layout: name -> (offset, width, default)
#[derive(Debug, Clone)]
pub struct ConfigLayout {
    spec: LayoutSpec,
    slots: Vec<ParameterSlot>,
    index: HashMap<(SectionKind, String), usize>,
    mask_offset: usize,
    total_bits: usize,
}

impl ConfigLayout {
    /// Built-in AstroPix 2 layout (1485 bits)
    pub fn astropix2() -> Self {
        Self::build(LayoutSpec::astropix2())
    }

    /// Validate a spec and resolve its slots
    pub fn from_spec(spec: LayoutSpec) -> Result<Self, LayoutError> {
        let Geometry { cols, rows } = spec.geometry;
        if cols == 0 || rows == 0 || spec.geometry.mask_register_width() > MAX_FIELD_WIDTH {
            return Err(LayoutError::InvalidGeometry { cols, rows });
        }

        for section in SectionKind::ALL {
            let mut seen = std::collections::HashSet::new();
            for param in spec.section(section) {
                if param.width == 0 || param.width > MAX_FIELD_WIDTH {
                    return Err(LayoutError::InvalidWidth {
                        section,
                        name: param.name.clone(),
                        width: param.width,
                    });
                }
                if !fits(param.default, param.width) {
                    return Err(LayoutError::DefaultOutOfRange {
                        section,
                        name: param.name.clone(),
                        default: param.default,
                        width: param.width,
                    });
                }
                if !seen.insert(param.name.as_str()) {
                    return Err(LayoutError::DuplicateName { section, name: param.name.clone() });
                }
            }
        }

        Ok(Self::build(spec))
    }

    /// Parse a layout table from TOML
    pub fn from_toml_str(content: &str) -> Result<Self, LayoutError> {
        let spec: LayoutSpec = toml::from_str(content)?;
        Self::from_spec(spec)
    }

    /// Load a layout table from a TOML chip file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let layout = Self::from_toml_str(&content)?;
        debug!("Loaded {} layout from {}", layout.name(), path.as_ref().display());
        Ok(layout)
    }

    /// Serialize the underlying table to TOML
    pub fn to_toml_string(&self) -> Result<String, LayoutError> {
        Ok(toml::to_string_pretty(&self.spec)?)
    }

    fn build(spec: LayoutSpec) -> Self {
        let mut slots = Vec::new();
        let mut index = HashMap::new();
        let mut offset = 0;

        for section in SectionKind::ALL {
            for param in spec.section(section) {
                index.insert((section, param.name.clone()), slots.len());
                slots.push(ParameterSlot {
                    name: param.name.clone(),
                    section,
                    offset,
                    width: param.width,
                    default: param.default,
                });
                offset += param.width;
            }
        }

        let mask_offset = offset;
        let total_bits = mask_offset + spec.geometry.cols * spec.geometry.mask_register_width();

        Self { spec, slots, index, mask_offset, total_bits }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &LayoutSpec {
        &self.spec
    }

    pub fn geometry(&self) -> Geometry {
        self.spec.geometry
    }

    pub fn shift_msb_first(&self) -> bool {
        self.spec.shift_msb_first
    }

    /// Length of the full configuration bitstream
    pub fn total_bits(&self) -> usize {
        self.total_bits
    }

    /// All parameter slots in bitstream order
    pub fn slots(&self) -> &[ParameterSlot] {
        &self.slots
    }

    /// Slots of a single section, in order
    pub fn section_slots(&self, section: SectionKind) -> impl Iterator<Item = &ParameterSlot> {
        self.slots.iter().filter(move |slot| slot.section == section)
    }

    /// Look up a parameter slot by section and name
    pub fn slot(&self, section: SectionKind, name: &str) -> Option<&ParameterSlot> {
        self.index
            .get(&(section, name.to_string()))
            .map(|&i| &self.slots[i])
    }

    /// First bit of the pixel-mask region
    pub fn mask_offset(&self) -> usize {
        self.mask_offset
    }

    /// Bit range of the whole pixel-mask region
    pub fn mask_range(&self) -> Range<usize> {
        self.mask_offset..self.total_bits
    }

    /// Bit range of the register for `col`
    pub fn mask_register_range(&self, col: usize) -> Range<usize> {
        let width = self.spec.geometry.mask_register_width();
        let start = self.mask_offset + col * width;
        start..start + width
    }
}

impl Default for ConfigLayout {
    fn default() -> Self {
        Self::astropix2()
    }
}
