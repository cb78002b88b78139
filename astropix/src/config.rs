/*!
Configuration encoder.

Builds the chip configuration bitstream from partial settings maps. Encoding
always starts from the full default bitstream of the layout; only parameters
named by the caller are overwritten, so settings need not be complete.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::debug;

use crate::bitfield::{fits, read_field, write_field, BitFieldError, BitOrder, Bits, BitsRef};
use crate::layout::{ConfigLayout, SectionKind};
use crate::mask::{DigitalMask, MaskShapeError, PixelConfig};

/// A settings key is not part of the layout vocabulary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {section} parameter '{key}'")]
pub struct ConfigKeyError {
    pub section: SectionKind,
    pub key: String,
}

/// Errors raised while encoding a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownKey(#[from] ConfigKeyError),

    #[error(transparent)]
    MaskShape(#[from] MaskShapeError),

    #[error("{section} parameter '{key}' value {value} does not fit in {width} bits")]
    ValueOutOfRange { section: SectionKind, key: String, value: u64, width: usize },

    #[error("mask is {found_cols}x{found_rows}, layout expects {cols}x{rows}")]
    GeometryMismatch { cols: usize, rows: usize, found_cols: usize, found_rows: usize },

    #[error(transparent)]
    BitField(#[from] BitFieldError),
}

/// Marker for a settings section
pub trait Section {
    const KIND: SectionKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacSection;

impl Section for DigitalSection {
    const KIND: SectionKind = SectionKind::Digital;
}

impl Section for BiasSection {
    const KIND: SectionKind = SectionKind::Bias;
}

impl Section for DacSection {
    const KIND: SectionKind = SectionKind::Dac;
}

/// Partial map of parameter name to code for one section
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Overrides<S> {
    values: BTreeMap<String, u64>,
    #[serde(skip)]
    _section: PhantomData<S>,
}

pub type DigitalSettings = Overrides<DigitalSection>;
pub type BiasSettings = Overrides<BiasSection>;
pub type DacSettings = Overrides<DacSection>;

impl<S> Overrides<S> {
    pub fn new() -> Self {
        Self { values: BTreeMap::new(), _section: PhantomData }
    }

    /// Builder form of [`Overrides::set`]
    pub fn with(mut self, key: impl Into<String>, value: u64) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: u64) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay `other` on top of these values
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), *v);
        }
    }
}

impl<S: Section> Overrides<S> {
    /// Check every key and value against the layout
    pub fn validate(&self, layout: &ConfigLayout) -> Result<(), ConfigError> {
        for (key, value) in self.iter() {
            let slot = layout.slot(S::KIND, key).ok_or_else(|| ConfigKeyError {
                section: S::KIND,
                key: key.to_string(),
            })?;
            if !fits(value, slot.width) {
                return Err(ConfigError::ValueOutOfRange {
                    section: S::KIND,
                    key: key.to_string(),
                    value,
                    width: slot.width,
                });
            }
        }
        Ok(())
    }

    fn apply(&self, bits: &mut BitsRef, layout: &ConfigLayout) -> Result<(), ConfigError> {
        self.validate(layout)?;
        for (key, value) in self.iter() {
            if let Some(slot) = layout.slot(S::KIND, key) {
                write_field(bits, slot.offset, slot.width, value, BitOrder::MsbFirst)?;
            }
        }
        Ok(())
    }
}

impl<S> Default for Overrides<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for Overrides<S> {
    fn clone(&self) -> Self {
        Self { values: self.values.clone(), _section: PhantomData }
    }
}

impl<S> PartialEq for Overrides<S> {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl<S> fmt::Debug for Overrides<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl<S, K: Into<String>> FromIterator<(K, u64)> for Overrides<S> {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        let mut overrides = Self::new();
        for (k, v) in iter {
            overrides.set(k, v);
        }
        overrides
    }
}

/// The three settings sections of an ASIC, as stored in run configuration files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsicSettings {
    #[serde(default)]
    pub digital: DigitalSettings,
    #[serde(default)]
    pub bias: BiasSettings,
    #[serde(default)]
    pub dacs: DacSettings,
}

impl AsicSettings {
    pub fn validate(&self, layout: &ConfigLayout) -> Result<(), ConfigError> {
        self.digital.validate(layout)?;
        self.bias.validate(layout)?;
        self.dacs.validate(layout)
    }
}

/// Encoded configuration in logical order (first digital parameter first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBitstream {
    bits: Bits,
    shift_msb_first: bool,
}

impl ConfigBitstream {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &BitsRef {
        &self.bits
    }

    /// Bits in the order they are clocked into the chip
    pub fn to_wire(&self) -> Bits {
        if self.shift_msb_first {
            self.bits.clone()
        } else {
            self.bits.iter().by_vals().rev().collect()
        }
    }

    /// Read a parameter back out of the stream
    pub fn field(&self, layout: &ConfigLayout, section: SectionKind, name: &str) -> Option<u64> {
        let slot = layout.slot(section, name)?;
        read_field(&self.bits, slot.offset, slot.width, BitOrder::MsbFirst).ok()
    }

    /// Read a column mask register back out of the stream
    pub fn mask_register(&self, layout: &ConfigLayout, col: usize) -> Option<u64> {
        if col >= layout.geometry().cols {
            return None;
        }
        let range = layout.mask_register_range(col);
        read_field(&self.bits, range.start, range.len(), BitOrder::MsbFirst).ok()
    }

    /// `0`/`1` text form, logical order
    pub fn to_bit_string(&self) -> String {
        self.bits.iter().by_vals().map(|b| if b { '1' } else { '0' }).collect()
    }
}

/// Turns settings and pixel configuration into a [`ConfigBitstream`]
#[derive(Debug, Clone, Default)]
pub struct ConfigEncoder {
    layout: ConfigLayout,
}

impl ConfigEncoder {
    pub fn new(layout: ConfigLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    /// All parameters at their default codes, every pixel disabled
    pub fn default_bitstream(&self) -> ConfigBitstream {
        let mut bits = Bits::repeat(false, self.layout.total_bits());
        for slot in self.layout.slots() {
            // Defaults are validated when the layout is built
            let _ = write_field(&mut bits, slot.offset, slot.width, slot.default, BitOrder::MsbFirst);
        }
        let _ = PixelConfig::new(self.layout.geometry()).write_into(&mut bits, &self.layout);
        ConfigBitstream { bits, shift_msb_first: self.layout.shift_msb_first() }
    }

    /// Encode DAC and bias overrides with an optional digital mask.
    ///
    /// Without a mask the matrix is put in analog mode.
    pub fn encode(
        &self,
        dacs: &DacSettings,
        bias: &BiasSettings,
        mask: Option<&DigitalMask>,
    ) -> Result<ConfigBitstream, ConfigError> {
        let settings = AsicSettings { digital: DigitalSettings::new(), bias: bias.clone(), dacs: dacs.clone() };
        let pixels = match mask {
            Some(mask) => {
                self.check_geometry(mask)?;
                PixelConfig::from_mask(mask, false)
            }
            None => PixelConfig::analog(self.layout.geometry(), false),
        };
        self.encode_with_pixels(&settings, &pixels)
    }

    /// Encode settings with an explicit pixel register set
    pub fn encode_with_pixels(
        &self,
        settings: &AsicSettings,
        pixels: &PixelConfig,
    ) -> Result<ConfigBitstream, ConfigError> {
        settings.validate(&self.layout)?;
        if pixels.geometry() != self.layout.geometry() {
            let g = self.layout.geometry();
            let p = pixels.geometry();
            return Err(ConfigError::GeometryMismatch {
                cols: g.cols,
                rows: g.rows,
                found_cols: p.cols,
                found_rows: p.rows,
            });
        }

        let mut stream = self.default_bitstream();
        settings.digital.apply(&mut stream.bits, &self.layout)?;
        settings.bias.apply(&mut stream.bits, &self.layout)?;
        settings.dacs.apply(&mut stream.bits, &self.layout)?;
        pixels.write_into(&mut stream.bits, &self.layout)?;

        debug!(
            "Encoded {} configuration: {} bits, {} overrides",
            self.layout.name(),
            stream.len(),
            settings.digital.len() + settings.bias.len() + settings.dacs.len()
        );
        Ok(stream)
    }

    fn check_geometry(&self, mask: &DigitalMask) -> Result<(), ConfigError> {
        let g = self.layout.geometry();
        let m = mask.geometry();
        if g != m {
            return Err(ConfigError::GeometryMismatch {
                cols: g.cols,
                rows: g.rows,
                found_cols: m.cols,
                found_rows: m.rows,
            });
        }
        Ok(())
    }
}

/// Complete ASIC state owned by a session: settings overlay plus pixel registers
#[derive(Debug, Clone)]
pub struct AsicConfig {
    encoder: ConfigEncoder,
    settings: AsicSettings,
    pixels: PixelConfig,
}

impl AsicConfig {
    /// Start from layout defaults in analog mode
    pub fn new(layout: ConfigLayout, inject: bool) -> Self {
        let pixels = PixelConfig::analog(layout.geometry(), inject);
        Self { encoder: ConfigEncoder::new(layout), settings: AsicSettings::default(), pixels }
    }

    /// Start from layout defaults with a digital mask
    pub fn with_mask(layout: ConfigLayout, mask: &DigitalMask, inject: bool) -> Result<Self, ConfigError> {
        let config = Self::new(layout, inject);
        config.encoder.check_geometry(mask)?;
        Ok(Self { pixels: PixelConfig::from_mask(mask, inject), ..config })
    }

    pub fn layout(&self) -> &ConfigLayout {
        self.encoder.layout()
    }

    pub fn settings(&self) -> &AsicSettings {
        &self.settings
    }

    pub fn pixels(&self) -> &PixelConfig {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut PixelConfig {
        &mut self.pixels
    }

    /// Merge all three sections after validating them together
    pub fn apply_settings(&mut self, settings: &AsicSettings) -> Result<(), ConfigError> {
        settings.validate(self.layout())?;
        self.settings.digital.merge(&settings.digital);
        self.settings.bias.merge(&settings.bias);
        self.settings.dacs.merge(&settings.dacs);
        Ok(())
    }

    pub fn update_dac(&mut self, dacs: &DacSettings) -> Result<(), ConfigError> {
        dacs.validate(self.layout())?;
        self.settings.dacs.merge(dacs);
        Ok(())
    }

    pub fn update_bias(&mut self, bias: &BiasSettings) -> Result<(), ConfigError> {
        bias.validate(self.layout())?;
        self.settings.bias.merge(bias);
        Ok(())
    }

    pub fn update_digital(&mut self, digital: &DigitalSettings) -> Result<(), ConfigError> {
        digital.validate(self.layout())?;
        self.settings.digital.merge(digital);
        Ok(())
    }

    /// Effective code of a parameter: override if set, else the layout default
    pub fn value(&self, section: SectionKind, name: &str) -> Option<u64> {
        let slot = self.layout().slot(section, name)?;
        let overridden = match section {
            SectionKind::Digital => self.settings.digital.get(name),
            SectionKind::Bias => self.settings.bias.get(name),
            SectionKind::Dac => self.settings.dacs.get(name),
        };
        Some(overridden.unwrap_or(slot.default))
    }

    pub fn encode(&self) -> Result<ConfigBitstream, ConfigError> {
        self.encoder.encode_with_pixels(&self.settings, &self.pixels)
    }

    /// Text dump of every effective setting, used as the run-log header
    pub fn log_header(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "layout: {}", self.layout().name());
        for section in SectionKind::ALL {
            let _ = write!(out, "{}:", section);
            for slot in self.layout().section_slots(section) {
                let value = self.value(section, &slot.name).unwrap_or(slot.default);
                let _ = write!(out, " {}={}", slot.name, value);
            }
            out.push('\n');
        }
        let _ = writeln!(out, "mask:");
        for (col, reg) in self.pixels.registers().iter().enumerate() {
            let width = self.layout().geometry().mask_register_width();
            let _ = writeln!(out, "  col{}: {:0width$b}", col, reg, width = width);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Geometry, LayoutSpec, ParameterSpec};

    fn bench_layout() -> ConfigLayout {
        ConfigLayout::from_spec(LayoutSpec {
            name: "bench".to_string(),
            shift_msb_first: true,
            geometry: Geometry { cols: 2, rows: 2 },
            digital: vec![],
            bias: vec![ParameterSpec::new("vcasp", 4, 3)],
            dac: vec![ParameterSpec::new("threshold", 8, 0), ParameterSpec::new("vcasn", 6, 7)],
        })
        .unwrap()
    }

    #[test]
    fn test_default_bitstream() {
        let encoder = ConfigEncoder::default();
        let stream = encoder.default_bitstream();
        let layout = encoder.layout();

        assert_eq!(stream.len(), 1485);
        assert_eq!(stream.field(layout, SectionKind::Dac, "vpfoll"), Some(60));
        assert_eq!(stream.field(layout, SectionKind::Bias, "qon1"), Some(1));
        assert_eq!(stream.field(layout, SectionKind::Digital, "interrupt_pushpull"), Some(1));
        assert_eq!(stream.mask_register(layout, 0), Some(((1u64 << 35) - 1) << 1));
    }

    #[test]
    fn test_partial_update_only_touches_named_slots() {
        let encoder = ConfigEncoder::new(bench_layout());
        let base = encoder.encode(&DacSettings::new(), &BiasSettings::new(), None).unwrap();
        let dacs = DacSettings::new().with("threshold", 200);
        let stream = encoder.encode(&dacs, &BiasSettings::new(), None).unwrap();

        let slot = encoder.layout().slot(SectionKind::Dac, "threshold").unwrap().clone();
        for (i, (a, b)) in base.bits().iter().zip(stream.bits().iter()).enumerate() {
            if !slot.range().contains(&i) {
                assert_eq!(*a, *b, "bit {} changed", i);
            }
        }
        assert_eq!(stream.field(encoder.layout(), SectionKind::Dac, "threshold"), Some(200));
        assert_eq!(stream.field(encoder.layout(), SectionKind::Dac, "vcasn"), Some(7));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let encoder = ConfigEncoder::default();
        let dacs = DacSettings::new().with("not_a_dac", 1);
        assert_eq!(
            encoder.encode(&dacs, &BiasSettings::new(), None),
            Err(ConfigError::UnknownKey(ConfigKeyError {
                section: SectionKind::Dac,
                key: "not_a_dac".to_string()
            }))
        );

        // Valid name in the wrong section
        let bias = BiasSettings::new().with("vn1", 1);
        assert!(matches!(
            encoder.encode(&DacSettings::new(), &bias, None),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_value_out_of_range() {
        let encoder = ConfigEncoder::default();
        let dacs = DacSettings::new().with("vn1", 64);
        assert!(matches!(
            encoder.encode(&dacs, &BiasSettings::new(), None),
            Err(ConfigError::ValueOutOfRange { value: 64, width: 6, .. })
        ));
    }

    #[test]
    fn test_zero_mask_encodes_zero_region() {
        let encoder = ConfigEncoder::default();
        let text = vec!["0".repeat(35); 35].join("\n");
        let mask = DigitalMask::parse(&text, Geometry::ASTROPIX2).unwrap();
        let stream = encoder.encode(&DacSettings::new(), &BiasSettings::new(), Some(&mask)).unwrap();

        let range = encoder.layout().mask_range();
        assert!(stream.bits()[range].not_any());
    }

    #[test]
    fn test_mask_geometry_mismatch() {
        let encoder = ConfigEncoder::new(bench_layout());
        let text = vec!["0".repeat(35); 35].join("\n");
        let mask = DigitalMask::parse(&text, Geometry::ASTROPIX2).unwrap();
        assert!(matches!(
            encoder.encode(&DacSettings::new(), &BiasSettings::new(), Some(&mask)),
            Err(ConfigError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_wire_order() {
        let encoder = ConfigEncoder::default();
        let stream = encoder.default_bitstream();
        let wire = stream.to_wire();

        assert_eq!(wire.len(), stream.len());
        assert_eq!(wire[0], stream.bits()[stream.len() - 1]);
        assert_eq!(wire[stream.len() - 1], stream.bits()[0]);

        let bench = ConfigEncoder::new(bench_layout()).default_bitstream();
        assert_eq!(bench.to_wire(), bench.bits().to_bitvec());
    }

    #[test]
    fn test_asic_config_updates_merge() {
        let mut config = AsicConfig::new(ConfigLayout::astropix2(), false);
        config.update_dac(&DacSettings::new().with("vn1", 5)).unwrap();
        config.update_dac(&DacSettings::new().with("vpfoll", 40)).unwrap();

        assert_eq!(config.value(SectionKind::Dac, "vn1"), Some(5));
        assert_eq!(config.value(SectionKind::Dac, "vpfoll"), Some(40));
        assert_eq!(config.value(SectionKind::Dac, "vprec"), Some(30));

        // A rejected update leaves state untouched
        let bad = DacSettings::new().with("vn1", 9).with("bogus", 1);
        assert!(config.update_dac(&bad).is_err());
        assert_eq!(config.value(SectionKind::Dac, "vn1"), Some(5));

        let stream = config.encode().unwrap();
        assert_eq!(stream.field(config.layout(), SectionKind::Dac, "vn1"), Some(5));
    }

    #[test]
    fn test_log_header_lists_settings() {
        let config = AsicConfig::new(ConfigLayout::astropix2(), true);
        let header = config.log_header();
        assert!(header.starts_with("layout: astropix2\n"));
        assert!(header.contains("vpfoll=60"));
        assert!(header.contains("col34: "));
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: AsicSettings = toml::from_str("[dacs]\nvn1 = 12\n\n[bias]\nqon0 = 1\n").unwrap();
        assert_eq!(settings.dacs.get("vn1"), Some(12));
        assert_eq!(settings.bias.get("qon0"), Some(1));
        assert!(settings.digital.is_empty());
        settings.validate(&ConfigLayout::astropix2()).unwrap();
    }
}
