/*!
Decoded hit records and the fields they are built from.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Default sample clock period of the AstroPix ToT counter
pub const DEFAULT_SAMPLE_CLOCK_NS: f64 = 10.0;

/// Fields that can be extracted from a readout frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitField {
    ChipId,
    Payload,
    Column,
    Row,
    Location,
    IsColumn,
    Timestamp,
    Tot,
}

impl HitField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChipId => "chip_id",
            Self::Payload => "payload",
            Self::Column => "column",
            Self::Row => "row",
            Self::Location => "location",
            Self::IsColumn => "is_column",
            Self::Timestamp => "timestamp",
            Self::Tot => "tot",
        }
    }

    /// Widest bit field that fits the matching [`HitRecord`] member
    pub fn max_width(&self) -> usize {
        match self {
            Self::ChipId | Self::Payload => 8,
            Self::Column | Self::Row | Self::Location => 16,
            Self::IsColumn => 1,
            Self::Timestamp | Self::Tot => 32,
        }
    }
}

impl FromStr for HitField {
    type Err = String;

    /// Case-insensitive, accepts a few short aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chip_id" | "id" => Ok(Self::ChipId),
            "payload" => Ok(Self::Payload),
            "column" | "col" => Ok(Self::Column),
            "row" => Ok(Self::Row),
            "location" => Ok(Self::Location),
            "is_column" | "is_col" => Ok(Self::IsColumn),
            "timestamp" => Ok(Self::Timestamp),
            "tot" => Ok(Self::Tot),
            other => Err(format!("unknown hit field '{}'", other)),
        }
    }
}

impl fmt::Display for HitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a hit was seen.
///
/// AstroPix reports the row and the column of a hit as two separate frames,
/// each carrying one coordinate and a column flag. Marker-framed streams carry
/// both coordinates in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelAddress {
    Pixel { col: u16, row: u16 },
    Column(u16),
    Row(u16),
}

impl PixelAddress {
    pub fn column(&self) -> Option<u16> {
        match *self {
            Self::Pixel { col, .. } | Self::Column(col) => Some(col),
            Self::Row(_) => None,
        }
    }

    pub fn row(&self) -> Option<u16> {
        match *self {
            Self::Pixel { row, .. } | Self::Row(row) => Some(row),
            Self::Column(_) => None,
        }
    }

    /// The single coordinate of a row/column report
    pub fn location(&self) -> u16 {
        match *self {
            Self::Column(n) | Self::Row(n) => n,
            Self::Pixel { col, .. } => col,
        }
    }

    pub fn is_column(&self) -> bool {
        matches!(self, Self::Column(_))
    }
}

impl fmt::Display for PixelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pixel { col, row } => write!(f, "col {} row {}", col, row),
            Self::Column(n) => write!(f, "col {}", n),
            Self::Row(n) => write!(f, "row {}", n),
        }
    }
}

/// One decoded hit. Never mutated after the decoder emits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitRecord {
    pub chip_id: u8,
    pub payload: u8,
    pub address: PixelAddress,
    pub timestamp: u32,
    pub tot: u32,
    /// False when a field with a fixed expected value did not match
    pub valid: bool,
    /// Frame bytes after any bit reversal
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

impl HitRecord {
    /// Time over threshold in microseconds
    pub fn tot_us(&self, sample_clock_ns: f64) -> f64 {
        self.tot as f64 * sample_clock_ns / 1000.0
    }

    /// Upper nibble of the 12-bit ToT counter
    pub fn tot_msb(&self) -> u32 {
        (self.tot >> 8) & 0xF
    }

    pub fn tot_lsb(&self) -> u32 {
        self.tot & 0xFF
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Receives hits as the decoder emits them
pub trait HitObserver {
    fn on_hit(&mut self, hit: &HitRecord);
}

impl<F: FnMut(&HitRecord)> HitObserver for F {
    fn on_hit(&mut self, hit: &HitRecord) {
        self(hit)
    }
}

/// Prints every hit through `tracing`
#[derive(Debug, Clone)]
pub struct LogObserver {
    pub sample_clock_ns: f64,
    pub printed: u64,
}

impl LogObserver {
    pub fn new(sample_clock_ns: f64) -> Self {
        Self { sample_clock_ns, printed: 0 }
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CLOCK_NS)
    }
}

impl HitObserver for LogObserver {
    fn on_hit(&mut self, hit: &HitRecord) {
        self.printed += 1;
        if !hit.valid {
            warn!(
                "Hit with unexpected header: chip_id={} payload={} raw={}",
                hit.chip_id,
                hit.payload,
                hex::encode(&hit.raw)
            );
        }
        info!(
            "ChipId: {}\tPayload: {}\tLocation: {}\tTimestamp: {}\tToT: MSB {} LSB {} Total {} ({:.3} us)",
            hit.chip_id,
            hit.payload,
            hit.address,
            hit.timestamp,
            hit.tot_msb(),
            hit.tot_lsb(),
            hit.tot,
            hit.tot_us(self.sample_clock_ns)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: PixelAddress) -> HitRecord {
        HitRecord {
            chip_id: 0,
            payload: 4,
            address,
            timestamp: 17,
            tot: 0x3AB,
            valid: true,
            raw: vec![0x04, 0x85, 0x11, 0x03, 0xAB],
        }
    }

    #[test]
    fn test_field_names() {
        assert_eq!("ID".parse::<HitField>(), Ok(HitField::ChipId));
        assert_eq!("is_col".parse::<HitField>(), Ok(HitField::IsColumn));
        assert!("x".parse::<HitField>().is_err());
        assert_eq!(HitField::Timestamp.to_string(), "timestamp");
    }

    #[test]
    fn test_address_accessors() {
        let pixel = PixelAddress::Pixel { col: 3, row: 7 };
        assert_eq!(pixel.column(), Some(3));
        assert_eq!(pixel.row(), Some(7));

        let col = PixelAddress::Column(5);
        assert!(col.is_column());
        assert_eq!(col.row(), None);
        assert_eq!(col.location(), 5);

        assert_eq!(PixelAddress::Row(9).to_string(), "row 9");
    }

    #[test]
    fn test_tot_conversion() {
        let hit = record(PixelAddress::Column(5));
        assert_eq!(hit.tot_msb(), 3);
        assert_eq!(hit.tot_lsb(), 0xAB);
        assert!((hit.tot_us(10.0) - 9.39).abs() < 1e-9);
    }

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut observer = |hit: &HitRecord| seen.push(hit.address);
            observer.on_hit(&record(PixelAddress::Row(2)));
        }
        assert_eq!(seen, vec![PixelAddress::Row(2)]);

        let mut log = LogObserver::default();
        log.on_hit(&record(PixelAddress::Row(2)));
        assert_eq!(log.printed, 1);
    }
}
