/*!
Readout stream decoder.

Raw bytes from the transport are turned into [`HitRecord`]s by a small state
machine: `AwaitingSync` scans for the start of a frame, `ReadingFrame`
collects a fixed number of bytes and `Emitting` extracts fields according to
the [`FrameLayout`] table. A bad frame yields a [`DecodeError`] for that frame
only; the decoder goes back to scanning and never loses sync permanently.
Partial frames are carried across calls.
*/

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bitfield::{read_field, BitOrder, MAX_FIELD_WIDTH};
use crate::hit::{HitField, HitObserver, HitRecord, PixelAddress};
use crate::layout::{Geometry, LayoutError};
use crate::transport::{Transport, TransportError};

/// AstroPix idle filler after per-byte bit reversal
pub const ASTROPIX_IDLE_BYTE: u8 = 0x3D;

/// How frame boundaries are found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Frames begin with `start` and, if set, end with `end`
    Marker {
        start: u8,
        #[serde(default)]
        end: Option<u8>,
    },
    /// Frames begin at the first byte that is not idle filler
    Idle { idle: Vec<u8> },
}

/// One field of a frame, as a bit range in MSB-first frame order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: HitField,
    pub offset: usize,
    pub width: usize,
    /// Fixed value this field must carry; a mismatch marks the hit invalid
    #[serde(default)]
    pub expected: Option<u64>,
}

impl FieldSpec {
    pub fn new(field: HitField, offset: usize, width: usize) -> Self {
        Self { field, offset, width, expected: None }
    }

    pub fn expecting(mut self, value: u64) -> Self {
        self.expected = Some(value);
        self
    }
}

/// Frame layout table for one readout protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub name: String,
    pub sync: SyncStrategy,
    /// Bytes per frame, markers included
    pub frame_len: usize,
    /// Reverse the bit order of every byte before decoding
    #[serde(default)]
    pub reverse_bits: bool,
    #[serde(default)]
    pub geometry: Geometry,
    pub fields: Vec<FieldSpec>,
}

impl FrameLayout {
    /// AstroPix 2: 5-byte frames separated by idle bytes, LSB-first per byte
    pub fn astropix2() -> Self {
        Self {
            name: "astropix2".to_string(),
            sync: SyncStrategy::Idle { idle: vec![ASTROPIX_IDLE_BYTE, 0xFF] },
            frame_len: 5,
            reverse_bits: true,
            geometry: Geometry::ASTROPIX2,
            fields: vec![
                FieldSpec::new(HitField::ChipId, 0, 5).expecting(0),
                FieldSpec::new(HitField::Payload, 5, 3).expecting(4),
                FieldSpec::new(HitField::IsColumn, 8, 1),
                FieldSpec::new(HitField::Location, 10, 6),
                FieldSpec::new(HitField::Timestamp, 16, 8),
                FieldSpec::new(HitField::Tot, 28, 12),
            ],
        }
    }

    /// `0xAA, column, row, tot, 0xBB`
    pub fn marker_triplet() -> Self {
        Self {
            name: "marker_triplet".to_string(),
            sync: SyncStrategy::Marker { start: 0xAA, end: Some(0xBB) },
            frame_len: 5,
            reverse_bits: false,
            geometry: Geometry::ASTROPIX2,
            fields: vec![
                FieldSpec::new(HitField::Column, 8, 8),
                FieldSpec::new(HitField::Row, 16, 8),
                FieldSpec::new(HitField::Tot, 24, 8),
            ],
        }
    }

    /// Built-in layout by name
    pub fn by_name(name: &str) -> Result<Self, LayoutError> {
        match name {
            "astropix2" => Ok(Self::astropix2()),
            "marker_triplet" => Ok(Self::marker_triplet()),
            other => Err(LayoutError::UnknownFrameLayout(other.to_string())),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LayoutError> {
        let layout: Self = toml::from_str(content)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let min_len = match self.sync {
            SyncStrategy::Marker { end: Some(_), .. } => 2,
            _ => 1,
        };
        if self.frame_len < min_len {
            return Err(LayoutError::EmptyFrame(self.name.clone()));
        }
        let frame_bits = self.frame_len * 8;
        for spec in &self.fields {
            if spec.width == 0 || spec.width > MAX_FIELD_WIDTH || spec.offset + spec.width > frame_bits {
                return Err(LayoutError::FrameFieldOutOfBounds {
                    field: spec.field,
                    offset: spec.offset,
                    width: spec.width,
                    frame_bits,
                });
            }
            if spec.width > spec.field.max_width() {
                return Err(LayoutError::FrameFieldTooWide {
                    field: spec.field,
                    width: spec.width,
                    max: spec.field.max_width(),
                });
            }
        }
        Ok(())
    }

    fn start_of_frame(&self, byte: u8) -> bool {
        match &self.sync {
            SyncStrategy::Marker { start, .. } => byte == *start,
            SyncStrategy::Idle { idle } => !idle.contains(&byte),
        }
    }

    /// Extract one hit from a complete frame
    pub fn decode_frame(&self, frame: &[u8]) -> Result<HitRecord, DecodeError> {
        if frame.len() != self.frame_len {
            return Err(DecodeError::Truncated { have: frame.len(), need: self.frame_len });
        }
        if let SyncStrategy::Marker { end: Some(end), .. } = self.sync {
            let found = frame[frame.len() - 1];
            if found != end {
                return Err(DecodeError::EndMarkerMismatch { expected: end, found });
            }
        }

        let bits = frame.view_bits::<Msb0>();
        let mut values = [None; 8];
        let mut valid = true;
        for spec in &self.fields {
            let value = read_field(bits, spec.offset, spec.width, BitOrder::MsbFirst)
                .map_err(|_| DecodeError::Truncated { have: frame.len(), need: self.frame_len })?;
            if let Some(expected) = spec.expected {
                if value != expected {
                    debug!("{} is {}, expected {}", spec.field, value, expected);
                    valid = false;
                }
            }
            values[spec.field as usize] = Some(value);
        }
        let get = |field: HitField| values[field as usize];

        let address = self.address(get(HitField::Column), get(HitField::Row), get(HitField::Location), get(HitField::IsColumn))?;

        Ok(HitRecord {
            chip_id: get(HitField::ChipId).unwrap_or(0) as u8,
            payload: get(HitField::Payload).unwrap_or(0) as u8,
            address,
            timestamp: get(HitField::Timestamp).unwrap_or(0) as u32,
            tot: get(HitField::Tot).unwrap_or(0) as u32,
            valid,
            raw: frame.to_vec(),
        })
    }

    fn address(
        &self,
        column: Option<u64>,
        row: Option<u64>,
        location: Option<u64>,
        is_column: Option<u64>,
    ) -> Result<PixelAddress, DecodeError> {
        let cols = self.geometry.cols as u64;
        let rows = self.geometry.rows as u64;
        let check = |field: HitField, value: u64, limit: u64| {
            if value < limit {
                Ok(value as u16)
            } else {
                Err(DecodeError::FieldOutOfRange { field, value, limit })
            }
        };

        match (column, row, location) {
            (Some(col), Some(row), _) => Ok(PixelAddress::Pixel {
                col: check(HitField::Column, col, cols)?,
                row: check(HitField::Row, row, rows)?,
            }),
            (Some(col), None, _) => Ok(PixelAddress::Column(check(HitField::Column, col, cols)?)),
            (None, Some(row), _) => Ok(PixelAddress::Row(check(HitField::Row, row, rows)?)),
            (None, None, Some(loc)) if is_column.unwrap_or(0) == 1 => {
                Ok(PixelAddress::Column(check(HitField::Location, loc, cols)?))
            }
            (None, None, Some(loc)) => Ok(PixelAddress::Row(check(HitField::Location, loc, rows)?)),
            (None, None, None) => Ok(PixelAddress::Column(0)),
        }
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::astropix2()
    }
}

/// A single frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{field} value {value} outside 0..{limit}")]
    FieldOutOfRange { field: HitField, value: u64, limit: u64 },

    #[error("frame end marker 0x{found:02X}, expected 0x{expected:02X}")]
    EndMarkerMismatch { expected: u8, found: u8 },

    #[error("stream ended inside a frame ({have} of {need} bytes)")]
    Truncated { have: usize, need: usize },
}

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingSync,
    ReadingFrame { filled: usize },
    Emitting,
}

/// Running counters of a decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub decode_errors: u64,
    /// Contiguous runs of unexpected bytes while waiting for a start marker
    pub sync_loss_events: u64,
    pub discarded_bytes: u64,
    pub idle_bytes: u64,
}

/// Outcome of one frame, in stream order
pub type FrameResult = Result<HitRecord, DecodeError>;

/// Stateful readout decoder
#[derive(Debug, Clone)]
pub struct ReadoutDecoder {
    layout: FrameLayout,
    state: DecoderState,
    input: VecDeque<u8>,
    frame: Vec<u8>,
    /// Leading bytes of `input` pushed back from a rejected frame
    replayed: usize,
    /// The frame being collected started on a pushed-back byte
    frame_replayed: bool,
    in_sync_loss: bool,
    min_pending: usize,
    stats: DecoderStats,
}

impl ReadoutDecoder {
    /// Decoder for a validated layout
    pub fn new(layout: FrameLayout) -> Result<Self, LayoutError> {
        layout.validate()?;
        let frame = Vec::with_capacity(layout.frame_len);
        Ok(Self {
            layout,
            state: DecoderState::AwaitingSync,
            input: VecDeque::new(),
            frame,
            replayed: 0,
            frame_replayed: false,
            in_sync_loss: false,
            min_pending: 1,
            stats: DecoderStats::default(),
        })
    }

    /// Bytes the link must report before [`ReadoutDecoder::hits_present`] is true
    pub fn with_min_pending(mut self, min_pending: usize) -> Self {
        self.min_pending = min_pending.max(1);
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Cheap probe: does the link hold at least `min_pending` unread bytes?
    pub fn hits_present<T: Transport + ?Sized>(&self, link: &mut T) -> Result<bool, TransportError> {
        Ok(link.available()? >= self.min_pending)
    }

    /// Feed raw bytes and return every frame completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameResult> {
        let reverse = self.layout.reverse_bits;
        self.input
            .extend(bytes.iter().map(|&b| if reverse { b.reverse_bits() } else { b }));

        let mut out = Vec::new();
        while let Some(byte) = self.input.pop_front() {
            let replayed = self.replayed > 0;
            self.replayed = self.replayed.saturating_sub(1);
            if let Some(result) = self.step(byte, replayed) {
                out.push(result);
            }
        }
        out
    }

    /// Feed raw bytes, pass hits to `observer` and return the errors
    pub fn feed_observed<O: HitObserver + ?Sized>(&mut self, bytes: &[u8], observer: &mut O) -> Vec<DecodeError> {
        let mut errors = Vec::new();
        for result in self.feed(bytes) {
            match result {
                Ok(hit) => observer.on_hit(&hit),
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// End of stream: a partially collected frame becomes a truncation error
    pub fn finish(&mut self) -> Option<DecodeError> {
        let result = match self.state {
            // Those bytes were already charged to the rejected frame
            DecoderState::ReadingFrame { filled } if self.frame_replayed => {
                self.stats.discarded_bytes += filled as u64;
                None
            }
            DecoderState::ReadingFrame { filled } => {
                warn!("Readout ended inside a frame ({} of {} bytes)", filled, self.layout.frame_len);
                self.stats.decode_errors += 1;
                self.stats.discarded_bytes += filled as u64;
                Some(DecodeError::Truncated { have: filled, need: self.layout.frame_len })
            }
            _ => None,
        };
        self.frame.clear();
        self.frame_replayed = false;
        self.state = DecoderState::AwaitingSync;
        self.in_sync_loss = false;
        result
    }

    /// Drop buffered bytes and counters
    pub fn reset(&mut self) {
        self.input.clear();
        self.frame.clear();
        self.replayed = 0;
        self.frame_replayed = false;
        self.state = DecoderState::AwaitingSync;
        self.in_sync_loss = false;
        self.stats = DecoderStats::default();
    }

    fn step(&mut self, byte: u8, replayed: bool) -> Option<FrameResult> {
        match self.state {
            DecoderState::AwaitingSync | DecoderState::Emitting => {
                if self.layout.start_of_frame(byte) {
                    self.in_sync_loss = false;
                    self.frame_replayed = replayed;
                    self.frame.clear();
                    self.frame.push(byte);
                    self.state = DecoderState::ReadingFrame { filled: 1 };
                } else if matches!(self.layout.sync, SyncStrategy::Idle { .. }) {
                    self.stats.idle_bytes += 1;
                    return None;
                } else {
                    if !self.in_sync_loss {
                        self.stats.sync_loss_events += 1;
                        self.in_sync_loss = true;
                        debug!("Sync lost, discarding until next start marker");
                    }
                    self.stats.discarded_bytes += 1;
                    return None;
                }
            }
            DecoderState::ReadingFrame { filled } => {
                self.frame.push(byte);
                self.state = DecoderState::ReadingFrame { filled: filled + 1 };
            }
        }

        if self.frame.len() == self.layout.frame_len {
            self.emit()
        } else {
            None
        }
    }

    fn emit(&mut self) -> Option<FrameResult> {
        self.state = DecoderState::Emitting;
        let frame = std::mem::take(&mut self.frame);
        let result = self.layout.decode_frame(&frame);
        let recharged = result.is_err() && self.frame_replayed;

        match &result {
            Ok(_) => self.stats.frames_decoded += 1,
            // A rescan that fails again is sync loss, not a second bad frame
            Err(_) if recharged => {
                self.stats.sync_loss_events += 1;
                debug!("Rescan did not find a frame in {}", hex::encode(&frame));
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!("Decode error: {} (frame {})", e, hex::encode(&frame));
            }
        }
        if let Err(e) = &result {
            if let (DecodeError::EndMarkerMismatch { .. }, SyncStrategy::Marker { start, .. }) =
                (e, &self.layout.sync)
            {
                // Rescan from the first start marker inside the rejected frame
                let resume = frame[1..].iter().position(|b| b == start).map(|p| p + 1);
                let dropped = resume.unwrap_or(frame.len());
                self.stats.discarded_bytes += dropped as u64;
                for &b in frame[dropped..].iter().rev() {
                    self.input.push_front(b);
                }
                self.replayed += frame.len() - dropped;
            } else {
                self.stats.discarded_bytes += frame.len() as u64;
            }
        }

        self.frame = frame;
        self.frame.clear();
        self.frame_replayed = false;
        self.state = DecoderState::AwaitingSync;
        if recharged {
            None
        } else {
            Some(result)
        }
    }
}

/// Decode a complete recorded stream in one go
pub fn decode_stream(
    layout: &FrameLayout,
    bytes: &[u8],
) -> Result<(Vec<HitRecord>, Vec<DecodeError>, DecoderStats), LayoutError> {
    let mut decoder = ReadoutDecoder::new(layout.clone())?;
    let mut hits = Vec::new();
    let mut errors = Vec::new();
    for result in decoder.feed(bytes) {
        match result {
            Ok(hit) => hits.push(hit),
            Err(e) => errors.push(e),
        }
    }
    errors.extend(decoder.finish());
    Ok((hits, errors, decoder.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::reverse_bits;

    /// An AstroPix frame as it appears on the wire
    fn astropix_frame(chip_id: u8, payload: u8, is_col: bool, location: u8, timestamp: u8, tot: u16) -> Vec<u8> {
        let logical = [
            (chip_id << 3) | payload,
            ((is_col as u8) << 7) | location,
            timestamp,
            (tot >> 8) as u8 & 0x0F,
            tot as u8,
        ];
        reverse_bits(&logical)
    }

    #[test]
    fn test_marker_frame() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let results = decoder.feed(&[0xAA, 3, 7, 12, 0xBB]);

        assert_eq!(results.len(), 1);
        let hit = results[0].as_ref().unwrap();
        assert_eq!(hit.address, PixelAddress::Pixel { col: 3, row: 7 });
        assert_eq!(hit.tot, 12);
        assert!(hit.valid);
        assert_eq!(decoder.state(), DecoderState::AwaitingSync);
    }

    #[test]
    fn test_frames_split_across_feeds() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        assert!(decoder.feed(&[0xAA, 3]).is_empty());
        assert_eq!(decoder.state(), DecoderState::ReadingFrame { filled: 2 });
        let results = decoder.feed(&[7, 12, 0xBB, 0xAA]);
        assert_eq!(results.len(), 1);
        assert_eq!(decoder.state(), DecoderState::ReadingFrame { filled: 1 });

        assert_eq!(decoder.finish(), Some(DecodeError::Truncated { have: 1, need: 5 }));
        assert_eq!(decoder.state(), DecoderState::AwaitingSync);
    }

    #[test]
    fn test_leading_garbage_is_one_sync_loss() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let results = decoder.feed(&[0x01, 0x02, 0x03, 0xAA, 1, 2, 3, 0xBB, 0x09, 0xAA, 4, 5, 6, 0xBB]);

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        let stats = decoder.stats();
        assert_eq!(stats.sync_loss_events, 2);
        assert_eq!(stats.discarded_bytes, 4);
    }

    #[test]
    fn test_resync_after_bad_end_marker() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        // Frame cut short: the next start marker arrives where the end marker should be
        let results = decoder.feed(&[0xAA, 1, 2, 0xAA, 3, 7, 12, 0xBB]);

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(DecodeError::EndMarkerMismatch { expected: 0xBB, found: 3 })));
        assert_eq!(results[1].as_ref().unwrap().address, PixelAddress::Pixel { col: 3, row: 7 });
        assert_eq!(decoder.stats().decode_errors, 1);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_start_marker_inside_bad_frame_counts_once() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let stream = [0xAA, 1, 2, 3, 0xBB, 0xAA, 0xAA, 9, 9, 0xCC, 0xAA, 4, 5, 6, 0xBB];
        let results = decoder.feed(&stream);

        assert_eq!(results.len(), 3);
        assert!(matches!(results[1], Err(DecodeError::EndMarkerMismatch { expected: 0xBB, found: 0xCC })));
        assert_eq!(results[2].as_ref().unwrap().address, PixelAddress::Pixel { col: 4, row: 5 });
        let stats = decoder.stats();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.sync_loss_events, 1);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_rescanned_partial_frame_is_not_truncation() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let results = decoder.feed(&[0xAA, 1, 0xAA, 2, 0xCC]);

        assert_eq!(results.len(), 1);
        assert_eq!(decoder.state(), DecoderState::ReadingFrame { filled: 3 });
        assert_eq!(decoder.finish(), None);
        assert_eq!(decoder.stats().decode_errors, 1);
    }

    #[test]
    fn test_invalid_layout_rejected_by_decoder() {
        let mut empty = FrameLayout::marker_triplet();
        empty.frame_len = 0;
        assert!(matches!(ReadoutDecoder::new(empty), Err(LayoutError::EmptyFrame(_))));

        let mut wide = FrameLayout::astropix2();
        wide.fields[0] = FieldSpec::new(HitField::ChipId, 0, 16);
        assert!(matches!(
            ReadoutDecoder::new(wide),
            Err(LayoutError::FrameFieldTooWide { field: HitField::ChipId, width: 16, max: 8 })
        ));
    }

    #[test]
    fn test_out_of_range_pixel() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let results = decoder.feed(&[0xAA, 40, 7, 12, 0xBB, 0xAA, 1, 1, 1, 0xBB]);

        assert_eq!(
            results[0],
            Err(DecodeError::FieldOutOfRange { field: HitField::Column, value: 40, limit: 35 })
        );
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_astropix_stream() {
        let mut stream = reverse_bits(&[0x3D, 0x3D]);
        stream.extend(astropix_frame(0, 4, true, 12, 200, 0x2F1));
        stream.extend(reverse_bits(&[0x3D]));
        stream.extend(astropix_frame(0, 4, false, 30, 201, 0x005));
        stream.extend([0xFF, 0xFF]);

        let (hits, errors, stats) = decode_stream(&FrameLayout::astropix2(), &stream).unwrap();
        assert!(errors.is_empty());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].address, PixelAddress::Column(12));
        assert_eq!(hits[0].timestamp, 200);
        assert_eq!(hits[0].tot, 0x2F1);
        assert!(hits[0].valid);
        assert_eq!(hits[1].address, PixelAddress::Row(30));
        assert_eq!(stats.idle_bytes, 5);
        assert_eq!(stats.sync_loss_events, 0);
    }

    #[test]
    fn test_unexpected_header_flags_invalid() {
        let stream = astropix_frame(3, 4, true, 1, 0, 0);
        let (hits, errors, _) = decode_stream(&FrameLayout::astropix2(), &stream).unwrap();
        assert!(errors.is_empty());
        assert_eq!(hits[0].chip_id, 3);
        assert!(!hits[0].valid);
    }

    #[test]
    fn test_observer_receives_hits() {
        let mut decoder = ReadoutDecoder::new(FrameLayout::marker_triplet()).unwrap();
        let mut cols = Vec::new();
        let errors = decoder.feed_observed(&[0xAA, 3, 7, 12, 0xBB, 0xAA, 99, 0, 0, 0xBB], &mut |hit: &HitRecord| {
            cols.push(hit.address.column())
        });
        assert_eq!(cols, vec![Some(3)]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_frame_layout_tables() {
        assert_eq!(FrameLayout::by_name("astropix2").unwrap(), FrameLayout::astropix2());
        assert!(matches!(FrameLayout::by_name("nope"), Err(LayoutError::UnknownFrameLayout(_))));

        let text = toml::to_string(&FrameLayout::marker_triplet()).unwrap();
        assert_eq!(FrameLayout::from_toml_str(&text).unwrap(), FrameLayout::marker_triplet());

        let mut bad = FrameLayout::marker_triplet();
        bad.fields.push(FieldSpec::new(HitField::Timestamp, 36, 8));
        assert!(matches!(bad.validate(), Err(LayoutError::FrameFieldOutOfBounds { .. })));
    }
}
