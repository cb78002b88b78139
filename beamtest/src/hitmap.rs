//! Accumulated hit map and the per-event ASCII strip printed by `--showhits`.

use anyhow::{Context, Result};
use astropix::{Geometry, HitRecord, PixelAddress};
use serde::Serialize;
use std::path::Path;

/// Row, column and pixel hit counts over a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitMap {
    pub cols: usize,
    pub rows: usize,
    pub events: u64,
    pub row_hits: Vec<u64>,
    pub col_hits: Vec<u64>,
    /// `pixel_hits[col][row]`: coincident row and column hits within one event
    pub pixel_hits: Vec<Vec<u64>>,
}

impl HitMap {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            cols: geometry.cols,
            rows: geometry.rows,
            events: 0,
            row_hits: vec![0; geometry.rows],
            col_hits: vec![0; geometry.cols],
            pixel_hits: vec![vec![0; geometry.rows]; geometry.cols],
        }
    }

    /// Rows and columns touched by one event
    fn split(hits: &[HitRecord]) -> (Vec<usize>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for hit in hits {
            match hit.address {
                PixelAddress::Pixel { col, row } => {
                    cols.push(col as usize);
                    rows.push(row as usize);
                }
                PixelAddress::Column(col) => cols.push(col as usize),
                PixelAddress::Row(row) => rows.push(row as usize),
            }
        }
        rows.sort_unstable();
        rows.dedup();
        cols.sort_unstable();
        cols.dedup();
        (rows, cols)
    }

    /// Add the hits of one readout
    pub fn record_event(&mut self, hits: &[HitRecord]) {
        if hits.is_empty() {
            return;
        }
        self.events += 1;
        let (rows, cols) = Self::split(hits);
        for &row in rows.iter().filter(|&&r| r < self.rows) {
            self.row_hits[row] += 1;
        }
        for &col in cols.iter().filter(|&&c| c < self.cols) {
            self.col_hits[col] += 1;
            for &row in rows.iter().filter(|&&r| r < self.rows) {
                self.pixel_hits[col][row] += 1;
            }
        }
    }

    /// Two-line strip marking the rows and columns hit in one event
    pub fn ascii_event(&self, index: u64, hits: &[HitRecord]) -> String {
        let (rows, cols) = Self::split(hits);
        let strip = |n: usize, set: &[usize]| -> String {
            (0..n).map(|i| if set.contains(&i) { 'X' } else { '.' }).collect()
        };
        format!("event {:>6} rows {}\n             cols {}", index, strip(self.rows, &rows), strip(self.cols, &cols))
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).with_context(|| "Failed to serialize hit map")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write hit map: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(address: PixelAddress) -> HitRecord {
        HitRecord { chip_id: 0, payload: 4, address, timestamp: 0, tot: 10, valid: true, raw: vec![] }
    }

    #[test]
    fn test_row_column_coincidence() {
        let mut map = HitMap::new(Geometry { cols: 4, rows: 3 });
        map.record_event(&[hit(PixelAddress::Row(2)), hit(PixelAddress::Column(1))]);
        map.record_event(&[hit(PixelAddress::Pixel { col: 1, row: 2 })]);
        map.record_event(&[]);

        assert_eq!(map.events, 2);
        assert_eq!(map.row_hits, vec![0, 0, 2]);
        assert_eq!(map.col_hits, vec![0, 2, 0, 0]);
        assert_eq!(map.pixel_hits[1][2], 2);
    }

    #[test]
    fn test_ascii_event() {
        let map = HitMap::new(Geometry { cols: 4, rows: 3 });
        let text = map.ascii_event(5, &[hit(PixelAddress::Row(0)), hit(PixelAddress::Column(3))]);
        assert_eq!(text, "event      5 rows X..\n             cols ...X");
    }

    #[test]
    fn test_save_json() {
        let mut map = HitMap::new(Geometry { cols: 2, rows: 2 });
        map.record_event(&[hit(PixelAddress::Pixel { col: 0, row: 1 })]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        map.save_json(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["events"], 1);
        assert_eq!(value["pixel_hits"][0][1], 1);
    }
}
