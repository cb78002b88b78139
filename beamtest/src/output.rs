/*!
Run outputs: the text log and the hit CSV.

The log starts with the chip configuration header and then holds one
`<index>\t<hex>` line per readout, the format the replay transport reads
back. The CSV holds one row per decoded hit; a readout that failed to decode
leaves a row with only the readout index and time filled in.
*/

use anyhow::{Context, Result};
use astropix::HitRecord;
use chrono::Local;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// File-name timestamp of a run
pub fn run_timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Wall-clock time in seconds, as written to the `hittime` column
pub fn hittime() -> f64 {
    Local::now().timestamp_micros() as f64 / 1e6
}

/// Output file locations of one run
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub log: PathBuf,
    pub csv: Option<PathBuf>,
    pub hitmap: Option<PathBuf>,
}

impl OutputPaths {
    pub fn new(outdir: &Path, name: &str, stamp: &str, csv: bool, hitmap: bool) -> Self {
        let base = format!("{}{}", name, stamp);
        Self {
            log: outdir.join(format!("{}.log", base)),
            csv: csv.then(|| outdir.join(format!("{}.csv", base))),
            hitmap: hitmap.then(|| outdir.join(format!("{}_hitmap.json", base))),
        }
    }
}

/// Text log of raw readouts
pub struct RunLog<W: Write> {
    out: W,
    lines: u64,
}

impl RunLog<BufWriter<File>> {
    pub fn create(path: &Path, header: &str) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create run log: {}", path.display()))?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write> RunLog<W> {
    pub fn new(mut out: W, header: &str) -> Result<Self> {
        out.write_all(header.as_bytes())?;
        if !header.is_empty() && !header.ends_with('\n') {
            out.write_all(b"\n")?;
        }
        Ok(Self { out, lines: 0 })
    }

    pub fn readout(&mut self, index: u64, bytes: &[u8]) -> Result<()> {
        writeln!(self.out, "{}\t{}", index, hex::encode(bytes))?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// One CSV row; every hit field is empty for a failed decode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvRow {
    pub readout: u64,
    pub chip_id: Option<u8>,
    pub payload: Option<u8>,
    pub location: Option<u16>,
    pub is_col: Option<u8>,
    pub timestamp: Option<u32>,
    pub tot_msb: Option<u32>,
    pub tot_lsb: Option<u32>,
    pub tot_total: Option<u32>,
    pub tot_us: Option<f64>,
    pub hit_bits: Option<String>,
    pub hittime: f64,
}

impl CsvRow {
    pub fn from_hit(readout: u64, hit: &HitRecord, sample_clock_ns: f64, hittime: f64) -> Self {
        Self {
            readout,
            chip_id: Some(hit.chip_id),
            payload: Some(hit.payload),
            location: Some(hit.address.location()),
            is_col: Some(u8::from(hit.address.is_column())),
            timestamp: Some(hit.timestamp),
            tot_msb: Some(hit.tot_msb()),
            tot_lsb: Some(hit.tot_lsb()),
            tot_total: Some(hit.tot),
            tot_us: Some(hit.tot_us(sample_clock_ns)),
            hit_bits: Some(hex::encode(&hit.raw)),
            hittime,
        }
    }

    pub fn failed(readout: u64, hittime: f64) -> Self {
        Self {
            readout,
            chip_id: None,
            payload: None,
            location: None,
            is_col: None,
            timestamp: None,
            tot_msb: None,
            tot_lsb: None,
            tot_total: None,
            tot_us: None,
            hit_bits: None,
            hittime,
        }
    }
}

/// CSV writer of decoded hits
pub struct HitCsv<W: Write> {
    wtr: csv::Writer<W>,
    sample_clock_ns: f64,
    rows: u64,
}

impl HitCsv<File> {
    pub fn create(path: &Path, sample_clock_ns: f64) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create CSV: {}", path.display()))?;
        Ok(Self::new(file, sample_clock_ns))
    }
}

impl<W: Write> HitCsv<W> {
    pub fn new(out: W, sample_clock_ns: f64) -> Self {
        Self { wtr: csv::WriterBuilder::new().has_headers(true).from_writer(out), sample_clock_ns, rows: 0 }
    }

    pub fn hit(&mut self, readout: u64, hit: &HitRecord, hittime: f64) -> Result<()> {
        self.write(&CsvRow::from_hit(readout, hit, self.sample_clock_ns, hittime))
    }

    pub fn failed(&mut self, readout: u64, hittime: f64) -> Result<()> {
        self.write(&CsvRow::failed(readout, hittime))
    }

    fn write(&mut self, row: &CsvRow) -> Result<()> {
        self.wtr.serialize(row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.wtr.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.wtr.into_inner().map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e.error()))
    }
}
