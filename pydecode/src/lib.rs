/*!
# AstroPix Decode - Readout Decoding for Python

This Python extension decodes raw AstroPix readout streams and recorded run
logs into numpy arrays, using the same decoder as the readout software.

## Usage

```python
import astropix_decode

# One raw readout
hits = astropix_decode.decode_readout(readout_bytes)
print(hits["tot_us"], hits["location"], hits["is_col"])

# A whole run log
hits = astropix_decode.decode_log("beam_20240101-120000.log")

# Streaming, frames carried across calls
decoder = astropix_decode.HitDecoder("astropix2")
for chunk in chunks:
    hits = decoder.feed(chunk)
decoder.finish()
print(decoder.stats())
```
*/

use astropix::transport::parse_log;
use astropix::{DecoderStats, FrameLayout, FrameResult, HitRecord, ReadoutDecoder};
use numpy::ToPyArray;
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use pyo3::Bound;

/// Decoded hits as parallel columns
#[derive(Debug, Default, PartialEq)]
struct HitColumns {
    readout: Vec<u64>,
    chip_id: Vec<u8>,
    payload: Vec<u8>,
    location: Vec<u16>,
    is_col: Vec<bool>,
    timestamp: Vec<u32>,
    tot: Vec<u32>,
    tot_us: Vec<f64>,
    valid: Vec<bool>,
    errors: u64,
}

impl HitColumns {
    fn push(&mut self, readout: u64, hit: &HitRecord, sample_clock_ns: f64) {
        self.readout.push(readout);
        self.chip_id.push(hit.chip_id);
        self.payload.push(hit.payload);
        self.location.push(hit.address.location());
        self.is_col.push(hit.address.is_column());
        self.timestamp.push(hit.timestamp);
        self.tot.push(hit.tot);
        self.tot_us.push(hit.tot_us(sample_clock_ns));
        self.valid.push(hit.valid);
    }

    fn extend(&mut self, readout: u64, results: Vec<FrameResult>, sample_clock_ns: f64) {
        for result in results {
            match result {
                Ok(hit) => self.push(readout, &hit, sample_clock_ns),
                Err(_) => self.errors += 1,
            }
        }
    }

    fn len(&self) -> usize {
        self.readout.len()
    }

    fn into_dict(self, py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
        let dict = PyDict::new_bound(py);
        dict.set_item("readout", self.readout.to_pyarray_bound(py))?;
        dict.set_item("chip_id", self.chip_id.to_pyarray_bound(py))?;
        dict.set_item("payload", self.payload.to_pyarray_bound(py))?;
        dict.set_item("location", self.location.to_pyarray_bound(py))?;
        dict.set_item("is_col", self.is_col.to_pyarray_bound(py))?;
        dict.set_item("timestamp", self.timestamp.to_pyarray_bound(py))?;
        dict.set_item("tot", self.tot.to_pyarray_bound(py))?;
        dict.set_item("tot_us", self.tot_us.to_pyarray_bound(py))?;
        dict.set_item("valid", self.valid.to_pyarray_bound(py))?;
        dict.set_item("decode_errors", self.errors)?;
        Ok(dict)
    }
}

fn frame_layout(name: &str) -> PyResult<FrameLayout> {
    FrameLayout::by_name(name).map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))
}

fn new_decoder(layout: FrameLayout) -> PyResult<ReadoutDecoder> {
    ReadoutDecoder::new(layout).map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))
}

fn stats_dict<'py>(py: Python<'py>, stats: &DecoderStats) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("frames_decoded", stats.frames_decoded)?;
    dict.set_item("decode_errors", stats.decode_errors)?;
    dict.set_item("sync_loss_events", stats.sync_loss_events)?;
    dict.set_item("discarded_bytes", stats.discarded_bytes)?;
    dict.set_item("idle_bytes", stats.idle_bytes)?;
    Ok(dict)
}

/// Decode every readout of a run log text into columns
fn decode_log_text(text: &str, layout: FrameLayout, sample_clock_ns: f64) -> anyhow::Result<HitColumns> {
    let mut decoder = ReadoutDecoder::new(layout)?;
    let mut columns = HitColumns::default();
    for (index, bytes) in parse_log(text)? {
        columns.extend(index, decoder.feed(&bytes), sample_clock_ns);
    }
    if decoder.finish().is_some() {
        columns.errors += 1;
    }
    Ok(columns)
}

/// Decode one raw readout into a dict of numpy arrays
#[pyfunction]
#[pyo3(signature = (data, layout="astropix2", sample_clock_ns=astropix::DEFAULT_SAMPLE_CLOCK_NS))]
fn decode_readout<'py>(py: Python<'py>, data: &[u8], layout: &str, sample_clock_ns: f64) -> PyResult<Bound<'py, PyDict>> {
    let mut decoder = new_decoder(frame_layout(layout)?)?;
    let mut columns = HitColumns::default();
    columns.extend(0, decoder.feed(data), sample_clock_ns);
    if decoder.finish().is_some() {
        columns.errors += 1;
    }
    columns.into_dict(py)
}

/// Decode a recorded run log into a dict of numpy arrays
#[pyfunction]
#[pyo3(signature = (path, layout="astropix2", sample_clock_ns=astropix::DEFAULT_SAMPLE_CLOCK_NS))]
fn decode_log<'py>(py: Python<'py>, path: &str, layout: &str, sample_clock_ns: f64) -> PyResult<Bound<'py, PyDict>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PyErr::new::<PyIOError, _>(format!("Failed to read run log: {}", e)))?;
    let columns = decode_log_text(&text, frame_layout(layout)?, sample_clock_ns)
        .map_err(|e| PyErr::new::<PyValueError, _>(format!("Failed to decode run log: {}", e)))?;
    tracing::debug!("Decoded {} hits from {}", columns.len(), path);
    columns.into_dict(py)
}

/// Stateful decoder; partial frames carry over between `feed` calls
#[pyclass(name = "HitDecoder")]
pub struct PyHitDecoder {
    inner: ReadoutDecoder,
    sample_clock_ns: f64,
    readouts: u64,
}

#[pymethods]
impl PyHitDecoder {
    #[new]
    #[pyo3(signature = (layout="astropix2", sample_clock_ns=astropix::DEFAULT_SAMPLE_CLOCK_NS))]
    fn new(layout: &str, sample_clock_ns: f64) -> PyResult<Self> {
        Ok(Self { inner: new_decoder(frame_layout(layout)?)?, sample_clock_ns, readouts: 0 })
    }

    /// Decode a chunk and return the completed hits
    fn feed<'py>(&mut self, py: Python<'py>, data: &[u8]) -> PyResult<Bound<'py, PyDict>> {
        let mut columns = HitColumns::default();
        columns.extend(self.readouts, self.inner.feed(data), self.sample_clock_ns);
        self.readouts += 1;
        columns.into_dict(py)
    }

    /// End of stream; returns the truncation error of a trailing partial frame, if any
    fn finish(&mut self) -> Option<String> {
        self.inner.finish().map(|e| e.to_string())
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.readouts = 0;
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        stats_dict(py, &self.inner.stats())
    }
}

/// Python module definition
#[pymodule]
fn astropix_decode(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyHitDecoder>()?;
    m.add_function(wrap_pyfunction!(decode_readout, m)?)?;
    m.add_function(wrap_pyfunction!(decode_log, m)?)?;
    m.add("__version__", astropix::VERSION)?;

    // Add module docstring
    m.add("__doc__", "AstroPix readout decoder")?;

    Ok(())
}
