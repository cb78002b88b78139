//! Offline decoding of a recorded run log.

use anyhow::{Context, Result};
use astropix::{DecoderStats, FrameLayout, ReadoutDecoder, ReplayTransport};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::output::HitCsv;

/// Where decoded hits go
pub enum DecodeSink<W: Write> {
    /// One JSON object per hit
    JsonLines(W),
    Csv(HitCsv<W>),
}

/// Replay `log` through a fresh decoder, one readout at a time.
/// Rows carry the readout index recorded in the log.
pub fn decode_log<W: Write>(log: &Path, layout: FrameLayout, sink: &mut DecodeSink<W>) -> Result<DecoderStats> {
    let mut replay =
        ReplayTransport::open(log).with_context(|| format!("Failed to read run log: {}", log.display()))?;
    let mut decoder = ReadoutDecoder::new(layout)?;
    let mut readouts = 0u64;

    while let Some((index, bytes)) = replay.next_readout() {
        readouts += 1;
        for result in decoder.feed(&bytes) {
            match result {
                Ok(hit) => match sink {
                    DecodeSink::JsonLines(out) => {
                        let line = serde_json::json!({ "readout": index, "hit": hit });
                        writeln!(out, "{}", line)?;
                    }
                    DecodeSink::Csv(csv) => csv.hit(index, &hit, 0.0)?,
                },
                Err(e) => {
                    warn!("Readout {}: {}", index, e);
                    if let DecodeSink::Csv(csv) = sink {
                        csv.failed(index, 0.0)?;
                    }
                }
            }
        }
    }
    if let Some(e) = decoder.finish() {
        warn!("Log ended inside a frame: {}", e);
    }

    match sink {
        DecodeSink::JsonLines(out) => out.flush()?,
        DecodeSink::Csv(csv) => csv.flush()?,
    }
    let stats = decoder.stats();
    info!(
        "Decoded {} readouts: {} frames, {} errors, {} sync losses",
        readouts, stats.frames_decoded, stats.decode_errors, stats.sync_loss_events
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use astropix::transport::astropix_hit_frames;

    fn write_log(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_decode_to_json_lines() {
        let frames = astropix_hit_frames(2, 11, 5, 300);
        let log = write_log(&format!("layout: astropix2\n0\t{}\n1\tbcbc\n", hex::encode(frames)));

        let mut sink = DecodeSink::JsonLines(Vec::new());
        let stats = decode_log(log.path(), FrameLayout::astropix2(), &mut sink).unwrap();
        assert_eq!(stats.frames_decoded, 2);

        let DecodeSink::JsonLines(out) = sink else { unreachable!() };
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["readout"], 0);
        assert_eq!(lines[0]["hit"]["tot"], 300);
        assert_eq!(lines[1]["hit"]["address"]["column"], 2);
    }

    #[test]
    fn test_rows_use_logged_index() {
        let log = write_log("layout: marker_triplet\n40\taa03070cbb\n41\t\n57\taa01020399bb\n");

        let mut sink = DecodeSink::Csv(HitCsv::new(Vec::new(), 10.0));
        decode_log(log.path(), FrameLayout::marker_triplet(), &mut sink).unwrap();

        let DecodeSink::Csv(csv) = sink else { unreachable!() };
        let text = String::from_utf8(csv.into_inner().unwrap()).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("40,"));
        assert!(rows[1].starts_with("57,,"));
    }

    #[test]
    fn test_decode_marker_log_to_csv() {
        let log = write_log("0\taa03070cbb\n1\taa010101cc\n2\taa04050699bb\n");

        let mut sink = DecodeSink::Csv(HitCsv::new(Vec::new(), 10.0));
        let stats = decode_log(log.path(), FrameLayout::marker_triplet(), &mut sink).unwrap();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.decode_errors, 2);

        let DecodeSink::Csv(csv) = sink else { unreachable!() };
        let text = String::from_utf8(csv.into_inner().unwrap()).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("0,"));
        assert!(rows[1].starts_with("1,,"));
    }
}
