//! Full-stack tests against the in-process bridge emulator.

use std::io::Write;
use std::sync::atomic::AtomicBool;

use astropix::layout::{Geometry, LayoutSpec, ParameterSpec};
use astropix::mask::MaskShapeError;
use astropix::session::{AsicConfigured, Ready};
use astropix::*;

fn bench_layout() -> ConfigLayout {
    ConfigLayout::from_spec(LayoutSpec {
        name: "bench".to_string(),
        shift_msb_first: true,
        geometry: Geometry { cols: 4, rows: 4 },
        digital: vec![ParameterSpec::new("ResetB", 1, 0)],
        bias: vec![ParameterSpec::new("qon0", 1, 1)],
        dac: vec![ParameterSpec::new("threshold", 8, 0), ParameterSpec::new("vn1", 6, 20)],
    })
    .unwrap()
}

fn configured(options: SessionOptions) -> Session<SimulatedChip, AsicConfigured> {
    Session::open(SimulatedChip::new(), options)
        .unwrap()
        .asic_init(&AsicSettings::default(), None, false)
        .unwrap()
}

fn ready(sim: SimulatedChip, options: SessionOptions) -> Session<SimulatedChip, Ready> {
    Session::open(sim, options)
        .unwrap()
        .asic_init(&AsicSettings::default(), None, false)
        .unwrap()
        .init_voltages(VoltageBoardConfig::default())
        .unwrap()
        .enable_spi()
        .unwrap()
}

fn marker_options() -> SessionOptions {
    SessionOptions { frame_layout: FrameLayout::marker_triplet(), readout_bytes: 5, ..Default::default() }
}

#[test]
fn test_latched_config_matches_wire_stream() {
    let session = configured(SessionOptions::default());
    let expected = session.asic().encode().unwrap();

    assert_eq!(session.link().latched_config(), Some(expected.to_wire().as_bitslice()));
    assert_eq!(session.link().config_loads(), 1);
}

#[test]
fn test_threshold_scenario_on_bench_layout() {
    let options = SessionOptions { layout: bench_layout(), ..Default::default() };
    let mut session = configured(options);
    let before = session.asic().encode().unwrap();

    session.update_dac(&DacSettings::new().with("threshold", 200)).unwrap();
    let after = session.asic().encode().unwrap();
    let layout = session.asic().layout().clone();
    let slot = layout.slot(SectionKind::Dac, "threshold").unwrap().clone();

    assert_eq!(after.field(&layout, SectionKind::Dac, "threshold"), Some(200));
    for (i, (a, b)) in before.bits().iter().zip(after.bits().iter()).enumerate() {
        if !slot.range().contains(&i) {
            assert_eq!(*a, *b, "bit {} changed outside the threshold slot", i);
        }
    }
    assert_eq!(session.link().latched_config(), Some(after.to_wire().as_bitslice()));
}

#[test]
fn test_encoding_is_deterministic() {
    let encoder = ConfigEncoder::new(bench_layout());
    let dacs = DacSettings::new().with("threshold", 5);
    let bias = BiasSettings::new().with("qon0", 0);

    let first = encoder.encode(&dacs, &bias, None).unwrap();
    let second = encoder.encode(&dacs, &bias, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_bit_string(), second.to_bit_string());
}

#[test]
fn test_rejected_update_leaves_chip_untouched() {
    let options = SessionOptions { layout: bench_layout(), ..Default::default() };
    let mut session = configured(options);
    let writes = session.link().write_count();

    let err = session.update_dac(&DacSettings::new().with("threshold", 256)).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::ValueOutOfRange { .. })));
    let err = session.update_bias(&BiasSettings::new().with("nope", 1)).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::UnknownKey(_))));

    assert_eq!(session.link().write_count(), writes);
    assert_eq!(session.link().config_loads(), 1);
}

#[test]
fn test_mask_file_shape_checked() {
    let geometry = Geometry::ASTROPIX2;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for _ in 0..34 {
        writeln!(file, "{}", "0".repeat(35)).unwrap();
    }
    file.flush().unwrap();

    let err = DigitalMask::load_from_file(file.path(), geometry).unwrap_err();
    assert!(matches!(err, Error::MaskShape(MaskShapeError::RowCount { .. })));

    let mut good = tempfile::NamedTempFile::new().unwrap();
    for _ in 0..35 {
        writeln!(good, "{}", "0".repeat(35)).unwrap();
    }
    good.flush().unwrap();
    let mask = DigitalMask::load_from_file(good.path(), geometry).unwrap();

    let stream = ConfigEncoder::default()
        .encode(&DacSettings::new(), &BiasSettings::new(), Some(&mask))
        .unwrap();
    let layout = ConfigLayout::astropix2();
    assert!(stream.bits()[layout.mask_range()].not_any());
}

#[test]
fn test_marker_frame_end_to_end() {
    let mut sim = SimulatedChip::new();
    sim.push_readout(&[0xAA, 3, 7, 12, 0xBB]);
    let mut session = ready(sim, marker_options());

    assert!(session.hits_present().unwrap());
    let bytes = session.get_readout().unwrap();
    assert_eq!(bytes, vec![0xAA, 3, 7, 12, 0xBB]);

    let results = session.decode_readout(&bytes);
    assert_eq!(results.len(), 1);
    let hit = results[0].as_ref().unwrap();
    assert_eq!(hit.address, PixelAddress::Pixel { col: 3, row: 7 });
    assert_eq!(hit.tot, 12);
    assert!(hit.valid);
}

#[test]
fn test_decoder_resyncs_around_corrupt_frame() {
    let stream = [0xAA, 1, 2, 3, 0xBB, 0xAA, 9, 9, 9, 0x00, 0xAA, 4, 5, 6, 0xBB];
    let (hits, errors, stats) = decode_stream(&FrameLayout::marker_triplet(), &stream).unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(errors.len(), 1);
    assert_eq!(hits[1].address, PixelAddress::Pixel { col: 4, row: 5 });
    assert_eq!(stats.frames_decoded, 2);
    assert_eq!(stats.decode_errors, 1);
}

fn corrupted_frames(n: usize) -> Vec<u8> {
    (0..n).flat_map(|_| [0xAA, 1, 1, 1, 0xCC]).collect()
}

#[test]
fn test_run_stops_on_third_error_with_budget_two() {
    let mut sim = SimulatedChip::new();
    sim.push_readout(&corrupted_frames(5));
    let mut session = ready(sim, marker_options());

    let running = AtomicBool::new(true);
    let mut failures = Vec::new();
    let options = RunOptions { error_max: 2, ..Default::default() };
    let summary = session
        .run(&options, &running, |event| {
            if let ReadoutEvent::DecodeFailed { errors, .. } = event {
                failures.push(errors);
            }
        })
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::ErrorBudget);
    assert_eq!(summary.readouts, 3);
    assert_eq!(summary.decode_errors, 3);
    assert_eq!(failures, vec![1, 2, 3]);
}

#[test]
fn test_run_stops_on_first_error_with_budget_zero() {
    let mut sim = SimulatedChip::new();
    sim.push_readout(&[0xAA, 3, 7, 12, 0xBB]);
    sim.push_readout(&corrupted_frames(3));
    let mut session = ready(sim, marker_options());

    let running = AtomicBool::new(true);
    let mut hits = Vec::new();
    let summary = session
        .run(&RunOptions::default(), &running, |event| {
            if let ReadoutEvent::Hit { hit, .. } = event {
                hits.push(hit);
            }
        })
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::ErrorBudget);
    assert_eq!(summary.readouts, 2);
    assert_eq!(summary.hits, 1);
    assert_eq!(hits[0].tot, 12);
}

#[test]
fn test_injection_start_twice_writes_enable_once() {
    let mut session = ready(SimulatedChip::new(), SessionOptions::default());
    session.init_injection(InjectionConfig::default().with_amplitude_mv(300.0)).unwrap();

    session.start_injection().unwrap();
    let writes = session.link().write_count();
    session.start_injection().unwrap();

    assert_eq!(session.link().write_count(), writes);
    assert_eq!(session.injection_state(), Some(InjectionState::Injecting));
    assert!(session.link().latched_voltage_board(3).is_some());

    session.stop_injection().unwrap();
    assert!(!session.link().injecting());
}

#[test]
fn test_invalid_injection_rejected_before_writes() {
    let mut session = ready(SimulatedChip::new(), SessionOptions::default());
    let writes = session.link().write_count();

    let config = InjectionConfig { pulses_per_set: 0, ..Default::default() };
    assert!(matches!(session.init_injection(config), Err(Error::Injection(_))));
    assert_eq!(session.link().write_count(), writes);
    assert!(session.injection_state().is_none());
}

#[test]
fn test_injected_hits_decode_as_row_and_column() {
    let mut session = ready(SimulatedChip::new(), SessionOptions::default());
    session.init_injection(InjectionConfig::default()).unwrap();
    session.start_injection().unwrap();

    let bytes = session.get_readout().unwrap();
    let hits: Vec<HitRecord> = session.decode_readout(&bytes).into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].address, PixelAddress::Row(0));
    assert_eq!(hits[1].address, PixelAddress::Column(0));
    assert!(hits.iter().all(|h| h.valid && h.tot == 100 && h.payload == 4));
    assert!((hits[0].tot_us(DEFAULT_SAMPLE_CLOCK_NS) - 1.0).abs() < 1e-12);

    session.close().unwrap();
}

#[test]
fn test_replayed_log_decodes_like_live_stream() {
    let frames = astropix::transport::astropix_hit_frames(5, 9, 17, 0x123);
    let log = format!("layout: astropix2\n0\t{}\n1\tbcbcbc\n2\t{}\n", hex::encode(&frames), hex::encode(&frames[..3]));

    let mut replay = ReplayTransport::parse(&log).unwrap();
    let mut decoder = ReadoutDecoder::new(FrameLayout::astropix2()).unwrap();
    let mut hits = Vec::new();
    while replay.remaining() > 0 {
        while decoder.hits_present(&mut replay).unwrap() {
            let pending = replay.available().unwrap();
            let bytes = replay.read(pending).unwrap();
            hits.extend(decoder.feed(&bytes).into_iter().filter_map(|r| r.ok()));
        }
    }

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].address, PixelAddress::Row(9));
    assert_eq!(hits[1].address, PixelAddress::Column(5));
    assert_eq!(hits[1].timestamp, 17);
    assert_eq!(hits[1].tot, 0x123);
    assert!(matches!(decoder.finish(), Some(DecodeError::Truncated { have: 3, need: 5 })));
    assert_eq!(decoder.stats().idle_bytes, 3);
}
