/*!
Typed chip session.

A session walks through its setup stages in order, and each stage is a
distinct type so that out-of-order use does not compile:

```text
open -> Opened -> asic_init -> AsicConfigured -> init_voltages -> VoltagesSet
     -> (init_injection)* -> enable_spi -> Ready
```

Settings can be updated from every stage after the ASIC is configured. Only a
`Ready` session reads out hits.
*/

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::budget::ErrorBudget;
use crate::config::{AsicConfig, AsicSettings, BiasSettings, DacSettings, DigitalSettings};
use crate::hit::HitRecord;
use crate::injection::{InjectionConfig, InjectionController, InjectionState};
use crate::layout::ConfigLayout;
use crate::mask::{DigitalMask, PixelConfig};
use crate::protocol::{RegisterProtocol, DEFAULT_SPI_CLKDIV, TEST_PATTERN};
use crate::readout::{DecodeError, DecoderStats, FrameLayout, FrameResult, ReadoutDecoder};
use crate::transport::Transport;
use crate::voltage::{Calibration, VoltageBoardConfig};
use crate::{Error, Result};

/// Transport opened, chip not configured
#[derive(Debug)]
pub struct Opened;

/// ASIC configuration loaded
#[derive(Debug)]
pub struct AsicConfigured;

/// Bias voltages applied
#[derive(Debug)]
pub struct VoltagesSet;

/// Readout path enabled
#[derive(Debug)]
pub struct Ready;

/// Stages in which the ASIC configuration exists
pub trait Configured {}
impl Configured for AsicConfigured {}
impl Configured for VoltagesSet {}
impl Configured for Ready {}

/// Stages in which the voltage boards are powered
pub trait Powered: Configured {}
impl Powered for VoltagesSet {}
impl Powered for Ready {}

/// Session construction parameters
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub layout: ConfigLayout,
    pub frame_layout: FrameLayout,
    /// Repetitions of every shift-register pin state
    pub sr_clkdiv: usize,
    pub read_timeout: Duration,
    /// Bytes clocked out of the chip per readout
    pub readout_bytes: usize,
    /// Bytes the link must hold before hits count as present
    pub min_pending: usize,
    /// Also ask the chip's interrupt line when the link is empty
    pub poll_interrupt: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            layout: ConfigLayout::astropix2(),
            frame_layout: FrameLayout::astropix2(),
            sr_clkdiv: 16,
            read_timeout: Duration::from_secs(1),
            readout_bytes: 20,
            min_pending: 1,
            poll_interrupt: true,
        }
    }
}

/// Readout loop parameters
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after this many readouts
    pub max_runs: Option<u64>,
    /// Decode errors tolerated before the loop stops
    pub error_max: u64,
    /// Sleep between polls while no hits are present
    pub poll_interval: Duration,
    /// Wait between seeing hits and reading them
    pub settle: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_runs: None,
            error_max: 0,
            poll_interval: Duration::from_millis(1),
            settle: Duration::ZERO,
        }
    }
}

/// Events emitted by [`Session::run`], in stream order
#[derive(Debug, Clone, PartialEq)]
pub enum ReadoutEvent {
    Readout { index: u64, bytes: Vec<u8> },
    Hit { index: u64, hit: HitRecord },
    DecodeFailed { index: u64, error: DecodeError, errors: u64 },
    Timing { index: u64, elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxRuns,
    ErrorBudget,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub readouts: u64,
    pub hits: u64,
    pub decode_errors: u64,
    pub stop_reason: StopReason,
}

/// A chip session in stage `S`
#[derive(Debug)]
pub struct Session<T: Transport, S> {
    proto: RegisterProtocol<T>,
    asic: AsicConfig,
    decoder: ReadoutDecoder,
    voltages: Option<VoltageBoardConfig>,
    injection: Option<InjectionController>,
    options: SessionOptions,
    _stage: PhantomData<S>,
}

impl<T: Transport, S> Session<T, S> {
    fn into_stage<N>(self) -> Session<T, N> {
        Session {
            proto: self.proto,
            asic: self.asic,
            decoder: self.decoder,
            voltages: self.voltages,
            injection: self.injection,
            options: self.options,
            _stage: PhantomData,
        }
    }

    pub fn link(&self) -> &T {
        self.proto.link()
    }

    pub fn link_mut(&mut self) -> &mut T {
        self.proto.link_mut()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Stop any injection and close the transport
    pub fn close(mut self) -> Result<()> {
        if let Some(injection) = self.injection.as_mut() {
            injection.stop(&mut self.proto)?;
        }
        self.proto.close()?;
        info!("Session closed");
        Ok(())
    }
}

impl<T: Transport> Session<T, Opened> {
    /// Open a session: I/O test, then SPI reset
    pub fn open(link: T, options: SessionOptions) -> Result<Self> {
        let mut proto = RegisterProtocol::new(link)
            .with_sr_clkdiv(options.sr_clkdiv)
            .with_read_timeout(options.read_timeout);

        let read = proto.test_io()?;
        if read != TEST_PATTERN {
            return Err(Error::TestIo { wrote: TEST_PATTERN, read });
        }
        proto.spi_reset()?;

        let decoder = ReadoutDecoder::new(options.frame_layout.clone())?.with_min_pending(options.min_pending);
        let asic = AsicConfig::new(options.layout.clone(), false);
        info!("Session opened ({} layout)", options.layout.name());

        Ok(Self {
            proto,
            asic,
            decoder,
            voltages: None,
            injection: None,
            options,
            _stage: PhantomData,
        })
    }

    pub fn chip_reset(&mut self) -> Result<()> {
        self.proto.chip_reset()?;
        Ok(())
    }

    /// Encode and load the first configuration. Without a mask the matrix runs in analog mode.
    pub fn asic_init(
        mut self,
        settings: &AsicSettings,
        mask: Option<&DigitalMask>,
        inject: bool,
    ) -> Result<Session<T, AsicConfigured>> {
        let layout = self.options.layout.clone();
        let mut asic = match mask {
            Some(mask) => AsicConfig::with_mask(layout, mask, inject)?,
            None => AsicConfig::new(layout, inject),
        };
        asic.apply_settings(settings)?;
        let stream = asic.encode()?;

        self.proto.load_config(&stream)?;
        self.asic = asic;
        info!("ASIC configured ({} bits)", stream.len());
        Ok(self.into_stage())
    }
}

impl<T: Transport, S: Configured> Session<T, S> {
    pub fn asic(&self) -> &AsicConfig {
        &self.asic
    }

    /// Pixel registers; changes take effect on [`Session::asic_update`]
    pub fn pixels_mut(&mut self) -> &mut PixelConfig {
        self.asic.pixels_mut()
    }

    /// Re-encode the current configuration and load it
    pub fn asic_update(&mut self) -> Result<()> {
        let stream = self.asic.encode()?;
        self.proto.load_config(&stream)?;
        debug!("ASIC configuration reloaded");
        Ok(())
    }

    pub fn update_dac(&mut self, dacs: &DacSettings) -> Result<()> {
        self.asic.update_dac(dacs)?;
        self.asic_update()
    }

    pub fn update_bias(&mut self, bias: &BiasSettings) -> Result<()> {
        self.asic.update_bias(bias)?;
        self.asic_update()
    }

    pub fn update_digital(&mut self, digital: &DigitalSettings) -> Result<()> {
        self.asic.update_digital(digital)?;
        self.asic_update()
    }

    /// Text header for run logs
    pub fn log_header(&self) -> String {
        let mut header = self.asic.log_header();
        if let Some(vb) = &self.voltages {
            header.push_str(&format!(
                "voltages: slot={} vcal={} vsupply={} dacs={:?}\n",
                vb.slot,
                vb.calibration.vcal,
                vb.calibration.vsupply,
                vb.effective_dacs()
            ));
        }
        if let Some(injection) = &self.injection {
            header.push_str(&format!("injection: {:?}\n", injection.config()));
        }
        header
    }
}

impl<T: Transport> Session<T, AsicConfigured> {
    /// Load the bias voltage board
    pub fn init_voltages(mut self, config: VoltageBoardConfig) -> Result<Session<T, VoltagesSet>> {
        let codes = config.validate()?;
        self.proto.load_voltage_board(codes.slot, &codes.to_bits())?;
        info!("Voltage board in slot {} set", codes.slot);
        self.voltages = Some(config);
        Ok(self.into_stage())
    }
}

impl<T: Transport, S: Powered> Session<T, S> {
    /// Validate and store injection settings; nothing is written until injection starts
    pub fn init_injection(&mut self, config: InjectionConfig) -> Result<()> {
        let calibration = self.voltages.as_ref().map(|v| v.calibration).unwrap_or_default();
        config.plan(calibration)?;
        if let Some(old) = self.injection.as_mut() {
            old.stop(&mut self.proto)?;
        }
        self.injection = Some(InjectionController::new(config, calibration));
        Ok(())
    }

    pub fn injection_state(&self) -> Option<InjectionState> {
        self.injection.as_ref().map(|i| i.state())
    }

    pub fn calibration(&self) -> Calibration {
        self.voltages.as_ref().map(|v| v.calibration).unwrap_or_default()
    }
}

impl<T: Transport> Session<T, VoltagesSet> {
    /// Enable the readout path: SPI on, reset, clock divider, routing
    pub fn enable_spi(mut self) -> Result<Session<T, Ready>> {
        self.proto.spi_enable(true)?;
        self.proto.spi_reset()?;
        self.proto.spi_clkdiv(DEFAULT_SPI_CLKDIV)?;
        self.proto.send_routing_cmd()?;
        info!("SPI enabled");
        Ok(self.into_stage())
    }
}

impl<T: Transport> Session<T, Ready> {
    /// Cheap probe for pending readout data
    pub fn hits_present(&mut self) -> Result<bool> {
        if self.decoder.hits_present(self.proto.link_mut())? {
            return Ok(true);
        }
        if self.options.poll_interrupt {
            return Ok(self.proto.interrupt_pending()?);
        }
        Ok(false)
    }

    /// Clock a readout out of the chip and collect it
    pub fn get_readout(&mut self) -> Result<Vec<u8>> {
        self.proto.clock_out(self.options.readout_bytes)?;
        Ok(self.proto.drain()?)
    }

    /// Empty the bridge buffer
    pub fn dump_fpga(&mut self) -> Result<Vec<u8>> {
        let bytes = self.proto.drain()?;
        debug!("Dumped {} bytes from the bridge", bytes.len());
        Ok(bytes)
    }

    /// Decode bytes with the session decoder; partial frames carry over
    pub fn decode_readout(&mut self, bytes: &[u8]) -> Vec<FrameResult> {
        self.decoder.feed(bytes)
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    pub fn start_injection(&mut self) -> Result<()> {
        let injection = self
            .injection
            .as_mut()
            .ok_or_else(|| Error::not_ready("init_injection has not been called"))?;
        injection.start(&mut self.proto)
    }

    pub fn stop_injection(&mut self) -> Result<()> {
        match self.injection.as_mut() {
            Some(injection) => injection.stop(&mut self.proto),
            None => Ok(()),
        }
    }

    /// Readout loop.
    ///
    /// Polls for hits, reads and decodes them and reports every step through
    /// `on_event`. Stops on `max_runs`, on an exhausted error budget or when
    /// `running` is cleared. No read is issued once the budget is exceeded.
    pub fn run<F>(&mut self, options: &RunOptions, running: &AtomicBool, mut on_event: F) -> Result<RunSummary>
    where
        F: FnMut(ReadoutEvent),
    {
        let mut budget = ErrorBudget::new(options.error_max);
        let mut readouts = 0u64;
        let mut hits = 0u64;

        let stop_reason = loop {
            if !running.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            if budget.exceeded() {
                break StopReason::ErrorBudget;
            }
            if options.max_runs.is_some_and(|max| readouts >= max) {
                break StopReason::MaxRuns;
            }

            if !self.hits_present()? {
                thread::sleep(options.poll_interval);
                continue;
            }
            if !options.settle.is_zero() {
                thread::sleep(options.settle);
            }

            let started = Instant::now();
            let index = readouts;
            let bytes = self.get_readout()?;
            readouts += 1;
            let results = self.decoder.feed(&bytes);
            on_event(ReadoutEvent::Readout { index, bytes });

            for result in results {
                match result {
                    Ok(hit) => {
                        hits += 1;
                        on_event(ReadoutEvent::Hit { index, hit });
                    }
                    Err(error) => {
                        let errors = budget.record_error();
                        warn!("Decoding failed. Failure {} of {} on readout {}: {}", errors, budget.max(), index, error);
                        on_event(ReadoutEvent::DecodeFailed { index, error, errors });
                    }
                }
            }
            on_event(ReadoutEvent::Timing { index, elapsed: started.elapsed() });
        };

        info!("Readout loop stopped ({:?}) after {} readouts, {} hits", stop_reason, readouts, hits);
        Ok(RunSummary { readouts, hits, decode_errors: budget.count(), stop_reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SectionKind;
    use crate::transport::SimulatedChip;

    fn ready_session() -> Session<SimulatedChip, Ready> {
        Session::open(SimulatedChip::new(), SessionOptions::default())
            .unwrap()
            .asic_init(&AsicSettings::default(), None, true)
            .unwrap()
            .init_voltages(VoltageBoardConfig::default())
            .unwrap()
            .enable_spi()
            .unwrap()
    }

    #[test]
    fn test_setup_sequence_loads_hardware() {
        let session = ready_session();
        let sim = session.link();

        assert_eq!(sim.config_loads(), 1);
        assert_eq!(sim.latched_config().map(|b| b.len()), Some(1485));
        assert_eq!(sim.latched_voltage_board(4).map(|b| b.len()), Some(128));
        assert_eq!(sim.register(crate::protocol::registers::SPI_CLKDIV), DEFAULT_SPI_CLKDIV);
    }

    #[test]
    fn test_open_fails_on_bad_io() {
        let mut sim = SimulatedChip::new();
        sim.set_unresponsive(true);
        let options = SessionOptions { read_timeout: Duration::from_millis(5), ..Default::default() };
        assert!(matches!(Session::open(sim, options), Err(Error::Transport(_))));
    }

    #[test]
    fn test_update_dac_reloads() {
        let mut session = ready_session();
        session.update_dac(&DacSettings::new().with("vn1", 7)).unwrap();
        assert_eq!(session.link().config_loads(), 2);
        assert_eq!(session.asic().value(SectionKind::Dac, "vn1"), Some(7));

        assert!(session.update_dac(&DacSettings::new().with("vn1", 99)).is_err());
        assert_eq!(session.link().config_loads(), 2);
    }

    #[test]
    fn test_start_injection_requires_init() {
        let mut session = ready_session();
        assert!(matches!(session.start_injection(), Err(Error::NotReady(_))));

        session.init_injection(InjectionConfig::default()).unwrap();
        session.start_injection().unwrap();
        assert_eq!(session.injection_state(), Some(InjectionState::Injecting));
        assert!(session.link().injecting());
        session.close().unwrap();
    }

    #[test]
    fn test_run_collects_injected_hits() {
        let mut session = ready_session();
        session.init_injection(InjectionConfig::default()).unwrap();
        session.start_injection().unwrap();

        let running = AtomicBool::new(true);
        let mut events = Vec::new();
        let options = RunOptions { max_runs: Some(3), ..Default::default() };
        let summary = session.run(&options, &running, |e| events.push(e)).unwrap();

        assert_eq!(summary.stop_reason, StopReason::MaxRuns);
        assert_eq!(summary.readouts, 3);
        assert_eq!(summary.hits, 6);
        assert_eq!(summary.decode_errors, 0);
        assert!(matches!(events[0], ReadoutEvent::Readout { index: 0, .. }));
    }

    #[test]
    fn test_run_stops_when_interrupted() {
        let mut session = ready_session();
        let running = AtomicBool::new(false);
        let summary = session.run(&RunOptions::default(), &running, |_| {}).unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(summary.readouts, 0);
    }
}
