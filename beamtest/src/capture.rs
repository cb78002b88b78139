/*!
Beam-test capture.

Two threads, as in any long capture:
1. Readout thread (the caller): drives the chip session and polls for hits
2. Writer thread: run log, CSV, hit map and terminal strips

The readout side never touches a file. Everything it produces goes over a
bounded channel, so a slow disk delays the writer but never a register
transaction.
*/

use anyhow::{anyhow, Context, Result};
use astropix::session::Ready;
use astropix::{
    DigitalMask, HitObserver, HitRecord, LogObserver, ReadoutEvent, RunOptions, RunSummary, Session, SessionOptions, SimulatedChip,
    TcpTransport, Transport,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::hitmap::HitMap;
use crate::output::{hittime, run_timestamp, HitCsv, OutputPaths, RunLog};

/// Message from the readout thread to the writer
#[derive(Debug, Clone)]
pub struct WriterMessage {
    pub event: ReadoutEvent,
    pub hittime: f64,
}

/// What the writer produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterStats {
    pub readouts: u64,
    pub hits: u64,
    pub failed_rows: u64,
    pub printed: u64,
}

/// Writer side of a run
pub struct RunWriter {
    log: RunLog<std::io::BufWriter<std::fs::File>>,
    csv: Option<HitCsv<std::fs::File>>,
    hitmap: Option<HitMap>,
    hitmap_path: Option<PathBuf>,
    printer: Option<LogObserver>,
    show_hits: bool,
    timeit: bool,
    event_hits: Vec<HitRecord>,
    stats: WriterStats,
}

impl RunWriter {
    pub fn create(config: &AppConfig, paths: &OutputPaths, header: &str, timeit: bool) -> Result<Self> {
        let log = RunLog::create(&paths.log, header)?;
        let csv = match &paths.csv {
            Some(path) => Some(HitCsv::create(path, config.run.sample_clock_ns)?),
            None => None,
        };
        let geometry = config.chip.frame_layout()?.geometry;
        let hitmap = (config.run.show_hits || config.run.plot_save).then(|| HitMap::new(geometry));
        Ok(Self {
            log,
            csv,
            hitmap,
            hitmap_path: paths.hitmap.clone(),
            printer: config.run.print_hits.then(|| LogObserver::new(config.run.sample_clock_ns)),
            show_hits: config.run.show_hits,
            timeit,
            event_hits: Vec::new(),
            stats: WriterStats::default(),
        })
    }

    fn handle(&mut self, message: WriterMessage) -> Result<()> {
        match message.event {
            ReadoutEvent::Readout { index, bytes } => {
                self.log.readout(index, &bytes)?;
                self.stats.readouts += 1;
                debug!("Readout {}: {}", index, hex::encode(&bytes));
            }
            ReadoutEvent::Hit { index, hit } => {
                if let Some(csv) = self.csv.as_mut() {
                    csv.hit(index, &hit, message.hittime)?;
                }
                if let Some(printer) = self.printer.as_mut() {
                    printer.on_hit(&hit);
                }
                self.stats.hits += 1;
                self.event_hits.push(hit);
            }
            ReadoutEvent::DecodeFailed { index, .. } => {
                if let Some(csv) = self.csv.as_mut() {
                    csv.failed(index, message.hittime)?;
                }
                self.stats.failed_rows += 1;
            }
            ReadoutEvent::Timing { index, elapsed } => {
                if let Some(map) = self.hitmap.as_mut() {
                    if self.show_hits && !self.event_hits.is_empty() {
                        println!("{}", map.ascii_event(index, &self.event_hits));
                    }
                    map.record_event(&self.event_hits);
                }
                self.event_hits.clear();
                if self.timeit {
                    info!("Read and decode took {:.6}s", elapsed.as_secs_f64());
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<WriterStats> {
        self.log.flush()?;
        if let Some(csv) = self.csv.as_mut() {
            csv.flush()?;
        }
        if let (Some(map), Some(path)) = (&self.hitmap, &self.hitmap_path) {
            map.save_json(path)?;
            info!("💾 Saved hit map: {}", path.display());
        }
        if let Some(printer) = &self.printer {
            self.stats.printed = printer.printed;
        }
        Ok(self.stats)
    }

    /// Drain the channel until every sender is gone
    pub fn run(mut self, rx: Receiver<WriterMessage>) -> Result<WriterStats> {
        for message in rx.iter() {
            self.handle(message)?;
        }
        self.finish()
    }
}

/// Beam-test run driver
pub struct BeamTest {
    config: AppConfig,
    inject: bool,
    timeit: bool,
    running: Arc<AtomicBool>,
}

impl BeamTest {
    pub fn new(config: AppConfig, inject: bool, timeit: bool) -> Self {
        Self { config, inject, timeit, running: Arc::new(AtomicBool::new(true)) }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn open_link(&self) -> Result<Box<dyn Transport>> {
        let connection = &self.config.connection;
        if connection.simulate {
            info!("🧪 Using the simulated chip");
            return Ok(Box::new(SimulatedChip::new()));
        }
        let addr: SocketAddr = connection
            .address
            .parse()
            .with_context(|| format!("Invalid bridge address: {}", connection.address))?;
        let link = TcpTransport::connect(addr, Duration::from_millis(connection.connect_timeout_ms))
            .with_context(|| format!("Failed to connect to bridge at {}", addr))?;
        info!("🔌 Connected to bridge at {}", addr);
        Ok(Box::new(link))
    }

    /// Open the chip and walk it through setup
    pub fn setup(&self) -> Result<Session<Box<dyn Transport>, Ready>> {
        let config = &self.config;
        let layout = config.chip.config_layout()?;
        let mask = match &config.run.mask {
            Some(path) => Some(
                DigitalMask::load_from_file(path, layout.geometry())
                    .with_context(|| format!("Failed to load mask: {}", path))?,
            ),
            None => None,
        };
        let options = SessionOptions {
            layout,
            frame_layout: config.chip.frame_layout()?,
            sr_clkdiv: config.connection.sr_clkdiv,
            read_timeout: Duration::from_millis(config.connection.read_timeout_ms),
            readout_bytes: config.connection.readout_bytes,
            ..Default::default()
        };

        let mut session = Session::open(self.open_link()?, options)?
            .asic_init(&config.asic, mask.as_ref(), self.inject)?
            .init_voltages(config.voltages.clone())?;
        if self.inject {
            session.init_injection(config.injection.clone())?;
        }
        let mut session = session.enable_spi()?;
        info!("✅ Chip configured");

        let stale = session.dump_fpga()?;
        if !stale.is_empty() {
            debug!("Discarded {} stale bytes", stale.len());
        }
        Ok(session)
    }

    /// Run the capture until max runs, the error budget or Ctrl+C
    pub fn start(&self) -> Result<RunSummary> {
        let run = &self.config.run;
        let outdir = PathBuf::from(&run.outdir);
        std::fs::create_dir_all(&outdir)
            .with_context(|| format!("Failed to create output directory: {}", outdir.display()))?;
        let paths = OutputPaths::new(&outdir, &run.name, &run_timestamp(), run.save_csv, run.plot_save);

        let mut session = self.setup()?;
        let writer = RunWriter::create(&self.config, &paths, &session.log_header(), self.timeit)?;
        info!("📝 Writing run log to {}", paths.log.display());

        let (tx, rx) = bounded::<WriterMessage>(run.channel_buffer_size.max(1));
        let writer_handle = thread::spawn(move || match writer.run(rx) {
            Ok(stats) => {
                info!("Writer thread finished successfully");
                Ok(stats)
            }
            Err(e) => {
                error!("Writer thread failed: {}", e);
                Err(e)
            }
        });

        let result = self.read_loop(&mut session, tx);

        if let Err(e) = session.close() {
            warn!("Closing the session failed: {}", e);
        }
        let stats = writer_handle.join().map_err(|_| anyhow!("Writer thread panicked"))??;
        let summary = result?;

        info!("📈 Run summary:");
        info!("   Readouts: {}", summary.readouts);
        info!("   Hits: {}", summary.hits);
        info!("   Decode errors: {}", summary.decode_errors);
        info!("   Stopped by: {:?}", summary.stop_reason);
        info!("   Lines written: {} log, {} csv failures", stats.readouts, stats.failed_rows);
        info!("   Hits printed: {}", stats.printed);
        Ok(summary)
    }

    fn read_loop(&self, session: &mut Session<Box<dyn Transport>, Ready>, tx: Sender<WriterMessage>) -> Result<RunSummary> {
        if self.inject {
            session.start_injection()?;
        }

        let run = &self.config.run;
        let options = RunOptions {
            max_runs: run.max_runs,
            error_max: run.error_max,
            poll_interval: Duration::from_millis(run.poll_ms),
            settle: Duration::from_millis(run.settle_ms),
        };

        let running = Arc::clone(&self.running);
        let summary = session.run(&options, &self.running, |event| {
            let message = WriterMessage { event, hittime: hittime() };
            if tx.send(message).is_err() {
                error!("Writer channel closed, stopping the run");
                running.store(false, Ordering::SeqCst);
            }
        })?;

        session.stop_injection()?;
        Ok(summary)
    }
}
