/*!
# Beam Test Application

Configures an AstroPix chip on its carrier board, reads out hits until a run
limit is reached and writes the readouts to a text log, with optional CSV and
hit-map outputs.

## Features

- Full chip setup: ASIC configuration, voltage boards, SPI readout path
- Analog mode or a digital mask file
- Optional charge injection
- Stops on a readout count, a decode error budget or Ctrl+C
- Offline decoding of recorded run logs
- Simulated chip for running without hardware

## Usage

### Run with hardware
```bash
beamtest run --connect 192.168.1.10:7 -n beam_ -o ./runs -t 100 -c
```

### Run against the simulator with injection
```bash
beamtest run --simulate -i -v 400 -M 100 -s
```

### Decode a recorded log
```bash
beamtest decode ./runs/beam_20240101-120000.log --csv hits.csv
```
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

mod capture;
mod config;
mod decode;
mod hitmap;
mod output;

use capture::BeamTest;
use config::AppConfig;
use decode::DecodeSink;
use output::HitCsv;

/// Single-letter log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    D,
    I,
    W,
    E,
    C,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::D => LevelFilter::DEBUG,
            LogLevel::I => LevelFilter::INFO,
            LogLevel::W => LevelFilter::WARN,
            // tracing has no level above error
            LogLevel::E | LogLevel::C => LevelFilter::ERROR,
        }
    }
}

#[derive(Parser)]
#[command(name = "beamtest")]
#[command(about = "AstroPix beam-test readout")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level: D(ebug), I(nfo), W(arning), E(rror), C(ritical)
    #[arg(short = 'L', long, value_enum, default_value = "i", ignore_case = true, global = true)]
    loglevel: LogLevel,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prefix of the output file names
    #[arg(short, long)]
    name: Option<String>,

    /// Output directory
    #[arg(short, long)]
    outdir: Option<String>,

    /// Digital mask file
    #[arg(short, long)]
    mask: Option<String>,

    /// Save decoded hits as CSV
    #[arg(short = 'c', long)]
    saveascsv: bool,

    /// Print the rows and columns of every event
    #[arg(short = 's', long)]
    showhits: bool,

    /// Save the accumulated hit map as JSON
    #[arg(short = 'p', long)]
    plotsave: bool,

    /// Threshold in mV [default: 100]
    #[arg(short = 't', long)]
    threshold: Option<f64>,

    /// Enable charge injection
    #[arg(short = 'i', long)]
    inject: bool,

    /// Injection amplitude in mV [default: 400]
    #[arg(short = 'v', long)]
    vinj: Option<f64>,

    /// Maximum number of readouts
    #[arg(short = 'M', long)]
    maxruns: Option<u64>,

    /// Decode errors tolerated before the run stops
    #[arg(short = 'E', long)]
    errormax: Option<u64>,

    /// Log the time taken by every readout
    #[arg(long)]
    timeit: bool,

    /// Use the simulated chip
    #[arg(long, conflicts_with = "connect")]
    simulate: bool,

    /// Bridge address
    #[arg(long)]
    connect: Option<String>,

    /// Chip configuration layout TOML
    #[arg(long)]
    chip: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the chip and record hits
    Run(RunArgs),

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "beamtest.toml")]
        output: PathBuf,
    },

    /// Decode a recorded run log
    Decode {
        /// Run log to decode
        log: PathBuf,

        /// Built-in frame layout
        #[arg(long, default_value = "astropix2")]
        layout: String,

        /// Frame layout TOML
        #[arg(long)]
        frame_file: Option<String>,

        /// Write CSV here instead of JSON lines on stdout
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Sample clock period in ns for the ToT conversion
        #[arg(long, default_value_t = astropix::DEFAULT_SAMPLE_CLOCK_NS)]
        sample_clock_ns: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr to keep stdout clean for hit output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.loglevel.filter())
        .init();

    match cli.command {
        Commands::Run(args) => run_capture(args),
        Commands::Config { output } => generate_config_file(output),
        Commands::Decode { log, layout, frame_file, csv, sample_clock_ns } => {
            run_decode(log, layout, frame_file, csv, sample_clock_ns)
        }
    }
}

/// Merge the configuration file with the command-line flags
fn build_config(args: &RunArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::new(),
    };

    if let Some(name) = &args.name {
        config.run.name = name.clone();
    }
    if let Some(outdir) = &args.outdir {
        config.run.outdir = outdir.clone();
    }
    if args.mask.is_some() {
        config.run.mask = args.mask.clone();
    }
    config.run.save_csv |= args.saveascsv;
    config.run.show_hits |= args.showhits;
    config.run.plot_save |= args.plotsave;
    if args.maxruns.is_some() {
        config.run.max_runs = args.maxruns;
    }
    if let Some(errormax) = args.errormax {
        config.run.error_max = errormax;
    }
    if args.simulate {
        config.connection.simulate = true;
    }
    if let Some(addr) = &args.connect {
        config.connection.simulate = false;
        config.connection.address = addr.clone();
    }
    if args.chip.is_some() {
        config.chip.layout_file = args.chip.clone();
    }

    if let Some(threshold) = args.threshold {
        config.voltages = config.voltages.with_threshold_mv(threshold);
    }
    if let Some(vinj) = args.vinj {
        config.injection = config.injection.with_amplitude_mv(vinj);
    }
    Ok(config)
}

fn run_capture(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    info!("🚀 Starting beam test ({})", if config.connection.simulate { "simulated" } else { "hardware" });

    let beam = BeamTest::new(config, args.inject, args.timeit);

    // Set up Ctrl+C handler
    let running = beam.get_running_flag();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    let summary = beam.start()?;
    info!("✅ Beam test completed ({:?})", summary.stop_reason);
    Ok(())
}

fn run_decode(
    log: PathBuf,
    layout: String,
    frame_file: Option<String>,
    csv: Option<PathBuf>,
    sample_clock_ns: f64,
) -> Result<()> {
    let chip = config::ChipConfig { layout_file: None, frame_layout: layout, frame_file };
    let frame_layout = chip.frame_layout()?;

    match csv {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create CSV: {}", path.display()))?;
            let mut sink = DecodeSink::Csv(HitCsv::new(file, sample_clock_ns));
            decode::decode_log(&log, frame_layout, &mut sink)?;
            info!("💾 Wrote {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut sink = DecodeSink::JsonLines(stdout.lock());
            decode::decode_log(&log, frame_layout, &mut sink)?;
        }
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    info!("✅ Generated configuration file: {}", output_path.display());
    info!("📝 Edit the file to customize settings, then run:");
    info!("   beamtest run --config {}", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut file_config = AppConfig::new();
        file_config.run.name = "file_".to_string();
        file_config.run.error_max = 5;
        file_config.save_to_file(&path).unwrap();

        let args = RunArgs {
            config: Some(path),
            errormax: Some(2),
            maxruns: Some(10),
            simulate: true,
            threshold: Some(150.0),
            vinj: Some(300.0),
            ..Default::default()
        };
        let config = build_config(&args).unwrap();

        assert_eq!(config.run.name, "file_");
        assert_eq!(config.run.error_max, 2);
        assert_eq!(config.run.max_runs, Some(10));
        assert!(config.connection.simulate);
        assert_eq!(config.voltages.vthreshold, Some(0.15));
        assert!((config.injection.amplitude_v - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["beamtest", "-L", "D", "run", "-i", "-v", "250", "-M", "3", "--simulate"]).unwrap();
        assert_eq!(cli.loglevel, LogLevel::D);
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert!(args.inject);
        assert_eq!(args.vinj, Some(250.0));
        assert_eq!(args.maxruns, Some(3));
        assert_eq!(args.threshold, None);
    }

    #[test]
    fn test_file_voltages_survive_without_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut file_config = AppConfig::new();
        file_config.voltages = file_config.voltages.with_threshold_mv(250.0);
        file_config.injection = file_config.injection.with_amplitude_mv(600.0);
        file_config.save_to_file(&path).unwrap();

        let cli = Cli::try_parse_from(["beamtest", "run", "--config", path.to_str().unwrap()]).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let config = build_config(&args).unwrap();

        assert_eq!(config.voltages.vthreshold, Some(0.25));
        assert!((config.injection.amplitude_v - 0.6).abs() < 1e-12);

        let defaults = build_config(&RunArgs::default()).unwrap();
        assert_eq!(defaults.voltages.vthreshold, Some(0.1));
        assert!((defaults.injection.amplitude_v - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_simulate_conflicts_with_connect() {
        assert!(Cli::try_parse_from(["beamtest", "run", "--simulate", "--connect", "1.2.3.4:7"]).is_err());
    }
}
