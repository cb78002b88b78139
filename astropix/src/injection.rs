/*!
Injection pulse generator.

The controller validates every timing parameter before touching the hardware,
so a rejected configuration never leaves a partial write behind. Starting an
injection that is already running is a no-op.
*/

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::{registers, RegisterProtocol};
use crate::transport::Transport;
use crate::voltage::{Calibration, VoltageBoardConfig, VoltageCodes, VoltageConfigError, SLOTS};

/// Injection enable bit in `INJ_CONTROL`
pub const INJ_ENABLE: u8 = 0x01;

const PERIOD_RANGE: RangeInclusive<i64> = 1..=255;
const CLKDIV_RANGE: RangeInclusive<i64> = 1..=65535;
const INITDELAY_RANGE: RangeInclusive<i64> = 0..=65535;
const CYCLE_RANGE: RangeInclusive<i64> = 0..=65535;
const PULSES_RANGE: RangeInclusive<i64> = 1..=255;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InjectionConfigError {
    #[error("{param} = {value} is outside {min}..={max}")]
    OutOfRange { param: &'static str, value: i64, min: i64, max: i64 },

    #[error("injection board position {0} is not a carrier slot (1..=8)")]
    InvalidPosition(u8),

    #[error("injection voltage: {0}")]
    Voltage(#[from] VoltageConfigError),
}

/// Injection settings as given by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Pulse amplitude in volts
    pub amplitude_v: f64,
    pub offset_v: f64,
    /// Carrier slot of the injection voltage board
    pub position: u8,
    pub period: i64,
    pub clkdiv: i64,
    pub initdelay: i64,
    pub cycle: i64,
    pub pulses_per_set: i64,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            amplitude_v: 0.4,
            offset_v: 0.0,
            position: 3,
            period: 100,
            clkdiv: 400,
            initdelay: 10000,
            cycle: 0,
            pulses_per_set: 1,
        }
    }
}

fn check(param: &'static str, value: i64, range: RangeInclusive<i64>) -> Result<i64, InjectionConfigError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(InjectionConfigError::OutOfRange { param, value, min: *range.start(), max: *range.end() })
    }
}

impl InjectionConfig {
    /// Amplitude given in millivolts, as on the command line
    pub fn with_amplitude_mv(mut self, millivolts: f64) -> Self {
        self.amplitude_v = millivolts / 1000.0;
        self
    }

    /// Range-check the timing parameters
    pub fn validate(&self) -> Result<InjectionTiming, InjectionConfigError> {
        Ok(InjectionTiming {
            period: check("period", self.period, PERIOD_RANGE)? as u8,
            clkdiv: check("clkdiv", self.clkdiv, CLKDIV_RANGE)? as u16,
            initdelay: check("initdelay", self.initdelay, INITDELAY_RANGE)? as u16,
            cycle: check("cycle", self.cycle, CYCLE_RANGE)? as u16,
            pulses_per_set: check("pulses_per_set", self.pulses_per_set, PULSES_RANGE)? as u8,
        })
    }

    /// The two-DAC board that produces the pulse amplitude and offset
    pub fn voltage_board(&self, calibration: Calibration) -> VoltageBoardConfig {
        VoltageBoardConfig {
            slot: self.position,
            calibration,
            vthreshold: None,
            dacs: vec![self.amplitude_v, self.offset_v],
        }
    }

    /// Validate everything needed for a start
    pub fn plan(&self, calibration: Calibration) -> Result<InjectionPlan, InjectionConfigError> {
        if !SLOTS.contains(&self.position) {
            return Err(InjectionConfigError::InvalidPosition(self.position));
        }
        let timing = self.validate()?;
        let voltages = self.voltage_board(calibration).validate()?;
        Ok(InjectionPlan { timing, voltages })
    }
}

/// Range-checked timing block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionTiming {
    pub period: u8,
    pub clkdiv: u16,
    pub initdelay: u16,
    pub cycle: u16,
    pub pulses_per_set: u8,
}

impl InjectionTiming {
    /// Register block written at `INJ_BASE`
    pub fn to_registers(&self) -> [u8; 8] {
        let [cycle_hi, cycle_lo] = self.cycle.to_be_bytes();
        let [clkdiv_hi, clkdiv_lo] = self.clkdiv.to_be_bytes();
        let [delay_hi, delay_lo] = self.initdelay.to_be_bytes();
        [self.period, cycle_hi, cycle_lo, clkdiv_hi, clkdiv_lo, delay_hi, delay_lo, self.pulses_per_set]
    }
}

/// Everything a start writes, already validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPlan {
    pub timing: InjectionTiming,
    pub voltages: VoltageCodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionState {
    Idle,
    Armed,
    Injecting,
}

/// Sequences injection configuration and enable
#[derive(Debug, Clone)]
pub struct InjectionController {
    config: InjectionConfig,
    calibration: Calibration,
    state: InjectionState,
}

impl InjectionController {
    pub fn new(config: InjectionConfig, calibration: Calibration) -> Self {
        Self { config, calibration, state: InjectionState::Idle }
    }

    pub fn config(&self) -> &InjectionConfig {
        &self.config
    }

    pub fn state(&self) -> InjectionState {
        self.state
    }

    /// Write the injection voltages and timing without enabling
    pub fn arm<T: Transport>(&mut self, proto: &mut RegisterProtocol<T>) -> crate::Result<()> {
        let plan = self.config.plan(self.calibration)?;
        proto.load_voltage_board(plan.voltages.slot, &plan.voltages.to_bits())?;
        proto.write_registers(registers::INJ_BASE, &plan.timing.to_registers())?;
        self.state = InjectionState::Armed;
        debug!("Injection armed: {:?}", plan.timing);
        Ok(())
    }

    /// Arm and enable; a no-op while already injecting
    pub fn start<T: Transport>(&mut self, proto: &mut RegisterProtocol<T>) -> crate::Result<()> {
        if self.state == InjectionState::Injecting {
            debug!("Injection already running");
            return Ok(());
        }
        self.arm(proto)?;
        proto.write_register(registers::INJ_CONTROL, INJ_ENABLE)?;
        self.state = InjectionState::Injecting;
        info!("Began injection ({} V at slot {})", self.config.amplitude_v, self.config.position);
        Ok(())
    }

    pub fn stop<T: Transport>(&mut self, proto: &mut RegisterProtocol<T>) -> crate::Result<()> {
        if self.state == InjectionState::Idle {
            return Ok(());
        }
        proto.write_register(registers::INJ_CONTROL, 0)?;
        self.state = InjectionState::Idle;
        info!("Stopped injection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedChip;
    use crate::Error;

    #[test]
    fn test_timing_registers() {
        let timing = InjectionConfig::default().validate().unwrap();
        assert_eq!(timing.to_registers(), [100, 0, 0, 0x01, 0x90, 0x27, 0x10, 1]);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let config = InjectionConfig { period: -1, ..Default::default() };
        assert_eq!(
            config.validate(),
            Err(InjectionConfigError::OutOfRange { param: "period", value: -1, min: 1, max: 255 })
        );

        let config = InjectionConfig { clkdiv: 70000, ..Default::default() };
        assert!(matches!(config.validate(), Err(InjectionConfigError::OutOfRange { param: "clkdiv", .. })));

        let config = InjectionConfig { position: 0, ..Default::default() };
        assert_eq!(config.plan(Calibration::default()), Err(InjectionConfigError::InvalidPosition(0)));
    }

    #[test]
    fn test_invalid_config_writes_nothing() {
        let mut proto = RegisterProtocol::new(SimulatedChip::new());
        let mut controller =
            InjectionController::new(InjectionConfig { clkdiv: 0, ..Default::default() }, Calibration::default());

        assert!(matches!(controller.start(&mut proto), Err(Error::Injection(_))));
        assert_eq!(proto.link().write_count(), 0);
        assert_eq!(controller.state(), InjectionState::Idle);
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut proto = RegisterProtocol::new(SimulatedChip::new());
        let mut controller = InjectionController::new(InjectionConfig::default(), Calibration::default());

        controller.start(&mut proto).unwrap();
        assert_eq!(controller.state(), InjectionState::Injecting);
        assert!(proto.link().injecting());
        let writes = proto.link().write_count();

        controller.start(&mut proto).unwrap();
        assert_eq!(proto.link().write_count(), writes);

        assert_eq!(proto.link().register(registers::INJ_BASE), 100);
        assert_eq!(proto.link().latched_voltage_board(3).map(|b| b.len()), Some(32));

        controller.stop(&mut proto).unwrap();
        assert_eq!(controller.state(), InjectionState::Idle);
        assert!(!proto.link().injecting());

        let writes = proto.link().write_count();
        controller.stop(&mut proto).unwrap();
        assert_eq!(proto.link().write_count(), writes);
    }
}
