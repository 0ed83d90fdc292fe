//! EDL electronic load.
//!
//! Setpoints: enable (0), current (1), power (3), undervoltage lockout (4),
//! resistance (5), operating range (19), ramped current (21), ripple on/off
//! time and amplitude (27/28/29), display menu (80) and trigger mode (240).
//!
//! Measurements: charge (7), energy (8), voltage/current with the load on
//! (10/11) and off (15/16), power (18) and temperature (233). Requesting
//! channel 99 makes the module report everything at once. The counters are
//! zeroed by writing 0 to channel 8 (charge) and 9 (energy).
//!
//! Range and display codes are enumerations. A caller passing an unknown code
//! gets `InvalidParameter` before any I/O; a module reporting one is treated
//! as a device fault (`Communication`).
//!
//! The trigger mode is a 2-bit field mirrored locally. Toggling a bit only
//! writes when the resulting mask differs from the mirror.

use crate::connection::Connection;
use crate::error::{CtlabError, CtlabResult, DecodeError};
use crate::module::{decode_common, ChannelDecoder, ChannelValue, Module};
use crate::protocol::RawValue;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Load enable flag.
pub const ENABLED: u8 = 0;
/// Current setpoint.
pub const CURRENT: u8 = 1;
/// Power setpoint.
pub const POWER: u8 = 3;
/// Undervoltage lockout threshold.
pub const UNDERVOLTAGE: u8 = 4;
/// Resistance setpoint.
pub const RESISTANCE: u8 = 5;
/// Accumulated charge.
pub const CHARGE: u8 = 7;
/// Accumulated energy.
pub const ENERGY: u8 = 8;
/// Writing 0 zeroes the charge counter. Reset channels differ from the
/// channels the counters are read from.
pub const RESET_CHARGE: u8 = 8;
/// Writing 0 zeroes the energy counter.
pub const RESET_ENERGY: u8 = 9;
/// Measured voltage, load on.
pub const VOLTAGE_ON: u8 = 10;
/// Measured current, load on.
pub const CURRENT_ON: u8 = 11;
/// Measured voltage, load off.
pub const VOLTAGE_OFF: u8 = 15;
/// Measured current, load off.
pub const CURRENT_OFF: u8 = 16;
/// Measured power.
pub const MEASURED_POWER: u8 = 18;
/// Operating range.
pub const RANGE: u8 = 19;
/// Ramped current target.
pub const RAMP_CURRENT: u8 = 21;
/// Ripple on time.
pub const RIPPLE_ON: u8 = 27;
/// Ripple off time.
pub const RIPPLE_OFF: u8 = 28;
/// Ripple amplitude.
pub const RIPPLE_AMPLITUDE: u8 = 29;
/// Display menu.
pub const DISPLAY: u8 = 80;
/// Report all measurements.
pub const REQUEST_ALL: u8 = 99;
/// Heat sink temperature.
pub const TEMPERATURE: u8 = 233;
/// Trigger mode bitmask.
pub const TRIGGER_MODE: u8 = 240;

/// Trigger mode bit: external trigger input.
pub const TRIGGER_INPUT: u8 = 0x01;
/// Trigger mode bit: automatic trigger.
pub const AUTO_TRIGGER: u8 = 0x02;
const TRIGGER_MASK: u8 = TRIGGER_INPUT | AUTO_TRIGGER;

const CALIBRATION_ARGS: &[u8] = &[2, 3, 4, 5, 10, 11, 12, 13, 14, 15];

/// Operating range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadRange {
    /// Load disconnected
    Off,
    /// Constant current, high range
    CurrentHigh,
    /// Constant current, low range
    CurrentLow,
    /// Constant resistance, high range
    ResistanceHigh,
    /// Constant resistance, low range
    ResistanceLow,
    /// Constant power, high range
    PowerHigh,
    /// Constant power, low range
    PowerLow,
}

impl LoadRange {
    /// All ranges in code order.
    pub const ALL: [LoadRange; 7] = [
        LoadRange::Off,
        LoadRange::CurrentHigh,
        LoadRange::CurrentLow,
        LoadRange::ResistanceHigh,
        LoadRange::ResistanceLow,
        LoadRange::PowerHigh,
        LoadRange::PowerLow,
    ];

    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Range for a wire code.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}

/// Display menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadDisplay {
    /// Current
    Current,
    /// Voltage
    Voltage,
    /// Operating mode
    Mode,
    /// Ripple on time
    RippleOnTime,
    /// Ripple off time
    RippleOffTime,
    /// Ripple off current
    RippleOffCurrent,
    /// Tracking
    Track,
}

impl LoadDisplay {
    /// All menus in code order.
    pub const ALL: [LoadDisplay; 7] = [
        LoadDisplay::Current,
        LoadDisplay::Voltage,
        LoadDisplay::Mode,
        LoadDisplay::RippleOnTime,
        LoadDisplay::RippleOffTime,
        LoadDisplay::RippleOffCurrent,
        LoadDisplay::Track,
    ];

    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Menu for a wire code.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}

#[derive(Debug, Default)]
struct EdlDecoder {
    trigger_mode: AtomicU8,
}

impl EdlDecoder {
    fn trigger_mode(&self) -> u8 {
        self.trigger_mode.load(Ordering::SeqCst)
    }

    fn store_trigger_mode(&self, mode: u8) {
        self.trigger_mode.store(mode, Ordering::SeqCst);
    }
}

impl ChannelDecoder for EdlDecoder {
    fn profile(&self) -> &'static str {
        "edl"
    }

    fn decode(
        &self,
        channel: u8,
        value: &RawValue,
        comment: Option<&str>,
    ) -> Result<ChannelValue, DecodeError> {
        match channel {
            ENABLED => Ok(ChannelValue::Flag(value.as_flag()?)),
            CURRENT | POWER | UNDERVOLTAGE | RESISTANCE | CHARGE | ENERGY | VOLTAGE_ON
            | CURRENT_ON | VOLTAGE_OFF | CURRENT_OFF | MEASURED_POWER | RAMP_CURRENT
            | TEMPERATURE => Ok(ChannelValue::Float(value.as_f64()?)),
            RIPPLE_ON | RIPPLE_OFF | RIPPLE_AMPLITUDE => Ok(ChannelValue::Integer(value.as_integer()?)),
            RANGE => {
                let code = value.as_integer()?;
                LoadRange::from_code(code)
                    .map(|_| ChannelValue::Integer(code))
                    .ok_or_else(|| DecodeError::new(format!("rng = {code}")))
            }
            DISPLAY => {
                let code = value.as_integer()?;
                LoadDisplay::from_code(code)
                    .map(|_| ChannelValue::Integer(code))
                    .ok_or_else(|| DecodeError::new(format!("dsp = {code}")))
            }
            TRIGGER_MODE => {
                let code = value.as_integer()?;
                let mode = u8::try_from(code)
                    .ok()
                    .filter(|mode| mode & !TRIGGER_MASK == 0)
                    .ok_or_else(|| DecodeError::new(format!("trm = {code}")))?;
                self.store_trigger_mode(mode);
                Ok(ChannelValue::Integer(code))
            }
            _ => decode_common(channel, value, comment),
        }
    }
}

/// EDL electronic load.
#[derive(Debug, Clone)]
pub struct ElectronicLoad {
    module: Module,
    decoder: Arc<EdlDecoder>,
}

impl ElectronicLoad {
    /// Register an EDL with bus id `id` on `connection`.
    pub fn new(id: u8, connection: &Arc<Connection>) -> CtlabResult<Self> {
        let decoder = Arc::new(EdlDecoder::default());
        let module = Module::with_decoder(
            id,
            connection,
            Arc::clone(&decoder) as Arc<dyn ChannelDecoder>,
            CALIBRATION_ARGS,
        )?;
        Ok(Self { module, decoder })
    }

    /// The underlying module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    // -------------------------------------------------------------------------
    // Setpoints
    // -------------------------------------------------------------------------

    /// Switch the load on or off.
    pub async fn set_enabled(&self, enabled: bool) -> CtlabResult<()> {
        self.module.set(ENABLED, enabled, false).await
    }

    /// Set the current setpoint.
    pub async fn set_current(&self, amps: f64) -> CtlabResult<()> {
        self.module.set(CURRENT, amps, false).await
    }

    /// Set the power setpoint.
    pub async fn set_power(&self, watts: f64) -> CtlabResult<()> {
        self.module.set(POWER, watts, false).await
    }

    /// Set the undervoltage lockout threshold.
    pub async fn set_undervoltage(&self, volts: f64) -> CtlabResult<()> {
        self.module.set(UNDERVOLTAGE, volts, false).await
    }

    /// Set the resistance setpoint.
    pub async fn set_resistance(&self, ohms: f64) -> CtlabResult<()> {
        self.module.set(RESISTANCE, ohms, false).await
    }

    /// Ramp the current towards `amps`.
    pub async fn set_ramp_current(&self, amps: f64) -> CtlabResult<()> {
        self.module.set(RAMP_CURRENT, amps, false).await
    }

    /// Set the ripple on time.
    pub async fn set_ripple_on(&self, value: u32) -> CtlabResult<()> {
        self.module.set(RIPPLE_ON, i64::from(value), false).await
    }

    /// Set the ripple off time.
    pub async fn set_ripple_off(&self, value: u32) -> CtlabResult<()> {
        self.module.set(RIPPLE_OFF, i64::from(value), false).await
    }

    /// Set the ripple amplitude.
    pub async fn set_ripple_amplitude(&self, value: u32) -> CtlabResult<()> {
        self.module.set(RIPPLE_AMPLITUDE, i64::from(value), false).await
    }

    /// Zero the charge counter.
    pub async fn reset_charge(&self) -> CtlabResult<()> {
        self.module.set(RESET_CHARGE, 0i64, false).await
    }

    /// Zero the energy counter.
    pub async fn reset_energy(&self) -> CtlabResult<()> {
        self.module.set(RESET_ENERGY, 0i64, false).await
    }

    /// Select the operating range.
    pub async fn set_range(&self, range: LoadRange) -> CtlabResult<()> {
        self.module.set(RANGE, range.code(), false).await
    }

    /// Select the operating range by wire code.
    ///
    /// # Errors
    /// `InvalidParameter` for codes outside 0-6, before any I/O.
    pub async fn set_range_code(&self, code: i64) -> CtlabResult<()> {
        let range = LoadRange::from_code(code).ok_or_else(|| {
            CtlabError::InvalidParameter(format!("load range code {code} outside 0..=6"))
        })?;
        self.set_range(range).await
    }

    /// Select the display menu.
    pub async fn set_display(&self, display: LoadDisplay) -> CtlabResult<()> {
        self.module.set(DISPLAY, display.code(), false).await
    }

    /// Select the display menu by wire code.
    ///
    /// # Errors
    /// `InvalidParameter` for codes outside 0-6, before any I/O.
    pub async fn set_display_code(&self, code: i64) -> CtlabResult<()> {
        let display = LoadDisplay::from_code(code).ok_or_else(|| {
            CtlabError::InvalidParameter(format!("display code {code} outside 0..=6"))
        })?;
        self.set_display(display).await
    }

    // -------------------------------------------------------------------------
    // Trigger mode
    // -------------------------------------------------------------------------

    /// Last known trigger mode bitmask.
    pub fn trigger_mode(&self) -> u8 {
        self.decoder.trigger_mode()
    }

    /// Enable or disable the external trigger input.
    ///
    /// Returns whether a write was issued.
    pub async fn set_trigger_input_enabled(&self, enabled: bool) -> CtlabResult<bool> {
        self.update_trigger_bit(TRIGGER_INPUT, enabled).await
    }

    /// Enable or disable automatic triggering.
    ///
    /// Returns whether a write was issued.
    pub async fn set_auto_trigger_enabled(&self, enabled: bool) -> CtlabResult<bool> {
        self.update_trigger_bit(AUTO_TRIGGER, enabled).await
    }

    async fn update_trigger_bit(&self, bit: u8, enabled: bool) -> CtlabResult<bool> {
        let current = self.decoder.trigger_mode();
        let next = if enabled { current | bit } else { current & !bit };
        if next == current {
            trace!(module = self.module.id(), mode = current, "Trigger mode unchanged");
            return Ok(false);
        }

        self.module.set(TRIGGER_MODE, next, false).await?;
        self.decoder.store_trigger_mode(next);
        Ok(true)
    }

    /// Request the trigger mode.
    pub async fn req_trigger_mode(&self) -> CtlabResult<()> {
        self.module.req(TRIGGER_MODE).await
    }

    /// Request the trigger mode and return the refreshed mirror.
    pub async fn query_trigger_mode(&self) -> CtlabResult<u8> {
        self.module.refresh(TRIGGER_MODE).await?;
        Ok(self.trigger_mode())
    }

    // -------------------------------------------------------------------------
    // Read-back
    // -------------------------------------------------------------------------

    readback_channels!(flag -> bool {
        ENABLED => enabled, req_enabled, query_enabled: "load enable flag";
    });

    readback_channels!(float -> f64 {
        CURRENT => current, req_current, query_current: "current setpoint (A)";
        POWER => power, req_power, query_power: "power setpoint (W)";
        UNDERVOLTAGE => undervoltage, req_undervoltage, query_undervoltage: "undervoltage lockout (V)";
        RESISTANCE => resistance, req_resistance, query_resistance: "resistance setpoint (Ω)";
        CHARGE => charge, req_charge, query_charge: "accumulated charge (mAh)";
        ENERGY => energy, req_energy, query_energy: "accumulated energy (mWh)";
        VOLTAGE_ON => voltage_on, req_voltage_on, query_voltage_on: "voltage with the load on (V)";
        CURRENT_ON => current_on, req_current_on, query_current_on: "current with the load on (A)";
        VOLTAGE_OFF => voltage_off, req_voltage_off, query_voltage_off: "voltage with the load off (V)";
        CURRENT_OFF => current_off, req_current_off, query_current_off: "current with the load off (A)";
        MEASURED_POWER => measured_power, req_measured_power, query_measured_power: "measured power (W)";
        RAMP_CURRENT => ramp_current, req_ramp_current, query_ramp_current: "ramped current target (A)";
        TEMPERATURE => temperature, req_temperature, query_temperature: "temperature (°C)";
    });

    readback_channels!(integer -> i64 {
        RIPPLE_ON => ripple_on, req_ripple_on, query_ripple_on: "ripple on time";
        RIPPLE_OFF => ripple_off, req_ripple_off, query_ripple_off: "ripple off time";
        RIPPLE_AMPLITUDE => ripple_amplitude, req_ripple_amplitude, query_ripple_amplitude: "ripple amplitude";
    });

    /// Cached operating range.
    pub fn range(&self) -> CtlabResult<LoadRange> {
        let code = self.module.integer(RANGE)?;
        LoadRange::from_code(code)
            .ok_or_else(|| CtlabError::Communication(format!("rng = {code}")))
    }

    /// Request the operating range.
    pub async fn req_range(&self) -> CtlabResult<()> {
        self.module.req(RANGE).await
    }

    /// Request and return the operating range.
    pub async fn query_range(&self) -> CtlabResult<LoadRange> {
        self.module.refresh(RANGE).await?;
        self.range()
    }

    /// Cached display menu.
    pub fn display(&self) -> CtlabResult<LoadDisplay> {
        let code = self.module.integer(DISPLAY)?;
        LoadDisplay::from_code(code)
            .ok_or_else(|| CtlabError::Communication(format!("dsp = {code}")))
    }

    /// Request the display menu.
    pub async fn req_display(&self) -> CtlabResult<()> {
        self.module.req(DISPLAY).await
    }

    /// Request and return the display menu.
    pub async fn query_display(&self) -> CtlabResult<LoadDisplay> {
        self.module.refresh(DISPLAY).await?;
        self.display()
    }

    /// Ask the module to report every measurement.
    pub async fn req_all(&self) -> CtlabResult<()> {
        self.module.req(REQUEST_ALL).await
    }
}

impl Deref for ElectronicLoad {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerations_round_trip_codes() {
        for range in LoadRange::ALL {
            assert_eq!(LoadRange::from_code(i64::from(range.code())), Some(range));
        }
        assert_eq!(LoadRange::from_code(7), None);
        assert_eq!(LoadDisplay::from_code(5), Some(LoadDisplay::RippleOffCurrent));
        assert_eq!(LoadDisplay::from_code(-2), None);
    }

    #[test]
    fn received_enumeration_violations_are_decode_errors() {
        let decoder = EdlDecoder::default();
        assert_eq!(
            decoder.decode(RANGE, &RawValue::new("9"), None),
            Err(DecodeError::new("rng = 9"))
        );
        assert!(decoder.decode(DISPLAY, &RawValue::new("7"), None).is_err());
        assert_eq!(
            decoder.decode(RANGE, &RawValue::new("2"), None),
            Ok(ChannelValue::Integer(2))
        );
    }

    #[test]
    fn trigger_mode_is_mirrored_on_receive() {
        let decoder = EdlDecoder::default();
        decoder.decode(TRIGGER_MODE, &RawValue::new("3"), None).unwrap();
        assert_eq!(decoder.trigger_mode(), 3);

        assert!(decoder.decode(TRIGGER_MODE, &RawValue::new("4"), None).is_err());
        assert_eq!(decoder.trigger_mode(), 3);
    }

    #[test]
    fn enable_flag_threshold() {
        let decoder = EdlDecoder::default();
        assert_eq!(
            decoder.decode(ENABLED, &RawValue::new("1"), None),
            Ok(ChannelValue::Flag(true))
        );
        assert_eq!(
            decoder.decode(ENABLED, &RawValue::new("0.0"), None),
            Ok(ChannelValue::Flag(false))
        );
    }
}
