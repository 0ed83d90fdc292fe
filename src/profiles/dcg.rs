//! DCG regulated power source/sink.
//!
//! Channel map:
//!
//! | channel | quantity | direction |
//! |---|---|---|
//! | 0 | voltage setpoint (V) | set / read |
//! | 1 | current limit (A) | set / read |
//! | 7 | accumulated charge (mAh), write 0 to reset | read / reset |
//! | 10 | measured voltage (V) | read |
//! | 11 | measured current (A) | read |
//! | 20 | ramped voltage target (V) | set |
//! | 21 | ramped current target (A) | set |
//! | 80 | display menu | set |
//! | 233 | temperature (°C) | read |
//! | 255 | status word, `ICONST` while current limiting | read |
//!
//! Calibration arguments: 0-5 and 10-15.

use crate::connection::Connection;
use crate::error::{CtlabResult, DecodeError};
use crate::module::{decode_common, ChannelDecoder, ChannelValue, Module, StatusWord};
use crate::protocol::RawValue;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Voltage setpoint.
pub const VOLTAGE: u8 = 0;
/// Current limit.
pub const CURRENT: u8 = 1;
/// Accumulated charge.
pub const CHARGE: u8 = 7;
/// Measured output voltage.
pub const MEASURED_VOLTAGE: u8 = 10;
/// Measured output current.
pub const MEASURED_CURRENT: u8 = 11;
/// Ramped voltage target.
pub const RAMP_VOLTAGE: u8 = 20;
/// Ramped current target.
pub const RAMP_CURRENT: u8 = 21;
/// Display menu selection.
pub const DISPLAY: u8 = 80;
/// Heat sink temperature.
pub const TEMPERATURE: u8 = 233;

/// Status keyword reported while the output is current limited.
pub const CONSTANT_CURRENT_FLAG: &str = "ICONST";

const CALIBRATION_ARGS: &[u8] = &[0, 1, 2, 3, 4, 5, 10, 11, 12, 13, 14, 15];

/// Display menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcgDisplay {
    /// Output voltage
    Voltage,
    /// Output current
    Current,
    /// Ripple amplitude in percent
    RipplePercent,
    /// Ripple on time
    RippleOnTime,
    /// Ripple off time
    RippleOffTime,
    /// Tracking channel
    TrackChannel,
    /// Delivered energy
    Energy,
    /// Output power
    Power,
}

impl DcgDisplay {
    /// All menus in code order.
    pub const ALL: [DcgDisplay; 8] = [
        DcgDisplay::Voltage,
        DcgDisplay::Current,
        DcgDisplay::RipplePercent,
        DcgDisplay::RippleOnTime,
        DcgDisplay::RippleOffTime,
        DcgDisplay::TrackChannel,
        DcgDisplay::Energy,
        DcgDisplay::Power,
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

/// Decoded DCG status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcgStatus {
    /// Output is limited by the current setpoint
    pub constant_current: bool,
    /// Raw status bits
    pub bits: i64,
}

impl From<&StatusWord> for DcgStatus {
    fn from(word: &StatusWord) -> Self {
        Self {
            constant_current: word.has_flag(CONSTANT_CURRENT_FLAG),
            bits: word.bits,
        }
    }
}

impl fmt::Display for DcgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.constant_current { "CC" } else { "CV" };
        write!(f, "{} (status {:#x})", mode, self.bits)
    }
}

#[derive(Debug, Default)]
struct DcgDecoder;

impl ChannelDecoder for DcgDecoder {
    fn profile(&self) -> &'static str {
        "dcg"
    }

    fn decode(
        &self,
        channel: u8,
        value: &RawValue,
        comment: Option<&str>,
    ) -> Result<ChannelValue, DecodeError> {
        match channel {
            VOLTAGE | CURRENT | CHARGE | MEASURED_VOLTAGE | MEASURED_CURRENT | RAMP_VOLTAGE
            | RAMP_CURRENT | TEMPERATURE => Ok(ChannelValue::Float(value.as_f64()?)),
            DISPLAY => {
                let code = value.as_integer()?;
                DcgDisplay::from_code(code)
                    .map(|_| ChannelValue::Integer(code))
                    .ok_or_else(|| DecodeError::new(format!("dsp = {code}")))
            }
            _ => decode_common(channel, value, comment),
        }
    }
}

/// DCG regulated source/sink.
#[derive(Debug, Clone)]
pub struct RegulatedSource {
    module: Module,
}

impl RegulatedSource {
    /// Register a DCG with bus id `id` on `connection`.
    pub fn new(id: u8, connection: &Arc<Connection>) -> CtlabResult<Self> {
        let module = Module::with_decoder(id, connection, Arc::new(DcgDecoder), CALIBRATION_ARGS)?;
        Ok(Self { module })
    }

    /// The underlying module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    // -------------------------------------------------------------------------
    // Setpoints
    // -------------------------------------------------------------------------

    /// Set the output voltage.
    pub async fn set_voltage(&self, volts: f64) -> CtlabResult<()> {
        self.module.set(VOLTAGE, volts, false).await
    }

    /// Set the current limit.
    pub async fn set_current(&self, amps: f64) -> CtlabResult<()> {
        self.module.set(CURRENT, amps, false).await
    }

    /// Ramp the output voltage towards `volts`.
    pub async fn set_ramp_voltage(&self, volts: f64) -> CtlabResult<()> {
        self.module.set(RAMP_VOLTAGE, volts, false).await
    }

    /// Ramp the current limit towards `amps`.
    pub async fn set_ramp_current(&self, amps: f64) -> CtlabResult<()> {
        self.module.set(RAMP_CURRENT, amps, false).await
    }

    /// Zero the charge counter.
    pub async fn reset_charge(&self) -> CtlabResult<()> {
        self.module.set(CHARGE, 0i64, false).await
    }

    /// Select the display menu.
    pub async fn set_display(&self, display: DcgDisplay) -> CtlabResult<()> {
        self.module.set(DISPLAY, display.code(), false).await
    }

    // -------------------------------------------------------------------------
    // Read-back
    // -------------------------------------------------------------------------

    readback_channels!(float -> f64 {
        VOLTAGE => voltage, req_voltage, query_voltage: "voltage setpoint (V)";
        CURRENT => current, req_current, query_current: "current limit (A)";
        CHARGE => charge, req_charge, query_charge: "accumulated charge (mAh)";
        MEASURED_VOLTAGE => measured_voltage, req_measured_voltage, query_measured_voltage: "measured output voltage (V)";
        MEASURED_CURRENT => measured_current, req_measured_current, query_measured_current: "measured output current (A)";
        TEMPERATURE => temperature, req_temperature, query_temperature: "temperature (°C)";
    });

    /// Cached status.
    pub fn status_flags(&self) -> CtlabResult<DcgStatus> {
        Ok(DcgStatus::from(&self.module.status()?))
    }

    /// Request and decode the status word.
    pub async fn query_status_flags(&self) -> CtlabResult<DcgStatus> {
        let word = self.module.query_status().await?;
        Ok(DcgStatus::from(&word))
    }

    /// Whether the last status word reported current limiting.
    pub fn is_constant_current(&self) -> CtlabResult<bool> {
        Ok(self.status_flags()?.constant_current)
    }
}

impl Deref for RegulatedSource {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}
