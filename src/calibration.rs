//! Calibration channels and the EEPROM write-enable gate.
//!
//! Profiles with calibration support expose, for each argument in an
//! allow-list, an offset channel at `argument + 100` and a scale channel at
//! `argument + 200`. Values written there are persisted by the module, so
//! writes go through a stricter sequence than ordinary assignments:
//!
//! 1. If write-enable was requested with [`Module::enable_write`], send
//!    `wen=1!` and require bit 16 in the returned status word
//! 2. Flush stale input
//! 3. Assign the value with an acknowledgement request
//! 4. Wait for the status word and reject the write if any bit of `0x5f` is set
//!
//! Reads flush first as well, so an old response cannot pass as the answer to
//! the fresh request.
//!
//! Arguments are checked against the allow-list before anything is sent.

use crate::connection::DispatchMode;
use crate::error::{CtlabError, CtlabResult};
use crate::module::{ChannelValue, Module, STATUS_CHANNEL};
use std::fmt;
use std::sync::atomic::Ordering;
use tracing::{debug, info, instrument, warn};

/// Channel offset of the calibration offset for an argument.
pub const OFFSET_BASE: u8 = 100;

/// Channel offset of the calibration scale for an argument.
pub const SCALE_BASE: u8 = 200;

/// Raw payload of the write-enable handshake.
pub const WRITE_ENABLE_PAYLOAD: &str = "wen=1!";

/// Status bit confirming write-enable.
pub const WRITE_ENABLED_BIT: i64 = 16;

/// Status bits that flag a rejected calibration write.
pub const CALIBRATION_ERROR_MASK: i64 = 0x5f;

/// Which calibration value of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationQuantity {
    /// Additive correction, channel `argument + 100`
    Offset,
    /// Multiplicative correction, channel `argument + 200`
    Scale,
}

impl CalibrationQuantity {
    /// Channel base for this quantity.
    pub fn base(self) -> u8 {
        match self {
            CalibrationQuantity::Offset => OFFSET_BASE,
            CalibrationQuantity::Scale => SCALE_BASE,
        }
    }
}

impl fmt::Display for CalibrationQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationQuantity::Offset => f.write_str("offset"),
            CalibrationQuantity::Scale => f.write_str("scale"),
        }
    }
}

/// Allow-list of calibration arguments for one profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationMap {
    allowed: &'static [u8],
}

impl CalibrationMap {
    /// Map accepting exactly the given arguments.
    pub const fn new(allowed: &'static [u8]) -> Self {
        Self { allowed }
    }

    /// Accepted arguments.
    pub fn arguments(&self) -> &'static [u8] {
        self.allowed
    }

    /// Channel holding `quantity` for `argument`.
    ///
    /// # Errors
    /// `InvalidParameter` if the argument is not in the allow-list.
    pub fn channel(&self, argument: u8, quantity: CalibrationQuantity) -> CtlabResult<u8> {
        if !self.allowed.contains(&argument) {
            return Err(CtlabError::InvalidParameter(format!(
                "calibration argument {argument} is not supported (allowed: {:?})",
                self.allowed
            )));
        }
        argument.checked_add(quantity.base()).ok_or_else(|| {
            CtlabError::InvalidParameter(format!(
                "calibration argument {argument} has no {quantity} channel"
            ))
        })
    }
}

impl Module {
    /// Send the write-enable handshake before subsequent calibration writes.
    pub fn enable_write(&self) {
        self.set_write_enable(true);
    }

    /// Stop sending the write-enable handshake.
    pub fn disable_write(&self) {
        self.set_write_enable(false);
    }

    /// Whether calibration writes are preceded by the write-enable handshake.
    pub fn write_enabled(&self) -> bool {
        self.write_enable_flag().load(Ordering::SeqCst)
    }

    /// Calibration arguments this module accepts.
    pub fn calibration_arguments(&self) -> &'static [u8] {
        self.calibration_map().arguments()
    }

    /// Perform the write-enable handshake if it was requested.
    ///
    /// # Errors
    /// `WriteEnable` if the status word lacks the confirmation bit.
    pub async fn send_write_enable(&self) -> CtlabResult<()> {
        if !self.write_enabled() {
            return Ok(());
        }
        self.connection().require_mode(DispatchMode::Polling)?;

        self.send(WRITE_ENABLE_PAYLOAD).await?;
        self.wait_updated(STATUS_CHANNEL).await?;

        let status = self.status()?;
        if !status.contains_bits(WRITE_ENABLED_BIT) {
            warn!(module = self.id(), status = status.bits, "Write-enable refused");
            return Err(CtlabError::WriteEnable {
                module: self.id(),
                status: status.bits,
            });
        }
        debug!(module = self.id(), "EEPROM write enabled");
        Ok(())
    }

    /// Read the calibration `quantity` of `argument` from the module.
    pub async fn calibration(&self, argument: u8, quantity: CalibrationQuantity) -> CtlabResult<f64> {
        let channel = self.calibration_map().channel(argument, quantity)?;

        self.connection().flush().await?;
        self.refresh(channel).await?;
        self.float(channel)
    }

    /// Write the calibration `quantity` of `argument` to the module.
    ///
    /// On success the cache holds `value`; on failure it is left unchanged.
    ///
    /// # Errors
    /// - `InvalidParameter` for an argument outside the allow-list or a
    ///   non-finite value, before any I/O
    /// - `ModeMismatch` on an event-driven connection, before any I/O
    /// - `WriteEnable` if the handshake was requested and refused
    /// - `CalibrationWrite` if the status word flags the write as rejected
    #[instrument(skip(self), fields(module = self.id()))]
    pub async fn set_calibration(
        &self,
        argument: u8,
        quantity: CalibrationQuantity,
        value: f64,
    ) -> CtlabResult<()> {
        let channel = self.calibration_map().channel(argument, quantity)?;
        if !value.is_finite() {
            return Err(CtlabError::InvalidParameter(format!(
                "calibration {quantity} must be finite, got {value}"
            )));
        }

        self.connection().require_mode(DispatchMode::Polling)?;
        self.send_write_enable().await?;
        self.connection().flush().await?;

        self.set(channel, value, true).await?;
        self.wait_updated(STATUS_CHANNEL).await?;

        let status = self.status()?;
        if status.intersects(CALIBRATION_ERROR_MASK) {
            warn!(channel, status = status.bits, "Calibration write rejected");
            return Err(CtlabError::CalibrationWrite {
                module: self.id(),
                channel,
                status: status.bits,
            });
        }

        self.store_confirmed(channel, ChannelValue::Float(value));
        info!(channel, value, "Calibration written");
        Ok(())
    }

    /// Read the calibration offset of `argument`.
    pub async fn offset(&self, argument: u8) -> CtlabResult<f64> {
        self.calibration(argument, CalibrationQuantity::Offset).await
    }

    /// Read the calibration scale of `argument`.
    pub async fn scale(&self, argument: u8) -> CtlabResult<f64> {
        self.calibration(argument, CalibrationQuantity::Scale).await
    }

    /// Write the calibration offset of `argument`.
    pub async fn set_offset(&self, argument: u8, value: f64) -> CtlabResult<()> {
        self.set_calibration(argument, CalibrationQuantity::Offset, value)
            .await
    }

    /// Write the calibration scale of `argument`.
    pub async fn set_scale(&self, argument: u8, value: f64) -> CtlabResult<()> {
        self.set_calibration(argument, CalibrationQuantity::Scale, value)
            .await
    }
}
