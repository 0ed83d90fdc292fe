//! ADA-IO analog breakout: 8 outputs and 8 inputs sampled at two resolutions.
//!
//! | channels | group |
//! |---|---|
//! | 0-7 | coarse inputs (10 bit) |
//! | 10-17 | fine inputs (16 bit) |
//! | 20-27 | outputs (12 bit), ±10 V |
//! | 80 | display selection, value is the channel number shown |
//!
//! Indices outside 0-7 and output voltages outside ±10 V are rejected before
//! anything is written to the bus.

use crate::connection::Connection;
use crate::error::{CtlabError, CtlabResult, DecodeError};
use crate::module::{decode_common, ChannelDecoder, ChannelValue, Module};
use crate::protocol::RawValue;
use std::ops::Deref;
use std::sync::Arc;

/// Number of channels per group.
pub const CHANNELS_PER_GROUP: u8 = 8;

/// Largest output magnitude in volts.
pub const OUTPUT_VOLTAGE_LIMIT: f64 = 10.0;

/// Display selection channel.
pub const DISPLAY: u8 = 80;

/// Channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalogGroup {
    /// 10 bit inputs
    CoarseInput,
    /// 16 bit inputs
    FineInput,
    /// 12 bit outputs
    Output,
}

impl AnalogGroup {
    /// First channel of the group.
    pub fn base(self) -> u8 {
        match self {
            AnalogGroup::CoarseInput => 0,
            AnalogGroup::FineInput => 10,
            AnalogGroup::Output => 20,
        }
    }

    /// Group owning a bus channel, if any.
    pub fn of_channel(channel: u8) -> Option<Self> {
        [
            AnalogGroup::CoarseInput,
            AnalogGroup::FineInput,
            AnalogGroup::Output,
        ]
        .into_iter()
        .find(|group| (group.base()..group.base() + CHANNELS_PER_GROUP).contains(&channel))
    }

    /// Bus channel of `index` within the group.
    ///
    /// # Errors
    /// `InvalidParameter` unless `index` is 0-7.
    pub fn channel(self, index: u8) -> CtlabResult<u8> {
        if index >= CHANNELS_PER_GROUP {
            return Err(CtlabError::InvalidParameter(format!(
                "analog channel index {index} outside 0..={}",
                CHANNELS_PER_GROUP - 1
            )));
        }
        Ok(self.base() + index)
    }
}

#[derive(Debug, Default)]
struct AdaIoDecoder;

impl ChannelDecoder for AdaIoDecoder {
    fn profile(&self) -> &'static str {
        "adaio"
    }

    fn decode(
        &self,
        channel: u8,
        value: &RawValue,
        comment: Option<&str>,
    ) -> Result<ChannelValue, DecodeError> {
        if AnalogGroup::of_channel(channel).is_some() {
            return Ok(ChannelValue::Float(value.as_f64()?));
        }
        match channel {
            DISPLAY => Ok(ChannelValue::Integer(value.as_integer()?)),
            _ => decode_common(channel, value, comment),
        }
    }
}

/// ADA-IO analog breakout.
#[derive(Debug, Clone)]
pub struct AnalogIo {
    module: Module,
}

impl AnalogIo {
    /// Register an ADA-IO with bus id `id` on `connection`.
    pub fn new(id: u8, connection: &Arc<Connection>) -> CtlabResult<Self> {
        let module = Module::with_decoder(id, connection, Arc::new(AdaIoDecoder), &[])?;
        Ok(Self { module })
    }

    /// The underlying module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Drive output `index` to `volts`.
    ///
    /// # Errors
    /// `InvalidParameter` for an index outside 0-7 or a voltage outside ±10 V.
    pub async fn set_output(&self, index: u8, volts: f64) -> CtlabResult<()> {
        let channel = AnalogGroup::Output.channel(index)?;
        if !(-OUTPUT_VOLTAGE_LIMIT..=OUTPUT_VOLTAGE_LIMIT).contains(&volts) {
            return Err(CtlabError::InvalidParameter(format!(
                "output voltage {volts} V outside ±{OUTPUT_VOLTAGE_LIMIT} V"
            )));
        }
        self.module.set(channel, volts, false).await
    }

    /// Request channel `index` of `group`.
    pub async fn req_voltage(&self, group: AnalogGroup, index: u8) -> CtlabResult<()> {
        let channel = group.channel(index)?;
        self.module.req(channel).await
    }

    /// Cached voltage of channel `index` of `group`.
    pub fn voltage(&self, group: AnalogGroup, index: u8) -> CtlabResult<f64> {
        let channel = group.channel(index)?;
        self.module.float(channel)
    }

    /// Request and return the voltage of channel `index` of `group`.
    pub async fn query_voltage(&self, group: AnalogGroup, index: u8) -> CtlabResult<f64> {
        let channel = group.channel(index)?;
        self.module.query_float(channel).await
    }

    /// Show channel `index` of `group` on the module display.
    pub async fn set_display(&self, group: AnalogGroup, index: u8) -> CtlabResult<()> {
        let channel = group.channel(index)?;
        self.module.set(DISPLAY, channel, false).await
    }

    /// Coarse reading of input `index`.
    pub async fn query_coarse_input(&self, index: u8) -> CtlabResult<f64> {
        self.query_voltage(AnalogGroup::CoarseInput, index).await
    }

    /// Fine reading of input `index`.
    pub async fn query_fine_input(&self, index: u8) -> CtlabResult<f64> {
        self.query_voltage(AnalogGroup::FineInput, index).await
    }

    /// Current setpoint of output `index`.
    pub async fn query_output(&self, index: u8) -> CtlabResult<f64> {
        self.query_voltage(AnalogGroup::Output, index).await
    }
}

impl Deref for AnalogIo {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_channel_mapping() {
        assert_eq!(AnalogGroup::CoarseInput.channel(3).unwrap(), 3);
        assert_eq!(AnalogGroup::FineInput.channel(7).unwrap(), 17);
        assert_eq!(AnalogGroup::Output.channel(0).unwrap(), 20);
        assert!(AnalogGroup::Output.channel(8).is_err());

        assert_eq!(AnalogGroup::of_channel(15), Some(AnalogGroup::FineInput));
        assert_eq!(AnalogGroup::of_channel(8), None);
        assert_eq!(AnalogGroup::of_channel(28), None);
    }

    #[test]
    fn decodes_group_channels_as_floats() {
        let decoder = AdaIoDecoder;
        assert_eq!(
            decoder.decode(24, &RawValue::new("-3.25"), None),
            Ok(ChannelValue::Float(-3.25))
        );
        assert_eq!(
            decoder.decode(DISPLAY, &RawValue::new("12"), None),
            Ok(ChannelValue::Integer(12))
        );
        assert_eq!(
            decoder.decode(42, &RawValue::new("1"), None),
            Ok(ChannelValue::Raw(RawValue::new("1")))
        );
    }
}
