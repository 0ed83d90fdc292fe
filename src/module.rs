//! Module base: channel cache, freshness tracking and the request primitives.
//!
//! Every instrument on the bus is a module with numbered channels. A [`Module`]
//! owns a small table with the last decoded value of each channel and a
//! freshness flag that is cleared when a request goes out and set when the
//! matching response is dispatched.
//!
//! The decoding of raw tokens is delegated to a [`ChannelDecoder`] supplied by
//! the device profile. Channel 254 (identity) and 255 (status word) are common
//! to every module; profiles override everything else.
//!
//! # Polling vs event-driven
//!
//! [`Module::wait_updated`] is the only place where a caller blocks on the
//! transport in polling mode: it keeps calling [`Connection::receive`] until
//! the channel turns fresh. Every `query_*` accessor is [`Module::refresh`]
//! (mode check, `req`, `wait_updated`) followed by a cache read. In
//! event-driven mode [`Module::query_async`] is used instead, which awaits a
//! one-shot waiter with a timeout.

use crate::calibration::CalibrationMap;
use crate::connection::{Connection, DispatchMode};
use crate::error::{CtlabError, CtlabResult, DecodeError};
use crate::protocol::{self, RawValue, WireValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Identity channel (name and firmware).
pub const IDENTITY_CHANNEL: u8 = 254;

/// Status word channel.
pub const STATUS_CHANNEL: u8 = 255;

// =============================================================================
// Channel values
// =============================================================================

/// Device identity as reported on channel 254.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Module type name from the comment field
    pub name: Option<String>,
    /// Firmware version token
    pub firmware: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} fw {}", name, self.firmware),
            None => write!(f, "unnamed fw {}", self.firmware),
        }
    }
}

/// Status word as reported on channel 255.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWord {
    /// Status bits
    pub bits: i64,
    /// Keyword text following the value
    pub comment: Option<String>,
}

impl StatusWord {
    /// Whether the comment text contains `keyword`.
    pub fn has_flag(&self, keyword: &str) -> bool {
        self.comment
            .as_deref()
            .is_some_and(|comment| comment.contains(keyword))
    }

    /// Whether every bit of `mask` is set.
    pub fn contains_bits(&self, mask: i64) -> bool {
        self.bits & mask == mask
    }

    /// Whether any bit of `mask` is set.
    pub fn intersects(&self, mask: i64) -> bool {
        self.bits & mask != 0
    }
}

/// A decoded channel value.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    /// Analog quantity
    Float(f64),
    /// Enumeration code or counter
    Integer(i64),
    /// On/off channel
    Flag(bool),
    /// Channel 255
    Status(StatusWord),
    /// Channel 254
    Identity(Identity),
    /// Token kept verbatim because no profile claimed the channel
    Raw(RawValue),
}

impl ChannelValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Integer(v) => Some(*v as f64),
            ChannelValue::Flag(v) => Some(if *v { 1.0 } else { 0.0 }),
            ChannelValue::Raw(raw) => raw.as_f64().ok(),
            ChannelValue::Status(_) | ChannelValue::Identity(_) => None,
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ChannelValue::Integer(v) => Some(*v),
            ChannelValue::Flag(v) => Some(i64::from(*v)),
            ChannelValue::Status(word) => Some(word.bits),
            ChannelValue::Raw(raw) => raw.as_integer().ok(),
            ChannelValue::Float(_) | ChannelValue::Identity(_) => None,
        }
    }

    /// Boolean view of the value, if it has one.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ChannelValue::Flag(v) => Some(*v),
            ChannelValue::Raw(raw) => raw.as_flag().ok(),
            _ => None,
        }
    }
}

// =============================================================================
// Decoders
// =============================================================================

/// Turns raw tokens into typed channel values for one device profile.
pub trait ChannelDecoder: Send + Sync {
    /// Profile name for logs.
    fn profile(&self) -> &'static str;

    /// Decode `value` received on `channel`.
    ///
    /// An error means the device sent something the profile does not accept;
    /// the cache is left untouched.
    fn decode(
        &self,
        channel: u8,
        value: &RawValue,
        comment: Option<&str>,
    ) -> Result<ChannelValue, DecodeError> {
        decode_common(channel, value, comment)
    }
}

/// Decoding shared by every profile: identity, status word, raw fallback.
pub fn decode_common(
    channel: u8,
    value: &RawValue,
    comment: Option<&str>,
) -> Result<ChannelValue, DecodeError> {
    match channel {
        IDENTITY_CHANNEL => Ok(ChannelValue::Identity(Identity {
            name: comment.map(str::to_string),
            firmware: value.as_str().to_string(),
        })),
        STATUS_CHANNEL => Ok(ChannelValue::Status(StatusWord {
            bits: value.as_integer()?,
            comment: comment.map(str::to_string),
        })),
        _ => Ok(ChannelValue::Raw(value.clone())),
    }
}

/// Decoder for modules without a profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericDecoder;

impl ChannelDecoder for GenericDecoder {
    fn profile(&self) -> &'static str {
        "generic"
    }
}

// =============================================================================
// Shared module state
// =============================================================================

#[derive(Debug, Default)]
struct ChannelTable {
    values: HashMap<u8, ChannelValue>,
    fresh: HashMap<u8, bool>,
}

/// State shared between a module handle and the connection's dispatch path.
pub(crate) struct ModuleCore {
    id: u8,
    decoder: Arc<dyn ChannelDecoder>,
    calibration: CalibrationMap,
    write_enable: AtomicBool,
    table: Mutex<ChannelTable>,
}

impl ModuleCore {
    pub(crate) fn new(
        id: u8,
        decoder: Arc<dyn ChannelDecoder>,
        calibration_args: &'static [u8],
    ) -> Self {
        Self {
            id,
            decoder,
            calibration: CalibrationMap::new(calibration_args),
            write_enable: AtomicBool::new(false),
            table: Mutex::new(ChannelTable::default()),
        }
    }

    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    /// Decode and store a received value. Only the dispatch path calls this.
    pub(crate) fn recv(
        &self,
        channel: u8,
        value: &RawValue,
        comment: Option<&str>,
    ) -> Result<ChannelValue, DecodeError> {
        let decoded = self.decoder.decode(channel, value, comment)?;
        let mut table = self.table.lock();
        table.values.insert(channel, decoded.clone());
        table.fresh.insert(channel, true);
        Ok(decoded)
    }

    fn mark_stale(&self, channel: u8) {
        self.table.lock().fresh.insert(channel, false);
    }

    fn is_fresh(&self, channel: u8) -> bool {
        self.table
            .lock()
            .fresh
            .get(&channel)
            .copied()
            .unwrap_or(false)
    }

    fn value(&self, channel: u8) -> Option<ChannelValue> {
        self.table.lock().values.get(&channel).cloned()
    }

    /// Record a value the module accepted without echoing it back.
    fn store_confirmed(&self, channel: u8, value: ChannelValue) {
        self.table.lock().values.insert(channel, value);
    }
}

// =============================================================================
// Module
// =============================================================================

/// Handle to one module on the bus.
///
/// Cloning is cheap; clones share the channel table and the connection.
#[derive(Clone)]
pub struct Module {
    core: Arc<ModuleCore>,
    connection: Arc<Connection>,
}

impl Module {
    /// Register a module without a device profile.
    ///
    /// # Errors
    /// Returns `DuplicateModule` if the id is already taken on `connection`.
    pub fn new(id: u8, connection: &Arc<Connection>) -> CtlabResult<Self> {
        Self::with_decoder(id, connection, Arc::new(GenericDecoder), &[])
    }

    /// Register a module with a profile decoder and calibration allow-list.
    pub fn with_decoder(
        id: u8,
        connection: &Arc<Connection>,
        decoder: Arc<dyn ChannelDecoder>,
        calibration_args: &'static [u8],
    ) -> CtlabResult<Self> {
        let core = Arc::new(ModuleCore::new(id, decoder, calibration_args));
        connection.registry().register(Arc::clone(&core))?;
        debug!(module = id, profile = core.decoder.profile(), "Registered module");
        Ok(Self {
            core,
            connection: Arc::clone(connection),
        })
    }

    pub(crate) fn from_core(core: Arc<ModuleCore>, connection: Arc<Connection>) -> Self {
        Self { core, connection }
    }

    /// Bus id.
    pub fn id(&self) -> u8 {
        self.core.id
    }

    /// Profile name of the decoder in use.
    pub fn profile(&self) -> &'static str {
        self.core.decoder.profile()
    }

    /// The connection this module talks through.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn calibration_map(&self) -> CalibrationMap {
        self.core.calibration
    }

    pub(crate) fn write_enable_flag(&self) -> &AtomicBool {
        &self.core.write_enable
    }

    pub(crate) fn store_confirmed(&self, channel: u8, value: ChannelValue) {
        self.core.store_confirmed(channel, value);
    }

    /// Send a raw payload addressed to this module.
    pub async fn send(&self, payload: &str) -> CtlabResult<()> {
        self.connection.send(self.core.id, payload).await
    }

    /// Request the current value of `channel`.
    pub async fn req(&self, channel: u8) -> CtlabResult<()> {
        self.core.mark_stale(channel);
        self.send(&protocol::query_payload(channel)).await
    }

    /// Assign `value` to `channel`, optionally asking for an acknowledgement.
    ///
    /// # Errors
    /// Non-finite floats are rejected with `InvalidParameter` before any I/O.
    pub async fn set(
        &self,
        channel: u8,
        value: impl Into<WireValue>,
        request_ack: bool,
    ) -> CtlabResult<()> {
        let value = value.into();
        if let WireValue::Float(v) = value {
            if !v.is_finite() {
                return Err(CtlabError::InvalidParameter(format!(
                    "channel {channel}: {v} is not a finite number"
                )));
            }
        }
        self.send(&protocol::assign_payload(channel, &value, request_ack))
            .await
    }

    /// Block until a response for `channel` has been dispatched.
    ///
    /// Clears the freshness flag, then keeps reading from the connection. No
    /// timeout: an unanswered request waits until the connection is closed.
    ///
    /// # Errors
    /// `ModeMismatch` if the connection is event-driven; any error raised by
    /// `receive()`, including device faults on other channels.
    pub async fn wait_updated(&self, channel: u8) -> CtlabResult<()> {
        self.connection.require_mode(DispatchMode::Polling)?;
        self.core.mark_stale(channel);

        while !self.core.is_fresh(channel) {
            let received = self.connection.receive().await?;
            if received == 0 {
                // Non-blocking transport with nothing queued.
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Whether `channel` got a response since it was last requested.
    pub fn is_fresh(&self, channel: u8) -> bool {
        self.core.is_fresh(channel)
    }

    /// Last cached value of `channel`.
    ///
    /// # Errors
    /// `NoValue` if nothing was ever received on it.
    pub fn value(&self, channel: u8) -> CtlabResult<ChannelValue> {
        self.core.value(channel).ok_or(CtlabError::NoValue {
            module: self.core.id,
            channel,
        })
    }

    /// Cached value of `channel` as a number.
    pub fn float(&self, channel: u8) -> CtlabResult<f64> {
        self.value(channel)?
            .as_f64()
            .ok_or_else(|| self.wrong_kind(channel, "numeric"))
    }

    /// Cached value of `channel` as an integer.
    pub fn integer(&self, channel: u8) -> CtlabResult<i64> {
        self.value(channel)?
            .as_integer()
            .ok_or_else(|| self.wrong_kind(channel, "integer"))
    }

    /// Cached value of `channel` as a boolean.
    pub fn flag(&self, channel: u8) -> CtlabResult<bool> {
        self.value(channel)?
            .as_flag()
            .ok_or_else(|| self.wrong_kind(channel, "boolean"))
    }

    fn wrong_kind(&self, channel: u8, kind: &str) -> CtlabError {
        CtlabError::Communication(format!(
            "module {} channel {} holds no {} value",
            self.core.id, channel, kind
        ))
    }

    /// Request `channel` and block until its answer has been dispatched.
    ///
    /// The dispatch mode is checked first, so an event-driven connection gets
    /// `ModeMismatch` without the request reaching the bus.
    pub async fn refresh(&self, channel: u8) -> CtlabResult<()> {
        self.connection.require_mode(DispatchMode::Polling)?;
        self.req(channel).await?;
        self.wait_updated(channel).await
    }

    /// Request, wait and return the fresh value of `channel`.
    #[instrument(skip(self), fields(module = self.core.id), level = "trace")]
    pub async fn query(&self, channel: u8) -> CtlabResult<ChannelValue> {
        self.refresh(channel).await?;
        self.value(channel)
    }

    /// [`query`](Self::query) then read as a number.
    pub async fn query_float(&self, channel: u8) -> CtlabResult<f64> {
        self.refresh(channel).await?;
        self.float(channel)
    }

    /// [`query`](Self::query) then read as an integer.
    pub async fn query_integer(&self, channel: u8) -> CtlabResult<i64> {
        self.refresh(channel).await?;
        self.integer(channel)
    }

    /// [`query`](Self::query) then read as a boolean.
    pub async fn query_flag(&self, channel: u8) -> CtlabResult<bool> {
        self.refresh(channel).await?;
        self.flag(channel)
    }

    /// Event-driven query: register a waiter, send the request, await the answer.
    ///
    /// # Errors
    /// - `ModeMismatch` unless the connection runs its event loop
    /// - `RequestPending` if another query for this channel is outstanding
    /// - `Timeout` if no answer arrives within `timeout`; the waiter is removed
    /// - `Communication` if the answer violates the profile's rules
    pub async fn query_async(&self, channel: u8, timeout: Duration) -> CtlabResult<ChannelValue> {
        self.connection.require_mode(DispatchMode::EventDriven)?;
        let id = self.core.id;
        let waiters = self.connection.waiters();
        let rx = waiters.register(id, channel)?;

        if let Err(e) = self.req(channel).await {
            waiters.cancel(id, channel);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(delivery)) => delivery.map_err(CtlabError::from),
            Ok(Err(_)) => Err(CtlabError::NoConnection),
            Err(_) => {
                waiters.cancel(id, channel);
                Err(CtlabError::Timeout {
                    module: id,
                    channel,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Common channels
    // -------------------------------------------------------------------------

    /// Request the identity channel.
    pub async fn req_identity(&self) -> CtlabResult<()> {
        self.req(IDENTITY_CHANNEL).await
    }

    /// Cached identity.
    pub fn identity(&self) -> CtlabResult<Identity> {
        match self.value(IDENTITY_CHANNEL)? {
            ChannelValue::Identity(identity) => Ok(identity),
            _ => Err(self.wrong_kind(IDENTITY_CHANNEL, "identity")),
        }
    }

    /// Request and return the identity.
    pub async fn query_identity(&self) -> CtlabResult<Identity> {
        self.refresh(IDENTITY_CHANNEL).await?;
        self.identity()
    }

    /// Request the status word.
    pub async fn req_status(&self) -> CtlabResult<()> {
        self.req(STATUS_CHANNEL).await
    }

    /// Cached status word.
    pub fn status(&self) -> CtlabResult<StatusWord> {
        match self.value(STATUS_CHANNEL)? {
            ChannelValue::Status(word) => Ok(word),
            _ => Err(self.wrong_kind(STATUS_CHANNEL, "status")),
        }
    }

    /// Request and return the status word.
    pub async fn query_status(&self) -> CtlabResult<StatusWord> {
        self.refresh(STATUS_CHANNEL).await?;
        self.status()
    }

    pub(crate) fn set_write_enable(&self, enabled: bool) {
        self.core.write_enable.store(enabled, Ordering::SeqCst);
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.core.id)
            .field("profile", &self.core.decoder.profile())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_decoding() {
        let identity = decode_common(254, &RawValue::new("2.31"), Some("DCG")).unwrap();
        assert_eq!(
            identity,
            ChannelValue::Identity(Identity {
                name: Some("DCG".into()),
                firmware: "2.31".into()
            })
        );

        let status = decode_common(255, &RawValue::new("16"), None).unwrap();
        assert_eq!(status.as_integer(), Some(16));

        assert!(decode_common(255, &RawValue::new("1.5"), None).is_err());
        assert_eq!(
            decode_common(42, &RawValue::new("7"), None).unwrap(),
            ChannelValue::Raw(RawValue::new("7"))
        );
    }

    #[test]
    fn status_word_bits_and_flags() {
        let word = StatusWord {
            bits: 0x14,
            comment: Some("ICONST OVL".into()),
        };
        assert!(word.contains_bits(0x10));
        assert!(!word.contains_bits(0x11));
        assert!(word.intersects(0x5f));
        assert!(word.has_flag("ICONST"));
        assert!(!word.has_flag("ERR"));
    }

    #[test]
    fn core_tracks_freshness() {
        let core = ModuleCore::new(1, Arc::new(GenericDecoder), &[]);
        assert!(!core.is_fresh(0));
        assert!(core.value(0).is_none());

        core.recv(0, &RawValue::new("3.5"), None).unwrap();
        assert!(core.is_fresh(0));
        assert_eq!(core.value(0).unwrap().as_f64(), Some(3.5));

        core.mark_stale(0);
        assert!(!core.is_fresh(0));
        // Stale does not mean empty
        assert_eq!(core.value(0).unwrap().as_f64(), Some(3.5));
    }

    #[test]
    fn rejected_value_leaves_table_untouched() {
        let core = ModuleCore::new(1, Arc::new(GenericDecoder), &[]);
        assert!(core.recv(255, &RawValue::new("x.5"), None).is_err());
        assert!(!core.is_fresh(255));
        assert!(core.value(255).is_none());
    }
}
