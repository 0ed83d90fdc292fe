//! One-shot response waiters for event-driven dispatch.
//!
//! When an external task owns the read side of the bus, a caller cannot poll
//! the transport itself. Instead it registers a waiter under
//! `(module, channel)` before sending its request; the dispatch path resolves
//! the waiter when the matching response has been decoded.
//!
//! At most one waiter may be pending per key. A second registration while the
//! first is still live fails with [`CtlabError::RequestPending`], which keeps
//! the "one outstanding request per channel" rule enforceable.

use crate::error::{CtlabError, CtlabResult, DecodeError};
use crate::module::ChannelValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// What a waiter eventually receives.
pub type Delivery = Result<ChannelValue, DecodeError>;

/// Pending requests keyed by `(module, channel)`.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<(u8, u8), oneshot::Sender<Delivery>>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next response for `(module, channel)`.
    ///
    /// A registration whose receiver has already been dropped (the caller was
    /// cancelled) is replaced silently.
    pub fn register(&self, module: u8, channel: u8) -> CtlabResult<oneshot::Receiver<Delivery>> {
        let mut waiters = self.waiters.lock();
        if let Some(existing) = waiters.get(&(module, channel)) {
            if !existing.is_closed() {
                return Err(CtlabError::RequestPending { module, channel });
            }
        }

        let (tx, rx) = oneshot::channel();
        waiters.insert((module, channel), tx);
        Ok(rx)
    }

    /// Resolve the waiter for `(module, channel)`, if any.
    ///
    /// Returns `true` when a live waiter received the delivery.
    pub fn fulfil(&self, module: u8, channel: u8, delivery: Delivery) -> bool {
        let waiter = self.waiters.lock().remove(&(module, channel));
        match waiter {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Remove the registration for `(module, channel)` without resolving it.
    pub fn cancel(&self, module: u8, channel: u8) -> bool {
        self.waiters.lock().remove(&(module, channel)).is_some()
    }

    /// Whether a live waiter exists for `(module, channel)`.
    pub fn is_pending(&self, module: u8, channel: u8) -> bool {
        self.waiters
            .lock()
            .get(&(module, channel))
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Drop every registration. Their receivers observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    /// Number of registrations, including ones whose caller went away.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfil_resolves_registered_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register(1, 0).unwrap();

        assert!(pending.fulfil(1, 0, Ok(ChannelValue::Float(2.5))));
        assert_eq!(rx.await.unwrap(), Ok(ChannelValue::Float(2.5)));
        assert!(pending.is_empty());
    }

    #[test]
    fn second_registration_is_rejected() {
        let pending = PendingRequests::new();
        let _rx = pending.register(1, 0).unwrap();

        match pending.register(1, 0) {
            Err(CtlabError::RequestPending { module, channel }) => {
                assert_eq!((module, channel), (1, 0));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // Other channels are independent
        assert!(pending.register(1, 1).is_ok());
        assert!(pending.register(2, 0).is_ok());
    }

    #[test]
    fn abandoned_registration_can_be_replaced() {
        let pending = PendingRequests::new();
        let rx = pending.register(4, 19).unwrap();
        drop(rx);

        assert!(!pending.is_pending(4, 19));
        assert!(pending.register(4, 19).is_ok());
    }

    #[test]
    fn fulfil_without_waiter_is_noop() {
        let pending = PendingRequests::new();
        assert!(!pending.fulfil(1, 0, Ok(ChannelValue::Integer(1))));
    }

    #[tokio::test]
    async fn clear_closes_receivers() {
        let pending = PendingRequests::new();
        let rx = pending.register(1, 255).unwrap();
        assert_eq!(pending.clear(), 1);
        assert!(rx.await.is_err());
        assert!(!pending.cancel(1, 255));
    }
}
