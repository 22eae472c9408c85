//! Observable events and cooperative cancellation.
//!
//! The driver reports progress and lifecycle transitions as a stream of
//! event values; rendering is the host's concern. The session owns the
//! sink, the engines emit through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DfuError;
use crate::transport::TransportError;

/// Events emitted by a session and its engines.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Descriptors parsed, candidate interfaces enumerated.
    Init,
    /// Interface claimed, engine ready.
    Connect,
    /// The transport was released or the device left the bus.
    Disconnect(Option<TransportError>),
    /// Read progress, in bytes.
    Progress { done: usize, total: Option<usize> },
    WriteStart,
    WriteProgress { done: usize, total: usize },
    WriteEnd { total: usize },
    EraseStart,
    EraseProgress { done: u32, total: u32 },
    EraseEnd,
    /// Terminal failure of the operation in flight.
    Error(DfuError),
}

/// Sink the session and engines emit events through.
pub(crate) struct EventSink {
    hook: Option<Box<dyn FnMut(&DfuEvent)>>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        Self { hook: None }
    }

    pub(crate) fn set(&mut self, hook: impl FnMut(&DfuEvent) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub(crate) fn emit(&mut self, event: DfuEvent) {
        log::trace!("event: {event:?}");
        if let Some(hook) = self.hook.as_mut() {
            hook(&event);
        }
    }
}

/// Cooperative cancellation handle.
///
/// Engines check the token between transfers; when it fires they attempt
/// to abort the device back to idle and return [`DfuError::Cancelled`].
/// Cancellation during a manifestation wait is a no-op, the device is
/// already committing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for another operation.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
