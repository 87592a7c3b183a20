//! Bounded FIFO handoff. Blocking with timeout, never forever.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use thiserror::Error;

pub use crossbeam_channel::bounded;

/// Non-fatal `Timeout` vs terminal `Disconnected`. A failed push hands the item back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError<T = ()> {
    #[error("queue operation timed out")]
    Timeout(T),
    #[error("queue disconnected")]
    Disconnected(T),
}

impl<T> QueueError<T> {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            QueueError::Timeout(item) | QueueError::Disconnected(item) => item,
        }
    }
}

pub trait QueueSource<T> {
    fn pop(&self, timeout: Duration) -> Result<T, QueueError>;
}

pub trait QueueSink<T> {
    fn push(&self, item: T, timeout: Duration) -> Result<(), QueueError<T>>;
}

impl<T> QueueSource<T> for Receiver<T> {
    fn pop(&self, timeout: Duration) -> Result<T, QueueError> {
        self.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => QueueError::Timeout(()),
            RecvTimeoutError::Disconnected => QueueError::Disconnected(()),
        })
    }
}

impl<T> QueueSink<T> for Sender<T> {
    fn push(&self, item: T, timeout: Duration) -> Result<(), QueueError<T>> {
        self.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) => QueueError::Timeout(item),
            SendTimeoutError::Disconnected(item) => QueueError::Disconnected(item),
        })
    }
}
