//! Deferred results for operations that complete off the caller's thread

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::EngineError;

/// Result of an operation that may still be in flight
///
/// Dropping the completing side without resolving it reads as
/// [`EngineError::Cancelled`].
#[must_use = "a Pending does nothing unless waited on or dropped deliberately"]
pub struct Pending<T> {
    rx: Receiver<Result<T, EngineError>>,
}

/// Completing side of a [`Pending`]
pub(crate) struct Completer<T> {
    tx: Sender<Result<T, EngineError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Completer<T>, Pending<T>) {
        let (tx, rx) = bounded(1);
        (Completer { tx }, Pending { rx })
    }

    /// Already resolved
    pub fn ready(result: Result<T, EngineError>) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(result);
        pending
    }

    /// Block until resolved
    pub fn wait(self) -> Result<T, EngineError> {
        self.rx.recv().unwrap_or(Err(EngineError::Cancelled))
    }

    /// Block until resolved or the timeout elapses
    ///
    /// On timeout the `Pending` is handed back so the caller can keep waiting.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, EngineError>, Pending<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(EngineError::Cancelled)),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }

    /// Take the result if it is already available
    pub fn try_take(&self) -> Option<Result<T, EngineError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::Cancelled)),
            Err(TryRecvError::Empty) => None,
        }
    }
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T, EngineError>) {
        // Receiver may be gone; the caller chose not to wait.
        let _ = self.tx.send(result);
    }
}
