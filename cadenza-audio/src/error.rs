//! Error taxonomy and the ErrorManager
//!
//! Every fallible engine call returns [`EngineError`]. Failures that happen
//! away from a call site (decode threads, device callbacks) are routed
//! through [`ErrorManager::handle_error`], which classifies them, keeps a
//! short rolling history and publishes an `error` event.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::{EngineEvent, EventBus};
use crate::source::SourceId;

/// Number of records kept for diagnostics
pub const ERROR_HISTORY: usize = 20;

/// Output device failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("no output device available")]
    NoDevice,
    #[error("output device rejected the configuration: {0}")]
    Unsupported(String),
    #[error("output device denied: {0}")]
    Denied(String),
    #[error("output connection lost: {0}")]
    Disconnected(String),
    #[error("output stream error: {0}")]
    Stream(String),
}

/// Errors returned by engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("failed to load '{locator}': {reason}")]
    SourceLoad { locator: String, reason: String },

    #[error("decode failed for '{locator}': {reason}")]
    Decode { locator: String, reason: String },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("{parameter} = {value} is outside [{min}, {max}]")]
    Configuration {
        parameter: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid {parameter}: {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },

    #[error("cannot {operation} while source is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no active source")]
    NoActiveSource,

    #[error("load was superseded")]
    Cancelled,

    #[error("engine has been disposed")]
    Disposed,
}

impl EngineError {
    /// Range check used by every numeric setter; NaN is always rejected
    pub(crate) fn check_range(
        parameter: &'static str,
        value: f64,
        min: f64,
        max: f64,
    ) -> Result<(), EngineError> {
        if value.is_nan() || value < min || value > max {
            return Err(EngineError::Configuration {
                parameter,
                value,
                min,
                max,
            });
        }
        Ok(())
    }
}

/// Classification published with every `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceLoad,
    Decode,
    Device,
    Configuration,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SourceLoad => "source-load",
            ErrorKind::Decode => "decode",
            ErrorKind::Device => "device",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure was observed
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorContext {
    pub source_id: Option<SourceId>,
    pub operation: &'static str,
}

impl ErrorContext {
    pub fn engine(operation: &'static str) -> Self {
        Self {
            source_id: None,
            operation,
        }
    }

    pub fn source(source_id: SourceId, operation: &'static str) -> Self {
        Self {
            source_id: Some(source_id),
            operation,
        }
    }
}

/// One classified failure
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub source_id: Option<SourceId>,
    pub timestamp: SystemTime,
    pub recoverable: bool,
}

/// Classifies, records and publishes failures
///
/// Never fails itself: reporting an error always succeeds.
pub struct ErrorManager {
    bus: Arc<EventBus>,
    records: Mutex<VecDeque<ErrorRecord>>,
    fatal: AtomicBool,
}

impl ErrorManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            records: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY)),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn classify(error: &EngineError) -> ErrorKind {
        match error {
            EngineError::SourceLoad { .. } => ErrorKind::SourceLoad,
            EngineError::Decode { .. } => ErrorKind::Decode,
            EngineError::Device(_) => ErrorKind::Device,
            EngineError::Configuration { .. } | EngineError::InvalidValue { .. } => {
                ErrorKind::Configuration
            }
            EngineError::InvalidState { .. }
            | EngineError::NoActiveSource
            | EngineError::Cancelled
            | EngineError::Disposed => ErrorKind::Unknown,
        }
    }

    /// Best-effort classification of an error that only carries a message
    pub fn classify_message(message: &str) -> ErrorKind {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["decode", "corrupt", "malformed", "invalid data"]) {
            ErrorKind::Decode
        } else if has(&["device", "output", "disconnected", "audio context"]) {
            ErrorKind::Device
        } else if has(&["not found", "unsupported", "network", "load", "fetch", "no such file"]) {
            ErrorKind::SourceLoad
        } else if has(&["out of range", "invalid value", "parameter"]) {
            ErrorKind::Configuration
        } else {
            ErrorKind::Unknown
        }
    }

    /// Source-scoped failures are recoverable; device loss never is
    fn is_recoverable(kind: ErrorKind, context: &ErrorContext) -> bool {
        match kind {
            ErrorKind::SourceLoad | ErrorKind::Decode | ErrorKind::Configuration => true,
            ErrorKind::Device => false,
            ErrorKind::Unknown => context.source_id.is_some(),
        }
    }

    /// Classify, record and publish an engine error
    pub fn handle_error(&self, error: &EngineError, context: ErrorContext) -> ErrorRecord {
        self.report(Self::classify(error), error.to_string(), context)
    }

    /// Classify, record and publish an error from outside the engine's taxonomy
    pub fn handle_foreign(&self, message: &str, context: ErrorContext) -> ErrorRecord {
        self.report(Self::classify_message(message), message.to_string(), context)
    }

    fn report(&self, kind: ErrorKind, message: String, context: ErrorContext) -> ErrorRecord {
        let recoverable = Self::is_recoverable(kind, &context);
        let record = ErrorRecord {
            kind,
            message,
            source_id: context.source_id,
            timestamp: SystemTime::now(),
            recoverable,
        };

        if recoverable {
            warn!(
                kind = kind.as_str(),
                operation = context.operation,
                source = ?context.source_id,
                message = %record.message,
                "recoverable error"
            );
        } else {
            self.fatal.store(true, Ordering::SeqCst);
            error!(
                kind = kind.as_str(),
                operation = context.operation,
                message = %record.message,
                "fatal engine error"
            );
        }

        {
            let mut records = self.records.lock();
            if records.len() == ERROR_HISTORY {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        self.bus.emit(EngineEvent::Error {
            kind,
            message: record.message.clone(),
            recoverable,
            source_id: record.source_id,
        });

        record
    }

    /// Drop the rolling history and announce it
    pub fn clear_errors(&self) {
        self.records.lock().clear();
        self.bus.emit(EngineEvent::ErrorsCleared);
    }

    /// Oldest first
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.records.lock().back().cloned()
    }

    /// True once any non-recoverable error has been reported
    ///
    /// Survives `clear_errors`: a lost device stays lost.
    pub fn has_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn manager() -> (ErrorManager, crossbeam_channel::Receiver<EngineEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe_to(&[EventKind::Error, EventKind::ErrorsCleared]);
        (ErrorManager::new(bus), rx)
    }

    #[test]
    fn test_decode_failure_is_recoverable() {
        let (manager, rx) = manager();
        let err = EngineError::Decode {
            locator: "a.flac".into(),
            reason: "bad frame".into(),
        };
        let id = SourceId::from_raw(3);
        let record = manager.handle_error(&err, ErrorContext::source(id, "decode"));

        assert_eq!(record.kind, ErrorKind::Decode);
        assert!(record.recoverable);
        assert!(!manager.has_fatal());
        match rx.try_recv() {
            Ok(EngineEvent::Error {
                kind,
                recoverable,
                source_id,
                ..
            }) => {
                assert_eq!(kind, ErrorKind::Decode);
                assert!(recoverable);
                assert_eq!(source_id, Some(id));
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let (manager, _rx) = manager();
        let err = EngineError::Device(DeviceError::Disconnected("unplugged".into()));
        let record = manager.handle_error(&err, ErrorContext::engine("render"));
        assert_eq!(record.kind, ErrorKind::Device);
        assert!(!record.recoverable);
        assert!(manager.has_fatal());

        manager.clear_errors();
        assert!(manager.has_fatal());
    }

    #[test]
    fn test_history_is_bounded() {
        let (manager, _rx) = manager();
        for i in 0..(ERROR_HISTORY + 5) {
            manager.handle_foreign(&format!("glitch {i}"), ErrorContext::engine("test"));
        }
        let records = manager.records();
        assert_eq!(records.len(), ERROR_HISTORY);
        assert_eq!(records[0].message, "glitch 5");
        assert_eq!(
            manager.last_error().map(|r| r.message),
            Some(format!("glitch {}", ERROR_HISTORY + 4))
        );
    }

    #[test]
    fn test_clear_errors_emits() {
        let (manager, rx) = manager();
        manager.handle_foreign("decoder hiccup", ErrorContext::engine("test"));
        manager.clear_errors();

        assert!(manager.records().is_empty());
        let names: Vec<&str> = rx.try_iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["error", "errors-cleared"]);
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(ErrorManager::classify_message("Corrupt frame header"), ErrorKind::Decode);
        assert_eq!(ErrorManager::classify_message("file not found"), ErrorKind::SourceLoad);
        assert_eq!(ErrorManager::classify_message("Output device disconnected"), ErrorKind::Device);
        assert_eq!(ErrorManager::classify_message("???"), ErrorKind::Unknown);
    }

    #[test]
    fn test_range_check_rejects_nan() {
        assert!(EngineError::check_range("ratio", f64::NAN, 1.0, 20.0).is_err());
        assert!(EngineError::check_range("ratio", 20.0, 1.0, 20.0).is_ok());
        assert!(EngineError::check_range("ratio", 20.01, 1.0, 20.0).is_err());
    }
}
