//! Events reported to the caller while a test runs.
//!
//! A test reports through one bounded channel. Events arrive in emission
//! order, a [`Event::Failure`] is always the last one, and the channel
//! closing is the only completion signal.

use crate::errors::{format_error_for_display, ErrorKind, TestError};
use crate::measurements::Measurement;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Severity of a [`Event::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warning,
    Info,
    Debug,
}

/// Who observed a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Counted by this client.
    Local,
    /// Reported by the server in a text message.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub log_level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    #[serde(flatten)]
    pub measurement: Measurement,
    pub is_local: bool,
}

impl MeasurementRecord {
    pub fn origin(&self) -> Origin {
        if self.is_local {
            Origin::Local
        } else {
            Origin::Remote
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub failure: String,
    #[serde(skip)]
    pub kind: ErrorKind,
    /// The failure followed by a suggestion, if there is one.
    #[serde(skip)]
    pub detail: String,
}

/// A single test event, serialized as `{"key": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "key", content = "value")]
pub enum Event {
    #[serde(rename = "log")]
    Log(LogRecord),
    #[serde(rename = "ndt7.measurement")]
    Measurement(MeasurementRecord),
    #[serde(rename = "measurement.failure")]
    Failure(FailureRecord),
}

impl Event {
    pub fn log(log_level: LogLevel, message: impl Into<String>) -> Self {
        Event::Log(LogRecord { log_level, message: message.into() })
    }

    pub fn measurement(origin: Origin, measurement: Measurement) -> Self {
        Event::Measurement(MeasurementRecord {
            measurement,
            is_local: origin == Origin::Local,
        })
    }

    pub fn failure(error: &TestError) -> Self {
        Event::Failure(FailureRecord {
            failure: error.to_string(),
            kind: error.kind,
            detail: format_error_for_display(error),
        })
    }

    /// One JSON object, as printed by the CLI.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Producer half of a test's event stream.
///
/// Every `emit*` call blocks while the channel is full. They return `false`
/// once the receiver is gone, which the controllers treat as cancellation.
#[derive(Debug)]
pub struct Emitter {
    tx: mpsc::Sender<Event>,
}

impl Emitter {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Create an emitter and the receiver the caller drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Must not be called from within an async context.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.blocking_send(event).is_ok()
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        info!("{}", message);
        self.emit(Event::log(LogLevel::Info, message))
    }

    pub fn measurement(&self, origin: Origin, measurement: Measurement) -> bool {
        self.emit(Event::measurement(origin, measurement))
    }

    pub fn failure(&self, error: &TestError) -> bool {
        warn!("{}", error);
        self.emit(Event::failure(error))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
