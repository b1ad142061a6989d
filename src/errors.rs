//! Error types for the ndt7 test engine.
//!
//! Every error here is terminal for the test that produced it. The engine
//! reports it exactly once, as the last event before the event stream
//! closes. User cancellation is not an error and has no variant here.

use std::error::Error;
use std::fmt;
use std::io;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// At least one test reported a failure.
    pub const TEST_FAILURE: i32 = 1;
    /// Configuration error (invalid arguments, bad settings JSON).
    pub const CONFIG_ERROR: i32 = 3;
}

/// Categories of errors that can terminate a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The hostname (with an explicit port) cannot form a valid URL.
    InvalidHostname,
    /// DNS, TCP, TLS or WebSocket handshake failure.
    Dial,
    /// I/O failure while reading, other than a normal closure.
    Read,
    /// I/O failure while writing.
    Write,
    /// A text message did not decode as a measurement.
    MalformedMeasurement,
    /// The server kept the test running past its time budget.
    ServerOverrun,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvalidHostname => exit_codes::CONFIG_ERROR,
            _ => exit_codes::TEST_FAILURE,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::InvalidHostname => "Invalid hostname",
            ErrorKind::Dial => "Connection error",
            ErrorKind::Read => "Read error",
            ErrorKind::Write => "Write error",
            ErrorKind::MalformedMeasurement => "Malformed measurement",
            ErrorKind::ServerOverrun => "Server overrun",
        }
    }
}

/// A user-friendly error type for ndt7 test operations.
#[derive(Debug)]
pub struct TestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl TestError {
    /// Create a new TestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn invalid_hostname(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidHostname, message).with_suggestion(
            "Pass a bare hostname, an IPv4 address or an IPv6 address without brackets.",
        )
    }

    /// Create a dial error, picking a suggestion from the I/O error kind.
    pub fn dial(message: impl Into<String>, kind: io::ErrorKind) -> Self {
        let error = Self::new(ErrorKind::Dial, message);
        match kind {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => error
                .with_suggestion(
                    "The server may be slow or unreachable. Try again later.",
                ),
            io::ErrorKind::ConnectionRefused => error.with_suggestion(
                "Check the port and whether TLS should be disabled.",
            ),
            io::ErrorKind::InvalidData => error.with_suggestion(
                "There may be a certificate issue. Check your system time.",
            ),
            _ => error
                .with_suggestion("Check your internet connection and try again."),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Read, message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Write, message)
    }

    pub fn malformed_measurement(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedMeasurement, message)
    }

    /// Create an overrun error for a test that ran longer than `limit_secs`.
    pub fn server_overrun(limit_secs: f64) -> Self {
        Self::new(
            ErrorKind::ServerOverrun,
            format!("server kept the test running for more than {:.1} s", limit_secs),
        )
        .with_suggestion("The server is misbehaving. Try a different server.")
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

impl Error for TestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Format an error for user display.
///
/// This function creates a user-friendly error message that includes
/// the error description and any available suggestions.
pub fn format_error_for_display(error: &TestError) -> String {
    let mut output = format!("Error: {}", error);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}
