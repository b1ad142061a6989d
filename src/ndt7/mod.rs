//! ndt7 test engine.
//!
//! A test runs on a blocking task, owns a single WebSocket connection and
//! reports through an [`events::Emitter`]. The caller drains the returned
//! receiver until it closes and may cancel through a
//! [`CancellationToken`].

pub mod clock;
pub mod connection;
pub mod download;
pub mod endpoint;
pub mod events;
pub mod scramble;
pub mod upload;

use crate::errors::TestError;
use crate::measurements::Measurement;
use crate::settings::Settings;
use crate::websocket::{self, Message, Transport, WebSocket};
use clock::Clock;
use download::Download;
use events::{Emitter, Event, EVENT_CHANNEL_CAPACITY};
use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upload::Upload;
use url::Url;

pub const DOWNLOAD_PATH: &str = "/ndt/v7/download";
pub const UPLOAD_PATH: &str = "/ndt/v7/upload";

/// WebSocket subprotocol the server requires.
pub const SUBPROTOCOL: &str = "net.measurementlab.ndt.v7";

/// Bound on the handshake, on each download read and on each upload write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum spacing between two local measurements.
pub const MIN_MEASUREMENT_INTERVAL: Duration = Duration::from_millis(250);

/// Largest message accepted from the server.
pub const MAX_MESSAGE_SIZE: usize = 1 << 17;

/// A download running longer than this many times its duration is aborted.
pub const OVERRUN_FACTOR: u32 = 2;

/// Size of the binary message sent repeatedly during upload.
pub const UPLOAD_PAYLOAD_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtest {
    Download,
    Upload,
}

impl Subtest {
    pub fn path(&self) -> &'static str {
        match self {
            Subtest::Download => DOWNLOAD_PATH,
            Subtest::Upload => UPLOAD_PATH,
        }
    }
}

impl fmt::Display for Subtest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subtest::Download => write!(f, "Download"),
            Subtest::Upload => write!(f, "Upload"),
        }
    }
}

/// Message-level view of a connection, as used by the controllers.
pub trait MessageStream {
    fn read_message(&mut self, timeout: Duration) -> Result<Message, websocket::Error>;

    fn write_binary(&mut self, payload: &[u8]) -> Result<(), websocket::Error>;

    /// Start the close handshake and release the connection.
    fn close(&mut self) -> Result<(), websocket::Error>;
}

impl<M: MessageStream + ?Sized> MessageStream for &mut M {
    fn read_message(&mut self, timeout: Duration) -> Result<Message, websocket::Error> {
        (**self).read_message(timeout)
    }

    fn write_binary(&mut self, payload: &[u8]) -> Result<(), websocket::Error> {
        (**self).write_binary(payload)
    }

    fn close(&mut self) -> Result<(), websocket::Error> {
        (**self).close()
    }
}

impl<S: Transport> MessageStream for WebSocket<S> {
    fn read_message(&mut self, timeout: Duration) -> Result<Message, websocket::Error> {
        WebSocket::read_message(self, timeout)
    }

    fn write_binary(&mut self, payload: &[u8]) -> Result<(), websocket::Error> {
        WebSocket::write_binary(self, payload)
    }

    fn close(&mut self) -> Result<(), websocket::Error> {
        WebSocket::close(self)
    }
}

/// How a test ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// Cancelled by the caller. Not an error.
    Interrupted,
    Failed(TestError),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// Counts bytes and decides when the next local measurement is due.
pub(crate) struct Meter<'c, C: Clock> {
    clock: &'c C,
    start: Duration,
    last_emitted: Duration,
    num_bytes: i64,
}

impl<'c, C: Clock> Meter<'c, C> {
    pub(crate) fn new(clock: &'c C) -> Self {
        Self { clock, start: clock.now(), last_emitted: Duration::ZERO, num_bytes: 0 }
    }

    /// Time since the meter started.
    pub(crate) fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    pub(crate) fn add(&mut self, bytes: usize) {
        self.num_bytes += bytes as i64;
    }

    pub(crate) fn num_bytes(&self) -> i64 {
        self.num_bytes
    }

    /// The local measurement for `elapsed`, if the interval has passed.
    pub(crate) fn poll(&mut self, elapsed: Duration) -> Option<Measurement> {
        if elapsed.saturating_sub(self.last_emitted) < MIN_MEASUREMENT_INTERVAL {
            return None;
        }
        self.last_emitted = elapsed;
        Some(Measurement::new(elapsed.as_secs_f64(), self.num_bytes))
    }
}

/// A download or upload state machine.
pub trait Controller {
    const SUBTEST: Subtest;

    fn settings(&self) -> &Settings;

    /// Drive an established connection to a terminal state.
    ///
    /// Does not close the connection.
    fn measure<M: MessageStream>(&self, conn: &mut M, emitter: &Emitter) -> Outcome;

    /// Run the whole test over a connection made by `connect`.
    ///
    /// The connection is closed on every path before the outcome is
    /// reported, so a failure is always the last event.
    fn run_with<M, F>(&self, emitter: &Emitter, connect: F) -> Outcome
    where
        M: MessageStream,
        F: FnOnce(&Settings, &Url) -> Result<M, TestError>,
    {
        let outcome = match endpoint::build_url(self.settings(), Self::SUBTEST) {
            Err(e) => Outcome::Failed(e),
            Ok(url) => {
                emitter.info(format!("Connecting to: {}", url));
                match connect(self.settings(), &url) {
                    Err(e) => Outcome::Failed(e),
                    Ok(mut conn) => {
                        emitter.info("Connection established");
                        let outcome = self.measure(&mut conn, emitter);
                        if let Err(e) = conn.close() {
                            debug!("closing connection: {}", e);
                        }
                        outcome
                    }
                }
            }
        };

        match &outcome {
            Outcome::Completed => {
                emitter.info(format!("{} complete", Self::SUBTEST));
            }
            Outcome::Interrupted => {}
            Outcome::Failed(e) => {
                emitter.failure(e);
            }
        }
        outcome
    }

    fn run(&self, emitter: &Emitter) -> Outcome {
        self.run_with(emitter, connection::dial)
    }
}

/// Poll for cancellation, logging the interruption once detected.
///
/// A dropped receiver counts as cancellation.
pub(crate) fn interrupted(
    subtest: Subtest,
    cancel: &CancellationToken,
    emitter: &Emitter,
) -> bool {
    if cancel.is_cancelled() || emitter.is_closed() {
        emitter.info(format!("{} interrupted by user", subtest));
        return true;
    }
    false
}

/// Entry point for running tests in the background.
#[derive(Debug, Clone)]
pub struct Client {
    settings: Settings,
}

impl Client {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start a download test. Must be called within a Tokio runtime.
    pub fn download(&self, cancel: CancellationToken) -> mpsc::Receiver<Event> {
        self.start(Subtest::Download, cancel)
    }

    /// Start an upload test. Must be called within a Tokio runtime.
    pub fn upload(&self, cancel: CancellationToken) -> mpsc::Receiver<Event> {
        self.start(Subtest::Upload, cancel)
    }

    /// Spawn `subtest` on a blocking task and return its event stream.
    pub fn start(
        &self,
        subtest: Subtest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Event> {
        let (emitter, rx) = Emitter::channel(EVENT_CHANNEL_CAPACITY);
        let settings = self.settings.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = match subtest {
                Subtest::Download => Download::new(settings, cancel).run(&emitter),
                Subtest::Upload => Upload::new(settings, cancel).run(&emitter),
            };
            debug!("{} finished: {:?}", subtest, outcome);
        });

        rx
    }
}
