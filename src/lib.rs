//! Client for the ndt7 network speed test protocol.
//!
//! [`ndt7::Client`] runs a download or upload test against an ndt7 server
//! and streams [`ndt7::events::Event`]s back to the caller.

pub mod errors;
pub mod measurements;
pub mod ndt7;
pub mod settings;
pub mod websocket;

pub use errors::{ErrorKind, TestError};
pub use measurements::{BbrInfo, Measurement, Summary};
pub use ndt7::events::Event;
pub use ndt7::{Client, Outcome, Subtest};
pub use settings::Settings;
