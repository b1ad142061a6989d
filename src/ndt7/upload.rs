//! Upload subtest: the client sends for a fixed duration.

use super::clock::{Clock, MonotonicClock};
use super::events::{Emitter, Origin};
use super::{
    interrupted, Controller, MessageStream, Meter, Outcome, Subtest,
    UPLOAD_PAYLOAD_SIZE,
};
use crate::errors::TestError;
use crate::settings::Settings;
use log::{debug, info};
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Upload controller.
///
/// Writes the same random binary message until the duration has passed.
/// Nothing sent by the server is read.
pub struct Upload<C: Clock = MonotonicClock> {
    settings: Settings,
    cancel: CancellationToken,
    clock: C,
}

impl Upload {
    pub fn new(settings: Settings, cancel: CancellationToken) -> Self {
        Self::with_clock(settings, cancel, MonotonicClock::new())
    }
}

impl<C: Clock> Upload<C> {
    pub fn with_clock(settings: Settings, cancel: CancellationToken, clock: C) -> Self {
        Self { settings, cancel, clock }
    }
}

/// Random bytes so the payload does not compress.
fn random_payload() -> Vec<u8> {
    let mut payload = vec![0u8; UPLOAD_PAYLOAD_SIZE];
    rand::thread_rng().fill(&mut payload[..]);
    payload
}

impl<C: Clock> Controller for Upload<C> {
    const SUBTEST: Subtest = Subtest::Upload;

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn measure<M: MessageStream>(&self, conn: &mut M, emitter: &Emitter) -> Outcome {
        let duration = self.settings.effective_duration();
        let payload = random_payload();
        let mut meter = Meter::new(&self.clock);
        info!("Beginning upload test for {:?}", duration);

        loop {
            if interrupted(Self::SUBTEST, &self.cancel, emitter) {
                return Outcome::Interrupted;
            }

            let elapsed = meter.elapsed();
            if elapsed >= duration {
                debug!("uploaded {} bytes", meter.num_bytes());
                return match conn.close() {
                    Ok(()) => Outcome::Completed,
                    Err(e) => Outcome::Failed(
                        TestError::write(e.to_string()).with_source(e),
                    ),
                };
            }

            if let Some(measurement) = meter.poll(elapsed) {
                if !emitter.measurement(Origin::Local, measurement) {
                    return Outcome::Interrupted;
                }
            }

            if let Err(e) = conn.write_binary(&payload) {
                return Outcome::Failed(
                    TestError::write(e.to_string()).with_source(e),
                );
            }
            meter.add(payload.len());
        }
    }
}
