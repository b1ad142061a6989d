//! Download subtest: the server sends, the client counts.

use super::clock::{Clock, MonotonicClock};
use super::events::{Emitter, Origin};
use super::{
    interrupted, Controller, MessageStream, Meter, Outcome, Subtest, DEFAULT_TIMEOUT,
    OVERRUN_FACTOR,
};
use crate::errors::TestError;
use crate::measurements::Measurement;
use crate::settings::Settings;
use crate::websocket::{self, Message};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Download controller.
///
/// Reads messages until the server closes normally, the caller cancels,
/// an error occurs, or the test overruns twice its duration.
pub struct Download<C: Clock = MonotonicClock> {
    settings: Settings,
    cancel: CancellationToken,
    clock: C,
}

impl Download {
    pub fn new(settings: Settings, cancel: CancellationToken) -> Self {
        Self::with_clock(settings, cancel, MonotonicClock::new())
    }
}

impl<C: Clock> Download<C> {
    pub fn with_clock(settings: Settings, cancel: CancellationToken, clock: C) -> Self {
        Self { settings, cancel, clock }
    }
}

impl<C: Clock> Controller for Download<C> {
    const SUBTEST: Subtest = Subtest::Download;

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn measure<M: MessageStream>(&self, conn: &mut M, emitter: &Emitter) -> Outcome {
        let mut meter = Meter::new(&self.clock);
        let outcome = self.receive(conn, &mut meter, emitter);
        debug!("download ended after {} bytes", meter.num_bytes());
        outcome
    }
}

impl<C: Clock> Download<C> {
    /// The receive loop, counting into `meter`.
    fn receive<M: MessageStream>(
        &self,
        conn: &mut M,
        meter: &mut Meter<'_, C>,
        emitter: &Emitter,
    ) -> Outcome {
        let overrun = self.settings.effective_duration() * OVERRUN_FACTOR;
        info!("Beginning download test, aborting after {:?}", overrun);

        loop {
            if interrupted(Self::SUBTEST, &self.cancel, emitter) {
                return Outcome::Interrupted;
            }

            let elapsed = meter.elapsed();
            if elapsed >= overrun {
                return Outcome::Failed(TestError::server_overrun(
                    overrun.as_secs_f64(),
                ));
            }

            if let Some(measurement) = meter.poll(elapsed) {
                if !emitter.measurement(Origin::Local, measurement) {
                    return Outcome::Interrupted;
                }
            }

            // Never wait past the overrun bound.
            let timeout = DEFAULT_TIMEOUT.min(overrun - elapsed);
            let message = match conn.read_message(timeout) {
                Ok(message) => message,
                Err(e) if e.is_normal_closure() => return Outcome::Completed,
                Err(websocket::Error::Timeout) if meter.elapsed() >= overrun => {
                    return Outcome::Failed(TestError::server_overrun(
                        overrun.as_secs_f64(),
                    ));
                }
                Err(e) => {
                    return Outcome::Failed(
                        TestError::read(e.to_string()).with_source(e),
                    );
                }
            };

            meter.add(message.len());

            if let Message::Text(payload) = message {
                let measurement: Measurement =
                    match serde_json::from_slice(&payload) {
                        Ok(measurement) => measurement,
                        Err(e) => {
                            let text = String::from_utf8_lossy(&payload);
                            return Outcome::Failed(
                                TestError::malformed_measurement(format!(
                                    "{}: {:?}",
                                    e, text
                                ))
                                .with_source(e),
                            );
                        }
                    };
                if !emitter.measurement(Origin::Remote, measurement) {
                    return Outcome::Interrupted;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::ndt7::clock::ManualClock;
    use crate::ndt7::events::{Event, LogLevel};
    use crate::ndt7::tests::{
        drain, normal_close, run_scripted, ScriptedStream, Step,
    };
    use crate::websocket::frame::{
        close_payload, encode_frame, OpCode, CLOSE_NORMAL,
    };
    use crate::websocket::handshake::compute_accept_key;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn settings(duration: i64) -> Settings {
        let mut settings = Settings::new("127.0.0.1");
        settings.disable_tls = true;
        settings.duration = Some(duration);
        settings
    }

    fn text(json: &str) -> Step {
        Step::Message(Message::Text(json.as_bytes().to_vec()))
    }

    fn binary(len: usize) -> Step {
        Step::Message(Message::Binary(vec![0u8; len]))
    }

    fn local_measurements(events: &[Event]) -> Vec<Measurement> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Measurement(record) if record.is_local => Some(record.measurement),
                _ => None,
            })
            .collect()
    }

    fn remote_measurements(events: &[Event]) -> Vec<Measurement> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Measurement(record) if !record.is_local => {
                    Some(record.measurement)
                }
                _ => None,
            })
            .collect()
    }

    fn failures(events: &[Event]) -> Vec<ErrorKind> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Failure(record) => Some(record.kind),
                _ => None,
            })
            .collect()
    }

    fn log_messages(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Log(record) => Some(record.message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_scenario_normal_download() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(10), CancellationToken::new(), clock.clone());

        let mut steps = Vec::new();
        for _ in 0..40 {
            steps.push(Step::Advance(Duration::from_millis(100)));
            steps.push(binary(8192));
        }
        steps.push(text(
            r#"{"elapsed":4.0,"num_bytes":327680,"bbr_info":{"bandwidth":1e8,"rtt":10.0}}"#,
        ));
        steps.push(Step::Fail(normal_close()));
        let stream = ScriptedStream::new(&clock, steps);

        let (outcome, events, stream) = run_scripted(&download, stream);

        assert!(matches!(outcome, Outcome::Completed));
        assert!(stream.closed);
        assert!(failures(&events).is_empty());

        let logs = log_messages(&events);
        assert_eq!(
            logs.first().unwrap(),
            "Connecting to: ws://127.0.0.1/ndt/v7/download?duration=10"
        );
        assert_eq!(logs[1], "Connection established");
        assert_eq!(logs.last().unwrap(), "Download complete");

        let remote = remote_measurements(&events);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].bbr_info.unwrap().bandwidth, 1e8);

        let local = local_measurements(&events);
        assert!(!local.is_empty());
        for pair in local.windows(2) {
            assert!(pair[1].elapsed - pair[0].elapsed >= 0.25 - 1e-9);
            assert!(pair[1].num_bytes >= pair[0].num_bytes);
        }
    }

    #[test]
    fn test_scenario_silent_server_overruns() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(1), CancellationToken::new(), clock.clone());
        let stream = ScriptedStream::new(&clock, vec![]);

        let (outcome, events, stream) = run_scripted(&download, stream);

        match outcome {
            Outcome::Failed(e) => assert_eq!(e.kind, ErrorKind::ServerOverrun),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(failures(&events), vec![ErrorKind::ServerOverrun]);
        assert!(matches!(events.last(), Some(Event::Failure(_))));
        assert!(stream.closed);
        // Reads were capped so the overrun fires exactly at 2 s.
        assert_eq!(clock.now(), Duration::from_secs(2));
        assert!(stream.read_timeouts.iter().all(|t| *t <= DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_overrun_exactly_at_twice_the_duration() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(5), CancellationToken::new(), clock.clone());
        let mut steps = vec![binary(10)];
        // Land exactly on the bound: 10 s.
        steps.push(Step::Advance(Duration::from_millis(9_999)));
        steps.push(binary(10));
        steps.push(Step::Advance(Duration::from_millis(1)));
        steps.push(binary(10));
        steps.push(Step::Fail(normal_close()));
        let stream = ScriptedStream::new(&clock, steps);

        let (outcome, events, _) = run_scripted(&download, stream);

        match outcome {
            Outcome::Failed(e) => assert_eq!(e.kind, ErrorKind::ServerOverrun),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(failures(&events), vec![ErrorKind::ServerOverrun]);
    }

    #[test]
    fn test_just_below_overrun_still_completes() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(5), CancellationToken::new(), clock.clone());
        let steps = vec![
            Step::Advance(Duration::from_millis(9_999)),
            binary(10),
            Step::Fail(normal_close()),
        ];
        let stream = ScriptedStream::new(&clock, steps);

        let (outcome, _, _) = run_scripted(&download, stream);
        assert!(matches!(outcome, Outcome::Completed));
    }

    #[test]
    fn test_scenario_cancellation() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let download = Download::with_clock(settings(10), cancel.clone(), clock.clone());
        cancel.cancel();
        let stream = ScriptedStream::new(&clock, vec![binary(100)]);

        let (outcome, events, stream) = run_scripted(&download, stream);

        assert!(matches!(outcome, Outcome::Interrupted));
        assert!(stream.closed);
        assert!(failures(&events).is_empty());
        assert!(local_measurements(&events).is_empty());
        assert_eq!(
            events.last(),
            Some(&Event::log(LogLevel::Info, "Download interrupted by user"))
        );
    }

    #[test]
    fn test_scenario_two_server_measurements() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(10), CancellationToken::new(), clock.clone());
        let steps = vec![
            text(r#"{"elapsed":0.5,"num_bytes":1000}"#),
            text(r#"{"elapsed":1.0,"num_bytes":2000}"#),
            Step::Fail(normal_close()),
        ];
        let stream = ScriptedStream::new(&clock, steps);

        let (outcome, events, stream) = run_scripted(&download, stream);

        assert!(matches!(outcome, Outcome::Completed));
        assert!(stream.closed);
        assert!(failures(&events).is_empty());
        let counts: Vec<i64> = remote_measurements(&events)
            .iter()
            .map(|m| m.num_bytes)
            .collect();
        assert_eq!(counts, vec![1000, 2000]);
    }

    #[test]
    fn test_cancelled_while_measuring() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let download = Download::with_clock(settings(10), cancel.clone(), clock.clone());

        let mut steps = Vec::new();
        for _ in 0..20 {
            steps.push(Step::Advance(Duration::from_millis(100)));
            steps.push(binary(100));
        }
        steps.push(Step::Cancel(cancel.clone()));
        for _ in 0..10 {
            steps.push(Step::Advance(Duration::from_millis(100)));
            steps.push(binary(100));
        }
        let stream = ScriptedStream::new(&clock, steps);

        let (outcome, events, stream) = run_scripted(&download, stream);

        assert!(matches!(outcome, Outcome::Interrupted));
        assert!(stream.closed);
        assert!(failures(&events).is_empty());
        // The read in flight when the token fired is the last one.
        assert_eq!(stream.script.len(), 18);
        assert_eq!(clock.now(), Duration::from_millis(2100));

        let local = local_measurements(&events);
        assert_eq!(local.len(), 6);
        assert!(local.iter().all(|m| m.elapsed <= 1.8 + 1e-9));

        let interrupt = Event::log(LogLevel::Info, "Download interrupted by user");
        assert_eq!(events.last(), Some(&interrupt));
        assert!(matches!(
            &events[events.len() - 2],
            Event::Measurement(record) if record.is_local
        ));
        assert!(!events.contains(&Event::log(LogLevel::Info, "Download complete")));
    }

    #[test]
    fn test_malformed_frame_is_counted_before_failing() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(10), CancellationToken::new(), clock.clone());
        let steps = vec![
            binary(10),
            Step::Message(Message::Text(vec![0xff, 0xfe, b'x'])),
            binary(1000),
        ];
        let mut stream = ScriptedStream::new(&clock, steps);
        let (emitter, _rx) = Emitter::channel(16);
        let mut meter = Meter::new(&clock);

        let outcome = download.receive(&mut stream, &mut meter, &emitter);

        match outcome {
            Outcome::Failed(e) => {
                assert_eq!(e.kind, ErrorKind::MalformedMeasurement)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(meter.num_bytes(), 13);
        assert_eq!(stream.script.len(), 1);
    }

    #[test]
    fn test_malformed_measurement_fails() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(10), CancellationToken::new(), clock.clone());
        let stream = ScriptedStream::new(&clock, vec![binary(10), text("not json")]);

        let (outcome, events, stream) = run_scripted(&download, stream);

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(failures(&events), vec![ErrorKind::MalformedMeasurement]);
        assert!(matches!(events.last(), Some(Event::Failure(_))));
        assert!(stream.closed);
    }

    #[test]
    fn test_abnormal_close_is_read_error() {
        let clock = ManualClock::new();
        let download =
            Download::with_clock(settings(10), CancellationToken::new(), clock.clone());
        let steps = vec![Step::Fail(websocket::Error::Closed {
            code: 1011,
            reason: "internal".into(),
        })];
        let stream = ScriptedStream::new(&clock, steps);

        let (_, events, _) = run_scripted(&download, stream);
        assert_eq!(failures(&events), vec![ErrorKind::Read]);
    }

    #[test]
    fn test_dial_failure_is_reported() {
        let download = Download::new(settings(10), CancellationToken::new());
        let (emitter, mut rx) = Emitter::channel(16);
        let outcome = download.run_with(&emitter, |_, _| {
            Err::<ScriptedStream, _>(TestError::dial(
                "refused",
                std::io::ErrorKind::ConnectionRefused,
            ))
        });
        drop(emitter);
        let events = drain(&mut rx);

        assert!(outcome.is_failure());
        assert_eq!(failures(&events), vec![ErrorKind::Dial]);
        assert!(matches!(events.last(), Some(Event::Failure(_))));
    }

    /// Accept one WebSocket client and hand the raw stream to `serve`.
    fn spawn_server<F>(serve: F) -> (u16, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut key = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.strip_prefix("Sec-WebSocket-Key: ") {
                    key = value.trim().to_string();
                }
                if line == "\r\n" {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 101 Switching Protocols\r\n\
                Upgrade: websocket\r\n\
                Connection: Upgrade\r\n\
                Sec-WebSocket-Accept: {}\r\n\
                Sec-WebSocket-Protocol: net.measurementlab.ndt.v7\r\n\r\n",
                compute_accept_key(&key)
            )
            .unwrap();
            serve(stream);
        });
        (port, handle)
    }

    fn send(stream: &mut TcpStream, opcode: OpCode, payload: &[u8]) {
        let mut frame = Vec::new();
        encode_frame(&mut frame, opcode, payload, None);
        stream.write_all(&frame).unwrap();
    }

    #[test]
    fn test_end_to_end_download_completes() {
        let (port, server) = spawn_server(|mut stream| {
            for _ in 0..4 {
                send(&mut stream, OpCode::Binary, &[0u8; 4096]);
            }
            send(&mut stream, OpCode::Text, br#"{"elapsed":0.1,"num_bytes":16384}"#);
            send(&mut stream, OpCode::Close, &close_payload(CLOSE_NORMAL, ""));
            // Wait for the client's close reply.
            let mut buf = [0u8; 64];
            let _ = std::io::Read::read(&mut stream, &mut buf);
        });

        let mut settings = settings(10);
        settings.port = Some(port.to_string());
        let download = Download::new(settings, CancellationToken::new());
        let (emitter, mut rx) = Emitter::channel(1024);
        let outcome = download.run(&emitter);
        drop(emitter);
        server.join().unwrap();

        assert!(matches!(outcome, Outcome::Completed), "{:?}", outcome);
        let events = drain(&mut rx);
        assert!(failures(&events).is_empty());
        let remote = remote_measurements(&events);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].num_bytes, 16384);
    }

    #[test]
    fn test_end_to_end_invalid_utf8_text_is_malformed() {
        let (port, server) = spawn_server(|mut stream| {
            send(&mut stream, OpCode::Text, &[0xff, 0xfe, b'x']);
            let mut buf = [0u8; 64];
            let _ = std::io::Read::read(&mut stream, &mut buf);
        });

        let mut settings = settings(10);
        settings.port = Some(port.to_string());
        let download = Download::new(settings, CancellationToken::new());
        let (emitter, mut rx) = Emitter::channel(1024);
        let outcome = download.run(&emitter);
        drop(emitter);
        server.join().unwrap();

        assert!(outcome.is_failure());
        let events = drain(&mut rx);
        assert_eq!(failures(&events), vec![ErrorKind::MalformedMeasurement]);
    }

    #[test]
    fn test_end_to_end_silent_server_overruns() {
        let (port, server) = spawn_server(|stream| {
            // Hold the connection open without sending anything.
            thread::sleep(Duration::from_millis(2500));
            drop(stream);
        });

        let mut settings = settings(1);
        settings.port = Some(port.to_string());
        let download = Download::new(settings, CancellationToken::new());
        let (emitter, mut rx) = Emitter::channel(1024);
        let outcome = download.run(&emitter);
        drop(emitter);
        server.join().unwrap();

        match outcome {
            Outcome::Failed(e) => assert_eq!(e.kind, ErrorKind::ServerOverrun),
            other => panic!("unexpected outcome {:?}", other),
        }
        let events = drain(&mut rx);
        assert_eq!(failures(&events), vec![ErrorKind::ServerOverrun]);
    }
}
