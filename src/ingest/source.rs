//! Pull-based frame source with bounded reconnection.
//!
//! `StreamSource` owns at most one open `Connection`. A failed read releases
//! it, spends one unit of the reconnect budget and schedules the replacement
//! at `now + delay`; calls before that instant return `NoFrame` without
//! touching the transport. The first call at or after the retry instant opens
//! the replacement and reads from it in the same call.
//!
//! `stop()` may come from any thread (through a `SourceHandle`). It forces the
//! budget to zero and releases the connection exactly once. Connects and reads
//! run outside the state lock, so `stop()` never waits on the transport; a
//! read that was in flight when the source stopped releases its connection
//! and reports `EndOfStream`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use super::{Connection, Connector, SourceUri};
use crate::error::ConnectionError;
use crate::frame::Frame;

pub const DEFAULT_RESET_ATTEMPTS: u32 = 20;
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_secs(5);

const RECONNECT_TIME_FORMAT: &str = "%m-%d-%Y %I:%M:%S%p";

/// How many times a source may reconnect, and how long it waits first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Never reconnect: the first failed read ends the stream.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RESET_ATTEMPTS, DEFAULT_RESET_DELAY)
    }
}

/// Result of one `next_frame` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// No frame this time; the source may still produce more.
    NoFrame,
    /// The source is stopped or out of reconnect budget.
    EndOfStream,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub reconnects: u64,
    pub failures: u64,
    /// Redacted source URI.
    pub uri: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct Link {
    lifecycle: Lifecycle,
    connection: Option<Box<dyn Connection>>,
    remaining: u32,
    retry_at: Option<Instant>,
    exhausted: bool,
    stats: SourceStats,
}

impl Link {
    fn release_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.release();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.release_connection();
    }
}

struct Shared {
    stopped: AtomicBool,
    link: Mutex<Link>,
    connector: Mutex<Box<dyn Connector>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, uri: &SourceUri) -> anyhow::Result<Box<dyn Connection>> {
        self.connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connect(uri)
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut link = self.lock();
        link.lifecycle = Lifecycle::Stopped;
        link.remaining = 0;
        link.retry_at = None;
        link.release_connection();
        log::info!("StreamSource: stopped {}", link.stats.uri);
    }
}

/// Cloneable stop handle for a `StreamSource`.
#[derive(Clone)]
pub struct SourceHandle {
    shared: Arc<Shared>,
}

impl SourceHandle {
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

pub struct StreamSource {
    uri: SourceUri,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
}

impl StreamSource {
    pub fn new(uri: SourceUri, connector: Box<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let link = Link {
            lifecycle: Lifecycle::Idle,
            connection: None,
            remaining: policy.attempts,
            retry_at: None,
            exhausted: false,
            stats: SourceStats {
                uri: uri.redacted(),
                ..SourceStats::default()
            },
        };
        Self {
            uri,
            policy,
            shared: Arc::new(Shared {
                stopped: AtomicBool::new(false),
                link: Mutex::new(link),
                connector: Mutex::new(connector),
            }),
        }
    }

    /// Open the first connection. Failures are returned, never retried here.
    pub fn open(&self) -> Result<(), ConnectionError> {
        self.check_idle()?;
        let mut connection = self
            .shared
            .connect(&self.uri)
            .map_err(|err| self.connection_error(err))?;
        let mut link = self.shared.lock();
        if let Err(err) = self.check_lifecycle(&link) {
            connection.release();
            return Err(err);
        }
        link.connection = Some(connection);
        link.lifecycle = Lifecycle::Running;
        log::info!("StreamSource: connected to {}", self.uri);
        Ok(())
    }

    fn check_idle(&self) -> Result<(), ConnectionError> {
        let link = self.shared.lock();
        self.check_lifecycle(&link)
    }

    fn check_lifecycle(&self, link: &Link) -> Result<(), ConnectionError> {
        match link.lifecycle {
            Lifecycle::Idle => Ok(()),
            Lifecycle::Running => Err(self.connection_error(anyhow!("source is already open"))),
            Lifecycle::Stopped => Err(self.connection_error(anyhow!("source was stopped"))),
        }
    }

    /// Read the next frame. A source has a single reader; only `stop()` is
    /// expected from other threads.
    pub fn next_frame(&self) -> ReadOutcome {
        self.next_frame_at(Instant::now())
    }

    /// `next_frame` against an explicit clock.
    pub fn next_frame_at(&self, now: Instant) -> ReadOutcome {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return ReadOutcome::EndOfStream;
        }
        let mut link = self.shared.lock();
        if link.lifecycle != Lifecycle::Running || link.exhausted {
            return ReadOutcome::EndOfStream;
        }

        let retry_at = link.retry_at;
        let mut connection = match retry_at {
            Some(retry_at) if now < retry_at => return ReadOutcome::NoFrame,
            Some(_) => {
                link.retry_at = None;
                drop(link);
                let connected = self.shared.connect(&self.uri);
                link = self.shared.lock();
                match connected {
                    Ok(mut connection) if link.lifecycle == Lifecycle::Stopped => {
                        connection.release();
                        return ReadOutcome::EndOfStream;
                    }
                    Ok(connection) => {
                        link.stats.reconnects += 1;
                        log::info!("StreamSource: reconnected to {}", self.uri);
                        connection
                    }
                    Err(_) if link.lifecycle == Lifecycle::Stopped => {
                        return ReadOutcome::EndOfStream
                    }
                    Err(err) => return self.fail(&mut link, now, err),
                }
            }
            None => match link.connection.take() {
                Some(connection) => connection,
                None => return self.fail(&mut link, now, anyhow!("no open connection")),
            },
        };
        drop(link);

        let read = connection.read_frame();
        let mut link = self.shared.lock();
        if link.lifecycle == Lifecycle::Stopped {
            connection.release();
            return ReadOutcome::EndOfStream;
        }
        match read {
            Ok(frame) => {
                link.connection = Some(connection);
                link.stats.frames_read += 1;
                ReadOutcome::Frame(frame)
            }
            Err(err) => {
                connection.release();
                self.fail(&mut link, now, err)
            }
        }
    }

    fn fail(&self, link: &mut Link, now: Instant, err: anyhow::Error) -> ReadOutcome {
        link.stats.failures += 1;
        link.release_connection();
        log::warn!("StreamSource: read from {} failed: {:#}", self.uri, err);

        if link.remaining == 0 {
            link.exhausted = true;
            log::warn!("StreamSource: {} ended, no reconnect budget", self.uri);
            return ReadOutcome::EndOfStream;
        }

        link.remaining -= 1;
        log::warn!(
            "re-connection attempt-{} at time:{} ({})",
            link.remaining,
            chrono::Local::now().format(RECONNECT_TIME_FORMAT),
            self.uri
        );
        if link.remaining == 0 {
            link.exhausted = true;
            log::warn!("StreamSource: {} exhausted its reconnect budget", self.uri);
        } else {
            link.retry_at = Some(now + self.policy.delay);
        }
        ReadOutcome::NoFrame
    }

    /// Stop the source. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Restore the configured budget. Has no effect once stopped.
    ///
    /// An exhausted source becomes eligible to reconnect on the next call.
    pub fn reset_budget(&self) -> bool {
        let mut link = self.shared.lock();
        if link.lifecycle == Lifecycle::Stopped || self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        link.remaining = self.policy.attempts;
        if link.exhausted && link.lifecycle == Lifecycle::Running {
            link.exhausted = false;
            link.retry_at = Some(Instant::now());
        }
        true
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.shared.lock().remaining
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.shared.lock().retry_at
    }

    pub fn is_running(&self) -> bool {
        let link = self.shared.lock();
        link.lifecycle == Lifecycle::Running && !link.exhausted
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.lock().stats.clone()
    }

    pub fn uri(&self) -> &SourceUri {
        &self.uri
    }

    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn connection_error(&self, source: anyhow::Error) -> ConnectionError {
        ConnectionError::new(self.uri.redacted(), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Script {
        /// `true` reads succeed; an empty script fails every read.
        reads: VecDeque<bool>,
        failing_connects: u32,
        reads_taken: u8,
        connects: u32,
        releases: u32,
    }

    struct ScriptedConnector(Arc<Mutex<Script>>);

    struct ScriptedConnection(Arc<Mutex<Script>>);

    impl Connector for ScriptedConnector {
        fn connect(&mut self, _uri: &SourceUri) -> anyhow::Result<Box<dyn Connection>> {
            let mut script = self.0.lock().unwrap();
            script.connects += 1;
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                anyhow::bail!("camera refused connection");
            }
            Ok(Box::new(ScriptedConnection(Arc::clone(&self.0))))
        }
    }

    impl Connection for ScriptedConnection {
        fn read_frame(&mut self) -> anyhow::Result<Frame> {
            let mut script = self.0.lock().unwrap();
            script.reads_taken += 1;
            let tag = script.reads_taken;
            match script.reads.pop_front() {
                Some(true) => Ok(Frame::from_rgb(1, 1, vec![tag; 3])?),
                _ => anyhow::bail!("read {} failed", tag),
            }
        }

        fn release(&mut self) {
            self.0.lock().unwrap().releases += 1;
        }
    }

    fn scripted(reads: &[bool], attempts: u32, delay: Duration) -> (StreamSource, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            reads: reads.iter().copied().collect(),
            ..Script::default()
        }));
        let uri = SourceUri::parse("stub://scripted").unwrap();
        let source = StreamSource::new(
            uri,
            Box::new(ScriptedConnector(Arc::clone(&script))),
            ReconnectPolicy::new(attempts, delay),
        );
        (source, script)
    }

    fn tag(outcome: ReadOutcome) -> u8 {
        match outcome {
            ReadOutcome::Frame(frame) => frame.as_bytes()[0],
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn reconnect_sequence_with_two_attempts() -> anyhow::Result<()> {
        let delay = Duration::from_secs(5);
        let (source, script) = scripted(&[false, true, false], 2, delay);
        source.open()?;
        let t0 = Instant::now();

        assert_eq!(source.next_frame_at(t0), ReadOutcome::NoFrame);
        assert_eq!(source.remaining_attempts(), 1);
        assert_eq!(source.retry_at(), Some(t0 + delay));

        assert_eq!(tag(source.next_frame_at(t0 + delay)), 2);

        assert_eq!(source.next_frame_at(t0 + delay), ReadOutcome::NoFrame);
        assert_eq!(source.remaining_attempts(), 0);
        assert!(!source.is_running());

        assert_eq!(source.next_frame_at(t0 + delay * 4), ReadOutcome::EndOfStream);
        assert_eq!(source.next_frame_at(t0 + delay * 5), ReadOutcome::EndOfStream);

        let script = script.lock().unwrap();
        assert_eq!(script.connects, 2);
        assert_eq!(script.releases, 2);
        Ok(())
    }

    #[test]
    fn pending_retry_does_not_touch_transport() -> anyhow::Result<()> {
        let delay = Duration::from_millis(200);
        let (source, script) = scripted(&[false, true], 3, delay);
        source.open()?;
        let t0 = Instant::now();

        assert_eq!(source.next_frame_at(t0), ReadOutcome::NoFrame);
        for step in 1..4 {
            let now = t0 + Duration::from_millis(50 * step);
            assert_eq!(source.next_frame_at(now), ReadOutcome::NoFrame);
        }
        {
            let script = script.lock().unwrap();
            assert_eq!(script.connects, 1);
            assert_eq!(script.reads_taken, 1);
        }
        assert_eq!(source.remaining_attempts(), 2);

        assert_eq!(tag(source.next_frame_at(t0 + delay)), 2);
        assert_eq!(source.stats().reconnects, 1);
        Ok(())
    }

    #[test]
    fn budget_never_increases_on_its_own() -> anyhow::Result<()> {
        let (source, _script) = scripted(&[false, true, true, false, true, false], 5, Duration::ZERO);
        source.open()?;
        let mut previous = source.remaining_attempts();
        let t0 = Instant::now();
        for _ in 0..8 {
            source.next_frame_at(t0);
            let remaining = source.remaining_attempts();
            assert!(remaining <= previous);
            previous = remaining;
        }
        Ok(())
    }

    #[test]
    fn zero_budget_ends_on_first_failure() -> anyhow::Result<()> {
        let (source, script) = scripted(&[true, false, true], 0, Duration::ZERO);
        source.open()?;
        assert_eq!(tag(source.next_frame()), 1);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        let script = script.lock().unwrap();
        assert_eq!(script.connects, 1);
        assert_eq!(script.reads_taken, 2);
        Ok(())
    }

    #[test]
    fn unopened_source_yields_end_of_stream() {
        let (source, script) = scripted(&[true], 2, Duration::ZERO);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        assert_eq!(script.lock().unwrap().connects, 0);
    }

    #[test]
    fn stop_is_idempotent_and_releases_once() -> anyhow::Result<()> {
        let (source, script) = scripted(&[true, true, true], 2, Duration::ZERO);
        source.open()?;
        assert_eq!(tag(source.next_frame()), 1);

        source.stop();
        source.stop();
        source.handle().stop();

        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        assert_eq!(source.remaining_attempts(), 0);
        assert!(source.open().is_err());
        assert_eq!(script.lock().unwrap().releases, 1);
        Ok(())
    }

    #[test]
    fn stop_from_another_thread() -> anyhow::Result<()> {
        let (source, script) = scripted(&[true; 16], 2, Duration::ZERO);
        source.open()?;
        let handle = source.handle();
        std::thread::spawn(move || handle.stop())
            .join()
            .expect("stop thread");

        assert!(source.handle().is_stopped());
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        assert_eq!(script.lock().unwrap().reads_taken, 0);
        assert_eq!(script.lock().unwrap().releases, 1);
        Ok(())
    }

    #[test]
    fn open_failure_is_reported_not_retried() {
        let (source, script) = scripted(&[true], 3, Duration::ZERO);
        script.lock().unwrap().failing_connects = 1;

        let err = source.open().unwrap_err();
        assert!(err.to_string().contains("stub://scripted"));
        assert_eq!(script.lock().unwrap().connects, 1);
        assert_eq!(source.remaining_attempts(), 3);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn failed_reconnect_consumes_budget() -> anyhow::Result<()> {
        let (source, script) = scripted(&[false, true], 3, Duration::ZERO);
        source.open()?;
        let t0 = Instant::now();

        assert_eq!(source.next_frame_at(t0), ReadOutcome::NoFrame);
        script.lock().unwrap().failing_connects = 1;
        assert_eq!(source.next_frame_at(t0), ReadOutcome::NoFrame);
        assert_eq!(source.remaining_attempts(), 1);

        assert_eq!(tag(source.next_frame_at(t0)), 2);
        assert_eq!(source.stats().failures, 2);
        Ok(())
    }

    struct SlowConnector(Arc<Mutex<Script>>);

    struct SlowConnection(Arc<Mutex<Script>>);

    impl Connector for SlowConnector {
        fn connect(&mut self, _uri: &SourceUri) -> anyhow::Result<Box<dyn Connection>> {
            self.0.lock().unwrap().connects += 1;
            Ok(Box::new(SlowConnection(Arc::clone(&self.0))))
        }
    }

    impl Connection for SlowConnection {
        fn read_frame(&mut self) -> anyhow::Result<Frame> {
            std::thread::sleep(Duration::from_millis(400));
            self.0.lock().unwrap().reads_taken += 1;
            Ok(Frame::from_rgb(1, 1, vec![9; 3])?)
        }

        fn release(&mut self) {
            self.0.lock().unwrap().releases += 1;
        }
    }

    #[test]
    fn stop_does_not_wait_for_in_flight_read() -> anyhow::Result<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = StreamSource::new(
            SourceUri::parse("stub://slow")?,
            Box::new(SlowConnector(Arc::clone(&script))),
            ReconnectPolicy::new(2, Duration::ZERO),
        );
        source.open()?;
        let handle = source.handle();

        let (outcome, stop_took) = std::thread::scope(|scope| {
            let reader = scope.spawn(|| source.next_frame());
            std::thread::sleep(Duration::from_millis(100));
            let started = Instant::now();
            handle.stop();
            let stop_took = started.elapsed();
            (reader.join().expect("reader thread"), stop_took)
        });

        assert!(stop_took < Duration::from_millis(200), "stop waited {:?}", stop_took);
        assert_eq!(outcome, ReadOutcome::EndOfStream);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);
        let script = script.lock().unwrap();
        assert_eq!(script.reads_taken, 1);
        assert_eq!(script.releases, 1);
        Ok(())
    }

    #[test]
    fn reset_budget_revives_exhausted_source() -> anyhow::Result<()> {
        let (source, _script) = scripted(&[false, true], 1, Duration::ZERO);
        source.open()?;
        assert_eq!(source.next_frame(), ReadOutcome::NoFrame);
        assert_eq!(source.next_frame(), ReadOutcome::EndOfStream);

        assert!(source.reset_budget());
        assert_eq!(source.remaining_attempts(), 1);
        assert_eq!(tag(source.next_frame()), 2);

        source.stop();
        assert!(!source.reset_budget());
        assert_eq!(source.remaining_attempts(), 0);
        Ok(())
    }
}
