//! One viewer's inference loop.
//!
//! A `StreamSession` pulls frames from its `StreamSource`, gates them through
//! a `RateLimiter`, runs the detector on admitted frames and hands each result
//! to the caller as an `Emission`. The session owns its source; stop requests
//! arrive through a cloneable `SessionHandle` and are checked before every
//! read and again before every emission.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::detect::{run_detector, DetectionResult, SharedBackend};
use crate::error::SessionError;
use crate::frame::Frame;
use crate::ingest::{ReadOutcome, SourceHandle, SourceStats, StreamSource};
use crate::rate::RateLimiter;

/// Longest single sleep while a reconnect is pending.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Exhausted,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Exhausted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    Exhausted,
}

/// An inference result ready for the consumer.
#[derive(Debug)]
pub struct Emission {
    /// 1-based, strictly increasing per session.
    pub sequence: u64,
    pub frame: Frame,
    pub detections: DetectionResult,
}

/// Outcome of one loop iteration.
#[derive(Debug)]
pub enum Step {
    Emitted(Emission),
    /// A frame was read but dropped by the limiter or a failed inference.
    Skipped,
    /// The source had no frame (reconnect pending).
    Waiting,
    Ended(SessionEnd),
}

struct Control {
    stop_requested: AtomicBool,
    state: Mutex<SessionState>,
    source: SourceHandle,
}

impl Control {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut state = self.state();
            *state = match *state {
                SessionState::Idle => SessionState::Stopped,
                SessionState::Running => SessionState::Stopping,
                other => other,
            };
        }
        self.source.stop();
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Cloneable stop handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<Control>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.control.request_stop();
    }

    pub fn state(&self) -> SessionState {
        *self.control.state()
    }
}

pub struct StreamSession {
    camera: String,
    source: StreamSource,
    limiter: RateLimiter,
    backend: SharedBackend,
    control: Arc<Control>,
    sequence: u64,
}

impl StreamSession {
    pub fn new(
        camera: impl Into<String>,
        source: StreamSource,
        limiter: RateLimiter,
        backend: SharedBackend,
    ) -> Self {
        let control = Arc::new(Control {
            stop_requested: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            source: source.handle(),
        });
        Self {
            camera: camera.into(),
            source,
            limiter,
            backend,
            control,
            sequence: 0,
        }
    }

    /// Open the source and move to `Running`.
    ///
    /// A connection failure leaves the session `Stopped`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        {
            let state = self.control.state();
            if *state != SessionState::Idle {
                return Err(SessionError::NotIdle {
                    camera: self.camera.clone(),
                    state: state.name(),
                });
            }
        }
        if let Err(err) = self.source.open() {
            *self.control.state() = SessionState::Stopped;
            log::warn!("StreamSession[{}]: {}", self.camera, err);
            return Err(err.into());
        }
        let mut state = self.control.state();
        if *state == SessionState::Idle {
            *state = SessionState::Running;
            log::info!("StreamSession[{}]: running on {}", self.camera, self.source.uri());
        }
        Ok(())
    }

    /// Run one iteration against `now`.
    pub fn step(&mut self, now: Instant) -> Step {
        if self.control.stop_requested() {
            return Step::Ended(self.finish(SessionEnd::Stopped));
        }
        match self.state() {
            SessionState::Running => {}
            SessionState::Exhausted => return Step::Ended(SessionEnd::Exhausted),
            _ => return Step::Ended(SessionEnd::Stopped),
        }

        let frame = match self.source.next_frame_at(now) {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::NoFrame => return Step::Waiting,
            ReadOutcome::EndOfStream => {
                let end = if self.control.stop_requested() {
                    SessionEnd::Stopped
                } else {
                    SessionEnd::Exhausted
                };
                return Step::Ended(self.finish(end));
            }
        };

        if !self.limiter.admit(now) {
            return Step::Skipped;
        }

        let detections = match run_detector(&self.backend, &frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("StreamSession[{}]: inference failed: {:#}", self.camera, err);
                return Step::Skipped;
            }
        };

        if self.control.stop_requested() {
            return Step::Ended(self.finish(SessionEnd::Stopped));
        }
        self.sequence += 1;
        Step::Emitted(Emission {
            sequence: self.sequence,
            frame,
            detections,
        })
    }

    /// Loop until the session ends, handing every emission to `emit`.
    ///
    /// An error from `emit` means the consumer is gone and stops the session.
    pub fn run<F>(&mut self, mut emit: F) -> SessionEnd
    where
        F: FnMut(Emission) -> Result<()>,
    {
        loop {
            match self.step(Instant::now()) {
                Step::Emitted(emission) => {
                    let sequence = emission.sequence;
                    if let Err(err) = emit(emission) {
                        log::info!(
                            "StreamSession[{}]: consumer gone after frame {}: {:#}",
                            self.camera,
                            sequence,
                            err
                        );
                        self.control.request_stop();
                    }
                }
                Step::Skipped => {}
                Step::Waiting => self.wait(),
                Step::Ended(end) => return end,
            }
        }
    }

    fn wait(&self) {
        if self.control.stop_requested() {
            return;
        }
        let slice = match self.source.retry_at() {
            Some(at) => at.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
            None => Duration::ZERO,
        };
        if !slice.is_zero() {
            thread::sleep(slice);
        }
    }

    fn finish(&mut self, end: SessionEnd) -> SessionEnd {
        self.source.stop();
        let mut state = self.control.state();
        if !state.is_terminal() {
            *state = match end {
                SessionEnd::Stopped => SessionState::Stopped,
                SessionEnd::Exhausted => SessionState::Exhausted,
            };
            log::info!(
                "StreamSession[{}]: {} after {} emissions",
                self.camera,
                state.name(),
                self.sequence
            );
        }
        end
    }

    pub fn state(&self) -> SessionState {
        *self.control.state()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }
}
