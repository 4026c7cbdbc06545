//! In-flight frame tracking
//!
//! Every output runs the cycle `Rendering -> Submitted -> {Completed, Failed}`. A
//! [`FrameTracker`] holds the [`OutputFrame`]s of one output between submission and the
//! completion event reported by the event loop, resolves them in submission order and fails
//! those that never completed within their [`FrameTimeout`].

use std::{collections::VecDeque, time::Duration};

use tracing::{trace, warn};

use super::frame::{OutputFrame, PresentationMode};
use crate::utils::{Monotonic, Time};

/// Lifecycle state of the most recent frame of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// The frame is being rendered
    Rendering,
    /// The frame was handed to the display path and waits for completion
    Submitted,
    /// The frame reached the display
    Completed,
    /// The frame was dropped
    Failed,
}

/// Policy deciding when a submitted frame is considered lost
///
/// The deadline of a frame is `max(refresh interval * refresh_multiplier, minimum)` after its
/// submission. Outputs without a known refresh rate only use `minimum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimeout {
    /// Number of refresh cycles a frame may take
    pub refresh_multiplier: u32,
    /// Lower bound of the timeout
    pub minimum: Duration,
}

impl Default for FrameTimeout {
    fn default() -> Self {
        FrameTimeout {
            refresh_multiplier: 5,
            minimum: Duration::from_millis(50),
        }
    }
}

impl FrameTimeout {
    /// Time a frame submitted on an output with the given refresh interval may take
    pub fn timeout(&self, refresh: Option<Duration>) -> Duration {
        refresh
            .and_then(|refresh| refresh.checked_mul(self.refresh_multiplier))
            .map_or(self.minimum, |timeout| timeout.max(self.minimum))
    }
}

#[derive(Debug)]
struct PendingFrame {
    frame: OutputFrame,
    submitted: Duration,
    deadline: Duration,
    point: Option<u64>,
}

/// Per-output queue of submitted frames
#[derive(Debug)]
pub struct FrameTracker {
    state: Option<FrameState>,
    pending: VecDeque<PendingFrame>,
    timeout: FrameTimeout,
}

impl FrameTracker {
    /// Create an empty tracker using the given timeout policy
    pub fn new(timeout: FrameTimeout) -> FrameTracker {
        FrameTracker {
            state: None,
            pending: VecDeque::new(),
            timeout,
        }
    }

    /// State of the most recent frame, `None` if no frame was started yet
    pub fn state(&self) -> Option<FrameState> {
        self.state
    }

    /// Number of submitted frames waiting for completion
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Mark the start of rendering a new frame
    pub fn begin_rendering(&mut self) {
        self.state = Some(FrameState::Rendering);
    }

    /// Rendering was abandoned before anything got submitted
    pub fn abort_rendering(&mut self) {
        if self.state == Some(FrameState::Rendering) {
            self.state = Some(FrameState::Failed);
        }
    }

    /// Queue a frame for completion
    ///
    /// `point` is the timeline point signaling completion, if the frame completes through a
    /// timeline instead of a page-flip event.
    pub fn submit(
        &mut self,
        frame: OutputFrame,
        now: Time<Monotonic>,
        refresh: Option<Duration>,
        point: Option<u64>,
    ) {
        let submitted: Duration = now.into();
        let deadline = submitted.saturating_add(self.timeout.timeout(refresh));
        trace!(?point, ?deadline, "Frame submitted");
        self.pending.push_back(PendingFrame {
            frame,
            submitted,
            deadline,
            point,
        });
        self.state = Some(FrameState::Submitted);
    }

    /// Complete the oldest submitted frame
    ///
    /// Returns `false` if no frame was in flight.
    pub fn complete_next(&mut self, refresh: Duration, timestamp: Duration, mode: PresentationMode) -> bool {
        let Some(pending) = self.pending.pop_front() else {
            trace!("Completion event without a pending frame");
            return false;
        };
        let render_time = timestamp.saturating_sub(pending.submitted);
        pending.frame.presented(refresh, timestamp, render_time, mode);
        if self.pending.is_empty() {
            self.state = Some(FrameState::Completed);
        }
        true
    }

    /// Complete the oldest submitted frame if it waits for `point`
    ///
    /// Signals of frames that already expired or were failed are ignored and return `false`.
    pub fn complete_point(
        &mut self,
        point: u64,
        refresh: Duration,
        timestamp: Duration,
        mode: PresentationMode,
    ) -> bool {
        match self.pending.front() {
            Some(pending) if pending.point == Some(point) => self.complete_next(refresh, timestamp, mode),
            _ => {
                trace!(point, "Ignoring signal of a stale timeline point");
                false
            }
        }
    }

    /// Fail every submitted frame, returning how many were failed
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for pending in self.pending.drain(..) {
            pending.frame.failed();
        }
        if count > 0 || self.state == Some(FrameState::Rendering) {
            self.state = Some(FrameState::Failed);
        }
        count
    }

    /// Fail every frame whose deadline passed, returning how many were failed
    pub fn expire(&mut self, now: Time<Monotonic>) -> usize {
        let now: Duration = now.into();
        let mut expired = 0;
        while self.pending.front().map_or(false, |pending| pending.deadline <= now) {
            if let Some(pending) = self.pending.pop_front() {
                warn!(point = ?pending.point, "Frame did not complete in time, failing it");
                pending.frame.failed();
                expired += 1;
            }
        }
        if expired > 0 && self.pending.is_empty() {
            self.state = Some(FrameState::Failed);
        }
        expired
    }

    /// Earliest deadline of the submitted frames
    pub fn next_deadline(&self) -> Option<Time<Monotonic>> {
        self.pending.iter().map(|pending| pending.deadline).min().map(Time::from)
    }
}
