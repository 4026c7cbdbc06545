//! Per-frame presentation bookkeeping
//!
//! An [`OutputFrame`] is created by the frame scheduler of an output when a new frame starts
//! rendering. Scene code attaches [`PresentationFeedback`] subscribers to it (typically one per
//! client surface that asked for presentation timing) and the render backend resolves it once
//! the frame either reached the display or was dropped.
//!
//! A frame is resolved exactly once: both [`OutputFrame::presented`] and [`OutputFrame::failed`]
//! consume it, and dropping an unresolved frame reports a failure.

use std::{fmt, sync::Arc, time::Duration};

use tracing::warn;

/// How a frame was presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationMode {
    /// Presented at the start of a vertical blank, with a fixed refresh rate
    VSync,
    /// Presented at the start of a vertical blank of a variable refresh rate display
    AdaptiveSync,
    /// Presented as soon as possible, possibly tearing
    Async,
    /// Presented as soon as possible on a variable refresh rate display
    AdaptiveAsync,
}

/// Subscriber interested in the exact presentation time of a frame
pub trait PresentationFeedback: fmt::Debug + Send {
    /// The frame this feedback was attached to is visible on the display
    ///
    /// `refresh` is the duration of one refresh cycle of the output, `timestamp` the time the
    /// frame turned visible on the monotonic clock.
    fn presented(&mut self, refresh: Duration, timestamp: Duration, mode: PresentationMode);
}

/// Paces the frames of one output
///
/// Gets notified once per [`OutputFrame`] it handed out.
pub trait FrameScheduler: fmt::Debug + Send + Sync {
    /// A frame reached the display
    ///
    /// `render_time` is the measured time between submission and completion of the GPU work.
    fn notify_frame_completed(&self, timestamp: Duration, render_time: Duration, mode: PresentationMode);
    /// A frame never reached the display
    fn notify_frame_failed(&self);
}

/// Frame in flight on an output
pub struct OutputFrame {
    scheduler: Option<Arc<dyn FrameScheduler>>,
    feedbacks: Vec<Box<dyn PresentationFeedback>>,
}

impl fmt::Debug for OutputFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputFrame")
            .field("scheduler", &self.scheduler)
            .field("feedbacks", &self.feedbacks.len())
            .finish()
    }
}

impl OutputFrame {
    /// Create a new frame reporting back to the given scheduler
    pub fn new(scheduler: Arc<dyn FrameScheduler>) -> OutputFrame {
        OutputFrame {
            scheduler: Some(scheduler),
            feedbacks: Vec::new(),
        }
    }

    /// Register a presentation feedback subscriber
    ///
    /// Subscribers are notified in registration order.
    pub fn add_feedback(&mut self, feedback: Box<dyn PresentationFeedback>) {
        self.feedbacks.push(feedback);
    }

    /// Number of registered subscribers
    pub fn feedback_count(&self) -> usize {
        self.feedbacks.len()
    }

    /// The frame is visible on the display
    ///
    /// Notifies the scheduler first, then every registered feedback.
    #[profiling::function]
    pub fn presented(
        mut self,
        refresh: Duration,
        timestamp: Duration,
        render_time: Duration,
        mode: PresentationMode,
    ) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.notify_frame_completed(timestamp, render_time, mode);
        }
        for mut feedback in self.feedbacks.drain(..) {
            feedback.presented(refresh, timestamp, mode);
        }
    }

    /// The frame never reached the display
    ///
    /// Only the scheduler is notified, feedbacks are dropped without a presentation callback.
    pub fn failed(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.notify_frame_failed();
        }
    }
}

impl Drop for OutputFrame {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            warn!("OutputFrame dropped without being presented or failed");
            scheduler.notify_frame_failed();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Completed(Duration, Duration, PresentationMode),
        Failed,
        Feedback(usize, Duration, Duration, PresentationMode),
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingScheduler {
        pub(crate) events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingScheduler {
        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl FrameScheduler for RecordingScheduler {
        fn notify_frame_completed(&self, timestamp: Duration, render_time: Duration, mode: PresentationMode) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Completed(timestamp, render_time, mode));
        }

        fn notify_frame_failed(&self) {
            self.events.lock().unwrap().push(Event::Failed);
        }
    }

    #[derive(Debug)]
    struct RecordingFeedback {
        id: usize,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl PresentationFeedback for RecordingFeedback {
        fn presented(&mut self, refresh: Duration, timestamp: Duration, mode: PresentationMode) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Feedback(self.id, refresh, timestamp, mode));
        }
    }

    fn frame_with_feedbacks(scheduler: &Arc<RecordingScheduler>, count: usize) -> OutputFrame {
        let mut frame = OutputFrame::new(scheduler.clone());
        for id in 0..count {
            frame.add_feedback(Box::new(RecordingFeedback {
                id,
                events: scheduler.events.clone(),
            }));
        }
        frame
    }

    #[test]
    fn presented_notifies_scheduler_then_feedbacks_in_order() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let frame = frame_with_feedbacks(&scheduler, 3);
        assert_eq!(frame.feedback_count(), 3);

        let refresh = Duration::from_micros(16_667);
        let timestamp = Duration::from_secs(12);
        let render_time = Duration::from_millis(3);
        frame.presented(refresh, timestamp, render_time, PresentationMode::VSync);

        assert_eq!(
            scheduler.events(),
            vec![
                Event::Completed(timestamp, render_time, PresentationMode::VSync),
                Event::Feedback(0, refresh, timestamp, PresentationMode::VSync),
                Event::Feedback(1, refresh, timestamp, PresentationMode::VSync),
                Event::Feedback(2, refresh, timestamp, PresentationMode::VSync),
            ]
        );
    }

    #[test]
    fn failed_skips_feedbacks() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let frame = frame_with_feedbacks(&scheduler, 2);
        frame.failed();
        assert_eq!(scheduler.events(), vec![Event::Failed]);
    }

    #[test]
    fn dropping_unresolved_frame_fails_it_once() {
        let scheduler = Arc::new(RecordingScheduler::default());
        drop(frame_with_feedbacks(&scheduler, 1));
        assert_eq!(scheduler.events(), vec![Event::Failed]);
    }

    #[test]
    fn frame_without_feedbacks() {
        let scheduler = Arc::new(RecordingScheduler::default());
        OutputFrame::new(scheduler.clone()).presented(
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::ZERO,
            PresentationMode::Async,
        );
        assert_eq!(
            scheduler.events(),
            vec![Event::Completed(
                Duration::from_secs(1),
                Duration::ZERO,
                PresentationMode::Async
            )]
        );
    }
}
