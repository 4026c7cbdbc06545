//! Explicit synchronization through kernel timeline objects
//!
//! A [`SyncTimeline`] owns one DRM syncobj of timeline type. GPU or display work signals
//! monotonically increasing 64-bit points on it, and [`SyncTimeline::event_fd`] turns "the
//! timeline reached point N" into a file descriptor that becomes readable, so the event loop can
//! observe completion without blocking the render loop.
//!
//! [`TimelineWaitSource`] wraps such a descriptor as a [`calloop`] event source firing once.

use std::{
    fmt, io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use calloop::generic::Generic;
use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{trace, warn};

/// Kernel interface needed to operate on syncobj handles
///
/// Implemented by [`DrmDeviceFd`](crate::backend::drm::DrmDeviceFd) and by anything else
/// giving access to the syncobj ioctls of a device. Handles are raw, device-local `u32`s.
pub trait SyncobjDevice: fmt::Debug + Send + Sync {
    /// Create a new syncobj, optionally already signaled
    fn create_syncobj(&self, signaled: bool) -> io::Result<u32>;
    /// Destroy a syncobj handle
    fn destroy_syncobj(&self, handle: u32) -> io::Result<()>;
    /// Import a syncobj shared as file descriptor
    fn fd_to_syncobj(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    /// Ask the kernel to signal `eventfd` once the timeline reaches `point`
    fn syncobj_eventfd(&self, handle: u32, point: u64, eventfd: BorrowedFd<'_>) -> io::Result<()>;
    /// Signal `point` on the timeline from the CPU
    fn timeline_signal(&self, handle: u32, point: u64) -> io::Result<()>;
}

/// Owned timeline syncobj
///
/// The kernel object is destroyed when this value is dropped. It can not be cloned, share it
/// through an `Arc` if several frames need to wait on the same timeline.
pub struct SyncTimeline {
    device: Arc<dyn SyncobjDevice>,
    handle: u32,
}

impl fmt::Debug for SyncTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimeline")
            .field("device", &self.device)
            .field("handle", &self.handle)
            .finish()
    }
}

impl SyncTimeline {
    /// Take ownership of an existing syncobj handle of `device`
    ///
    /// This never creates a kernel object.
    pub fn new(device: Arc<dyn SyncobjDevice>, handle: u32) -> SyncTimeline {
        SyncTimeline { device, handle }
    }

    /// Import a timeline shared as file descriptor
    pub fn import(device: Arc<dyn SyncobjDevice>, fd: BorrowedFd<'_>) -> io::Result<SyncTimeline> {
        let handle = device.fd_to_syncobj(fd)?;
        Ok(SyncTimeline::new(device, handle))
    }

    /// Raw syncobj handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Create a file descriptor becoming readable once the timeline reached `point`
    ///
    /// Returns `None` if the eventfd could not be created or the device does not support
    /// waiting on timelines this way. Callers have to fall back to blocking or implicit
    /// synchronization in that case.
    pub fn event_fd(&self, point: u64) -> Option<OwnedFd> {
        let fd = match rustix::event::eventfd(
            0,
            rustix::event::EventfdFlags::CLOEXEC | rustix::event::EventfdFlags::NONBLOCK,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(handle = self.handle, "Failed to create eventfd: {}", err);
                return None;
            }
        };

        if let Err(err) = self.device.syncobj_eventfd(self.handle, point, fd.as_fd()) {
            warn!(handle = self.handle, point, "Failed to wait on timeline point: {}", err);
            return None;
        }

        Some(fd)
    }

    /// Signal `point` from the CPU
    pub fn signal(&self, point: u64) -> io::Result<()> {
        self.device.timeline_signal(self.handle, point)
    }

    /// Create an event source firing once the timeline reached `point`
    ///
    /// Returns `None` under the same conditions as [`SyncTimeline::event_fd`].
    pub fn wait_source(&self, point: u64) -> Option<TimelineWaitSource> {
        let fd = self.event_fd(point)?;
        Some(TimelineWaitSource {
            source: Generic::new(fd, Interest::READ, Mode::Level),
            point,
        })
    }
}

impl Drop for SyncTimeline {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_syncobj(self.handle) {
            warn!(handle = self.handle, "Failed to destroy syncobj: {}", err);
        }
    }
}

/// Event source generating an event when a [`SyncTimeline`] reached a point
///
/// The event is the point that was waited for. The source removes itself after firing.
#[derive(Debug)]
pub struct TimelineWaitSource {
    source: Generic<OwnedFd>,
    point: u64,
}

impl TimelineWaitSource {
    /// Timeline point this source waits for
    pub fn point(&self) -> u64 {
        self.point
    }
}

impl EventSource for TimelineWaitSource {
    type Event = u64;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<C>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: C,
    ) -> Result<PostAction, Self::Error>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.source
            .process_events(readiness, token, |_, _| Ok(PostAction::Remove))?;
        trace!(point = self.point, "Timeline point signaled");
        callback(self.point, &mut ());
        Ok(PostAction::Remove)
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::dummy::DummySyncobjDevice;
    use std::time::Duration;

    #[test]
    fn kernel_failure_yields_no_fd() {
        let device = Arc::new(DummySyncobjDevice {
            fail_eventfd: true,
            ..Default::default()
        });
        let timeline = SyncTimeline::new(device, 3);
        assert!(timeline.event_fd(10).is_none());
        assert!(timeline.wait_source(10).is_none());
    }

    #[test]
    fn destroys_handle_exactly_once() {
        let device = Arc::new(DummySyncobjDevice::default());
        let timeline = SyncTimeline::new(device.clone(), 5);
        assert!(device.destroyed.lock().unwrap().is_empty());
        drop(timeline);
        assert_eq!(*device.destroyed.lock().unwrap(), vec![5]);
    }

    #[test]
    fn import_and_signal() {
        let device = Arc::new(DummySyncobjDevice::default());
        let file = std::fs::File::open("/dev/null").unwrap();
        let timeline = SyncTimeline::import(device.clone(), file.as_fd()).unwrap();
        assert_eq!(timeline.handle(), 42);
        timeline.signal(3).unwrap();
        assert_eq!(*device.signaled.lock().unwrap(), vec![(42, 3)]);
    }

    #[test]
    fn wait_source_fires_once() {
        let device = Arc::new(DummySyncobjDevice::default());
        let timeline = SyncTimeline::new(device, 1);
        let source = timeline.wait_source(99).unwrap();
        assert_eq!(source.point(), 99);

        let mut event_loop: calloop::EventLoop<'_, Vec<u64>> = calloop::EventLoop::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(source, |point, _, fired: &mut Vec<u64>| fired.push(point))
            .unwrap();

        let mut fired = Vec::new();
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut fired)
            .unwrap();
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut fired)
            .unwrap();
        assert_eq!(fired, vec![99]);
    }
}
