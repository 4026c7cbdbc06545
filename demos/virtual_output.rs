//! Drives a virtual output through a few frames using the in-memory test devices.
//!
//! Run with `cargo run --example virtual_output --features renderer_test`, set `RUST_LOG=trace`
//! to follow the frame cycle.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use calloop::EventLoop;
use frameport::{
    backend::{
        allocator::Fourcc,
        drm::{
            dummy::{DummyAllocator, DummyDisplay, DummyRenderer, DummySyncobjDevice},
            EglGbmBackend, EglGbmConfig, OutputTarget,
        },
        renderer::{FrameScheduler, OutputFrame, PresentationMode, RenderBackend},
    },
    output::{Mode, Output, PhysicalProperties, Subpixel},
    utils::{OutputTransform, Rectangle},
};
use tracing::{error, info};

#[derive(Debug, Default)]
struct CountingScheduler {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl FrameScheduler for CountingScheduler {
    fn notify_frame_completed(&self, timestamp: Duration, render_time: Duration, mode: PresentationMode) {
        let frame = self.completed.fetch_add(1, Ordering::SeqCst);
        info!(frame, ?timestamp, ?render_time, ?mode, "Frame presented");
    }

    fn notify_frame_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        error!("Frame failed");
    }
}

struct App {
    backend: EglGbmBackend<DummyDisplay, DummyRenderer, DummyAllocator>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let mut display = DummyDisplay::default();
    display.syncobj = Some(Arc::new(DummySyncobjDevice::default()));
    let renderer = DummyRenderer::new(&[Fourcc::Xrgb8888, Fourcc::Xrgb2101010]);
    let backend = EglGbmBackend::new(
        display,
        renderer,
        DummyAllocator::default(),
        EglGbmConfig::from_env(),
    )?;

    let output = Output::new(
        "Virtual-1".into(),
        PhysicalProperties {
            size_mm: (0, 0),
            subpixel: Subpixel::Unknown,
            make: "frameport".into(),
            model: "virtual".into(),
        },
    );
    let mode = Mode {
        size: (1920, 1080).into(),
        refresh: 60_000,
    };
    output.change_current_state(Some(mode), Some(OutputTransform::Rotated90), None);

    let mut app = App { backend };
    app.backend.add_output(&output, OutputTarget::Virtual)?;

    let mut event_loop: EventLoop<'_, App> = EventLoop::try_new()?;
    let scheduler = Arc::new(CountingScheduler::default());

    for frame in 0..8 {
        let repaint = app.backend.begin_frame(&output)?;
        info!(frame, ?repaint, "Repainting");
        let damage = [Rectangle::new((frame * 10, 0).into(), (10, 10).into())];
        app.backend.end_frame(&output, &repaint, &damage)?;
        app.backend.present(&output, OutputFrame::new(scheduler.clone()))?;

        for (id, source) in app.backend.take_timeline_waits() {
            event_loop
                .handle()
                .insert_source(source, move |point, _, app: &mut App| {
                    app.backend.timeline_signaled(id, point);
                })
                .map_err(|err| err.error)?;
        }
        event_loop.dispatch(Some(Duration::from_millis(16)), &mut app)?;
    }

    info!(
        completed = scheduler.completed.load(Ordering::SeqCst),
        failed = scheduler.failed.load(Ordering::SeqCst),
        "Done"
    );
    Ok(())
}
