//! Rendering functionality and abstractions
//!
//! The central piece of this module is the [`RenderBackend`] trait, the contract between the
//! compositing scene and whatever puts pixels on a display. A backend drives one frame cycle
//! per output:
//!
//! 1. [`begin_frame`](RenderBackend::begin_frame) makes a render target current and tells the
//!    scene which region has to be repainted,
//! 2. [`end_frame`](RenderBackend::end_frame) records what was rendered and damaged,
//! 3. [`present`](RenderBackend::present) hands the result to the display and takes ownership of
//!    the [`OutputFrame`], which is resolved once the frame is visible or got dropped.
//!
//! Alternatively a single client buffer may be [scanned out](RenderBackend::scanout) directly,
//! skipping composition for that frame.
//!
//! Capabilities a backend may lack (cursor planes, buffer allocation, explicit synchronization,
//! ...) are default methods reporting their absence, so simple backends only implement the
//! frame cycle.

use std::{fmt, os::unix::io::OwnedFd, sync::Arc};

use crate::{
    backend::{
        allocator::{Buffer, FormatTable, Fourcc, GraphicsBufferAllocator, Modifier},
        SwapBuffersError,
    },
    output::Output,
    utils::{Buffer as BufferCoords, OutputTransform, Physical, Rectangle, Size},
};

pub mod damage;
pub mod frame;
pub mod pending;
pub mod sync;

pub use self::frame::{FrameScheduler, OutputFrame, PresentationFeedback, PresentationMode};
pub use self::sync::{SyncTimeline, SyncobjDevice, TimelineWaitSource};

/// Handle to a layer owned by a render backend
///
/// Layers are stored in a generational arena, a handle to a layer that was freed (for example
/// because its output got reconfigured) never resolves to a newer layer in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Client buffer imported as a texture by the renderer
pub trait SurfaceTexture: fmt::Debug {
    /// Size of the texture
    fn size(&self) -> Size<i32, BufferCoords>;
    /// Pixel format of the texture
    fn format(&self) -> Fourcc;
}

/// Client buffer of a wayland surface
#[derive(Debug, Clone)]
pub struct SurfacePixmap {
    /// The attached buffer
    pub buffer: Arc<dyn Buffer + Send + Sync>,
}

/// X11 pixmap of a redirected window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePixmapX11 {
    /// Pixmap id on the X server
    pub pixmap: u32,
    /// Size of the pixmap
    pub size: Size<i32, BufferCoords>,
    /// Color depth of the pixmap
    pub depth: u8,
}

/// Client surface considered for direct scanout
pub trait SurfaceItem: fmt::Debug {
    /// Current buffer of the surface, if any
    fn buffer(&self) -> Option<&dyn Buffer>;
    /// Transform the client applied to its buffer contents
    fn buffer_transform(&self) -> OutputTransform;
    /// Area covered by the surface, in output coordinates
    fn geometry(&self) -> Rectangle<i32, Physical>;
    /// Opacity of the surface
    fn opacity(&self) -> f32 {
        1.0
    }
}

/// X11 composite overlay window
pub trait OverlayWindow: fmt::Debug {
    /// Window id of the overlay
    fn window(&self) -> u32;
    /// Whether the overlay is mapped
    fn is_visible(&self) -> bool;
    /// Map the overlay
    fn show(&mut self);
    /// Unmap the overlay
    fn hide(&mut self);
}

/// Abstract render backend
///
/// The trait is object safe, compositors usually keep a `Box<dyn RenderBackend>` picked at
/// startup.
///
/// Per output the calls have to follow the order `begin_frame -> end_frame -> present`, or
/// `scanout -> present` when scanout succeeded. Out of order calls are bugs of the caller:
/// implementations panic in debug builds and fail the frame with
/// [`SwapBuffersError::TemporaryFailure`] otherwise.
pub trait RenderBackend: fmt::Debug {
    /// Start rendering a new frame on `output`
    ///
    /// Returns the region of the output that needs to be repainted, in physical output
    /// coordinates. Rendering outside of it is allowed, but unnecessary.
    fn begin_frame(&mut self, output: &Output) -> Result<Vec<Rectangle<i32, Physical>>, SwapBuffersError>;

    /// Finish rendering the frame started by [`begin_frame`](RenderBackend::begin_frame)
    ///
    /// `rendered` is the region that was actually painted, `damaged` the region that differs
    /// from the previous frame.
    fn end_frame(
        &mut self,
        output: &Output,
        rendered: &[Rectangle<i32, Physical>],
        damaged: &[Rectangle<i32, Physical>],
    ) -> Result<(), SwapBuffersError>;

    /// Present the last rendered or scanned out frame
    ///
    /// The backend takes ownership of `frame` and always resolves it: when the submission
    /// fails the frame is failed right away and the error returned.
    fn present(&mut self, output: &Output, frame: OutputFrame) -> Result<(), SwapBuffersError>;

    /// Hardware layer used to display the cursor on `output`
    fn cursor_layer(&mut self, _output: &Output) -> Option<LayerId> {
        None
    }

    /// X11 composite overlay window used for presentation
    fn overlay_window(&self) -> Option<&dyn OverlayWindow> {
        None
    }

    /// Check whether the graphics device was reset
    ///
    /// A backend returning `true` dropped all its device state and has to be re-initialized
    /// by the caller.
    fn check_graphics_reset(&mut self) -> bool {
        false
    }

    /// Allocator for buffers usable with this backend
    fn graphics_buffer_allocator(&mut self) -> Option<&mut dyn GraphicsBufferAllocator> {
        None
    }

    /// Test if `buffer` can be used by this backend, without keeping any state around
    fn test_import_buffer(&mut self, _buffer: &dyn Buffer) -> bool {
        false
    }

    /// Formats and modifiers of client buffers this backend can use
    fn supported_formats(&self) -> FormatTable {
        let mut formats = FormatTable::new();
        formats.insert(Fourcc::Xrgb8888, vec![Modifier::Linear]);
        formats
    }

    /// Import an X11 pixmap as texture
    fn create_surface_texture_x11(&mut self, _pixmap: &SurfacePixmapX11) -> Option<Box<dyn SurfaceTexture>> {
        None
    }

    /// Import a wayland client buffer as texture
    fn create_surface_texture_wayland(&mut self, _pixmap: &SurfacePixmap) -> Option<Box<dyn SurfaceTexture>> {
        None
    }

    /// Whether [`import_timeline`](RenderBackend::import_timeline) is available
    fn supports_timelines(&self) -> bool {
        false
    }

    /// Import a timeline syncobj shared by a client
    fn import_timeline(&mut self, _fd: OwnedFd) -> Option<SyncTimeline> {
        None
    }

    /// Try to display the buffer of `item` directly, without composition
    ///
    /// Returns `true` if the buffer will be shown by the next
    /// [`present`](RenderBackend::present) call on `output`.
    fn scanout(&mut self, _output: &Output, _item: &dyn SurfaceItem) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PhysicalProperties;

    #[derive(Debug, Default)]
    struct MinimalBackend {
        frames: usize,
    }

    impl RenderBackend for MinimalBackend {
        fn begin_frame(
            &mut self,
            output: &Output,
        ) -> Result<Vec<Rectangle<i32, Physical>>, SwapBuffersError> {
            let size = output
                .transformed_size()
                .map_err(|err| SwapBuffersError::TemporaryFailure(Box::new(err)))?;
            Ok(vec![Rectangle::from_size(size)])
        }

        fn end_frame(
            &mut self,
            _output: &Output,
            _rendered: &[Rectangle<i32, Physical>],
            _damaged: &[Rectangle<i32, Physical>],
        ) -> Result<(), SwapBuffersError> {
            Ok(())
        }

        fn present(&mut self, _output: &Output, frame: OutputFrame) -> Result<(), SwapBuffersError> {
            self.frames += 1;
            frame.failed();
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NoItem;

    impl SurfaceItem for NoItem {
        fn buffer(&self) -> Option<&dyn Buffer> {
            None
        }
        fn buffer_transform(&self) -> OutputTransform {
            OutputTransform::Normal
        }
        fn geometry(&self) -> Rectangle<i32, Physical> {
            Rectangle::from_size((0, 0).into())
        }
    }

    fn output() -> Output {
        Output::new(
            "test".into(),
            PhysicalProperties {
                size_mm: (0, 0),
                subpixel: crate::output::Subpixel::Unknown,
                make: "frameport".into(),
                model: "test".into(),
            },
        )
    }

    #[test]
    fn unsupported_capabilities() {
        let mut backend: Box<dyn RenderBackend> = Box::<MinimalBackend>::default();
        let output = output();

        assert!(backend.cursor_layer(&output).is_none());
        assert!(backend.overlay_window().is_none());
        assert!(!backend.check_graphics_reset());
        assert!(backend.graphics_buffer_allocator().is_none());
        assert!(!backend.supports_timelines());
        assert!(backend
            .import_timeline(std::fs::File::open("/dev/null").unwrap().into())
            .is_none());
        assert!(!backend.scanout(&output, &NoItem));
        assert!(backend
            .create_surface_texture_x11(&SurfacePixmapX11 {
                pixmap: 1,
                size: (10, 10).into(),
                depth: 24,
            })
            .is_none());
    }

    #[test]
    fn default_formats() {
        let backend = MinimalBackend::default();
        let formats = backend.supported_formats();
        assert_eq!(formats.len(), 1);
        assert_eq!(formats.get(&Fourcc::Xrgb8888), Some(&vec![Modifier::Linear]));
    }

    #[test]
    fn test_import_has_no_side_effects() {
        #[derive(Debug)]
        struct Pixels;
        impl Buffer for Pixels {
            fn size(&self) -> Size<i32, BufferCoords> {
                (4, 4).into()
            }
            fn format(&self) -> crate::backend::allocator::Format {
                crate::backend::allocator::Format {
                    code: Fourcc::Argb8888,
                    modifier: Modifier::Linear,
                }
            }
        }

        let mut backend = MinimalBackend::default();
        assert!(!backend.test_import_buffer(&Pixels));
        assert!(backend
            .create_surface_texture_wayland(&SurfacePixmap {
                buffer: Arc::new(Pixels)
            })
            .is_none());
        assert_eq!(backend.frames, 0);
    }
}
