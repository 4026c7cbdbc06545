//! Drm/Kms types and backend implementations
//!
//! This module contains the display controller side of presentation:
//!
//! - [`DrmDisplay`] abstracts the kernel mode setting operations the render backend needs:
//!   enumerating pipelines and their plane formats, adding framebuffers and queueing page
//!   flips.
//! - [`DrmDeviceFd`] is a ref-counted file descriptor of an open drm device, which also gives
//!   access to the syncobj ioctls used for explicit synchronization (feature `backend_drm`).
//! - [`KmsDisplay`] implements [`DrmDisplay`] on top of a [`DrmDeviceFd`], importing buffers
//!   through prime and flipping with the legacy page flip ioctl (feature `backend_drm`).
//! - [`EglGbmBackend`] is a [`RenderBackend`](crate::backend::renderer::RenderBackend) rendering
//!   with EGL into GBM buffers and presenting them through a [`DrmDisplay`].
//!
//! ## How to use it
//!
//! Create the backend from a display, a renderer and an allocator, register every output with
//! the pipeline driving it and run the frame cycle from your event loop:
//!
//! ```rust,ignore
//! let mut backend = EglGbmBackend::new(display, renderer, allocator, EglGbmConfig::from_env())?;
//! backend.add_output(&output, OutputTarget::Pipeline(crtc.into()))?;
//!
//! let damage = backend.begin_frame(&output)?;
//! // ... render the scene, limited to `damage` ...
//! backend.end_frame(&output, &damage, &damage)?;
//! backend.present(&output, OutputFrame::new(scheduler))?;
//!
//! // once the drm device fd becomes readable
//! for (pipeline, timestamp) in backend.display().receive_page_flips()? {
//!     backend.page_flip_completed(pipeline, timestamp);
//! }
//! ```

use std::{io, sync::Arc};

use crate::backend::{
    allocator::{dmabuf::Dmabuf, FormatTable},
    renderer::SyncobjDevice,
    SwapBuffersError,
};

#[cfg(feature = "backend_drm")]
mod device;
#[cfg(any(test, feature = "renderer_test"))]
pub mod dummy;
mod egl_gbm;
#[cfg(feature = "backend_drm")]
mod kms;
pub mod layer;

#[cfg(feature = "backend_drm")]
pub use self::device::{supports_syncobj_eventfd, DrmDeviceFd};
pub use self::egl_gbm::{EglGbmBackend, EglGbmConfig, EglGbmError, GbmFormat, OutputTarget};
#[cfg(feature = "backend_drm")]
pub use self::kms::KmsDisplay;

/// Identifier of a display pipeline (a crtc)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

/// Identifier of a framebuffer registered with the display controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Kind of a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Primary plane, showing the composited output
    Primary,
    /// Cursor plane
    Cursor,
    /// Overlay plane
    Overlay,
}

/// Display controller of a drm device
pub trait DrmDisplay: std::fmt::Debug {
    /// Pipelines of the device
    fn pipelines(&self) -> Vec<PipelineId>;

    /// Formats and modifiers of the plane of the given type on `pipeline`
    ///
    /// Returns `None` if the pipeline has no such plane.
    fn plane_formats(&self, pipeline: PipelineId, plane: PlaneType) -> Option<FormatTable>;

    /// Register `buffer` as framebuffer
    fn add_framebuffer(&mut self, buffer: &Dmabuf) -> Result<FramebufferId, DrmError>;

    /// Release a framebuffer
    fn remove_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Queue a page flip to `framebuffer` on the primary plane of `pipeline`
    ///
    /// Completion is reported through a page flip event of the device.
    fn page_flip(&mut self, pipeline: PipelineId, framebuffer: FramebufferId) -> Result<(), DrmError>;

    /// Device giving access to syncobj operations, if explicit synchronization is supported
    fn syncobj_device(&self) -> Option<Arc<dyn SyncobjDevice>> {
        None
    }
}

/// Errors thrown by a [`DrmDisplay`]
#[derive(thiserror::Error, Debug)]
pub enum DrmError {
    /// The device encountered an access error
    #[error("DRM access error: {errmsg} ({source})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// The pipeline does not exist on this device
    #[error("Pipeline `{0:?}` does not exist")]
    UnknownPipeline(PipelineId),
    /// The buffer could not be used as framebuffer
    #[error("Buffer can not be used as framebuffer")]
    NoFramebuffer,
}

impl From<DrmError> for SwapBuffersError {
    fn from(err: DrmError) -> SwapBuffersError {
        match err {
            x @ DrmError::DeviceInactive => SwapBuffersError::TemporaryFailure(Box::new(x)),
            DrmError::Access { errmsg, source }
                if source.kind() == io::ErrorKind::PermissionDenied
                    || source.raw_os_error() == Some(rustix::io::Errno::BUSY.raw_os_error())
                    || source.raw_os_error() == Some(rustix::io::Errno::INTR.raw_os_error()) =>
            {
                SwapBuffersError::TemporaryFailure(Box::new(DrmError::Access { errmsg, source }))
            }
            x @ DrmError::Access { .. } => SwapBuffersError::ContextLost(Box::new(x)),
            x => SwapBuffersError::TemporaryFailure(Box::new(x)),
        }
    }
}
