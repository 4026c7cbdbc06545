//! Backend helpers
//!
//! Collection of common traits and implementations about presenting rendered frames on
//! display hardware.
//!
//! - [`allocator`] contains the buffer types and allocators render targets are made of
//! - [`renderer`] contains the [`RenderBackend`](renderer::RenderBackend) contract every
//!   backend implements, the per-frame [`OutputFrame`](renderer::OutputFrame) and the explicit
//!   synchronization primitives
//! - [`egl`] describes the rendering API a DRM backend drives
//! - [`drm`] contains the display controller abstraction and the DRM/EGL backend

use std::error::Error;

pub mod allocator;
pub mod drm;
pub mod egl;
pub mod renderer;

/// Error that can happen when swapping buffers.
#[derive(Debug, thiserror::Error)]
pub enum SwapBuffersError {
    /// The corresponding context has been lost and needs to be recreated.
    ///
    /// All the objects associated to it (textures, buffers, programs, etc.)
    /// need to be recreated from scratch. Underlying resources like native surfaces
    /// might also need to be recreated.
    ///
    /// Operations will have no effect. Functions that read textures, buffers, etc.
    /// will return uninitialized data instead.
    #[error("The context has been lost, it needs to be recreated: {0}")]
    ContextLost(Box<dyn Error + Send + Sync>),
    /// A temporary condition caused to rendering to fail.
    ///
    /// Depending on the underlying error this *might* require fixing internal state of the
    /// rendering backend, but failures mapped to `TemporaryFailure` are always recoverable without
    /// re-creating the entire stack, as is represented by `ContextLost`.
    ///
    /// Proceed after investigating the source to reschedule another full rendering step or just
    /// this page flip at a later time. If the root cause cannot be discovered and subsequent
    /// renderings also fail, fall back to recreation.
    #[error("A temporary condition caused the page flip to fail: {0}")]
    TemporaryFailure(Box<dyn Error + Send + Sync>),
}
