//! Common traits and types for egl rendering
//!
//! The DRM backend does not talk to EGL directly. It drives an [`EglRenderer`], which owns the
//! EGL display and context of a device and exposes the few operations presentation needs:
//! the configs it can render with, binding a dmabuf as render target, partial-update damage,
//! fencing and robustness queries.

use std::{error::Error, fmt};

use crate::{
    backend::{
        allocator::{dmabuf::Dmabuf, format::ChannelSizes, FormatTable, Fourcc},
        renderer::{SurfaceTexture, SyncTimeline},
    },
    utils::{Buffer, Rectangle},
};

/// Framebuffer configuration supported by an EGL display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EglConfig {
    /// DRM format of the native visual
    pub format: Fourcc,
    /// Bits of the red channel
    pub red: u32,
    /// Bits of the green channel
    pub green: u32,
    /// Bits of the blue channel
    pub blue: u32,
    /// Bits of the alpha channel
    pub alpha: u32,
}

impl EglConfig {
    /// Channel sizes of this config
    pub fn channel_sizes(&self) -> ChannelSizes {
        ChannelSizes {
            red: self.red,
            green: self.green,
            blue: self.blue,
            alpha: self.alpha,
        }
    }
}

/// Result of a robustness query (`glGetGraphicsResetStatus`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetStatus {
    /// The context is fine
    NoReset,
    /// This context caused a reset
    Guilty,
    /// Another context caused a reset
    Innocent,
    /// A reset happened, but the cause is unknown
    Unknown,
}

impl ResetStatus {
    /// Whether the context was lost
    pub fn is_reset(&self) -> bool {
        !matches!(self, ResetStatus::NoReset)
    }
}

/// EGL renderer of a DRM device
pub trait EglRenderer: fmt::Debug {
    /// Error type returned by the renderer
    type Error: Error + Send + Sync + 'static;

    /// Configs usable for rendering into GBM buffers
    fn configs(&self) -> Vec<EglConfig>;

    /// Formats and modifiers the renderer can render into
    fn render_formats(&self) -> FormatTable;

    /// Formats and modifiers the renderer can import as textures
    fn dmabuf_formats(&self) -> FormatTable;

    /// Make `target` the current render target
    fn bind(&mut self, target: &Dmabuf) -> Result<(), Self::Error>;

    /// Restrict the next frame to the given region (`EGL_KHR_partial_update`)
    fn set_damage_region(&mut self, damage: &[Rectangle<i32, Buffer>]) -> Result<(), Self::Error>;

    /// Flush the rendering commands of the current frame
    ///
    /// With `signal` set the renderer makes the GPU signal the given timeline point once the
    /// commands completed, otherwise completion is implicit.
    fn finish(&mut self, signal: Option<(&SyncTimeline, u64)>) -> Result<(), Self::Error>;

    /// Block until all submitted commands completed
    fn wait_idle(&mut self) -> Result<(), Self::Error>;

    /// Import a dmabuf as texture
    fn import_dmabuf(&mut self, dmabuf: &Dmabuf) -> Result<Box<dyn SurfaceTexture>, Self::Error>;

    /// Query whether the context was lost
    fn reset_status(&self) -> ResetStatus;
}
