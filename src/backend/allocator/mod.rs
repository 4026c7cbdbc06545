//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around
//! buffer creation and handling from various sources.
//!
//! Allocators are provided by the platform, e.g. a GBM device, by implementing [`Allocator`]
//! for it. Their buffers need to implement [`AsDmabuf`](dmabuf::AsDmabuf) to be rendered into
//! and scanned out.
//!
//! Buffer types supported:
//! - [DmaBufs](dmabuf::Dmabuf)
//!
//! Helpers:
//! - [`Swapchain`] to help with buffer management for render surfaces
//! - [`format`] tables describing the layout of DRM formats

use std::{error::Error, fmt};

use downcast_rs::{impl_downcast, Downcast};
use indexmap::IndexMap;

use crate::utils::{Buffer as BufferCoords, Size};

pub mod dmabuf;
pub mod format;

mod swapchain;
pub use swapchain::{Slot, Swapchain};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use self::dmabuf::{AsDmabuf, Dmabuf};

/// Mapping from pixel format to the memory layout modifiers acceptable for it
///
/// Iteration order is the order formats were inserted in, which backends use to express
/// preference.
pub type FormatTable = IndexMap<Fourcc, Vec<Modifier>>;

/// Common trait describing common properties of most types of buffers.
pub trait Buffer: Downcast + fmt::Debug {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32 {
        self.size().w as u32
    }
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32 {
        self.size().h as u32
    }
    /// Size of the two-dimensional buffer
    fn size(&self) -> Size<i32, BufferCoords>;
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}
impl_downcast!(Buffer);

/// Interface to create Buffers
pub trait Allocator {
    /// Buffer type produced by this allocator
    type Buffer: Buffer;
    /// Error type thrown if allocations fail
    type Error: Error;

    /// Try to create a buffer with the given dimensions and pixel format
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}

/// Error returned by a [`GraphicsBufferAllocator`]
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// The allocator failed to create the buffer
    #[error("Failed to allocate buffer: {0}")]
    Allocation(#[source] Box<dyn Error + Send + Sync>),
    /// The buffer was allocated, but could not be exported as dmabuf
    #[error("Failed to export buffer as dmabuf: {0}")]
    Export(#[source] Box<dyn Error + Send + Sync>),
}

/// Object-safe allocator handing out GPU-importable buffers
///
/// This is what render backends expose to upstream code, so that buffers can be shared with
/// other devices or processes without a copy. Every [`Allocator`] whose buffers can be exported
/// as [`Dmabuf`]s implements it.
pub trait GraphicsBufferAllocator: fmt::Debug {
    /// Allocate a new buffer and export it as dmabuf
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Dmabuf, AllocationError>;
}

impl<A> GraphicsBufferAllocator for A
where
    A: Allocator + fmt::Debug,
    A::Buffer: AsDmabuf,
    A::Error: Send + Sync + 'static,
    <A::Buffer as AsDmabuf>::Error: Error + Send + Sync + 'static,
{
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Dmabuf, AllocationError> {
        let buffer = self
            .create_buffer(width, height, fourcc, modifiers)
            .map_err(|err| AllocationError::Allocation(Box::new(err)))?;
        buffer
            .export()
            .map_err(|err| AllocationError::Export(Box::new(err)))
    }
}
