//! In-memory display, renderer and allocator
//!
//! These types implement the device seams of [`EglGbmBackend`](super::EglGbmBackend) without
//! touching any hardware. Every operation is recorded so tests can inspect what the backend did,
//! and most operations can be made to fail.

#![allow(missing_docs)]

use std::{
    io,
    os::unix::io::{BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use super::{DrmDisplay, DrmError, FramebufferId, PipelineId, PlaneType};
use crate::{
    backend::{
        allocator::{
            dmabuf::{AsDmabuf, Dmabuf, DmabufFlags},
            format::get_bpp,
            Allocator, Buffer, Format, FormatTable, Fourcc, Modifier,
        },
        egl::{EglConfig, EglRenderer, ResetStatus},
        renderer::{SurfaceItem, SurfaceTexture, SyncTimeline, SyncobjDevice},
    },
    utils::{Buffer as BufferCoords, OutputTransform, Physical, Rectangle, Size},
};

fn placeholder_fd() -> io::Result<OwnedFd> {
    Ok(rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC)?)
}

/// Error returned by the dummy implementations
#[derive(Debug, thiserror::Error)]
pub enum DummyError {
    #[error("Operation was configured to fail")]
    Requested,
    #[error("Failed to create placeholder fd: {0}")]
    Io(#[from] io::Error),
}

/// Syncobj device signaling every waited-for point right away
#[derive(Debug, Default)]
pub struct DummySyncobjDevice {
    pub fail_eventfd: bool,
    pub created: Mutex<Vec<u32>>,
    pub destroyed: Mutex<Vec<u32>>,
    pub signaled: Mutex<Vec<(u32, u64)>>,
}

impl SyncobjDevice for DummySyncobjDevice {
    fn create_syncobj(&self, _signaled: bool) -> io::Result<u32> {
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = created.len() as u32 + 1;
        created.push(handle);
        Ok(handle)
    }

    fn destroy_syncobj(&self, handle: u32) -> io::Result<()> {
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn fd_to_syncobj(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        Ok(42)
    }

    fn syncobj_eventfd(&self, _handle: u32, _point: u64, eventfd: BorrowedFd<'_>) -> io::Result<()> {
        if self.fail_eventfd {
            return Err(io::Error::from_raw_os_error(rustix::io::Errno::NOENT.raw_os_error()));
        }
        rustix::io::write(eventfd, &1u64.to_ne_bytes())?;
        Ok(())
    }

    fn timeline_signal(&self, handle: u32, point: u64) -> io::Result<()> {
        self.signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, point));
        Ok(())
    }
}

/// Pipeline of a [`DummyDisplay`]
#[derive(Debug, Clone)]
pub struct DummyPipeline {
    pub id: PipelineId,
    pub primary: FormatTable,
    pub cursor: Option<FormatTable>,
}

impl DummyPipeline {
    /// Pipeline whose primary plane supports the given formats with linear and implicit modifiers
    pub fn new(id: u32, formats: &[Fourcc]) -> DummyPipeline {
        DummyPipeline {
            id: PipelineId(id),
            primary: formats
                .iter()
                .map(|format| (*format, vec![Modifier::Linear, Modifier::Invalid]))
                .collect(),
            cursor: None,
        }
    }
}

/// Display controller recording framebuffers and page flips
#[derive(Debug, Default)]
pub struct DummyDisplay {
    pub pipelines: Vec<DummyPipeline>,
    pub syncobj: Option<Arc<DummySyncobjDevice>>,
    pub inactive: bool,
    pub fail_add_framebuffer: bool,
    pub fail_page_flip: bool,
    pub framebuffers: Vec<FramebufferId>,
    pub flips: Vec<(PipelineId, FramebufferId)>,
    next_framebuffer: u32,
}

impl DummyDisplay {
    pub fn new(pipelines: Vec<DummyPipeline>) -> DummyDisplay {
        DummyDisplay {
            pipelines,
            ..Default::default()
        }
    }

    fn pipeline(&self, id: PipelineId) -> Option<&DummyPipeline> {
        self.pipelines.iter().find(|pipeline| pipeline.id == id)
    }
}

impl DrmDisplay for DummyDisplay {
    fn pipelines(&self) -> Vec<PipelineId> {
        self.pipelines.iter().map(|pipeline| pipeline.id).collect()
    }

    fn plane_formats(&self, pipeline: PipelineId, plane: PlaneType) -> Option<FormatTable> {
        let pipeline = self.pipeline(pipeline)?;
        match plane {
            PlaneType::Primary => Some(pipeline.primary.clone()),
            PlaneType::Cursor => pipeline.cursor.clone(),
            PlaneType::Overlay => None,
        }
    }

    fn add_framebuffer(&mut self, _buffer: &Dmabuf) -> Result<FramebufferId, DrmError> {
        if self.fail_add_framebuffer {
            return Err(DrmError::NoFramebuffer);
        }
        self.next_framebuffer += 1;
        let framebuffer = FramebufferId(self.next_framebuffer);
        self.framebuffers.push(framebuffer);
        Ok(framebuffer)
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.retain(|fb| *fb != framebuffer);
    }

    fn page_flip(&mut self, pipeline: PipelineId, framebuffer: FramebufferId) -> Result<(), DrmError> {
        if self.inactive {
            return Err(DrmError::DeviceInactive);
        }
        if self.pipeline(pipeline).is_none() {
            return Err(DrmError::UnknownPipeline(pipeline));
        }
        if self.fail_page_flip {
            return Err(DrmError::Access {
                errmsg: "Page flip commit failed",
                source: io::Error::from_raw_os_error(rustix::io::Errno::BUSY.raw_os_error()),
            });
        }
        self.flips.push((pipeline, framebuffer));
        Ok(())
    }

    fn syncobj_device(&self) -> Option<Arc<dyn SyncobjDevice>> {
        self.syncobj
            .clone()
            .map(|device| device as Arc<dyn SyncobjDevice>)
    }
}

/// Texture handed out by [`DummyRenderer::import_dmabuf`]
#[derive(Debug)]
pub struct DummyTexture {
    size: Size<i32, BufferCoords>,
    format: Fourcc,
}

impl SurfaceTexture for DummyTexture {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }
}

/// Renderer recording every call
#[derive(Debug)]
pub struct DummyRenderer {
    pub configs: Vec<EglConfig>,
    pub render_formats: FormatTable,
    pub dmabuf_formats: FormatTable,
    pub reset: ResetStatus,
    pub fail_finish: bool,
    pub bound: Vec<Fourcc>,
    pub damage_regions: Vec<Vec<Rectangle<i32, BufferCoords>>>,
    pub finished: Vec<Option<u64>>,
    pub idle_waits: usize,
}

impl DummyRenderer {
    /// Renderer offering a config for each of the given formats
    pub fn new(formats: &[Fourcc]) -> DummyRenderer {
        let configs = formats
            .iter()
            .filter_map(|format| {
                let sizes = crate::backend::allocator::format::get_channel_sizes(*format)?;
                Some(EglConfig {
                    format: *format,
                    red: sizes.red,
                    green: sizes.green,
                    blue: sizes.blue,
                    alpha: sizes.alpha,
                })
            })
            .collect();
        let table: FormatTable = formats
            .iter()
            .map(|format| (*format, vec![Modifier::Linear]))
            .collect();
        DummyRenderer {
            configs,
            render_formats: table.clone(),
            dmabuf_formats: table,
            reset: ResetStatus::NoReset,
            fail_finish: false,
            bound: Vec::new(),
            damage_regions: Vec::new(),
            finished: Vec::new(),
            idle_waits: 0,
        }
    }
}

impl EglRenderer for DummyRenderer {
    type Error = DummyError;

    fn configs(&self) -> Vec<EglConfig> {
        self.configs.clone()
    }

    fn render_formats(&self) -> FormatTable {
        self.render_formats.clone()
    }

    fn dmabuf_formats(&self) -> FormatTable {
        self.dmabuf_formats.clone()
    }

    fn bind(&mut self, target: &Dmabuf) -> Result<(), DummyError> {
        self.bound.push(target.format().code);
        Ok(())
    }

    fn set_damage_region(&mut self, damage: &[Rectangle<i32, BufferCoords>]) -> Result<(), DummyError> {
        self.damage_regions.push(damage.to_vec());
        Ok(())
    }

    fn finish(&mut self, signal: Option<(&SyncTimeline, u64)>) -> Result<(), DummyError> {
        if self.fail_finish {
            return Err(DummyError::Requested);
        }
        if let Some((timeline, point)) = signal {
            timeline.signal(point)?;
        }
        self.finished.push(signal.map(|(_, point)| point));
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), DummyError> {
        self.idle_waits += 1;
        Ok(())
    }

    fn import_dmabuf(&mut self, dmabuf: &Dmabuf) -> Result<Box<dyn SurfaceTexture>, DummyError> {
        let format = dmabuf.format();
        let supported = self
            .dmabuf_formats
            .get(&format.code)
            .map_or(false, |modifiers| modifiers.contains(&format.modifier));
        if !supported {
            return Err(DummyError::Requested);
        }
        Ok(Box::new(DummyTexture {
            size: dmabuf.size(),
            format: format.code,
        }))
    }

    fn reset_status(&self) -> ResetStatus {
        self.reset
    }
}

/// Buffer produced by [`DummyAllocator`]
#[derive(Debug)]
pub struct DummyBuffer {
    size: Size<i32, BufferCoords>,
    format: Format,
}

impl Buffer for DummyBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl AsDmabuf for DummyBuffer {
    type Error = DummyError;

    fn export(&self) -> Result<Dmabuf, DummyError> {
        dummy_dmabuf(self.size, self.format.code, self.format.modifier)
    }
}

/// Create a single plane dmabuf backed by a placeholder fd
pub fn dummy_dmabuf(
    size: impl Into<Size<i32, BufferCoords>>,
    fourcc: Fourcc,
    modifier: Modifier,
) -> Result<Dmabuf, DummyError> {
    let size = size.into();
    let stride = size.w as u32 * get_bpp(fourcc).unwrap_or(32) as u32 / 8;
    let mut builder = Dmabuf::builder(size, fourcc, DmabufFlags::empty());
    builder.add_plane(placeholder_fd()?, 0, 0, stride, modifier);
    builder.build().ok_or(DummyError::Requested)
}

/// Allocator handing out [`DummyBuffer`]s
///
/// Clones share the allocation counter.
#[derive(Debug, Clone, Default)]
pub struct DummyAllocator {
    pub failing_formats: Vec<Fourcc>,
    allocations: Arc<AtomicUsize>,
}

impl DummyAllocator {
    /// Number of buffers allocated by this allocator and its clones
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

impl Allocator for DummyAllocator {
    type Buffer = DummyBuffer;
    type Error = DummyError;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<DummyBuffer, DummyError> {
        if self.failing_formats.contains(&fourcc) {
            return Err(DummyError::Requested);
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(DummyBuffer {
            size: (width as i32, height as i32).into(),
            format: Format {
                code: fourcc,
                modifier: modifiers.first().copied().unwrap_or(Modifier::Invalid),
            },
        })
    }
}

/// Surface item wrapping an optional dmabuf
#[derive(Debug)]
pub struct DummySurfaceItem {
    pub buffer: Option<Dmabuf>,
    pub transform: OutputTransform,
    pub geometry: Rectangle<i32, Physical>,
    pub opacity: f32,
}

impl SurfaceItem for DummySurfaceItem {
    fn buffer(&self) -> Option<&dyn Buffer> {
        self.buffer.as_ref().map(|buffer| buffer as &dyn Buffer)
    }

    fn buffer_transform(&self) -> OutputTransform {
        self.transform
    }

    fn geometry(&self) -> Rectangle<i32, Physical> {
        self.geometry
    }

    fn opacity(&self) -> f32 {
        self.opacity
    }
}
