//! [`DrmDisplay`] backed by a drm device
//!
//! Buffers are imported through prime, flips are queued with the legacy page flip ioctl and
//! completion is read back with [`KmsDisplay::receive_page_flips`] once the device fd becomes
//! readable.

use std::{collections::HashMap, sync::Arc, time::Duration};

use drm::{
    buffer::{self, PlanarBuffer},
    control::{crtc, framebuffer, plane, Device as ControlDevice, Event, FbCmd2Flags, PageFlipFlags},
    ClientCapability, Device as BasicDevice, DriverCapability,
};
use tracing::{debug, info_span, instrument, trace, warn};

use super::{
    device::supports_syncobj_eventfd, DrmDeviceFd, DrmDisplay, DrmError, FramebufferId, PipelineId,
    PlaneType,
};
use crate::backend::{
    allocator::{dmabuf::Dmabuf, Buffer, FormatTable, Fourcc, Modifier},
    renderer::SyncobjDevice,
};

#[derive(Debug)]
struct KmsPipeline {
    crtc: crtc::Handle,
    primary: Option<FormatTable>,
    cursor: Option<FormatTable>,
}

/// Display controller of an open drm device
#[derive(Debug)]
pub struct KmsDisplay {
    fd: DrmDeviceFd,
    pipelines: Vec<KmsPipeline>,
    framebuffers: HashMap<FramebufferId, framebuffer::Handle>,
    active: bool,
    explicit_sync: bool,
    span: tracing::Span,
}

impl KmsDisplay {
    /// Enumerate the crtcs and planes of `fd`
    ///
    /// Every crtc becomes a pipeline. Primary and cursor planes are assigned to the first crtc
    /// they can drive. Without universal planes the kernel hides them, primary planes are then
    /// assumed to support the legacy formats.
    pub fn new(fd: DrmDeviceFd) -> Result<KmsDisplay, DrmError> {
        let span = info_span!("drm_kms", device = fd.dev_id().unwrap_or_default());
        let _guard = span.enter();

        let universal_planes = fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        if !universal_planes {
            warn!("Universal planes unsupported, assuming legacy primary formats");
        }
        let monotonic = fd
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1;
        if !monotonic {
            warn!("Page flip timestamps are not taken from the monotonic clock");
        }

        let resources = fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "Error loading resource handles",
            source,
        })?;
        let plane_handles = if universal_planes {
            fd.plane_handles().map_err(|source| DrmError::Access {
                errmsg: "Error loading drm plane resources",
                source,
            })?
        } else {
            Vec::new()
        };

        let mut planes = Vec::new();
        for plane in plane_handles {
            let info = match fd.get_plane(plane) {
                Ok(info) => info,
                Err(err) => {
                    warn!(?plane, "Failed to query plane: {}", err);
                    continue;
                }
            };
            let Some(kind) = plane_type(&fd, plane) else {
                trace!(?plane, "Plane without type property");
                continue;
            };
            let crtcs = resources.filter_crtcs(info.possible_crtcs());
            planes.push((kind, crtcs, format_table(info.formats())));
        }

        let mut pipelines = Vec::new();
        for &crtc in resources.crtcs() {
            let mut take = |kind: PlaneType| {
                let idx = planes
                    .iter()
                    .position(|(plane_kind, crtcs, _)| *plane_kind == kind && crtcs.contains(&crtc))?;
                Some(planes.remove(idx).2)
            };
            let primary = take(PlaneType::Primary).or_else(|| (!universal_planes).then(legacy_formats));
            let cursor = take(PlaneType::Cursor);
            debug!(
                ?crtc,
                primary = primary.as_ref().map_or(0, |table| table.len()),
                cursor = cursor.is_some(),
                "Found pipeline"
            );
            pipelines.push(KmsPipeline { crtc, primary, cursor });
        }

        let explicit_sync = supports_syncobj_eventfd(&fd);
        debug!(explicit_sync, "Drm display initialized");

        drop(_guard);
        Ok(KmsDisplay {
            fd,
            pipelines,
            framebuffers: HashMap::new(),
            active: true,
            explicit_sync,
            span,
        })
    }

    /// Underlying device
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    /// Whether the display accepts new framebuffers and flips
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Pause or resume the display, for example on a session switch
    ///
    /// While paused framebuffer creation and page flips fail with [`DrmError::DeviceInactive`].
    pub fn set_active(&mut self, active: bool) {
        let _guard = self.span.enter();
        debug!(active, "Changing display state");
        self.active = active;
    }

    /// Read the pending events of the device
    ///
    /// Returns the pipeline and vblank time of every completed page flip, to be handed to
    /// [`EglGbmBackend::page_flip_completed`](super::EglGbmBackend::page_flip_completed).
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn receive_page_flips(&self) -> Result<Vec<(PipelineId, Duration)>, DrmError> {
        let events = self.fd.receive_events().map_err(|source| DrmError::Access {
            errmsg: "Error processing drm events",
            source,
        })?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(event) => {
                    trace!(crtc = ?event.crtc, "Got a page-flip event");
                    Some((PipelineId::from(event.crtc), event.duration))
                }
                _ => {
                    trace!("Got a non-page-flip event");
                    None
                }
            })
            .collect())
    }

    fn pipeline(&self, pipeline: PipelineId) -> Option<&KmsPipeline> {
        self.pipelines
            .iter()
            .find(|candidate| PipelineId::from(candidate.crtc) == pipeline)
    }

    fn import_planes(&self, dmabuf: &Dmabuf) -> Result<[Option<buffer::Handle>; 4], DrmError> {
        let mut handles = [None; 4];
        for (idx, fd) in dmabuf.handles().enumerate().take(4) {
            match self.fd.prime_fd_to_buffer(fd) {
                Ok(handle) => handles[idx] = Some(handle),
                Err(source) => {
                    self.close_planes(&handles);
                    return Err(DrmError::Access {
                        errmsg: "Failed to import dmabuf",
                        source,
                    });
                }
            }
        }
        Ok(handles)
    }

    fn close_planes(&self, handles: &[Option<buffer::Handle>; 4]) {
        let mut closed: Vec<buffer::Handle> = Vec::with_capacity(4);
        for &handle in handles.iter().flatten() {
            // planes of one buffer object share the gem handle
            if closed.contains(&handle) {
                continue;
            }
            if let Err(err) = self.fd.close_buffer(handle) {
                warn!(?handle, "Failed to close gem handle: {}", err);
            }
            closed.push(handle);
        }
    }
}

impl DrmDisplay for KmsDisplay {
    fn pipelines(&self) -> Vec<PipelineId> {
        self.pipelines
            .iter()
            .map(|pipeline| PipelineId::from(pipeline.crtc))
            .collect()
    }

    fn plane_formats(&self, pipeline: PipelineId, plane: PlaneType) -> Option<FormatTable> {
        let pipeline = self.pipeline(pipeline)?;
        match plane {
            PlaneType::Primary => pipeline.primary.clone(),
            PlaneType::Cursor => pipeline.cursor.clone(),
            PlaneType::Overlay => None,
        }
    }

    #[instrument(level = "trace", parent = &self.span, skip_all)]
    #[profiling::function]
    fn add_framebuffer(&mut self, dmabuf: &Dmabuf) -> Result<FramebufferId, DrmError> {
        if !self.active {
            return Err(DrmError::DeviceInactive);
        }

        let handles = self.import_planes(dmabuf)?;
        let buffer = PrimeBuffer { dmabuf, handles };
        let flags = if buffer.modifier().is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let result = self.fd.add_planar_framebuffer(&buffer, flags);
        // the framebuffer keeps its own reference on the buffer objects
        self.close_planes(&handles);

        let framebuffer = result.map_err(|source| DrmError::Access {
            errmsg: "Failed to add framebuffer",
            source,
        })?;
        let id = FramebufferId(u32::from(framebuffer));
        trace!(?id, format = ?dmabuf.format(), "Added framebuffer");
        self.framebuffers.insert(id, framebuffer);
        Ok(id)
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        let Some(handle) = self.framebuffers.remove(&framebuffer) else {
            return;
        };
        if let Err(err) = self.fd.destroy_framebuffer(handle) {
            let _guard = self.span.enter();
            warn!(?framebuffer, "Failed to destroy framebuffer: {}", err);
        }
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn page_flip(&mut self, pipeline: PipelineId, framebuffer: FramebufferId) -> Result<(), DrmError> {
        if !self.active {
            return Err(DrmError::DeviceInactive);
        }
        let crtc = self
            .pipeline(pipeline)
            .map(|pipeline| pipeline.crtc)
            .ok_or(DrmError::UnknownPipeline(pipeline))?;
        let handle = *self.framebuffers.get(&framebuffer).ok_or(DrmError::NoFramebuffer)?;

        trace!("Queueing page flip");
        ControlDevice::page_flip(&self.fd, crtc, handle, PageFlipFlags::EVENT, None).map_err(|source| {
            DrmError::Access {
                errmsg: "Failed to queue page flip",
                source,
            }
        })
    }

    fn syncobj_device(&self) -> Option<Arc<dyn SyncobjDevice>> {
        if !self.explicit_sync {
            return None;
        }
        Some(Arc::new(self.fd.clone()))
    }
}

impl Drop for KmsDisplay {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        for (id, handle) in self.framebuffers.drain() {
            if let Err(err) = self.fd.destroy_framebuffer(handle) {
                warn!(framebuffer = ?id, "Failed to destroy framebuffer: {}", err);
            }
        }
    }
}

struct PrimeBuffer<'a> {
    dmabuf: &'a Dmabuf,
    handles: [Option<buffer::Handle>; 4],
}

fn plane_array(values: impl Iterator<Item = u32>) -> [u32; 4] {
    let mut array = [0; 4];
    for (slot, value) in array.iter_mut().zip(values) {
        *slot = value;
    }
    array
}

impl<'a> PlanarBuffer for PrimeBuffer<'a> {
    fn size(&self) -> (u32, u32) {
        let size = self.dmabuf.size();
        (size.w as u32, size.h as u32)
    }

    fn format(&self) -> Fourcc {
        self.dmabuf.format().code
    }

    fn modifier(&self) -> Option<Modifier> {
        match self.dmabuf.format().modifier {
            Modifier::Invalid => None,
            x => Some(x),
        }
    }

    fn pitches(&self) -> [u32; 4] {
        plane_array(self.dmabuf.strides())
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        plane_array(self.dmabuf.offsets())
    }
}

fn plane_type(fd: &DrmDeviceFd, plane: plane::Handle) -> Option<PlaneType> {
    let props = fd.get_properties(plane).ok()?;
    let (ids, values) = props.as_props_and_values();
    ids.iter().zip(values.iter()).find_map(|(&id, &value)| {
        let info = fd.get_property(id).ok()?;
        if info.name().to_str().map(|name| name == "type").unwrap_or(false) {
            plane_type_from_value(value)
        } else {
            None
        }
    })
}

fn plane_type_from_value(value: u64) -> Option<PlaneType> {
    use drm::control::PlaneType as RawPlaneType;

    match value {
        x if x == u64::from(RawPlaneType::Primary as u32) => Some(PlaneType::Primary),
        x if x == u64::from(RawPlaneType::Cursor as u32) => Some(PlaneType::Cursor),
        x if x == u64::from(RawPlaneType::Overlay as u32) => Some(PlaneType::Overlay),
        _ => None,
    }
}

/// Formats of a plane, with implicit modifiers
fn format_table(formats: &[u32]) -> FormatTable {
    let mut table = FormatTable::new();
    for &code in formats {
        match Fourcc::try_from(code) {
            Ok(fourcc) => {
                table.entry(fourcc).or_insert_with(|| vec![Modifier::Invalid]);
            }
            Err(_) => trace!(code, "Skipping unknown plane format"),
        }
    }
    table
}

fn legacy_formats() -> FormatTable {
    format_table(&[Fourcc::Xrgb8888 as u32, Fourcc::Argb8888 as u32])
}
