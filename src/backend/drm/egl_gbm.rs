//! Render backend drawing with EGL into GBM buffers presented through KMS
//!
//! [`EglGbmBackend`] negotiates the formats usable for rendering once, at creation, by
//! matching the configs of the [`EglRenderer`] against the primary planes of the
//! [`DrmDisplay`]. Every registered output gets a primary layer whose render surface (a
//! [`Swapchain`] plus its damage history) is created lazily at the output's mode size and
//! recreated whenever the mode or the transform of the output changes.
//!
//! Outputs either drive a hardware pipeline, completing frames on page-flip events, or are
//! virtual, completing frames once the GPU finished rendering. With explicit synchronization
//! available the latter is observed through a [`TimelineWaitSource`], otherwise the backend
//! blocks until the renderer is idle.

use std::{
    collections::HashMap,
    env,
    error::Error,
    fmt,
    os::unix::io::{AsFd, OwnedFd},
    time::Duration,
};

use tracing::{debug, info_span, instrument, trace, warn};

use super::{layer::LayerArena, DrmDisplay, DrmError, FramebufferId, PipelineId, PlaneType};
use crate::{
    backend::{
        allocator::{
            dmabuf::{AsDmabuf, Dmabuf},
            format::{get_channel_sizes, ChannelSizes},
            Allocator, Buffer, FormatTable, Fourcc, GraphicsBufferAllocator, Modifier, Slot, Swapchain,
        },
        egl::{EglConfig, EglRenderer},
        renderer::{
            damage::DamageRing,
            pending::{FrameTimeout, FrameTracker},
            LayerId, OutputFrame, PresentationMode, RenderBackend, SurfaceItem, SurfacePixmap,
            SurfaceTexture, SyncTimeline, TimelineWaitSource,
        },
        SwapBuffersError,
    },
    output::{Output, OutputId, OutputNoMode},
    utils::{Buffer as BufferCoords, Clock, Monotonic, OutputTransform, Physical, Rectangle, Size, Time},
};

/// Format negotiated between the renderer and the display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GbmFormat {
    /// DRM format of the buffers
    pub drm_format: Fourcc,
    /// Bits of the red channel
    pub red_size: u32,
    /// Bits of the green channel
    pub green_size: u32,
    /// Bits of the blue channel
    pub blue_size: u32,
    /// Bits of the alpha channel
    pub alpha_size: u32,
}

impl GbmFormat {
    fn from_config(config: &EglConfig) -> GbmFormat {
        GbmFormat {
            drm_format: config.format,
            red_size: config.red,
            green_size: config.green,
            blue_size: config.blue,
            alpha_size: config.alpha,
        }
    }

    /// Channel sizes of this format
    pub fn channel_sizes(&self) -> ChannelSizes {
        ChannelSizes {
            red: self.red_size,
            green: self.green_size,
            blue: self.blue_size,
            alpha: self.alpha_size,
        }
    }
}

/// Configuration of an [`EglGbmBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EglGbmConfig {
    /// Prefer formats with 10 bits per color channel for render surfaces
    pub prefer_10bpc: bool,
    /// Allow client buffers to be scanned out directly
    pub direct_scanout: bool,
    /// When submitted frames are considered lost
    pub frame_timeout: FrameTimeout,
}

impl Default for EglGbmConfig {
    fn default() -> Self {
        EglGbmConfig {
            prefer_10bpc: true,
            direct_scanout: true,
            frame_timeout: FrameTimeout::default(),
        }
    }
}

impl EglGbmConfig {
    /// Default configuration with environment overrides applied
    ///
    /// - `FRAMEPORT_DRM_PREFER_COLOR_DEPTH`: `30` prefers 10 bpc formats, any other number 8 bpc
    /// - `FRAMEPORT_NO_DIRECT_SCANOUT`: `1`, `true`, `yes` or `y` disables direct scanout
    pub fn from_env() -> EglGbmConfig {
        let mut config = EglGbmConfig::default();
        if let Some(depth) = env::var("FRAMEPORT_DRM_PREFER_COLOR_DEPTH")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
        {
            config.prefer_10bpc = depth == 30;
        }
        if env::var("FRAMEPORT_NO_DIRECT_SCANOUT")
            .map(|value| {
                matches!(
                    value.to_lowercase().as_str(),
                    "1" | "true" | "yes" | "y"
                )
            })
            .unwrap_or(false)
        {
            config.direct_scanout = false;
        }
        config
    }
}

/// What an output is presented on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    /// The primary plane of a hardware pipeline
    Pipeline(PipelineId),
    /// Nothing, frames are only rendered
    Virtual,
}

/// Errors of the [`EglGbmBackend`]
#[derive(Debug, thiserror::Error)]
pub enum EglGbmError {
    /// No negotiated format can be allocated and used on the target
    #[error("No suitable format for the render surface")]
    NoSuitableFormat,
    /// Buffer allocation or export failed
    #[error("Buffer allocation failed: {0}")]
    Allocation(#[source] Box<dyn Error + Send + Sync>),
    /// All buffers of the surface are in use
    #[error("No free buffer left in the swapchain")]
    NoFreeSlots,
    /// The renderer failed
    #[error("Renderer error: {0}")]
    Renderer(#[source] Box<dyn Error + Send + Sync>),
    /// The display failed
    #[error("Display error: {0}")]
    Drm(#[from] DrmError),
    /// The previous frame of the output did not complete yet
    #[error("A frame is still in flight on this output")]
    FrameInFlight,
    /// The output was never added to the backend
    #[error("Output is not registered with this backend")]
    OutputNotRegistered,
    /// The output has no current mode
    #[error(transparent)]
    NoMode(#[from] OutputNoMode),
    /// The frame cycle methods were called out of order
    #[error("Out of order call: {0}")]
    OutOfOrder(&'static str),
}

impl From<EglGbmError> for SwapBuffersError {
    fn from(err: EglGbmError) -> SwapBuffersError {
        match err {
            EglGbmError::Drm(err) => err.into(),
            x @ EglGbmError::NoSuitableFormat => SwapBuffersError::ContextLost(Box::new(x)),
            x => SwapBuffersError::TemporaryFailure(Box::new(x)),
        }
    }
}

struct RenderSurface<A: Allocator> {
    swapchain: Swapchain<A>,
    damage: DamageRing,
    size: Size<i32, Physical>,
    transform: OutputTransform,
    format: GbmFormat,
}

impl<A: Allocator + fmt::Debug> fmt::Debug for RenderSurface<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSurface")
            .field("swapchain", &self.swapchain)
            .field("size", &self.size)
            .field("transform", &self.transform)
            .field("format", &self.format)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerKind {
    Primary(PipelineId),
    Cursor(PipelineId),
    Virtual,
}

#[derive(Debug)]
struct Layer<A: Allocator + fmt::Debug> {
    kind: LayerKind,
    surface: Option<RenderSurface<A>>,
}

#[derive(Debug)]
enum ScanoutBuffer<B: Buffer> {
    Rendered { _slot: Slot<B> },
    Client { _dmabuf: Dmabuf },
}

#[derive(Debug)]
struct Displayed<B: Buffer> {
    framebuffer: FramebufferId,
    _buffer: ScanoutBuffer<B>,
}

#[derive(Debug)]
enum Phase<B: Buffer> {
    Idle,
    Rendering {
        slot: Slot<B>,
        dmabuf: Dmabuf,
    },
    Rendered {
        slot: Slot<B>,
        dmabuf: Dmabuf,
        damage: Vec<Rectangle<i32, Physical>>,
        point: Option<u64>,
    },
    Scanout {
        dmabuf: Dmabuf,
        framebuffer: FramebufferId,
    },
}

impl<B: Buffer> Phase<B> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Rendering { .. } => "rendering",
            Phase::Rendered { .. } => "rendered",
            Phase::Scanout { .. } => "scanout",
        }
    }
}

#[derive(Debug)]
struct OutputState<B: Buffer> {
    output: Output,
    target: OutputTarget,
    primary: LayerId,
    cursor: Option<LayerId>,
    phase: Phase<B>,
    frames: FrameTracker,
    timeline: Option<SyncTimeline>,
    queued: Option<Displayed<B>>,
    displayed: Option<Displayed<B>>,
    last_presented: Option<Dmabuf>,
}

impl<B: Buffer> OutputState<B> {
    fn refresh(&self) -> Option<Duration> {
        self.output.current_mode().and_then(|mode| mode.refresh_interval())
    }

    fn release_framebuffers(&mut self, display: &mut impl DrmDisplay) {
        for displayed in [self.queued.take(), self.displayed.take()].into_iter().flatten() {
            display.remove_framebuffer(displayed.framebuffer);
        }
        if let Phase::Scanout { framebuffer, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            display.remove_framebuffer(framebuffer);
        }
    }
}

/// Render backend using EGL to render into GBM buffers displayed through KMS
pub struct EglGbmBackend<D, R, A>
where
    D: DrmDisplay,
    R: EglRenderer,
    A: Allocator + Clone + fmt::Debug,
{
    display: D,
    renderer: R,
    allocator: A,
    config: EglGbmConfig,
    formats: Vec<GbmFormat>,
    configs: HashMap<Fourcc, EglConfig>,
    layers: LayerArena<Layer<A>>,
    outputs: HashMap<OutputId, OutputState<A::Buffer>>,
    timeline_waits: Vec<(OutputId, TimelineWaitSource)>,
    // shared by all outputs, points stay unique across re-registration
    last_point: u64,
    clock: Clock<Monotonic>,
    span: tracing::Span,
}

impl<D, R, A> fmt::Debug for EglGbmBackend<D, R, A>
where
    D: DrmDisplay,
    R: EglRenderer,
    A: Allocator + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EglGbmBackend")
            .field("display", &self.display)
            .field("renderer", &self.renderer)
            .field("allocator", &self.allocator)
            .field("config", &self.config)
            .field("formats", &self.formats)
            .field("outputs", &self.outputs.len())
            .field("layers", &self.layers.len())
            .finish()
    }
}

fn renderer_error<E: Error + Send + Sync + 'static>(err: E) -> EglGbmError {
    EglGbmError::Renderer(Box::new(err))
}

fn allocation_error<E: Error + Send + Sync + 'static>(err: E) -> EglGbmError {
    EglGbmError::Allocation(Box::new(err))
}

fn to_buffer_rect(rect: Rectangle<i32, Physical>) -> Rectangle<i32, BufferCoords> {
    Rectangle::new((rect.loc.x, rect.loc.y).into(), (rect.size.w, rect.size.h).into())
}

fn modifiers_match(supported: &[Modifier], modifier: Modifier) -> bool {
    supported.contains(&modifier)
}

/// Forget the contents of every buffer of `layer`, the next frame repaints everything
fn discard_history<A: Allocator + fmt::Debug>(layers: &mut LayerArena<Layer<A>>, layer: LayerId) {
    if let Some(surface) = layers.get_mut(layer).and_then(|layer| layer.surface.as_mut()) {
        surface.swapchain.reset_buffer_ages();
        surface.damage.reset();
    }
}

impl<D, R, A> EglGbmBackend<D, R, A>
where
    D: DrmDisplay,
    R: EglRenderer,
    A: Allocator + Clone + fmt::Debug + 'static,
    A::Buffer: AsDmabuf,
    A::Error: Send + Sync + 'static,
    <A::Buffer as AsDmabuf>::Error: Error + Send + Sync + 'static,
{
    /// Create a new backend and negotiate the render formats
    ///
    /// Fails with [`EglGbmError::NoSuitableFormat`] if no config of the renderer can be shown
    /// on any pipeline.
    pub fn new(display: D, renderer: R, allocator: A, config: EglGbmConfig) -> Result<Self, EglGbmError> {
        let span = info_span!("backend_egl_gbm");
        let _guard = span.enter();

        let pipelines = display.pipelines();
        let primary_formats = pipelines
            .iter()
            .filter_map(|pipeline| display.plane_formats(*pipeline, PlaneType::Primary))
            .collect::<Vec<_>>();

        let mut formats = Vec::new();
        let mut configs = HashMap::new();
        for egl_config in renderer.configs() {
            if get_channel_sizes(egl_config.format).is_none() {
                debug!(format = ?egl_config.format, "Skipping config with unknown channel sizes");
                continue;
            }
            if configs.contains_key(&egl_config.format) {
                continue;
            }
            let usable = pipelines.is_empty()
                || primary_formats
                    .iter()
                    .any(|table| table.contains_key(&egl_config.format));
            if !usable {
                trace!(format = ?egl_config.format, "No primary plane supports config");
                continue;
            }
            formats.push(GbmFormat::from_config(&egl_config));
            configs.insert(egl_config.format, egl_config);
        }

        if formats.is_empty() {
            return Err(EglGbmError::NoSuitableFormat);
        }
        debug!(?formats, "Negotiated render formats");

        drop(_guard);
        Ok(EglGbmBackend {
            display,
            renderer,
            allocator,
            config,
            formats,
            configs,
            layers: LayerArena::new(),
            outputs: HashMap::new(),
            timeline_waits: Vec::new(),
            last_point: 0,
            clock: Clock::new(),
            span,
        })
    }

    /// Configuration of this backend
    pub fn config(&self) -> &EglGbmConfig {
        &self.config
    }

    /// Access the underlying display
    pub fn display(&self) -> &D {
        &self.display
    }

    /// Mutably access the underlying display
    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    /// Access the underlying renderer
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Mutably access the underlying renderer
    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Whether render surfaces prefer formats with 10 bits per channel
    pub fn prefer_10bpc(&self) -> bool {
        self.config.prefer_10bpc
    }

    /// Negotiated formats, in the order the renderer reported them
    pub fn formats(&self) -> &[GbmFormat] {
        &self.formats
    }

    /// Negotiated format for a DRM format
    pub fn gbm_format_for_drm_format(&self, format: Fourcc) -> Option<GbmFormat> {
        self.formats.iter().find(|gbm| gbm.drm_format == format).copied()
    }

    /// EGL config to render into buffers of `format`
    pub fn config_for_format(&self, format: Fourcc) -> Option<EglConfig> {
        self.configs.get(&format).copied()
    }

    /// Register an output
    ///
    /// Registering an already known output reconfigures it: its pending frames fail and its
    /// layers are replaced.
    #[instrument(level = "debug", parent = &self.span, skip_all, fields(output = %output.name()))]
    pub fn add_output(&mut self, output: &Output, target: OutputTarget) -> Result<(), EglGbmError> {
        if let OutputTarget::Pipeline(pipeline) = target {
            if !self.display.pipelines().contains(&pipeline) {
                return Err(DrmError::UnknownPipeline(pipeline).into());
            }
        }
        self.remove_output(output);

        let primary = match target {
            OutputTarget::Pipeline(pipeline) => self.create_drm_pipeline_layer(pipeline),
            OutputTarget::Virtual => self.create_layer(output),
        };

        // explicit sync is only used to complete frames of virtual outputs
        let timeline = match (target, self.display.syncobj_device()) {
            (OutputTarget::Virtual, Some(device)) => match device.create_syncobj(false) {
                Ok(handle) => Some(SyncTimeline::new(device, handle)),
                Err(err) => {
                    warn!("Failed to create render timeline, using implicit sync: {}", err);
                    None
                }
            },
            _ => None,
        };

        debug!(?target, explicit_sync = timeline.is_some(), "Output added");
        self.outputs.insert(
            output.id(),
            OutputState {
                output: output.clone(),
                target,
                primary,
                cursor: None,
                phase: Phase::Idle,
                frames: FrameTracker::new(self.config.frame_timeout),
                timeline,
                queued: None,
                displayed: None,
                last_presented: None,
            },
        );
        Ok(())
    }

    /// Unregister an output, failing its pending frames and freeing its layers
    ///
    /// Returns `false` if the output was not registered.
    pub fn remove_output(&mut self, output: &Output) -> bool {
        let Some(mut state) = self.outputs.remove(&output.id()) else {
            return false;
        };
        let _guard = self.span.enter();
        let failed = state.frames.fail_all();
        state.release_framebuffers(&mut self.display);
        self.layers.remove(state.primary);
        if let Some(cursor) = state.cursor {
            self.layers.remove(cursor);
        }
        self.timeline_waits.retain(|(id, _)| *id != output.id());
        debug!(output = %output.name(), failed, "Output removed");
        true
    }

    /// Create the layer of a virtual output
    pub fn create_layer(&mut self, output: &Output) -> LayerId {
        let layer = self.layers.insert(Layer {
            kind: LayerKind::Virtual,
            surface: None,
        });
        trace!(output = %output.name(), ?layer, "Created virtual layer");
        layer
    }

    /// Create the primary plane layer of a pipeline
    pub fn create_drm_pipeline_layer(&mut self, pipeline: PipelineId) -> LayerId {
        self.layers.insert(Layer {
            kind: LayerKind::Primary(pipeline),
            surface: None,
        })
    }

    /// Format of the render surface of a layer, if it was created yet
    pub fn layer_format(&self, layer: LayerId) -> Option<GbmFormat> {
        self.layers
            .get(layer)
            .and_then(|layer| layer.surface.as_ref())
            .map(|surface| surface.format)
    }

    /// Primary layer of a registered output
    pub fn primary_layer(&self, output: &Output) -> Option<LayerId> {
        self.outputs.get(&output.id()).map(|state| state.primary)
    }

    /// Restrict rendering of the current frame to `damage`
    ///
    /// Has no effect unless the render buffer has defined contents. The damage is given in
    /// output coordinates and passed to the renderer in buffer coordinates.
    #[instrument(level = "trace", parent = &self.span, skip_all, fields(output = %output.name()))]
    pub fn about_to_start_painting(
        &mut self,
        output: &Output,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), EglGbmError> {
        let state = self
            .outputs
            .get(&output.id())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        let Phase::Rendering { slot, .. } = &state.phase else {
            return Err(EglGbmError::OutOfOrder("about_to_start_painting outside of a frame"));
        };
        if slot.age() == 0 || damage.is_empty() {
            return Ok(());
        }
        let Some(surface) = self.layers.get(state.primary).and_then(|layer| layer.surface.as_ref()) else {
            return Ok(());
        };

        let scene_size = surface.transform.map_size(surface.size);
        let bounds = Rectangle::from_size(scene_size);
        let region = damage
            .iter()
            .filter_map(|rect| rect.intersection(bounds))
            .map(|rect| to_buffer_rect(surface.transform.map_rect(rect, scene_size)))
            .collect::<Vec<_>>();
        trace!(?region, "Setting damage region");
        self.renderer.set_damage_region(&region).map_err(renderer_error)
    }

    /// Report a page flip event of `pipeline`
    ///
    /// `timestamp` is the time of the vblank on the monotonic clock.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn page_flip_completed(&mut self, pipeline: PipelineId, timestamp: Duration) {
        let Some(state) = self
            .outputs
            .values_mut()
            .find(|state| state.target == OutputTarget::Pipeline(pipeline))
        else {
            warn!("Page flip event for an unknown pipeline");
            return;
        };

        if let Some(queued) = state.queued.take() {
            if let Some(previous) = state.displayed.replace(queued) {
                self.display.remove_framebuffer(previous.framebuffer);
            }
        }
        let refresh = state.refresh().unwrap_or_default();
        state.frames.complete_next(refresh, timestamp, PresentationMode::VSync);
    }

    /// Take the event sources waiting for the render timelines of virtual outputs
    ///
    /// Insert them into the event loop and report their events with
    /// [`timeline_signaled`](EglGbmBackend::timeline_signaled).
    pub fn take_timeline_waits(&mut self) -> Vec<(OutputId, TimelineWaitSource)> {
        std::mem::take(&mut self.timeline_waits)
    }

    /// Report that the render timeline of `output` reached `point`
    pub fn timeline_signaled(&mut self, output: OutputId, point: u64) {
        let now: Duration = self.clock.now().into();
        let Some(state) = self.outputs.get_mut(&output) else {
            trace!(point, "Timeline signal for a removed output");
            return;
        };
        let refresh = state.refresh().unwrap_or_default();
        state
            .frames
            .complete_point(point, refresh, now, PresentationMode::VSync);
    }

    /// Fail every frame that exceeded its timeout
    ///
    /// Returns the number of failed frames.
    pub fn expire_frames(&mut self, now: Time<Monotonic>) -> usize {
        let _guard = self.span.enter();
        self.outputs
            .values_mut()
            .map(|state| state.frames.expire(now))
            .sum()
    }

    /// Earliest timeout of all frames in flight
    pub fn next_frame_deadline(&self) -> Option<Time<Monotonic>> {
        self.outputs
            .values()
            .filter_map(|state| state.frames.next_deadline())
            .min()
    }

    /// Texture of the buffer last presented on `output`
    ///
    /// Returns `None` before the first successful presentation and after a graphics reset.
    pub fn texture_for_output(&mut self, output: &Output) -> Option<Box<dyn SurfaceTexture>> {
        let dmabuf = self.outputs.get(&output.id())?.last_presented.clone()?;
        match self.renderer.import_dmabuf(&dmabuf) {
            Ok(texture) => Some(texture),
            Err(err) => {
                let _guard = self.span.enter();
                warn!(output = %output.name(), "Failed to import output buffer: {}", err);
                None
            }
        }
    }

    /// Allocate a buffer as the next frame of `output` would render into
    ///
    /// Creates the render surface for the current mode and transform if needed, so a failing
    /// configuration is detected before a frame is started. The buffer goes back to the
    /// surface once dropped.
    #[instrument(level = "debug", parent = &self.span, skip_all, fields(output = %output.name()))]
    pub fn test_buffer(&mut self, output: &Output) -> Result<Dmabuf, EglGbmError> {
        let state = self
            .outputs
            .get(&output.id())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        if !matches!(state.phase, Phase::Idle) {
            return Err(EglGbmError::OutOfOrder("test_buffer during an unfinished frame"));
        }
        let primary = state.primary;

        let size = output.mode_size()?;
        self.ensure_surface(primary, size, output.current_transform())?;
        let surface = self
            .layers
            .get_mut(primary)
            .and_then(|layer| layer.surface.as_mut())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        let slot = surface
            .swapchain
            .acquire()
            .map_err(allocation_error)?
            .ok_or(EglGbmError::NoFreeSlots)?;
        let dmabuf = slot.export().map_err(allocation_error)?;
        debug!(format = ?surface.format, "Allocated test buffer");
        Ok(dmabuf)
    }

    fn select_formats(&self, kind: LayerKind) -> (Vec<GbmFormat>, Option<FormatTable>) {
        let plane_formats = match kind {
            LayerKind::Primary(pipeline) => self.display.plane_formats(pipeline, PlaneType::Primary),
            LayerKind::Cursor(pipeline) => self.display.plane_formats(pipeline, PlaneType::Cursor),
            LayerKind::Virtual => None,
        };
        let mut candidates = self
            .formats
            .iter()
            .filter(|format| {
                plane_formats
                    .as_ref()
                    .map_or(true, |table| table.contains_key(&format.drm_format))
            })
            .copied()
            .collect::<Vec<_>>();
        // stable, keeps the renderer's order inside both groups
        let prefer_10bpc = self.config.prefer_10bpc;
        candidates.sort_by_key(|format| format.channel_sizes().is_10bpc() != prefer_10bpc);
        (candidates, plane_formats)
    }

    fn create_surface(
        &self,
        kind: LayerKind,
        size: Size<i32, Physical>,
        transform: OutputTransform,
    ) -> Result<RenderSurface<A>, EglGbmError> {
        let (candidates, plane_formats) = self.select_formats(kind);
        let render_formats = self.renderer.render_formats();

        for format in candidates {
            let render_modifiers = render_formats
                .get(&format.drm_format)
                .cloned()
                .unwrap_or_default();
            let mut modifiers = match plane_formats
                .as_ref()
                .and_then(|table| table.get(&format.drm_format))
            {
                Some(plane_modifiers) => render_modifiers
                    .into_iter()
                    .filter(|modifier| plane_modifiers.contains(modifier))
                    .collect::<Vec<_>>(),
                None => render_modifiers,
            };
            if modifiers.is_empty() {
                modifiers.push(Modifier::Invalid);
            }

            let mut swapchain = Swapchain::new(
                self.allocator.clone(),
                size.w as u32,
                size.h as u32,
                format.drm_format,
                modifiers,
            );
            match swapchain.acquire() {
                Ok(Some(_)) => {
                    debug!(?size, ?transform, ?format, "Created render surface");
                    return Ok(RenderSurface {
                        swapchain,
                        damage: DamageRing::new(transform.map_size(size)),
                        size,
                        transform,
                        format,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(?format, "Allocation failed, trying next format: {}", err);
                }
            }
        }

        Err(EglGbmError::NoSuitableFormat)
    }

    fn ensure_surface(
        &mut self,
        layer_id: LayerId,
        size: Size<i32, Physical>,
        transform: OutputTransform,
    ) -> Result<(), EglGbmError> {
        let layer = self.layers.get(layer_id).ok_or(EglGbmError::OutputNotRegistered)?;
        let up_to_date = layer
            .surface
            .as_ref()
            .map_or(false, |surface| surface.size == size && surface.transform == transform);
        if up_to_date {
            return Ok(());
        }

        let surface = self.create_surface(layer.kind, size, transform)?;
        if let Some(layer) = self.layers.get_mut(layer_id) {
            layer.surface = Some(surface);
        }
        Ok(())
    }

    #[profiling::function]
    fn begin_frame_internal(
        &mut self,
        output: &Output,
    ) -> Result<Vec<Rectangle<i32, Physical>>, EglGbmError> {
        let state = self
            .outputs
            .get(&output.id())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        debug_assert!(
            matches!(state.phase, Phase::Idle),
            "begin_frame called while {}",
            state.phase.name()
        );
        if !matches!(state.phase, Phase::Idle) {
            return Err(EglGbmError::OutOfOrder("begin_frame during an unfinished frame"));
        }
        if state.frames.in_flight() > 0 {
            return Err(EglGbmError::FrameInFlight);
        }
        let primary = state.primary;

        let size = output.mode_size()?;
        self.ensure_surface(primary, size, output.current_transform())?;

        let surface = self
            .layers
            .get_mut(primary)
            .and_then(|layer| layer.surface.as_mut())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        let slot = surface
            .swapchain
            .acquire()
            .map_err(allocation_error)?
            .ok_or(EglGbmError::NoFreeSlots)?;
        let dmabuf = slot.export().map_err(allocation_error)?;
        let damage = surface.damage.damage_since(slot.age() as usize);
        self.renderer.bind(&dmabuf).map_err(renderer_error)?;

        trace!(age = slot.age(), ?damage, "Frame started");
        if let Some(state) = self.outputs.get_mut(&output.id()) {
            state.frames.begin_rendering();
            state.phase = Phase::Rendering { slot, dmabuf };
        }
        Ok(damage)
    }

    #[profiling::function]
    fn end_frame_internal(
        &mut self,
        output: &Output,
        rendered: &[Rectangle<i32, Physical>],
        damaged: &[Rectangle<i32, Physical>],
    ) -> Result<(), EglGbmError> {
        let state = self
            .outputs
            .get_mut(&output.id())
            .ok_or(EglGbmError::OutputNotRegistered)?;
        debug_assert!(
            matches!(state.phase, Phase::Rendering { .. }),
            "end_frame called while {}",
            state.phase.name()
        );
        let Phase::Rendering { slot, dmabuf } = std::mem::replace(&mut state.phase, Phase::Idle) else {
            return Err(EglGbmError::OutOfOrder("end_frame without begin_frame"));
        };

        let point = state.timeline.as_ref().map(|_| self.last_point + 1);
        let signal = state.timeline.as_ref().zip(point);
        if let Err(err) = self.renderer.finish(signal) {
            state.frames.abort_rendering();
            discard_history(&mut self.layers, state.primary);
            return Err(renderer_error(err));
        }
        if let Some(point) = point {
            self.last_point = point;
        }

        trace!(?rendered, ?damaged, ?point, "Frame rendered");
        state.phase = Phase::Rendered {
            slot,
            dmabuf,
            damage: damaged.to_vec(),
            point,
        };
        Ok(())
    }

    fn present_internal(&mut self, output: &Output, frame: OutputFrame) -> Result<(), EglGbmError> {
        let Some(state) = self.outputs.get_mut(&output.id()) else {
            frame.failed();
            return Err(EglGbmError::OutputNotRegistered);
        };
        debug_assert!(
            matches!(state.phase, Phase::Rendered { .. } | Phase::Scanout { .. }),
            "present called while {}",
            state.phase.name()
        );

        let refresh = state.refresh();
        let now = self.clock.now();
        match std::mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Rendered {
                slot,
                dmabuf,
                damage,
                point,
            } => {
                match state.target {
                    OutputTarget::Pipeline(pipeline) => {
                        let framebuffer = match self.display.add_framebuffer(&dmabuf) {
                            Ok(framebuffer) => framebuffer,
                            Err(err) => {
                                state.frames.abort_rendering();
                                discard_history(&mut self.layers, state.primary);
                                frame.failed();
                                return Err(err.into());
                            }
                        };
                        if let Err(err) = self.display.page_flip(pipeline, framebuffer) {
                            self.display.remove_framebuffer(framebuffer);
                            state.frames.abort_rendering();
                            discard_history(&mut self.layers, state.primary);
                            frame.failed();
                            return Err(err.into());
                        }
                        state.frames.submit(frame, now, refresh, None);
                        if let Some(surface) = self
                            .layers
                            .get_mut(state.primary)
                            .and_then(|layer| layer.surface.as_mut())
                        {
                            surface.swapchain.submitted(&slot);
                            surface.damage.add(&damage);
                        }
                        state.queued = Some(Displayed {
                            framebuffer,
                            _buffer: ScanoutBuffer::Rendered { _slot: slot },
                        });
                        state.last_presented = Some(dmabuf);
                    }
                    OutputTarget::Virtual => {
                        if let Some(surface) = self
                            .layers
                            .get_mut(state.primary)
                            .and_then(|layer| layer.surface.as_mut())
                        {
                            surface.swapchain.submitted(&slot);
                            surface.damage.add(&damage);
                        }

                        let wait = state
                            .timeline
                            .as_ref()
                            .zip(point)
                            .and_then(|(timeline, point)| timeline.wait_source(point));
                        match wait {
                            Some(source) => {
                                state.frames.submit(frame, now, refresh, point);
                                self.timeline_waits.push((output.id(), source));
                                state.last_presented = Some(dmabuf);
                            }
                            None => {
                                // no way to observe the gpu, block until it is done
                                if let Err(err) = self.renderer.wait_idle() {
                                    state.frames.abort_rendering();
                                    discard_history(&mut self.layers, state.primary);
                                    frame.failed();
                                    return Err(renderer_error(err));
                                }
                                state.frames.submit(frame, now, refresh, None);
                                let done: Duration = self.clock.now().into();
                                state.frames.complete_next(
                                    refresh.unwrap_or_default(),
                                    done,
                                    PresentationMode::VSync,
                                );
                                state.last_presented = Some(dmabuf);
                            }
                        }
                    }
                }
                Ok(())
            }
            Phase::Scanout { dmabuf, framebuffer } => {
                let OutputTarget::Pipeline(pipeline) = state.target else {
                    self.display.remove_framebuffer(framebuffer);
                    frame.failed();
                    return Err(EglGbmError::OutOfOrder("scanout on a virtual output"));
                };
                if let Err(err) = self.display.page_flip(pipeline, framebuffer) {
                    self.display.remove_framebuffer(framebuffer);
                    state.frames.abort_rendering();
                    frame.failed();
                    return Err(err.into());
                }
                state.frames.submit(frame, now, refresh, None);
                // the composited buffers no longer match what is on screen
                discard_history(&mut self.layers, state.primary);
                state.queued = Some(Displayed {
                    framebuffer,
                    _buffer: ScanoutBuffer::Client { _dmabuf: dmabuf.clone() },
                });
                state.last_presented = Some(dmabuf);
                Ok(())
            }
            phase => {
                state.phase = phase;
                frame.failed();
                Err(EglGbmError::OutOfOrder("present without a rendered frame"))
            }
        }
    }

    fn scanout_internal(&mut self, output: &Output, item: &dyn SurfaceItem) -> Result<(), &'static str> {
        if !self.config.direct_scanout {
            return Err("direct scanout disabled");
        }
        let state = self.outputs.get(&output.id()).ok_or("output not registered")?;
        let OutputTarget::Pipeline(pipeline) = state.target else {
            return Err("virtual output");
        };
        if !matches!(state.phase, Phase::Idle) {
            return Err("frame already started");
        }
        if state.frames.in_flight() > 0 {
            return Err("frame in flight");
        }

        let dmabuf = item
            .buffer()
            .and_then(|buffer| buffer.downcast_ref::<Dmabuf>())
            .ok_or("no dmabuf attached")?;
        let mode_size = output.mode_size().map_err(|_| "output has no mode")?;
        let output_size = output.current_transform().map_size(mode_size);
        if item.geometry() != Rectangle::from_size(output_size) {
            return Err("surface does not cover the output");
        }
        if (dmabuf.size().w, dmabuf.size().h) != (mode_size.w, mode_size.h) {
            return Err("buffer size does not match the mode");
        }
        if item.buffer_transform() != output.current_transform() {
            return Err("buffer transform does not match the output");
        }
        if item.opacity() < 1.0 {
            return Err("surface is translucent");
        }

        let format = dmabuf.format();
        let supported = self
            .display
            .plane_formats(pipeline, PlaneType::Primary)
            .and_then(|table| table.get(&format.code).cloned())
            .map_or(false, |modifiers| modifiers_match(&modifiers, format.modifier));
        if !supported {
            return Err("format not supported by the primary plane");
        }

        let dmabuf = dmabuf.clone();
        let framebuffer = self
            .display
            .add_framebuffer(&dmabuf)
            .map_err(|_| "failed to add framebuffer")?;
        if let Some(state) = self.outputs.get_mut(&output.id()) {
            state.frames.begin_rendering();
            state.phase = Phase::Scanout { dmabuf, framebuffer };
        }
        Ok(())
    }
}

impl<D, R, A> RenderBackend for EglGbmBackend<D, R, A>
where
    D: DrmDisplay,
    R: EglRenderer,
    A: Allocator + Clone + fmt::Debug + 'static,
    A::Buffer: AsDmabuf,
    A::Error: Send + Sync + 'static,
    <A::Buffer as AsDmabuf>::Error: Error + Send + Sync + 'static,
{
    #[instrument(level = "trace", parent = &self.span, skip_all, fields(output = %output.name()))]
    fn begin_frame(&mut self, output: &Output) -> Result<Vec<Rectangle<i32, Physical>>, SwapBuffersError> {
        self.begin_frame_internal(output).map_err(Into::into)
    }

    #[instrument(level = "trace", parent = &self.span, skip_all, fields(output = %output.name()))]
    fn end_frame(
        &mut self,
        output: &Output,
        rendered: &[Rectangle<i32, Physical>],
        damaged: &[Rectangle<i32, Physical>],
    ) -> Result<(), SwapBuffersError> {
        self.end_frame_internal(output, rendered, damaged)
            .map_err(Into::into)
    }

    #[instrument(level = "trace", parent = &self.span, skip_all, fields(output = %output.name()))]
    #[profiling::function]
    fn present(&mut self, output: &Output, frame: OutputFrame) -> Result<(), SwapBuffersError> {
        self.present_internal(output, frame).map_err(Into::into)
    }

    fn cursor_layer(&mut self, output: &Output) -> Option<LayerId> {
        let state = self.outputs.get(&output.id())?;
        if let Some(cursor) = state.cursor {
            return Some(cursor);
        }
        let OutputTarget::Pipeline(pipeline) = state.target else {
            return None;
        };
        self.display.plane_formats(pipeline, PlaneType::Cursor)?;

        let cursor = self.layers.insert(Layer {
            kind: LayerKind::Cursor(pipeline),
            surface: None,
        });
        if let Some(state) = self.outputs.get_mut(&output.id()) {
            state.cursor = Some(cursor);
        }
        Some(cursor)
    }

    fn check_graphics_reset(&mut self) -> bool {
        let status = self.renderer.reset_status();
        if !status.is_reset() {
            return false;
        }

        let _guard = self.span.enter();
        warn!(?status, "Graphics reset detected, dropping all render state");
        for state in self.outputs.values_mut() {
            state.frames.fail_all();
            state.release_framebuffers(&mut self.display);
            state.last_presented = None;
        }
        for layer in self.layers.iter_mut() {
            layer.surface = None;
        }
        self.timeline_waits.clear();
        true
    }

    fn graphics_buffer_allocator(&mut self) -> Option<&mut dyn GraphicsBufferAllocator> {
        Some(&mut self.allocator)
    }

    fn test_import_buffer(&mut self, buffer: &dyn Buffer) -> bool {
        let Some(dmabuf) = buffer.downcast_ref::<Dmabuf>() else {
            return false;
        };
        let format = dmabuf.format();
        let importable = self
            .renderer
            .dmabuf_formats()
            .get(&format.code)
            .map_or(false, |modifiers| modifiers_match(modifiers, format.modifier));
        importable
            || self.display.pipelines().into_iter().any(|pipeline| {
                self.display
                    .plane_formats(pipeline, PlaneType::Primary)
                    .and_then(|table| table.get(&format.code).cloned())
                    .map_or(false, |modifiers| modifiers_match(&modifiers, format.modifier))
            })
    }

    fn supported_formats(&self) -> FormatTable {
        self.renderer.dmabuf_formats()
    }

    fn create_surface_texture_wayland(&mut self, pixmap: &SurfacePixmap) -> Option<Box<dyn SurfaceTexture>> {
        let buffer: &dyn Buffer = &*pixmap.buffer;
        let dmabuf = buffer.downcast_ref::<Dmabuf>()?;
        match self.renderer.import_dmabuf(dmabuf) {
            Ok(texture) => Some(texture),
            Err(err) => {
                let _guard = self.span.enter();
                warn!("Failed to import dmabuf: {}", err);
                None
            }
        }
    }

    fn supports_timelines(&self) -> bool {
        self.display.syncobj_device().is_some()
    }

    fn import_timeline(&mut self, fd: OwnedFd) -> Option<SyncTimeline> {
        let device = self.display.syncobj_device()?;
        match SyncTimeline::import(device, fd.as_fd()) {
            Ok(timeline) => Some(timeline),
            Err(err) => {
                let _guard = self.span.enter();
                warn!("Failed to import timeline: {}", err);
                None
            }
        }
    }

    #[instrument(level = "trace", parent = &self.span, skip_all, fields(output = %output.name()))]
    fn scanout(&mut self, output: &Output, item: &dyn SurfaceItem) -> bool {
        match self.scanout_internal(output, item) {
            Ok(()) => true,
            Err(reason) => {
                trace!("Rejecting direct scanout: {}", reason);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::drm::dummy::{
        dummy_dmabuf, DummyAllocator, DummyDisplay, DummyPipeline, DummyRenderer, DummySurfaceItem,
        DummySyncobjDevice,
    };
    use crate::backend::egl::ResetStatus;
    use crate::backend::renderer::frame::tests::{Event, RecordingScheduler};
    use crate::output::{Mode, PhysicalProperties, Subpixel};

    type TestBackend = EglGbmBackend<DummyDisplay, DummyRenderer, DummyAllocator>;

    const FORMATS: [Fourcc; 3] = [Fourcc::Xrgb8888, Fourcc::Argb8888, Fourcc::Xrgb2101010];

    fn output(size: (i32, i32)) -> Output {
        let output = Output::new(
            "DP-1".into(),
            PhysicalProperties {
                size_mm: (600, 340),
                subpixel: Subpixel::HorizontalRgb,
                make: "frameport".into(),
                model: "test".into(),
            },
        );
        let mode = Mode {
            size: size.into(),
            refresh: 60_000,
        };
        output.add_mode(mode);
        output.change_current_state(Some(mode), None, None);
        output
    }

    fn backend(display: DummyDisplay, config: EglGbmConfig) -> TestBackend {
        EglGbmBackend::new(
            display,
            DummyRenderer::new(&FORMATS),
            DummyAllocator::default(),
            config,
        )
        .unwrap()
    }

    fn hardware_backend() -> TestBackend {
        backend(
            DummyDisplay::new(vec![DummyPipeline::new(1, &FORMATS)]),
            EglGbmConfig::default(),
        )
    }

    fn scheduler() -> Arc<RecordingScheduler> {
        Arc::new(RecordingScheduler::default())
    }

    fn render(
        backend: &mut TestBackend,
        output: &Output,
        damage: &[Rectangle<i32, Physical>],
    ) -> Vec<Rectangle<i32, Physical>> {
        let repaint = backend.begin_frame(output).unwrap();
        backend.end_frame(output, &repaint, damage).unwrap();
        repaint
    }

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Physical> {
        Rectangle::new((x, y).into(), (w, h).into())
    }

    #[test]
    fn negotiates_formats_supported_by_planes() {
        let display = DummyDisplay::new(vec![DummyPipeline::new(
            1,
            &[Fourcc::Xrgb8888, Fourcc::Xrgb2101010],
        )]);
        let backend = backend(display, EglGbmConfig::default());

        let formats = backend
            .formats()
            .iter()
            .map(|format| format.drm_format)
            .collect::<Vec<_>>();
        assert_eq!(formats, vec![Fourcc::Xrgb8888, Fourcc::Xrgb2101010]);

        let deep = backend.gbm_format_for_drm_format(Fourcc::Xrgb2101010).unwrap();
        assert_eq!((deep.red_size, deep.green_size, deep.blue_size, deep.alpha_size), (10, 10, 10, 0));
        assert!(backend.gbm_format_for_drm_format(Fourcc::Argb8888).is_none());
        assert_eq!(
            backend.config_for_format(Fourcc::Xrgb8888).map(|config| config.red),
            Some(8)
        );
    }

    #[test]
    fn without_pipelines_every_config_is_usable() {
        let backend = backend(DummyDisplay::default(), EglGbmConfig::default());
        assert_eq!(backend.formats().len(), FORMATS.len());
    }

    #[test]
    fn fails_without_common_format() {
        let display = DummyDisplay::new(vec![DummyPipeline::new(1, &[Fourcc::Nv12])]);
        let result = EglGbmBackend::new(
            display,
            DummyRenderer::new(&FORMATS),
            DummyAllocator::default(),
            EglGbmConfig::default(),
        );
        assert!(matches!(result, Err(EglGbmError::NoSuitableFormat)));
    }

    #[test]
    fn prefers_deep_color_when_configured() {
        let output = output((64, 32));

        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        backend.begin_frame(&output).unwrap();
        let layer = backend.primary_layer(&output).unwrap();
        assert_eq!(backend.layer_format(layer).unwrap().drm_format, Fourcc::Xrgb2101010);

        let mut backend = backend_with(EglGbmConfig {
            prefer_10bpc: false,
            ..Default::default()
        });
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        backend.begin_frame(&output).unwrap();
        let layer = backend.primary_layer(&output).unwrap();
        assert_eq!(backend.layer_format(layer).unwrap().drm_format, Fourcc::Xrgb8888);
    }

    fn backend_with(config: EglGbmConfig) -> TestBackend {
        backend(DummyDisplay::new(vec![DummyPipeline::new(1, &FORMATS)]), config)
    }

    #[test]
    fn falls_back_when_allocation_fails() {
        let output = output((64, 32));
        let mut allocator = DummyAllocator::default();
        allocator.failing_formats = vec![Fourcc::Xrgb2101010];
        let mut backend = EglGbmBackend::new(
            DummyDisplay::new(vec![DummyPipeline::new(1, &FORMATS)]),
            DummyRenderer::new(&FORMATS),
            allocator,
            EglGbmConfig::default(),
        )
        .unwrap();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        backend.begin_frame(&output).unwrap();
        let layer = backend.primary_layer(&output).unwrap();
        assert_eq!(backend.layer_format(layer).unwrap().drm_format, Fourcc::Xrgb8888);
    }

    #[test]
    fn rejects_unknown_pipeline() {
        let mut backend = hardware_backend();
        let result = backend.add_output(&output((64, 32)), OutputTarget::Pipeline(PipelineId(9)));
        assert!(matches!(
            result,
            Err(EglGbmError::Drm(DrmError::UnknownPipeline(PipelineId(9))))
        ));
    }

    #[test]
    fn page_flip_cycle() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        let repaint = render(&mut backend, &output, &[rect(0, 0, 64, 32)]);
        assert_eq!(repaint, vec![rect(0, 0, 64, 32)]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        assert_eq!(backend.display().flips.len(), 1);
        assert!(scheduler.events().is_empty());

        // one frame in flight at most
        assert!(matches!(
            backend.begin_frame(&output),
            Err(SwapBuffersError::TemporaryFailure(_))
        ));

        backend.page_flip_completed(PipelineId(1), Duration::from_secs(5));
        assert!(matches!(
            scheduler.events().as_slice(),
            [Event::Completed(timestamp, _, PresentationMode::VSync)] if *timestamp == Duration::from_secs(5)
        ));

        // second frame only repaints what changed since the buffer was last used
        render(&mut backend, &output, &[rect(1, 1, 2, 2)]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::from_secs(6));
        assert_eq!(backend.display().framebuffers.len(), 1);

        // the first buffer is reused, it lacks the second frame
        let repaint = backend.begin_frame(&output).unwrap();
        assert_eq!(repaint, vec![rect(1, 1, 2, 2)]);
        backend.end_frame(&output, &repaint, &[]).unwrap();
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::from_secs(7));

        // nothing changed since the second buffer was shown
        let repaint = backend.begin_frame(&output).unwrap();
        assert!(repaint.is_empty());
        assert_eq!(scheduler.events().len(), 3);
    }

    #[test]
    fn failed_page_flip_fails_frame() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        backend.display_mut().fail_page_flip = true;

        render(&mut backend, &output, &[]);
        let result = backend.present(&output, OutputFrame::new(scheduler.clone()));
        assert!(matches!(result, Err(SwapBuffersError::TemporaryFailure(_))));
        assert_eq!(scheduler.events(), vec![Event::Failed]);
        assert!(backend.display().framebuffers.is_empty());

        // the output recovers on the next frame
        backend.display_mut().fail_page_flip = false;
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
    }

    #[test]
    fn recreates_surface_on_transform_change() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::ZERO);

        output.change_current_state(None, Some(OutputTransform::Rotated90), None);
        let repaint = backend.begin_frame(&output).unwrap();
        assert_eq!(repaint, vec![rect(0, 0, 32, 64)]);
    }

    #[test]
    fn damage_region_is_mapped_into_buffer_space() {
        // 100x200 mode, the scene sees 200x100
        let cases = [
            (OutputTransform::Rotated90, rect(40, 10, 40, 30)),
            (OutputTransform::Flipped270, rect(40, 160, 40, 30)),
        ];
        for (transform, expected) in cases {
            let output = output((100, 200));
            output.change_current_state(None, Some(transform), None);
            let mut backend = hardware_backend();
            backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

            for _ in 0..4 {
                render(&mut backend, &output, &[]);
                backend.present(&output, OutputFrame::new(scheduler())).unwrap();
                backend.page_flip_completed(PipelineId(1), Duration::ZERO);
            }
            backend.begin_frame(&output).unwrap();
            backend
                .about_to_start_painting(&output, &[rect(10, 20, 30, 40), rect(500, 500, 5, 5)])
                .unwrap();

            let regions = &backend.renderer().damage_regions;
            assert_eq!(regions.len(), 1, "{:?}", transform);
            assert_eq!(regions[0], vec![to_buffer_rect(expected)], "{:?}", transform);
        }
    }

    #[test]
    fn damage_region_needs_defined_contents() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        // first buffer of a fresh surface, contents undefined
        backend.begin_frame(&output).unwrap();
        backend.about_to_start_painting(&output, &[rect(0, 0, 8, 8)]).unwrap();
        assert!(backend.renderer().damage_regions.is_empty());
    }

    #[test]
    fn failed_submission_forgets_buffer_contents() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        render(&mut backend, &output, &[rect(0, 0, 64, 32)]);
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::ZERO);
        render(&mut backend, &output, &[rect(30, 0, 2, 2)]);
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::ZERO);

        // rendered into the first buffer, never shown
        backend.display_mut().fail_page_flip = true;
        let repaint = render(&mut backend, &output, &[rect(10, 10, 4, 4)]);
        assert_eq!(repaint, vec![rect(30, 0, 2, 2)]);
        assert!(backend.present(&output, OutputFrame::new(scheduler())).is_err());
        backend.display_mut().fail_page_flip = false;

        // the same buffer comes back, its contents are unknown
        let repaint = render(&mut backend, &output, &[]);
        assert_eq!(repaint, vec![rect(0, 0, 64, 32)]);
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();
        backend.page_flip_completed(PipelineId(1), Duration::ZERO);

        let repaint = backend.begin_frame(&output).unwrap();
        assert_eq!(repaint, vec![rect(0, 0, 64, 32)]);
    }

    #[test]
    fn failed_framebuffer_creation_forgets_buffer_contents() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        for _ in 0..3 {
            render(&mut backend, &output, &[rect(0, 0, 4, 4)]);
            backend.present(&output, OutputFrame::new(scheduler())).unwrap();
            backend.page_flip_completed(PipelineId(1), Duration::ZERO);
        }

        backend.display_mut().fail_add_framebuffer = true;
        render(&mut backend, &output, &[rect(20, 20, 4, 4)]);
        assert!(backend.present(&output, OutputFrame::new(scheduler())).is_err());
        backend.display_mut().fail_add_framebuffer = false;

        assert_eq!(backend.begin_frame(&output).unwrap(), vec![rect(0, 0, 64, 32)]);
    }

    #[test]
    fn virtual_output_completes_through_timeline() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let syncobj = Arc::new(DummySyncobjDevice::default());
        let mut display = DummyDisplay::default();
        display.syncobj = Some(syncobj.clone());
        let mut backend = backend(display, EglGbmConfig::default());
        assert!(backend.supports_timelines());
        backend.add_output(&output, OutputTarget::Virtual).unwrap();

        render(&mut backend, &output, &[]);
        assert_eq!(backend.renderer().finished, vec![Some(1)]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        assert!(scheduler.events().is_empty());

        let mut waits = backend.take_timeline_waits();
        assert_eq!(waits.len(), 1);
        let (id, source) = waits.remove(0);
        assert_eq!(id, output.id());
        assert_eq!(source.point(), 1);

        let mut event_loop: calloop::EventLoop<'_, Vec<(OutputId, u64)>> =
            calloop::EventLoop::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(source, move |point, _, signals: &mut Vec<(OutputId, u64)>| {
                signals.push((id, point))
            })
            .unwrap();
        let mut signals = Vec::new();
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut signals)
            .unwrap();
        assert_eq!(signals, vec![(output.id(), 1)]);

        for (id, point) in signals {
            backend.timeline_signaled(id, point);
        }
        assert!(matches!(scheduler.events().as_slice(), [Event::Completed(..)]));
        assert_eq!(backend.renderer().idle_waits, 0);

        drop(backend);
        assert_eq!(*syncobj.destroyed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn timeline_points_survive_reregistration() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut display = DummyDisplay::default();
        display.syncobj = Some(Arc::new(DummySyncobjDevice::default()));
        let mut backend = backend(display, EglGbmConfig::default());
        backend.add_output(&output, OutputTarget::Virtual).unwrap();

        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        let first = backend.take_timeline_waits();
        assert_eq!(first[0].1.point(), 1);

        // reconfiguring fails the pending frame, its wait may still fire later
        backend.add_output(&output, OutputTarget::Virtual).unwrap();
        assert_eq!(scheduler.events(), vec![Event::Failed]);

        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        let second = backend.take_timeline_waits();
        assert_eq!(second[0].1.point(), 2);
        assert_eq!(backend.renderer().finished, vec![Some(1), Some(2)]);

        backend.timeline_signaled(output.id(), 1);
        assert_eq!(scheduler.events(), vec![Event::Failed]);
        backend.timeline_signaled(output.id(), 2);
        assert!(matches!(
            scheduler.events().as_slice(),
            [Event::Failed, Event::Completed(..)]
        ));
    }

    #[test]
    fn virtual_output_falls_back_to_blocking() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let syncobj = Arc::new(DummySyncobjDevice {
            fail_eventfd: true,
            ..Default::default()
        });
        let mut display = DummyDisplay::default();
        display.syncobj = Some(syncobj);
        let mut backend = backend(display, EglGbmConfig::default());
        backend.add_output(&output, OutputTarget::Virtual).unwrap();

        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        assert!(backend.take_timeline_waits().is_empty());
        assert_eq!(backend.renderer().idle_waits, 1);
        assert!(matches!(scheduler.events().as_slice(), [Event::Completed(..)]));
    }

    #[test]
    fn scanout_accepts_matching_buffer() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        let item = DummySurfaceItem {
            buffer: Some(dummy_dmabuf((64, 32), Fourcc::Xrgb8888, Modifier::Linear).unwrap()),
            transform: OutputTransform::Normal,
            geometry: rect(0, 0, 64, 32),
            opacity: 1.0,
        };
        assert!(backend.scanout(&output, &item));
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();
        assert_eq!(backend.display().flips.len(), 1);
        backend.page_flip_completed(PipelineId(1), Duration::from_secs(1));
        assert!(matches!(scheduler.events().as_slice(), [Event::Completed(..)]));
        assert!(backend.renderer().bound.is_empty());
    }

    #[test]
    fn scanout_rejections() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        let item = |size: (i32, i32), format, transform, geometry, opacity| DummySurfaceItem {
            buffer: Some(dummy_dmabuf(size, format, Modifier::Linear).unwrap()),
            transform,
            geometry,
            opacity,
        };
        let full = rect(0, 0, 64, 32);
        let normal = OutputTransform::Normal;

        // partial coverage
        assert!(!backend.scanout(
            &output,
            &item((64, 32), Fourcc::Xrgb8888, normal, rect(0, 0, 32, 32), 1.0)
        ));
        // wrong buffer size
        assert!(!backend.scanout(&output, &item((32, 32), Fourcc::Xrgb8888, normal, full, 1.0)));
        // transform mismatch
        assert!(!backend.scanout(
            &output,
            &item((64, 32), Fourcc::Xrgb8888, OutputTransform::Flipped, full, 1.0)
        ));
        // translucent
        assert!(!backend.scanout(&output, &item((64, 32), Fourcc::Xrgb8888, normal, full, 0.5)));
        // format unsupported by the plane
        assert!(!backend.scanout(&output, &item((64, 32), Fourcc::Nv12, normal, full, 1.0)));
        // no buffer
        assert!(!backend.scanout(
            &output,
            &DummySurfaceItem {
                buffer: None,
                transform: normal,
                geometry: full,
                opacity: 1.0,
            }
        ));

        // framebuffer creation failing
        backend.display_mut().fail_add_framebuffer = true;
        assert!(!backend.scanout(&output, &item((64, 32), Fourcc::Xrgb8888, normal, full, 1.0)));
        backend.display_mut().fail_add_framebuffer = false;

        // disabled by configuration
        let mut disabled = backend_with(EglGbmConfig {
            direct_scanout: false,
            ..Default::default()
        });
        disabled.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        assert!(!disabled.scanout(&output, &item((64, 32), Fourcc::Xrgb8888, normal, full, 1.0)));

        // virtual outputs can not scan out
        let mut virt = backend_with(EglGbmConfig::default());
        virt.add_output(&output, OutputTarget::Virtual).unwrap();
        assert!(!virt.scanout(&output, &item((64, 32), Fourcc::Xrgb8888, normal, full, 1.0)));

        // nothing was left behind, a normal frame still works
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();
    }

    #[test]
    fn graphics_reset_fails_frames_and_drops_surfaces() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();

        assert!(!backend.check_graphics_reset());
        backend.renderer_mut().reset = ResetStatus::Guilty;
        assert!(backend.check_graphics_reset());
        assert_eq!(scheduler.events(), vec![Event::Failed]);
        assert!(backend.display().framebuffers.is_empty());
        let layer = backend.primary_layer(&output).unwrap();
        assert!(backend.layer_format(layer).is_none());

        // a late flip event does not resolve anything twice
        backend.page_flip_completed(PipelineId(1), Duration::ZERO);
        assert_eq!(scheduler.events(), vec![Event::Failed]);
    }

    #[test]
    fn removing_output_fails_pending_frames() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        let layer = backend.primary_layer(&output).unwrap();
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();

        assert!(backend.remove_output(&output));
        assert!(!backend.remove_output(&output));
        assert_eq!(scheduler.events(), vec![Event::Failed]);
        assert!(backend.layer_format(layer).is_none());
        assert!(matches!(
            backend.begin_frame(&output),
            Err(SwapBuffersError::TemporaryFailure(_))
        ));
    }

    #[test]
    fn expires_lost_frames() {
        let output = output((64, 32));
        let scheduler = scheduler();
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        render(&mut backend, &output, &[]);
        backend.present(&output, OutputFrame::new(scheduler.clone())).unwrap();

        let deadline = backend.next_frame_deadline().unwrap();
        assert_eq!(backend.expire_frames(deadline), 1);
        assert_eq!(scheduler.events(), vec![Event::Failed]);
        assert!(backend.next_frame_deadline().is_none());
    }

    #[test]
    fn cursor_layer_requires_cursor_plane() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        assert!(backend.cursor_layer(&output).is_none());

        let mut pipeline = DummyPipeline::new(1, &FORMATS);
        pipeline.cursor = Some([(Fourcc::Argb8888, vec![Modifier::Linear])].into_iter().collect());
        let mut backend = backend_with_pipeline(pipeline);
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        let cursor = backend.cursor_layer(&output).unwrap();
        assert_eq!(backend.cursor_layer(&output), Some(cursor));
        assert_ne!(backend.primary_layer(&output), Some(cursor));
    }

    fn backend_with_pipeline(pipeline: DummyPipeline) -> TestBackend {
        backend(DummyDisplay::new(vec![pipeline]), EglGbmConfig::default())
    }

    #[test]
    fn buffer_capabilities() {
        let mut backend = hardware_backend();
        let linear = dummy_dmabuf((16, 16), Fourcc::Argb8888, Modifier::Linear).unwrap();
        let implicit = dummy_dmabuf((16, 16), Fourcc::Xrgb8888, Modifier::Invalid).unwrap();
        let unknown = dummy_dmabuf((16, 16), Fourcc::Nv12, Modifier::Linear).unwrap();

        assert!(backend.test_import_buffer(&linear));
        // not importable, but scannable
        assert!(backend.test_import_buffer(&implicit));
        assert!(!backend.test_import_buffer(&unknown));

        assert_eq!(backend.supported_formats().len(), FORMATS.len());
        let texture = backend
            .create_surface_texture_wayland(&SurfacePixmap {
                buffer: Arc::new(linear),
            })
            .unwrap();
        assert_eq!(texture.format(), Fourcc::Argb8888);
        assert!(backend
            .create_surface_texture_wayland(&SurfacePixmap {
                buffer: Arc::new(unknown),
            })
            .is_none());

        let allocator = backend.graphics_buffer_allocator().unwrap();
        let dmabuf = allocator
            .allocate(8, 8, Fourcc::Xrgb8888, &[Modifier::Linear])
            .unwrap();
        assert_eq!(dmabuf.format().code, Fourcc::Xrgb8888);
    }

    #[test]
    fn texture_of_last_presented_buffer() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        assert!(backend.texture_for_output(&output).is_none());

        render(&mut backend, &output, &[]);
        // rendered but not presented yet
        assert!(backend.texture_for_output(&output).is_none());
        backend.present(&output, OutputFrame::new(scheduler())).unwrap();

        let texture = backend.texture_for_output(&output).unwrap();
        assert_eq!((texture.size().w, texture.size().h), (64, 32));
        assert_eq!(texture.format(), Fourcc::Xrgb2101010);

        backend.renderer_mut().reset = ResetStatus::Innocent;
        assert!(backend.check_graphics_reset());
        assert!(backend.texture_for_output(&output).is_none());
    }

    #[test]
    fn test_buffer_matches_next_frame() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        assert!(matches!(
            backend.test_buffer(&output),
            Err(EglGbmError::OutputNotRegistered)
        ));
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();

        let buffer = backend.test_buffer(&output).unwrap();
        assert_eq!((buffer.size().w, buffer.size().h), (64, 32));
        assert_eq!(buffer.format().code, Fourcc::Xrgb2101010);
        let layer = backend.primary_layer(&output).unwrap();
        assert_eq!(backend.layer_format(layer).unwrap().drm_format, Fourcc::Xrgb2101010);

        // the trial allocation does not count as a rendered frame
        let repaint = backend.begin_frame(&output).unwrap();
        assert_eq!(repaint, vec![rect(0, 0, 64, 32)]);
        assert!(matches!(backend.test_buffer(&output), Err(EglGbmError::OutOfOrder(_))));
    }

    #[test]
    fn imports_timelines() {
        let mut backend = hardware_backend();
        assert!(!backend.supports_timelines());
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        assert!(backend.import_timeline(fd).is_none());

        let syncobj = Arc::new(DummySyncobjDevice::default());
        backend.display_mut().syncobj = Some(syncobj);
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        assert_eq!(backend.import_timeline(fd).map(|timeline| timeline.handle()), Some(42));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "present called while idle")]
    fn present_without_frame_panics_in_debug() {
        let output = output((64, 32));
        let mut backend = hardware_backend();
        backend.add_output(&output, OutputTarget::Pipeline(PipelineId(1))).unwrap();
        let _ = backend.present(&output, OutputFrame::new(scheduler()));
    }

    #[test]
    fn config_from_env() {
        env::set_var("FRAMEPORT_DRM_PREFER_COLOR_DEPTH", "24");
        env::set_var("FRAMEPORT_NO_DIRECT_SCANOUT", "Yes");
        let config = EglGbmConfig::from_env();
        env::remove_var("FRAMEPORT_DRM_PREFER_COLOR_DEPTH");
        env::remove_var("FRAMEPORT_NO_DIRECT_SCANOUT");

        assert!(!config.prefer_10bpc);
        assert!(!config.direct_scanout);
        assert_eq!(EglGbmConfig::default().frame_timeout, FrameTimeout::default());
    }
}
