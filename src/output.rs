//! Output descriptors
//!
//! An [`Output`] describes one display sink as seen by the presentation core: its name, its
//! list of modes, the mode currently in use, its location in the global compositor space and
//! the [`OutputTransform`] that corrects for the physical orientation of the panel.
//!
//! Outputs are created and updated by display-configuration code, typically once per connector
//! found on a DRM device, and are cheaply clonable handles to shared state. Render backends key
//! their per-output resources by [`OutputId`] and re-read the current mode and transform at the
//! start of every frame, so that a call to [`Output::change_current_state`] takes effect on the
//! next frame.
//!
//! ```
//! use frameport::output::{Mode, Output, PhysicalProperties, Subpixel};
//! use frameport::utils::OutputTransform;
//!
//! let output = Output::new(
//!     "DP-1".into(),
//!     PhysicalProperties {
//!         size_mm: (600, 340),
//!         subpixel: Subpixel::HorizontalRgb,
//!         make: "Acme".into(),
//!         model: "Panel 27".into(),
//!     },
//! );
//! let mode = Mode { size: (2560, 1440).into(), refresh: 60_000 };
//! output.change_current_state(Some(mode), Some(OutputTransform::Rotated90), None);
//! assert_eq!(output.transformed_size().unwrap(), (1440, 2560).into());
//! ```

use std::{
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tracing::{info, instrument};

#[cfg(feature = "backend_drm")]
use drm::control::{connector::SubPixel as DrmSubPixel, Mode as DrmMode, ModeFlags};

use crate::utils::{Logical, OutputTransform, Physical, Point, Size};

/// An output mode
///
/// A possible combination of dimensions and refresh rate for an output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mode {
    /// The size of the mode, in pixels
    pub size: Size<i32, Physical>,
    /// The refresh rate in millihertz
    ///
    /// `1000` is one fps (frame per second), `2000` is 2 fps, etc...
    pub refresh: i32,
}

impl Mode {
    /// Duration of one refresh cycle
    ///
    /// Returns `None` for modes without a known refresh rate.
    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh <= 0 {
            return None;
        }
        Some(Duration::from_nanos(1_000_000_000_000 / self.refresh as u64))
    }
}

#[cfg(feature = "backend_drm")]
impl From<DrmMode> for Mode {
    fn from(mode: DrmMode) -> Self {
        let clock = mode.clock() as u64;
        let htotal = mode.hsync().2 as u64;
        let vtotal = mode.vsync().2 as u64;

        let mut refresh = (clock * 1_000_000 / htotal + vtotal / 2) / vtotal;

        if mode.flags().contains(ModeFlags::INTERLACE) {
            refresh *= 2;
        }

        if mode.flags().contains(ModeFlags::DBLSCAN) {
            refresh /= 2;
        }

        if mode.vscan() > 1 {
            refresh /= mode.vscan() as u64;
        }

        let (w, h) = mode.size();

        Self {
            size: (w as i32, h as i32).into(),
            refresh: refresh as i32,
        }
    }
}

/// Describes the layout of the subpixels of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subpixel {
    /// Unknown geometry
    Unknown,
    /// No geometry
    None,
    /// Horizontal RGB
    HorizontalRgb,
    /// Horizontal BGR
    HorizontalBgr,
    /// Vertical RGB
    VerticalRgb,
    /// Vertical BGR
    VerticalBgr,
}

#[cfg(feature = "backend_drm")]
impl From<DrmSubPixel> for Subpixel {
    fn from(mode: DrmSubPixel) -> Self {
        match mode {
            DrmSubPixel::HorizontalRgb => Self::HorizontalRgb,
            DrmSubPixel::HorizontalBgr => Self::HorizontalBgr,
            DrmSubPixel::VerticalRgb => Self::VerticalRgb,
            DrmSubPixel::VerticalBgr => Self::VerticalBgr,
            DrmSubPixel::None => Self::None,
            _ => Self::Unknown,
        }
    }
}

/// The physical properties of an output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalProperties {
    /// The size of the monitor, in millimeters
    pub size_mm: (u32, u32),
    /// The subpixel geometry
    pub subpixel: Subpixel,
    /// Textual representation of the manufacturer
    pub make: String,
    /// Textual representation of the model
    pub model: String,
}

/// Process-unique identifier of an [`Output`]
///
/// Stays valid (and unique) after the output was dropped, which makes it suitable as a key in
/// backend bookkeeping and as payload of events crossing threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u64);

impl OutputId {
    fn next() -> OutputId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        OutputId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    description: String,
    physical: PhysicalProperties,
    location: Point<i32, Logical>,
    transform: OutputTransform,
    modes: Vec<Mode>,
    current_mode: Option<Mode>,
}

#[derive(Debug)]
struct OutputData {
    id: OutputId,
    inner: Mutex<Inner>,
}

/// An output as seen by the presentation core
///
/// This handle is reference counted, clones refer to the same output.
#[derive(Debug, Clone)]
pub struct Output {
    data: Arc<OutputData>,
}

impl Output {
    /// Create a new output with given name and physical properties.
    ///
    /// The output starts without any mode and with the [`OutputTransform::Normal`] transform.
    #[instrument]
    pub fn new(name: String, physical: PhysicalProperties) -> Output {
        info!(name, "Creating new Output");

        Output {
            data: Arc::new(OutputData {
                id: OutputId::next(),
                inner: Mutex::new(Inner {
                    description: format!("{} - {} - {}", physical.make, physical.model, name),
                    name,
                    physical,
                    location: (0, 0).into(),
                    transform: OutputTransform::Normal,
                    modes: Vec::new(),
                    current_mode: None,
                }),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.data.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifier of this output
    pub fn id(&self) -> OutputId {
        self.data.id
    }

    /// Adds a mode to the list of known modes to this output
    pub fn add_mode(&self, mode: Mode) {
        let mut inner = self.inner();
        if inner.modes.iter().all(|&m| m != mode) {
            inner.modes.push(mode);
        }
    }

    /// Returns the currently advertised mode of the output
    pub fn current_mode(&self) -> Option<Mode> {
        self.inner().current_mode
    }

    /// Returns the currently advertised transformation of the output
    pub fn current_transform(&self) -> OutputTransform {
        self.inner().transform
    }

    /// Returns the currently advertised location of the output
    pub fn current_location(&self) -> Point<i32, Logical> {
        self.inner().location
    }

    /// Returns the name of the output
    pub fn name(&self) -> String {
        self.inner().name.clone()
    }

    /// Returns the description of the output
    pub fn description(&self) -> String {
        self.inner().description.clone()
    }

    /// Returns the physical properties of the output
    pub fn physical_properties(&self) -> PhysicalProperties {
        self.inner().physical.clone()
    }

    /// Returns the currently advertised modes of the output
    pub fn modes(&self) -> Vec<Mode> {
        self.inner().modes.clone()
    }

    /// Size of the current mode, before applying the transform
    pub fn mode_size(&self) -> Result<Size<i32, Physical>, OutputNoMode> {
        self.current_mode().map(|mode| mode.size).ok_or(OutputNoMode)
    }

    /// Size of the current mode as seen by the scene, after applying the transform
    pub fn transformed_size(&self) -> Result<Size<i32, Physical>, OutputNoMode> {
        let inner = self.inner();
        let mode = inner.current_mode.ok_or(OutputNoMode)?;
        Ok(inner.transform.map_size(mode.size))
    }

    /// Change the current state of this output
    ///
    /// You can changed the current mode, transform status or location of this output. Providing
    /// `None` to any of these field means that the value does not change.
    ///
    /// If the provided mode was not previously known to this output, it is added to its
    /// list of modes.
    #[instrument(skip(self), fields(output = self.name()))]
    pub fn change_current_state(
        &self,
        new_mode: Option<Mode>,
        new_transform: Option<OutputTransform>,
        new_location: Option<Point<i32, Logical>>,
    ) {
        let mut inner = self.inner();
        if let Some(mode) = new_mode {
            if inner.modes.iter().all(|&m| m != mode) {
                inner.modes.push(mode);
            }
            inner.current_mode = new_mode;
        }
        if let Some(transform) = new_transform {
            inner.transform = transform;
        }
        if let Some(new_location) = new_location {
            inner.location = new_location;
        }
    }
}

impl PartialEq for Output {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Output {}

impl Hash for Output {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

/// Output has no active mode
#[derive(Debug, thiserror::Error)]
#[error("Output has no active mode")]
pub struct OutputNoMode;
