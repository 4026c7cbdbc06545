//! Display orientation corrections
//!
//! An [`OutputTransform`] describes how the contents rendered for an output have to be rotated
//! and mirrored to appear upright on the physical panel. The eight possible values form the
//! dihedral group of the square: every transform is a number of quarter turns followed by an
//! optional horizontal mirror, and transforms can be chained with [`OutputTransform::combine`]
//! and undone with [`OutputTransform::inverted`].
//!
//! Chaining is not commutative, `a.combine(b)` means "map with `a` first, then with `b`":
//!
//! ```
//! use frameport::utils::{OutputTransform, Rectangle, Logical, Size};
//!
//! let rect = Rectangle::<i32, Logical>::new((10, 20).into(), (30, 40).into());
//! let bounds = Size::from((100, 200));
//!
//! let a = OutputTransform::Flipped;
//! let b = OutputTransform::Rotated90;
//! assert_eq!(
//!     a.combine(b).map_rect(rect, bounds),
//!     b.map_rect(a.map_rect(rect, bounds), a.map_size(bounds)),
//! );
//! assert_ne!(a.combine(b), b.combine(a));
//! ```

use cgmath::Matrix3;

use super::geometry::{Coordinate, Point, Rectangle, Size};

/// One of the eight orientation corrections of a display
///
/// Each variant is a rotation by a multiple of 90 degrees (clockwise in a y-down coordinate
/// space), optionally followed by a horizontal mirror inside the rotated area.
///
/// The discriminants are the canonical [`kind`](OutputTransform::kind) indices, which match the
/// orientation codes used on the wire by display protocols.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum OutputTransform {
    /// Identity transformation
    #[default]
    Normal = 0,
    /// Rotated by 90 degrees
    Rotated90 = 1,
    /// Rotated by 180 degrees
    Rotated180 = 2,
    /// Rotated by 270 degrees
    Rotated270 = 3,
    /// Mirrored horizontally
    Flipped = 4,
    /// Rotated by 90 degrees, then mirrored horizontally
    Flipped90 = 5,
    /// Rotated by 180 degrees, then mirrored horizontally
    Flipped180 = 6,
    /// Rotated by 270 degrees, then mirrored horizontally
    Flipped270 = 7,
}

/// Error returned when converting an unknown orientation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Unknown output transform code {0}")]
pub struct UnknownTransform(pub u32);

impl OutputTransform {
    /// All transforms in canonical order
    pub const ALL: [OutputTransform; 8] = [
        OutputTransform::Normal,
        OutputTransform::Rotated90,
        OutputTransform::Rotated180,
        OutputTransform::Rotated270,
        OutputTransform::Flipped,
        OutputTransform::Flipped90,
        OutputTransform::Flipped180,
        OutputTransform::Flipped270,
    ];

    /// Build a transform from its mirror flag and number of quarter turns
    ///
    /// `rotation` is taken modulo 4.
    #[inline]
    pub const fn from_parts(flipped: bool, rotation: u32) -> OutputTransform {
        let index = (flipped as usize) * 4 + (rotation % 4) as usize;
        Self::ALL[index]
    }

    /// Returns true if the transformation mirrors contents
    #[inline]
    pub const fn flipped(self) -> bool {
        (self as u32) >= 4
    }

    /// Number of quarter turns applied before the optional mirror, in `0..=3`
    #[inline]
    pub const fn rotation(self) -> u32 {
        (self as u32) % 4
    }

    /// Returns the angle (in degrees) of the rotation component
    #[inline]
    pub const fn degrees(self) -> u32 {
        self.rotation() * 90
    }

    /// Canonical index of this transform, in `0..=7`
    #[inline]
    pub const fn kind(self) -> u32 {
        self as u32
    }

    /// Returns the transform undoing this one
    ///
    /// Every mirrored transform is its own inverse, pure rotations are inverted by rotating the
    /// remaining quarter turns.
    #[inline]
    pub const fn inverted(self) -> OutputTransform {
        if self.flipped() {
            self
        } else {
            Self::from_parts(false, (4 - self.rotation()) % 4)
        }
    }

    /// Chain two transforms: map with `self` first, then with `other`
    ///
    /// For any rectangle `r` inside `bounds`:
    /// `a.combine(b).map_rect(r, bounds) == b.map_rect(a.map_rect(r, bounds), a.map_size(bounds))`.
    #[inline]
    pub const fn combine(self, other: OutputTransform) -> OutputTransform {
        let flipped = self.flipped() ^ other.flipped();
        // a mirror reverses the rotational sense of everything applied after it
        let rotation = if self.flipped() {
            (self.rotation() + 4 - other.rotation()) % 4
        } else {
            (self.rotation() + other.rotation()) % 4
        };
        Self::from_parts(flipped, rotation)
    }

    /// Size of an area after applying this transformation
    ///
    /// Width and height are swapped for quarter and three-quarter turns, mirroring never changes
    /// extents.
    #[inline]
    pub fn map_size<N: Coordinate, Kind>(self, size: Size<N, Kind>) -> Size<N, Kind> {
        if self.rotation() % 2 == 1 {
            (size.h, size.w).into()
        } else {
            size
        }
    }

    /// Maps a rectangle inside an area of the given size into the transformed area
    ///
    /// The rectangle is rotated about the center of `bounds`, then mirrored horizontally inside
    /// the rotated bounds if this transform is flipped.
    pub fn map_rect<N: Coordinate, Kind>(
        self,
        rect: Rectangle<N, Kind>,
        bounds: Size<N, Kind>,
    ) -> Rectangle<N, Kind> {
        let (x, y, w, h) = (rect.loc.x, rect.loc.y, rect.size.w, rect.size.h);
        let (bw, bh) = (bounds.w, bounds.h);

        let (x, y) = match self.rotation() {
            0 => (x, y),
            1 => (bh - y - h, x),
            2 => (bw - x - w, bh - y - h),
            _ => (y, bw - x - w),
        };
        let size = self.map_size(rect.size);

        let x = if self.flipped() {
            self.map_size(bounds).w - x - size.w
        } else {
            x
        };

        Rectangle::new((x, y).into(), size)
    }

    /// Maps a point inside an area of the given size into the transformed area
    #[inline]
    pub fn map_point<N: Coordinate, Kind>(
        self,
        point: Point<N, Kind>,
        bounds: Size<N, Kind>,
    ) -> Point<N, Kind> {
        let empty = Rectangle::new(point, (N::ZERO, N::ZERO).into());
        self.map_rect(empty, bounds).loc
    }

    /// Linear part of this transformation in homogeneous coordinates
    ///
    /// The matrix acts on coordinates relative to the center of the area (y pointing down),
    /// which makes it independent of the area size. Chaining transforms corresponds to
    /// `b.matrix() * a.matrix()` for `a.combine(b)`.
    pub fn matrix(self) -> Matrix3<f64> {
        let quarter = Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let mut matrix = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        for _ in 0..self.rotation() {
            matrix = quarter * matrix;
        }
        if self.flipped() {
            matrix = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0) * matrix;
        }
        matrix
    }
}

impl TryFrom<u32> for OutputTransform {
    type Error = UnknownTransform;

    #[inline]
    fn try_from(code: u32) -> Result<Self, Self::Error> {
        if code < 8 {
            Ok(Self::ALL[code as usize])
        } else {
            Err(UnknownTransform(code))
        }
    }
}

impl From<OutputTransform> for u32 {
    #[inline]
    fn from(transform: OutputTransform) -> u32 {
        transform.kind()
    }
}
