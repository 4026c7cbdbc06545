use std::fmt;
use std::ops::{Add, Sub};

/// Type-level marker for the logical coordinate space
#[derive(Debug)]
pub struct Logical;

/// Type-level marker for the physical coordinate space
///
/// Output modes, render targets and damage regions handed to a backend live here.
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Test if the coordinate is not negative
    fn non_negative(self) -> bool;
    /// Computes self + other, saturating at the numeric bounds instead of overflowing.
    fn saturating_add(self, other: Self) -> Self;
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn non_negative(self) -> bool {
        self >= 0
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        i32::saturating_add(self, other)
    }
}

impl Coordinate for f64 {
    const ZERO: f64 = 0.0;

    #[inline]
    fn non_negative(self) -> bool {
        self >= 0.0
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }
}

fn smaller<N: Coordinate>(a: N, b: N) -> N {
    if b < a {
        b
    } else {
        a
    }
}

fn larger<N: Coordinate>(a: N, b: N) -> N {
    if b > a {
        b
    } else {
        a
    }
}

/// A point as defined by its x and y coordinates
#[repr(C)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: fmt::Debug, S> fmt::Debug for Point<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: Copy, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

/// A size as defined by its width and height
///
/// Constructing a size from a tuple checks that both values are not negative with a
/// `debug_assert!()`. Writing the fields directly bypasses that check.
#[repr(C)]
pub struct Size<N, Kind> {
    /// horizontal extent
    pub w: N,
    /// vertical extent
    pub h: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: fmt::Debug, S> fmt::Debug for Size<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        debug_assert!(
            w.non_negative() && h.non_negative(),
            "Attempting to create a `Size` of negative size: {:?}",
            (w, h)
        );
        Size {
            w,
            h,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<N: Copy, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

/// A rectangle defined by its top-left corner and dimensions
#[repr(C)]
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Create a new [`Rectangle`] from its dimensions, with location zero
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle {
            loc: (N::ZERO, N::ZERO).into(),
            size,
        }
    }

    /// Overlapping area of two rectangles
    ///
    /// Returns `None` if the rectangles do not overlap. Rectangles only touching each other do
    /// not overlap. Far edges saturate at the numeric bounds.
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        let left = larger(self.loc.x, other.loc.x);
        let top = larger(self.loc.y, other.loc.y);
        let right = smaller(
            self.loc.x.saturating_add(self.size.w),
            other.loc.x.saturating_add(other.size.w),
        );
        let bottom = smaller(
            self.loc.y.saturating_add(self.size.h),
            other.loc.y.saturating_add(other.size.h),
        );
        if left >= right || top >= bottom {
            return None;
        }
        Some(Rectangle::new((left, top).into(), (right - left, bottom - top).into()))
    }
}

impl<N: fmt::Debug, S> fmt::Debug for Rectangle<N, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Copy, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}
