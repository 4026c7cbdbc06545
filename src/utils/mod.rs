//! Various utilities functions and types

mod clock;
mod geometry;
pub mod transform;

pub use self::clock::*;
pub use self::geometry::{Buffer, Coordinate, Logical, Physical, Point, Rectangle, Size};
pub use self::transform::{OutputTransform, UnknownTransform};
