//! Format info tables for DRM formats.
//!
//! [`get_opaque`] returns the opaque alternative of a DRM format with an alpha channel.
//!
//! ```
//! # use frameport::backend::allocator::Fourcc;
//! # use frameport::backend::allocator::format::get_opaque;
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! [`has_alpha`] returns true if the format has an alpha channel.
//!
//! ```
//! # use frameport::backend::allocator::Fourcc;
//! # use frameport::backend::allocator::format::has_alpha;
//! assert!(has_alpha(Fourcc::Argb8888));
//! assert!(!has_alpha(Fourcc::Xrgb8888));
//! ```
//!
//! [`get_bpp`] returns the number of bits per pixel of a format.
//!
//! ```
//! # use frameport::backend::allocator::Fourcc;
//! # use frameport::backend::allocator::format::get_bpp;
//! assert_eq!(get_bpp(Fourcc::Argb8888), Some(32));
//! ```
//!
//! [`get_channel_sizes`] returns the bit size of each color channel, which is what EGL configs
//! are matched against.
//!
//! ```
//! # use frameport::backend::allocator::Fourcc;
//! # use frameport::backend::allocator::format::{get_channel_sizes, ChannelSizes};
//! assert_eq!(
//!     get_channel_sizes(Fourcc::Xrgb2101010),
//!     Some(ChannelSizes { red: 10, green: 10, blue: 10, alpha: 0 }),
//! );
//! ```

/// Bit size of the color channels of a format
///
/// Padding ("X") bits are not counted as alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelSizes {
    /// Bits of the red channel
    pub red: u32,
    /// Bits of the green channel
    pub green: u32,
    /// Bits of the blue channel
    pub blue: u32,
    /// Bits of the alpha channel
    pub alpha: u32,
}

impl ChannelSizes {
    /// Number of used bits per pixel
    pub const fn depth(&self) -> u32 {
        self.red + self.green + self.blue + self.alpha
    }

    /// Whether every color channel has at least 10 bits
    pub const fn is_10bpc(&self) -> bool {
        self.red >= 10 && self.green >= 10 && self.blue >= 10
    }
}

/// Macro to generate table lookup functions for formats.
///
/// See the module documentation for usage details.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            bpp: $bpp: expr,
            channels: ($r: expr, $g: expr, $b: expr, $a: expr) $(,)?
        }),* $(,)?
    ) => {
        /// Returns the opaque alternative of the specified format.
        ///
        /// If the format has an alpha channel, this may return the corresponding opaque format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_opaque(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<$crate::backend::allocator::Fourcc> {
            match fourcc {
                $($(
                    $crate::backend::allocator::Fourcc::$fourcc
                        => Some($crate::backend::allocator::Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: $crate::backend::allocator::Fourcc) -> bool {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => $a > 0,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the bit size of the color channels of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_channel_sizes(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<ChannelSizes> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some(ChannelSizes {
                    red: $r,
                    green: $g,
                    blue: $b,
                    alpha: $a,
                }),)*
                _ => None,
            }
        }

        /// Returns the depth of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_depth(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($r + $g + $b + $a),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [$crate::backend::allocator::Fourcc] {
            &[
                $(
                    $crate::backend::allocator::Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // 16-bit bpp RGB, no alpha, 6 bits for green channel and 5 bits for blue and red
    Rgb565 { bpp: 16, channels: (5, 6, 5, 0) },
    Bgr565 { bpp: 16, channels: (5, 6, 5, 0) },

    // 24-bit bpp RGB
    Rgb888 { bpp: 24, channels: (8, 8, 8, 0) },
    Bgr888 { bpp: 24, channels: (8, 8, 8, 0) },

    // 32-bit bpp RGB, 8 bits per channel
    Argb8888 { opaque: Xrgb8888, bpp: 32, channels: (8, 8, 8, 8) },
    Xrgb8888 { bpp: 32, channels: (8, 8, 8, 0) },
    Abgr8888 { opaque: Xbgr8888, bpp: 32, channels: (8, 8, 8, 8) },
    Xbgr8888 { bpp: 32, channels: (8, 8, 8, 0) },
    Rgba8888 { opaque: Rgbx8888, bpp: 32, channels: (8, 8, 8, 8) },
    Rgbx8888 { bpp: 32, channels: (8, 8, 8, 0) },
    Bgra8888 { opaque: Bgrx8888, bpp: 32, channels: (8, 8, 8, 8) },
    Bgrx8888 { bpp: 32, channels: (8, 8, 8, 0) },

    // 32-bit bpp RGB with 10-bits per color channel
    Argb2101010 { opaque: Xrgb2101010, bpp: 32, channels: (10, 10, 10, 2) },
    Xrgb2101010 { bpp: 32, channels: (10, 10, 10, 0) },
    Abgr2101010 { opaque: Xbgr2101010, bpp: 32, channels: (10, 10, 10, 2) },
    Xbgr2101010 { bpp: 32, channels: (10, 10, 10, 0) },
    Rgba1010102 { opaque: Rgbx1010102, bpp: 32, channels: (10, 10, 10, 2) },
    Rgbx1010102 { bpp: 32, channels: (10, 10, 10, 0) },
    Bgra1010102 { opaque: Bgrx1010102, bpp: 32, channels: (10, 10, 10, 2) },
    Bgrx1010102 { bpp: 32, channels: (10, 10, 10, 0) },
}
