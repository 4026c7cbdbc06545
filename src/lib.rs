#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like EGL
#![allow(clippy::upper_case_acronyms)]

//! # frameport: output presentation for compositing window managers
//!
//! This crate contains the part of a compositor that sits between the scene graph and the
//! display hardware: it turns "render this output now" into buffers on screen, and reports
//! back when each frame actually became visible.
//!
//! ## Structure of the crate
//!
//! - [`utils`] contains the geometry types, the [`OutputTransform`](utils::OutputTransform)
//!   group used to correct for rotated or flipped panels, and monotonic clocks.
//! - [`output`] describes the displays frames are produced for.
//! - [`backend`] contains the [`RenderBackend`](backend::renderer::RenderBackend) contract, the
//!   per-frame bookkeeping, explicit synchronization through DRM syncobj timelines and the
//!   [`EglGbmBackend`](backend::drm::EglGbmBackend) presenting through kernel mode setting.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! Everything is driven from a [`calloop`] event loop. Backends never block waiting for the
//! hardware: page flip events of the drm device and the event sources created for timeline
//! points are inserted into the loop, and their callbacks feed completion back into the
//! backend, which in turn notifies the [`FrameScheduler`](backend::renderer::FrameScheduler) of
//! the output.
//!
//! ### Logging
//!
//! frameport makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`], refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward the debug output to other `log` compatible frameworks.

pub mod backend;
pub mod output;
pub mod utils;
