//! # marten-detect
//!
//! Multi-resolution sliding-window object detection over marten networks.
//!
//! - [`Detector`] — resolution-pyramid scheduling, per-scale network
//!   invocation, response-map maxima extraction, coordinate mapping
//! - [`Bbox`] — a detection with its box in original-image, network-input,
//!   and network-output coordinates
//! - [`ResolutionPolicy`] — how the pyramid is laid out between the
//!   minimum and maximum feasible network input sizes
//! - [`resize_bilinear`] — the per-resolution preprocessing rescale

pub mod bbox;
pub mod detector;
pub mod resize;

pub use bbox::{sort_by_confidence, Bbox};
pub use detector::{Detector, ResolutionPolicy};
pub use resize::resize_bilinear;
