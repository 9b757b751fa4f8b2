//! # marten-io
//!
//! Binary matrix (tensor) file serialization.
//!
//! - [`save_matrix`] / [`load_matrix`] — round-trip tensors through the
//!   magic-numbered binary matrix format (both the standard and the
//!   historical "Pascal Vincent" numbering schemes are read)
//! - [`load_matrix_or_else`] — the catch-and-recover helper for the one
//!   boundary where errors are a normal runtime condition

pub mod matrix;

pub use matrix::{load_matrix, load_matrix_or_else, save_matrix};
