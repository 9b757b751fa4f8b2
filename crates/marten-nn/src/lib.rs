//! # marten-nn
//!
//! Neural network modules for marten.
//!
//! This crate provides:
//! - [`State`] — co-shaped value/gradient/curvature buffers between modules
//! - [`Parameter`] — the flat learnable-weights vector modules allocate from
//! - [`Module`] / [`BiModule`] / [`Ebm1`] / [`Ebm2`] — the three-pass
//!   (fprop/bprop/bbprop) operator contracts
//! - concrete operators: [`Linear`], [`Bias`], [`Diagonal`], [`Convolution`]
//!   (connection-table driven), [`Subsample`], [`Tanh`], [`StdSigmoid`],
//!   [`Flatten`], [`FlatMerge`], [`ZeroPad`], [`MirrorPad`]
//! - [`Layers`] — the sequential container with branch support and the
//!   two-buffer memory-optimized forward mode
//! - [`net_cscscf`] — the classic convolutional preset topology

pub mod activation;
pub mod conv;
pub mod init;
pub mod layers;
pub mod linear;
pub mod loss;
pub mod merge;
pub mod module;
pub mod net;
pub mod pad;
pub mod parameter;
pub mod pool;
pub mod state;
pub mod table;

pub use activation::{StdSigmoid, Tanh};
pub use conv::Convolution;
pub use init::ForgetParam;
pub use layers::Layers;
pub use linear::{Bias, Diagonal, Linear};
pub use loss::{EuclideanEnergy, FcEbm1, FcEbm2, SquareEnergy};
pub use merge::{FlatMerge, Flatten};
pub use module::{BiModule, Ebm1, Ebm2, Identity, Module};
pub use net::{lenet5, net_cscscf};
pub use pad::{MirrorPad, ZeroPad};
pub use parameter::Parameter;
pub use pool::Subsample;
pub use state::State;
pub use table::Table;
