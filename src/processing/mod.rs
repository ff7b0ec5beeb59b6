//! Processing labels and the numeric kernels they drive.

pub mod kernels;
pub mod labels;

pub use kernels::{DefaultKernels, SignalKernels};
pub use labels::{LabelRegistry, LabelType, ProcessingLabel};
