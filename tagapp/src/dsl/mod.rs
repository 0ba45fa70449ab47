//! DSLogic-class logic analyzer support.

pub mod device;
pub mod internal;

pub use device::{DslConfig, DslDevice, StreamHandler};
