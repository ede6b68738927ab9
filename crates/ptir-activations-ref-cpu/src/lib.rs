//! Reference CPU interpreter for PTIR programs produced by the activation lowerings.

pub mod cpu;

pub use cpu::{CpuPortableBackend, CpuTensor, TensorData};
