//! Rectified-linear activation lowerings for the portable tensor IR (PTIR).
//!
//! `Relu`, `Relu6`, `Relu1` and their gradients are lowered into primitive graph nodes
//! (`maximum`, `clamp`, `compare`, `and`, `select`, `broadcast_to`, `map`) staged on a
//! [`GraphBuilder`]. The resulting [`Program`](backend::spec::Program) is executed by any
//! [`PortableBackend`].

extern crate self as ptir_activations;

pub use linkme;

pub mod backend;
pub mod config;
pub mod ops;

pub use backend::spec::{DType, PortableBackend, Program, Shape, TensorSpec, ValueId};
pub use config::{DuplicatePolicy, LoweringConfig};
pub use ops::graph::{BuildError, GraphBuilder};
pub use ops::lowering::{global_registry, lower, LoweringError, LoweringRegistry, RegistryError};
