//! Lowerings for the rectified-linear activation family.
//!
//! Forward ops (`Relu`, `Relu6`, `Relu1`) and their gradients (`ReluGrad`, `Relu6Grad`,
//! `Relu1Grad`) are expressed with the primitive constructors of
//! [`GraphBuilder`](crate::ops::graph::GraphBuilder). Entry points are usable directly or through
//! the name-keyed [`LoweringRegistry`].

pub mod activation;
pub mod activation_grad;
pub mod binary_map;
pub mod context;
pub mod helpers;
pub mod registry;

pub use activation::{relu, relu1, relu6, ActivationKind};
pub use activation_grad::{relu1_grad, relu6_grad, relu_grad, ActivationGradKind};
pub use binary_map::binary_map;
pub use context::{LoweringContext, LoweringError};
pub use registry::{
    all_lowering_defs, global_registry, lower, LoweringDef, LoweringKind, LoweringRegistry,
    RegistryBuilder, RegistryError, LOWERING_DEFS,
};
