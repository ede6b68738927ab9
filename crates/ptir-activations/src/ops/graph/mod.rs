//! Graph construction primitives consumed by the lowerings.

mod builder;

pub use builder::{BuildError, BuildResult, GraphBuilder};
