//! Portable tensor IR contract shared by the lowerings and the backends that execute them.
pub mod ptir_utils;
pub mod spec;
