//! Graph construction and the operator lowerings layered on top of it.
//!
//! `graph` exposes the primitive node constructors; `lowering` translates named activation
//! operators into those primitives and keeps the process-wide registration table.
pub mod graph;
pub mod lowering;
