//! Typed constant and broadcast helpers shared by the activation lowerings.

use crate::backend::spec::{DType, ValueId};
use crate::ops::graph::{BuildResult, GraphBuilder};

/// Emits a rank-0 zero of `dtype`.
pub fn zero_of(b: &mut GraphBuilder, dtype: DType) -> BuildResult<ValueId> {
    b.integer_literal(dtype, 0)
}

/// Emits a rank-0 constant holding the integer `value` cast into `dtype`.
pub fn int_literal(b: &mut GraphBuilder, dtype: DType, value: i64) -> BuildResult<ValueId> {
    b.integer_literal(dtype, value)
}

/// Replicates a scalar value across `dims`.
pub fn broadcast(b: &mut GraphBuilder, scalar: ValueId, dims: &[usize]) -> BuildResult<ValueId> {
    b.broadcast_to(scalar, dims)
}
