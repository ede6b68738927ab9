//! Elementwise binary map over two same-shaped operands.
//!
//! `compare` and `select` do not broadcast, so kernels written against whole tensors have to
//! materialise every constant at the operand shape. A binary map instead hands the kernel two
//! rank-0 values inside a closed region; constants created there are scalars too, and the
//! builder takes care of applying the region to every element pair.

use anyhow::Result;

use crate::backend::spec::ValueId;
use crate::ops::graph::GraphBuilder;

/// Applies `kernel` to every element pair of `lhs` and `rhs`.
///
/// The operands must have identical shapes; a mismatch is reported by the builder as
/// `OperandShapeMismatch` before `kernel` runs. The output has the operand shape and the
/// dtype of the kernel result.
pub fn binary_map<F>(b: &mut GraphBuilder, lhs: ValueId, rhs: ValueId, kernel: F) -> Result<ValueId>
where
    F: FnOnce(&mut GraphBuilder, ValueId, ValueId) -> Result<ValueId>,
{
    let output = b.map(lhs, rhs, kernel)?;
    log::trace!("binary_map({lhs}, {rhs}) -> {output}");
    Ok(output)
}

