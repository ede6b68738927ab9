//! Forward rectifier lowerings.
//!
//! Each lowering reads one input and emits a single node: `maximum` against a typed zero for
//! Relu, and `clamp` between typed integer bounds for the saturating variants. Scalar bounds
//! rely on the implicit rank-0 broadcasting of `maximum`/`clamp`, so no broadcast node is
//! needed on the forward path.

use anyhow::Result;
use linkme::distributed_slice;

use crate::backend::spec::{DType, ValueId};
use crate::ops::graph::GraphBuilder;

use super::context::LoweringContext;
use super::helpers::{int_literal, zero_of};
use super::registry::{LoweringDef, LoweringKind, LOWERING_DEFS};

/// Forward activations handled by this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Relu,
    Relu6,
    Relu1,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 3] = [
        ActivationKind::Relu,
        ActivationKind::Relu6,
        ActivationKind::Relu1,
    ];

    pub fn op_name(self) -> &'static str {
        match self {
            ActivationKind::Relu => "Relu",
            ActivationKind::Relu6 => "Relu6",
            ActivationKind::Relu1 => "Relu1",
        }
    }

    /// Emits the activation for `input` and returns the output value.
    pub fn emit(self, b: &mut GraphBuilder, input: ValueId, dtype: DType) -> Result<ValueId> {
        match self {
            ActivationKind::Relu => relu(b, input, dtype),
            ActivationKind::Relu6 => relu6(b, input, dtype),
            ActivationKind::Relu1 => relu1(b, input, dtype),
        }
    }

    pub(crate) fn lower(self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let dtype = ctx.input_type(0)?;
        let output = self.emit(ctx.builder(), input, dtype)?;
        ctx.set_output(output)?;
        Ok(())
    }
}

/// Applies ReLU: `max(0, x)`.
pub fn relu(b: &mut GraphBuilder, input: ValueId, dtype: DType) -> Result<ValueId> {
    let zero = zero_of(b, dtype)?;
    Ok(b.maximum(zero, input)?)
}

/// Applies ReLU6: `clamp(0, x, 6)`.
pub fn relu6(b: &mut GraphBuilder, input: ValueId, dtype: DType) -> Result<ValueId> {
    clamp_from_zero(b, input, dtype, 6)
}

/// Applies ReLU1: `clamp(0, x, 1)`.
pub fn relu1(b: &mut GraphBuilder, input: ValueId, dtype: DType) -> Result<ValueId> {
    clamp_from_zero(b, input, dtype, 1)
}

fn clamp_from_zero(
    b: &mut GraphBuilder,
    input: ValueId,
    dtype: DType,
    upper: i64,
) -> Result<ValueId> {
    let zero = zero_of(b, dtype)?;
    let upper = int_literal(b, dtype, upper)?;
    Ok(b.clamp(zero, input, upper)?)
}

#[distributed_slice(LOWERING_DEFS)]
static RELU: LoweringDef = LoweringDef::new("Relu", LoweringKind::Activation(ActivationKind::Relu));

#[distributed_slice(LOWERING_DEFS)]
static RELU6: LoweringDef =
    LoweringDef::new("Relu6", LoweringKind::Activation(ActivationKind::Relu6));

#[distributed_slice(LOWERING_DEFS)]
static RELU1: LoweringDef =
    LoweringDef::new("Relu1", LoweringKind::Activation(ActivationKind::Relu1));
