//! Backward rectifier lowerings.
//!
//! Gradients route the upstream value through `select` instead of multiplying by a mask, so
//! the zero branch stays exact regardless of the incoming gradient. `compare` and `select`
//! never broadcast, which is why ReluGrad and Relu6Grad materialise their bounds at the
//! feature shape. Relu1Grad goes through [`binary_map`] and compares scalars inside the
//! mapped region instead.

use anyhow::Result;
use linkme::distributed_slice;

use crate::backend::spec::{DType, ValueId};
use crate::ops::graph::GraphBuilder;

use super::binary_map::binary_map;
use super::context::LoweringContext;
use super::helpers::{broadcast, int_literal, zero_of};
use super::registry::{LoweringDef, LoweringKind, LOWERING_DEFS};

/// Gradient lowerings handled by this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationGradKind {
    ReluGrad,
    Relu6Grad,
    Relu1Grad,
}

impl ActivationGradKind {
    pub const ALL: [ActivationGradKind; 3] = [
        ActivationGradKind::ReluGrad,
        ActivationGradKind::Relu6Grad,
        ActivationGradKind::Relu1Grad,
    ];

    pub fn op_name(self) -> &'static str {
        match self {
            ActivationGradKind::ReluGrad => "ReluGrad",
            ActivationGradKind::Relu6Grad => "Relu6Grad",
            ActivationGradKind::Relu1Grad => "Relu1Grad",
        }
    }

    /// Emits the gradient of the activation given the upstream `gradient` and the forward
    /// `feature` of shape `shape`.
    pub fn emit(
        self,
        b: &mut GraphBuilder,
        gradient: ValueId,
        feature: ValueId,
        shape: &[usize],
        dtype: DType,
    ) -> Result<ValueId> {
        match self {
            ActivationGradKind::ReluGrad => relu_grad(b, gradient, feature, shape, dtype),
            ActivationGradKind::Relu6Grad => relu6_grad(b, gradient, feature, shape, dtype),
            ActivationGradKind::Relu1Grad => relu1_grad(b, gradient, feature, shape, dtype),
        }
    }

    pub(crate) fn lower(self, ctx: &mut LoweringContext<'_>) -> Result<()> {
        let gradient = ctx.input(0)?;
        let feature = ctx.input(1)?;
        let shape = ctx.input_shape(1)?;
        let dtype = ctx.input_type(0)?;
        let output = self.emit(ctx.builder(), gradient, feature, &shape, dtype)?;
        ctx.set_output(output)?;
        Ok(())
    }
}

/// Returns `gradient` where `feature > 0`, otherwise 0.
pub fn relu_grad(
    b: &mut GraphBuilder,
    gradient: ValueId,
    feature: ValueId,
    shape: &[usize],
    dtype: DType,
) -> Result<ValueId> {
    let zero = zero_of(b, dtype)?;
    let zero = broadcast(b, zero, shape)?;
    let pred = b.gt(feature, zero)?;
    Ok(b.select(pred, gradient, zero)?)
}

/// Returns `gradient` where `0 < feature < 6`, otherwise 0.
pub fn relu6_grad(
    b: &mut GraphBuilder,
    gradient: ValueId,
    feature: ValueId,
    shape: &[usize],
    dtype: DType,
) -> Result<ValueId> {
    let zero = zero_of(b, dtype)?;
    let zero = broadcast(b, zero, shape)?;
    let six = int_literal(b, dtype, 6)?;
    let six = broadcast(b, six, shape)?;
    let below_six = b.lt(feature, six)?;
    let above_zero = b.gt(feature, zero)?;
    let pred = b.logical_and(below_six, above_zero)?;
    Ok(b.select(pred, gradient, zero)?)
}

/// Returns `gradient` where `0 < feature < 1`, otherwise 0.
///
/// Both bounds are strict: the gradient is zero at `feature == 0` and at `feature == 1`,
/// even though the forward clamp passes 1 through unchanged. The feature shape goes unused:
/// the bounds are built as scalars inside the map region and `map` keeps the operand shape.
pub fn relu1_grad(
    b: &mut GraphBuilder,
    gradient: ValueId,
    feature: ValueId,
    _shape: &[usize],
    dtype: DType,
) -> Result<ValueId> {
    binary_map(b, gradient, feature, |b, gradient, feature| {
        let zero = zero_of(b, dtype)?;
        let one = int_literal(b, dtype, 1)?;
        let below_one = b.lt(feature, one)?;
        let above_zero = b.gt(feature, zero)?;
        let pred = b.logical_and(below_one, above_zero)?;
        Ok(b.select(pred, gradient, zero)?)
    })
}

#[distributed_slice(LOWERING_DEFS)]
static RELU_GRAD: LoweringDef = LoweringDef::new(
    "ReluGrad",
    LoweringKind::ActivationGrad(ActivationGradKind::ReluGrad),
);

#[distributed_slice(LOWERING_DEFS)]
static RELU6_GRAD: LoweringDef = LoweringDef::new(
    "Relu6Grad",
    LoweringKind::ActivationGrad(ActivationGradKind::Relu6Grad),
);

#[distributed_slice(LOWERING_DEFS)]
static RELU1_GRAD: LoweringDef = LoweringDef::new(
    "Relu1Grad",
    LoweringKind::ActivationGrad(ActivationGradKind::Relu1Grad),
);
