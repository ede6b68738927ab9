//! Per-invocation state handed to a lowering.
//!
//! A context exposes the operator's inputs together with their element type and resolved
//! shape, and holds the single output slot the lowering must fill exactly once.

use thiserror::Error;

use crate::backend::spec::{DType, ValueId};
use crate::ops::graph::GraphBuilder;

/// Failure raised by the lowering harness rather than by graph construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    #[error("{op} expects {expected} input(s), got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op} has no input at index {index}")]
    MissingInput { op: &'static str, index: usize },
    #[error("{op} already produced an output")]
    OutputAlreadySet { op: &'static str },
    #[error("{op} finished without producing an output")]
    OutputNotSet { op: &'static str },
    #[error("{op} input {index} has unresolved shape {shape}")]
    UnresolvedShape {
        op: &'static str,
        index: usize,
        shape: String,
    },
}

/// Per-invocation view handed to a lowering: the builder, the ordered operator inputs and a
/// single output slot.
pub struct LoweringContext<'a> {
    op_name: &'static str,
    builder: &'a mut GraphBuilder,
    inputs: &'a [ValueId],
    output: Option<ValueId>,
}

impl<'a> LoweringContext<'a> {
    pub fn new(op_name: &'static str, builder: &'a mut GraphBuilder, inputs: &'a [ValueId]) -> Self {
        Self {
            op_name,
            builder,
            inputs,
            output: None,
        }
    }

    pub fn op_name(&self) -> &'static str {
        self.op_name
    }

    pub fn builder(&mut self) -> &mut GraphBuilder {
        self.builder
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<ValueId, LoweringError> {
        self.inputs
            .get(index)
            .copied()
            .ok_or(LoweringError::MissingInput {
                op: self.op_name,
                index,
            })
    }

    /// Element type of input `index`.
    pub fn input_type(&self, index: usize) -> anyhow::Result<DType> {
        let value = self.input(index)?;
        Ok(self.builder.dtype_of(value)?)
    }

    /// Fully static dimensions of input `index`.
    pub fn input_shape(&self, index: usize) -> anyhow::Result<Vec<usize>> {
        let value = self.input(index)?;
        let shape = self.builder.shape_of(value)?;
        shape.static_dims().ok_or_else(|| {
            LoweringError::UnresolvedShape {
                op: self.op_name,
                index,
                shape: shape.to_string(),
            }
            .into()
        })
    }

    pub fn set_output(&mut self, value: ValueId) -> Result<(), LoweringError> {
        if self.output.is_some() {
            return Err(LoweringError::OutputAlreadySet { op: self.op_name });
        }
        self.output = Some(value);
        Ok(())
    }

    /// Consumes the context and returns the value written through [`set_output`].
    ///
    /// [`set_output`]: LoweringContext::set_output
    pub fn into_output(self) -> Result<ValueId, LoweringError> {
        self.output
            .ok_or(LoweringError::OutputNotSet { op: self.op_name })
    }
}
