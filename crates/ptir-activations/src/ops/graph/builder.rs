//! Mutable builder used to stage PTIR operations for a single program.
//!
//! The builder owns one entry function plus the scalar regions referenced by `map`. Every
//! value belongs to the scope that produced it; regions are closed, so a computation built
//! inside `map` can only reference its own parameters and the values it creates.

use std::collections::HashMap;

use thiserror::Error;

use crate::backend::ptir_utils;
use crate::backend::spec::{
    BroadcastToSpec, CompareSpec, ComparisonOp, DType, ElementwiseBinaryOp, Function,
    Instruction, Literal, MapSpec, Operation, Program, Region, RegionId, Shape, SpecError,
    SpecErrorCode, TensorLiteral, TensorSpec, ValueId,
};

/// Failure raised while staging graph nodes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("value {0} is not defined in this graph")]
    UnknownValue(ValueId),
    #[error("value {0} is not visible from the current scope")]
    NotVisible(ValueId),
}

impl BuildError {
    fn spec(code: SpecErrorCode, detail: impl Into<String>) -> Self {
        BuildError::Spec(SpecError::new(code, detail.into()))
    }

    /// Returns the spec error code when the failure is a validation error.
    pub fn spec_code(&self) -> Option<&SpecErrorCode> {
        match self {
            BuildError::Spec(err) => Some(&err.code),
            _ => None,
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Clone)]
struct ValueRecord {
    spec: TensorSpec,
    scope: usize,
}

#[derive(Debug, Default)]
struct Scope {
    id: usize,
    parameter_ids: Vec<ValueId>,
    parameters: Vec<TensorSpec>,
    body: Vec<Instruction>,
}

/// Builder offering the primitive graph constructors used by lowerings.
#[derive(Debug)]
pub struct GraphBuilder {
    next_value: u32,
    next_scope: usize,
    values: HashMap<ValueId, ValueRecord>,
    scopes: Vec<Scope>,
    regions: Vec<Region>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            next_value: 0,
            next_scope: 1,
            values: HashMap::new(),
            scopes: vec![Scope::default()],
            regions: Vec::new(),
        }
    }

    /// Declares an entry-function parameter.
    pub fn parameter(&mut self, spec: TensorSpec) -> BuildResult<ValueId> {
        if self.scopes.len() != 1 {
            return Err(BuildError::spec(
                SpecErrorCode::RegionSignatureMismatch,
                "parameters can only be declared on the entry function",
            ));
        }
        Ok(self.push_parameter(spec))
    }

    /// Returns the tensor spec of a value visible from the current scope.
    pub fn spec_of(&self, value: ValueId) -> BuildResult<&TensorSpec> {
        let record = self
            .values
            .get(&value)
            .ok_or(BuildError::UnknownValue(value))?;
        if record.scope != self.current_scope_id() {
            return Err(BuildError::NotVisible(value));
        }
        Ok(&record.spec)
    }

    pub fn dtype_of(&self, value: ValueId) -> BuildResult<DType> {
        Ok(self.spec_of(value)?.dtype)
    }

    pub fn shape_of(&self, value: ValueId) -> BuildResult<&Shape> {
        Ok(&self.spec_of(value)?.shape)
    }

    /// Number of instructions staged in the current scope.
    pub fn instruction_count(&self) -> usize {
        self.current_scope().body.len()
    }

    /// Emits a dense constant.
    pub fn constant(&mut self, literal: TensorLiteral) -> BuildResult<ValueId> {
        let expected = literal.spec.byte_len().ok_or_else(|| {
            BuildError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("constant of {} has no dense byte layout", literal.spec),
            )
        })?;
        if expected != literal.byte_len() {
            return Err(BuildError::spec(
                SpecErrorCode::InvalidAttributeValue,
                format!(
                    "constant of {} expects {expected} bytes, got {}",
                    literal.spec,
                    literal.byte_len()
                ),
            ));
        }
        let spec = literal.spec.clone();
        Ok(self.emit(Operation::Constant(literal), Vec::new(), spec))
    }

    /// Emits a rank-0 constant holding `value` encoded as `dtype`.
    pub fn scalar_literal(&mut self, dtype: DType, value: Literal) -> BuildResult<ValueId> {
        let literal = ptir_utils::scalar_literal(dtype, value)?;
        self.constant(literal)
    }

    /// Emits a rank-0 constant holding the integer `value` cast into `dtype`.
    pub fn integer_literal(&mut self, dtype: DType, value: i64) -> BuildResult<ValueId> {
        self.scalar_literal(dtype, Literal::Signed(value))
    }

    /// Broadcasts `operand` to `dims` using trailing-aligned broadcasting rules.
    pub fn broadcast_to(&mut self, operand: ValueId, dims: &[usize]) -> BuildResult<ValueId> {
        let spec = self.spec_of(operand)?.clone();
        let operand_dims = spec.shape.static_dims().ok_or_else(|| {
            BuildError::spec(
                SpecErrorCode::DynamicDimensionUnsupported,
                format!("broadcast_to operand {operand} has shape {}", spec.shape),
            )
        })?;
        if operand_dims.len() > dims.len() {
            return Err(BuildError::spec(
                SpecErrorCode::BroadcastRankMismatch,
                format!(
                    "operand rank {} exceeds result rank {}",
                    operand_dims.len(),
                    dims.len()
                ),
            ));
        }
        let offset = dims.len() - operand_dims.len();
        for (axis, &dim) in operand_dims.iter().enumerate() {
            let target = dims[offset + axis];
            if dim != 1 && dim != target {
                return Err(BuildError::spec(
                    SpecErrorCode::BroadcastDimsInvalid,
                    format!("operand axis {axis} has extent {dim}, result has {target}"),
                ));
            }
        }
        let result_shape = ptir_utils::shape_static(dims);
        let output = TensorSpec::new(spec.dtype, result_shape.clone());
        Ok(self.emit(
            Operation::BroadcastTo(BroadcastToSpec { result_shape }),
            vec![operand],
            output,
        ))
    }

    pub fn maximum(&mut self, lhs: ValueId, rhs: ValueId) -> BuildResult<ValueId> {
        self.elementwise_binary(ElementwiseBinaryOp::Maximum, lhs, rhs)
    }

    pub fn minimum(&mut self, lhs: ValueId, rhs: ValueId) -> BuildResult<ValueId> {
        self.elementwise_binary(ElementwiseBinaryOp::Minimum, lhs, rhs)
    }

    /// Emits `min(max(operand, min), max)`. Bounds may be rank-0 or operand-shaped.
    pub fn clamp(&mut self, min: ValueId, operand: ValueId, max: ValueId) -> BuildResult<ValueId> {
        let operand_spec = self.spec_of(operand)?.clone();
        for (label, bound) in [("min", min), ("max", max)] {
            let bound_spec = self.spec_of(bound)?;
            ensure_same_dtype("clamp", bound_spec, &operand_spec)?;
            if !bound_spec.shape.is_scalar() && bound_spec.shape != operand_spec.shape {
                return Err(BuildError::spec(
                    SpecErrorCode::OperandShapeMismatch,
                    format!(
                        "clamp {label} has shape {}, operand has {}",
                        bound_spec.shape, operand_spec.shape
                    ),
                ));
            }
        }
        Ok(self.emit(Operation::Clamp, vec![min, operand, max], operand_spec))
    }

    /// Emits an elementwise comparison producing an `i1` mask. No implicit broadcasting.
    pub fn compare(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        op: ComparisonOp,
    ) -> BuildResult<ValueId> {
        let lhs_spec = self.spec_of(lhs)?;
        let rhs_spec = self.spec_of(rhs)?;
        ensure_same_dtype("compare", lhs_spec, rhs_spec)?;
        ensure_same_shape("compare", lhs_spec, rhs_spec)?;
        let output = TensorSpec::new(DType::I1, lhs_spec.shape.clone());
        Ok(self.emit(
            Operation::Compare(CompareSpec { op }),
            vec![lhs, rhs],
            output,
        ))
    }

    pub fn gt(&mut self, lhs: ValueId, rhs: ValueId) -> BuildResult<ValueId> {
        self.compare(lhs, rhs, ComparisonOp::Greater)
    }

    pub fn lt(&mut self, lhs: ValueId, rhs: ValueId) -> BuildResult<ValueId> {
        self.compare(lhs, rhs, ComparisonOp::Less)
    }

    /// Emits the conjunction of two `i1` masks of identical shape.
    pub fn logical_and(&mut self, lhs: ValueId, rhs: ValueId) -> BuildResult<ValueId> {
        let lhs_spec = self.spec_of(lhs)?;
        let rhs_spec = self.spec_of(rhs)?;
        for spec in [lhs_spec, rhs_spec] {
            if spec.dtype != DType::I1 {
                return Err(BuildError::spec(
                    SpecErrorCode::PredicateMustBeI1,
                    format!("logical_and operand is {spec}"),
                ));
            }
        }
        ensure_same_shape("logical_and", lhs_spec, rhs_spec)?;
        let output = lhs_spec.clone();
        Ok(self.emit(Operation::LogicalAnd, vec![lhs, rhs], output))
    }

    /// Emits `pred ? on_true : on_false`. All three operands must share one shape.
    pub fn select(
        &mut self,
        pred: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> BuildResult<ValueId> {
        let pred_spec = self.spec_of(pred)?;
        let true_spec = self.spec_of(on_true)?;
        let false_spec = self.spec_of(on_false)?;
        if pred_spec.dtype != DType::I1 {
            return Err(BuildError::spec(
                SpecErrorCode::PredicateMustBeI1,
                format!("select predicate is {pred_spec}"),
            ));
        }
        ensure_same_dtype("select", true_spec, false_spec)?;
        ensure_same_shape("select", true_spec, false_spec)?;
        ensure_same_shape("select", pred_spec, true_spec)?;
        let output = true_spec.clone();
        Ok(self.emit(Operation::Select, vec![pred, on_true, on_false], output))
    }

    /// Applies a scalar computation to every element pair of two same-shaped operands.
    ///
    /// `computation` receives the builder positioned inside a fresh region together with the
    /// two rank-0 region parameters, and returns the region result. The emitted `map` node
    /// has the operand shape and the result dtype. When `computation` fails the partially
    /// built region is discarded.
    pub fn map<F, E>(&mut self, lhs: ValueId, rhs: ValueId, computation: F) -> Result<ValueId, E>
    where
        F: FnOnce(&mut GraphBuilder, ValueId, ValueId) -> Result<ValueId, E>,
        E: From<BuildError>,
    {
        let lhs_spec = self.spec_of(lhs)?.clone();
        let rhs_spec = self.spec_of(rhs)?.clone();
        ensure_same_shape("map", &lhs_spec, &rhs_spec)?;

        self.open_scope();
        let lhs_scalar = self.push_parameter(TensorSpec::new(lhs_spec.dtype, Shape::scalar()));
        let rhs_scalar = self.push_parameter(TensorSpec::new(rhs_spec.dtype, Shape::scalar()));

        let result = match computation(self, lhs_scalar, rhs_scalar) {
            Ok(result) => result,
            Err(err) => {
                self.discard_scope();
                return Err(err);
            }
        };
        let (region, result_dtype) = self.close_region(result)?;

        let output = TensorSpec::new(result_dtype, lhs_spec.shape);
        Ok(self.emit(
            Operation::Map(MapSpec { computation: region }),
            vec![lhs, rhs],
            output,
        ))
    }

    /// Finalises the entry function and returns the program.
    pub fn finish(mut self, name: impl Into<String>, result_ids: &[ValueId]) -> BuildResult<Program> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in result_ids {
            results.push(self.spec_of(*id)?.clone());
        }
        let name = name.into();
        let Some(entry) = self.scopes.pop() else {
            return Err(BuildError::spec(
                SpecErrorCode::Unspecified("SpecError: builder has no entry scope"),
                name,
            ));
        };
        let function = Function {
            name: name.clone(),
            parameters: entry.parameters,
            parameter_ids: entry.parameter_ids,
            results,
            body: entry.body,
            result_ids: result_ids.to_vec(),
        };
        Ok(Program::new(name)
            .with_functions(vec![function])
            .with_regions(self.regions))
    }

    fn elementwise_binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> BuildResult<ValueId> {
        let lhs_spec = self.spec_of(lhs)?;
        let rhs_spec = self.spec_of(rhs)?;
        ensure_same_dtype("elementwise", lhs_spec, rhs_spec)?;
        let output = if lhs_spec.shape.is_scalar() {
            rhs_spec.clone()
        } else if rhs_spec.shape.is_scalar() || lhs_spec.shape == rhs_spec.shape {
            lhs_spec.clone()
        } else {
            return Err(BuildError::spec(
                SpecErrorCode::OperandShapeMismatch,
                format!(
                    "{op:?} operands have shapes {} and {}",
                    lhs_spec.shape, rhs_spec.shape
                ),
            ));
        };
        Ok(self.emit(Operation::ElementwiseBinary(op), vec![lhs, rhs], output))
    }

    fn emit(&mut self, op: Operation, operands: Vec<ValueId>, output: TensorSpec) -> ValueId {
        let id = self.allocate_value(output.clone());
        log::trace!("emit {id} = {}({operands:?}) -> {output}", op.name());
        self.current_scope_mut().body.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    fn push_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = self.allocate_value(spec.clone());
        let scope = self.current_scope_mut();
        scope.parameter_ids.push(id);
        scope.parameters.push(spec);
        id
    }

    fn allocate_value(&mut self, spec: TensorSpec) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        let scope = self.current_scope_id();
        self.values.insert(id, ValueRecord { spec, scope });
        id
    }

    fn open_scope(&mut self) {
        let id = self.next_scope;
        self.next_scope += 1;
        self.scopes.push(Scope {
            id,
            ..Scope::default()
        });
    }

    /// Pops the innermost scope and records it as a region returning `result`.
    fn close_region(&mut self, result: ValueId) -> BuildResult<(RegionId, DType)> {
        let spec = match self.spec_of(result) {
            Ok(spec) => spec.clone(),
            Err(err) => {
                self.discard_scope();
                return Err(err);
            }
        };
        if !spec.shape.is_scalar() {
            self.discard_scope();
            return Err(BuildError::spec(
                SpecErrorCode::RegionSignatureMismatch,
                format!("map computation must return a scalar, got {spec}"),
            ));
        }
        let Some(scope) = self.scopes.pop() else {
            return Err(BuildError::NotVisible(result));
        };
        let id = RegionId(self.regions.len());
        let dtype = spec.dtype;
        self.regions.push(Region {
            id,
            parameters: scope.parameters,
            parameter_ids: scope.parameter_ids,
            body: scope.body,
            results: vec![spec],
            result_ids: vec![result],
        });
        Ok((id, dtype))
    }

    /// Pops the innermost scope and forgets every value it allocated.
    fn discard_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            self.values.retain(|_, record| record.scope != scope.id);
        }
    }

    fn current_scope(&self) -> &Scope {
        // The entry scope is only popped by `finish`, which consumes the builder.
        &self.scopes[self.scopes.len() - 1]
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn current_scope_id(&self) -> usize {
        self.current_scope().id
    }
}

fn ensure_same_dtype(op: &str, lhs: &TensorSpec, rhs: &TensorSpec) -> BuildResult<()> {
    if lhs.dtype != rhs.dtype {
        return Err(BuildError::spec(
            SpecErrorCode::OperandDTypeMismatch,
            format!("{op} operands have dtypes {} and {}", lhs.dtype, rhs.dtype),
        ));
    }
    Ok(())
}

fn ensure_same_shape(op: &str, lhs: &TensorSpec, rhs: &TensorSpec) -> BuildResult<()> {
    if lhs.shape != rhs.shape {
        return Err(BuildError::spec(
            SpecErrorCode::OperandShapeMismatch,
            format!("{op} operands have shapes {} and {}", lhs.shape, rhs.shape),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ptir_utils::tensor_spec_static;

    #[test]
    fn maximum_broadcasts_scalar_operand() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[2, 3]))
            .expect("parameter");
        let zero = b.integer_literal(DType::F32, 0).expect("zero");
        let out = b.maximum(zero, x).expect("maximum");
        assert_eq!(b.shape_of(out).expect("shape").static_dims(), Some(vec![2, 3]));
    }

    #[test]
    fn compare_rejects_scalar_against_tensor() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[4]))
            .expect("parameter");
        let zero = b.integer_literal(DType::F32, 0).expect("zero");
        let err = b.gt(x, zero).expect_err("compare must not broadcast");
        assert_eq!(err.spec_code(), Some(&SpecErrorCode::OperandShapeMismatch));
    }

    #[test]
    fn compare_rejects_mixed_dtypes() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[]))
            .expect("parameter");
        let one = b.integer_literal(DType::F64, 1).expect("one");
        let err = b.lt(x, one).expect_err("dtype mismatch");
        assert_eq!(err.spec_code(), Some(&SpecErrorCode::OperandDTypeMismatch));
    }

    #[test]
    fn select_requires_predicate_mask() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[3]))
            .expect("parameter");
        let err = b.select(x, x, x).expect_err("non-i1 predicate");
        assert_eq!(err.spec_code(), Some(&SpecErrorCode::PredicateMustBeI1));
    }

    #[test]
    fn broadcast_rejects_incompatible_extent() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[3]))
            .expect("parameter");
        let err = b.broadcast_to(x, &[2, 4]).expect_err("3 does not broadcast to 4");
        assert_eq!(err.spec_code(), Some(&SpecErrorCode::BroadcastDimsInvalid));

        let ok = b.broadcast_to(x, &[2, 3]).expect("3 broadcasts to 2x3");
        assert_eq!(b.shape_of(ok).expect("shape").static_dims(), Some(vec![2, 3]));
    }

    #[test]
    fn map_region_cannot_capture_outer_values() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[2]))
            .expect("parameter");
        let outer_zero = b.integer_literal(DType::F32, 0).expect("zero");
        let err = b
            .map(x, x, |b, lhs, _rhs| b.maximum(lhs, outer_zero))
            .expect_err("outer value is not visible");
        assert_eq!(err, BuildError::NotVisible(outer_zero));

        // The failed region is discarded and the builder is back in the entry scope.
        let out = b.maximum(outer_zero, x).expect("entry scope restored");
        let program = b.finish("captured", &[out]).expect("finish");
        assert!(program.regions.is_empty());
    }

    #[test]
    fn failed_map_forgets_region_values() {
        let mut b = GraphBuilder::new();
        let x = b
            .parameter(tensor_spec_static(DType::F32, &[3]))
            .expect("parameter");
        let before = b.values.len();

        let mut inner = Vec::new();
        let err = b
            .map(x, x, |b, lhs, rhs| {
                inner.extend([lhs, rhs]);
                let peak = b.maximum(lhs, rhs)?;
                inner.push(peak);
                b.broadcast_to(peak, &[2])
            })
            .expect_err("region must return a scalar");
        assert_eq!(
            err.spec_code(),
            Some(&SpecErrorCode::RegionSignatureMismatch)
        );
        assert_eq!(b.values.len(), before);
        for id in inner {
            assert_eq!(b.spec_of(id), Err(BuildError::UnknownValue(id)));
        }

        let err = b
            .map(x, x, |b, lhs, _rhs| b.maximum(lhs, ValueId(999)))
            .expect_err("unknown operand");
        assert_eq!(err, BuildError::UnknownValue(ValueId(999)));
        assert_eq!(b.values.len(), before);
        assert_eq!(b.instruction_count(), 0);
    }

    #[test]
    fn map_records_scalar_region() {
        let mut b = GraphBuilder::new();
        let g = b
            .parameter(tensor_spec_static(DType::F32, &[2, 2]))
            .expect("gradient");
        let f = b
            .parameter(tensor_spec_static(DType::F32, &[2, 2]))
            .expect("feature");
        let out = b
            .map(g, f, |b, lhs, rhs| -> BuildResult<ValueId> { b.maximum(lhs, rhs) })
            .expect("map");
        assert_eq!(b.instruction_count(), 1);
        let program = b.finish("mapped", &[out]).expect("finish");
        assert_eq!(program.regions.len(), 1);
        let region = &program.regions[0];
        assert_eq!(region.parameters.len(), 2);
        assert!(region.parameters.iter().all(|spec| spec.shape.is_scalar()));
        assert_eq!(region.body.len(), 1);
        assert_eq!(
            program.entry_function().expect("entry").results[0],
            tensor_spec_static(DType::F32, &[2, 2])
        );
    }

    #[test]
    fn map_rejects_mismatched_operands() {
        let mut b = GraphBuilder::new();
        let g = b
            .parameter(tensor_spec_static(DType::F32, &[]))
            .expect("gradient");
        let f = b
            .parameter(tensor_spec_static(DType::F32, &[5]))
            .expect("feature");
        let err = b
            .map(g, f, |b, lhs, rhs| -> BuildResult<ValueId> { b.maximum(lhs, rhs) })
            .expect_err("shape mismatch");
        assert_eq!(err.spec_code(), Some(&SpecErrorCode::OperandShapeMismatch));
    }

    #[test]
    fn unknown_values_are_reported() {
        let mut b = GraphBuilder::new();
        let err = b.maximum(ValueId(7), ValueId(8)).expect_err("unknown");
        assert_eq!(err, BuildError::UnknownValue(ValueId(7)));
    }
}
