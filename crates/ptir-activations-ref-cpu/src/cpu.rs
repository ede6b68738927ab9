use std::collections::HashMap;
use std::sync::Arc;

use ptir_activations::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CompareSpec, ComparisonOp, DType, Dimension,
    ElementwiseBinaryOp, Instruction, MapSpec, Operation, PortableBackend, Program, Shape,
    SpecErrorCode, TensorLiteral, TensorSpec, ValueId,
};

use num_like::Float;

#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::F64(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, indices: &[usize]) -> TensorData {
        match self {
            TensorData::F32(values) => TensorData::F32(gather(values, indices)),
            TensorData::F64(values) => TensorData::F64(gather(values, indices)),
            TensorData::Si32(values) => TensorData::Si32(gather(values, indices)),
            TensorData::Bool(values) => TensorData::Bool(gather(values, indices)),
        }
    }
}

impl CpuTensor {
    pub fn to_f32_vec(&self) -> BackendResult<Vec<f32>> {
        match &self.data {
            TensorData::F32(values) => Ok(values.to_vec()),
            _ => Err(BackendError::execution(format!(
                "tensor {} is not f32",
                self.spec
            ))),
        }
    }

    pub fn to_f64_vec(&self) -> BackendResult<Vec<f64>> {
        match &self.data {
            TensorData::F64(values) => Ok(values.to_vec()),
            _ => Err(BackendError::execution(format!(
                "tensor {} is not f64",
                self.spec
            ))),
        }
    }

    pub fn to_i32_vec(&self) -> BackendResult<Vec<i32>> {
        match &self.data {
            TensorData::Si32(values) => Ok(values.to_vec()),
            _ => Err(BackendError::execution(format!(
                "tensor {} is not si32",
                self.spec
            ))),
        }
    }

    pub fn to_bool_vec(&self) -> BackendResult<Vec<bool>> {
        match &self.data {
            TensorData::Bool(values) => Ok(values.iter().map(|&flag| flag != 0).collect()),
            _ => Err(BackendError::execution(format!(
                "tensor {} is not i1",
                self.spec
            ))),
        }
    }
}

/// Reference interpreter for PTIR programs. Slow and single-threaded; used as ground truth.
#[derive(Debug, Clone, Default)]
pub struct CpuPortableBackend;

impl CpuPortableBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PortableBackend for CpuPortableBackend {
    type TensorHandle = CpuTensor;

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        literal_to_tensor(&literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(tensor_to_literal(tensor))
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;
        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution(format!(
                "entry expects {} inputs, got {}",
                function.parameter_ids.len(),
                entry_inputs.len()
            )));
        }
        for (spec, input) in function.parameters.iter().zip(entry_inputs) {
            if *spec != input.spec {
                return Err(BackendError::execution(format!(
                    "entry parameter {spec} bound to tensor {}",
                    input.spec
                )));
            }
        }
        evaluate_body(
            program,
            &function.name,
            &function.parameter_ids,
            entry_inputs,
            &function.body,
            &function.result_ids,
        )
    }
}

fn evaluate_body(
    program: &Program,
    scope_name: &str,
    parameter_ids: &[ValueId],
    inputs: &[CpuTensor],
    body: &[Instruction],
    result_ids: &[ValueId],
) -> BackendResult<Vec<CpuTensor>> {
    let mut values: HashMap<ValueId, CpuTensor> = parameter_ids
        .iter()
        .copied()
        .zip(inputs.iter().cloned())
        .collect();

    for (index, instruction) in body.iter().enumerate() {
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for id in &instruction.operands {
            let tensor = values.get(id).cloned().ok_or_else(|| {
                BackendError::execution(format!("operand {id} missing in {scope_name}"))
            })?;
            operands.push(tensor);
        }
        let output = execute_operation(program, instruction, &operands)
            .map_err(|err| augment_backend_error(err, scope_name, index, instruction))?;
        values.insert(instruction.id, output);
    }

    result_ids
        .iter()
        .map(|id| {
            values.get(id).cloned().ok_or_else(|| {
                BackendError::execution(format!("result {id} missing in {scope_name}"))
            })
        })
        .collect()
}

fn execute_operation(
    program: &Program,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<CpuTensor> {
    let output = &instruction.output;
    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op),
        Operation::Clamp => op_clamp(inputs, output),
        Operation::Compare(spec) => op_compare(inputs, output, spec),
        Operation::LogicalAnd => op_logical_and(inputs, output),
        Operation::Select => op_select(inputs, output),
        Operation::Map(spec) => op_map(program, inputs, output, spec),
    }
}

fn augment_backend_error(
    err: BackendError,
    scope_name: &str,
    index: usize,
    instruction: &Instruction,
) -> BackendError {
    match err {
        BackendError::Execution { message } => BackendError::execution(format!(
            "{scope_name}[{index}] {} = {}: {message}",
            instruction.id,
            instruction.op.name()
        )),
        other => other,
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let expected = element_count(&literal.spec.shape)?;
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(decode::<4, f32>(
            &literal.bytes,
            f32::from_le_bytes,
        )?)),
        DType::F64 => TensorData::F64(Arc::from(decode::<8, f64>(
            &literal.bytes,
            f64::from_le_bytes,
        )?)),
        DType::Si32 => TensorData::Si32(Arc::from(decode::<4, i32>(
            &literal.bytes,
            i32::from_le_bytes,
        )?)),
        DType::I1 => TensorData::Bool(Arc::from(literal.bytes.to_vec())),
        other => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("literal dtype {other} unsupported by cpu-portable"),
            ))
        }
    };
    if data.len() != expected {
        return Err(BackendError::execution(format!(
            "literal {} holds {} elements",
            literal.spec,
            data.len()
        )));
    }
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    let bytes: Vec<u8> = match &tensor.data {
        TensorData::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::F64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Si32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Bool(values) => values.to_vec(),
    };
    TensorLiteral::new(tensor.spec.clone(), Arc::from(bytes))
}

fn decode<const N: usize, T>(bytes: &[u8], from_le: fn([u8; N]) -> T) -> BackendResult<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(BackendError::execution(format!(
            "literal byte length {} is not a multiple of {N}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            from_le(raw)
        })
        .collect())
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let [input] = expect_inputs::<1>(inputs, "broadcast_to")?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    if out_dims != static_dims(&spec.result_shape)? {
        return Err(BackendError::execution(
            "broadcast_to result shape mismatch",
        ));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::execution(
            "broadcast_to result rank must be >= operand rank",
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    let mut aligned_in_dims = vec![1usize; out_dims.len()];
    aligned_in_dims[rank_diff..].copy_from_slice(&input_dims);
    for (&dim, &out_dim) in aligned_in_dims.iter().zip(&out_dims) {
        if dim != 1 && dim != out_dim {
            return Err(BackendError::execution("broadcast_to dim mismatch"));
        }
    }

    let in_strides = compute_strides(&aligned_in_dims);
    let out_len: usize = out_dims.iter().product();
    let indices = (0..out_len)
        .map(|flat| {
            unravel_index(flat, &out_dims)
                .iter()
                .zip(&aligned_in_dims)
                .zip(&in_strides)
                .map(|((&coord, &dim), &stride)| if dim == 1 { 0 } else { coord * stride })
                .sum()
        })
        .collect::<Vec<usize>>();
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.gather(&indices),
    })
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_inputs::<2>(inputs, "elementwise binary")?;
    let len = element_count(&output.shape)?;
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            TensorData::F32(zip_scalar_broadcast(a, b, len, |x, y| float_binary(op, x, y))?)
        }
        (TensorData::F64(a), TensorData::F64(b)) => {
            TensorData::F64(zip_scalar_broadcast(a, b, len, |x, y| float_binary(op, x, y))?)
        }
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            TensorData::Si32(zip_scalar_broadcast(a, b, len, |x, y| match op {
                ElementwiseBinaryOp::Maximum => x.max(y),
                ElementwiseBinaryOp::Minimum => x.min(y),
            })?)
        }
        _ => {
            return Err(BackendError::execution(
                "elementwise binary operands must share a numeric dtype",
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn float_binary<T: Float>(op: ElementwiseBinaryOp, x: T, y: T) -> T {
    match op {
        ElementwiseBinaryOp::Maximum => x.nan_max(y),
        ElementwiseBinaryOp::Minimum => x.nan_min(y),
    }
}

fn op_clamp(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [min, operand, max] = expect_inputs::<3>(inputs, "clamp")?;
    let len = element_count(&output.shape)?;
    let data = match (&min.data, &operand.data, &max.data) {
        (TensorData::F32(lo), TensorData::F32(x), TensorData::F32(hi)) => {
            let lower = zip_scalar_broadcast(x, lo, len, |x, lo| x.nan_max(lo))?;
            TensorData::F32(zip_scalar_broadcast(&lower, hi, len, |x, hi| x.nan_min(hi))?)
        }
        (TensorData::F64(lo), TensorData::F64(x), TensorData::F64(hi)) => {
            let lower = zip_scalar_broadcast(x, lo, len, |x, lo| x.nan_max(lo))?;
            TensorData::F64(zip_scalar_broadcast(&lower, hi, len, |x, hi| x.nan_min(hi))?)
        }
        (TensorData::Si32(lo), TensorData::Si32(x), TensorData::Si32(hi)) => {
            let lower = zip_scalar_broadcast(x, lo, len, |x, lo| x.max(lo))?;
            TensorData::Si32(zip_scalar_broadcast(&lower, hi, len, |x, hi| x.min(hi))?)
        }
        _ => {
            return Err(BackendError::execution(
                "clamp operands must share a numeric dtype",
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_inputs::<2>(inputs, "compare")?;
    let flags = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => compare_values(a, b, spec.op)?,
        (TensorData::F64(a), TensorData::F64(b)) => compare_values(a, b, spec.op)?,
        (TensorData::Si32(a), TensorData::Si32(b)) => compare_values(a, b, spec.op)?,
        _ => {
            return Err(BackendError::execution(
                "compare operands must share a numeric dtype",
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::Bool(flags),
    })
}

fn compare_values<T: PartialOrd>(lhs: &[T], rhs: &[T], op: ComparisonOp) -> BackendResult<Arc<[u8]>> {
    if lhs.len() != rhs.len() {
        return Err(BackendError::execution("compare size mismatch"));
    }
    Ok(lhs
        .iter()
        .zip(rhs)
        .map(|(x, y)| {
            let flag = match op {
                ComparisonOp::Less => x < y,
                ComparisonOp::LessEqual => x <= y,
                ComparisonOp::Equal => x == y,
                ComparisonOp::GreaterEqual => x >= y,
                ComparisonOp::Greater => x > y,
                ComparisonOp::NotEqual => x != y,
            };
            flag as u8
        })
        .collect())
}

fn op_logical_and(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_inputs::<2>(inputs, "and")?;
    match (&lhs.data, &rhs.data) {
        (TensorData::Bool(a), TensorData::Bool(b)) if a.len() == b.len() => Ok(CpuTensor {
            spec: output.clone(),
            data: TensorData::Bool(
                a.iter()
                    .zip(b.iter())
                    .map(|(&x, &y)| (x != 0 && y != 0) as u8)
                    .collect(),
            ),
        }),
        _ => Err(BackendError::execution(
            "and expects two i1 tensors of equal size",
        )),
    }
}

fn op_select(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [pred, on_true, on_false] = expect_inputs::<3>(inputs, "select")?;
    let TensorData::Bool(pred) = &pred.data else {
        return Err(BackendError::execution("select predicate must be i1"));
    };
    let data = match (&on_true.data, &on_false.data) {
        (TensorData::F32(t), TensorData::F32(f)) => TensorData::F32(select_values(pred, t, f)?),
        (TensorData::F64(t), TensorData::F64(f)) => TensorData::F64(select_values(pred, t, f)?),
        (TensorData::Si32(t), TensorData::Si32(f)) => {
            TensorData::Si32(select_values(pred, t, f)?)
        }
        (TensorData::Bool(t), TensorData::Bool(f)) => {
            TensorData::Bool(select_values(pred, t, f)?)
        }
        _ => {
            return Err(BackendError::execution(
                "select dtype combination unsupported",
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn select_values<T: Copy>(pred: &[u8], on_true: &[T], on_false: &[T]) -> BackendResult<Arc<[T]>> {
    if pred.len() != on_true.len() || on_true.len() != on_false.len() {
        return Err(BackendError::execution("select size mismatch"));
    }
    Ok(pred
        .iter()
        .zip(on_true.iter().zip(on_false))
        .map(|(&flag, (&t, &f))| if flag != 0 { t } else { f })
        .collect())
}

fn op_map(
    program: &Program,
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &MapSpec,
) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_inputs::<2>(inputs, "map")?;
    let region = program.region(spec.computation).ok_or_else(|| {
        BackendError::execution(format!("map region {} not found", spec.computation.0))
    })?;
    let len = element_count(&output.shape)?;
    if lhs.data.len() != len || rhs.data.len() != len {
        return Err(BackendError::execution("map operand size mismatch"));
    }
    let scope_name = format!("region{}", spec.computation.0);

    let mut elements = Vec::with_capacity(len);
    for index in 0..len {
        let scalars = [scalar_at(lhs, index), scalar_at(rhs, index)];
        let mut results = evaluate_body(
            program,
            &scope_name,
            &region.parameter_ids,
            &scalars,
            &region.body,
            &region.result_ids,
        )?;
        let result = results
            .pop()
            .ok_or_else(|| BackendError::execution("map region produced no result"))?;
        elements.push(result.data);
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: concat_scalars(output.dtype, &elements)?,
    })
}

fn scalar_at(tensor: &CpuTensor, index: usize) -> CpuTensor {
    CpuTensor {
        spec: TensorSpec::new(tensor.spec.dtype, Shape::scalar()),
        data: tensor.data.gather(&[index]),
    }
}

fn concat_scalars(dtype: DType, elements: &[TensorData]) -> BackendResult<TensorData> {
    fn collect<T: Copy>(
        elements: &[TensorData],
        pick: impl Fn(&TensorData) -> Option<&Arc<[T]>>,
    ) -> BackendResult<Arc<[T]>> {
        elements
            .iter()
            .map(|data| {
                pick(data)
                    .and_then(|values| values.first().copied())
                    .ok_or_else(|| BackendError::execution("map region result dtype mismatch"))
            })
            .collect()
    }

    match dtype {
        DType::F32 => Ok(TensorData::F32(collect(elements, |data| match data {
            TensorData::F32(values) => Some(values),
            _ => None,
        })?)),
        DType::F64 => Ok(TensorData::F64(collect(elements, |data| match data {
            TensorData::F64(values) => Some(values),
            _ => None,
        })?)),
        DType::Si32 => Ok(TensorData::Si32(collect(elements, |data| match data {
            TensorData::Si32(values) => Some(values),
            _ => None,
        })?)),
        DType::I1 => Ok(TensorData::Bool(collect(elements, |data| match data {
            TensorData::Bool(values) => Some(values),
            _ => None,
        })?)),
        other => Err(BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("map result dtype {other} unsupported by cpu-portable"),
        )),
    }
}

/// Applies `f` pairwise, broadcasting either side when it holds a single element.
fn zip_scalar_broadcast<T: Copy>(
    lhs: &[T],
    rhs: &[T],
    len: usize,
    f: impl Fn(T, T) -> T,
) -> BackendResult<Arc<[T]>> {
    let pick = |values: &[T], index: usize| -> BackendResult<T> {
        match values.len() {
            1 => Ok(values[0]),
            n if n == len => Ok(values[index]),
            n => Err(BackendError::execution(format!(
                "operand with {n} elements cannot produce {len}"
            ))),
        }
    };
    (0..len)
        .map(|index| Ok(f(pick(lhs, index)?, pick(rhs, index)?)))
        .collect()
}

fn gather<T: Copy>(values: &[T], indices: &[usize]) -> Arc<[T]> {
    indices.iter().map(|&index| values[index]).collect()
}

fn expect_inputs<'a, const N: usize>(
    inputs: &'a [CpuTensor],
    op: &str,
) -> BackendResult<&'a [CpuTensor; N]> {
    inputs.try_into().map_err(|_| {
        BackendError::execution(format!("{op} expects {N} inputs, got {}", inputs.len()))
    })
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => Ok(*v),
            Dimension::Dynamic(sym) => Err(BackendError::execution(format!(
                "dynamic dimension {} not supported at runtime",
                sym.as_str()
            ))),
        })
        .collect()
}

fn element_count(shape: &Shape) -> BackendResult<usize> {
    Ok(static_dims(shape)?.into_iter().product())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

mod num_like {
    /// Float max/min that propagate NaN like the compiled backends do.
    pub trait Float: Copy + PartialOrd {
        fn is_nan(self) -> bool;

        fn nan_max(self, other: Self) -> Self {
            if self.is_nan() || other.is_nan() {
                if self.is_nan() {
                    self
                } else {
                    other
                }
            } else if self >= other {
                self
            } else {
                other
            }
        }

        fn nan_min(self, other: Self) -> Self {
            if self.is_nan() || other.is_nan() {
                if self.is_nan() {
                    self
                } else {
                    other
                }
            } else if self <= other {
                self
            } else {
                other
            }
        }
    }

    impl Float for f32 {
        fn is_nan(self) -> bool {
            f32::is_nan(self)
        }
    }

    impl Float for f64 {
        fn is_nan(self) -> bool {
            f64::is_nan(self)
        }
    }
}
