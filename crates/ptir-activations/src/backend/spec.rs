use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Frozen PTIR specification version enforced by this interface.
pub const SPEC_VERSION: &str = "ptir.v0.4";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Enumerates scalar element types supported by the PTIR backend contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si4,
    Ui4,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Fp8E4M3,
    Fp8E5M2,
    Bf16,
    F16,
    F32,
    F64,
    Cf32,
    Cf64,
}

impl DType {
    /// Returns the size in bytes when storage size is well-defined.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::I1 => Some(1),
            DType::Si8 | DType::Ui8 => Some(1),
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => Some(2),
            DType::Si32 | DType::Ui32 | DType::F32 => Some(4),
            DType::Si64 | DType::Ui64 | DType::F64 => Some(8),
            DType::Cf32 => Some(8),
            DType::Cf64 => Some(16),
            DType::Si4 | DType::Ui4 | DType::Fp8E4M3 | DType::Fp8E5M2 => None,
        }
    }

    /// Lower-case mnemonic used by the textual program format.
    pub fn mnemonic(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si4 => "si4",
            DType::Ui4 => "ui4",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Ui16 => "ui16",
            DType::Si32 => "si32",
            DType::Ui32 => "ui32",
            DType::Si64 => "si64",
            DType::Ui64 => "ui64",
            DType::Fp8E4M3 => "fp8e4m3",
            DType::Fp8E5M2 => "fp8e5m2",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Cf32 => "cf32",
            DType::Cf64 => "cf64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank-0 shape used for scalar literals and map region parameters.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(v) => v.to_string(),
                Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
            })
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Returns total byte length when shape is static and dtype size is known.
    pub fn byte_len(&self) -> Option<usize> {
        let elem_count = self.element_count()?;
        let elem_size = self.dtype.size_in_bytes()?;
        elem_count.checked_mul(elem_size)
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}, {}>", self.dtype, self.shape)
    }
}

/// Scalar literal value before it is encoded into a concrete element type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

/// Dense literal tensor payload, little-endian element bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Comparator used by the `compare` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

/// Elementwise binary ops that broadcast rank-0 operands implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Maximum,
    Minimum,
}

/// Attribute payload for `compare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

/// Attribute payload for `broadcast_to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(pub usize);

/// Attribute payload for `map`: the scalar region applied to every element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSpec {
    pub computation: RegionId,
}

/// Unique identifier for SSA values in a PTIR program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Declarative form of PTIR operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseBinary(ElementwiseBinaryOp),
    /// Operands are `(min, operand, max)`.
    Clamp,
    Compare(CompareSpec),
    LogicalAnd,
    /// Operands are `(predicate, on_true, on_false)`.
    Select,
    BroadcastTo(BroadcastToSpec),
    Map(MapSpec),
}

impl Operation {
    /// Stable name used in textual dumps and log records.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Maximum) => "maximum",
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Minimum) => "minimum",
            Operation::Clamp => "clamp",
            Operation::Compare(_) => "compare",
            Operation::LogicalAnd => "and",
            Operation::Select => "select",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Map(_) => "map",
        }
    }
}

/// Single SSA instruction in the declarative PTIR program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
}

/// Closed scalar computation referenced by `map`. Regions cannot see values of
/// the enclosing function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub results: Vec<TensorSpec>,
    pub result_ids: Vec<ValueId>,
}

/// PTIR function describing a reusable computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

/// Complete PTIR module with its helper regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
    pub regions: Vec<Region>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    /// Returns the entry function, if present.
    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|func| func.name == self.entry)
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        program.spec_version = normalize_spec_version(program.spec_version)?;
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!(
                "program @{} (spec_version = {}) {{",
                self.entry, self.spec_version
            ),
        )?;
        for function in &self.functions {
            write_line(f, 1, &format!("func @{} {{", function.name))?;
            fmt_scope(
                &function.parameter_ids,
                &function.parameters,
                &function.body,
                &function.result_ids,
                &function.results,
                2,
                f,
            )?;
            write_line(f, 1, "}")?;
        }
        for region in &self.regions {
            write_line(f, 1, &format!("region ^r{} {{", region.id.0))?;
            fmt_scope(
                &region.parameter_ids,
                &region.parameters,
                &region.body,
                &region.result_ids,
                &region.results,
                2,
                f,
            )?;
            write_line(f, 1, "}")?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_scope(
    parameter_ids: &[ValueId],
    parameters: &[TensorSpec],
    body: &[Instruction],
    result_ids: &[ValueId],
    results: &[TensorSpec],
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    if !parameter_ids.is_empty() {
        write_line(f, indent, "params:")?;
        for (value_id, spec) in parameter_ids.iter().zip(parameters) {
            write_line(f, indent + 1, &format!("{value_id} : {spec}"))?;
        }
    }
    if !body.is_empty() {
        write_line(f, indent, "body:")?;
        for instruction in body {
            write_line(f, indent + 1, &format_instruction(instruction))?;
        }
    }
    if !result_ids.is_empty() {
        write_line(f, indent, "results:")?;
        for (value_id, spec) in result_ids.iter().zip(results) {
            write_line(f, indent + 1, &format!("{value_id} : {spec}"))?;
        }
    }
    Ok(())
}

fn format_instruction(instruction: &Instruction) -> String {
    let operands = instruction
        .operands
        .iter()
        .map(ValueId::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let attrs = match &instruction.op {
        Operation::Compare(spec) => format!(" {{op = {:?}}}", spec.op),
        Operation::Map(spec) => format!(" {{computation = ^r{}}}", spec.computation.0),
        Operation::Constant(lit) => format!(" {{bytes = {}}}", lit.byte_len()),
        _ => String::new(),
    };
    format!(
        "{} = {}({}){} -> {}",
        instruction.id,
        instruction.op.name(),
        operands,
        attrs,
        instruction.output
    )
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Stable set of specification error identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    DTypeNotSupported,
    InvalidAttributeValue,
    OperandDTypeMismatch,
    OperandShapeMismatch,
    PredicateMustBeI1,
    BroadcastRankMismatch,
    BroadcastDimsInvalid,
    DynamicDimensionUnsupported,
    RegionSignatureMismatch,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::DTypeNotSupported => "SpecError: dtype not supported for op",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
            SpecErrorCode::OperandDTypeMismatch => "SpecError: operand dtypes must match",
            SpecErrorCode::OperandShapeMismatch => "SpecError: operand shapes must match",
            SpecErrorCode::PredicateMustBeI1 => "SpecError: predicate operand must be i1",
            SpecErrorCode::BroadcastRankMismatch => "SpecError: broadcast rank mismatch",
            SpecErrorCode::BroadcastDimsInvalid => {
                "SpecError: broadcast operand dims must be 1 or match the result"
            }
            SpecErrorCode::DynamicDimensionUnsupported => {
                "SpecError: dynamic dimension not supported here"
            }
            SpecErrorCode::RegionSignatureMismatch => "SpecError: region signature mismatch",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// Validation failure captured while a graph is being built.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for SpecError {}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    SpecViolation(SpecError),
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation(SpecError::new(code, detail))
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation(err) => write!(f, "{err}"),
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Portable backend trait that evaluates PTIR programs produced by the lowerings.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Materialises a tensor handle from a host literal.
    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal (debug/development only).
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes an entire PTIR program starting from the entry function.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
