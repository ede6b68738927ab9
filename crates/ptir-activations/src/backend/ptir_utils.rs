use std::sync::Arc;

use half::{bf16, f16};

use crate::backend::spec::{
    DType, DimSymbol, Dimension, Literal, Shape, SpecError, SpecErrorCode, TensorLiteral,
    TensorSpec,
};

/// Builds a static backend shape descriptor from explicit dimensions.
pub fn shape_static(dims: &[usize]) -> Shape {
    Shape::new(
        dims.iter()
            .copied()
            .map(Dimension::Static)
            .collect::<Vec<_>>(),
    )
}

/// Builds a mixed static/dynamic backend shape descriptor.
pub fn shape_mixed(dims: &[Option<usize>]) -> Shape {
    Shape::new(
        dims.iter()
            .enumerate()
            .map(|(idx, dim)| match dim {
                Some(value) => Dimension::Static(*value),
                None => Dimension::Dynamic(DimSymbol::new(format!("d{idx}"))),
            })
            .collect::<Vec<_>>(),
    )
}

/// Builds a tensor spec with fully static dimensions.
pub fn tensor_spec_static(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, shape_static(dims))
}

/// Builds a tensor spec with mixed static/dynamic dimensions.
pub fn tensor_spec_mixed(dtype: DType, dims: &[Option<usize>]) -> TensorSpec {
    TensorSpec::new(dtype, shape_mixed(dims))
}

/// Encodes a rank-0 literal of `dtype` holding `value`.
///
/// Integer targets accept integral values only and reject anything that does not fit the
/// target width. Floating targets round to nearest. Predicate, sub-byte, fp8 and complex
/// element types have no scalar literal encoding.
pub fn scalar_literal(dtype: DType, value: Literal) -> Result<TensorLiteral, SpecError> {
    let bytes: Vec<u8> = match dtype {
        DType::Si8 => integer_value::<i8>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Si16 => integer_value::<i16>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Si32 => integer_value::<i32>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Si64 => integer_value::<i64>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Ui8 => integer_value::<u8>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Ui16 => integer_value::<u16>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Ui32 => integer_value::<u32>(dtype, value)?.to_le_bytes().to_vec(),
        DType::Ui64 => integer_value::<u64>(dtype, value)?.to_le_bytes().to_vec(),
        DType::F16 => f16::from_f64(float_value(value)).to_le_bytes().to_vec(),
        DType::Bf16 => bf16::from_f64(float_value(value)).to_le_bytes().to_vec(),
        DType::F32 => (float_value(value) as f32).to_le_bytes().to_vec(),
        DType::F64 => float_value(value).to_le_bytes().to_vec(),
        DType::I1
        | DType::Si4
        | DType::Ui4
        | DType::Fp8E4M3
        | DType::Fp8E5M2
        | DType::Cf32
        | DType::Cf64 => {
            return Err(SpecError::new(
                SpecErrorCode::DTypeNotSupported,
                format!("scalar literal of dtype {dtype}"),
            ))
        }
    };
    Ok(TensorLiteral::new(
        TensorSpec::new(dtype, Shape::scalar()),
        Arc::<[u8]>::from(bytes),
    ))
}

fn integer_value<T>(dtype: DType, value: Literal) -> Result<T, SpecError>
where
    T: TryFrom<i128>,
{
    let wide = match value {
        Literal::Signed(v) => i128::from(v),
        Literal::Unsigned(v) => i128::from(v),
        Literal::Float(v) => {
            if !v.is_finite() || v.fract() != 0.0 || v.abs() > i64::MAX as f64 {
                return Err(SpecError::new(
                    SpecErrorCode::InvalidAttributeValue,
                    format!("{v} is not an integral value for dtype {dtype}"),
                ));
            }
            v as i128
        }
    };
    T::try_from(wide).map_err(|_| {
        SpecError::new(
            SpecErrorCode::InvalidAttributeValue,
            format!("{wide} does not fit dtype {dtype}"),
        )
    })
}

fn float_value(value: Literal) -> f64 {
    match value {
        Literal::Signed(v) => v as f64,
        Literal::Unsigned(v) => v as f64,
        Literal::Float(v) => v,
    }
}

/// Creates a dense f32 literal for the provided dimensions.
pub fn tensor_literal_f32(dims: &[usize], values: &[f32]) -> TensorLiteral {
    let bytes = values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect::<Vec<u8>>();
    TensorLiteral::new(
        tensor_spec_static(DType::F32, dims),
        Arc::<[u8]>::from(bytes),
    )
}

/// Creates a dense f64 literal for the provided dimensions.
pub fn tensor_literal_f64(dims: &[usize], values: &[f64]) -> TensorLiteral {
    let bytes = values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect::<Vec<u8>>();
    TensorLiteral::new(
        tensor_spec_static(DType::F64, dims),
        Arc::<[u8]>::from(bytes),
    )
}

/// Creates a dense si32 literal for the provided dimensions.
pub fn tensor_literal_i32(dims: &[usize], values: &[i32]) -> TensorLiteral {
    let bytes = values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect::<Vec<u8>>();
    TensorLiteral::new(
        tensor_spec_static(DType::Si32, dims),
        Arc::<[u8]>::from(bytes),
    )
}
