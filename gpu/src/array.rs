//! Host-resident N-dimensional arrays and kernel arguments.

use crate::error::{KernelError, Result};

/// Maximum rank of an array argument.
pub const MAX_RANK: usize = 3;

/// Element type tag. Discriminants are stable and recorded in encoded buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F64 = 1,
    I32 = 2,
    I64 = 3,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
        }
    }

    /// Byte size per element on the host.
    pub fn byte_size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `f64`.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            Self::F32(v) => v.get(i).map(|&x| x as f64),
            Self::F64(v) => v.get(i).copied(),
            Self::I32(v) => v.get(i).map(|&x| x as f64),
            Self::I64(v) => v.get(i).map(|&x| x as f64),
        }
    }

    /// Rebuild typed storage from device words. Integer types round to the
    /// nearest integer, matching what `encode` produced.
    pub(crate) fn from_f32_words(dtype: DType, words: &[f32]) -> Self {
        match dtype {
            DType::F32 => Self::F32(words.to_vec()),
            DType::F64 => Self::F64(words.iter().map(|&w| w as f64).collect()),
            DType::I32 => Self::I32(words.iter().map(|&w| w.round() as i32).collect()),
            DType::I64 => Self::I64(words.iter().map(|&w| w.round() as i64).collect()),
        }
    }
}

/// A dense, row-major array. `shape` is outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        if shape.is_empty() || shape.len() > MAX_RANK {
            return Err(KernelError::invalid(format!(
                "array rank must be 1 to {MAX_RANK}, got {}",
                shape.len()
            )));
        }
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(KernelError::invalid(format!(
                "shape {:?} holds {numel} element(s) but {} were supplied",
                shape,
                data.len()
            )));
        }
        Ok(NdArray { shape, data })
    }

    pub fn from_vec<T>(values: Vec<T>) -> Self
    where
        Vec<T>: Into<ArrayData>,
    {
        let data: ArrayData = values.into();
        NdArray {
            shape: vec![data.len()],
            data,
        }
    }

    /// Row-major 2-D array from equally sized rows.
    pub fn from_rows<T: Copy>(rows: &[Vec<T>]) -> Result<Self>
    where
        Vec<T>: Into<ArrayData>,
    {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(KernelError::invalid("rows have different lengths"));
        }
        let flat: Vec<T> = rows.iter().flatten().copied().collect();
        NdArray::new(vec![rows.len(), cols], flat.into())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Shape padded to three axes, outermost first: `(dz, dy, dx)`.
    pub fn dims3(&self) -> [usize; 3] {
        let mut dims = [1usize; 3];
        let offset = 3 - self.shape.len();
        dims[offset..].copy_from_slice(&self.shape);
        dims
    }

    /// All elements converted to `f32`, row-major.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            ArrayData::F32(v) => v.clone(),
            ArrayData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            ArrayData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            ArrayData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }
}

macro_rules! impl_from_vec {
    ($($t:ty => $variant:ident),*) => {$(
        impl From<Vec<$t>> for ArrayData {
            fn from(v: Vec<$t>) -> Self {
                ArrayData::$variant(v)
            }
        }
    )*};
}

impl_from_vec!(f32 => F32, f64 => F64, i32 => I32, i64 => I64);

/// A positional kernel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Scalar(f64),
    Array(NdArray),
}

impl Arg {
    pub fn kind(&self) -> &'static str {
        match self {
            Arg::Scalar(_) => "scalar",
            Arg::Array(_) => "array",
        }
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Scalar(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Scalar(v as f64)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Scalar(v as f64)
    }
}

impl From<NdArray> for Arg {
    fn from(a: NdArray) -> Self {
        Arg::Array(a)
    }
}

impl<T> From<Vec<T>> for Arg
where
    Vec<T>: Into<ArrayData>,
{
    fn from(v: Vec<T>) -> Self {
        Arg::Array(NdArray::from_vec(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_must_match_data() {
        assert!(NdArray::new(vec![2, 2], vec![1.0f32, 2.0, 3.0].into()).is_err());
        assert!(NdArray::new(vec![], vec![1.0f32].into()).is_err());
        assert!(NdArray::new(vec![1, 1, 1, 1], vec![1.0f32].into()).is_err());
        let a = NdArray::new(vec![2, 2], vec![1i32, 2, 3, 4].into()).unwrap();
        assert_eq!(a.dtype(), DType::I32);
        assert_eq!(a.numel(), 4);
    }

    #[test]
    fn test_dims3_pads_outer_axes() {
        let a = NdArray::from_vec(vec![0.0f32; 5]);
        assert_eq!(a.dims3(), [1, 1, 5]);
        let b = NdArray::from_rows(&[vec![1.0f64, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(b.dims3(), [1, 2, 3]);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        assert!(NdArray::from_rows(&[vec![1i64, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_arg_conversions() {
        assert_eq!(Arg::from(2), Arg::Scalar(2.0));
        assert_eq!(Arg::from(vec![1.0f32, 2.0]).kind(), "array");
    }
}
