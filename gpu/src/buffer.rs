//! Buffer codec: packs host arrays into the texture-shaped `f32` layout the
//! device consumes, and unpacks results.
//!
//! Every element becomes one little-endian `f32` word. Words are laid out
//! row-major in a near-square 2-D texture (`width = ceil(sqrt(n))`,
//! `height = ceil(n / width)`) and the tail is zero padded. Shape and element
//! type travel out of band in [`EncodedBuffer`].
//!
//! Precision: `f32` values and integers with `|v| <= 2^24` round-trip exactly.
//! `f64` values and larger integers are rounded to the nearest `f32`; this is
//! an accepted limitation of the device format.

use bytemuck::Pod;

use crate::array::{ArrayData, DType, NdArray};
use crate::error::{KernelError, Result};
use crate::platform::Endianness;

/// Largest texture side the device layout allows.
pub const MAX_TEXTURE_SIZE: u32 = 16384;

/// Largest integer magnitude an `f32` word represents exactly.
pub const EXACT_INT_LIMIT: i64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

impl TextureSize {
    /// Smallest near-square texture holding `numel` words.
    pub fn for_elements(numel: usize) -> Result<Self> {
        if numel == 0 {
            return Err(KernelError::invalid("cannot lay out an empty array"));
        }
        let width = (numel as f64).sqrt().ceil() as usize;
        let height = numel.div_ceil(width);
        if width > MAX_TEXTURE_SIZE as usize || height > MAX_TEXTURE_SIZE as usize {
            return Err(KernelError::execution(format!(
                "{numel} element(s) need a {width}x{height} texture, above the {MAX_TEXTURE_SIZE} limit"
            )));
        }
        Ok(TextureSize {
            width: width as u32,
            height: height as u32,
        })
    }

    pub fn texels(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_size(self) -> usize {
        self.texels() * std::mem::size_of::<f32>()
    }
}

/// Flat, shape-annotated device representation of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBuffer {
    bytes: Vec<u8>,
    texture: TextureSize,
    shape: Vec<usize>,
    dtype: DType,
}

impl EncodedBuffer {
    /// Wrap bytes read back from the device.
    pub fn from_device_bytes(bytes: Vec<u8>, shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let texture = TextureSize::for_elements(numel)?;
        if bytes.len() < texture.byte_size() {
            return Err(KernelError::execution(format!(
                "readback returned {} byte(s), expected {}",
                bytes.len(),
                texture.byte_size()
            )));
        }
        let mut bytes = bytes;
        bytes.truncate(texture.byte_size());
        Ok(EncodedBuffer {
            bytes,
            texture,
            shape,
            dtype,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn texture(&self) -> TextureSize {
        self.texture
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Shape padded to three axes, outermost first.
    pub fn dims3(&self) -> [usize; 3] {
        let mut dims = [1usize; 3];
        let offset = 3usize.saturating_sub(self.shape.len());
        for (slot, &d) in dims[offset..].iter_mut().zip(&self.shape) {
            *slot = d;
        }
        dims
    }
}

/// Serialize `values` in device (little-endian) byte order.
pub fn to_device_bytes<T: Pod>(values: &[T], endianness: Endianness) -> Vec<u8> {
    let mut bytes = bytemuck::cast_slice::<T, u8>(values).to_vec();
    if endianness.needs_swap() {
        for word in bytes.chunks_exact_mut(std::mem::size_of::<T>()) {
            word.reverse();
        }
    }
    bytes
}

/// Deserialize device-order bytes into host values.
pub fn from_device_bytes<T: Pod>(bytes: &[u8], endianness: Endianness) -> Result<Vec<T>> {
    let width = std::mem::size_of::<T>();
    if bytes.len() % width != 0 {
        return Err(KernelError::execution(format!(
            "{} byte(s) is not a whole number of {width}-byte words",
            bytes.len()
        )));
    }
    let mut word = vec![0u8; width];
    let values = bytes
        .chunks_exact(width)
        .map(|chunk| {
            word.copy_from_slice(chunk);
            if endianness.needs_swap() {
                word.reverse();
            }
            bytemuck::pod_read_unaligned::<T>(&word)
        })
        .collect();
    Ok(values)
}

/// Encoder/decoder bound to one host byte order.
#[derive(Debug, Clone, Copy)]
pub struct BufferCodec {
    endianness: Endianness,
}

impl Default for BufferCodec {
    fn default() -> Self {
        Self::new(Endianness::system())
    }
}

impl BufferCodec {
    pub fn new(endianness: Endianness) -> Self {
        BufferCodec { endianness }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn encode(&self, array: &NdArray) -> Result<EncodedBuffer> {
        let texture = TextureSize::for_elements(array.numel())?;
        let mut words = array.to_f32_vec();
        words.resize(texture.texels(), 0.0);
        let inexact = count_inexact(array.data());
        if inexact > 0 {
            log::debug!(
                "encoding {} {} element(s) not exactly representable as f32",
                inexact,
                array.dtype().name()
            );
        }
        Ok(EncodedBuffer {
            bytes: to_device_bytes(&words, self.endianness),
            texture,
            shape: array.shape().to_vec(),
            dtype: array.dtype(),
        })
    }

    /// Decode into `shape`, which must hold the same number of elements as
    /// the encoded array.
    pub fn decode(&self, buffer: &EncodedBuffer, shape: &[usize]) -> Result<NdArray> {
        let numel: usize = shape.iter().product();
        if numel != buffer.numel() {
            return Err(KernelError::invalid(format!(
                "cannot decode {} element(s) into shape {:?}",
                buffer.numel(),
                shape
            )));
        }
        let mut words: Vec<f32> = from_device_bytes(&buffer.bytes, self.endianness)?;
        words.truncate(numel);
        NdArray::new(
            shape.to_vec(),
            ArrayData::from_f32_words(buffer.dtype, &words),
        )
    }

    /// The `f32` words of an encoded buffer without padding.
    pub fn words(&self, buffer: &EncodedBuffer) -> Result<Vec<f32>> {
        let mut words: Vec<f32> = from_device_bytes(&buffer.bytes, self.endianness)?;
        words.truncate(buffer.numel());
        Ok(words)
    }
}

fn count_inexact(data: &ArrayData) -> usize {
    match data {
        ArrayData::F32(_) => 0,
        ArrayData::F64(v) => v.iter().filter(|&&x| (x as f32) as f64 != x).count(),
        ArrayData::I32(v) => v
            .iter()
            .filter(|&&x| (x as i64).abs() > EXACT_INT_LIMIT)
            .count(),
        ArrayData::I64(v) => v.iter().filter(|&&x| x.abs() > EXACT_INT_LIMIT).count(),
    }
}
