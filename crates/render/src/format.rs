//! Texture formats and sample conversion
//!
//! 8- and 16-bit samples and `f32` upload as-is. Wider integer types and
//! `f64` have no portable single-channel 3-D texture format, so they are
//! converted to `f32` on the way to the GPU.

use std::borrow::Cow;

use voxstream_cache::{ScalarType, VolumeMetadata};

/// Single-channel texel format of a volume texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Uint,
    R8Sint,
    R16Uint,
    R16Sint,
    R32Float,
}

impl TextureFormat {
    pub fn for_scalar(scalar: ScalarType) -> Self {
        match scalar {
            ScalarType::U8 => TextureFormat::R8Uint,
            ScalarType::I8 => TextureFormat::R8Sint,
            ScalarType::U16 => TextureFormat::R16Uint,
            ScalarType::I16 => TextureFormat::R16Sint,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 | ScalarType::F64 => {
                TextureFormat::R32Float
            }
        }
    }

    /// Bytes per component.
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::R8Uint | TextureFormat::R8Sint => 1,
            TextureFormat::R16Uint | TextureFormat::R16Sint => 2,
            TextureFormat::R32Float => 4,
        }
    }
}

/// Whether samples of this type are rewritten before upload.
pub fn needs_conversion(scalar: ScalarType) -> bool {
    matches!(scalar, ScalarType::U32 | ScalarType::I32 | ScalarType::F64)
}

/// Turn one frame of native-endian samples into texel bytes for
/// [`TextureFormat::for_scalar`]. Borrows when no conversion is needed.
pub fn convert_samples(bytes: &[u8], scalar: ScalarType) -> Cow<'_, [u8]> {
    match scalar {
        ScalarType::U32 => Cow::Owned(f32_bytes(
            bytes
                .chunks_exact(4)
                .map(|sample| bytemuck::pod_read_unaligned::<u32>(sample) as f32),
        )),
        ScalarType::I32 => Cow::Owned(f32_bytes(
            bytes
                .chunks_exact(4)
                .map(|sample| bytemuck::pod_read_unaligned::<i32>(sample) as f32),
        )),
        ScalarType::F64 => Cow::Owned(f32_bytes(
            bytes
                .chunks_exact(8)
                .map(|sample| bytemuck::pod_read_unaligned::<f64>(sample) as f32),
        )),
        _ => Cow::Borrowed(bytes),
    }
}

fn f32_bytes(samples: impl Iterator<Item = f32>) -> Vec<u8> {
    let samples: Vec<f32> = samples.collect();
    bytemuck::cast_slice(&samples).to_vec()
}

/// Shape and format of a volume texture. `depth` is the slice count of one
/// time point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: TextureFormat,
    pub components: u32,
}

impl TextureDescriptor {
    pub fn for_volume(metadata: &VolumeMetadata) -> Self {
        let [width, height, depth] = metadata.dimensions;
        Self {
            width,
            height,
            depth,
            format: TextureFormat::for_scalar(metadata.scalar_type),
            components: metadata.components,
        }
    }

    /// Texel bytes of one depth slice.
    pub fn slice_byte_length(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.components as usize
            * self.format.bytes_per_texel()
    }

    pub fn byte_length(&self) -> usize {
        self.slice_byte_length() * self.depth as usize
    }
}

/// What one streaming pass sent to the GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub slices_uploaded: usize,
    pub bytes_uploaded: usize,
    /// The texture was (re)created during this pass
    pub reallocated: bool,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.slices_uploaded == 0 && !self.reallocated
    }
}
