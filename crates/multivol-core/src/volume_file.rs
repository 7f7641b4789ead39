//! Volume texture files.
//!
//! Volumes are stored as DDS volume textures. Both the legacy pixel-format
//! header and the DX10 extension header are understood. Only the top mip
//! level is read; further mips are ignored.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DDS_MAGIC: [u8; 4] = *b"DDS ";
const DDSD_DEPTH: u32 = 0x0080_0000;
const DDSCAPS2_VOLUME: u32 = 0x0020_0000;
const DDPF_ALPHA: u32 = 0x2;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x0002_0000;
const FOURCC_DX10: u32 = u32::from_le_bytes(*b"DX10");
const FOURCC_R16F: u32 = 111;
const FOURCC_RGBA16F: u32 = 113;
const FOURCC_R32F: u32 = 114;
const DIMENSION_TEXTURE3D: u32 = 4;

/// Texel formats a volume file may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeFormat {
    /// Single 8-bit normalized density channel.
    R8Unorm,
    /// 8-bit normalized albedo and density.
    Rgba8Unorm,
    /// Single half-float density channel.
    R16Float,
    /// Half-float albedo and density.
    Rgba16Float,
    /// Single float density channel.
    R32Float,
}

impl VolumeFormat {
    /// Size of one texel in bytes.
    pub const fn bytes_per_texel(self) -> usize {
        match self {
            Self::R8Unorm => 1,
            Self::R16Float => 2,
            Self::Rgba8Unorm | Self::R32Float => 4,
            Self::Rgba16Float => 8,
        }
    }

    /// Number of channels.
    pub const fn channel_count(self) -> u32 {
        match self {
            Self::R8Unorm | Self::R16Float | Self::R32Float => 1,
            Self::Rgba8Unorm | Self::Rgba16Float => 4,
        }
    }

    const fn from_dxgi(format: u32) -> Option<Self> {
        match format {
            10 => Some(Self::Rgba16Float),
            28 => Some(Self::Rgba8Unorm),
            41 => Some(Self::R32Float),
            54 => Some(Self::R16Float),
            61 => Some(Self::R8Unorm),
            _ => None,
        }
    }

    const fn to_dxgi(self) -> u32 {
        match self {
            Self::Rgba16Float => 10,
            Self::Rgba8Unorm => 28,
            Self::R32Float => 41,
            Self::R16Float => 54,
            Self::R8Unorm => 61,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct DdsPixelFormat {
    size: u32,
    flags: u32,
    four_cc: u32,
    rgb_bit_count: u32,
    r_mask: u32,
    g_mask: u32,
    b_mask: u32,
    a_mask: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct DdsHeader {
    size: u32,
    flags: u32,
    height: u32,
    width: u32,
    pitch_or_linear_size: u32,
    depth: u32,
    mip_map_count: u32,
    reserved1: [u32; 11],
    pixel_format: DdsPixelFormat,
    caps: u32,
    caps2: u32,
    caps3: u32,
    caps4: u32,
    reserved2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct DdsHeaderDx10 {
    dxgi_format: u32,
    resource_dimension: u32,
    misc_flag: u32,
    array_size: u32,
    misc_flags2: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<DdsHeader>();
const DX10_SIZE: usize = std::mem::size_of::<DdsHeaderDx10>();

/// A decoded volume texture (top mip only).
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeTexture {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth in texels.
    pub depth: u32,
    /// Texel format.
    pub format: VolumeFormat,
    /// Tightly packed texel data, `width * height * depth` texels.
    pub data: Vec<u8>,
}

impl VolumeTexture {
    /// Create a texture from raw texels, validating the data length.
    pub fn new(
        width: u32,
        height: u32,
        depth: u32,
        format: VolumeFormat,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = texel_bytes(width, height, depth, format)?;
        if data.len() != expected {
            return Err(Error::InvalidData(format!(
                "expected {expected} bytes of texels, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
            format,
            data,
        })
    }

    /// Read and decode a volume file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::decode(&bytes)
    }

    /// Decode a volume file from memory.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 || bytes[..4] != DDS_MAGIC {
            return Err(Error::InvalidData("missing DDS magic".to_string()));
        }
        let header_bytes = bytes
            .get(4..4 + HEADER_SIZE)
            .ok_or_else(|| Error::InvalidData("truncated DDS header".to_string()))?;
        let header: DdsHeader = bytemuck::pod_read_unaligned(header_bytes);
        if header.size as usize != HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "unexpected DDS header size {}",
                header.size
            )));
        }

        let mut offset = 4 + HEADER_SIZE;
        let pf = header.pixel_format;
        let is_dx10 = pf.flags & DDPF_FOURCC != 0 && pf.four_cc == FOURCC_DX10;

        let (format, is_volume) = if is_dx10 {
            let ext_bytes = bytes
                .get(offset..offset + DX10_SIZE)
                .ok_or_else(|| Error::InvalidData("truncated DX10 header".to_string()))?;
            let ext: DdsHeaderDx10 = bytemuck::pod_read_unaligned(ext_bytes);
            offset += DX10_SIZE;
            let format = VolumeFormat::from_dxgi(ext.dxgi_format).ok_or_else(|| {
                Error::UnsupportedFormat(format!("DXGI format {}", ext.dxgi_format))
            })?;
            (format, ext.resource_dimension == DIMENSION_TEXTURE3D)
        } else {
            let volume = header.flags & DDSD_DEPTH != 0 || header.caps2 & DDSCAPS2_VOLUME != 0;
            (legacy_format(&pf)?, volume)
        };

        if !is_volume || header.depth == 0 {
            return Err(Error::InvalidData("DDS file is not a volume texture".to_string()));
        }

        let len = texel_bytes(header.width, header.height, header.depth, format)?;
        let data = bytes
            .get(offset..offset + len)
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "texel data truncated: need {len} bytes, have {}",
                    bytes.len().saturating_sub(offset)
                ))
            })?
            .to_vec();

        Ok(Self {
            width: header.width,
            height: header.height,
            depth: header.depth,
            format,
            data,
        })
    }

    /// Encode as a DX10 DDS volume texture.
    pub fn to_dds_bytes(&self) -> Vec<u8> {
        let header = DdsHeader {
            size: HEADER_SIZE as u32,
            flags: 0x1 | 0x2 | 0x4 | 0x1000 | DDSD_DEPTH,
            height: self.height,
            width: self.width,
            pitch_or_linear_size: self.width * self.format.bytes_per_texel() as u32,
            depth: self.depth,
            mip_map_count: 1,
            pixel_format: DdsPixelFormat {
                size: 32,
                flags: DDPF_FOURCC,
                four_cc: FOURCC_DX10,
                ..Default::default()
            },
            caps: 0x1000,
            caps2: DDSCAPS2_VOLUME,
            ..Default::default()
        };
        let ext = DdsHeaderDx10 {
            dxgi_format: self.format.to_dxgi(),
            resource_dimension: DIMENSION_TEXTURE3D,
            array_size: 1,
            ..Default::default()
        };

        let mut out = Vec::with_capacity(4 + HEADER_SIZE + DX10_SIZE + self.data.len());
        out.extend_from_slice(&DDS_MAGIC);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(bytemuck::bytes_of(&ext));
        out.extend_from_slice(&self.data);
        out
    }

    /// Number of texels.
    pub fn texel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.depth)
    }
}

fn legacy_format(pf: &DdsPixelFormat) -> Result<VolumeFormat> {
    if pf.flags & DDPF_FOURCC != 0 {
        return match pf.four_cc {
            FOURCC_R16F => Ok(VolumeFormat::R16Float),
            FOURCC_RGBA16F => Ok(VolumeFormat::Rgba16Float),
            FOURCC_R32F => Ok(VolumeFormat::R32Float),
            other => Err(Error::UnsupportedFormat(format!("FourCC {other:#x}"))),
        };
    }
    let single = pf.flags & (DDPF_LUMINANCE | DDPF_ALPHA | DDPF_RGB) != 0
        && pf.rgb_bit_count == 8
        && (pf.r_mask == 0xFF || pf.a_mask == 0xFF);
    if single {
        return Ok(VolumeFormat::R8Unorm);
    }
    let rgba8 = pf.flags & DDPF_RGB != 0
        && pf.rgb_bit_count == 32
        && pf.r_mask == 0xFF
        && pf.g_mask == 0xFF00
        && pf.b_mask == 0x00FF_0000
        && pf.a_mask == 0xFF00_0000;
    if rgba8 {
        return Ok(VolumeFormat::Rgba8Unorm);
    }
    Err(Error::UnsupportedFormat(format!(
        "{}-bit pixel format with flags {:#x}",
        pf.rgb_bit_count, pf.flags
    )))
}

fn texel_bytes(width: u32, height: u32, depth: u32, format: VolumeFormat) -> Result<usize> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(Error::InvalidData(format!(
            "empty volume extent {width}x{height}x{depth}"
        )));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(depth as usize))
        .and_then(|n| n.checked_mul(format.bytes_per_texel()))
        .ok_or_else(|| Error::OutOfBounds(format!("volume {width}x{height}x{depth} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(format: VolumeFormat) -> VolumeTexture {
        let len = 4 * 3 * 2 * format.bytes_per_texel();
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        VolumeTexture::new(4, 3, 2, format, data).unwrap()
    }

    fn legacy_r8(width: u32, height: u32, depth: u32) -> Vec<u8> {
        let header = DdsHeader {
            size: HEADER_SIZE as u32,
            flags: DDSD_DEPTH,
            width,
            height,
            depth,
            pixel_format: DdsPixelFormat {
                size: 32,
                flags: DDPF_LUMINANCE,
                rgb_bit_count: 8,
                r_mask: 0xFF,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut bytes = DDS_MAGIC.to_vec();
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend(std::iter::repeat(7u8).take((width * height * depth) as usize));
        bytes
    }

    #[test]
    fn header_sizes_match_file_layout() {
        assert_eq!(HEADER_SIZE, 124);
        assert_eq!(DX10_SIZE, 20);
        assert_eq!(std::mem::size_of::<DdsPixelFormat>(), 32);
    }

    #[test]
    fn dx10_file_decodes() {
        let texture = sample(VolumeFormat::Rgba16Float);
        let decoded = VolumeTexture::decode(&texture.to_dds_bytes()).unwrap();
        assert_eq!(decoded, texture);
    }

    #[test]
    fn legacy_luminance_file_decodes() {
        let decoded = VolumeTexture::decode(&legacy_r8(2, 2, 2)).unwrap();
        assert_eq!(decoded.format, VolumeFormat::R8Unorm);
        assert_eq!(decoded.texel_count(), 8);
        assert!(decoded.data.iter().all(|&b| b == 7));
    }

    #[test]
    fn trailing_mips_are_ignored() {
        let mut bytes = legacy_r8(2, 2, 2);
        bytes.extend_from_slice(&[1, 2, 3]);
        let decoded = VolumeTexture::decode(&bytes).unwrap();
        assert_eq!(decoded.data.len(), 8);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample(VolumeFormat::R8Unorm).to_dds_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            VolumeTexture::decode(&bytes),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let bytes = sample(VolumeFormat::R32Float).to_dds_bytes();
        let cut = &bytes[..bytes.len() - 1];
        assert!(matches!(VolumeTexture::decode(cut), Err(Error::InvalidData(_))));
        assert!(VolumeTexture::decode(&bytes[..40]).is_err());
        assert!(VolumeTexture::decode(&[]).is_err());
    }

    #[test]
    fn flat_texture_is_rejected() {
        let mut bytes = legacy_r8(2, 2, 1);
        // Clear the depth flag so the file describes a 2D texture.
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(VolumeTexture::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_dxgi_format_is_unsupported() {
        let mut bytes = sample(VolumeFormat::R8Unorm).to_dds_bytes();
        let dxgi_offset = 4 + HEADER_SIZE;
        bytes[dxgi_offset..dxgi_offset + 4].copy_from_slice(&71u32.to_le_bytes());
        assert!(matches!(
            VolumeTexture::decode(&bytes),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn new_validates_length() {
        assert!(VolumeTexture::new(2, 2, 2, VolumeFormat::R8Unorm, vec![0; 7]).is_err());
        assert!(VolumeTexture::new(0, 2, 2, VolumeFormat::R8Unorm, vec![]).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = VolumeTexture::load("/nonexistent/volume.dds");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
