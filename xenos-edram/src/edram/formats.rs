//! Bit-exact conversions between host sample values and guest EDRAM pixel encodings
//!
//! Every guest format is stored in the EDRAM as one or two dwords per sample. Host render targets
//! hold the same data in a host format that either stores the exact bits (16-bit and 32-bit
//! component formats are always transferred through integer views) or a value that converts back
//! exactly (UNORM and the 7e3 float format).

use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};

/// Guest sample data as stored in the EDRAM: the low dword, and the high dword for 64bpp formats.
pub type PackedSample = [u32; 2];

/// A sample value as a host view reads or writes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostColor {
    Float([f32; 4]),
    Uint([u32; 4]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostValueKind {
    Float,
    Uint,
}

/// Packing rule of a guest color render target format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorEncoding {
    // 8_8_8_8 and 8_8_8_8_GAMMA
    Unorm8888,
    // 2_10_10_10 and 2_10_10_10_AS_10_10_10_10
    Unorm2_10_10_10,
    // 2_10_10_10_FLOAT and 2_10_10_10_FLOAT_AS_16_16_16_16, RGB as 7e3
    Float7e3,
    // 16_16 and 16_16_FLOAT
    Raw16x2,
    // 16_16_16_16 and 16_16_16_16_FLOAT
    Raw16x4,
    // 32_FLOAT
    Raw32x1,
    // 32_32_FLOAT
    Raw32x2,
}

impl ColorEncoding {
    pub fn of(format: ColorRenderTargetFormat) -> Self {
        match format {
            ColorRenderTargetFormat::K8888 | ColorRenderTargetFormat::K8888Gamma => Self::Unorm8888,
            ColorRenderTargetFormat::K2_10_10_10
            | ColorRenderTargetFormat::K2_10_10_10As10_10_10_10 => Self::Unorm2_10_10_10,
            ColorRenderTargetFormat::K2_10_10_10Float
            | ColorRenderTargetFormat::K2_10_10_10FloatAs16_16_16_16 => Self::Float7e3,
            ColorRenderTargetFormat::K16_16 | ColorRenderTargetFormat::K16_16Float => Self::Raw16x2,
            ColorRenderTargetFormat::K16_16_16_16 | ColorRenderTargetFormat::K16_16_16_16Float => {
                Self::Raw16x4
            }
            ColorRenderTargetFormat::K32Float => Self::Raw32x1,
            ColorRenderTargetFormat::K32_32Float => Self::Raw32x2,
        }
    }

    pub fn is_64bpp(self) -> bool {
        matches!(self, Self::Raw16x4 | Self::Raw32x2)
    }

    pub fn host_value_kind(self) -> HostValueKind {
        match self {
            Self::Unorm8888 | Self::Unorm2_10_10_10 | Self::Float7e3 => HostValueKind::Float,
            Self::Raw16x2 | Self::Raw16x4 | Self::Raw32x1 | Self::Raw32x2 => HostValueKind::Uint,
        }
    }

    /// Packs a host value into the guest representation. Returns `None` if the value is of the
    /// wrong kind for this encoding.
    pub fn encode(self, value: HostColor) -> Option<PackedSample> {
        let packed = match (self, value) {
            (Self::Unorm8888, HostColor::Float(rgba)) => [encode_8888(rgba), 0],
            (Self::Unorm2_10_10_10, HostColor::Float(rgba)) => [encode_2_10_10_10(rgba), 0],
            (Self::Float7e3, HostColor::Float(rgba)) => [encode_2_10_10_10_float(rgba), 0],
            (Self::Raw16x2, HostColor::Uint([r, g, ..])) => [pack_16_16(r, g), 0],
            (Self::Raw16x4, HostColor::Uint([r, g, b, a])) => [pack_16_16(r, g), pack_16_16(b, a)],
            (Self::Raw32x1, HostColor::Uint([r, ..])) => [r, 0],
            (Self::Raw32x2, HostColor::Uint([r, g, ..])) => [r, g],
            _ => return None,
        };
        Some(packed)
    }

    pub fn decode(self, packed: PackedSample) -> HostColor {
        let [low, high] = packed;
        match self {
            Self::Unorm8888 => HostColor::Float(decode_8888(low)),
            Self::Unorm2_10_10_10 => HostColor::Float(decode_2_10_10_10(low)),
            Self::Float7e3 => HostColor::Float(decode_2_10_10_10_float(low)),
            Self::Raw16x2 => HostColor::Uint([low & 0xFFFF, low >> 16, 0, 0]),
            Self::Raw16x4 => HostColor::Uint([low & 0xFFFF, low >> 16, high & 0xFFFF, high >> 16]),
            Self::Raw32x1 => HostColor::Uint([low, 0, 0, 0]),
            Self::Raw32x2 => HostColor::Uint([low, high, 0, 0]),
        }
    }
}

/// Packing rule of a guest depth render target format. Stencil always occupies bits 0-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthEncoding {
    Unorm24,
    Float20e4,
}

impl DepthEncoding {
    pub fn of(format: DepthRenderTargetFormat) -> Self {
        match format {
            DepthRenderTargetFormat::D24S8 => Self::Unorm24,
            DepthRenderTargetFormat::D24FS8 => Self::Float20e4,
        }
    }

    pub fn encode(self, depth: f32, round_20e4: bool) -> u32 {
        match self {
            Self::Unorm24 => f32_to_unorm24(depth),
            Self::Float20e4 => f32_to_20e4(depth, round_20e4),
        }
    }

    pub fn decode(self, depth24: u32) -> f32 {
        match self {
            Self::Unorm24 => unorm24_to_f32(depth24),
            Self::Float20e4 => f20e4_to_f32(depth24),
        }
    }

    /// Chooses the depth to write when the host has a higher precision copy of the same data.
    ///
    /// The host depth is kept as long as it still converts to the guest value, otherwise the
    /// guest data was modified after the host depth was stored and the guest value is used.
    pub fn resolve_host_depth(self, guest_depth24: u32, host_depth: f32, round_20e4: bool) -> f32 {
        if self.encode(host_depth, round_20e4) == guest_depth24 {
            host_depth
        } else {
            self.decode(guest_depth24)
        }
    }
}

pub fn pack_depth_stencil(depth24: u32, stencil: u32) -> u32 {
    (depth24 << 8) | (stencil & 0xFF)
}

pub fn unpack_depth_stencil(packed: u32) -> (u32, u32) {
    (packed >> 8, packed & 0xFF)
}

fn unorm_to_bits(value: f32, max: f32) -> u32 {
    // NaN saturates to 0 through the clamp
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    (clamped * max + 0.5) as u32
}

pub fn encode_8888(rgba: [f32; 4]) -> u32 {
    rgba.into_iter()
        .enumerate()
        .fold(0, |packed, (i, component)| packed | (unorm_to_bits(component, 255.0) << (8 * i)))
}

pub fn decode_8888(packed: u32) -> [f32; 4] {
    std::array::from_fn(|i| ((packed >> (8 * i)) & 0xFF) as f32 / 255.0)
}

pub fn encode_2_10_10_10(rgba: [f32; 4]) -> u32 {
    let [r, g, b, a] = rgba;
    unorm_to_bits(r, 1023.0)
        | (unorm_to_bits(g, 1023.0) << 10)
        | (unorm_to_bits(b, 1023.0) << 20)
        | (unorm_to_bits(a, 3.0) << 30)
}

pub fn decode_2_10_10_10(packed: u32) -> [f32; 4] {
    [
        (packed & 0x3FF) as f32 / 1023.0,
        ((packed >> 10) & 0x3FF) as f32 / 1023.0,
        ((packed >> 20) & 0x3FF) as f32 / 1023.0,
        (packed >> 30) as f32 / 3.0,
    ]
}

pub fn encode_2_10_10_10_float(rgba: [f32; 4]) -> u32 {
    let [r, g, b, a] = rgba;
    f32_to_7e3(r) | (f32_to_7e3(g) << 10) | (f32_to_7e3(b) << 20) | (unorm_to_bits(a, 3.0) << 30)
}

pub fn decode_2_10_10_10_float(packed: u32) -> [f32; 4] {
    [
        f7e3_to_f32(packed & 0x3FF),
        f7e3_to_f32((packed >> 10) & 0x3FF),
        f7e3_to_f32((packed >> 20) & 0x3FF),
        (packed >> 30) as f32 / 3.0,
    ]
}

pub fn pack_16_16(low: u32, high: u32) -> u32 {
    (low & 0xFFFF) | (high << 16)
}

// Largest 7e3 value, 2^4 * (1 + 127/128)
const F7E3_MAX: f32 = 31.875;

/// Converts to the 10-bit 7e3 format (3-bit exponent with a bias of 3, 7-bit mantissa), rounding
/// to the nearest even value.
pub fn f32_to_7e3(value: f32) -> u32 {
    // Negative zero would otherwise pass the clamp with the sign bit set
    let clamped = if value.is_nan() || value <= 0.0 { 0.0 } else { value.min(F7E3_MAX) };
    let mut bits = clamped.to_bits();
    if bits < 0x3E800000 {
        // Smallest normal is 0.25
        let shift = (125 - (bits >> 23)).min(24);
        bits = (0x800000 | (bits & 0x7FFFFF)) >> shift;
    } else {
        bits = bits.wrapping_sub(124 << 23);
    }
    ((bits + 0x7FFF + ((bits >> 16) & 1)) >> 16) & 0x3FF
}

pub fn f7e3_to_f32(value: u32) -> f32 {
    let mut mantissa = value & 0x7F;
    let mut exponent = (value >> 7) & 0x7;
    if exponent == 0 {
        if mantissa == 0 {
            return 0.0;
        }
        // Normalize so that the leading 1 becomes implicit
        let shift = 7 - (31 - mantissa.leading_zeros());
        exponent = 1_u32.wrapping_sub(shift);
        mantissa = (mantissa << shift) & 0x7F;
    }
    f32::from_bits((exponent.wrapping_add(124) << 23) | (mantissa << 16))
}

// Largest 20e4 value, 2^0 * (2 - 2^-20)
const F20E4_MAX_BITS: u32 = 0x3FFFFFF8;

/// Converts to the 24-bit 20e4 depth format (4-bit exponent with a bias of 15, 20-bit mantissa).
pub fn f32_to_20e4(value: f32, round_to_nearest_even: bool) -> u32 {
    let clamped = if value.is_nan() || value <= 0.0 {
        0.0
    } else {
        value.min(f32::from_bits(F20E4_MAX_BITS))
    };
    let mut bits = clamped.to_bits();
    if bits < 0x38800000 {
        // Smallest normal is 2^-14
        let shift = (113 - (bits >> 23)).min(24);
        bits = (0x800000 | (bits & 0x7FFFFF)) >> shift;
    } else {
        bits = bits.wrapping_sub(112 << 23);
    }
    if round_to_nearest_even {
        bits += 3 + ((bits >> 3) & 1);
    }
    (bits >> 3) & 0xFFFFFF
}

pub fn f20e4_to_f32(value: u32) -> f32 {
    let mut mantissa = value & 0xFFFFF;
    let mut exponent = (value >> 20) & 0xF;
    if exponent == 0 {
        if mantissa == 0 {
            return 0.0;
        }
        let shift = 20 - (31 - mantissa.leading_zeros());
        exponent = 1_u32.wrapping_sub(shift);
        mantissa = (mantissa << shift) & 0xFFFFF;
    }
    f32::from_bits((exponent.wrapping_add(112) << 23) | (mantissa << 3))
}

/// Converts to 24-bit UNORM depth, rounding to the nearest even value. Truncation is visibly
/// wrong: clear values that games compute for the midpoint must land on the even neighbor.
pub fn f32_to_unorm24(value: f32) -> u32 {
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    (clamped * 16777215.0).round_ties_even() as u32
}

pub fn unorm24_to_f32(value: u32) -> f32 {
    (value & 0xFFFFFF) as f32 / 16777215.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR_ENCODINGS: [ColorEncoding; 7] = [
        ColorEncoding::Unorm8888,
        ColorEncoding::Unorm2_10_10_10,
        ColorEncoding::Float7e3,
        ColorEncoding::Raw16x2,
        ColorEncoding::Raw16x4,
        ColorEncoding::Raw32x1,
        ColorEncoding::Raw32x2,
    ];

    fn valid_bits(encoding: ColorEncoding, packed: PackedSample) -> PackedSample {
        match encoding {
            ColorEncoding::Raw16x4 | ColorEncoding::Raw32x2 => packed,
            _ => [packed[0], 0],
        }
    }

    #[test]
    fn color_round_trip_random() {
        for _ in 0..100_000 {
            let packed: PackedSample = rand::random();
            for encoding in COLOR_ENCODINGS {
                let packed = valid_bits(encoding, packed);
                let host = encoding.decode(packed);
                assert_eq!(encoding.encode(host), Some(packed), "{encoding:?} {packed:08X?}");
            }
        }
    }

    #[test]
    fn color_encoding_rejects_wrong_kind() {
        assert_eq!(ColorEncoding::Unorm8888.encode(HostColor::Uint([1, 2, 3, 4])), None);
        assert_eq!(ColorEncoding::Raw32x1.encode(HostColor::Float([0.5; 4])), None);
    }

    #[test]
    fn f7e3_round_trip_exhaustive() {
        for value in 0..0x400 {
            assert_eq!(f32_to_7e3(f7e3_to_f32(value)), value, "{value:03X}");
        }
    }

    #[test]
    fn f7e3_known_values() {
        assert_eq!(f32_to_7e3(0.25), 1 << 7);
        assert_eq!(f32_to_7e3(1.0), 3 << 7);
        assert_eq!(f32_to_7e3(F7E3_MAX), 0x3FF);
        assert_eq!(f32_to_7e3(100.0), 0x3FF);
        assert_eq!(f32_to_7e3(-1.0), 0);
        assert_eq!(f32_to_7e3(-0.0), 0);
        assert_eq!(f32_to_20e4(-0.0, true), 0);
        assert_eq!(f32_to_7e3(f32::NAN), 0);
        // Smallest denormal is 2^-9
        assert_eq!(f7e3_to_f32(1), 2.0_f32.powi(-9));
    }

    #[test]
    fn f20e4_round_trip() {
        for value in (0..0x1000).chain(0xFFF000..0x1000000) {
            assert_eq!(f32_to_20e4(f20e4_to_f32(value), false), value, "{value:06X}");
            assert_eq!(f32_to_20e4(f20e4_to_f32(value), true), value, "{value:06X}");
        }
        for _ in 0..100_000 {
            let value = rand::random::<u32>() & 0xFFFFFF;
            assert_eq!(f32_to_20e4(f20e4_to_f32(value), true), value, "{value:06X}");
        }
    }

    #[test]
    fn f20e4_rounding() {
        assert_eq!(f32_to_20e4(1.0, false), 15 << 20);
        assert_eq!(f32_to_20e4(2.0, false), 0xFFFFFF);
        // 1 + 2^-21 is halfway between 1 and the next 20e4 value, ties go to even
        let halfway = f32::from_bits(0x3F800004);
        assert_eq!(f32_to_20e4(halfway, false), 15 << 20);
        assert_eq!(f32_to_20e4(halfway, true), 15 << 20);
        let above_halfway = f32::from_bits(0x3F800005);
        assert_eq!(f32_to_20e4(above_halfway, false), 15 << 20);
        assert_eq!(f32_to_20e4(above_halfway, true), (15 << 20) | 1);
        let odd_halfway = f32::from_bits(0x3F80000C);
        assert_eq!(f32_to_20e4(odd_halfway, true), (15 << 20) | 2);
    }

    #[test]
    fn unorm24_round_trip_exhaustive() {
        for value in 0..0x1000000 {
            assert_eq!(f32_to_unorm24(unorm24_to_f32(value)), value, "{value:06X}");
        }
    }

    #[test]
    fn unorm24_midpoint_rounds_to_even() {
        // 0.5 * 0xFFFFFF = 0x7FFFFF.8, truncation would give 0x7FFFFF
        assert_eq!(f32_to_unorm24(0.5), 0x800000);
        assert_eq!(f32_to_unorm24(1.0), 0xFFFFFF);
        assert_eq!(f32_to_unorm24(-0.5), 0);
        assert_eq!(f32_to_unorm24(f32::NAN), 0);
    }

    #[test]
    fn unorm_rounding() {
        assert_eq!(encode_8888([0.5, 1.0, 0.0, 2.0]), 0xFF00FF80);
        assert_eq!(decode_8888(0x7F7F7F7F), [127.0 / 255.0; 4]);
        assert_eq!(encode_2_10_10_10([0.0, 0.0, 0.0, 1.0]), 3 << 30);
        assert_eq!(encode_2_10_10_10([0.0, 0.0, 0.0, 0.5]), 2 << 30);
    }

    #[test]
    fn depth_stencil_packing() {
        assert_eq!(pack_depth_stencil(0xABCDEF, 0x1234), 0xABCDEF34);
        assert_eq!(unpack_depth_stencil(0xABCDEF34), (0xABCDEF, 0x34));
    }

    #[test]
    fn host_depth_kept_when_guest_value_matches() {
        // Higher precision than 24 bits, converts to the stored guest value
        let host_depth = 0.3_f32;
        for encoding in [DepthEncoding::Unorm24, DepthEncoding::Float20e4] {
            let guest_depth24 = encoding.encode(host_depth, false);
            let resolved = encoding.resolve_host_depth(guest_depth24, host_depth, false);
            assert_eq!(resolved.to_bits(), host_depth.to_bits());

            let modified = guest_depth24 ^ 0x100;
            let resolved = encoding.resolve_host_depth(modified, host_depth, false);
            assert_eq!(resolved.to_bits(), encoding.decode(modified).to_bits());
        }
    }
}
