//! Xenos hardware constants and enumerations used by the EDRAM emulation

use std::fmt::{Display, Formatter};

pub const EDRAM_TILE_WIDTH_SAMPLES: u32 = 80;
pub const EDRAM_TILE_HEIGHT_SAMPLES: u32 = 16;
pub const EDRAM_TILE_SAMPLES: u32 = EDRAM_TILE_WIDTH_SAMPLES * EDRAM_TILE_HEIGHT_SAMPLES;
pub const EDRAM_TILE_COUNT: u32 = 2048;
pub const EDRAM_TILE_COUNT_MASK: u32 = EDRAM_TILE_COUNT - 1;
pub const EDRAM_SIZE_BYTES: u32 = EDRAM_TILE_COUNT * EDRAM_TILE_SAMPLES * 4;

// Half of a 32bpp tile, the distance between the color and depth/stencil sample columns
pub const EDRAM_TILE_HALF_WIDTH_SAMPLES: u32 = EDRAM_TILE_WIDTH_SAMPLES / 2;

pub const TEXTURE_2D_MAX_WIDTH_HEIGHT: u32 = 8192;
pub const MAX_COLOR_RENDER_TARGETS: usize = 4;

pub const RESOLVE_ALIGNMENT_PIXELS: u32 = 8;
pub const RESOLVE_SIZE_BITS: u32 = 13;

pub const MAX_RESOLUTION_SCALE: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MsaaSamples {
    #[default]
    X1 = 0,
    X2 = 1,
    X4 = 2,
}

impl MsaaSamples {
    pub const ALL: [Self; 3] = [Self::X1, Self::X2, Self::X4];

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::X1),
            1 => Some(Self::X2),
            2 => Some(Self::X4),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn count(self) -> u32 {
        1 << self.bits()
    }

    // 4x MSAA doubles the sample count horizontally
    pub fn x_log2(self) -> u32 {
        u32::from(self == Self::X4)
    }

    // 2x and 4x MSAA double the sample count vertically
    pub fn y_log2(self) -> u32 {
        u32::from(self != Self::X1)
    }
}

impl Display for MsaaSamples {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x", self.count())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ColorRenderTargetFormat {
    #[default]
    K8888 = 0,
    K8888Gamma = 1,
    K2_10_10_10 = 2,
    K2_10_10_10Float = 3,
    K16_16 = 4,
    K16_16_16_16 = 5,
    K16_16Float = 6,
    K16_16_16_16Float = 7,
    K2_10_10_10As10_10_10_10 = 10,
    K2_10_10_10FloatAs16_16_16_16 = 12,
    K32Float = 14,
    K32_32Float = 15,
}

impl ColorRenderTargetFormat {
    pub const ALL: [Self; 12] = [
        Self::K8888,
        Self::K8888Gamma,
        Self::K2_10_10_10,
        Self::K2_10_10_10Float,
        Self::K16_16,
        Self::K16_16_16_16,
        Self::K16_16Float,
        Self::K16_16_16_16Float,
        Self::K2_10_10_10As10_10_10_10,
        Self::K2_10_10_10FloatAs16_16_16_16,
        Self::K32Float,
        Self::K32_32Float,
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.bits() == bits)
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn is_64bpp(self) -> bool {
        matches!(self, Self::K16_16_16_16 | Self::K16_16_16_16Float | Self::K32_32Float)
    }

    pub fn component_count(self) -> u32 {
        match self {
            Self::K32Float => 1,
            Self::K16_16 | Self::K16_16Float | Self::K32_32Float => 2,
            Self::K8888
            | Self::K8888Gamma
            | Self::K2_10_10_10
            | Self::K2_10_10_10Float
            | Self::K16_16_16_16
            | Self::K16_16_16_16Float
            | Self::K2_10_10_10As10_10_10_10
            | Self::K2_10_10_10FloatAs16_16_16_16 => 4,
        }
    }

    /// The format that render targets of this format are stored as. Formats that only differ in
    /// how the guest interprets them while drawing share one host representation.
    pub fn resource_format(self) -> Self {
        match self {
            Self::K8888Gamma => Self::K8888,
            Self::K2_10_10_10As10_10_10_10 => Self::K2_10_10_10,
            Self::K2_10_10_10FloatAs16_16_16_16 => Self::K2_10_10_10Float,
            _ => self,
        }
    }

    /// Whether a resolve of this EDRAM format into `dest` can copy the bits untouched.
    pub fn is_resolve_bitwise_equivalent(self, dest: ColorFormat) -> bool {
        match self.resource_format() {
            Self::K8888 => dest == ColorFormat::K8888,
            Self::K2_10_10_10 => dest == ColorFormat::K2_10_10_10,
            Self::K2_10_10_10Float => dest == ColorFormat::K2_10_10_10Float,
            Self::K16_16 => dest == ColorFormat::K16_16,
            Self::K16_16_16_16 => dest == ColorFormat::K16_16_16_16,
            Self::K16_16Float => dest == ColorFormat::K16_16Float,
            Self::K16_16_16_16Float => dest == ColorFormat::K16_16_16_16Float,
            Self::K32Float => dest == ColorFormat::K32Float,
            Self::K32_32Float => dest == ColorFormat::K32_32Float,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DepthRenderTargetFormat {
    #[default]
    D24S8 = 0,
    // 20e4 floating point depth
    D24FS8 = 1,
}

impl DepthRenderTargetFormat {
    pub const ALL: [Self; 2] = [Self::D24S8, Self::D24FS8];

    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Self::D24FS8
        } else {
            Self::D24S8
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn resolve_texture_format(self) -> ColorFormat {
        match self {
            Self::D24S8 => ColorFormat::K24_8,
            Self::D24FS8 => ColorFormat::K24_8Float,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeControl {
    #[default]
    Ignore = 0,
    ColorDepth = 4,
    Depth = 5,
    Copy = 6,
}

impl ModeControl {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            4 => Self::ColorDepth,
            5 => Self::Depth,
            6 => Self::Copy,
            _ => Self::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyCommand {
    #[default]
    Raw = 0,
    Convert = 1,
    ConstantOne = 2,
    Null = 3,
}

impl CopyCommand {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Raw,
            1 => Self::Convert,
            2 => Self::ConstantOne,
            3 => Self::Null,
            _ => unreachable!("value & 3 is always <= 3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopySampleSelect {
    #[default]
    S0 = 0,
    S1 = 1,
    S2 = 2,
    S3 = 3,
    S01 = 4,
    S23 = 5,
    S0123 = 6,
}

impl CopySampleSelect {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            1 => Self::S1,
            2 => Self::S2,
            3 => Self::S3,
            4 => Self::S01,
            5 => Self::S23,
            6 => Self::S0123,
            _ => Self::S0,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn is_single_sample(self) -> bool {
        (self as u32) < 4
    }

    /// Limits the selection to what the given MSAA mode can provide. Depth samples can't be
    /// averaged.
    pub fn sanitize(self, msaa_samples: MsaaSamples, is_depth: bool) -> Self {
        match msaa_samples {
            MsaaSamples::X1 => Self::S0,
            MsaaSamples::X2 => match self {
                Self::S0 | Self::S2 => Self::S0,
                Self::S1 | Self::S3 => Self::S1,
                Self::S01 | Self::S23 | Self::S0123 if is_depth => Self::S0,
                Self::S01 | Self::S23 | Self::S0123 => Self::S01,
            },
            MsaaSamples::X4 => match self {
                Self::S01 | Self::S0123 if is_depth => Self::S0,
                Self::S23 if is_depth => Self::S2,
                _ => self,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian128 {
    #[default]
    None = 0,
    E8In16 = 1,
    E8In32 = 2,
    E16In32 = 3,
    E8In64 = 4,
    E8In128 = 5,
}

impl Endian128 {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            1 => Self::E8In16,
            2 => Self::E8In32,
            3 => Self::E16In32,
            4 => Self::E8In64,
            5 => Self::E8In128,
            _ => Self::None,
        }
    }
}

/// Guest texture formats that a resolve can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    K8 = 2,
    K1_5_5_5 = 3,
    K5_6_5 = 4,
    K6_5_5 = 5,
    #[default]
    K8888 = 6,
    K2_10_10_10 = 7,
    K8_8 = 10,
    K4_4_4_4 = 15,
    K10_11_11 = 16,
    K11_11_10 = 17,
    // Depth resolve destinations
    K24_8 = 22,
    K24_8Float = 23,
    K16 = 24,
    K16_16 = 25,
    K16_16_16_16 = 26,
    K16Float = 30,
    K16_16Float = 31,
    K16_16_16_16Float = 32,
    K32Float = 36,
    K32_32Float = 37,
    K32_32_32_32Float = 38,
    K2_10_10_10Float = 62,
}

impl ColorFormat {
    pub const ALL: [Self; 22] = [
        Self::K8,
        Self::K1_5_5_5,
        Self::K5_6_5,
        Self::K6_5_5,
        Self::K8888,
        Self::K2_10_10_10,
        Self::K8_8,
        Self::K4_4_4_4,
        Self::K10_11_11,
        Self::K11_11_10,
        Self::K24_8,
        Self::K24_8Float,
        Self::K16,
        Self::K16_16,
        Self::K16_16_16_16,
        Self::K16Float,
        Self::K16_16Float,
        Self::K16_16_16_16Float,
        Self::K32Float,
        Self::K32_32Float,
        Self::K32_32_32_32Float,
        Self::K2_10_10_10Float,
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| *format as u32 == bits)
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::K8 => 8,
            Self::K1_5_5_5
            | Self::K5_6_5
            | Self::K6_5_5
            | Self::K8_8
            | Self::K4_4_4_4
            | Self::K16
            | Self::K16Float => 16,
            Self::K8888
            | Self::K2_10_10_10
            | Self::K10_11_11
            | Self::K11_11_10
            | Self::K24_8
            | Self::K24_8Float
            | Self::K16_16
            | Self::K16_16Float
            | Self::K32Float
            | Self::K2_10_10_10Float => 32,
            Self::K16_16_16_16 | Self::K16_16_16_16Float | Self::K32_32Float => 64,
            Self::K32_32_32_32Float => 128,
        }
    }
}
