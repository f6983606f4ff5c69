//! Backend-independent EDRAM emulation: addressing, pixel formats and the bookkeeping of which
//! render target owns which tiles

pub mod bindings;
pub mod formats;
pub mod ownership;
pub mod resolve;
pub mod texture_tiling;
pub mod tiles;

use crate::edram::tiles::SurfaceLayout;
use crate::xenos::{
    ColorRenderTargetFormat, DepthRenderTargetFormat, MsaaSamples, EDRAM_TILE_COUNT,
    EDRAM_TILE_HEIGHT_SAMPLES, EDRAM_TILE_WIDTH_SAMPLES, TEXTURE_2D_MAX_WIDTH_HEIGHT,
};
use proc_bitfield::bitfield;
use std::fmt::{Display, Formatter};

bitfield! {
    /// Identifies a host render target. Render targets with equal keys are interchangeable.
    ///
    /// The all-zeros key is never a valid render target (pitch 0) and stands for "no render
    /// target".
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct RenderTargetKey(pub u32): Debug, FromStorage, IntoStorage {
        pub base_tiles: u32 @ 0..11,
        pub pitch_tiles_at_32bpp: u32 @ 11..19,
        pub msaa_samples_bits: u32 @ 19..21,
        pub is_depth: bool @ 21,
        pub resource_format_bits: u32 @ 22..26,
    }
}

impl RenderTargetKey {
    pub const EMPTY: Self = Self(0);

    pub fn color(
        base_tiles: u32,
        pitch_tiles_at_32bpp: u32,
        msaa_samples: MsaaSamples,
        format: ColorRenderTargetFormat,
    ) -> Self {
        Self::default()
            .with_base_tiles(base_tiles)
            .with_pitch_tiles_at_32bpp(pitch_tiles_at_32bpp)
            .with_msaa_samples_bits(msaa_samples.bits())
            .with_resource_format_bits(format.resource_format().bits())
    }

    pub fn depth(
        base_tiles: u32,
        pitch_tiles_at_32bpp: u32,
        msaa_samples: MsaaSamples,
        format: DepthRenderTargetFormat,
    ) -> Self {
        Self::default()
            .with_base_tiles(base_tiles)
            .with_pitch_tiles_at_32bpp(pitch_tiles_at_32bpp)
            .with_msaa_samples_bits(msaa_samples.bits())
            .with_is_depth(true)
            .with_resource_format_bits(format.bits())
    }

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    pub fn msaa_samples(self) -> MsaaSamples {
        match self.msaa_samples_bits() {
            0 => MsaaSamples::X1,
            1 => MsaaSamples::X2,
            _ => MsaaSamples::X4,
        }
    }

    /// Color format of a color render target, `None` for depth and for the empty key.
    pub fn color_format(self) -> Option<ColorRenderTargetFormat> {
        if self.is_empty() || self.is_depth() {
            None
        } else {
            ColorRenderTargetFormat::from_bits(self.resource_format_bits())
        }
    }

    /// Depth format of a depth render target, `None` for color.
    pub fn depth_format(self) -> Option<DepthRenderTargetFormat> {
        self.is_depth()
            .then(|| DepthRenderTargetFormat::from_bit(self.resource_format_bits() & 1 != 0))
    }

    pub fn format(self) -> Option<RenderTargetFormat> {
        match (self.color_format(), self.depth_format()) {
            (Some(format), _) => Some(RenderTargetFormat::Color(format)),
            (_, Some(format)) => Some(RenderTargetFormat::Depth(format)),
            _ => None,
        }
    }

    pub fn is_64bpp(self) -> bool {
        self.color_format().is_some_and(ColorRenderTargetFormat::is_64bpp)
    }

    /// Pitch in tiles of the render target's own bits per pixel.
    pub fn pitch_tiles(self) -> u32 {
        self.pitch_tiles_at_32bpp() << u32::from(self.is_64bpp())
    }

    pub fn width_pixels(self) -> u32 {
        render_target_width(self.pitch_tiles_at_32bpp(), self.msaa_samples())
    }

    pub fn layout(self) -> SurfaceLayout {
        SurfaceLayout::new(self.msaa_samples(), self.is_64bpp(), self.is_depth())
    }

    fn format_name(self) -> String {
        match self.format() {
            Some(RenderTargetFormat::Color(format)) => format!("{format:?}"),
            Some(RenderTargetFormat::Depth(format)) => format!("{format:?}"),
            None => format!("invalid format {}", self.resource_format_bits()),
        }
    }
}

/// Resource format of a host render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderTargetFormat {
    Color(ColorRenderTargetFormat),
    Depth(DepthRenderTargetFormat),
}

impl RenderTargetFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth(_))
    }

    pub fn is_64bpp(self) -> bool {
        match self {
            Self::Color(format) => format.is_64bpp(),
            Self::Depth(_) => false,
        }
    }
}

impl Display for RenderTargetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RT @ {}t, <{}t>, {} MSAA, {}",
            self.base_tiles(),
            self.pitch_tiles(),
            self.msaa_samples(),
            self.format_name()
        )
    }
}

pub fn render_target_width(pitch_tiles_at_32bpp: u32, msaa_samples: MsaaSamples) -> u32 {
    pitch_tiles_at_32bpp * (EDRAM_TILE_WIDTH_SAMPLES >> msaa_samples.x_log2())
}

/// Surface pitch in tiles for a pitch in pixels, rounded up to whole tiles.
pub fn surface_pitch_tiles(pitch_pixels: u32, msaa_samples: MsaaSamples, is_64bpp: bool) -> u32 {
    let pitch_samples = pitch_pixels << msaa_samples.x_log2();
    pitch_samples.div_ceil(EDRAM_TILE_WIDTH_SAMPLES) << u32::from(is_64bpp)
}

/// Height in guest pixels of render targets with the given pitch. Render targets span down to
/// the end of the EDRAM, limited by the guest maximum texture height and by what the host can
/// allocate at the resolution scale.
pub fn render_target_height(
    pitch_tiles_at_32bpp: u32,
    msaa_samples: MsaaSamples,
    scale_y: u32,
    max_host_height: u32,
) -> u32 {
    debug_assert_ne!(pitch_tiles_at_32bpp, 0);
    let tile_rows = EDRAM_TILE_COUNT.div_ceil(pitch_tiles_at_32bpp);
    let max_height_scaled = (TEXTURE_2D_MAX_WIDTH_HEIGHT * scale_y).min(max_host_height);
    let max_tile_rows = (max_height_scaled << msaa_samples.y_log2())
        / (EDRAM_TILE_HEIGHT_SAMPLES * scale_y);
    tile_rows.min(max_tile_rows) * (EDRAM_TILE_HEIGHT_SAMPLES >> msaa_samples.y_log2())
}
