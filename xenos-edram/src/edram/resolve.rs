//! Resolve parameters: the EDRAM area to copy into guest memory or to clear, packed the way the
//! resolve shaders consume it

use crate::edram::formats::{unpack_depth_stencil, ColorEncoding, DepthEncoding, HostColor};
use crate::edram::ownership::Rectangle;
use crate::edram::texture_tiling::{self, STORAGE_DEPTH_ALIGNMENT, STORAGE_PITCH_HEIGHT_ALIGNMENT};
use crate::edram::tiles::ResolutionScale;
use crate::edram::{render_target_height, RenderTargetKey};
use crate::registers::{
    RbColorInfo, RbCopyControl, RbCopyDestInfo, RbCopyDestPitch, RbDepthInfo, RbSurfaceInfo,
};
use crate::xenos::{
    ColorFormat, ColorRenderTargetFormat, CopyCommand, CopySampleSelect, DepthRenderTargetFormat,
    MsaaSamples, EDRAM_TILE_COUNT, EDRAM_TILE_HEIGHT_SAMPLES, EDRAM_TILE_WIDTH_SAMPLES,
    MAX_COLOR_RENDER_TARGETS, RESOLVE_ALIGNMENT_PIXELS, RESOLVE_SIZE_BITS,
    TEXTURE_2D_MAX_WIDTH_HEIGHT,
};
use bytemuck::{Pod, Zeroable};
use proc_bitfield::bitfield;
use thiserror::Error;

const MAX_RESOLVE_SIZE: i32 = 1 << RESOLVE_SIZE_BITS;
const RESOLVE_ALIGNMENT_LOG2: u32 = RESOLVE_ALIGNMENT_PIXELS.trailing_zeros();
const DEST_PAGE_SIZE: u32 = 4096;

// Width of the region that the local offsets are relative to, a multiple of both the EDRAM tile
// width and the texture tile width
const LOCAL_REGION_WIDTH: u32 = 160;
const LOCAL_REGION_HEIGHT: u32 = 32;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported resolve copy command {0:?}")]
    UnsupportedCopyCommand(CopyCommand),
    #[error("invalid resolve MSAA sample count bits {0}")]
    InvalidMsaaSamples(u32),
    #[error("unknown color render target format bits {0}")]
    UnknownColorFormat(u32),
    #[error("failed to request the guest memory range {address:#010X} (length {length:#X})")]
    Residency { address: u32, length: u32 },
    #[error("no resolve copy pipeline for {0:?}")]
    MissingCopyPipeline(ResolveCopyShader),
    #[error("failed to clear the resolved EDRAM area")]
    Clear,
}

bitfield! {
    /// EDRAM side of a resolve, with the offset to the 160x32 region of the rectangle added to
    /// the base.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveEdramInfo(pub u32): Debug, FromStorage, IntoStorage {
        // With 32bpp/64bpp taken into account
        pub pitch_tiles: u32 @ 0..11,
        pub msaa_samples_bits: u32 @ 11..13,
        pub is_depth: bool @ 13,
        pub base_tiles: u32 @ 14..26,
        pub format: u32 @ 26..30,
        pub format_is_64bpp: bool @ 30,
        // Take the second column and row of the scaled pixel for the first to reduce the impact
        // of the half-pixel offset with resolution scaling
        pub duplicate_second_pixel: bool @ 31,
    }
}

impl ResolveEdramInfo {
    pub fn msaa_samples(self) -> MsaaSamples {
        MsaaSamples::from_bits(self.msaa_samples_bits()).unwrap_or_default()
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveAddressInfo(pub u32): Debug, FromStorage, IntoStorage {
        // 0..=19 for 0..=152
        pub local_x_div_8: u32 @ 0..5,
        // 0..=3 for 0..=24
        pub local_y_div_8: u32 @ 5..7,
        // Zero if the rectangle is empty, the copy must be dropped then
        pub width_div_8: u32 @ 7..17,
        pub height_div_8: u32 @ 17..27,
        pub copy_sample_select_bits: u32 @ 27..30,
    }
}

impl ResolveAddressInfo {
    pub fn copy_sample_select(self) -> CopySampleSelect {
        CopySampleSelect::from_bits(self.copy_sample_select_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveCopyDestPitchInfo(pub u32): Debug, FromStorage, IntoStorage {
        // 0..=16384/32
        pub pitch_aligned_div_32: u32 @ 0..10,
        pub height_aligned_div_32: u32 @ 10..20,
    }
}

/// Tiles covered by a resolve: `rows` rows of `row_length_used` tiles starting at `base`, with
/// `pitch` tiles between rows. The base may be outside the EDRAM, addressing wraps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdramTileSpan {
    pub base: u32,
    pub row_length_used: u32,
    pub rows: u32,
    pub pitch: u32,
}

pub fn resolve_edram_tile_span(
    edram_info: ResolveEdramInfo,
    address: ResolveAddressInfo,
) -> EdramTileSpan {
    let msaa_samples = edram_info.msaa_samples();
    let bpp_log2 = u32::from(edram_info.format_is_64bpp());

    let x_start = address.local_x_div_8() << RESOLVE_ALIGNMENT_LOG2;
    let x_end = x_start + (address.width_div_8() << RESOLVE_ALIGNMENT_LOG2);
    let y_start = address.local_y_div_8() << RESOLVE_ALIGNMENT_LOG2;
    let y_end = y_start + (address.height_div_8() << RESOLVE_ALIGNMENT_LOG2);

    let x_scale_log2 = msaa_samples.x_log2() + bpp_log2;
    let column_start = (x_start << x_scale_log2) / EDRAM_TILE_WIDTH_SAMPLES;
    let column_end = (x_end << x_scale_log2).div_ceil(EDRAM_TILE_WIDTH_SAMPLES);
    let row_start = (y_start << msaa_samples.y_log2()) / EDRAM_TILE_HEIGHT_SAMPLES;
    let row_end = (y_end << msaa_samples.y_log2()).div_ceil(EDRAM_TILE_HEIGHT_SAMPLES);

    let pitch = edram_info.pitch_tiles();
    EdramTileSpan {
        base: edram_info.base_tiles() + row_start * pitch + column_start,
        row_length_used: column_end - column_start,
        rows: row_end - row_start,
        pitch,
    }
}

/// Compute shaders performing resolve copies.
///
/// The fast shaders copy the bits of one sample without conversion. The full shaders convert
/// and pack into any destination format of their bits per pixel. The scaled variants write
/// every host pixel of the resolution-scaled EDRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResolveCopyShader {
    Fast32bpp1x2xMsaa,
    Fast32bpp4xMsaa,
    Fast32bppScaled,
    Fast64bpp1x2xMsaa,
    Fast64bpp4xMsaa,
    Fast64bppScaled,
    Full8bpp,
    Full8bppScaled,
    Full16bpp,
    Full16bppScaled,
    Full32bpp,
    Full32bppScaled,
    Full64bpp,
    Full64bppScaled,
    Full128bpp,
    Full128bppScaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveCopyShaderKind {
    Fast { source_is_64bpp: bool },
    Full { dest_bytes_per_pixel_log2: u32 },
}

impl ResolveCopyShader {
    pub const ALL: [Self; 16] = [
        Self::Fast32bpp1x2xMsaa,
        Self::Fast32bpp4xMsaa,
        Self::Fast32bppScaled,
        Self::Fast64bpp1x2xMsaa,
        Self::Fast64bpp4xMsaa,
        Self::Fast64bppScaled,
        Self::Full8bpp,
        Self::Full8bppScaled,
        Self::Full16bpp,
        Self::Full16bppScaled,
        Self::Full32bpp,
        Self::Full32bppScaled,
        Self::Full64bpp,
        Self::Full64bppScaled,
        Self::Full128bpp,
        Self::Full128bppScaled,
    ];

    pub fn kind(self) -> ResolveCopyShaderKind {
        use ResolveCopyShaderKind::{Fast, Full};
        match self {
            Self::Fast32bpp1x2xMsaa | Self::Fast32bpp4xMsaa | Self::Fast32bppScaled => {
                Fast { source_is_64bpp: false }
            }
            Self::Fast64bpp1x2xMsaa | Self::Fast64bpp4xMsaa | Self::Fast64bppScaled => {
                Fast { source_is_64bpp: true }
            }
            Self::Full8bpp | Self::Full8bppScaled => Full { dest_bytes_per_pixel_log2: 0 },
            Self::Full16bpp | Self::Full16bppScaled => Full { dest_bytes_per_pixel_log2: 1 },
            Self::Full32bpp | Self::Full32bppScaled => Full { dest_bytes_per_pixel_log2: 2 },
            Self::Full64bpp | Self::Full64bppScaled => Full { dest_bytes_per_pixel_log2: 3 },
            Self::Full128bpp | Self::Full128bppScaled => Full { dest_bytes_per_pixel_log2: 4 },
        }
    }

    pub fn is_scaled(self) -> bool {
        matches!(
            self,
            Self::Fast32bppScaled
                | Self::Fast64bppScaled
                | Self::Full8bppScaled
                | Self::Full16bppScaled
                | Self::Full32bppScaled
                | Self::Full64bppScaled
                | Self::Full128bppScaled
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Fast32bpp1x2xMsaa => "resolve_fast_32bpp_1x2xmsaa",
            Self::Fast32bpp4xMsaa => "resolve_fast_32bpp_4xmsaa",
            Self::Fast32bppScaled => "resolve_fast_32bpp_scaled",
            Self::Fast64bpp1x2xMsaa => "resolve_fast_64bpp_1x2xmsaa",
            Self::Fast64bpp4xMsaa => "resolve_fast_64bpp_4xmsaa",
            Self::Fast64bppScaled => "resolve_fast_64bpp_scaled",
            Self::Full8bpp => "resolve_full_8bpp",
            Self::Full8bppScaled => "resolve_full_8bpp_scaled",
            Self::Full16bpp => "resolve_full_16bpp",
            Self::Full16bppScaled => "resolve_full_16bpp_scaled",
            Self::Full32bpp => "resolve_full_32bpp",
            Self::Full32bppScaled => "resolve_full_32bpp_scaled",
            Self::Full64bpp => "resolve_full_64bpp",
            Self::Full64bppScaled => "resolve_full_64bpp_scaled",
            Self::Full128bpp => "resolve_full_128bpp",
            Self::Full128bppScaled => "resolve_full_128bpp_scaled",
        }
    }
}

/// Push constants of the resolve copy shaders. With resolution scaling only the first four
/// dwords are pushed, the destination is bound at its base.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ResolveCopyConstants {
    pub edram_info: u32,
    pub address_info: u32,
    pub dest_info: u32,
    pub dest_pitch_aligned: u32,
    pub dest_base: u32,
}

impl ResolveCopyConstants {
    pub const SCALED_DWORDS: usize = 4;

    pub fn bytes(&self, scaled: bool) -> &[u8] {
        let bytes = bytemuck::bytes_of(self);
        if scaled {
            &bytes[..Self::SCALED_DWORDS * 4]
        } else {
            bytes
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ResolveClearConstants {
    pub clear_value: [u32; 2],
    pub edram_info: u32,
    pub address_info: u32,
}

/// The rectangle of a resolve in guest pixels, after the vertices and the window scissor are
/// applied. Left/top inclusive, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveRectangle {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

/// Registers read by a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveRegisters {
    pub copy_control: RbCopyControl,
    pub surface_info: RbSurfaceInfo,
    pub color_info: [RbColorInfo; MAX_COLOR_RENDER_TARGETS],
    pub depth_info: RbDepthInfo,
    pub copy_dest_info: RbCopyDestInfo,
    pub copy_dest_pitch: RbCopyDestPitch,
    pub copy_dest_base: u32,
    pub depth_clear: u32,
    pub color_clear: u32,
    pub color_clear_lo: u32,
    // PA_SU_VTX_CNTL pix_center, pixel centers at integers without the half-pixel offset
    pub pix_center: bool,
    pub rectangle: ResolveRectangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveOptions {
    pub resolution_scale: ResolutionScale,
    // 16-bit normalized formats drawn with the -1...1 range instead of the guest's -32...32
    pub edram_16_as_minus_1_to_1: bool,
    pub duplicate_second_pixel: bool,
    pub half_pixel_offset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveInfo {
    pub copy_control: RbCopyControl,
    pub msaa_samples: MsaaSamples,
    // Set up if copying or clearing depth and color respectively
    pub depth_edram_info: ResolveEdramInfo,
    pub color_edram_info: ResolveEdramInfo,
    // Bases without the offset to the 160x32 region, the bases the render targets are most likely
    // drawn with next
    pub depth_original_base: u32,
    pub color_original_base: u32,
    pub address: ResolveAddressInfo,
    pub copy_dest_info: RbCopyDestInfo,
    pub copy_dest_pitch_aligned: ResolveCopyDestPitchInfo,
    // Memory that may be modified by the copy, with the 32x32 texture tile of the rectangle
    // origin offset already added
    pub copy_dest_base: u32,
    // Zero if the destination is unusable, copying must be dropped but clearing may still be done
    pub copy_dest_length: u32,
    pub depth_clear: u32,
    pub color_clear: u32,
    pub color_clear_lo: u32,
}

impl ResolveInfo {
    pub fn from_registers(
        regs: &ResolveRegisters,
        options: ResolveOptions,
    ) -> Result<Self, ResolveError> {
        let copy_control = regs.copy_control;
        let copy_command = copy_control.copy_command();
        if !matches!(copy_command, CopyCommand::Raw | CopyCommand::Convert) {
            return Err(ResolveError::UnsupportedCopyCommand(copy_command));
        }
        let msaa_samples = regs
            .surface_info
            .msaa_samples()
            .ok_or(ResolveError::InvalidMsaaSamples(regs.surface_info.msaa_samples_bits()))?;

        let ResolveRectangle { mut x0, mut y0, mut x1, mut y1 } = regs.rectangle;
        x0 = x0.max(0);
        y0 = y0.max(0);
        x1 = x1.max(x0);
        y1 = y1.max(y0);

        // Expand to the 8x8 resolve alignment
        let alignment = RESOLVE_ALIGNMENT_PIXELS as i32;
        x0 &= !(alignment - 1);
        y0 &= !(alignment - 1);
        x1 = (x1 + alignment - 1) & !(alignment - 1);
        y1 = (y1 + alignment - 1) & !(alignment - 1);

        let surface_pitch_aligned =
            (regs.surface_info.surface_pitch() & !(RESOLVE_ALIGNMENT_PIXELS - 1)) as i32;
        if x1 > surface_pitch_aligned {
            log::error!(
                "Resolve region {x0} <= x < {x1} is outside the surface pitch {surface_pitch_aligned}"
            );
            x0 = x0.min(surface_pitch_aligned);
            x1 = x1.min(surface_pitch_aligned);
        }
        if y1 - y0 > MAX_RESOLVE_SIZE {
            log::error!("Resolve region {y0} <= y < {y1} is taller than {MAX_RESOLVE_SIZE}");
            y1 = y0 + MAX_RESOLVE_SIZE;
        }
        if x0 >= x1 || y0 >= y1 {
            log::error!("Resolve region is empty");
        }

        let is_depth = copy_control.copy_src_select() as usize >= MAX_COLOR_RENDER_TARGETS;

        let requested_sample_select = copy_control.copy_sample_select();
        let sample_select = requested_sample_select.sanitize(msaa_samples, is_depth);
        if sample_select != requested_sample_select {
            log::warn!(
                "Incorrect resolve sample selected for {msaa_samples} {}: {requested_sample_select:?}, treating like {sample_select:?}",
                if is_depth { "depth" } else { "color" }
            );
        }

        let address = ResolveAddressInfo::default()
            .with_local_x_div_8((x0 as u32 % LOCAL_REGION_WIDTH) >> RESOLVE_ALIGNMENT_LOG2)
            .with_local_y_div_8((y0 as u32 % LOCAL_REGION_HEIGHT) >> RESOLVE_ALIGNMENT_LOG2)
            .with_width_div_8((x1 - x0) as u32 >> RESOLVE_ALIGNMENT_LOG2)
            .with_height_div_8((y1 - y0) as u32 >> RESOLVE_ALIGNMENT_LOG2)
            .with_copy_sample_select_bits(sample_select.bits());

        let depth_format = regs.depth_info.depth_format();
        let dest_format = if is_depth {
            Some(depth_format.resolve_texture_format())
        } else {
            ColorFormat::from_bits(regs.copy_dest_info.copy_dest_format_bits())
        };

        let (copy_dest_base, copy_dest_length) = match dest_format {
            Some(dest_format) => copy_dest_extent(regs, dest_format, (x0, y0, x1, y1)),
            None => {
                log::error!(
                    "Tried to resolve to format {}, which is not a resolvable color format",
                    regs.copy_dest_info.copy_dest_format_bits()
                );
                (regs.copy_dest_base, 0)
            }
        };

        // Offset to the 160x32 region containing the origin
        let local_x = x0 as u32 % LOCAL_REGION_WIDTH;
        let local_y = y0 as u32 % LOCAL_REGION_HEIGHT;
        let base_offset_x_tiles = ((x0 as u32 - local_x) << msaa_samples.x_log2())
            .div_ceil(EDRAM_TILE_WIDTH_SAMPLES);
        let base_offset_y_tiles = ((y0 as u32 - local_y) << msaa_samples.y_log2())
            .div_ceil(EDRAM_TILE_HEIGHT_SAMPLES);
        let surface_pitch_tiles = crate::edram::surface_pitch_tiles(
            regs.surface_info.surface_pitch(),
            msaa_samples,
            false,
        );
        let edram_base_offset_tiles =
            base_offset_y_tiles * surface_pitch_tiles + base_offset_x_tiles;

        let duplicate_second_pixel = !options.resolution_scale.is_native()
            && options.duplicate_second_pixel
            && options.half_pixel_offset
            && !regs.pix_center;

        let mut exp_bias = if is_depth { 0 } else { regs.copy_dest_info.copy_dest_exp_bias() };

        let mut color_edram_info = ResolveEdramInfo::default();
        let mut color_original_base = 0;
        if !is_depth {
            let color_info = regs.color_info[copy_control.copy_src_select() as usize];
            let color_format = color_info
                .color_format()
                .ok_or(ResolveError::UnknownColorFormat(color_info.color_format_bits()))?;
            let is_64bpp = color_format.is_64bpp();
            color_original_base = color_info.color_base();
            color_edram_info = ResolveEdramInfo::default()
                .with_pitch_tiles(surface_pitch_tiles << u32::from(is_64bpp))
                .with_msaa_samples_bits(msaa_samples.bits())
                .with_base_tiles(
                    color_original_base + (edram_base_offset_tiles << u32::from(is_64bpp)),
                )
                .with_format(color_format.bits())
                .with_format_is_64bpp(is_64bpp)
                .with_duplicate_second_pixel(duplicate_second_pixel);
            if options.edram_16_as_minus_1_to_1
                && matches!(
                    color_format,
                    ColorRenderTargetFormat::K16_16 | ColorRenderTargetFormat::K16_16_16_16
                )
            {
                // The texture expects 0x8001 = -32 and 0x7FFF = 32, drawing was done with -1...1
                exp_bias = (exp_bias + 5).min(31);
            }
        }

        let mut depth_edram_info = ResolveEdramInfo::default();
        let mut depth_original_base = 0;
        if is_depth || copy_control.depth_clear_enable() {
            depth_original_base = regs.depth_info.depth_base();
            depth_edram_info = ResolveEdramInfo::default()
                .with_pitch_tiles(surface_pitch_tiles)
                .with_msaa_samples_bits(msaa_samples.bits())
                .with_is_depth(true)
                .with_base_tiles(depth_original_base + edram_base_offset_tiles)
                .with_format(depth_format.bits())
                .with_duplicate_second_pixel(duplicate_second_pixel);
        }

        let mut copy_dest_info = regs
            .copy_dest_info
            .with_copy_dest_exp_bias_bits((exp_bias as u32) & 0x3F);
        if let Some(dest_format) = dest_format {
            copy_dest_info = copy_dest_info.with_copy_dest_format_bits(dest_format.bits());
        }
        if is_depth {
            // Single component, nothing to swap
            copy_dest_info = copy_dest_info.with_copy_dest_swap(false);
        }

        let copy_dest_pitch = regs.copy_dest_pitch;
        let copy_dest_pitch_aligned = ResolveCopyDestPitchInfo::default()
            .with_pitch_aligned_div_32(
                texture_tiling::align_storage_pitch_height(copy_dest_pitch.copy_dest_pitch())
                    / STORAGE_PITCH_HEIGHT_ALIGNMENT,
            )
            .with_height_aligned_div_32(
                texture_tiling::align_storage_pitch_height(copy_dest_pitch.copy_dest_height())
                    / STORAGE_PITCH_HEIGHT_ALIGNMENT,
            );

        log::trace!(
            "Resolve: {x0},{y0} <= x,y < {x1},{y1}, source {}, dest format {dest_format:?} at {:#010X} (first tile at {copy_dest_base:#010X}, length {copy_dest_length:#X})",
            if is_depth {
                format!("{depth_format:?}")
            } else {
                format!("color {}", copy_control.copy_src_select())
            },
            regs.copy_dest_base,
        );

        Ok(Self {
            copy_control,
            msaa_samples,
            depth_edram_info,
            color_edram_info,
            depth_original_base,
            color_original_base,
            address,
            copy_dest_info,
            copy_dest_pitch_aligned,
            copy_dest_base,
            copy_dest_length,
            depth_clear: regs.depth_clear,
            color_clear: regs.color_clear,
            color_clear_lo: regs.color_clear_lo,
        })
    }

    pub fn is_copying_depth(&self) -> bool {
        self.copy_control.copy_src_select() as usize >= MAX_COLOR_RENDER_TARGETS
    }

    pub fn is_clearing_depth(&self) -> bool {
        self.copy_control.depth_clear_enable()
    }

    pub fn is_clearing_color(&self) -> bool {
        !self.is_copying_depth() && self.copy_control.color_clear_enable()
    }

    pub fn is_empty(&self) -> bool {
        self.address.width_div_8() == 0 || self.address.height_div_8() == 0
    }

    fn copy_edram_info(&self) -> ResolveEdramInfo {
        if self.is_copying_depth() {
            self.depth_edram_info
        } else {
            self.color_edram_info
        }
    }

    pub fn copy_edram_tile_span(&self) -> EdramTileSpan {
        resolve_edram_tile_span(self.copy_edram_info(), self.address)
    }

    /// The copy shader for the resolve, `None` if the destination format can't be resolved to.
    pub fn copy_shader(&self, scale: ResolutionScale) -> Option<ResolveCopyShader> {
        use ResolveCopyShader::*;

        let scaled = !scale.is_native();
        let is_depth = self.is_copying_depth();
        let dest_format = ColorFormat::from_bits(self.copy_dest_info.copy_dest_format_bits())?;
        let bitwise_copy = is_depth
            || (self.copy_dest_info.copy_dest_exp_bias() == 0
                && self.address.copy_sample_select().is_single_sample()
                && ColorRenderTargetFormat::from_bits(self.color_edram_info.format())
                    .is_some_and(|format| format.is_resolve_bitwise_equivalent(dest_format)));

        if bitwise_copy {
            let is_64bpp = !is_depth && self.color_edram_info.format_is_64bpp();
            let msaa_4x = self.copy_edram_info().msaa_samples() == MsaaSamples::X4;
            return Some(match (is_64bpp, scaled, msaa_4x) {
                (false, true, _) => Fast32bppScaled,
                (false, false, false) => Fast32bpp1x2xMsaa,
                (false, false, true) => Fast32bpp4xMsaa,
                (true, true, _) => Fast64bppScaled,
                (true, false, false) => Fast64bpp1x2xMsaa,
                (true, false, true) => Fast64bpp4xMsaa,
            });
        }

        Some(match (dest_format.bits_per_pixel(), scaled) {
            (8, false) => Full8bpp,
            (8, true) => Full8bppScaled,
            (16, false) => Full16bpp,
            (16, true) => Full16bppScaled,
            (32, false) => Full32bpp,
            (32, true) => Full32bppScaled,
            (64, false) => Full64bpp,
            (64, true) => Full64bppScaled,
            (128, false) => Full128bpp,
            (128, true) => Full128bppScaled,
            _ => return None,
        })
    }

    pub fn copy_constants(&self) -> ResolveCopyConstants {
        ResolveCopyConstants {
            edram_info: self.copy_edram_info().0,
            address_info: self.address.0,
            dest_info: self.copy_dest_info.0,
            dest_pitch_aligned: self.copy_dest_pitch_aligned.0,
            dest_base: self.copy_dest_base,
        }
    }

    /// Work groups of 8x8 pixels (host pixels with resolution scaling) covering the rectangle.
    pub fn copy_group_count(&self, scale: ResolutionScale) -> (u32, u32) {
        (self.address.width_div_8() * scale.x, self.address.height_div_8() * scale.y)
    }

    pub fn depth_clear_constants(&self) -> ResolveClearConstants {
        debug_assert!(self.is_clearing_depth());
        ResolveClearConstants {
            clear_value: [self.depth_clear, self.depth_clear],
            edram_info: self.depth_edram_info.0,
            address_info: self.address.0,
        }
    }

    pub fn color_clear_constants(&self) -> ResolveClearConstants {
        debug_assert!(self.is_clearing_color());
        ResolveClearConstants {
            clear_value: [self.color_clear, self.color_clear_lo],
            edram_info: self.color_edram_info.0,
            address_info: self.address.0,
        }
    }

    /// Work groups of the EDRAM clear shaders, each invocation clearing 8 samples of a row.
    pub fn clear_group_count(&self) -> (u32, u32) {
        let width_samples_div_8 = self.address.width_div_8() << self.msaa_samples.x_log2();
        let height_samples_div_8 = self.address.height_div_8() << self.msaa_samples.y_log2();
        ((width_samples_div_8 + 7) >> 3, height_samples_div_8)
    }

    /// Color clear value as the host render target of `format` stores it.
    pub fn host_color_clear_value(&self, format: ColorRenderTargetFormat) -> HostColor {
        ColorEncoding::of(format).decode([self.color_clear, self.color_clear_lo])
    }

    /// Depth and stencil clear values for a host depth render target of `format`.
    pub fn host_depth_clear_value(&self, format: DepthRenderTargetFormat) -> (f32, u32) {
        let (depth24, stencil) = unpack_depth_stencil(self.depth_clear);
        (DepthEncoding::of(format).decode(depth24), stencil)
    }

    /// The clear rectangle and the render targets taking ownership of the cleared tiles when
    /// clearing with host render targets. `None` if there's nothing to clear.
    pub fn host_clear_plan(
        &self,
        scale: ResolutionScale,
        max_render_target_width: u32,
        max_render_target_height: u32,
    ) -> Option<HostClearPlan> {
        let (mut pitch_tiles_at_32bpp, mut base_offset_tiles_at_32bpp, msaa_samples) =
            if self.is_clearing_depth() {
                let info = self.depth_edram_info;
                let base_offset = info.base_tiles() - self.depth_original_base;
                (info.pitch_tiles(), base_offset, info.msaa_samples())
            } else if self.is_clearing_color() {
                let info = self.color_edram_info;
                let base_offset = info.base_tiles() - self.color_original_base;
                (info.pitch_tiles(), base_offset, info.msaa_samples())
            } else {
                return None;
            };
        let color_is_64bpp = u32::from(self.color_edram_info.format_is_64bpp());
        if !self.is_clearing_depth() {
            debug_assert_eq!(pitch_tiles_at_32bpp & color_is_64bpp, 0);
            pitch_tiles_at_32bpp >>= color_is_64bpp;
            base_offset_tiles_at_32bpp >>= color_is_64bpp;
        }
        if pitch_tiles_at_32bpp == 0 {
            return None;
        }

        let x_log2 = msaa_samples.x_log2();
        let y_log2 = msaa_samples.y_log2();
        if pitch_tiles_at_32bpp
            > (TEXTURE_2D_MAX_WIDTH_HEIGHT << x_log2).div_ceil(EDRAM_TILE_WIDTH_SAMPLES)
        {
            log::error!(
                "Surface pitch in 80-sample groups {pitch_tiles_at_32bpp} at {msaa_samples} MSAA larger than the maximum texture width {TEXTURE_2D_MAX_WIDTH_HEIGHT} in a resolve"
            );
            return None;
        }
        let tile_width_pixels = EDRAM_TILE_WIDTH_SAMPLES >> x_log2;
        let tile_height_pixels = EDRAM_TILE_HEIGHT_SAMPLES >> y_log2;
        let pitch_pixels = pitch_tiles_at_32bpp * tile_width_pixels;
        if pitch_pixels * scale.x > max_render_target_width {
            log::error!(
                "Surface pitch aligned to EDRAM tiles and resolution-scaled {} larger than the maximum host render target width {max_render_target_width} in a resolve",
                pitch_pixels * scale.x
            );
            return None;
        }

        let height_pixels = render_target_height(
            pitch_tiles_at_32bpp,
            msaa_samples,
            scale.y,
            max_render_target_height,
        );
        let base_offset_rows = base_offset_tiles_at_32bpp / pitch_tiles_at_32bpp;
        let x_pixels = ((base_offset_tiles_at_32bpp - base_offset_rows * pitch_tiles_at_32bpp)
            * tile_width_pixels
            + (self.address.local_x_div_8() << RESOLVE_ALIGNMENT_LOG2))
            .min(pitch_pixels);
        let y_pixels = (base_offset_rows * tile_height_pixels
            + (self.address.local_y_div_8() << RESOLVE_ALIGNMENT_LOG2))
            .min(height_pixels);
        let rectangle = Rectangle::new(
            x_pixels,
            y_pixels,
            (self.address.width_div_8() << RESOLVE_ALIGNMENT_LOG2).min(pitch_pixels - x_pixels),
            (self.address.height_div_8() << RESOLVE_ALIGNMENT_LOG2).min(height_pixels - y_pixels),
        );
        if rectangle.is_empty() {
            // Outside the pitch or the height
            return None;
        }

        let clear_start_tiles = ((rectangle.y_pixels << y_log2) / EDRAM_TILE_HEIGHT_SAMPLES)
            * pitch_tiles_at_32bpp
            + (rectangle.x_pixels << x_log2) / EDRAM_TILE_WIDTH_SAMPLES;
        let clear_length_tiles = (((rectangle.bottom() - 1) << y_log2)
            / EDRAM_TILE_HEIGHT_SAMPLES)
            * pitch_tiles_at_32bpp
            + ((rectangle.right() - 1) << x_log2) / EDRAM_TILE_WIDTH_SAMPLES
            + 1
            - clear_start_tiles;

        let depth_start = if self.is_clearing_depth() {
            (self.depth_original_base + clear_start_tiles).min(EDRAM_TILE_COUNT)
        } else {
            EDRAM_TILE_COUNT
        };
        let color_start = if self.is_clearing_color() {
            (self.color_original_base + (clear_start_tiles << color_is_64bpp)).min(EDRAM_TILE_COUNT)
        } else {
            EDRAM_TILE_COUNT
        };
        let mut depth_end = (depth_start + clear_length_tiles).min(EDRAM_TILE_COUNT);
        let mut color_end =
            (color_start + (clear_length_tiles << color_is_64bpp)).min(EDRAM_TILE_COUNT);
        // Prevent overlap
        if depth_start < color_start {
            depth_end = depth_end.min(color_start);
        } else {
            color_end = color_end.min(depth_start);
        }

        let depth = (depth_start < depth_end).then(|| HostClearTarget {
            key: RenderTargetKey::depth(
                self.depth_original_base,
                pitch_tiles_at_32bpp,
                msaa_samples,
                DepthRenderTargetFormat::from_bit(self.depth_edram_info.format() & 1 != 0),
            ),
            start_tiles: depth_start,
            end_tiles: depth_end,
        });
        let color = (color_start < color_end)
            .then(|| ColorRenderTargetFormat::from_bits(self.color_edram_info.format()))
            .flatten()
            .map(|format| HostClearTarget {
                key: RenderTargetKey::color(
                    self.color_original_base,
                    pitch_tiles_at_32bpp,
                    msaa_samples,
                    format,
                ),
                start_tiles: color_start,
                end_tiles: color_end,
            });
        if depth.is_none() && color.is_none() {
            return None;
        }

        Some(HostClearPlan { rectangle, depth, color })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostClearTarget {
    pub key: RenderTargetKey,
    pub start_tiles: u32,
    pub end_tiles: u32,
}

/// Clearing of a resolve area in host render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostClearPlan {
    // In render target pixels, also excluded from the ownership transfers into the targets
    pub rectangle: Rectangle,
    pub depth: Option<HostClearTarget>,
    pub color: Option<HostClearTarget>,
}

fn copy_dest_extent(
    regs: &ResolveRegisters,
    dest_format: ColorFormat,
    (x0, y0, _x1, y1): (i32, i32, i32, i32),
) -> (u32, u32) {
    let bytes_per_block_log2 = (dest_format.bits_per_pixel() >> 3).trailing_zeros();
    let bytes_per_block = 1 << bytes_per_block_log2;
    let pitch = regs.copy_dest_pitch;
    let pitch_aligned = texture_tiling::align_storage_pitch_height(pitch.copy_dest_pitch());
    let tile_mask = !(STORAGE_PITCH_HEIGHT_ALIGNMENT as i32 - 1);
    let (origin_x, origin_y) = (x0 & tile_mask, y0 & tile_mask);

    let (offset, length) = if regs.copy_dest_info.copy_dest_array() {
        let height_aligned = texture_tiling::align_storage_pitch_height(pitch.copy_dest_height());
        let offset = texture_tiling::tiled_3d(
            origin_x,
            origin_y,
            0,
            pitch_aligned,
            height_aligned,
            bytes_per_block_log2,
        );
        // The base already points to the slice group, include one more slice conservatively
        let depth_aligned =
            (regs.copy_dest_info.copy_dest_slice() + 1).next_multiple_of(STORAGE_DEPTH_ALIGNMENT);
        (offset, pitch_aligned * height_aligned * depth_aligned * bytes_per_block)
    } else {
        let offset = i64::from(texture_tiling::tiled_2d(
            origin_x,
            origin_y,
            pitch_aligned,
            bytes_per_block_log2,
        ));
        // Rows from the origin's texture tile, 32x32 tiles are stored linearly
        let height_aligned = texture_tiling::align_storage_pitch_height((y1 - origin_y) as u32);
        (offset, pitch_aligned * height_aligned * bytes_per_block)
    };

    (
        regs.copy_dest_base.wrapping_add(offset as u32),
        length.next_multiple_of(DEST_PAGE_SIZE),
    )
}
