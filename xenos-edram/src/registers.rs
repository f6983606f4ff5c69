//! Render backend registers consumed by the render target cache

use crate::xenos::{
    ColorRenderTargetFormat, CopyCommand, CopySampleSelect, DepthRenderTargetFormat, Endian128,
    ModeControl, MsaaSamples, MAX_COLOR_RENDER_TARGETS,
};
use proc_bitfield::bitfield;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbSurfaceInfo(pub u32): Debug, FromStorage, IntoStorage {
        pub surface_pitch: u32 @ 0..14,
        pub msaa_samples_bits: u32 @ 16..18,
        pub hiz_pitch: u32 @ 18..32,
    }
}

impl RbSurfaceInfo {
    pub fn msaa_samples(self) -> Option<MsaaSamples> {
        MsaaSamples::from_bits(self.msaa_samples_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbColorInfo(pub u32): Debug, FromStorage, IntoStorage {
        pub color_base: u32 @ 0..12,
        pub color_format_bits: u32 @ 16..20,
        pub color_exp_bias_bits: u32 @ 20..26,
    }
}

impl RbColorInfo {
    pub fn color_format(self) -> Option<ColorRenderTargetFormat> {
        ColorRenderTargetFormat::from_bits(self.color_format_bits())
    }

    pub fn color_exp_bias(self) -> i32 {
        sign_extend_6(self.color_exp_bias_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbDepthInfo(pub u32): Debug, FromStorage, IntoStorage {
        pub depth_base: u32 @ 0..12,
        pub depth_format_bit: bool @ 16,
    }
}

impl RbDepthInfo {
    pub fn depth_format(self) -> DepthRenderTargetFormat {
        DepthRenderTargetFormat::from_bit(self.depth_format_bit())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbDepthControl(pub u32): Debug, FromStorage, IntoStorage {
        pub stencil_enable: bool @ 0,
        pub z_enable: bool @ 1,
        pub z_write_enable: bool @ 2,
        pub zfunc: u32 @ 4..7,
        pub backface_enable: bool @ 7,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbModeControl(pub u32): Debug, FromStorage, IntoStorage {
        pub edram_mode_bits: u32 @ 0..3,
    }
}

impl RbModeControl {
    pub fn edram_mode(self) -> ModeControl {
        ModeControl::from_bits(self.edram_mode_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbCopyControl(pub u32): Debug, FromStorage, IntoStorage {
        pub copy_src_select: u32 @ 0..3,
        pub copy_sample_select_bits: u32 @ 4..7,
        pub color_clear_enable: bool @ 8,
        pub depth_clear_enable: bool @ 9,
        pub copy_command_bits: u32 @ 20..22,
    }
}

impl RbCopyControl {
    pub fn copy_sample_select(self) -> CopySampleSelect {
        CopySampleSelect::from_bits(self.copy_sample_select_bits())
    }

    pub fn copy_command(self) -> CopyCommand {
        CopyCommand::from_bits(self.copy_command_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbCopyDestInfo(pub u32): Debug, FromStorage, IntoStorage {
        pub copy_dest_endian_bits: u32 @ 0..3,
        pub copy_dest_array: bool @ 3,
        pub copy_dest_slice: u32 @ 4..7,
        pub copy_dest_format_bits: u32 @ 7..13,
        pub copy_dest_number: u32 @ 13..16,
        pub copy_dest_exp_bias_bits: u32 @ 16..22,
        pub copy_dest_swap: bool @ 24,
    }
}

impl RbCopyDestInfo {
    pub fn copy_dest_endian(self) -> Endian128 {
        Endian128::from_bits(self.copy_dest_endian_bits())
    }

    pub fn copy_dest_exp_bias(self) -> i32 {
        sign_extend_6(self.copy_dest_exp_bias_bits())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbCopyDestPitch(pub u32): Debug, FromStorage, IntoStorage {
        pub copy_dest_pitch: u32 @ 0..14,
        pub copy_dest_height: u32 @ 16..30,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbStencilRefMask(pub u32): Debug, FromStorage, IntoStorage {
        pub stencil_ref: u32 @ 0..8,
        pub stencil_mask: u32 @ 8..16,
        pub stencil_writemask: u32 @ 16..24,
    }
}

bitfield! {
    /// Component write masks, 4 bits per color render target from red in the lowest bit.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct RbColorMask(pub u32): Debug, FromStorage, IntoStorage {
        pub write_masks: u32 @ 0..16,
    }
}

impl RbColorMask {
    pub fn write_mask(self, index: usize) -> u32 {
        (self.write_masks() >> (index * 4)) & 0xF
    }
}

fn sign_extend_6(bits: u32) -> i32 {
    ((bits << 26) as i32) >> 26
}

/// Viewport and scissor state that bounds the rows a draw can touch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterizationBounds {
    pub clip_disable: bool,
    pub window_y_offset: i32,
    pub vtx_window_offset_enable: bool,
    pub half_pixel_offset: bool,
    pub viewport_y_offset: Option<f32>,
    pub viewport_y_scale: Option<f32>,
    pub window_scissor_br_y: i32,
    pub window_offset_disable: bool,
    pub screen_scissor_br_y: i32,
}

impl RasterizationBounds {
    /// Bottom edge of the area a draw can write to, in guest pixels.
    pub fn height_limit(&self, render_target_height: u32) -> u32 {
        let mut height = render_target_height;

        if !self.clip_disable {
            let mut viewport_bottom = 0.0_f32;
            if self.vtx_window_offset_enable {
                viewport_bottom += self.window_y_offset as f32;
            }
            if self.half_pixel_offset {
                viewport_bottom += 0.5;
            }
            if let Some(y_offset) = self.viewport_y_offset {
                viewport_bottom += y_offset;
            }
            viewport_bottom += self.viewport_y_scale.map_or(1.0, f32::abs);
            // fmax drops NaN and negative values; min as a float drops huge ones
            height = viewport_bottom.max(0.0).min(height as f32) as u32;
        }

        let mut scissor_bottom = self.window_scissor_br_y;
        if !self.window_offset_disable {
            scissor_bottom += self.window_y_offset;
        }
        scissor_bottom = scissor_bottom.min(self.screen_scissor_br_y);
        height.min(scissor_bottom.max(0) as u32)
    }
}

/// Snapshot of the registers the cache reads for a draw or a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderTargetRegisters {
    pub surface_info: RbSurfaceInfo,
    pub mode_control: RbModeControl,
    pub color_info: [RbColorInfo; MAX_COLOR_RENDER_TARGETS],
    pub depth_info: RbDepthInfo,
    pub depth_control: RbDepthControl,
    pub color_mask: RbColorMask,
    pub bounds: RasterizationBounds,
}
