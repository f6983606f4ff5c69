//! Compute shaders copying host depth values of a depth render target into the EDRAM buffer at
//! its own tiles, so transfers can restore depth without the 24-bit round trip

use crate::shaders::common;
use crate::shaders::{ShaderOptions, ShaderSource};
use crate::xenos::MsaaSamples;
use bytemuck::{Pod, Zeroable};
use proc_bitfield::bitfield;

pub const HOST_DEPTH_STORE_GROUP_SIZE: u32 = 8;

bitfield! {
    /// Stored area in guest pixels, multiples of 8.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostDepthStoreRectangle(pub u32): Debug, FromStorage, IntoStorage {
        pub x_div_8: u32 @ 0..10,
        pub y_div_8: u32 @ 10..20,
        pub width_div_8_minus_1: u32 @ 20..30,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostDepthStoreRenderTarget(pub u32): Debug, FromStorage, IntoStorage {
        pub pitch_tiles: u32 @ 0..11,
        pub base_tiles: u32 @ 11..22,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct HostDepthStoreConstants {
    pub rectangle: u32,
    pub render_target: u32,
}

impl HostDepthStoreConstants {
    pub fn new(
        rectangle: HostDepthStoreRectangle,
        render_target: HostDepthStoreRenderTarget,
    ) -> Self {
        Self { rectangle: rectangle.0, render_target: render_target.0 }
    }
}

/// One invocation per host pixel of the rectangle.
pub fn host_depth_store_group_count(
    width_div_8: u32,
    height_div_8: u32,
    options: &ShaderOptions,
) -> (u32, u32) {
    (width_div_8 * options.resolution_scale.x, height_div_8 * options.resolution_scale.y)
}

pub fn host_depth_store_shader_name(msaa: MsaaSamples) -> String {
    format!("host_depth_store_{msaa}")
}

pub fn host_depth_store_shader(msaa: MsaaSamples, options: &ShaderOptions) -> ShaderSource {
    let texture_type =
        if msaa == MsaaSamples::X1 { "texture_depth_2d" } else { "texture_depth_multisampled_2d" };
    let load = if msaa == MsaaSamples::X1 {
        "textureLoad(host_depth, pixel, 0)"
    } else {
        "textureLoad(host_depth, pixel, i32(guest_sample_to_host(MSAA, sample)))"
    };

    let mut wgsl = common::header(options);
    wgsl.push_str(common::TILE_LIBRARY);
    wgsl.push_str(&format!(
        "const MSAA: u32 = {}u;\n\
         struct HostDepthStoreConstants {{\n    rectangle: u32,\n    render_target: u32,\n}}\n\
         var<push_constant> constants: HostDepthStoreConstants;\n\
         @group(0) @binding(0) var<storage, read_write> edram: array<u32>;\n\
         @group(1) @binding(0) var host_depth: {texture_type};\n\
         fn load_host_depth(pixel: vec2<u32>, sample: vec2<u32>) -> f32 {{\n    \
         return {load};\n}}\n",
        msaa.bits(),
    ));
    wgsl.push_str(&format!(
        "\n@compute \
         @workgroup_size({HOST_DEPTH_STORE_GROUP_SIZE}, {HOST_DEPTH_STORE_GROUP_SIZE}, 1)\n"
    ));
    wgsl.push_str(HOST_DEPTH_STORE_MAIN);

    ShaderSource::new(host_depth_store_shader_name(msaa), naga::ShaderStage::Compute, wgsl)
}

const HOST_DEPTH_STORE_MAIN: &str = r"fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let rectangle = constants.rectangle;
    let origin = vec2<u32>(
        (rectangle & 0x3FFu) * 8u * SCALE_X,
        ((rectangle >> 10u) & 0x3FFu) * 8u * SCALE_Y,
    );
    let width = (((rectangle >> 20u) & 0x3FFu) + 1u) * 8u * SCALE_X;
    if (id.x >= width) {
        return;
    }
    let pixel = origin + id.xy;
    let render_target = constants.render_target;
    let surface = Surface(MSAA, false, true, render_target & 0x7FFu);
    let base_tiles = (render_target >> 11u) & 0x7FFu;
    let x_log2 = msaa_x_log2(MSAA);
    for (var i = 0u; i < (1u << MSAA); i = i + 1u) {
        let sample = vec2<u32>(i & ((1u << x_log2) - 1u), i >> x_log2);
        let depth = load_host_depth(pixel, sample);
        let tile_sample = pixel_to_tile_sample(surface, pixel, sample);
        let index = edram_dword_index(
            (base_tiles + tile_sample.tile) & EDRAM_TILE_COUNT_MASK,
            tile_sample.row,
            sample_dword_column(surface, tile_sample.column),
        );
        edram[index] = bitcast<u32>(depth);
    }
    return;
}
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::tiles::ResolutionScale;

    #[test]
    fn every_msaa_mode_validates() {
        for options in [
            ShaderOptions::default(),
            ShaderOptions {
                resolution_scale: ResolutionScale::new(2, 3),
                native_2x_msaa: false,
                ..ShaderOptions::default()
            },
        ] {
            for msaa in MsaaSamples::ALL {
                let source = host_depth_store_shader(msaa, &options);
                if let Err(err) = source.validate() {
                    panic!("{err}\n{}", source.wgsl);
                }
            }
        }
    }

    #[test]
    fn constants_pack() {
        let rectangle =
            HostDepthStoreRectangle(0).with_x_div_8(3).with_y_div_8(2).with_width_div_8_minus_1(19);
        let render_target =
            HostDepthStoreRenderTarget(0).with_pitch_tiles(16).with_base_tiles(2000);
        let constants = HostDepthStoreConstants::new(rectangle, render_target);
        assert_eq!(constants.rectangle, 3 | (2 << 10) | (19 << 20));
        assert_eq!(constants.render_target, 16 | (2000 << 11));
        assert_eq!(bytemuck::bytes_of(&constants).len(), 8);
    }

    #[test]
    fn group_count_scales() {
        let options = ShaderOptions {
            resolution_scale: ResolutionScale::new(3, 2),
            ..ShaderOptions::default()
        };
        assert_eq!(host_depth_store_group_count(20, 10, &options), (60, 20));
    }
}
