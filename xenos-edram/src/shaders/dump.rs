//! Compute shaders writing the contents of a host render target to the EDRAM buffer before a
//! resolve reads it

use crate::edram::tiles::{host_sample_count, ResolutionScale};
use crate::edram::RenderTargetFormat;
use crate::shaders::common::{self, wgsl_bool};
use crate::shaders::{ShaderOptions, ShaderSource};
use crate::xenos::{MsaaSamples, EDRAM_TILE_HEIGHT_SAMPLES, EDRAM_TILE_WIDTH_SAMPLES};
use bytemuck::{Pod, Zeroable};

// One invocation per sample, a 32bpp tile is two groups wide and 64bpp is one
pub const DUMP_SAMPLES_PER_GROUP_X: u32 = 40;
pub const DUMP_SAMPLES_PER_GROUP_Y: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DumpShaderKey {
    pub format: RenderTargetFormat,
    pub msaa: MsaaSamples,
}

impl DumpShaderKey {
    pub fn name(&self) -> String {
        let format = match self.format {
            RenderTargetFormat::Color(format) => format!("{format:?}"),
            RenderTargetFormat::Depth(format) => format!("{format:?}"),
        };
        format!("dump_{}_{}", format.to_lowercase(), self.msaa)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct DumpConstants {
    // Pitch of the resolve area
    pub dest_pitch_tiles: u32,
    // Pitch of the render target
    pub source_pitch_tiles: u32,
    pub source_base_tiles: u32,
    // Resolve area base plus the offset of the dispatch, may exceed the tile count
    pub first_tile: u32,
}

/// Work groups covering `width_tiles` by `height_tiles` tiles of a render target.
pub fn dump_group_count(
    is_64bpp: bool,
    width_tiles: u32,
    height_tiles: u32,
    scale: ResolutionScale,
) -> (u32, u32) {
    let tile_width_samples = (EDRAM_TILE_WIDTH_SAMPLES >> u32::from(is_64bpp)) * scale.x;
    let tile_height_samples = EDRAM_TILE_HEIGHT_SAMPLES * scale.y;
    (
        width_tiles * tile_width_samples / DUMP_SAMPLES_PER_GROUP_X,
        height_tiles * tile_height_samples / DUMP_SAMPLES_PER_GROUP_Y,
    )
}

pub fn dump_shader(key: &DumpShaderKey, options: &ShaderOptions) -> ShaderSource {
    let host_samples = host_sample_count(key.msaa, options.native_2x_msaa);

    let mut wgsl = common::prelude(options);
    wgsl.push_str(&format!(
        "const MSAA: u32 = {}u;\nconst IS_64BPP: bool = {};\nconst IS_DEPTH: bool = {};\n",
        key.msaa.bits(),
        wgsl_bool(key.format.is_64bpp()),
        wgsl_bool(key.format.is_depth()),
    ));
    wgsl.push_str(DUMP_BINDINGS);
    wgsl.push_str(&common::source_load(key.format, host_samples, 1, "load_source", options));
    wgsl.push_str(&format!(
        "\n@compute @workgroup_size({DUMP_SAMPLES_PER_GROUP_X}, {DUMP_SAMPLES_PER_GROUP_Y}, 1)\n"
    ));
    wgsl.push_str(DUMP_MAIN);

    ShaderSource::new(key.name(), naga::ShaderStage::Compute, wgsl)
}

const DUMP_BINDINGS: &str = r"
struct DumpConstants {
    dest_pitch_tiles: u32,
    source_pitch_tiles: u32,
    source_base_tiles: u32,
    first_tile: u32,
}

var<push_constant> constants: DumpConstants;

@group(0) @binding(0) var<storage, read_write> edram: array<u32>;
";

const DUMP_MAIN: &str = r"fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let surface = Surface(MSAA, IS_64BPP, IS_DEPTH, constants.source_pitch_tiles);
    let tile_width = tile_width_samples(surface) * SCALE_X;
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES * SCALE_Y;
    let column = id.x % tile_width;
    let row = id.y % tile_height;
    let edram_tile = (constants.first_tile
        + (id.y / tile_height) * constants.dest_pitch_tiles
        + id.x / tile_width) & EDRAM_TILE_COUNT_MASK;
    let source_tile = (edram_tile - constants.source_base_tiles) & EDRAM_TILE_COUNT_MASK;
    let source = tile_sample_to_pixel(surface, TileSample(source_tile, column, row));
    let packed = load_source(source.pixel, guest_sample_to_host(MSAA, source.sample));
    let dword = edram_dword_index(edram_tile, row, sample_dword_column(surface, column));
    edram[dword] = packed.x;
    if (IS_64BPP) {
        edram[dword + 1u] = packed.y;
    }
    return;
}
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};

    #[test]
    fn group_counts() {
        // 32bpp tiles are two groups wide, 16 rows are two groups high
        assert_eq!(dump_group_count(false, 3, 2, ResolutionScale::NATIVE), (6, 4));
        assert_eq!(dump_group_count(true, 3, 2, ResolutionScale::NATIVE), (3, 4));
        assert_eq!(dump_group_count(false, 1, 1, ResolutionScale::new(3, 2)), (6, 4));
    }

    #[test]
    fn every_key_validates() {
        let mut formats: Vec<_> = ColorRenderTargetFormat::ALL
            .into_iter()
            .filter(|format| format.resource_format() == *format)
            .map(RenderTargetFormat::Color)
            .collect();
        formats.extend(DepthRenderTargetFormat::ALL.into_iter().map(RenderTargetFormat::Depth));
        let scaled = ShaderOptions {
            resolution_scale: ResolutionScale::new(2, 2),
            ..ShaderOptions::default()
        };
        let emulated_2x = ShaderOptions { native_2x_msaa: false, ..ShaderOptions::default() };
        for options in [ShaderOptions::default(), scaled, emulated_2x] {
            for &format in &formats {
                for msaa in MsaaSamples::ALL {
                    let source = dump_shader(&DumpShaderKey { format, msaa }, &options);
                    if let Err(err) = source.validate() {
                        panic!("{err}\n{}", source.wgsl);
                    }
                }
            }
        }
    }

    #[test]
    fn compiles_to_spirv() {
        let key = DumpShaderKey {
            format: RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8),
            msaa: MsaaSamples::X4,
        };
        let spirv = dump_shader(&key, &ShaderOptions::default()).compile().unwrap();
        assert_eq!(spirv[0], 0x07230203);
        assert_eq!(key.name(), "dump_d24s8_4x");
    }
}
