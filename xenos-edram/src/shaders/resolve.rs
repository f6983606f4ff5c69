//! Compute shaders for resolves: copying an EDRAM area to guest memory with format conversion,
//! and clearing an EDRAM area

use crate::edram::resolve::{ResolveCopyShader, ResolveCopyShaderKind};
use crate::shaders::common::{self, wgsl_bool};
use crate::shaders::{ShaderOptions, ShaderSource};

pub const RESOLVE_GROUP_SIZE_PIXELS: u32 = 8;

const TEXTURE_TILING_LIBRARY: &str = r"
fn tiled_combine(outer_inner_bytes: u32, bank: u32, pipe: u32, y_lsb: u32) -> u32 {
    return (y_lsb << 4u) | (pipe << 6u) | (bank << 11u)
        | (outer_inner_bytes & 15u)
        | (((outer_inner_bytes >> 4u) & 1u) << 5u)
        | (((outer_inner_bytes >> 5u) & 7u) << 8u)
        | ((outer_inner_bytes >> 8u) << 12u);
}

fn tiled_2d(x: u32, y: u32, pitch_aligned: u32, bytes_per_block_log2: u32) -> u32 {
    let outer_blocks = ((y >> 5u) * (pitch_aligned >> 5u) + (x >> 5u)) << 6u;
    let inner_blocks = (((y >> 1u) & 7u) << 3u) | (x & 7u);
    let outer_inner_bytes = (outer_blocks | inner_blocks) << bytes_per_block_log2;
    let bank = (y >> 4u) & 1u;
    let pipe = ((x >> 3u) & 3u) ^ (((y >> 3u) & 1u) << 1u);
    return tiled_combine(outer_inner_bytes, bank, pipe, y & 1u);
}

fn tiled_3d(
    x: u32,
    y: u32,
    z: u32,
    pitch_aligned: u32,
    height_aligned: u32,
    bytes_per_block_log2: u32,
) -> u32 {
    let outer_blocks =
        ((((z >> 2u) * (height_aligned >> 4u) + (y >> 4u)) * (pitch_aligned >> 5u)) + (x >> 5u))
        << 7u;
    let inner_blocks = ((z & 3u) << 5u) | (((y >> 1u) & 3u) << 3u) | (x & 7u);
    let outer_inner_bytes = (outer_blocks | inner_blocks) << bytes_per_block_log2;
    let bank = ((y >> 3u) ^ (z >> 2u)) & 1u;
    let pipe = ((x >> 3u) & 3u) ^ (bank << 1u);
    return tiled_combine(outer_inner_bytes, bank, pipe, y & 1u);
}
";

// Resolve constants unpacking, the layouts of `ResolveEdramInfo`, `ResolveAddressInfo`,
// `RbCopyDestInfo` and `ResolveCopyDestPitchInfo`
const RESOLVE_LIBRARY: &str = r"
fn edram_base_tiles(edram_info: u32) -> u32 {
    return (edram_info >> 14u) & 0xFFFu;
}

fn edram_format(edram_info: u32) -> u32 {
    return (edram_info >> 26u) & 0xFu;
}

fn edram_duplicate_second_pixel(edram_info: u32) -> bool {
    return (edram_info >> 31u) != 0u;
}

fn resolve_local_origin(address_info: u32) -> vec2<u32> {
    return vec2<u32>((address_info & 0x1Fu) << 3u, ((address_info >> 5u) & 3u) << 3u);
}

fn resolve_size(address_info: u32) -> vec2<u32> {
    return vec2<u32>(((address_info >> 7u) & 0x3FFu) << 3u, ((address_info >> 17u) & 0x3FFu) << 3u);
}

fn resolve_sample_select(address_info: u32) -> u32 {
    return (address_info >> 27u) & 7u;
}

// Guest sample numbering within a pixel, bit 0 vertical and bit 1 horizontal
fn guest_sample(sample_index: u32) -> vec2<u32> {
    return vec2<u32>((sample_index >> 1u) & 1u, sample_index & 1u);
}

fn source_host_pixel(edram_pixel: vec2<u32>, sub_pixel: vec2<u32>, duplicate: bool) -> vec2<u32> {
    var host_pixel = edram_pixel * vec2<u32>(SCALE_X, SCALE_Y) + sub_pixel;
    // The first host column and row are left undrawn by the half-pixel offset
    if (duplicate) {
        if (SCALE_X > 1u && host_pixel.x == 0u) {
            host_pixel.x = 1u;
        }
        if (SCALE_Y > 1u && host_pixel.y == 0u) {
            host_pixel.y = 1u;
        }
    }
    return host_pixel;
}

fn load_edram_sample(
    surface: Surface,
    base_tiles: u32,
    host_pixel: vec2<u32>,
    sample: vec2<u32>,
) -> vec2<u32> {
    let tile_sample = pixel_to_tile_sample(surface, host_pixel, sample);
    let index = edram_dword_index(
        base_tiles + tile_sample.tile,
        tile_sample.row,
        sample_dword_column(surface, tile_sample.column),
    );
    var packed = vec2<u32>(edram[index], 0u);
    if (surface.is_64bpp) {
        packed.y = edram[index + 1u];
    }
    return packed;
}

fn endian_swap_32(value: u32, endian: u32) -> u32 {
    var swapped = value;
    if (endian == 1u) {
        swapped = ((value & 0x00FF00FFu) << 8u) | ((value >> 8u) & 0x00FF00FFu);
    } else if (endian == 2u || endian == 4u || endian == 5u) {
        swapped = (value << 24u) | ((value & 0xFF00u) << 8u) | ((value >> 8u) & 0xFF00u)
            | (value >> 24u);
    } else if (endian == 3u) {
        swapped = (value << 16u) | (value >> 16u);
    }
    return swapped;
}

fn dest_tiled_offset(pixel: vec2<u32>, dest_info: u32, dest_pitch_aligned: u32) -> u32 {
    let pitch_aligned = (dest_pitch_aligned & 0x3FFu) << 5u;
    let height_aligned = ((dest_pitch_aligned >> 10u) & 0x3FFu) << 5u;
    if (((dest_info >> 3u) & 1u) != 0u) {
        let slice = (dest_info >> 4u) & 7u;
        return tiled_3d(pixel.x, pixel.y, slice, pitch_aligned, height_aligned, DEST_BPP_LOG2);
    }
    return tiled_2d(pixel.x, pixel.y, pitch_aligned, DEST_BPP_LOG2);
}

fn write_dest(first_dword: u32, sub_pixel: vec2<u32>, dwords: vec4<u32>, endian: u32) {
    var swapped = vec4<u32>(
        endian_swap_32(dwords.x, endian),
        endian_swap_32(dwords.y, endian),
        endian_swap_32(dwords.z, endian),
        endian_swap_32(dwords.w, endian),
    );
    if (endian == 4u && DEST_DWORDS >= 2u) {
        swapped = swapped.yxwz;
    }
    if (endian == 5u && DEST_DWORDS == 4u) {
        swapped = swapped.wzyx;
    }
    for (var i = 0u; i < DEST_DWORDS; i = i + 1u) {
        var index = first_dword + i;
        if (SCALED) {
            // Every guest dword is followed by the dwords of the other host pixels covering it
            index = index * (SCALE_X * SCALE_Y) + sub_pixel.y * SCALE_X + sub_pixel.x;
        }
        dest[index] = swapped[i];
    }
    return;
}
";

// Conversions for the full resolve shaders
const CONVERSION_LIBRARY: &str = r"
fn snorm16_to_f32(bits: u32) -> f32 {
    let value = f32(max(i32(bits << 16u) >> 16u, -32767)) / 32767.0;
    if (EDRAM_16_AS_MINUS_1_TO_1) {
        return value;
    }
    return value * 32.0;
}

fn f32_to_snorm16(value: f32) -> u32 {
    let clamped = select(clamp(value, -32.0, 32.0), 0.0, is_nan_f32(value));
    return u32(i32(round(clamped * (32767.0 / 32.0)))) & 0xFFFFu;
}

fn unorm_bits(value: f32, bits: u32) -> u32 {
    return unorm_to_bits(value, f32((1u << bits) - 1u));
}

fn decode_edram_color(packed: vec2<u32>, format: u32) -> vec4<f32> {
    var value = vec4<f32>(0.0, 0.0, 0.0, 1.0);
    switch (format) {
        case 0u, 1u: {
            value = decode_8888(packed.x);
        }
        case 2u, 10u: {
            value = decode_2_10_10_10(packed.x);
        }
        case 3u, 12u: {
            value = decode_2_10_10_10_float(packed.x);
        }
        case 4u: {
            value = vec4<f32>(snorm16_to_f32(packed.x), snorm16_to_f32(packed.x >> 16u), 0.0, 1.0);
        }
        case 5u: {
            value = vec4<f32>(
                snorm16_to_f32(packed.x),
                snorm16_to_f32(packed.x >> 16u),
                snorm16_to_f32(packed.y),
                snorm16_to_f32(packed.y >> 16u),
            );
        }
        case 6u: {
            value = vec4<f32>(unpack2x16float(packed.x), 0.0, 1.0);
        }
        case 7u: {
            value = vec4<f32>(unpack2x16float(packed.x), unpack2x16float(packed.y));
        }
        case 14u: {
            value = vec4<f32>(bitcast<f32>(packed.x), 0.0, 0.0, 1.0);
        }
        case 15u: {
            value = vec4<f32>(bitcast<f32>(packed.x), bitcast<f32>(packed.y), 0.0, 1.0);
        }
        default: {}
    }
    return value;
}

fn resolve_pixel(
    surface: Surface,
    edram_info: u32,
    edram_pixel: vec2<u32>,
    sub_pixel: vec2<u32>,
    sample_select: u32,
) -> vec4<f32> {
    let host_pixel =
        source_host_pixel(edram_pixel, sub_pixel, edram_duplicate_second_pixel(edram_info));
    var first_sample = sample_select;
    var sample_count = 1u;
    switch (sample_select) {
        case 4u: {
            first_sample = 0u;
            sample_count = 2u;
        }
        case 5u: {
            first_sample = 2u;
            sample_count = 2u;
        }
        case 6u, 7u: {
            first_sample = 0u;
            sample_count = 4u;
        }
        default: {}
    }
    var sum = vec4<f32>(0.0);
    for (var i = 0u; i < sample_count; i = i + 1u) {
        let packed = load_edram_sample(
            surface,
            edram_base_tiles(edram_info),
            host_pixel,
            guest_sample(first_sample + i),
        );
        sum = sum + decode_edram_color(packed, edram_format(edram_info));
    }
    return sum / f32(sample_count);
}
";

// Guest texture formats by bits per pixel, components from the lowest bits up
const PACK_8BPP: &str = r"
fn pack_dest(value: vec4<f32>, format: u32) -> u32 {
    return unorm_bits(value.x, 8u);
}
";

const PACK_16BPP: &str = r"
fn pack_dest(value: vec4<f32>, format: u32) -> u32 {
    var packed = 0u;
    switch (format) {
        case 3u: {
            packed = unorm_bits(value.x, 5u) | (unorm_bits(value.y, 5u) << 5u)
                | (unorm_bits(value.z, 5u) << 10u) | (unorm_bits(value.w, 1u) << 15u);
        }
        case 4u: {
            packed = unorm_bits(value.x, 5u) | (unorm_bits(value.y, 6u) << 5u)
                | (unorm_bits(value.z, 5u) << 11u);
        }
        case 5u: {
            packed = unorm_bits(value.x, 5u) | (unorm_bits(value.y, 5u) << 5u)
                | (unorm_bits(value.z, 6u) << 10u);
        }
        case 10u: {
            packed = unorm_bits(value.x, 8u) | (unorm_bits(value.y, 8u) << 8u);
        }
        case 15u: {
            packed = unorm_bits(value.x, 4u) | (unorm_bits(value.y, 4u) << 4u)
                | (unorm_bits(value.z, 4u) << 8u) | (unorm_bits(value.w, 4u) << 12u);
        }
        case 24u: {
            packed = f32_to_snorm16(value.x);
        }
        case 30u: {
            packed = pack2x16float(vec2<f32>(value.x, 0.0)) & 0xFFFFu;
        }
        default: {}
    }
    return packed;
}
";

const PACK_32BPP: &str = r"
fn pack_dest(value: vec4<f32>, format: u32) -> u32 {
    var packed = 0u;
    switch (format) {
        case 6u: {
            packed = encode_8888(value);
        }
        case 7u: {
            packed = encode_2_10_10_10(value);
        }
        case 16u: {
            packed = unorm_bits(value.x, 11u) | (unorm_bits(value.y, 11u) << 11u)
                | (unorm_bits(value.z, 10u) << 22u);
        }
        case 17u: {
            packed = unorm_bits(value.x, 10u) | (unorm_bits(value.y, 11u) << 10u)
                | (unorm_bits(value.z, 11u) << 21u);
        }
        case 22u: {
            packed = f32_to_unorm24(value.x) << 8u;
        }
        case 23u: {
            packed = f32_to_20e4(value.x, false) << 8u;
        }
        case 25u: {
            packed = f32_to_snorm16(value.x) | (f32_to_snorm16(value.y) << 16u);
        }
        case 31u: {
            packed = pack2x16float(value.xy);
        }
        case 36u: {
            packed = bitcast<u32>(value.x);
        }
        case 62u: {
            packed = encode_2_10_10_10_float(value);
        }
        default: {}
    }
    return packed;
}
";

const PACK_64BPP: &str = r"
fn pack_dest(value: vec4<f32>, format: u32) -> vec2<u32> {
    var packed = vec2<u32>(0u, 0u);
    switch (format) {
        case 26u: {
            packed = vec2<u32>(
                f32_to_snorm16(value.x) | (f32_to_snorm16(value.y) << 16u),
                f32_to_snorm16(value.z) | (f32_to_snorm16(value.w) << 16u),
            );
        }
        case 32u: {
            packed = vec2<u32>(pack2x16float(value.xy), pack2x16float(value.zw));
        }
        case 37u: {
            packed = bitcast<vec2<u32>>(value.xy);
        }
        default: {}
    }
    return packed;
}
";

const PACK_128BPP: &str = r"
fn pack_dest(value: vec4<f32>, format: u32) -> vec4<u32> {
    return bitcast<vec4<u32>>(value);
}
";

struct CopyLayout {
    dest_bpp_log2: u32,
    dest_dwords: u32,
    pixels_per_invocation: u32,
}

fn copy_layout(kind: ResolveCopyShaderKind) -> CopyLayout {
    match kind {
        ResolveCopyShaderKind::Fast { source_is_64bpp } => CopyLayout {
            dest_bpp_log2: 2 + u32::from(source_is_64bpp),
            dest_dwords: 1 + u32::from(source_is_64bpp),
            pixels_per_invocation: 1,
        },
        ResolveCopyShaderKind::Full { dest_bytes_per_pixel_log2 } => CopyLayout {
            dest_bpp_log2: dest_bytes_per_pixel_log2,
            dest_dwords: (1 << dest_bytes_per_pixel_log2) / 4
                + u32::from(dest_bytes_per_pixel_log2 < 2),
            pixels_per_invocation: 4 >> dest_bytes_per_pixel_log2.min(2),
        },
    }
}

fn copy_constants_struct(scaled: bool) -> &'static str {
    if scaled {
        "struct ResolveCopyConstants {\n    edram_info: u32,\n    address_info: u32,\n    \
         dest_info: u32,\n    dest_pitch_aligned: u32,\n}\n"
    } else {
        "struct ResolveCopyConstants {\n    edram_info: u32,\n    address_info: u32,\n    \
         dest_info: u32,\n    dest_pitch_aligned: u32,\n    dest_base: u32,\n}\n"
    }
}

/// Surface of the EDRAM side of a copy. The 4x fast shaders are specialized for 4x, the 1x/2x
/// ones for at most 2x.
fn edram_surface_fn(shader: ResolveCopyShader) -> String {
    use ResolveCopyShader::*;
    let msaa = match shader {
        Fast32bpp4xMsaa | Fast64bpp4xMsaa => "2u",
        Fast32bpp1x2xMsaa | Fast64bpp1x2xMsaa => "min((edram_info >> 11u) & 3u, 1u)",
        _ => "(edram_info >> 11u) & 3u",
    };
    format!(
        "fn edram_surface(edram_info: u32) -> Surface {{\n    \
         return Surface(\n        \
         {msaa},\n        \
         ((edram_info >> 30u) & 1u) != 0u,\n        \
         ((edram_info >> 13u) & 1u) != 0u,\n        \
         edram_info & 0x7FFu,\n    \
         );\n}}\n"
    )
}

const COPY_MAIN_PROLOGUE: &str = r"fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let edram_info = constants.edram_info;
    let address_info = constants.address_info;
    let dest_info = constants.dest_info;
    let surface = edram_surface(edram_info);
    let local = resolve_local_origin(address_info);
    let size = resolve_size(address_info);
    let sub_pixel = vec2<u32>(id.x % SCALE_X, id.y % SCALE_Y);
    let first_pixel = vec2<u32>((id.x / SCALE_X) * PIXELS_PER_INVOCATION, id.y / SCALE_Y);
    if (first_pixel.x >= size.x || first_pixel.y >= size.y) {
        return;
    }
    // The destination base points to the 32x32 texture tile containing the rectangle origin
    let dest_pixel = vec2<u32>((local.x & 31u) + first_pixel.x, local.y + first_pixel.y);
    let dest_offset = dest_tiled_offset(dest_pixel, dest_info, constants.dest_pitch_aligned);
";

const FAST_COPY_BODY: &str = r"    let selected_sample =
        guest_sample(resolve_sample_select(address_info) & 3u);
    let duplicate_second_pixel = edram_duplicate_second_pixel(edram_info);
    let host_pixel = source_host_pixel(local + first_pixel, sub_pixel, duplicate_second_pixel);
    let base_tiles = edram_base_tiles(edram_info);
    let packed = load_edram_sample(surface, base_tiles, host_pixel, selected_sample);
    let dwords = vec4<u32>(packed, 0u, 0u);
";

fn full_copy_body(dest_dwords: u32, pixels_per_invocation: u32) -> String {
    let mut body = String::from(
        "    let sample_select = resolve_sample_select(address_info);\n    \
         let exp_scale = exp2(f32(i32(dest_info << 10u) >> 26u));\n    \
         let swap_red_blue = ((dest_info >> 24u) & 1u) != 0u;\n    \
         let dest_format = (dest_info >> 7u) & 0x3Fu;\n",
    );
    let accumulate = match (dest_dwords, pixels_per_invocation) {
        (1, 1) => "packed = pack_dest(value, dest_format);",
        (1, _) => {
            "packed = packed | \
             (pack_dest(value, dest_format) << (i * (32u / PIXELS_PER_INVOCATION)));"
        }
        _ => "packed = pack_dest(value, dest_format);",
    };
    let packed_type = match dest_dwords {
        1 => "u32",
        2 => "vec2<u32>",
        _ => "vec4<u32>",
    };
    let dwords = match dest_dwords {
        1 => "vec4<u32>(packed, 0u, 0u, 0u)",
        2 => "vec4<u32>(packed, 0u, 0u)",
        _ => "packed",
    };
    body.push_str(&format!(
        "    var packed: {packed_type};\n    \
         for (var i = 0u; i < PIXELS_PER_INVOCATION; i = i + 1u) {{\n        \
         let pixel = local + first_pixel + vec2<u32>(i, 0u);\n        \
         var value = resolve_pixel(surface, edram_info, pixel, sub_pixel, sample_select);\n        \
         value = value * exp_scale;\n        \
         if (swap_red_blue) {{\n            value = value.zyxw;\n        }}\n        \
         {accumulate}\n    \
         }}\n    \
         let dwords = {dwords};\n"
    ));
    body
}

pub fn resolve_copy_shader(shader: ResolveCopyShader, options: &ShaderOptions) -> ShaderSource {
    let kind = shader.kind();
    let scaled = shader.is_scaled();
    let layout = copy_layout(kind);

    let mut wgsl = common::prelude(options);
    wgsl.push_str(TEXTURE_TILING_LIBRARY);
    wgsl.push_str(&format!(
        "const SCALED: bool = {};\nconst DEST_BPP_LOG2: u32 = {}u;\nconst DEST_DWORDS: u32 = {}u;\n\
         const PIXELS_PER_INVOCATION: u32 = {}u;\nconst EDRAM_16_AS_MINUS_1_TO_1: bool = {};\n",
        wgsl_bool(scaled),
        layout.dest_bpp_log2,
        layout.dest_dwords,
        layout.pixels_per_invocation,
        wgsl_bool(options.edram_16_as_minus_1_to_1),
    ));
    wgsl.push_str(copy_constants_struct(scaled));
    wgsl.push_str(
        "var<push_constant> constants: ResolveCopyConstants;\n\
         @group(0) @binding(0) var<storage, read> edram: array<u32>;\n\
         @group(1) @binding(0) var<storage, read_write> dest: array<u32>;\n",
    );
    wgsl.push_str(&edram_surface_fn(shader));
    wgsl.push_str(RESOLVE_LIBRARY);

    let body = match kind {
        ResolveCopyShaderKind::Fast { .. } => FAST_COPY_BODY.to_owned(),
        ResolveCopyShaderKind::Full { dest_bytes_per_pixel_log2 } => {
            wgsl.push_str(CONVERSION_LIBRARY);
            wgsl.push_str(match dest_bytes_per_pixel_log2 {
                0 => PACK_8BPP,
                1 => PACK_16BPP,
                2 => PACK_32BPP,
                3 => PACK_64BPP,
                _ => PACK_128BPP,
            });
            full_copy_body(layout.dest_dwords, layout.pixels_per_invocation)
        }
    };

    let first_dword =
        if scaled { "dest_offset >> 2u" } else { "(constants.dest_base + dest_offset) >> 2u" };
    wgsl.push_str(&format!(
        "\n@compute @workgroup_size({}, {RESOLVE_GROUP_SIZE_PIXELS}, 1)\n\
         {COPY_MAIN_PROLOGUE}{body}    \
         write_dest({first_dword}, sub_pixel, dwords, dest_info & 7u);\n    return;\n}}\n",
        RESOLVE_GROUP_SIZE_PIXELS / layout.pixels_per_invocation,
    ));

    ShaderSource::new(shader.name(), naga::ShaderStage::Compute, wgsl)
}

const CLEAR_MAIN: &str = r"fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let edram_info = constants.edram_info;
    let surface = Surface(
        (edram_info >> 11u) & 3u,
        IS_64BPP,
        ((edram_info >> 13u) & 1u) != 0u,
        edram_info & 0x7FFu,
    );
    let local = resolve_local_origin(constants.address_info);
    let size = resolve_size(constants.address_info);
    let x_log2 = msaa_x_log2(surface.msaa);
    let y_log2 = msaa_y_log2(surface.msaa);
    let sample_y = (local.y << y_log2) + id.y;
    if (sample_y >= ((local.y + size.y) << y_log2)) {
        return;
    }
    let sample_x_end = (local.x + size.x) << x_log2;
    let tile_width = tile_width_samples(surface);
    let tile_row = sample_y / EDRAM_TILE_HEIGHT_SAMPLES;
    let row = sample_y % EDRAM_TILE_HEIGHT_SAMPLES;
    for (var i = 0u; i < 8u; i = i + 1u) {
        let sample_x = (local.x << x_log2) + id.x * 8u + i;
        if (sample_x >= sample_x_end) {
            break;
        }
        let tile =
            edram_base_tiles(edram_info) + tile_row * surface.pitch_tiles + sample_x / tile_width;
        let column = sample_x % tile_width;
        for (var y = 0u; y < SCALE_Y; y = y + 1u) {
            for (var x = 0u; x < SCALE_X; x = x + 1u) {
                let index = edram_dword_index(
                    tile,
                    row * SCALE_Y + y,
                    sample_dword_column(surface, column * SCALE_X + x),
                );
                edram[index] = constants.clear_value_low;
                if (IS_64BPP) {
                    edram[index + 1u] = constants.clear_value_high;
                }
            }
        }
    }
    return;
}
";

pub fn resolve_clear_shader_name(is_64bpp: bool) -> &'static str {
    if is_64bpp {
        "resolve_clear_64bpp"
    } else {
        "resolve_clear_32bpp"
    }
}

/// Clears the resolve area, 8 samples of a row per invocation. Depth and 32bpp color share the
/// 32bpp shader.
pub fn resolve_clear_shader(is_64bpp: bool, options: &ShaderOptions) -> ShaderSource {
    let mut wgsl = common::header(options);
    wgsl.push_str(common::TILE_LIBRARY);
    wgsl.push_str(&format!(
        "const IS_64BPP: bool = {};\n\
         struct ResolveClearConstants {{\n    \
         clear_value_low: u32,\n    clear_value_high: u32,\n    \
         edram_info: u32,\n    address_info: u32,\n}}\n\
         var<push_constant> constants: ResolveClearConstants;\n\
         @group(0) @binding(0) var<storage, read_write> edram: array<u32>;\n\
         fn edram_base_tiles(edram_info: u32) -> u32 {{\n    \
         return (edram_info >> 14u) & 0xFFFu;\n}}\n\
         fn resolve_local_origin(address_info: u32) -> vec2<u32> {{\n    \
         return vec2<u32>((address_info & 0x1Fu) << 3u, ((address_info >> 5u) & 3u) << 3u);\n}}\n\
         fn resolve_size(address_info: u32) -> vec2<u32> {{\n    \
         let width = ((address_info >> 7u) & 0x3FFu) << 3u;\n    \
         return vec2<u32>(width, ((address_info >> 17u) & 0x3FFu) << 3u);\n}}\n\
         \n@compute @workgroup_size(8, 8, 1)\n{CLEAR_MAIN}",
        wgsl_bool(is_64bpp),
    ));
    ShaderSource::new(resolve_clear_shader_name(is_64bpp), naga::ShaderStage::Compute, wgsl)
}
