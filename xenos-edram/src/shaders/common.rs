//! WGSL shared by the generated shaders: EDRAM tile addressing and the guest pixel encodings,
//! matching `edram::tiles` and `edram::formats` bit for bit

use crate::edram::formats::{ColorEncoding, DepthEncoding, HostValueKind};
use crate::edram::RenderTargetFormat;
use crate::shaders::ShaderOptions;

pub const TILE_LIBRARY: &str = r"
const EDRAM_TILE_WIDTH_SAMPLES: u32 = 80u;
const EDRAM_TILE_HALF_WIDTH_SAMPLES: u32 = 40u;
const EDRAM_TILE_HEIGHT_SAMPLES: u32 = 16u;
const EDRAM_TILE_COUNT_MASK: u32 = 2047u;
const EDRAM_TILE_DWORDS: u32 =
    EDRAM_TILE_WIDTH_SAMPLES * SCALE_X * EDRAM_TILE_HEIGHT_SAMPLES * SCALE_Y;

struct Surface {
    // 0 for 1x, 1 for 2x, 2 for 4x
    msaa: u32,
    is_64bpp: bool,
    is_depth: bool,
    pitch_tiles: u32,
}

struct TileSample {
    tile: u32,
    column: u32,
    row: u32,
}

struct PixelSample {
    pixel: vec2<u32>,
    sample: vec2<u32>,
}

fn msaa_x_log2(msaa: u32) -> u32 {
    return select(0u, 1u, msaa >= 2u);
}

fn msaa_y_log2(msaa: u32) -> u32 {
    return select(0u, 1u, msaa >= 1u);
}

fn guest_sample_to_host(msaa: u32, sample: vec2<u32>) -> u32 {
    if (msaa == 0u) {
        return 0u;
    }
    if (msaa == 1u) {
        if (NATIVE_2X_MSAA) {
            return sample.y ^ 1u;
        }
        return sample.y * 3u;
    }
    return sample.x | (sample.y << 1u);
}

fn host_sample_to_guest(msaa: u32, host_sample: u32) -> vec2<u32> {
    if (msaa == 0u) {
        return vec2<u32>(0u, 0u);
    }
    if (msaa == 1u) {
        if (NATIVE_2X_MSAA) {
            return vec2<u32>(0u, (host_sample & 1u) ^ 1u);
        }
        return vec2<u32>(0u, (host_sample >> 1u) & 1u);
    }
    return vec2<u32>(host_sample & 1u, (host_sample >> 1u) & 1u);
}

fn tile_width_samples(surface: Surface) -> u32 {
    return EDRAM_TILE_WIDTH_SAMPLES >> select(0u, 1u, surface.is_64bpp);
}

fn pixel_to_tile_sample(surface: Surface, pixel: vec2<u32>, sample: vec2<u32>) -> TileSample {
    let sample_x = (pixel.x << msaa_x_log2(surface.msaa)) | sample.x;
    let sample_y = (pixel.y << msaa_y_log2(surface.msaa)) | sample.y;
    let tile_width = tile_width_samples(surface) * SCALE_X;
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES * SCALE_Y;
    return TileSample(
        (sample_y / tile_height) * surface.pitch_tiles + sample_x / tile_width,
        sample_x % tile_width,
        sample_y % tile_height,
    );
}

fn tile_sample_to_pixel(surface: Surface, tile_sample: TileSample) -> PixelSample {
    let tile_width = tile_width_samples(surface) * SCALE_X;
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES * SCALE_Y;
    let sample_x = (tile_sample.tile % surface.pitch_tiles) * tile_width + tile_sample.column;
    let sample_y = (tile_sample.tile / surface.pitch_tiles) * tile_height + tile_sample.row;
    let x_log2 = msaa_x_log2(surface.msaa);
    let y_log2 = msaa_y_log2(surface.msaa);
    return PixelSample(
        vec2<u32>(sample_x >> x_log2, sample_y >> y_log2),
        vec2<u32>(sample_x & ((1u << x_log2) - 1u), sample_y & ((1u << y_log2) - 1u)),
    );
}

fn swap_depth_columns(dword_column: u32, is_depth: bool) -> u32 {
    if (!is_depth) {
        return dword_column;
    }
    let half = EDRAM_TILE_HALF_WIDTH_SAMPLES * SCALE_X;
    return (dword_column + half) % (half * 2u);
}

// First dword column of the sample in a sample column
fn sample_dword_column(surface: Surface, column: u32) -> u32 {
    if (surface.is_64bpp) {
        return column * 2u;
    }
    return swap_depth_columns(column, surface.is_depth);
}

// Sample column holding a dword column, and which half of the sample it is
fn dword_sample_column(surface: Surface, dword_column: u32) -> vec2<u32> {
    if (surface.is_64bpp) {
        return vec2<u32>(dword_column >> 1u, dword_column & 1u);
    }
    return vec2<u32>(swap_depth_columns(dword_column, surface.is_depth), 0u);
}

fn edram_dword_index(tile: u32, row: u32, dword_column: u32) -> u32 {
    return (tile & EDRAM_TILE_COUNT_MASK) * EDRAM_TILE_DWORDS
        + row * EDRAM_TILE_WIDTH_SAMPLES * SCALE_X
        + dword_column;
}
";

pub const FORMAT_LIBRARY: &str = r"
fn is_nan_f32(value: f32) -> bool {
    return (bitcast<u32>(value) & 0x7FFFFFFFu) > 0x7F800000u;
}

fn unorm_to_bits(value: f32, max_value: f32) -> u32 {
    let clamped = select(clamp(value, 0.0, 1.0), 0.0, is_nan_f32(value));
    return u32(clamped * max_value + 0.5);
}

fn pack_16_16(low: u32, high: u32) -> u32 {
    return (low & 0xFFFFu) | (high << 16u);
}

fn encode_8888(rgba: vec4<f32>) -> u32 {
    return unorm_to_bits(rgba.x, 255.0)
        | (unorm_to_bits(rgba.y, 255.0) << 8u)
        | (unorm_to_bits(rgba.z, 255.0) << 16u)
        | (unorm_to_bits(rgba.w, 255.0) << 24u);
}

fn decode_8888(packed: u32) -> vec4<f32> {
    return vec4<f32>(
        f32(packed & 0xFFu),
        f32((packed >> 8u) & 0xFFu),
        f32((packed >> 16u) & 0xFFu),
        f32(packed >> 24u),
    ) / 255.0;
}

fn encode_2_10_10_10(rgba: vec4<f32>) -> u32 {
    return unorm_to_bits(rgba.x, 1023.0)
        | (unorm_to_bits(rgba.y, 1023.0) << 10u)
        | (unorm_to_bits(rgba.z, 1023.0) << 20u)
        | (unorm_to_bits(rgba.w, 3.0) << 30u);
}

fn decode_2_10_10_10(packed: u32) -> vec4<f32> {
    return vec4<f32>(
        f32(packed & 0x3FFu) / 1023.0,
        f32((packed >> 10u) & 0x3FFu) / 1023.0,
        f32((packed >> 20u) & 0x3FFu) / 1023.0,
        f32(packed >> 30u) / 3.0,
    );
}

fn f32_to_7e3(value: f32) -> u32 {
    let clamped = select(min(value, 31.875), 0.0, is_nan_f32(value) || value <= 0.0);
    var bits = bitcast<u32>(clamped);
    if (bits < 0x3E800000u) {
        let shift = min(125u - (bits >> 23u), 24u);
        bits = (0x800000u | (bits & 0x7FFFFFu)) >> shift;
    } else {
        bits = bits - (124u << 23u);
    }
    return ((bits + 0x7FFFu + ((bits >> 16u) & 1u)) >> 16u) & 0x3FFu;
}

fn f7e3_to_f32(value: u32) -> f32 {
    var mantissa = value & 0x7Fu;
    var exponent = (value >> 7u) & 0x7u;
    if (exponent == 0u) {
        if (mantissa == 0u) {
            return 0.0;
        }
        let shift = 7u - (31u - countLeadingZeros(mantissa));
        exponent = 1u - shift;
        mantissa = (mantissa << shift) & 0x7Fu;
    }
    return bitcast<f32>(((exponent + 124u) << 23u) | (mantissa << 16u));
}

fn encode_2_10_10_10_float(rgba: vec4<f32>) -> u32 {
    return f32_to_7e3(rgba.x)
        | (f32_to_7e3(rgba.y) << 10u)
        | (f32_to_7e3(rgba.z) << 20u)
        | (unorm_to_bits(rgba.w, 3.0) << 30u);
}

fn decode_2_10_10_10_float(packed: u32) -> vec4<f32> {
    return vec4<f32>(
        f7e3_to_f32(packed & 0x3FFu),
        f7e3_to_f32((packed >> 10u) & 0x3FFu),
        f7e3_to_f32((packed >> 20u) & 0x3FFu),
        f32(packed >> 30u) / 3.0,
    );
}

fn f32_to_20e4(value: f32, round_to_nearest_even: bool) -> u32 {
    let max_value = bitcast<f32>(0x3FFFFFF8u);
    let clamped = select(min(value, max_value), 0.0, is_nan_f32(value) || value <= 0.0);
    var bits = bitcast<u32>(clamped);
    if (bits < 0x38800000u) {
        let shift = min(113u - (bits >> 23u), 24u);
        bits = (0x800000u | (bits & 0x7FFFFFu)) >> shift;
    } else {
        bits = bits - (112u << 23u);
    }
    if (round_to_nearest_even) {
        bits = bits + 3u + ((bits >> 3u) & 1u);
    }
    return (bits >> 3u) & 0xFFFFFFu;
}

fn f20e4_to_f32(value: u32) -> f32 {
    var mantissa = value & 0xFFFFFu;
    var exponent = (value >> 20u) & 0xFu;
    if (exponent == 0u) {
        if (mantissa == 0u) {
            return 0.0;
        }
        let shift = 20u - (31u - countLeadingZeros(mantissa));
        exponent = 1u - shift;
        mantissa = (mantissa << shift) & 0xFFFFFu;
    }
    return bitcast<f32>(((exponent + 112u) << 23u) | (mantissa << 3u));
}

fn f32_to_unorm24(value: f32) -> u32 {
    let clamped = select(clamp(value, 0.0, 1.0), 0.0, is_nan_f32(value));
    // round() is ties-to-even
    return u32(round(clamped * 16777215.0));
}

fn unorm24_to_f32(value: u32) -> f32 {
    return f32(value & 0xFFFFFFu) / 16777215.0;
}
";

/// Module-scope constants the libraries are parameterized with.
pub fn header(options: &ShaderOptions) -> String {
    format!(
        "const SCALE_X: u32 = {}u;\nconst SCALE_Y: u32 = {}u;\nconst NATIVE_2X_MSAA: bool = {};\n",
        options.resolution_scale.x, options.resolution_scale.y, options.native_2x_msaa
    )
}

/// Header followed by both libraries.
pub fn prelude(options: &ShaderOptions) -> String {
    let mut wgsl = header(options);
    wgsl.push_str(TILE_LIBRARY);
    wgsl.push_str(FORMAT_LIBRARY);
    wgsl
}

pub fn wgsl_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Scalar type that host views of the format read and write.
pub fn host_scalar_type(format: RenderTargetFormat) -> &'static str {
    match format {
        RenderTargetFormat::Color(format) => match ColorEncoding::of(format).host_value_kind() {
            HostValueKind::Float => "f32",
            HostValueKind::Uint => "u32",
        },
        RenderTargetFormat::Depth(_) => "f32",
    }
}

/// `fn {name}(value: vec4<T>) -> vec2<u32>` packing a host color into EDRAM dwords.
pub fn color_encode_fn(encoding: ColorEncoding, name: &str) -> String {
    let (value_type, body) = match encoding {
        ColorEncoding::Unorm8888 => ("f32", "vec2<u32>(encode_8888(value), 0u)"),
        ColorEncoding::Unorm2_10_10_10 => ("f32", "vec2<u32>(encode_2_10_10_10(value), 0u)"),
        ColorEncoding::Float7e3 => ("f32", "vec2<u32>(encode_2_10_10_10_float(value), 0u)"),
        ColorEncoding::Raw16x2 => ("u32", "vec2<u32>(pack_16_16(value.x, value.y), 0u)"),
        ColorEncoding::Raw16x4 => {
            ("u32", "vec2<u32>(pack_16_16(value.x, value.y), pack_16_16(value.z, value.w))")
        }
        ColorEncoding::Raw32x1 => ("u32", "vec2<u32>(value.x, 0u)"),
        ColorEncoding::Raw32x2 => ("u32", "value.xy"),
    };
    format!("fn {name}(value: vec4<{value_type}>) -> vec2<u32> {{\n    return {body};\n}}\n")
}

/// `fn {name}(packed: vec2<u32>) -> vec4<T>` unpacking EDRAM dwords into a host color.
pub fn color_decode_fn(encoding: ColorEncoding, name: &str) -> String {
    let (value_type, body) = match encoding {
        ColorEncoding::Unorm8888 => ("f32", "decode_8888(packed.x)"),
        ColorEncoding::Unorm2_10_10_10 => ("f32", "decode_2_10_10_10(packed.x)"),
        ColorEncoding::Float7e3 => ("f32", "decode_2_10_10_10_float(packed.x)"),
        ColorEncoding::Raw16x2 => {
            ("u32", "vec4<u32>(packed.x & 0xFFFFu, packed.x >> 16u, 0u, 0u)")
        }
        ColorEncoding::Raw16x4 => (
            "u32",
            "vec4<u32>(packed.x & 0xFFFFu, packed.x >> 16u, packed.y & 0xFFFFu, packed.y >> 16u)",
        ),
        ColorEncoding::Raw32x1 => ("u32", "vec4<u32>(packed.x, 0u, 0u, 0u)"),
        ColorEncoding::Raw32x2 => ("u32", "vec4<u32>(packed.x, packed.y, 0u, 0u)"),
    };
    format!("fn {name}(packed: vec2<u32>) -> vec4<{value_type}> {{\n    return {body};\n}}\n")
}

/// `fn {name}(depth: f32) -> u32` converting host depth to the 24-bit guest depth.
pub fn depth_encode_fn(encoding: DepthEncoding, round_20e4: bool, name: &str) -> String {
    let body = match encoding {
        DepthEncoding::Unorm24 => "f32_to_unorm24(depth)".to_owned(),
        DepthEncoding::Float20e4 => format!("f32_to_20e4(depth, {})", wgsl_bool(round_20e4)),
    };
    format!("fn {name}(depth: f32) -> u32 {{\n    return {body};\n}}\n")
}

/// `fn {name}(depth24: u32) -> f32` converting 24-bit guest depth to host depth.
pub fn depth_decode_fn(encoding: DepthEncoding, name: &str) -> String {
    let body = match encoding {
        DepthEncoding::Unorm24 => "unorm24_to_f32(depth24)",
        DepthEncoding::Float20e4 => "f20e4_to_f32(depth24)",
    };
    format!("fn {name}(depth24: u32) -> f32 {{\n    return {body};\n}}\n")
}

/// Bindings of a render target as a shader source, in descriptor set `group`, and
/// `fn {name}(pixel: vec2<u32>, host_sample: u32) -> vec2<u32>` loading one sample in its EDRAM
/// representation.
///
/// Color render targets take one binding, depth render targets take the depth aspect at binding
/// 0 and the stencil aspect at binding 1.
pub fn source_load(
    format: RenderTargetFormat,
    host_samples: u32,
    group: u32,
    name: &str,
    options: &ShaderOptions,
) -> String {
    let multisampled = host_samples > 1;
    // naga only accepts signed sample indices
    let level_or_sample = if multisampled { "i32(host_sample)" } else { "0" };
    let mut wgsl = String::new();
    match format {
        RenderTargetFormat::Color(color_format) => {
            let encoding = ColorEncoding::of(color_format);
            let scalar = host_scalar_type(format);
            let texture_type = if multisampled {
                format!("texture_multisampled_2d<{scalar}>")
            } else {
                format!("texture_2d<{scalar}>")
            };
            wgsl.push_str(&format!(
                "@group({group}) @binding(0) var {name}_color: {texture_type};\n"
            ));
            wgsl.push_str(&color_encode_fn(encoding, &format!("{name}_encode")));
            wgsl.push_str(&format!(
                "fn {name}(pixel: vec2<u32>, host_sample: u32) -> vec2<u32> {{\n    \
                 return {name}_encode(textureLoad({name}_color, pixel, {level_or_sample}));\n}}\n"
            ));
        }
        RenderTargetFormat::Depth(depth_format) => {
            let (depth_type, stencil_type) = if multisampled {
                ("texture_depth_multisampled_2d", "texture_multisampled_2d<u32>")
            } else {
                ("texture_depth_2d", "texture_2d<u32>")
            };
            wgsl.push_str(&format!(
                "@group({group}) @binding(0) var {name}_depth: {depth_type};\n"
            ));
            wgsl.push_str(&format!(
                "@group({group}) @binding(1) var {name}_stencil: {stencil_type};\n"
            ));
            wgsl.push_str(&depth_encode_fn(
                DepthEncoding::of(depth_format),
                options.depth_float24_round,
                &format!("{name}_encode_depth"),
            ));
            wgsl.push_str(&format!(
                "fn {name}(pixel: vec2<u32>, host_sample: u32) -> vec2<u32> {{\n    \
                 let depth = textureLoad({name}_depth, pixel, {level_or_sample});\n    \
                 let stencil = textureLoad({name}_stencil, pixel, {level_or_sample}).x;\n    \
                 return vec2<u32>(({name}_encode_depth(depth) << 8u) | (stencil & 0xFFu), 0u);\n\
                 }}\n"
            ));
        }
    }
    wgsl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::tiles::ResolutionScale;
    use crate::shaders::ShaderSource;
    use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};
    use naga::ShaderStage;

    fn validate_with_main(wgsl: String) {
        let wgsl = format!("{wgsl}\n@compute @workgroup_size(1)\nfn main() {{\n    return;\n}}\n");
        let source = ShaderSource::new("library", ShaderStage::Compute, wgsl);
        if let Err(err) = source.validate() {
            panic!("{err}");
        }
    }

    #[test]
    fn libraries_validate() {
        for scale in [ResolutionScale::NATIVE, ResolutionScale::new(3, 2)] {
            let options = ShaderOptions { resolution_scale: scale, ..ShaderOptions::default() };
            validate_with_main(prelude(&options));
        }
    }

    #[test]
    fn source_loads_validate() {
        let options = ShaderOptions::default();
        let mut formats: Vec<_> =
            ColorRenderTargetFormat::ALL.into_iter().map(RenderTargetFormat::Color).collect();
        formats.extend(DepthRenderTargetFormat::ALL.into_iter().map(RenderTargetFormat::Depth));
        for format in formats {
            for host_samples in [1, 2, 4] {
                let mut wgsl = prelude(&options);
                wgsl.push_str(&source_load(format, host_samples, 1, "load_source", &options));
                validate_with_main(wgsl);
            }
        }
    }

    #[test]
    fn header_bakes_options() {
        let options = ShaderOptions {
            resolution_scale: ResolutionScale::new(2, 3),
            native_2x_msaa: false,
            ..ShaderOptions::default()
        };
        let header = header(&options);
        assert!(header.contains("const SCALE_X: u32 = 2u;"));
        assert!(header.contains("const SCALE_Y: u32 = 3u;"));
        assert!(header.contains("const NATIVE_2X_MSAA: bool = false;"));
    }
}
