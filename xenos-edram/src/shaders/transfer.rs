//! Fragment shaders copying EDRAM contents from one host render target to another when tiles
//! change ownership

use crate::edram::formats::{ColorEncoding, DepthEncoding};
use crate::edram::tiles::host_sample_count;
use crate::edram::RenderTargetFormat;
use crate::shaders::common::{self, wgsl_bool};
use crate::shaders::{ShaderOptions, ShaderSource};
use crate::xenos::MsaaSamples;

/// What a transfer pass writes to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransferOutput {
    Color,
    // Depth, with stencil cleared to zero by the pipeline
    Depth,
    // Depth and stencil, stencil exported from the shader
    DepthStencil,
    // One bit of stencil per pass, samples with the bit clear are discarded
    StencilBit,
}

/// Where a depth transfer takes the host's full precision depth from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostDepthSource {
    // Another depth render target sharing the format of the destination
    Texture(MsaaSamples),
    // The EDRAM buffer, where the destination's own host depth was stored before the transfer
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferShaderKey {
    pub source_format: RenderTargetFormat,
    pub source_msaa: MsaaSamples,
    pub dest_format: RenderTargetFormat,
    pub dest_msaa: MsaaSamples,
    pub host_depth_source: Option<HostDepthSource>,
    pub output: TransferOutput,
    // Host sample written when the device can't shade at sample rate, one pipeline per sample
    pub dest_sample: Option<u32>,
}

impl TransferShaderKey {
    /// Size of the push constants the shader declares.
    pub fn push_constants_size(&self) -> u32 {
        let mut dwords = 3;
        if self.host_depth_source.is_some() {
            dwords += 2;
        }
        if self.output == TransferOutput::StencilBit {
            dwords += 1;
        }
        dwords * 4
    }

    pub fn name(&self) -> String {
        let host_depth = match self.host_depth_source {
            None => String::new(),
            Some(HostDepthSource::Texture(msaa)) => format!("_host_depth_{msaa}"),
            Some(HostDepthSource::Buffer) => "_host_depth_buffer".into(),
        };
        let output = match self.output {
            TransferOutput::Color => "color",
            TransferOutput::Depth => "depth",
            TransferOutput::DepthStencil => "depth_stencil",
            TransferOutput::StencilBit => "stencil_bit",
        };
        let sample = self.dest_sample.map(|sample| format!("_sample_{sample}")).unwrap_or_default();
        format!(
            "transfer_{}_{}_to_{}_{}{host_depth}_{output}{sample}",
            format_name(self.source_format),
            self.source_msaa,
            format_name(self.dest_format),
            self.dest_msaa,
        )
    }
}

fn format_name(format: RenderTargetFormat) -> String {
    match format {
        RenderTargetFormat::Color(format) => format!("{format:?}"),
        RenderTargetFormat::Depth(format) => format!("{format:?}"),
    }
    .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostDepthAddress {
    pub pitch_tiles: u32,
    // Added to a destination tile to get the tile of the host depth, the destination base for
    // the EDRAM buffer
    pub offset_tiles: i32,
}

/// Push constants of a transfer draw. Only the fields the shader uses are pushed, tightly
/// packed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferConstants {
    pub dest_pitch_tiles: u32,
    pub source_pitch_tiles: u32,
    // Destination base tile minus the source base tile
    pub source_to_dest_tiles: i32,
    pub host_depth: Option<HostDepthAddress>,
    pub stencil_mask: Option<u32>,
}

impl TransferConstants {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dwords =
            vec![self.dest_pitch_tiles, self.source_pitch_tiles, self.source_to_dest_tiles as u32];
        if let Some(host_depth) = self.host_depth {
            dwords.extend([host_depth.pitch_tiles, host_depth.offset_tiles as u32]);
        }
        if let Some(stencil_mask) = self.stencil_mask {
            dwords.push(stencil_mask);
        }
        bytemuck::cast_slice(&dwords).to_vec()
    }
}

fn push_constants_struct(key: &TransferShaderKey) -> String {
    let mut wgsl = String::from(
        "struct TransferConstants {\n    \
         dest_pitch_tiles: u32,\n    \
         source_pitch_tiles: u32,\n    \
         source_to_dest_tiles: i32,\n",
    );
    if key.host_depth_source.is_some() {
        wgsl.push_str("    host_depth_pitch_tiles: u32,\n    host_depth_offset_tiles: i32,\n");
    }
    if key.output == TransferOutput::StencilBit {
        wgsl.push_str("    stencil_mask: u32,\n");
    }
    wgsl.push_str("}\n\nvar<push_constant> constants: TransferConstants;\n");
    wgsl
}

fn surface_constants(prefix: &str, format: RenderTargetFormat, msaa: MsaaSamples) -> String {
    format!(
        "const {prefix}_MSAA: u32 = {}u;\nconst {prefix}_IS_64BPP: bool = {};\n\
         const {prefix}_IS_DEPTH: bool = {};\n",
        msaa.bits(),
        wgsl_bool(format.is_64bpp()),
        wgsl_bool(format.is_depth()),
    )
}

// The stencil location is redecorated as FragStencilRefEXT in the SPIR-V
const DEPTH_STENCIL_OUTPUTS: &str = "struct DepthStencilOutputs {
    @builtin(frag_depth) depth: f32,
    @location(0) stencil: u32,
}
";

const SOURCE_DWORD_FN: &str = r"
fn source_dword(dest_surface: Surface, dest_tile: TileSample, dword_index: u32) -> u32 {
    let source_surface =
        Surface(SOURCE_MSAA, SOURCE_IS_64BPP, SOURCE_IS_DEPTH, constants.source_pitch_tiles);
    let source_tile =
        u32(i32(dest_tile.tile) + constants.source_to_dest_tiles) & EDRAM_TILE_COUNT_MASK;
    let dword_column = sample_dword_column(dest_surface, dest_tile.column) + dword_index;
    let source_column = dword_sample_column(source_surface, dword_column);
    let source = tile_sample_to_pixel(
        source_surface,
        TileSample(source_tile, source_column.x, dest_tile.row),
    );
    let packed = load_source(source.pixel, guest_sample_to_host(SOURCE_MSAA, source.sample));
    return select(packed.x, packed.y, source_column.y != 0u);
}
";

fn host_depth_load(source: HostDepthSource, options: &ShaderOptions) -> String {
    match source {
        HostDepthSource::Texture(msaa) => {
            let multisampled = host_sample_count(msaa, options.native_2x_msaa) > 1;
            let (texture_type, sample) = if multisampled {
                (
                    "texture_depth_multisampled_2d",
                    "i32(guest_sample_to_host(HOST_DEPTH_MSAA, source.sample))",
                )
            } else {
                ("texture_depth_2d", "0")
            };
            format!(
                "const HOST_DEPTH_MSAA: u32 = {msaa_bits}u;\n\
                 @group(1) @binding(0) var host_depth: {texture_type};\n\
                 fn load_host_depth(dest_surface: Surface, dest_tile: TileSample) -> f32 {{\n    \
                 let surface =\n        \
                 Surface(HOST_DEPTH_MSAA, false, true, constants.host_depth_pitch_tiles);\n    \
                 let offset_tile = i32(dest_tile.tile) + constants.host_depth_offset_tiles;\n    \
                 let tile = u32(offset_tile) & EDRAM_TILE_COUNT_MASK;\n    \
                 let dword_column = sample_dword_column(dest_surface, dest_tile.column);\n    \
                 let column = dword_sample_column(surface, dword_column).x;\n    \
                 let source =\n        \
                 tile_sample_to_pixel(surface, TileSample(tile, column, dest_tile.row));\n    \
                 return textureLoad(host_depth, source.pixel, {sample});\n\
                 }}\n",
                msaa_bits = msaa.bits(),
            )
        }
        HostDepthSource::Buffer => "@group(1) @binding(0)\n\
             var<storage, read> host_depth: array<u32>;\n\
             fn load_host_depth(dest_surface: Surface, dest_tile: TileSample) -> f32 {\n    \
             let tile = u32(i32(dest_tile.tile) + constants.host_depth_offset_tiles);\n    \
             let dword_column = sample_dword_column(dest_surface, dest_tile.column);\n    \
             let index = edram_dword_index(tile, dest_tile.row, dword_column);\n    \
             return bitcast<f32>(host_depth[index]);\n\
             }\n"
            .into(),
    }
}

pub fn transfer_shader(key: &TransferShaderKey, options: &ShaderOptions) -> ShaderSource {
    let source_host_samples = host_sample_count(key.source_msaa, options.native_2x_msaa);
    let dest_host_samples = host_sample_count(key.dest_msaa, options.native_2x_msaa);

    let mut wgsl = common::prelude(options);
    wgsl.push_str(&surface_constants("SOURCE", key.source_format, key.source_msaa));
    wgsl.push_str(&surface_constants("DEST", key.dest_format, key.dest_msaa));
    wgsl.push_str(&push_constants_struct(key));
    wgsl.push_str(&common::source_load(
        key.source_format,
        source_host_samples,
        0,
        "load_source",
        options,
    ));
    wgsl.push_str(SOURCE_DWORD_FN);

    let (sample_parameter, sample_expression) = match key.dest_sample {
        _ if dest_host_samples == 1 => (String::new(), "0u".to_owned()),
        Some(sample) => (String::new(), format!("{sample}u")),
        None => (
            ", @builtin(sample_index) sample_index: u32".to_owned(),
            "sample_index".to_owned(),
        ),
    };

    let (return_type, output) = match (key.output, key.dest_format) {
        (TransferOutput::Color, RenderTargetFormat::Color(format)) => {
            let encoding = ColorEncoding::of(format);
            wgsl.push_str(&common::color_decode_fn(encoding, "decode_dest"));
            (
                format!(" -> @location(0) vec4<{}>", common::host_scalar_type(key.dest_format)),
                "    return decode_dest(packed);\n".to_owned(),
            )
        }
        (TransferOutput::StencilBit, RenderTargetFormat::Depth(_)) => (
            String::new(),
            "    if ((packed.x & constants.stencil_mask) == 0u) {\n        discard;\n    }\n    \
             return;\n"
                .to_owned(),
        ),
        (
            output @ (TransferOutput::Depth | TransferOutput::DepthStencil),
            RenderTargetFormat::Depth(format),
        ) => {
            let encoding = DepthEncoding::of(format);
            wgsl.push_str(&common::depth_decode_fn(encoding, "decode_dest_depth"));
            let mut body = String::from(
                "    let guest_depth = packed.x >> 8u;\n    \
                 var depth = decode_dest_depth(guest_depth);\n",
            );
            if let Some(host_depth_source) = key.host_depth_source {
                wgsl.push_str(&common::depth_encode_fn(
                    encoding,
                    options.depth_float24_round,
                    "encode_dest_depth",
                ));
                wgsl.push_str(&host_depth_load(host_depth_source, options));
                body.push_str(
                    "    let host_depth = load_host_depth(dest_surface, dest_tile);\n    \
                     if (encode_dest_depth(host_depth) == guest_depth) {\n        \
                     depth = host_depth;\n    \
                     }\n",
                );
            }
            if output == TransferOutput::DepthStencil {
                wgsl.push_str(DEPTH_STENCIL_OUTPUTS);
                body.push_str("    return DepthStencilOutputs(depth, packed.x & 0xFFu);\n");
                (" -> DepthStencilOutputs".to_owned(), body)
            } else {
                body.push_str("    return depth;\n");
                (" -> @builtin(frag_depth) f32".to_owned(), body)
            }
        }
        (output, dest_format) => {
            unreachable!("{output:?} transfers can't write {dest_format:?} render targets")
        }
    };

    let high_dword = if key.dest_format.is_64bpp() {
        "source_dword(dest_surface, dest_tile, 1u)"
    } else {
        "0u"
    };

    wgsl.push_str(&format!(
        "\n@fragment\n\
         fn main(@builtin(position) position: vec4<f32>{sample_parameter}){return_type} {{\n    \
         let dest_surface =\n        \
         Surface(DEST_MSAA, DEST_IS_64BPP, DEST_IS_DEPTH, constants.dest_pitch_tiles);\n    \
         let guest_sample = host_sample_to_guest(DEST_MSAA, {sample_expression});\n    \
         let dest_tile =\n        \
         pixel_to_tile_sample(dest_surface, vec2<u32>(position.xy), guest_sample);\n    \
         let packed = vec2<u32>(source_dword(dest_surface, dest_tile, 0u), {high_dword});\n\
         {output}}}\n"
    ));

    let source = ShaderSource::new(key.name(), naga::ShaderStage::Fragment, wgsl);
    if key.output == TransferOutput::DepthStencil {
        source.with_stencil_export()
    } else {
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::tiles::ResolutionScale;
    use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};

    fn resource_formats() -> Vec<RenderTargetFormat> {
        let mut formats: Vec<_> = ColorRenderTargetFormat::ALL
            .into_iter()
            .filter(|format| format.resource_format() == *format)
            .map(RenderTargetFormat::Color)
            .collect();
        formats.extend(DepthRenderTargetFormat::ALL.into_iter().map(RenderTargetFormat::Depth));
        formats
    }

    fn key(
        source_format: RenderTargetFormat,
        dest_format: RenderTargetFormat,
    ) -> TransferShaderKey {
        TransferShaderKey {
            source_format,
            source_msaa: MsaaSamples::X1,
            dest_format,
            dest_msaa: MsaaSamples::X1,
            host_depth_source: None,
            output: if dest_format.is_depth() {
                TransferOutput::Depth
            } else {
                TransferOutput::Color
            },
            dest_sample: None,
        }
    }

    fn assert_valid(key: &TransferShaderKey, options: &ShaderOptions) {
        let source = transfer_shader(key, options);
        if let Err(err) = source.validate() {
            panic!("{err}\n{}", source.wgsl);
        }
    }

    #[test]
    fn all_format_pairs_validate() {
        let options = ShaderOptions::default();
        for source_format in resource_formats() {
            for dest_format in resource_formats() {
                assert_valid(&key(source_format, dest_format), &options);
            }
        }
    }

    // Every key the cache can build, with the first and the last sample of per-sample pipelines
    fn every_key(options: &ShaderOptions) -> Vec<TransferShaderKey> {
        let mut keys = Vec::new();
        for source_format in resource_formats() {
            for dest_format in resource_formats() {
                for source_msaa in MsaaSamples::ALL {
                    for dest_msaa in MsaaSamples::ALL {
                        let host_samples = host_sample_count(dest_msaa, options.native_2x_msaa);
                        let dest_samples = if options.sample_rate_shading || host_samples == 1 {
                            vec![None]
                        } else {
                            vec![Some(0), Some(host_samples - 1)]
                        };
                        let base = TransferShaderKey {
                            source_msaa,
                            dest_msaa,
                            ..key(source_format, dest_format)
                        };
                        if !dest_format.is_depth() {
                            keys.extend(dest_samples.iter().map(|&dest_sample| {
                                TransferShaderKey { dest_sample, ..base }
                            }));
                            continue;
                        }
                        for dest_sample in dest_samples {
                            keys.push(TransferShaderKey {
                                output: TransferOutput::StencilBit,
                                dest_sample,
                                ..base
                            });
                            let host_depth_sources = if source_format.is_depth() {
                                vec![
                                    None,
                                    Some(HostDepthSource::Buffer),
                                    Some(HostDepthSource::Texture(source_msaa)),
                                ]
                            } else {
                                vec![None]
                            };
                            for output in [TransferOutput::Depth, TransferOutput::DepthStencil] {
                                for &host_depth_source in &host_depth_sources {
                                    keys.push(TransferShaderKey {
                                        output,
                                        host_depth_source,
                                        dest_sample,
                                        ..base
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        keys
    }

    #[test]
    fn every_key_validates_in_every_msaa_mode() {
        for options in [
            ShaderOptions::default(),
            ShaderOptions {
                native_2x_msaa: false,
                sample_rate_shading: false,
                ..ShaderOptions::default()
            },
        ] {
            let keys = every_key(&options);
            assert!(keys.iter().any(|key| key.dest_msaa == MsaaSamples::X4
                && key.source_msaa == MsaaSamples::X2
                && key.output == TransferOutput::DepthStencil));
            for key in &keys {
                assert_valid(key, &options);
            }
        }
    }

    #[test]
    fn depth_stencil_output_exports_stencil() {
        let color = RenderTargetFormat::Color(ColorRenderTargetFormat::K8888);
        let depth = RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8);
        let options = ShaderOptions::default();
        let key = TransferShaderKey {
            output: TransferOutput::DepthStencil,
            dest_msaa: MsaaSamples::X4,
            ..key(color, depth)
        };
        let source = transfer_shader(&key, &options);
        assert!(source.stencil_export);
        assert!(source.wgsl.contains("@location(0) stencil: u32"));
        assert!(source.compile().is_ok());

        let depth_only =
            transfer_shader(&TransferShaderKey { output: TransferOutput::Depth, ..key }, &options);
        assert!(!depth_only.stencil_export);
        assert_eq!(key.push_constants_size(), 12);
    }

    #[test]
    fn msaa_and_scale_variants_validate() {
        let color = RenderTargetFormat::Color(ColorRenderTargetFormat::K16_16_16_16);
        let depth = RenderTargetFormat::Depth(DepthRenderTargetFormat::D24FS8);
        for options in [
            ShaderOptions::default(),
            ShaderOptions {
                resolution_scale: ResolutionScale::new(3, 2),
                native_2x_msaa: false,
                ..ShaderOptions::default()
            },
        ] {
            for source_msaa in MsaaSamples::ALL {
                for dest_msaa in MsaaSamples::ALL {
                    for (source_format, dest_format) in [(color, depth), (depth, color)] {
                        let key = TransferShaderKey {
                            source_msaa,
                            dest_msaa,
                            ..key(source_format, dest_format)
                        };
                        assert_valid(&key, &options);
                    }
                }
            }
        }
    }

    #[test]
    fn host_depth_and_stencil_variants_validate() {
        let options = ShaderOptions { sample_rate_shading: false, ..ShaderOptions::default() };
        let depth = RenderTargetFormat::Depth(DepthRenderTargetFormat::D24FS8);
        let color = RenderTargetFormat::Color(ColorRenderTargetFormat::K8888);
        for host_depth_source in [
            HostDepthSource::Texture(MsaaSamples::X1),
            HostDepthSource::Texture(MsaaSamples::X4),
            HostDepthSource::Buffer,
        ] {
            let key = TransferShaderKey {
                dest_msaa: MsaaSamples::X4,
                host_depth_source: Some(host_depth_source),
                dest_sample: Some(2),
                ..key(color, depth)
            };
            assert_valid(&key, &options);
            assert_eq!(key.push_constants_size(), 20);
        }

        let stencil = TransferShaderKey {
            output: TransferOutput::StencilBit,
            dest_msaa: MsaaSamples::X2,
            ..key(color, depth)
        };
        assert_valid(&stencil, &options);
        assert_eq!(stencil.push_constants_size(), 16);
        assert!(!transfer_shader(&stencil, &options).wgsl.contains("frag_depth"));
    }

    #[test]
    fn sample_rate_shading_uses_sample_index() {
        let color = RenderTargetFormat::Color(ColorRenderTargetFormat::K32Float);
        let key = TransferShaderKey { dest_msaa: MsaaSamples::X4, ..key(color, color) };
        let options = ShaderOptions::default();
        assert!(transfer_shader(&key, &options).wgsl.contains("@builtin(sample_index)"));

        let fixed = TransferShaderKey { dest_sample: Some(3), ..key };
        let wgsl = transfer_shader(&fixed, &options).wgsl;
        assert!(!wgsl.contains("@builtin(sample_index)"));
        assert!(wgsl.contains("host_sample_to_guest(DEST_MSAA, 3u)"));
    }

    #[test]
    fn constants_match_declared_size() {
        let mut rng_values = Vec::new();
        for _ in 0..16 {
            rng_values.push((rand::random::<u32>(), rand::random::<i32>()));
        }
        for (pitch, offset) in rng_values {
            let constants = TransferConstants {
                dest_pitch_tiles: pitch & 0xFF,
                source_pitch_tiles: 16,
                source_to_dest_tiles: offset,
                host_depth: Some(HostDepthAddress { pitch_tiles: 8, offset_tiles: -offset }),
                stencil_mask: None,
            };
            let bytes = constants.to_bytes();
            assert_eq!(bytes.len(), 20);
            assert_eq!(bytes[8..12], offset.to_le_bytes());
        }
        let stencil_only =
            TransferConstants { stencil_mask: Some(0x80), ..TransferConstants::default() };
        assert_eq!(stencil_only.to_bytes().len(), 16);
    }

    #[test]
    fn compiles_to_spirv() {
        let depth = RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8);
        let key = TransferShaderKey {
            source_msaa: MsaaSamples::X2,
            dest_msaa: MsaaSamples::X4,
            host_depth_source: Some(HostDepthSource::Texture(MsaaSamples::X2)),
            ..key(depth, depth)
        };
        let spirv = transfer_shader(&key, &ShaderOptions::default()).compile().unwrap();
        assert_eq!(spirv[0], 0x07230203);
    }

    #[test]
    fn names_are_unique_per_key() {
        let color = RenderTargetFormat::Color(ColorRenderTargetFormat::K8888);
        let depth = RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8);
        let names: std::collections::HashSet<_> = [
            key(color, depth),
            key(depth, color),
            TransferShaderKey { output: TransferOutput::StencilBit, ..key(color, depth) },
            TransferShaderKey { output: TransferOutput::DepthStencil, ..key(color, depth) },
            TransferShaderKey {
                host_depth_source: Some(HostDepthSource::Buffer),
                ..key(depth, depth)
            },
            key(depth, depth),
        ]
        .iter()
        .map(TransferShaderKey::name)
        .collect();
        assert_eq!(names.len(), 6);
    }
}
