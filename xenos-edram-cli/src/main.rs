use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use env_logger::Env;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use xenos_edram::edram::resolve::{
    ResolveCopyShader, ResolveInfo, ResolveRectangle, ResolveRegisters,
};
use xenos_edram::edram::tiles::ResolutionScale;
use xenos_edram::edram::RenderTargetFormat;
use xenos_edram::registers::{
    RbColorInfo, RbCopyControl, RbCopyDestInfo, RbCopyDestPitch, RbDepthInfo, RbSurfaceInfo,
};
use xenos_edram::shaders::dump::{dump_shader, DumpShaderKey};
use xenos_edram::shaders::host_depth_store::host_depth_store_shader;
use xenos_edram::shaders::resolve::{resolve_clear_shader, resolve_copy_shader};
use xenos_edram::shaders::transfer::{
    transfer_shader, HostDepthSource, TransferOutput, TransferShaderKey,
};
use xenos_edram::shaders::{passthrough_vertex_shader, ShaderOptions, ShaderSource};
use xenos_edram::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat, MsaaSamples};
use xenos_edram::RenderTargetCacheConfig;

#[derive(Debug, Parser)]
struct Args {
    /// TOML file with a [render_target_cache] table
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the names of every shader the cache can create
    List,
    /// Print the WGSL of one shader
    Wgsl { name: String },
    /// Validate every shader and write its SPIR-V to a directory
    Compile {
        #[arg(short = 'o', long)]
        out_dir: PathBuf,
    },
    /// Describe the resolve of a register dump in TOML
    Resolve { registers_path: PathBuf },
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    render_target_cache: RenderTargetCacheConfig,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RenderTargetCacheConfig> {
    let Some(path) = path else { return Ok(RenderTargetCacheConfig::default()) };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Error reading config file '{}'", path.display()))?;
    let file: ConfigFile = toml::from_str(&text)
        .with_context(|| format!("Error parsing config file '{}'", path.display()))?;
    Ok(file.render_target_cache)
}

// The device isn't known here, so everything optional is assumed supported
fn shader_options(config: &RenderTargetCacheConfig) -> ShaderOptions {
    let (scale_x, scale_y) = config.resolution_scale();
    ShaderOptions {
        resolution_scale: ResolutionScale::new(scale_x, scale_y),
        native_2x_msaa: config.native_2x_msaa,
        sample_rate_shading: true,
        depth_float24_round: config.depth_float24_conversion.rounds(),
        edram_16_as_minus_1_to_1: !config.snorm16_render_target_full_range,
    }
}

// Formats host render targets are created with
fn render_target_formats() -> impl Iterator<Item = RenderTargetFormat> {
    ColorRenderTargetFormat::ALL
        .into_iter()
        .filter(|format| format.resource_format() == *format)
        .map(RenderTargetFormat::Color)
        .chain(DepthRenderTargetFormat::ALL.into_iter().map(RenderTargetFormat::Depth))
}

fn transfer_keys() -> Vec<TransferShaderKey> {
    let mut keys = Vec::new();
    for msaa in MsaaSamples::ALL {
        for source_format in render_target_formats() {
            for dest_format in render_target_formats() {
                let key = TransferShaderKey {
                    source_format,
                    source_msaa: msaa,
                    dest_format,
                    dest_msaa: msaa,
                    host_depth_source: None,
                    output: TransferOutput::Color,
                    dest_sample: None,
                };
                if !dest_format.is_depth() {
                    keys.push(key);
                    continue;
                }
                keys.push(TransferShaderKey { output: TransferOutput::Depth, ..key });
                keys.push(TransferShaderKey { output: TransferOutput::DepthStencil, ..key });
                keys.push(TransferShaderKey { output: TransferOutput::StencilBit, ..key });
                if source_format.is_depth() {
                    keys.push(TransferShaderKey {
                        output: TransferOutput::Depth,
                        host_depth_source: Some(HostDepthSource::Buffer),
                        ..key
                    });
                }
            }
        }
    }
    keys
}

fn all_shaders(options: &ShaderOptions) -> Vec<ShaderSource> {
    let scaled = !options.resolution_scale.is_native();
    let mut shaders = vec![passthrough_vertex_shader()];
    shaders.extend(
        ResolveCopyShader::ALL
            .into_iter()
            .filter(|shader| shader.is_scaled() == scaled)
            .map(|shader| resolve_copy_shader(shader, options)),
    );
    shaders.extend([false, true].map(|is_64bpp| resolve_clear_shader(is_64bpp, options)));
    shaders.extend(MsaaSamples::ALL.map(|msaa| host_depth_store_shader(msaa, options)));
    for format in render_target_formats() {
        for msaa in MsaaSamples::ALL {
            shaders.push(dump_shader(&DumpShaderKey { format, msaa }, options));
        }
    }
    shaders.extend(transfer_keys().iter().map(|key| transfer_shader(key, options)));
    shaders
}

fn compile_all(options: &ShaderOptions, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Error creating output directory '{}'", out_dir.display()))?;

    let shaders = all_shaders(options);
    let mut failed = 0;
    for shader in &shaders {
        let spirv = match shader.compile() {
            Ok(spirv) => spirv,
            Err(err) => {
                log::error!("{err}");
                failed += 1;
                continue;
            }
        };
        let path = out_dir.join(format!("{}.spv", shader.name));
        fs::write(&path, bytemuck::cast_slice::<u32, u8>(&spirv))
            .with_context(|| format!("Error writing '{}'", path.display()))?;
        log::debug!("Wrote {}", path.display());
    }

    log::info!("Compiled {} of {} shaders", shaders.len() - failed, shaders.len());
    if failed != 0 {
        return Err(anyhow!("{failed} shaders failed to compile"));
    }
    Ok(())
}

/// Raw register values, as captured from a guest command stream.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterDump {
    rb_copy_control: u32,
    rb_surface_info: u32,
    rb_color_info: [u32; 4],
    rb_depth_info: u32,
    rb_copy_dest_info: u32,
    rb_copy_dest_pitch: u32,
    rb_copy_dest_base: u32,
    rb_depth_clear: u32,
    rb_color_clear: u32,
    rb_color_clear_lo: u32,
    pix_center: bool,
    // x0, y0, x1, y1 after the window offset
    rectangle: [i32; 4],
}

impl RegisterDump {
    fn to_registers(&self) -> ResolveRegisters {
        let [x0, y0, x1, y1] = self.rectangle;
        ResolveRegisters {
            copy_control: RbCopyControl::from(self.rb_copy_control),
            surface_info: RbSurfaceInfo::from(self.rb_surface_info),
            color_info: self.rb_color_info.map(RbColorInfo::from),
            depth_info: RbDepthInfo::from(self.rb_depth_info),
            copy_dest_info: RbCopyDestInfo::from(self.rb_copy_dest_info),
            copy_dest_pitch: RbCopyDestPitch::from(self.rb_copy_dest_pitch),
            copy_dest_base: self.rb_copy_dest_base,
            depth_clear: self.rb_depth_clear,
            color_clear: self.rb_color_clear,
            color_clear_lo: self.rb_color_clear_lo,
            pix_center: self.pix_center,
            rectangle: ResolveRectangle { x0, y0, x1, y1 },
        }
    }
}

fn describe_resolve(config: &RenderTargetCacheConfig, path: &Path) -> anyhow::Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Error reading register dump '{}'", path.display()))?;
    let dump: RegisterDump = toml::from_str(&text)
        .with_context(|| format!("Error parsing register dump '{}'", path.display()))?;

    let options = shader_options(config);
    let info = ResolveInfo::from_registers(
        &dump.to_registers(),
        xenos_edram::edram::resolve::ResolveOptions {
            resolution_scale: options.resolution_scale,
            edram_16_as_minus_1_to_1: options.edram_16_as_minus_1_to_1,
            ..Default::default()
        },
    )?;

    if info.is_empty() {
        println!("Empty resolve");
        return Ok(());
    }
    let span = info.copy_edram_tile_span();
    println!(
        "EDRAM tiles: base {}, {} rows of {} used out of a {} tile pitch",
        span.base, span.rows, span.row_length_used, span.pitch
    );
    match info.copy_shader(options.resolution_scale) {
        Some(shader) if info.copy_dest_length != 0 => {
            let (groups_x, groups_y) = info.copy_group_count(options.resolution_scale);
            println!(
                "Copy: {} writing {:#X} bytes at {:#010X}, {groups_x}x{groups_y} groups",
                shader.name(),
                info.copy_dest_length,
                info.copy_dest_base
            );
        }
        _ => println!("Copy: none"),
    }
    if info.is_clearing_depth() {
        println!("Depth clear: {:#010X}", info.depth_clear);
    }
    if info.is_clearing_color() {
        println!("Color clear: {:#010X} {:#010X}", info.color_clear, info.color_clear_lo);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    log::debug!("Using {config:?}");

    match args.command {
        Command::List => {
            for shader in all_shaders(&shader_options(&config)) {
                println!("{}", shader.name);
            }
        }
        Command::Wgsl { name } => {
            let shader = all_shaders(&shader_options(&config))
                .into_iter()
                .find(|shader| shader.name == name)
                .ok_or_else(|| anyhow!("No shader named '{name}'"))?;
            print!("{}", shader.wgsl);
        }
        Command::Compile { out_dir } => compile_all(&shader_options(&config), &out_dir)?,
        Command::Resolve { registers_path } => describe_resolve(&config, &registers_path)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_table_is_optional() {
        let file: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(file.render_target_cache, RenderTargetCacheConfig::default());

        let file: ConfigFile = toml::from_str(
            "[render_target_cache]\n\
             render_target_path_vulkan = \"fbo\"\n\
             draw_resolution_scale_x = 2\n",
        )
        .unwrap();
        assert_eq!(file.render_target_cache.render_target_path_vulkan, "fbo");
        assert_eq!(file.render_target_cache.resolution_scale(), (2, 1));
        assert!(file.render_target_cache.native_2x_msaa);
    }

    #[test]
    fn register_dump_resolve() {
        let dump: RegisterDump = toml::from_str(
            "rb_surface_info = 0x20500\n\
             rb_color_info = [0x64, 0, 0, 0]\n\
             rb_copy_dest_info = 0x300\n\
             rb_copy_dest_pitch = 0x280050\n\
             rb_copy_dest_base = 0x10000000\n\
             rectangle = [0, 0, 80, 40]\n",
        )
        .unwrap();
        let registers = dump.to_registers();
        assert_eq!(registers.surface_info.surface_pitch(), 1280);
        assert_eq!(registers.surface_info.msaa_samples(), Some(MsaaSamples::X4));
        assert_eq!(registers.copy_dest_pitch.copy_dest_pitch(), 80);
        assert_eq!(registers.copy_dest_pitch.copy_dest_height(), 40);
        assert_eq!(registers.color_info[0].color_base(), 100);
    }

    #[test]
    fn shader_names_are_unique() {
        let shaders = all_shaders(&ShaderOptions::default());
        let mut names: Vec<_> = shaders.iter().map(|shader| shader.name.as_str()).collect();
        names.sort_unstable();
        let count = names.len();
        names.dedup();
        assert_eq!(names.len(), count);
    }
}
