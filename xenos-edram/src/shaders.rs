//! Shaders of the render target cache, generated as WGSL per pipeline key and translated to
//! SPIR-V with naga

pub mod common;
pub mod compile;
pub mod dump;
pub mod host_depth_store;
pub mod resolve;
pub mod transfer;

pub use compile::{ShaderError, ShaderSource};

use crate::edram::tiles::ResolutionScale;

/// Cache-wide parameters baked into every generated shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderOptions {
    pub resolution_scale: ResolutionScale,
    pub native_2x_msaa: bool,
    // Without sample-rate shading, multisampled destinations are written one sample per pass
    pub sample_rate_shading: bool,
    pub depth_float24_round: bool,
    // 16-bit normalized render targets hold -1...1 rather than the guest's -32...32
    pub edram_16_as_minus_1_to_1: bool,
}

impl Default for ShaderOptions {
    fn default() -> Self {
        Self {
            resolution_scale: ResolutionScale::NATIVE,
            native_2x_msaa: true,
            sample_rate_shading: true,
            depth_float24_round: false,
            edram_16_as_minus_1_to_1: false,
        }
    }
}

/// Vertex shader of all transfer draws, positions are provided in NDC.
pub fn passthrough_vertex_shader() -> ShaderSource {
    ShaderSource::new(
        "passthrough_position_xy",
        naga::ShaderStage::Vertex,
        "@vertex\n\
         fn main(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {\n    \
         return vec4<f32>(position, 0.0, 1.0);\n\
         }\n"
            .into(),
    )
}
