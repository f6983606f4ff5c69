//! Vulkan backend of the render target cache

pub mod cache;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod dump;
pub mod edram_buffer;
pub mod render_pass;
pub mod render_target;
pub mod resolve;
pub mod transfer;

use crate::shaders::{ShaderError, ShaderSource};
use ash::vk;
use device::Device;

/// Translates a generated shader to SPIR-V and creates the module, logging failures.
pub(crate) fn create_shader_module<D: Device>(
    device: &D,
    source: &ShaderSource,
) -> Result<vk::ShaderModule, ShaderModuleError> {
    let code = source.compile().inspect_err(|err| {
        log::error!("Failed to translate shader {}: {err}", source.name);
    })?;
    device.create_shader_module(&code).map_err(|err| {
        log::error!("Failed to create shader module {}: {err}", source.name);
        ShaderModuleError::Vulkan(err)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ShaderModuleError {
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("shader module creation failed: {0}")]
    Vulkan(vk::Result),
}
