//! Compute pipelines writing host render targets to the EDRAM buffer

use crate::shaders::dump::{dump_shader, DumpShaderKey};
use crate::shaders::ShaderOptions;
use crate::vulkan::cache::InitializationError;
use crate::vulkan::create_shader_module;
use crate::vulkan::descriptors::DescriptorSetLayouts;
use crate::vulkan::device::{Device, DeviceObject};
use ash::vk;
use std::collections::HashMap;

/// The pitches followed by the offsets, each pushed only when it changes between dispatches.
pub const DUMP_PITCHES_OFFSET: u32 = 0;
pub const DUMP_OFFSETS_OFFSET: u32 = 8;
pub const DUMP_PUSH_CONSTANTS_SIZE: u32 = 16;

#[derive(Debug)]
pub struct DumpPipelines {
    options: ShaderOptions,
    // EDRAM buffer and a color or a depth render target
    color_layout: vk::PipelineLayout,
    depth_layout: vk::PipelineLayout,
    pipelines: HashMap<DumpShaderKey, Option<vk::Pipeline>>,
}

impl DumpPipelines {
    pub fn new<D: Device>(
        device: &D,
        set_layouts: &DescriptorSetLayouts,
        options: ShaderOptions,
    ) -> Result<Self, InitializationError> {
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: DUMP_PUSH_CONSTANTS_SIZE,
        }];
        let create_layout = |source: vk::DescriptorSetLayout| {
            let sets = [set_layouts.storage_buffer, source];
            let info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&sets)
                .push_constant_ranges(&push_constant_ranges);
            device
                .create_pipeline_layout(&info)
                .map_err(|err| InitializationError::vulkan("dump pipeline layout", err))
        };
        let color_layout = create_layout(set_layouts.sampled_image)?;
        let depth_layout = create_layout(set_layouts.sampled_image_x2).inspect_err(|_| {
            device.destroy(DeviceObject::PipelineLayout(color_layout));
        })?;
        Ok(Self { options, color_layout, depth_layout, pipelines: HashMap::new() })
    }

    pub fn layout(&self, is_depth: bool) -> vk::PipelineLayout {
        if is_depth {
            self.depth_layout
        } else {
            self.color_layout
        }
    }

    pub fn pipeline<D: Device>(&mut self, device: &D, key: DumpShaderKey) -> Option<vk::Pipeline> {
        if let Some(&pipeline) = self.pipelines.get(&key) {
            return pipeline;
        }
        let pipeline = self.create_pipeline(device, key);
        self.pipelines.insert(key, pipeline);
        pipeline
    }

    fn create_pipeline<D: Device>(&self, device: &D, key: DumpShaderKey) -> Option<vk::Pipeline> {
        let shader = create_shader_module(device, &dump_shader(&key, &self.options)).ok()?;
        let pipeline = device.create_compute_pipeline(self.layout(key.format.is_depth()), shader);
        device.destroy(DeviceObject::ShaderModule(shader));
        match pipeline {
            Ok(pipeline) => {
                log::debug!("Created dump pipeline {}", key.name());
                Some(pipeline)
            }
            Err(err) => {
                log::error!("Failed to create dump pipeline {}: {err}", key.name());
                None
            }
        }
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for pipeline in self.pipelines.drain().filter_map(|(_, pipeline)| pipeline) {
            device.destroy(DeviceObject::Pipeline(pipeline));
        }
        device.destroy(DeviceObject::PipelineLayout(self.color_layout));
        device.destroy(DeviceObject::PipelineLayout(self.depth_layout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::RenderTargetFormat;
    use crate::vulkan::device::fake::{capable_features, FakeDevice};
    use crate::xenos::{DepthRenderTargetFormat, MsaaSamples};

    #[test]
    fn pipelines_are_memoized_with_failures() {
        let device = FakeDevice::new(capable_features());
        let set_layouts = DescriptorSetLayouts::new(&device, 1).unwrap();
        let mut dump = DumpPipelines::new(&device, &set_layouts, ShaderOptions::default()).unwrap();

        let key = DumpShaderKey {
            format: RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8),
            msaa: MsaaSamples::X2,
        };
        let pipeline = dump.pipeline(&device, key).unwrap();
        assert_eq!(dump.pipeline(&device, key), Some(pipeline));
        assert_eq!(device.compute_pipelines.get(), 1);

        device.fail_compute_pipelines.set(true);
        let failing = DumpShaderKey { msaa: MsaaSamples::X4, ..key };
        assert_eq!(dump.pipeline(&device, failing), None);
        device.fail_compute_pipelines.set(false);
        assert_eq!(dump.pipeline(&device, failing), None);
        assert_eq!(device.shader_modules.get(), 2);

        dump.destroy(&device);
        set_layouts.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
