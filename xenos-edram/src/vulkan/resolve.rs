//! Compute pipelines of resolves: copying the EDRAM buffer to guest memory, clearing it on the
//! pixel shader interlock path, and storing host depth into it on the host render target path

use crate::edram::resolve::{ResolveCopyConstants, ResolveCopyShader, ResolveClearConstants};
use crate::shaders::host_depth_store::{host_depth_store_shader, HostDepthStoreConstants};
use crate::shaders::resolve::{resolve_clear_shader, resolve_copy_shader};
use crate::shaders::{ShaderOptions, ShaderSource};
use crate::vulkan::cache::InitializationError;
use crate::vulkan::create_shader_module;
use crate::vulkan::descriptors::DescriptorSetLayouts;
use crate::vulkan::device::{Device, DeviceObject};
use crate::xenos::MsaaSamples;
use ash::vk;

fn compute_layout<D: Device>(
    device: &D,
    sets: &[vk::DescriptorSetLayout],
    push_constants_size: usize,
    what: &'static str,
) -> Result<vk::PipelineLayout, InitializationError> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        offset: 0,
        size: push_constants_size as u32,
    }];
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(sets)
        .push_constant_ranges(&push_constant_ranges);
    device.create_pipeline_layout(&info).map_err(|err| InitializationError::vulkan(what, err))
}

fn compute_pipeline<D: Device>(
    device: &D,
    layout: vk::PipelineLayout,
    source: &ShaderSource,
) -> Result<vk::Pipeline, InitializationError> {
    let shader = create_shader_module(device, source)?;
    let pipeline = device.create_compute_pipeline(layout, shader);
    device.destroy(DeviceObject::ShaderModule(shader));
    pipeline.map_err(|err| {
        log::error!("Failed to create compute pipeline {}: {err}", source.name);
        InitializationError::vulkan("compute pipeline", err)
    })
}

fn destroy_pipelines<D: Device>(device: &D, pipelines: impl IntoIterator<Item = vk::Pipeline>) {
    for pipeline in pipelines {
        if pipeline != vk::Pipeline::null() {
            device.destroy(DeviceObject::Pipeline(pipeline));
        }
    }
}

fn destroy_layout<D: Device>(device: &D, layout: vk::PipelineLayout) {
    if layout != vk::PipelineLayout::null() {
        device.destroy(DeviceObject::PipelineLayout(layout));
    }
}

/// Resolve copy pipelines of the cache's resolution scale, all created up front.
#[derive(Debug)]
pub struct ResolveCopyPipelines {
    scaled: bool,
    // EDRAM buffer and the shared memory, or the scaled resolve buffer when scaled
    layout: vk::PipelineLayout,
    pipelines: Vec<(ResolveCopyShader, vk::Pipeline)>,
}

impl ResolveCopyPipelines {
    pub fn new<D: Device>(
        device: &D,
        set_layouts: &DescriptorSetLayouts,
        options: &ShaderOptions,
    ) -> Result<Self, InitializationError> {
        let scaled = !options.resolution_scale.is_native();
        let dest = if scaled { set_layouts.storage_buffer } else { set_layouts.shared_memory };
        let push_constants_size = if scaled {
            ResolveCopyConstants::SCALED_DWORDS * 4
        } else {
            std::mem::size_of::<ResolveCopyConstants>()
        };
        let layout = compute_layout(
            device,
            &[set_layouts.storage_buffer, dest],
            push_constants_size,
            "resolve copy pipeline layout",
        )?;
        let mut copy = Self { scaled, layout, pipelines: Vec::new() };
        let shaders =
            ResolveCopyShader::ALL.into_iter().filter(|shader| shader.is_scaled() == scaled);
        for shader in shaders {
            match compute_pipeline(device, layout, &resolve_copy_shader(shader, options)) {
                Ok(pipeline) => copy.pipelines.push((shader, pipeline)),
                Err(err) => {
                    copy.destroy(device);
                    return Err(err);
                }
            }
        }
        log::info!("Created {} resolve copy pipelines", copy.pipelines.len());
        Ok(copy)
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn is_scaled(&self) -> bool {
        self.scaled
    }

    pub fn pipeline(&self, shader: ResolveCopyShader) -> Option<vk::Pipeline> {
        self.pipelines.iter().find(|(created, _)| *created == shader).map(|&(_, pipeline)| pipeline)
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        destroy_pipelines(device, self.pipelines.drain(..).map(|(_, pipeline)| pipeline));
        destroy_layout(device, self.layout);
        self.layout = vk::PipelineLayout::null();
    }
}

/// EDRAM buffer clears of the pixel shader interlock path.
#[derive(Debug)]
pub struct ResolveClearPipelines {
    layout: vk::PipelineLayout,
    // 32bpp, 64bpp
    pipelines: [vk::Pipeline; 2],
}

impl ResolveClearPipelines {
    pub fn new<D: Device>(
        device: &D,
        set_layouts: &DescriptorSetLayouts,
        options: &ShaderOptions,
    ) -> Result<Self, InitializationError> {
        let layout = compute_layout(
            device,
            &[set_layouts.storage_buffer],
            std::mem::size_of::<ResolveClearConstants>(),
            "resolve clear pipeline layout",
        )?;
        let mut clear = Self { layout, pipelines: [vk::Pipeline::null(); 2] };
        for is_64bpp in [false, true] {
            match compute_pipeline(device, layout, &resolve_clear_shader(is_64bpp, options)) {
                Ok(pipeline) => clear.pipelines[usize::from(is_64bpp)] = pipeline,
                Err(err) => {
                    clear.destroy(device);
                    return Err(err);
                }
            }
        }
        Ok(clear)
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn pipeline(&self, is_64bpp: bool) -> vk::Pipeline {
        self.pipelines[usize::from(is_64bpp)]
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        destroy_pipelines(device, std::mem::take(&mut self.pipelines));
        destroy_layout(device, self.layout);
        self.layout = vk::PipelineLayout::null();
    }
}

/// Pipelines storing host depth of depth render targets to the EDRAM buffer, one per MSAA
/// mode.
#[derive(Debug)]
pub struct HostDepthStorePipelines {
    // EDRAM buffer and the depth render target
    layout: vk::PipelineLayout,
    pipelines: [vk::Pipeline; 3],
}

impl HostDepthStorePipelines {
    pub fn new<D: Device>(
        device: &D,
        set_layouts: &DescriptorSetLayouts,
        options: &ShaderOptions,
    ) -> Result<Self, InitializationError> {
        let layout = compute_layout(
            device,
            &[set_layouts.storage_buffer, set_layouts.sampled_image_x2],
            std::mem::size_of::<HostDepthStoreConstants>(),
            "host depth store pipeline layout",
        )?;
        let mut store = Self { layout, pipelines: [vk::Pipeline::null(); 3] };
        for msaa in MsaaSamples::ALL {
            match compute_pipeline(device, layout, &host_depth_store_shader(msaa, options)) {
                Ok(pipeline) => store.pipelines[msaa.bits() as usize] = pipeline,
                Err(err) => {
                    store.destroy(device);
                    return Err(err);
                }
            }
        }
        Ok(store)
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn pipeline(&self, msaa: MsaaSamples) -> vk::Pipeline {
        self.pipelines[msaa.bits() as usize]
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        destroy_pipelines(device, std::mem::take(&mut self.pipelines));
        destroy_layout(device, self.layout);
        self.layout = vk::PipelineLayout::null();
    }
}
