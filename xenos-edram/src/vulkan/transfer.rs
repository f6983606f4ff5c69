//! Pipelines drawing ownership transfers between host render targets, and the vertex buffers
//! holding their quads

use crate::edram::tiles::host_sample_count;
use crate::shaders::transfer::{transfer_shader, HostDepthSource, TransferOutput, TransferShaderKey};
use crate::shaders::{passthrough_vertex_shader, ShaderOptions};
use crate::vulkan::cache::InitializationError;
use crate::vulkan::create_shader_module;
use crate::vulkan::descriptors::DescriptorSetLayouts;
use crate::vulkan::device::{BufferAllocation, Device, DeviceObject, MemoryLocation};
use crate::vulkan::render_pass::{RenderPassCache, RenderPassKey};
use crate::vulkan::render_target::sample_count_flags;
use crate::xenos::MsaaSamples;
use ash::prelude::VkResult;
use ash::vk;
use std::collections::HashMap;

/// Largest push constant block of the transfer shaders: the address, the host depth address
/// and the stencil mask.
pub const TRANSFER_PUSH_CONSTANTS_SIZE: u32 = 24;

/// Pipeline layout shapes, by what the fragment shader samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferLayoutKind {
    pub source_is_depth: bool,
    pub host_depth_source: Option<HostDepthSource>,
}

impl TransferLayoutKind {
    const COUNT: usize = 6;

    pub fn of(key: &TransferShaderKey) -> Self {
        Self {
            source_is_depth: key.source_format.is_depth(),
            host_depth_source: key.host_depth_source,
        }
    }

    fn index(self) -> usize {
        let host_depth = match self.host_depth_source {
            None => 0,
            Some(HostDepthSource::Texture(_)) => 1,
            Some(HostDepthSource::Buffer) => 2,
        };
        usize::from(self.source_is_depth) * 3 + host_depth
    }

    fn all() -> [Self; Self::COUNT] {
        let host_depth_sources =
            [None, Some(HostDepthSource::Texture(MsaaSamples::X1)), Some(HostDepthSource::Buffer)];
        let mut kinds = [Self { source_is_depth: false, host_depth_source: None }; Self::COUNT];
        for source_is_depth in [false, true] {
            for host_depth_source in host_depth_sources {
                let kind = Self { source_is_depth, host_depth_source };
                kinds[kind.index()] = kind;
            }
        }
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransferPipelineKey {
    render_pass: RenderPassKey,
    shader: TransferShaderKey,
}

/// Settings of the pipelines that don't come from the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPipelineOptions {
    pub shaders: ShaderOptions,
    // Skip writing depth samples that already hold the value, for hierarchical depth
    pub depth_transfer_not_equal_test: bool,
}

#[derive(Debug)]
pub struct TransferPipelines {
    options: TransferPipelineOptions,
    vertex_shader: vk::ShaderModule,
    layouts: [vk::PipelineLayout; TransferLayoutKind::COUNT],
    shaders: HashMap<TransferShaderKey, Option<vk::ShaderModule>>,
    pipelines: HashMap<TransferPipelineKey, Option<Vec<vk::Pipeline>>>,
}

impl TransferPipelines {
    pub fn new<D: Device>(
        device: &D,
        set_layouts: &DescriptorSetLayouts,
        options: TransferPipelineOptions,
    ) -> Result<Self, InitializationError> {
        let mut pipelines = Self {
            options,
            vertex_shader: vk::ShaderModule::null(),
            layouts: [vk::PipelineLayout::null(); TransferLayoutKind::COUNT],
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
        };
        if let Err(err) = pipelines.create_layouts(device, set_layouts) {
            pipelines.destroy(device);
            return Err(err);
        }
        Ok(pipelines)
    }

    fn create_layouts<D: Device>(
        &mut self,
        device: &D,
        set_layouts: &DescriptorSetLayouts,
    ) -> Result<(), InitializationError> {
        self.vertex_shader = create_shader_module(device, &passthrough_vertex_shader())?;

        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: TRANSFER_PUSH_CONSTANTS_SIZE,
        }];
        for kind in TransferLayoutKind::all() {
            let source = if kind.source_is_depth {
                set_layouts.sampled_image_x2
            } else {
                set_layouts.sampled_image
            };
            let mut sets = vec![source];
            match kind.host_depth_source {
                None => {}
                // The depth and stencil set of the host depth render target
                Some(HostDepthSource::Texture(_)) => sets.push(set_layouts.sampled_image_x2),
                Some(HostDepthSource::Buffer) => sets.push(set_layouts.storage_buffer),
            }
            let info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&sets)
                .push_constant_ranges(&push_constant_ranges);
            self.layouts[kind.index()] = device
                .create_pipeline_layout(&info)
                .map_err(|err| InitializationError::vulkan("transfer pipeline layout", err))?;
        }
        Ok(())
    }

    pub fn layout(&self, kind: TransferLayoutKind) -> vk::PipelineLayout {
        self.layouts[kind.index()]
    }

    fn shader<D: Device>(
        &mut self,
        device: &D,
        key: TransferShaderKey,
    ) -> Option<vk::ShaderModule> {
        if let Some(&shader) = self.shaders.get(&key) {
            return shader;
        }
        let shader =
            create_shader_module(device, &transfer_shader(&key, &self.options.shaders)).ok();
        self.shaders.insert(key, shader);
        shader
    }

    /// Pipelines drawing `shader_key` in render passes of `render_pass_key`. Without sample
    /// rate shading there is one pipeline per destination sample, each writing that sample.
    pub fn pipelines<D: Device>(
        &mut self,
        device: &D,
        render_passes: &mut RenderPassCache,
        render_pass_key: RenderPassKey,
        shader_key: TransferShaderKey,
    ) -> Option<Vec<vk::Pipeline>> {
        debug_assert!(shader_key.dest_sample.is_none());
        let key = TransferPipelineKey { render_pass: render_pass_key, shader: shader_key };
        if let Some(pipelines) = self.pipelines.get(&key) {
            return pipelines.clone();
        }
        let pipelines = self.create_pipelines(device, render_passes, key);
        if pipelines.is_some() {
            log::debug!("Created transfer pipelines {}", shader_key.name());
        }
        self.pipelines.insert(key, pipelines.clone());
        pipelines
    }

    fn create_pipelines<D: Device>(
        &mut self,
        device: &D,
        render_passes: &mut RenderPassCache,
        key: TransferPipelineKey,
    ) -> Option<Vec<vk::Pipeline>> {
        let render_pass = render_passes.render_pass(device, key.render_pass)?;
        let shader_options = self.options.shaders;
        let host_samples = host_sample_count(key.shader.dest_msaa, shader_options.native_2x_msaa);
        let per_sample = !shader_options.sample_rate_shading && host_samples > 1;

        let shader_keys: Vec<_> = if per_sample {
            (0..host_samples)
                .map(|sample| TransferShaderKey { dest_sample: Some(sample), ..key.shader })
                .collect()
        } else {
            vec![key.shader]
        };
        let mut fragment_shaders = Vec::with_capacity(shader_keys.len());
        for shader_key in shader_keys {
            fragment_shaders.push(self.shader(device, shader_key)?);
        }
        let sample_masks: Vec<u32> = (0..host_samples).map(|sample| 1 << sample).collect();

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: 8,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_attributes = [vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        }];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport =
            vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let samples = sample_count_flags(key.shader.dest_msaa, shader_options.native_2x_msaa);
        let sample_shading = shader_options.sample_rate_shading && host_samples > 1;
        let multisample_states: Vec<_> = (0..fragment_shaders.len())
            .map(|index| {
                let state = vk::PipelineMultisampleStateCreateInfo::default()
                    .rasterization_samples(samples)
                    .sample_shading_enable(sample_shading)
                    .min_sample_shading(1.0);
                if per_sample {
                    state.sample_mask(&sample_masks[index..=index])
                } else {
                    state
                }
            })
            .collect();

        let depth_stencil = match key.shader.output {
            TransferOutput::Color => None,
            TransferOutput::Depth | TransferOutput::DepthStencil => {
                // Stencil is cleared for the bit passes to set, or replaced by the exported value
                let stencil = vk::StencilOpState {
                    fail_op: vk::StencilOp::REPLACE,
                    pass_op: vk::StencilOp::REPLACE,
                    depth_fail_op: vk::StencilOp::REPLACE,
                    compare_op: vk::CompareOp::ALWAYS,
                    compare_mask: 0xFF,
                    write_mask: 0xFF,
                    reference: 0,
                };
                let compare = if self.options.depth_transfer_not_equal_test {
                    vk::CompareOp::NOT_EQUAL
                } else {
                    vk::CompareOp::ALWAYS
                };
                Some(
                    vk::PipelineDepthStencilStateCreateInfo::default()
                        .depth_test_enable(true)
                        .depth_write_enable(true)
                        .depth_compare_op(compare)
                        .stencil_test_enable(true)
                        .front(stencil)
                        .back(stencil),
                )
            }
            TransferOutput::StencilBit => {
                // The write mask selects the bit, samples without it are discarded
                let stencil = vk::StencilOpState {
                    fail_op: vk::StencilOp::KEEP,
                    pass_op: vk::StencilOp::REPLACE,
                    depth_fail_op: vk::StencilOp::REPLACE,
                    compare_op: vk::CompareOp::ALWAYS,
                    compare_mask: 0xFF,
                    write_mask: 0xFF,
                    reference: 0xFF,
                };
                Some(
                    vk::PipelineDepthStencilStateCreateInfo::default()
                        .stencil_test_enable(true)
                        .front(stencil)
                        .back(stencil),
                )
            }
        };

        let color_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_attachment_count = usize::from(key.shader.output == TransferOutput::Color);
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_attachments[..color_attachment_count]);

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if key.shader.output == TransferOutput::StencilBit {
            dynamic_states.push(vk::DynamicState::STENCIL_WRITE_MASK);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let stages: Vec<_> = fragment_shaders
            .iter()
            .map(|&fragment_shader| {
                [
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(vk::ShaderStageFlags::VERTEX)
                        .module(self.vertex_shader)
                        .name(c"main"),
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(vk::ShaderStageFlags::FRAGMENT)
                        .module(fragment_shader)
                        .name(c"main"),
                ]
            })
            .collect();

        let layout = self.layout(TransferLayoutKind::of(&key.shader));
        let infos: Vec<_> = stages
            .iter()
            .zip(&multisample_states)
            .enumerate()
            .map(|(index, (stages, multisample))| {
                let flags = match (per_sample, index) {
                    (false, _) => vk::PipelineCreateFlags::empty(),
                    (true, 0) => vk::PipelineCreateFlags::ALLOW_DERIVATIVES,
                    (true, _) => vk::PipelineCreateFlags::DERIVATIVE,
                };
                let mut info = vk::GraphicsPipelineCreateInfo::default()
                    .flags(flags)
                    .stages(stages)
                    .vertex_input_state(&vertex_input)
                    .input_assembly_state(&input_assembly)
                    .viewport_state(&viewport)
                    .rasterization_state(&rasterization)
                    .multisample_state(multisample)
                    .color_blend_state(&color_blend)
                    .dynamic_state(&dynamic)
                    .layout(layout)
                    .render_pass(render_pass)
                    .subpass(0)
                    .base_pipeline_index(if index == 0 { -1 } else { 0 });
                if let Some(depth_stencil) = depth_stencil.as_ref() {
                    info = info.depth_stencil_state(depth_stencil);
                }
                info
            })
            .collect();

        device
            .create_graphics_pipelines(&infos)
            .inspect_err(|err| {
                log::error!("Failed to create transfer pipelines {}: {err}", key.shader.name());
            })
            .ok()
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for pipeline in self.pipelines.drain().filter_map(|(_, pipelines)| pipelines).flatten() {
            device.destroy(DeviceObject::Pipeline(pipeline));
        }
        for shader in self.shaders.drain().filter_map(|(_, shader)| shader) {
            device.destroy(DeviceObject::ShaderModule(shader));
        }
        for layout in &mut self.layouts {
            if *layout != vk::PipelineLayout::null() {
                device.destroy(DeviceObject::PipelineLayout(*layout));
                *layout = vk::PipelineLayout::null();
            }
        }
        if self.vertex_shader != vk::ShaderModule::null() {
            device.destroy(DeviceObject::ShaderModule(self.vertex_shader));
            self.vertex_shader = vk::ShaderModule::null();
        }
    }
}

const VERTEX_BUFFER_PAGE_SIZE: vk::DeviceSize = 1 << 20;
const VERTEX_ALIGNMENT: vk::DeviceSize = 16;

/// Host-visible vertex buffers for transfer quads. Pages written during a submission are reused
/// once that submission has completed.
#[derive(Debug, Default)]
pub struct TransferVertexBufferPool {
    current: Option<(BufferAllocation, vk::DeviceSize)>,
    // Submission that last wrote each page
    in_flight: Vec<(u64, BufferAllocation)>,
    free: Vec<BufferAllocation>,
}

impl TransferVertexBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `vertices` to a vertex buffer, returning the buffer and the offset of the data.
    pub fn upload<D: Device>(
        &mut self,
        device: &D,
        submission: u64,
        vertices: &[[f32; 2]],
    ) -> VkResult<(vk::Buffer, vk::DeviceSize)> {
        let data: &[u8] = bytemuck::cast_slice(vertices);
        let size = data.len() as vk::DeviceSize;

        let fits = |(page, used): &(BufferAllocation, vk::DeviceSize)| used + size <= page.size;
        if !self.current.as_ref().is_some_and(fits) {
            if let Some((page, _)) = self.current.take() {
                self.in_flight.push((submission, page));
            }
            let page = match self.free.iter().position(|page| page.size >= size) {
                Some(index) => self.free.swap_remove(index),
                None => device.create_buffer(
                    size.max(VERTEX_BUFFER_PAGE_SIZE),
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    MemoryLocation::Upload,
                )?,
            };
            self.current = Some((page, 0));
        }

        let Some((page, used)) = self.current.as_mut() else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let offset = *used;
        device.write_buffer(page, offset, data)?;
        *used = (offset + size).next_multiple_of(VERTEX_ALIGNMENT);
        Ok((page.buffer, offset))
    }

    /// Retires the current page with the submission that's ending.
    pub fn end_submission(&mut self, submission: u64) {
        if let Some((page, _)) = self.current.take() {
            self.in_flight.push((submission, page));
        }
    }

    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        let (completed, in_flight): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|&(submission, _)| submission <= completed_submission);
        self.in_flight = in_flight;
        self.free.extend(completed.into_iter().map(|(_, page)| page));
    }

    /// Every page must be unused by the GPU.
    pub fn destroy<D: Device>(&mut self, device: &D) {
        let current = self.current.take().map(|(page, _)| page);
        let in_flight = self.in_flight.drain(..).map(|(_, page)| page);
        for page in current.into_iter().chain(in_flight).chain(self.free.drain(..)) {
            device.destroy(DeviceObject::Buffer(page));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::tiles::ResolutionScale;
    use crate::edram::RenderTargetFormat;
    use crate::vulkan::device::fake::{capable_features, FakeDevice};
    use crate::vulkan::render_target::RenderTargetParameters;
    use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};

    fn setup(
        sample_rate_shading: bool,
    ) -> (FakeDevice, DescriptorSetLayouts, TransferPipelines, RenderPassCache) {
        let mut features = capable_features();
        features.sample_rate_shading = sample_rate_shading;
        let device = FakeDevice::new(features);
        let set_layouts = DescriptorSetLayouts::new(&device, 1).unwrap();
        let options = TransferPipelineOptions {
            shaders: ShaderOptions { sample_rate_shading, ..ShaderOptions::default() },
            depth_transfer_not_equal_test: true,
        };
        let pipelines = TransferPipelines::new(&device, &set_layouts, options).unwrap();
        let render_passes = RenderPassCache::new(
            RenderTargetParameters {
                resolution_scale: ResolutionScale::NATIVE,
                native_2x_msaa: true,
                gamma_as_srgb: false,
                depth_unorm24: true,
                max_host_height: 16384,
            },
            vk::Extent2D { width: 16384, height: 16384 },
        );
        (device, set_layouts, pipelines, render_passes)
    }

    fn depth_key(dest_msaa: MsaaSamples) -> TransferShaderKey {
        TransferShaderKey {
            source_format: RenderTargetFormat::Color(ColorRenderTargetFormat::K8888),
            source_msaa: MsaaSamples::X1,
            dest_format: RenderTargetFormat::Depth(DepthRenderTargetFormat::D24S8),
            dest_msaa,
            host_depth_source: None,
            output: TransferOutput::Depth,
            dest_sample: None,
        }
    }

    #[test]
    fn layouts_cover_every_kind() {
        let indices: Vec<_> = TransferLayoutKind::all().iter().map(|kind| kind.index()).collect();
        assert_eq!(indices, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn sample_rate_shading_needs_one_pipeline() {
        let (device, set_layouts, mut pipelines, mut render_passes) = setup(true);
        let render_pass_key = RenderPassKey::default()
            .with_msaa_samples_bits(MsaaSamples::X4.bits())
            .with_depth_and_color_used(1);
        let created = pipelines
            .pipelines(&device, &mut render_passes, render_pass_key, depth_key(MsaaSamples::X4))
            .unwrap();
        assert_eq!(created.len(), 1);
        let recorded = device.graphics_pipelines.borrow();
        assert_eq!(recorded[0].sample_mask, None);
        assert_eq!(recorded[0].flags, vk::PipelineCreateFlags::empty());
        drop(recorded);

        pipelines.destroy(&device);
        render_passes.destroy(&device);
        set_layouts.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn pipeline_per_sample_without_sample_rate_shading() {
        let (device, set_layouts, mut pipelines, mut render_passes) = setup(false);
        let render_pass_key = RenderPassKey::default()
            .with_msaa_samples_bits(MsaaSamples::X4.bits())
            .with_depth_and_color_used(1);
        let key = depth_key(MsaaSamples::X4);
        let created =
            pipelines.pipelines(&device, &mut render_passes, render_pass_key, key).unwrap();
        assert_eq!(created.len(), 4);
        {
            let recorded = device.graphics_pipelines.borrow();
            let masks: Vec<_> = recorded.iter().map(|pipeline| pipeline.sample_mask).collect();
            assert_eq!(masks, [Some(1), Some(2), Some(4), Some(8)]);
            assert_eq!(recorded[0].flags, vk::PipelineCreateFlags::ALLOW_DERIVATIVES);
            assert_eq!(recorded[3].flags, vk::PipelineCreateFlags::DERIVATIVE);
        }
        // One fragment shader per sample and the vertex shader
        assert_eq!(device.shader_modules.get(), 5);

        // Memoized
        let again = pipelines.pipelines(&device, &mut render_passes, render_pass_key, key).unwrap();
        assert_eq!(again, created);
        assert_eq!(device.graphics_pipelines.borrow().len(), 4);

        pipelines.destroy(&device);
        render_passes.destroy(&device);
        set_layouts.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn failures_are_not_retried() {
        let (device, set_layouts, mut pipelines, mut render_passes) = setup(true);
        device.fail_graphics_pipelines.set(true);
        let render_pass_key = RenderPassKey::default().with_depth_and_color_used(1);
        let key = depth_key(MsaaSamples::X1);
        assert_eq!(pipelines.pipelines(&device, &mut render_passes, render_pass_key, key), None);
        device.fail_graphics_pipelines.set(false);
        assert_eq!(pipelines.pipelines(&device, &mut render_passes, render_pass_key, key), None);
        assert!(device.graphics_pipelines.borrow().is_empty());

        pipelines.destroy(&device);
        render_passes.destroy(&device);
        set_layouts.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn vertex_pages_are_reused_after_completion() {
        let device = FakeDevice::new(capable_features());
        let mut pool = TransferVertexBufferPool::new();
        let quad = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0]];
        let (buffer, offset) = pool.upload(&device, 1, &quad).unwrap();
        assert_eq!(offset, 0);
        let (same_buffer, offset) = pool.upload(&device, 1, &quad).unwrap();
        assert_eq!(same_buffer, buffer);
        assert_eq!(offset, 32);

        pool.end_submission(1);
        let (second, _) = pool.upload(&device, 2, &quad).unwrap();
        assert_ne!(second, buffer);
        pool.end_submission(2);

        pool.completed_submission_updated(1);
        let (reused, offset) = pool.upload(&device, 3, &quad).unwrap();
        assert_eq!(reused, buffer);
        assert_eq!(offset, 0);

        pool.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
