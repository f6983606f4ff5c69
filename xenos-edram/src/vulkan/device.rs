//! The subset of the Vulkan device that the render target cache creates objects with

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;

/// Capabilities of the physical device that affect how EDRAM is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub fragment_shader_sample_interlock: bool,
    pub fragment_shader_pixel_interlock: bool,
    pub fragment_stores_and_atomics: bool,
    pub sample_rate_shading: bool,
    pub standard_sample_locations: bool,
    pub shader_stencil_export: bool,
    // D24_UNORM_S8_UINT usable as a sampled depth attachment
    pub depth_unorm24: bool,
    pub max_image_dimension_2d: u32,
    pub max_framebuffer_width: u32,
    pub max_framebuffer_height: u32,
    pub max_storage_buffer_range: u32,
    pub max_per_stage_descriptor_storage_buffers: u32,
    pub framebuffer_color_sample_counts: vk::SampleCountFlags,
    pub framebuffer_depth_sample_counts: vk::SampleCountFlags,
    pub framebuffer_stencil_sample_counts: vk::SampleCountFlags,
    pub sampled_image_color_sample_counts: vk::SampleCountFlags,
    pub sampled_image_integer_sample_counts: vk::SampleCountFlags,
    pub sampled_image_depth_sample_counts: vk::SampleCountFlags,
    pub sampled_image_stencil_sample_counts: vk::SampleCountFlags,
}

impl DeviceFeatures {
    /// Reads the capabilities of the physical device, `enabled_extensions` being the device
    /// extensions the logical device was created with.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to `instance`, which must be Vulkan 1.1 or newer.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        enabled_extensions: &[&CStr],
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let limits = properties.limits;

        let has_extension = |name: &CStr| enabled_extensions.contains(&name);
        let mut interlock = vk::PhysicalDeviceFragmentShaderInterlockFeaturesEXT::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        if has_extension(ash::ext::fragment_shader_interlock::NAME) {
            features2 = features2.push_next(&mut interlock);
        }
        instance.get_physical_device_features2(physical_device, &mut features2);
        let features = features2.features;

        let depth_unorm24 = instance
            .get_physical_device_format_properties(physical_device, vk::Format::D24_UNORM_S8_UINT)
            .optimal_tiling_features
            .contains(
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::FormatFeatureFlags::SAMPLED_IMAGE,
            );

        Self {
            fragment_shader_sample_interlock: interlock.fragment_shader_sample_interlock != 0,
            fragment_shader_pixel_interlock: interlock.fragment_shader_pixel_interlock != 0,
            fragment_stores_and_atomics: features.fragment_stores_and_atomics != 0,
            sample_rate_shading: features.sample_rate_shading != 0,
            standard_sample_locations: limits.standard_sample_locations != 0,
            shader_stencil_export: has_extension(ash::ext::shader_stencil_export::NAME),
            depth_unorm24,
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_framebuffer_width: limits.max_framebuffer_width,
            max_framebuffer_height: limits.max_framebuffer_height,
            max_storage_buffer_range: limits.max_storage_buffer_range,
            max_per_stage_descriptor_storage_buffers: limits
                .max_per_stage_descriptor_storage_buffers,
            framebuffer_color_sample_counts: limits.framebuffer_color_sample_counts,
            framebuffer_depth_sample_counts: limits.framebuffer_depth_sample_counts,
            framebuffer_stencil_sample_counts: limits.framebuffer_stencil_sample_counts,
            sampled_image_color_sample_counts: limits.sampled_image_color_sample_counts,
            sampled_image_integer_sample_counts: limits.sampled_image_integer_sample_counts,
            sampled_image_depth_sample_counts: limits.sampled_image_depth_sample_counts,
            sampled_image_stencil_sample_counts: limits.sampled_image_stencil_sample_counts,
        }
    }

    /// Whether 2x multisampled attachments can be drawn and sampled, otherwise 2x is drawn as
    /// two of the samples of 4x.
    pub fn supports_native_2x_msaa(&self) -> bool {
        [
            self.framebuffer_color_sample_counts,
            self.framebuffer_depth_sample_counts,
            self.framebuffer_stencil_sample_counts,
            self.sampled_image_color_sample_counts,
            self.sampled_image_integer_sample_counts,
            self.sampled_image_depth_sample_counts,
            self.sampled_image_stencil_sample_counts,
        ]
        .into_iter()
        .all(|counts| counts.contains(vk::SampleCountFlags::TYPE_2))
    }

    /// Whether fragment shaders can emulate the output merger on the EDRAM buffer directly.
    pub fn supports_pixel_shader_interlock(&self) -> bool {
        // EDRAM, shared memory and the guest shaders' own buffers
        const MIN_STORAGE_BUFFERS: u32 = 4;

        self.fragment_shader_sample_interlock
            && self.fragment_stores_and_atomics
            && self.sample_rate_shading
            && self.standard_sample_locations
            && self.max_per_stage_descriptor_storage_buffers >= MIN_STORAGE_BUFFERS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    // Host-visible and coherent, written with `Device::write_buffer`
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

/// An object to release with `Device::destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceObject {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
    ImageView(vk::ImageView),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    PipelineLayout(vk::PipelineLayout),
    ShaderModule(vk::ShaderModule),
    Pipeline(vk::Pipeline),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
}

/// Object creation and descriptor updates used by the render target cache. Commands are not
/// recorded through this, see `DeferredCommandBuffer`.
pub trait Device {
    fn features(&self) -> &DeviceFeatures;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> VkResult<BufferAllocation>;

    /// Writes to a buffer created in `MemoryLocation::Upload`.
    fn write_buffer(
        &self,
        allocation: &BufferAllocation,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()>;

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<ImageAllocation>;

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout>;

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool>;

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet);

    /// Points `binding` of the set at a range of a storage buffer.
    fn write_storage_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    );

    /// Points bindings `0..views.len()` of the set at sampled images in the shader read layout.
    fn write_sampled_images(&self, set: vk::DescriptorSet, views: &[vk::ImageView]);

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout>;

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
    ) -> VkResult<vk::Pipeline>;

    /// Creates the pipelines as one batch, none are left if any fails.
    fn create_graphics_pipelines(
        &self,
        infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>>;

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass>;

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>)
        -> VkResult<vk::Framebuffer>;

    fn destroy(&self, object: DeviceObject);
}

/// `Device` over an `ash` logical device.
pub struct AshDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: DeviceFeatures,
}

impl AshDevice {
    pub fn new(
        device: ash::Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        features: DeviceFeatures,
    ) -> Self {
        Self { device, memory_properties, features }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn memory_type_index(
        &self,
        type_bits: u32,
        location: MemoryLocation,
    ) -> VkResult<u32> {
        let required = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::Upload => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|&(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(self.memory_type_index(requirements.memory_type_bits, location)?);
        unsafe { self.device.allocate_memory(&info, None) }
    }
}

impl Device for AshDevice {
    fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> VkResult<BufferAllocation> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe {
            let buffer = self.device.create_buffer(&info, None)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let memory = match self.allocate(requirements, location) {
                Ok(memory) => memory,
                Err(err) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(err);
                }
            };
            if let Err(err) = self.device.bind_buffer_memory(buffer, memory, 0) {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
                return Err(err);
            }
            Ok(BufferAllocation { buffer, memory, size })
        }
    }

    fn write_buffer(
        &self,
        allocation: &BufferAllocation,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        debug_assert!(offset + data.len() as u64 <= allocation.size);
        unsafe {
            let mapping = self.device.map_memory(
                allocation.memory,
                offset,
                data.len() as u64,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapping.cast::<u8>(), data.len());
            self.device.unmap_memory(allocation.memory);
        }
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<ImageAllocation> {
        unsafe {
            let image = self.device.create_image(info, None)?;
            let requirements = self.device.get_image_memory_requirements(image);
            let memory = match self.allocate(requirements, MemoryLocation::DeviceLocal) {
                Ok(memory) => memory,
                Err(err) => {
                    self.device.destroy_image(image, None);
                    return Err(err);
                }
            };
            if let Err(err) = self.device.bind_image_memory(image, memory, 0) {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
                return Err(err);
            }
            Ok(ImageAllocation { image, memory })
        }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        unsafe { self.device.create_descriptor_set_layout(info, None) }
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        unsafe { self.device.create_descriptor_pool(info, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info =
            vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(err) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            log::error!("Failed to free a descriptor set: {err}");
        }
    }

    fn write_storage_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo { buffer, offset, range }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    fn write_sampled_images(&self, set: vk::DescriptorSet, views: &[vk::ImageView]) {
        let image_infos: Vec<_> = views
            .iter()
            .map(|&image_view| vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let writes: Vec<_> = image_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        unsafe { self.device.create_pipeline_layout(info, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
    ) -> VkResult<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_graphics_pipelines(
        &self,
        infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>> {
        unsafe {
            self.device.create_graphics_pipelines(vk::PipelineCache::null(), infos, None).map_err(
                |(pipelines, err)| {
                    let created =
                        pipelines.into_iter().filter(|pipeline| *pipeline != vk::Pipeline::null());
                    for pipeline in created {
                        self.device.destroy_pipeline(pipeline, None);
                    }
                    err
                },
            )
        }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy(&self, object: DeviceObject) {
        unsafe {
            match object {
                DeviceObject::Buffer(allocation) => {
                    self.device.destroy_buffer(allocation.buffer, None);
                    self.device.free_memory(allocation.memory, None);
                }
                DeviceObject::Image(allocation) => {
                    self.device.destroy_image(allocation.image, None);
                    self.device.free_memory(allocation.memory, None);
                }
                DeviceObject::ImageView(view) => self.device.destroy_image_view(view, None),
                DeviceObject::DescriptorSetLayout(layout) => {
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                DeviceObject::DescriptorPool(pool) => {
                    self.device.destroy_descriptor_pool(pool, None);
                }
                DeviceObject::PipelineLayout(layout) => {
                    self.device.destroy_pipeline_layout(layout, None);
                }
                DeviceObject::ShaderModule(module) => {
                    self.device.destroy_shader_module(module, None);
                }
                DeviceObject::Pipeline(pipeline) => self.device.destroy_pipeline(pipeline, None),
                DeviceObject::RenderPass(render_pass) => {
                    self.device.destroy_render_pass(render_pass, None);
                }
                DeviceObject::Framebuffer(framebuffer) => {
                    self.device.destroy_framebuffer(framebuffer, None);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interlock_requirements() {
        let mut features = fake::capable_features();
        assert!(features.supports_pixel_shader_interlock());
        assert!(features.supports_native_2x_msaa());

        features.sample_rate_shading = false;
        assert!(!features.supports_pixel_shader_interlock());

        features = fake::capable_features();
        features.sampled_image_integer_sample_counts = vk::SampleCountFlags::TYPE_4;
        assert!(!features.supports_native_2x_msaa());
    }
}
