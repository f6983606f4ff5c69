//! Descriptor set layouts shared by the cache's pipelines, and pools of single-type descriptor
//! sets that grow page by page

use crate::vulkan::device::{Device, DeviceObject};
use ash::prelude::VkResult;
use ash::vk;

/// Sets per pool page.
const SETS_PER_PAGE: u32 = 256;

/// Allocates descriptor sets of one layout made of `descriptors_per_set` descriptors of one
/// type, creating pool pages as needed.
#[derive(Debug)]
pub struct DescriptorSetPool {
    descriptor_type: vk::DescriptorType,
    descriptors_per_set: u32,
    layout: vk::DescriptorSetLayout,
    // Pool and the number of sets still free in it
    pages: Vec<(vk::DescriptorPool, u32)>,
}

/// A set allocated from a `DescriptorSetPool`, returned to it with `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledDescriptorSet {
    pub set: vk::DescriptorSet,
    page: usize,
}

impl DescriptorSetPool {
    pub fn new(
        descriptor_type: vk::DescriptorType,
        descriptors_per_set: u32,
        layout: vk::DescriptorSetLayout,
    ) -> Self {
        Self { descriptor_type, descriptors_per_set, layout, pages: Vec::new() }
    }

    pub fn allocate<D: Device>(&mut self, device: &D) -> VkResult<PooledDescriptorSet> {
        let page = match self.pages.iter().position(|&(_, free)| free > 0) {
            Some(page) => page,
            None => {
                let pool_sizes = [vk::DescriptorPoolSize {
                    ty: self.descriptor_type,
                    descriptor_count: self.descriptors_per_set * SETS_PER_PAGE,
                }];
                let info = vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(SETS_PER_PAGE)
                    .pool_sizes(&pool_sizes);
                let pool = device.create_descriptor_pool(&info)?;
                self.pages.push((pool, SETS_PER_PAGE));
                self.pages.len() - 1
            }
        };
        let (pool, free) = &mut self.pages[page];
        let set = device.allocate_descriptor_set(*pool, self.layout)?;
        *free -= 1;
        Ok(PooledDescriptorSet { set, page })
    }

    pub fn free<D: Device>(&mut self, device: &D, set: PooledDescriptorSet) {
        let (pool, free) = &mut self.pages[set.page];
        device.free_descriptor_set(*pool, set.set);
        *free += 1;
        debug_assert!(*free <= SETS_PER_PAGE);
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for (pool, _) in self.pages.drain(..) {
            device.destroy(DeviceObject::DescriptorPool(pool));
        }
    }
}

/// Layouts of the descriptor sets bound by the cache's pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetLayouts {
    // One storage buffer visible to fragment and compute shaders
    pub storage_buffer: vk::DescriptorSetLayout,
    // The guest shared memory split into `binding_count` storage buffers
    pub shared_memory: vk::DescriptorSetLayout,
    // A color render target as a sampled image
    pub sampled_image: vk::DescriptorSetLayout,
    // Depth and stencil of a depth render target as two sampled images
    pub sampled_image_x2: vk::DescriptorSetLayout,
}

impl DescriptorSetLayouts {
    pub fn new<D: Device>(device: &D, shared_memory_binding_count: u32) -> VkResult<Self> {
        let stages = vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE;
        let mut created = Vec::with_capacity(4);
        let mut create = |descriptor_type: vk::DescriptorType, count: u32| -> VkResult<_> {
            let bindings: Vec<_> = (0..count)
                .map(|binding| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(binding)
                        .descriptor_type(descriptor_type)
                        .descriptor_count(1)
                        .stage_flags(stages)
                })
                .collect();
            let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            let layout = device.create_descriptor_set_layout(&info)?;
            created.push(layout);
            Ok(layout)
        };

        let result = (|| -> VkResult<Self> {
            Ok(Self {
                storage_buffer: create(vk::DescriptorType::STORAGE_BUFFER, 1)?,
                shared_memory: create(
                    vk::DescriptorType::STORAGE_BUFFER,
                    shared_memory_binding_count.max(1),
                )?,
                sampled_image: create(vk::DescriptorType::SAMPLED_IMAGE, 1)?,
                sampled_image_x2: create(vk::DescriptorType::SAMPLED_IMAGE, 2)?,
            })
        })();
        if result.is_err() {
            for layout in created {
                device.destroy(DeviceObject::DescriptorSetLayout(layout));
            }
        }
        result
    }

    pub fn destroy<D: Device>(&self, device: &D) {
        for layout in
            [self.storage_buffer, self.shared_memory, self.sampled_image, self.sampled_image_x2]
        {
            device.destroy(DeviceObject::DescriptorSetLayout(layout));
        }
    }
}
