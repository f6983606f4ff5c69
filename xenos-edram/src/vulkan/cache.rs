//! The render target cache: keeps the host render targets or the EDRAM buffer in sync with what
//! the guest draws, copies the EDRAM to guest memory in resolves, and clears it

use crate::config::{ConfigError, RenderTargetCacheConfig, RenderTargetPathConfig};
use crate::edram::bindings::{
    color_slot, BindingAccumulator, BindingLimits, DrawBindings, DEPTH_SLOT, SLOT_COUNT,
};
use crate::edram::ownership::{OwnershipMap, Rectangle, Transfer};
use crate::edram::resolve::{
    EdramTileSpan, ResolveError, ResolveInfo, ResolveOptions, ResolveRegisters,
};
use crate::edram::formats::HostColor;
use crate::edram::tiles::ResolutionScale;
use crate::edram::RenderTargetKey;
use crate::registers::RenderTargetRegisters;
use crate::shaders::dump::{dump_group_count, DumpShaderKey};
use crate::shaders::host_depth_store::{
    host_depth_store_group_count, HostDepthStoreConstants, HostDepthStoreRectangle,
    HostDepthStoreRenderTarget,
};
use crate::shaders::transfer::{
    HostDepthAddress, HostDepthSource, TransferConstants, TransferOutput, TransferShaderKey,
};
use crate::shaders::ShaderOptions;
use crate::vulkan::commands::{
    BufferBarrier, ClearAttachment, ClearValue, DeferredCommandBuffer, Viewport,
};
use crate::vulkan::descriptors::{DescriptorSetLayouts, DescriptorSetPool, PooledDescriptorSet};
use crate::vulkan::device::{BufferAllocation, Device, DeviceObject, MemoryLocation};
use crate::vulkan::dump::{DumpPipelines, DUMP_OFFSETS_OFFSET, DUMP_PITCHES_OFFSET};
use crate::vulkan::edram_buffer::{
    EdramBufferBarrier, EdramBufferModification, EdramBufferState, EdramBufferUsage,
};
use crate::vulkan::render_pass::{Framebuffer, RenderPassCache, RenderPassKey};
use crate::vulkan::render_target::{
    is_host_depth_encoding_different, RenderTargetParameters, RenderTargetUsage, VulkanRenderTarget,
};
use crate::vulkan::resolve::{HostDepthStorePipelines, ResolveClearPipelines, ResolveCopyPipelines};
use crate::vulkan::transfer::{
    TransferLayoutKind, TransferPipelineOptions, TransferPipelines, TransferVertexBufferPool,
};
use crate::vulkan::ShaderModuleError;
use crate::xenos::{ColorRenderTargetFormat, EDRAM_TILE_COUNT, MAX_COLOR_RENDER_TARGETS};
use ash::vk;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create {what}: {err}")]
    Vulkan { what: &'static str, err: vk::Result },
    #[error(transparent)]
    Shader(#[from] ShaderModuleError),
    #[error("EDRAM buffer of {size} bytes exceeds the maximum storage buffer range {max}")]
    EdramBufferTooLarge { size: u64, max: u32 },
}

impl InitializationError {
    pub fn vulkan(what: &'static str, err: vk::Result) -> Self {
        Self::Vulkan { what, err }
    }
}

/// How the EDRAM is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTargetPath {
    // Host render targets, with ownership transfers between them
    HostRenderTargets,
    // Fragment shaders read-modify-write the EDRAM buffer inside a fragment shader interlock
    PixelShaderInterlock,
}

impl RenderTargetPath {
    fn choose(requested: RenderTargetPathConfig, interlock_supported: bool) -> Self {
        match requested {
            RenderTargetPathConfig::HostRenderTargets => Self::HostRenderTargets,
            RenderTargetPathConfig::PixelShaderInterlock if interlock_supported => {
                Self::PixelShaderInterlock
            }
            RenderTargetPathConfig::PixelShaderInterlock => {
                log::warn!(
                    "Pixel shader interlock requested, but the device doesn't support it, using host render targets"
                );
                Self::HostRenderTargets
            }
            RenderTargetPathConfig::Auto if interlock_supported => Self::PixelShaderInterlock,
            RenderTargetPathConfig::Auto => Self::HostRenderTargets,
        }
    }
}

/// Guest memory as seen by resolves.
pub trait SharedMemory {
    /// Makes the range resident for writing by the GPU, `false` if that failed.
    fn request_range(&mut self, start: u32, length: u32) -> bool;

    /// Records the barriers needed before compute shaders write the range.
    fn use_for_compute_write(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        start: u32,
        length: u32,
    );

    /// The set binding the whole shared memory to resolve copy shaders.
    fn descriptor_set(&self) -> vk::DescriptorSet;
}

/// What resolves need from the texture cache.
pub trait TextureCache {
    /// Textures in the range are outdated after a resolve wrote it.
    fn mark_range_as_resolved(&mut self, start: u32, length: u32);

    fn ensure_scaled_resolve_memory_committed(&mut self, start: u32, length: u32) -> bool;

    /// Binds the resolution-scaled copy of the range, based at `start`, and records the barriers
    /// for compute writes to it.
    fn scaled_resolve_descriptor_set(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        start: u32,
        length: u32,
    ) -> Option<vk::DescriptorSet>;
}

/// Guest memory written by a resolve copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolvedRange {
    pub address: u32,
    pub length: u32,
}

#[derive(Debug)]
struct EdramBuffer {
    allocation: BufferAllocation,
    descriptor_pool: DescriptorSetPool,
    descriptor_set: Option<PooledDescriptorSet>,
    state: EdramBufferState,
}

impl EdramBuffer {
    fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set.map_or(vk::DescriptorSet::null(), |set| set.set)
    }

    fn push_barrier(&self, commands: &mut DeferredCommandBuffer, barrier: EdramBufferBarrier) {
        if commands.is_in_render_pass() {
            commands.end_render_pass();
        }
        commands.push_buffer_barrier(
            barrier.src_stage,
            barrier.dst_stage,
            BufferBarrier {
                buffer: self.allocation.buffer,
                src_access: barrier.src_access,
                dst_access: barrier.dst_access,
                offset: 0,
                size: vk::WHOLE_SIZE,
            },
        );
    }

    fn use_as(&mut self, commands: &mut DeferredCommandBuffer, usage: EdramBufferUsage) {
        if let Some(barrier) = self.state.use_as(usage) {
            self.push_barrier(commands, barrier);
        }
    }

    fn commit_shader_writes(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        threshold: EdramBufferModification,
    ) {
        if let Some(barrier) = self.state.commit_shader_writes(threshold) {
            self.push_barrier(commands, barrier);
        }
    }

    // Dispatches after this may overwrite what earlier ones wrote
    fn use_for_compute_write(&mut self, commands: &mut DeferredCommandBuffer) {
        self.use_as(commands, EdramBufferUsage::ComputeWrite);
        self.commit_shader_writes(commands, EdramBufferModification::ViaUnordered);
    }
}

/// Ownership transfers into one render target, optionally followed by a resolve clear of it.
#[derive(Debug)]
struct DestinationWork {
    dest: RenderTargetKey,
    transfers: Vec<Transfer>,
    // Render target pixels, excluded from the transfers
    clear: Option<(Rectangle, ClearValue)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RenderPassInProgress {
    render_pass: vk::RenderPass,
    framebuffer: Framebuffer,
}

// Transfer draws sharing the pipelines and the descriptor sets
#[derive(Debug)]
struct TransferGroup {
    shader: TransferShaderKey,
    source: RenderTargetKey,
    host_depth_source: Option<RenderTargetKey>,
    rectangles: Vec<Rectangle>,
}

pub struct RenderTargetCache<D: Device> {
    device: D,
    path: RenderTargetPath,
    resolution_scale: ResolutionScale,
    parameters: RenderTargetParameters,
    shader_options: ShaderOptions,
    binding_limits: BindingLimits,
    max_render_target_width: u32,
    max_render_target_height: u32,
    native_stencil_value_output: bool,
    edram_16_as_minus_1_to_1: bool,

    set_layouts: DescriptorSetLayouts,
    edram: EdramBuffer,
    color_descriptor_pool: DescriptorSetPool,
    depth_descriptor_pool: DescriptorSetPool,
    render_passes: RenderPassCache,
    resolve_copy: Option<ResolveCopyPipelines>,
    // Pixel shader interlock path
    resolve_clear: Option<ResolveClearPipelines>,
    null_render_pass: Option<(vk::RenderPass, Framebuffer)>,
    // Host render target path
    transfer: Option<TransferPipelines>,
    dump: Option<DumpPipelines>,
    host_depth_store: Option<HostDepthStorePipelines>,
    vertex_buffers: TransferVertexBufferPool,

    // Failed creations are kept as `None`
    render_targets: HashMap<RenderTargetKey, Option<VulkanRenderTarget>>,
    ownership: OwnershipMap,
    accumulator: BindingAccumulator,
    in_progress: Option<RenderPassInProgress>,
    last_update_render_pass_key: RenderPassKey,
    submission: u64,
}

impl<D: Device> RenderTargetCache<D> {
    /// Chooses the path and creates everything both paths need up front. Nothing is left
    /// allocated on failure.
    pub fn initialize(
        config: &RenderTargetCacheConfig,
        device: D,
        shared_memory_binding_count: u32,
    ) -> Result<Self, InitializationError> {
        let features = *device.features();
        let path = RenderTargetPath::choose(
            config.render_target_path()?,
            features.supports_pixel_shader_interlock(),
        );
        let (scale_x, scale_y) = config.resolution_scale();
        let resolution_scale = ResolutionScale::new(scale_x, scale_y);
        let max_render_target_width =
            features.max_framebuffer_width.min(features.max_image_dimension_2d);
        let max_render_target_height =
            features.max_framebuffer_height.min(features.max_image_dimension_2d);
        let native_2x_msaa = config.native_2x_msaa && features.supports_native_2x_msaa();
        let edram_16_as_minus_1_to_1 =
            path == RenderTargetPath::HostRenderTargets && !config.snorm16_render_target_full_range;

        let edram_size =
            u64::from(EDRAM_TILE_COUNT) * u64::from(resolution_scale.tile_dwords()) * 4;
        if edram_size > u64::from(features.max_storage_buffer_range) {
            return Err(InitializationError::EdramBufferTooLarge {
                size: edram_size,
                max: features.max_storage_buffer_range,
            });
        }

        let parameters = RenderTargetParameters {
            resolution_scale,
            native_2x_msaa,
            gamma_as_srgb: config.gamma_render_target_as_srgb,
            depth_unorm24: features.depth_unorm24,
            max_host_height: max_render_target_height,
        };
        let shader_options = ShaderOptions {
            resolution_scale,
            native_2x_msaa,
            sample_rate_shading: features.sample_rate_shading,
            depth_float24_round: config.depth_float24_conversion.rounds(),
            edram_16_as_minus_1_to_1,
        };

        let set_layouts = DescriptorSetLayouts::new(&device, shared_memory_binding_count)
            .map_err(|err| InitializationError::vulkan("descriptor set layouts", err))?;
        let mut cache = Self {
            path,
            resolution_scale,
            parameters,
            shader_options,
            binding_limits: BindingLimits {
                resolution_scale_y: scale_y,
                max_host_height: max_render_target_height,
                mrt_edram_used_range_clamp_to_min: config.mrt_edram_used_range_clamp_to_min,
            },
            max_render_target_width,
            max_render_target_height,
            native_stencil_value_output: features.shader_stencil_export
                && config.native_stencil_value_output,
            edram_16_as_minus_1_to_1,
            edram: EdramBuffer {
                allocation: BufferAllocation {
                    buffer: vk::Buffer::null(),
                    memory: vk::DeviceMemory::null(),
                    size: 0,
                },
                descriptor_pool: DescriptorSetPool::new(
                    vk::DescriptorType::STORAGE_BUFFER,
                    1,
                    set_layouts.storage_buffer,
                ),
                descriptor_set: None,
                state: EdramBufferState::new(),
            },
            color_descriptor_pool: DescriptorSetPool::new(
                vk::DescriptorType::SAMPLED_IMAGE,
                1,
                set_layouts.sampled_image,
            ),
            // Depth and stencil
            depth_descriptor_pool: DescriptorSetPool::new(
                vk::DescriptorType::SAMPLED_IMAGE,
                2,
                set_layouts.sampled_image_x2,
            ),
            set_layouts,
            render_passes: RenderPassCache::new(
                parameters,
                vk::Extent2D { width: max_render_target_width, height: max_render_target_height },
            ),
            resolve_copy: None,
            resolve_clear: None,
            null_render_pass: None,
            transfer: None,
            dump: None,
            host_depth_store: None,
            vertex_buffers: TransferVertexBufferPool::new(),
            render_targets: HashMap::new(),
            ownership: OwnershipMap::new(),
            accumulator: BindingAccumulator::default(),
            in_progress: None,
            last_update_render_pass_key: RenderPassKey::default(),
            submission: 1,
            device,
        };

        match cache.create_objects(config, edram_size) {
            Ok(()) => {
                log::info!(
                    "Render target cache using {path:?} at {scale_x}x{scale_y} resolution scale"
                );
                Ok(cache)
            }
            Err(err) => {
                log::error!("Failed to initialize the render target cache: {err}");
                cache.destroy_objects();
                Err(err)
            }
        }
    }

    fn create_objects(
        &mut self,
        config: &RenderTargetCacheConfig,
        edram_size: u64,
    ) -> Result<(), InitializationError> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        self.edram.allocation = self
            .device
            .create_buffer(edram_size, usage, MemoryLocation::DeviceLocal)
            .map_err(|err| InitializationError::vulkan("EDRAM buffer", err))?;
        let set = self
            .edram
            .descriptor_pool
            .allocate(&self.device)
            .map_err(|err| InitializationError::vulkan("EDRAM buffer descriptor set", err))?;
        self.device.write_storage_buffer(set.set, 0, self.edram.allocation.buffer, 0, edram_size);
        self.edram.descriptor_set = Some(set);

        self.resolve_copy =
            Some(ResolveCopyPipelines::new(&self.device, &self.set_layouts, &self.shader_options)?);

        match self.path {
            RenderTargetPath::HostRenderTargets => {
                self.transfer = Some(TransferPipelines::new(
                    &self.device,
                    &self.set_layouts,
                    TransferPipelineOptions {
                        shaders: self.shader_options,
                        depth_transfer_not_equal_test: config.depth_transfer_not_equal_test,
                    },
                )?);
                self.dump =
                    Some(DumpPipelines::new(&self.device, &self.set_layouts, self.shader_options)?);
                self.host_depth_store = Some(HostDepthStorePipelines::new(
                    &self.device,
                    &self.set_layouts,
                    &self.shader_options,
                )?);
            }
            RenderTargetPath::PixelShaderInterlock => {
                self.resolve_clear = Some(ResolveClearPipelines::new(
                    &self.device,
                    &self.set_layouts,
                    &self.shader_options,
                )?);
                let key = RenderPassKey::default();
                let render_pass = self
                    .render_passes
                    .render_pass(&self.device, key)
                    .ok_or(InitializationError::vulkan(
                        "null render pass",
                        vk::Result::ERROR_UNKNOWN,
                    ))?;
                let framebuffer = self
                    .render_passes
                    .framebuffer(&self.device, key, 0, &[None; SLOT_COUNT])
                    .ok_or(InitializationError::vulkan(
                        "null framebuffer",
                        vk::Result::ERROR_UNKNOWN,
                    ))?;
                self.null_render_pass = Some((render_pass, framebuffer));
            }
        }
        Ok(())
    }

    fn destroy_objects(&mut self) {
        self.render_passes.destroy_framebuffers(&self.device);
        for render_target in
            self.render_targets.drain().filter_map(|(_, render_target)| render_target)
        {
            let pool = if render_target.key().is_depth() {
                &mut self.depth_descriptor_pool
            } else {
                &mut self.color_descriptor_pool
            };
            render_target.destroy(&self.device, pool);
        }
        self.color_descriptor_pool.destroy(&self.device);
        self.depth_descriptor_pool.destroy(&self.device);
        self.render_passes.destroy(&self.device);
        self.null_render_pass = None;

        if let Some(mut transfer) = self.transfer.take() {
            transfer.destroy(&self.device);
        }
        if let Some(mut dump) = self.dump.take() {
            dump.destroy(&self.device);
        }
        if let Some(mut host_depth_store) = self.host_depth_store.take() {
            host_depth_store.destroy(&self.device);
        }
        if let Some(mut resolve_clear) = self.resolve_clear.take() {
            resolve_clear.destroy(&self.device);
        }
        if let Some(mut resolve_copy) = self.resolve_copy.take() {
            resolve_copy.destroy(&self.device);
        }
        self.vertex_buffers.destroy(&self.device);

        if let Some(set) = self.edram.descriptor_set.take() {
            self.edram.descriptor_pool.free(&self.device, set);
        }
        self.edram.descriptor_pool.destroy(&self.device);
        if self.edram.allocation.buffer != vk::Buffer::null() {
            self.device.destroy(DeviceObject::Buffer(self.edram.allocation));
            self.edram.allocation.buffer = vk::Buffer::null();
        }
        self.set_layouts.destroy(&self.device);
    }

    /// Releases every object. The GPU must be done with all of them.
    pub fn shutdown(mut self) -> D {
        self.destroy_objects();
        self.device
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn path(&self) -> RenderTargetPath {
        self.path
    }

    pub fn resolution_scale(&self) -> ResolutionScale {
        self.resolution_scale
    }

    pub fn descriptor_set_layouts(&self) -> &DescriptorSetLayouts {
        &self.set_layouts
    }

    /// The EDRAM buffer set, bound by guest pixel shaders on the pixel shader interlock path.
    pub fn edram_descriptor_set(&self) -> vk::DescriptorSet {
        self.edram.descriptor_set()
    }

    /// Whether translated pixel shaders may export the guest stencil reference.
    pub fn native_stencil_value_output(&self) -> bool {
        self.native_stencil_value_output
    }

    pub fn max_render_target_width(&self) -> u32 {
        self.max_render_target_width
    }

    pub fn max_render_target_height(&self) -> u32 {
        self.max_render_target_height
    }

    /// Render pass of the last successful `update`.
    pub fn last_update_render_pass_key(&self) -> RenderPassKey {
        self.last_update_render_pass_key
    }

    /// Framebuffer of the render pass begun by the last `update`, `None` once it has ended.
    pub fn last_update_framebuffer(&self) -> Option<Framebuffer> {
        self.in_progress.map(|in_progress| in_progress.framebuffer)
    }

    /// Options of resolves that come from the cache rather than the guest.
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            resolution_scale: self.resolution_scale,
            edram_16_as_minus_1_to_1: self.edram_16_as_minus_1_to_1,
            ..ResolveOptions::default()
        }
    }

    pub fn render_target(&self, key: RenderTargetKey) -> Option<&VulkanRenderTarget> {
        self.render_targets.get(&key).and_then(Option::as_ref)
    }

    pub fn ownership(&self) -> &OwnershipMap {
        &self.ownership
    }

    pub fn use_edram_buffer(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        usage: EdramBufferUsage,
    ) {
        self.edram.use_as(commands, usage);
    }

    pub fn mark_edram_buffer_modified(&mut self, modification: EdramBufferModification) {
        self.edram.state.mark_modified(modification);
    }

    pub fn commit_edram_buffer_shader_writes(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        threshold: EdramBufferModification,
    ) {
        self.edram.commit_shader_writes(commands, threshold);
    }

    fn end_render_pass(&mut self, commands: &mut DeferredCommandBuffer) {
        if commands.is_in_render_pass() {
            commands.end_render_pass();
        }
        self.in_progress = None;
    }

    fn render_target_exists(&self, key: RenderTargetKey) -> bool {
        self.render_targets.get(&key).is_some_and(Option::is_some)
    }

    // Failures are remembered, a render target that failed once isn't retried
    fn ensure_render_target(&mut self, key: RenderTargetKey) -> bool {
        if let Some(render_target) = self.render_targets.get(&key) {
            return render_target.is_some();
        }
        let pool = if key.is_depth() {
            &mut self.depth_descriptor_pool
        } else {
            &mut self.color_descriptor_pool
        };
        let render_target = VulkanRenderTarget::create(&self.device, key, &self.parameters, pool)
            .inspect_err(|err| log::error!("Failed to create {key}: {err}"))
            .ok();
        let created = render_target.is_some();
        self.render_targets.insert(key, render_target);
        created
    }

    fn host_depth_encoding_different(&self, key: RenderTargetKey) -> bool {
        key.depth_format().is_some_and(|format| {
            is_host_depth_encoding_different(format, self.parameters.depth_unorm24)
        })
    }

    fn transition_render_target(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        key: RenderTargetKey,
        usage: RenderTargetUsage,
    ) {
        if let Some(Some(render_target)) = self.render_targets.get_mut(&key) {
            if render_target.usage() != usage {
                render_target.transition(commands, usage);
            }
        }
    }

    /// Prepares the render targets or the EDRAM buffer for a draw and begins its render pass.
    /// Returns `false` if the draw must be dropped.
    pub fn update(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        registers: &RenderTargetRegisters,
        is_rasterization_done: bool,
        shader_color_targets_written: u32,
    ) -> bool {
        if !commands.is_in_render_pass() {
            self.in_progress = None;
        }
        let bindings = if is_rasterization_done {
            DrawBindings::from_registers(
                registers,
                shader_color_targets_written,
                &self.binding_limits,
            )
        } else {
            DrawBindings::default()
        };
        match self.path {
            RenderTargetPath::HostRenderTargets => {
                self.update_host_render_targets(commands, registers, &bindings)
            }
            RenderTargetPath::PixelShaderInterlock => {
                self.update_pixel_shader_interlock(commands, &bindings)
            }
        }
    }

    fn update_host_render_targets(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        registers: &RenderTargetRegisters,
        bindings: &DrawBindings,
    ) -> bool {
        for bound in bindings.bound() {
            if !self.ensure_render_target(bound.key) {
                return false;
            }
        }

        let mut bound: Vec<_> = bindings.bound().collect();
        bound.sort_by_key(|bound| bound.key.base_tiles());
        let mut work = Vec::new();
        for target in bound {
            let host_depth_encoding_different = self.host_depth_encoding_different(target.key);
            let mut transfers = Vec::new();
            let render_targets = &self.render_targets;
            self.ownership.change_ownership(
                target.key,
                target.key.base_tiles(),
                target.length_tiles,
                host_depth_encoding_different,
                Some(&mut transfers),
                None,
                |key| render_targets.get(&key).is_some_and(Option::is_some),
            );
            if !transfers.is_empty() {
                work.push(DestinationWork { dest: target.key, transfers, clear: None });
            }
        }

        let keys = bindings.keys();
        if !work.is_empty() {
            self.perform_transfers_and_resolve_clears(commands, &work);
            self.accumulator.invalidate();
        }
        self.accumulator.accumulate(&keys);
        let pass_keys = self.accumulator.keys().copied().unwrap_or(keys);

        let mut srgb_color_slots = 0;
        if self.parameters.gamma_as_srgb {
            let color_infos =
                registers.color_info.iter().enumerate().take(MAX_COLOR_RENDER_TARGETS);
            for (index, info) in color_infos {
                if info.color_format() == Some(ColorRenderTargetFormat::K8888Gamma) {
                    srgb_color_slots |= 1 << index;
                }
            }
        }
        let render_pass_key = RenderPassKey::for_render_targets(
            bindings.msaa_samples,
            &pass_keys,
            srgb_color_slots,
            false,
        );

        let Some(render_pass) = self.render_passes.render_pass(&self.device, render_pass_key) else {
            return false;
        };
        let mut attachments: [Option<&VulkanRenderTarget>; SLOT_COUNT] = [None; SLOT_COUNT];
        for (attachment, key) in attachments.iter_mut().zip(pass_keys) {
            if key.is_empty() {
                continue;
            }
            let Some(Some(render_target)) = self.render_targets.get(&key) else {
                log::error!("{key} is attached, but doesn't exist");
                return false;
            };
            *attachment = Some(render_target);
        }
        let Some(framebuffer) = self.render_passes.framebuffer(
            &self.device,
            render_pass_key,
            bindings.pitch_tiles_at_32bpp,
            &attachments,
        ) else {
            return false;
        };

        let in_progress = RenderPassInProgress { render_pass, framebuffer };
        if self.in_progress != Some(in_progress) {
            self.end_render_pass(commands);
            for (slot, key) in pass_keys.into_iter().enumerate() {
                if !key.is_empty() {
                    let usage = RenderTargetUsage::draw(slot == DEPTH_SLOT);
                    self.transition_render_target(commands, key, usage);
                }
            }
            commands.begin_render_pass(render_pass, framebuffer.framebuffer, framebuffer.extent);
            self.in_progress = Some(in_progress);
        }
        self.last_update_render_pass_key = render_pass_key;
        true
    }

    fn update_pixel_shader_interlock(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        bindings: &DrawBindings,
    ) -> bool {
        let overlaps_other_render_targets = bindings.bound().any(|bound| {
            self.ownership.would_ownership_change_require_transfers(
                bound.key,
                bound.key.base_tiles(),
                bound.length_tiles,
                false,
            )
        });
        if overlaps_other_render_targets {
            self.request_pixel_shader_interlock_barrier(commands);
        }
        for bound in bindings.bound() {
            self.ownership.change_ownership(
                bound.key,
                bound.key.base_tiles(),
                bound.length_tiles,
                false,
                None,
                None,
                |_| true,
            );
        }

        self.edram.use_as(commands, EdramBufferUsage::FragmentReadWrite);
        self.edram.commit_shader_writes(commands, EdramBufferModification::ViaUnordered);
        if !commands.is_in_render_pass() {
            self.in_progress = None;
        }
        let Some((render_pass, framebuffer)) = self.null_render_pass else {
            return false;
        };
        if self.in_progress.is_none() {
            commands.begin_render_pass(render_pass, framebuffer.framebuffer, framebuffer.extent);
            self.in_progress = Some(RenderPassInProgress { render_pass, framebuffer });
        }
        self.edram.state.mark_modified(EdramBufferModification::ViaPixelShaderInterlock);
        self.last_update_render_pass_key = RenderPassKey::default();
        true
    }

    /// Makes earlier interlocked writes visible to the next draws, needed when a draw reads
    /// EDRAM contents another render target wrote. Ends the render pass.
    pub fn request_pixel_shader_interlock_barrier(&mut self, commands: &mut DeferredCommandBuffer) {
        self.end_render_pass(commands);
        self.edram.commit_shader_writes(commands, EdramBufferModification::ViaPixelShaderInterlock);
        self.ownership.reset();
    }

    /// Resolve with the cache's options, see `resolve`.
    pub fn resolve_registers(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        registers: &ResolveRegisters,
        shared_memory: &mut impl SharedMemory,
        texture_cache: &mut impl TextureCache,
    ) -> Result<ResolvedRange, ResolveError> {
        let info = ResolveInfo::from_registers(registers, self.resolve_options())?;
        self.resolve(commands, &info, shared_memory, texture_cache)
    }

    /// Copies the resolve area to guest memory, then clears it if requested. The clear is done
    /// even if the copy fails, the copy's error is returned.
    pub fn resolve(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
        shared_memory: &mut impl SharedMemory,
        texture_cache: &mut impl TextureCache,
    ) -> Result<ResolvedRange, ResolveError> {
        if info.is_empty() {
            log::debug!("Skipping an empty resolve");
            return Ok(ResolvedRange { address: info.copy_dest_base, length: 0 });
        }
        let copied = self.resolve_copy(commands, info, shared_memory, texture_cache);
        let cleared = self.resolve_clear(commands, info);
        let length = copied?;
        cleared?;
        Ok(ResolvedRange { address: info.copy_dest_base, length })
    }

    fn resolve_copy(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
        shared_memory: &mut impl SharedMemory,
        texture_cache: &mut impl TextureCache,
    ) -> Result<u32, ResolveError> {
        let (address, length) = (info.copy_dest_base, info.copy_dest_length);
        if length == 0 {
            return Ok(0);
        }
        let Some(shader) = info.copy_shader(self.resolution_scale) else {
            log::warn!("Resolve to an unsupported destination format, skipping the copy");
            return Ok(0);
        };
        let Some((pipeline, layout, scaled)) = self.resolve_copy.as_ref().and_then(|copy| {
            copy.pipeline(shader).map(|pipeline| (pipeline, copy.layout(), copy.is_scaled()))
        }) else {
            return Err(ResolveError::MissingCopyPipeline(shader));
        };

        self.end_render_pass(commands);
        let residency_error = ResolveError::Residency { address, length };
        let dest_set = if scaled {
            if !texture_cache.ensure_scaled_resolve_memory_committed(address, length) {
                return Err(residency_error);
            }
            texture_cache
                .scaled_resolve_descriptor_set(commands, address, length)
                .ok_or(residency_error)?
        } else {
            if !shared_memory.request_range(address, length) {
                return Err(residency_error);
            }
            shared_memory.use_for_compute_write(commands, address, length);
            shared_memory.descriptor_set()
        };

        if self.path == RenderTargetPath::HostRenderTargets {
            self.dump_render_targets(commands, info.copy_edram_tile_span());
        }
        self.edram.use_as(commands, EdramBufferUsage::ComputeRead);

        let constants = info.copy_constants();
        let (groups_x, groups_y) = info.copy_group_count(self.resolution_scale);
        commands.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline);
        commands.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            layout,
            0,
            &[self.edram.descriptor_set(), dest_set],
        );
        commands.push_constants(layout, vk::ShaderStageFlags::COMPUTE, 0, constants.bytes(scaled));
        commands.dispatch(groups_x, groups_y, 1);
        texture_cache.mark_range_as_resolved(address, length);
        log::trace!("Resolved {length} bytes to {address:#010X} with {}", shader.name());
        Ok(length)
    }

    // Writes the parts of host render targets inside the span to the EDRAM buffer
    fn dump_render_targets(&mut self, commands: &mut DeferredCommandBuffer, span: EdramTileSpan) {
        let rectangles = self.ownership.resolve_copy_rectangles_to_dump(
            span.base,
            span.row_length_used,
            span.rows,
            span.pitch,
        );
        if rectangles.is_empty() {
            return;
        }
        let source_usage = RenderTargetUsage::shader_read(vk::PipelineStageFlags::COMPUTE_SHADER);
        for rectangle in &rectangles {
            self.transition_render_target(commands, rectangle.render_target, source_usage);
        }
        self.edram.use_for_compute_write(commands);

        let edram_set = self.edram.descriptor_set();
        let Some(dump) = self.dump.as_mut() else { return };
        let mut pushed_pitches = None;
        for rectangle in rectangles {
            let key = rectangle.render_target;
            let Some(Some(render_target)) = self.render_targets.get(&key) else { continue };
            let Some(format) = key.format() else { continue };
            let dump_key = DumpShaderKey { format, msaa: key.msaa_samples() };
            let Some(pipeline) = dump.pipeline(&self.device, dump_key) else {
                continue;
            };
            let layout = dump.layout(key.is_depth());
            commands.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline);
            commands.bind_descriptor_sets(
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[edram_set, render_target.descriptor_set()],
            );
            let pitches = [span.pitch, key.pitch_tiles()];
            if pushed_pitches != Some((layout, pitches)) {
                commands.push_constants(
                    layout,
                    vk::ShaderStageFlags::COMPUTE,
                    DUMP_PITCHES_OFFSET,
                    bytemuck::bytes_of(&pitches),
                );
                pushed_pitches = Some((layout, pitches));
            }
            for dispatch in rectangle.dispatches(span.pitch, span.row_length_used) {
                let offsets = [key.base_tiles(), span.base + dispatch.offset];
                commands.push_constants(
                    layout,
                    vk::ShaderStageFlags::COMPUTE,
                    DUMP_OFFSETS_OFFSET,
                    bytemuck::bytes_of(&offsets),
                );
                let (groups_x, groups_y) = dump_group_count(
                    key.is_64bpp(),
                    dispatch.width_tiles,
                    dispatch.height_tiles,
                    self.resolution_scale,
                );
                commands.dispatch(groups_x, groups_y, 1);
            }
        }
        self.edram.state.mark_modified(EdramBufferModification::ViaUnordered);
    }

    fn resolve_clear(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
    ) -> Result<(), ResolveError> {
        if !info.is_clearing_depth() && !info.is_clearing_color() {
            return Ok(());
        }
        match self.path {
            RenderTargetPath::HostRenderTargets => {
                self.resolve_clear_host_render_targets(commands, info)
            }
            RenderTargetPath::PixelShaderInterlock => {
                self.resolve_clear_edram_buffer(commands, info)
            }
        }
    }

    fn resolve_clear_host_render_targets(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
    ) -> Result<(), ResolveError> {
        let Some(plan) = info.host_clear_plan(
            self.resolution_scale,
            self.max_render_target_width,
            self.max_render_target_height,
        ) else {
            return Ok(());
        };

        let mut work = Vec::with_capacity(2);
        for target in [plan.depth, plan.color].into_iter().flatten() {
            let key = target.key;
            if !self.ensure_render_target(key) {
                return Err(ResolveError::Clear);
            }
            let value = if let Some(format) = key.depth_format() {
                let (depth, stencil) = info.host_depth_clear_value(format);
                ClearValue::DepthStencil { depth, stencil }
            } else {
                let Some(format) = key.color_format() else { return Err(ResolveError::Clear) };
                match info.host_color_clear_value(format) {
                    HostColor::Float(color) => ClearValue::ColorFloat(color),
                    HostColor::Uint(color) => ClearValue::ColorUint(color),
                }
            };
            let host_depth_encoding_different = self.host_depth_encoding_different(key);
            let mut transfers = Vec::new();
            let render_targets = &self.render_targets;
            self.ownership.change_ownership(
                key,
                target.start_tiles,
                target.end_tiles - target.start_tiles,
                host_depth_encoding_different,
                Some(&mut transfers),
                Some(&plan.rectangle),
                |key| render_targets.get(&key).is_some_and(Option::is_some),
            );
            work.push(DestinationWork {
                dest: key,
                transfers,
                clear: Some((plan.rectangle, value)),
            });
        }

        self.accumulator.invalidate();
        if self.perform_transfers_and_resolve_clears(commands, &work) {
            Ok(())
        } else {
            Err(ResolveError::Clear)
        }
    }

    fn resolve_clear_edram_buffer(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
    ) -> Result<(), ResolveError> {
        self.end_render_pass(commands);
        self.edram.use_for_compute_write(commands);
        let edram_set = self.edram.descriptor_set();
        let Some(clear) = self.resolve_clear.as_ref() else { return Err(ResolveError::Clear) };
        let (groups_x, groups_y) = info.clear_group_count();

        let mut passes = Vec::with_capacity(2);
        if info.is_clearing_depth() {
            passes.push((false, info.depth_clear_constants()));
        }
        if info.is_clearing_color() {
            passes.push((info.color_edram_info.format_is_64bpp(), info.color_clear_constants()));
        }
        commands.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            clear.layout(),
            0,
            &[edram_set],
        );
        for (is_64bpp, constants) in passes {
            commands.bind_pipeline(vk::PipelineBindPoint::COMPUTE, clear.pipeline(is_64bpp));
            commands.push_constants(
                clear.layout(),
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&constants),
            );
            commands.dispatch(groups_x, groups_y, 1);
        }
        self.edram.state.mark_modified(EdramBufferModification::ViaUnordered);
        Ok(())
    }

    /// Draws the ownership transfers into each destination, and its resolve clear, in one
    /// render pass per destination. Returns `false` if a destination was skipped.
    fn perform_transfers_and_resolve_clears(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        work: &[DestinationWork],
    ) -> bool {
        self.end_render_pass(commands);
        for item in work {
            if item.dest.is_depth() {
                self.store_host_depth(commands, item);
            }
        }

        let mut complete = true;
        for item in work {
            if !self.transfer_to(commands, item) {
                log::error!("Failed to transfer to {}, its contents are lost", item.dest);
                complete = false;
            }
        }
        complete
    }

    // Copies the destination's own host depth to the EDRAM buffer for the transfers that restore
    // it after a round trip through another render target
    fn store_host_depth(&mut self, commands: &mut DeferredCommandBuffer, item: &DestinationWork) {
        let dest = item.dest;
        let cutout = item.clear.as_ref().map(|(rectangle, _)| rectangle);
        let rectangles: Vec<_> = item
            .transfers
            .iter()
            .filter(|transfer| transfer.host_depth_source == Some(dest))
            .flat_map(|transfer| transfer.rectangles(dest, cutout))
            .collect();
        if rectangles.is_empty() || !self.render_target_exists(dest) {
            return;
        }

        self.transition_render_target(
            commands,
            dest,
            RenderTargetUsage::shader_read(vk::PipelineStageFlags::COMPUTE_SHADER),
        );
        self.edram.use_for_compute_write(commands);
        let edram_set = self.edram.descriptor_set();
        let Some(store) = self.host_depth_store.as_ref() else { return };
        let Some(Some(render_target)) = self.render_targets.get(&dest) else { return };

        commands.bind_pipeline(vk::PipelineBindPoint::COMPUTE, store.pipeline(dest.msaa_samples()));
        commands.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            store.layout(),
            0,
            &[edram_set, render_target.descriptor_set()],
        );
        let render_target_constants = HostDepthStoreRenderTarget::default()
            .with_pitch_tiles(dest.pitch_tiles())
            .with_base_tiles(dest.base_tiles());
        for rectangle in rectangles {
            let x_div_8 = rectangle.x_pixels / 8;
            let width_div_8 = rectangle.right().div_ceil(8) - x_div_8;
            let height_div_8 = rectangle.bottom().div_ceil(8) - rectangle.y_pixels / 8;
            let rectangle_constants = HostDepthStoreRectangle::default()
                .with_x_div_8(x_div_8)
                .with_y_div_8(rectangle.y_pixels / 8)
                .with_width_div_8_minus_1(width_div_8 - 1);
            let constants =
                HostDepthStoreConstants::new(rectangle_constants, render_target_constants);
            commands.push_constants(
                store.layout(),
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&constants),
            );
            let (groups_x, groups_y) =
                host_depth_store_group_count(width_div_8, height_div_8, &self.shader_options);
            commands.dispatch(groups_x, groups_y, 1);
        }
        self.edram.state.mark_modified(EdramBufferModification::ViaUnordered);
    }

    fn transfer_groups(&self, item: &DestinationWork) -> Vec<TransferGroup> {
        let dest = item.dest;
        let Some(dest_format) = dest.format() else { return Vec::new() };
        let cutout = item.clear.as_ref().map(|(rectangle, _)| rectangle);
        let stencil_export = self.native_stencil_value_output;
        let outputs: &[TransferOutput] = match (dest.is_depth(), stencil_export) {
            (false, _) => &[TransferOutput::Color],
            (true, true) => &[TransferOutput::DepthStencil],
            (true, false) => &[TransferOutput::Depth, TransferOutput::StencilBit],
        };

        let mut groups: Vec<TransferGroup> = Vec::new();
        for &output in outputs {
            for transfer in &item.transfers {
                let Some(source_format) = transfer.source.format() else { continue };
                let rectangles = transfer.rectangles(dest, cutout);
                if rectangles.is_empty() {
                    continue;
                }
                let host_depth_source = transfer.host_depth_source.filter(|_| {
                    matches!(output, TransferOutput::Depth | TransferOutput::DepthStencil)
                });
                let shader = TransferShaderKey {
                    source_format,
                    source_msaa: transfer.source.msaa_samples(),
                    dest_format,
                    dest_msaa: dest.msaa_samples(),
                    host_depth_source: host_depth_source.map(|host_depth| {
                        if host_depth == dest {
                            HostDepthSource::Buffer
                        } else {
                            HostDepthSource::Texture(host_depth.msaa_samples())
                        }
                    }),
                    output,
                    dest_sample: None,
                };
                match groups.iter_mut().find(|group| {
                    group.shader == shader
                        && group.source == transfer.source
                        && group.host_depth_source == host_depth_source
                }) {
                    Some(group) => group.rectangles.extend(rectangles),
                    None => groups.push(TransferGroup {
                        shader,
                        source: transfer.source,
                        host_depth_source,
                        rectangles,
                    }),
                }
            }
        }
        // Depth before the stencil bits, which rely on the depth pass clearing stencil
        groups.sort_by_key(|group| (group.shader.output, group.source, group.shader));
        groups
    }

    fn transfer_to(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        item: &DestinationWork,
    ) -> bool {
        let dest = item.dest;
        let groups = self.transfer_groups(item);
        if groups.is_empty() && item.clear.is_none() {
            return true;
        }

        let source_usage = RenderTargetUsage::shader_read(vk::PipelineStageFlags::FRAGMENT_SHADER);
        for group in &groups {
            self.transition_render_target(commands, group.source, source_usage);
            let host_depth = group.host_depth_source.filter(|&host_depth| host_depth != dest);
            if let Some(host_depth) = host_depth {
                self.transition_render_target(commands, host_depth, source_usage);
            }
        }
        let reads_edram_buffer = groups
            .iter()
            .any(|group| group.shader.host_depth_source == Some(HostDepthSource::Buffer));
        if reads_edram_buffer {
            self.edram.use_as(commands, EdramBufferUsage::FragmentRead);
        }
        self.transition_render_target(commands, dest, RenderTargetUsage::draw(dest.is_depth()));

        let mut keys = [RenderTargetKey::EMPTY; SLOT_COUNT];
        keys[if dest.is_depth() { DEPTH_SLOT } else { color_slot(0) }] = dest;
        let render_pass_key =
            RenderPassKey::for_render_targets(dest.msaa_samples(), &keys, 0, true);
        let Some(render_pass) = self.render_passes.render_pass(&self.device, render_pass_key) else {
            return false;
        };
        let Some(Some(dest_render_target)) = self.render_targets.get(&dest) else { return false };
        let mut attachments: [Option<&VulkanRenderTarget>; SLOT_COUNT] = [None; SLOT_COUNT];
        let dest_slot = if dest.is_depth() { DEPTH_SLOT } else { color_slot(0) };
        attachments[dest_slot] = Some(dest_render_target);
        let Some(framebuffer) = self.render_passes.framebuffer(
            &self.device,
            render_pass_key,
            dest.pitch_tiles_at_32bpp(),
            &attachments,
        ) else {
            return false;
        };

        let extent = framebuffer.extent;
        commands.begin_render_pass(render_pass, framebuffer.framebuffer, extent);
        commands.set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
        });
        commands.set_scissor(vk::Rect2D { offset: vk::Offset2D::default(), extent });

        for group in &groups {
            self.draw_transfer_group(commands, render_pass_key, dest, extent, group);
        }

        if let Some((rectangle, value)) = item.clear {
            let scale = self.resolution_scale;
            let x = (rectangle.x_pixels * scale.x).min(extent.width);
            let y = (rectangle.y_pixels * scale.y).min(extent.height);
            let rect = vk::Rect2D {
                offset: vk::Offset2D { x: x as i32, y: y as i32 },
                extent: vk::Extent2D {
                    width: (rectangle.width_pixels * scale.x).min(extent.width - x),
                    height: (rectangle.height_pixels * scale.y).min(extent.height - y),
                },
            };
            let aspect = if dest.is_depth() {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            } else {
                vk::ImageAspectFlags::COLOR
            };
            if rect.extent.width != 0 && rect.extent.height != 0 {
                commands.clear_attachments(
                    &[ClearAttachment { aspect, color_attachment: 0, value }],
                    rect,
                );
            }
        }

        commands.end_render_pass();
        true
    }

    fn draw_transfer_group(
        &mut self,
        commands: &mut DeferredCommandBuffer,
        render_pass_key: RenderPassKey,
        dest: RenderTargetKey,
        extent: vk::Extent2D,
        group: &TransferGroup,
    ) {
        let Some(transfer) = self.transfer.as_mut() else { return };
        let Some(pipelines) =
            transfer.pipelines(&self.device, &mut self.render_passes, render_pass_key, group.shader)
        else {
            log::error!("No transfer pipelines for {}", group.shader.name());
            return;
        };
        let layout = transfer.layout(TransferLayoutKind::of(&group.shader));

        let Some(Some(source)) = self.render_targets.get(&group.source) else { return };
        let mut sets = vec![source.descriptor_set()];
        let host_depth = match (group.shader.host_depth_source, group.host_depth_source) {
            (Some(HostDepthSource::Buffer), _) => {
                sets.push(self.edram.descriptor_set());
                Some(HostDepthAddress {
                    pitch_tiles: dest.pitch_tiles(),
                    offset_tiles: dest.base_tiles() as i32,
                })
            }
            (Some(HostDepthSource::Texture(_)), Some(host_depth)) => {
                let Some(Some(host_depth_render_target)) = self.render_targets.get(&host_depth)
                else {
                    return;
                };
                sets.push(host_depth_render_target.descriptor_set());
                Some(HostDepthAddress {
                    pitch_tiles: host_depth.pitch_tiles(),
                    offset_tiles: dest.base_tiles() as i32 - host_depth.base_tiles() as i32,
                })
            }
            _ => None,
        };
        commands.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, layout, 0, &sets);

        let scale = self.resolution_scale;
        let to_ndc = |pixels: u32, scale: u32, size: u32| {
            (pixels * scale) as f32 / size as f32 * 2.0 - 1.0
        };
        let mut vertices = Vec::with_capacity(group.rectangles.len() * 6);
        for rectangle in &group.rectangles {
            let x0 = to_ndc(rectangle.x_pixels, scale.x, extent.width);
            let y0 = to_ndc(rectangle.y_pixels, scale.y, extent.height);
            let x1 = to_ndc(rectangle.right(), scale.x, extent.width);
            let y1 = to_ndc(rectangle.bottom(), scale.y, extent.height);
            vertices.extend([[x0, y0], [x1, y0], [x0, y1], [x0, y1], [x1, y0], [x1, y1]]);
        }
        let uploaded = self.vertex_buffers.upload(&self.device, self.submission, &vertices);
        let (buffer, offset) = match uploaded {
            Ok(uploaded) => uploaded,
            Err(err) => {
                log::error!("Failed to upload transfer vertices: {err}");
                return;
            }
        };
        commands.bind_vertex_buffer(buffer, offset);

        let constants = TransferConstants {
            dest_pitch_tiles: dest.pitch_tiles(),
            source_pitch_tiles: group.source.pitch_tiles(),
            source_to_dest_tiles: dest.base_tiles() as i32 - group.source.base_tiles() as i32,
            host_depth,
            stencil_mask: None,
        };
        let vertex_count = vertices.len() as u32;
        if group.shader.output == TransferOutput::StencilBit {
            for bit in 0..8 {
                let stencil_mask = 1 << bit;
                commands.set_stencil_write_mask(stencil_mask);
                let constants = TransferConstants { stencil_mask: Some(stencil_mask), ..constants };
                commands.push_constants(
                    layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    &constants.to_bytes(),
                );
                for &pipeline in &pipelines {
                    commands.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
                    commands.draw(vertex_count, 0);
                }
            }
        } else {
            commands.push_constants(
                layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                &constants.to_bytes(),
            );
            for &pipeline in &pipelines {
                commands.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
                commands.draw(vertex_count, 0);
            }
        }
    }

    /// Destroys the render targets that don't own any EDRAM tiles. The GPU must be done with
    /// them.
    pub fn clear_cache(&mut self, commands: &mut DeferredCommandBuffer) {
        self.end_render_pass(commands);
        self.render_passes.destroy_framebuffers(&self.device);
        let in_use = self.ownership.render_targets_in_use();
        let keys: Vec<_> = self.render_targets.keys().copied().collect();
        let mut destroyed = 0;
        for key in keys {
            if in_use.contains(&key) && self.render_target_exists(key) {
                continue;
            }
            if let Some(Some(render_target)) = self.render_targets.remove(&key) {
                let pool = if key.is_depth() {
                    &mut self.depth_descriptor_pool
                } else {
                    &mut self.color_descriptor_pool
                };
                render_target.destroy(&self.device, pool);
                destroyed += 1;
            }
        }
        self.accumulator.invalidate();
        if self.path == RenderTargetPath::PixelShaderInterlock {
            // The null framebuffer went with the others
            let key = RenderPassKey::default();
            self.null_render_pass =
                self.render_passes.render_pass(&self.device, key).and_then(|render_pass| {
                    self.render_passes
                        .framebuffer(&self.device, key, 0, &[None; SLOT_COUNT])
                        .map(|framebuffer| (render_pass, framebuffer))
                });
        }
        log::debug!(
            "Destroyed {destroyed} unused render targets, kept {}",
            self.render_targets.len()
        );
    }

    /// Ends the render pass and retires the transfer vertex buffers written in this submission.
    pub fn end_submission(&mut self, commands: &mut DeferredCommandBuffer) {
        self.end_render_pass(commands);
        self.vertex_buffers.end_submission(self.submission);
        self.submission += 1;
    }

    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        self.vertex_buffers.completed_submission_updated(completed_submission);
    }

    /// Submission that commands recorded now belong to.
    pub fn current_submission(&self) -> u64 {
        self.submission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edram::resolve::ResolveRectangle;
    use crate::registers::{
        RasterizationBounds, RbColorInfo, RbColorMask, RbCopyControl, RbCopyDestInfo,
        RbCopyDestPitch, RbModeControl, RbSurfaceInfo,
    };
    use crate::edram::formats::{decode_8888, encode_8888};
    use crate::edram::tiles::{pixel_to_tile_sample, GuestSample, TransferMapping, TransferSurface};
    use crate::edram::RenderTargetFormat;
    use crate::vulkan::commands::Command;
    use crate::vulkan::device::fake::{capable_features, FakeDevice};
    use crate::xenos::{ColorFormat, DepthRenderTargetFormat, ModeControl, MsaaSamples};

    #[derive(Default)]
    struct FakeSharedMemory {
        fail: bool,
        written: Vec<(u32, u32)>,
    }

    impl SharedMemory for FakeSharedMemory {
        fn request_range(&mut self, _start: u32, _length: u32) -> bool {
            !self.fail
        }

        fn use_for_compute_write(
            &mut self,
            _commands: &mut DeferredCommandBuffer,
            start: u32,
            length: u32,
        ) {
            self.written.push((start, length));
        }

        fn descriptor_set(&self) -> vk::DescriptorSet {
            vk::DescriptorSet::null()
        }
    }

    #[derive(Default)]
    struct FakeTextureCache {
        resolved: Vec<(u32, u32)>,
    }

    impl TextureCache for FakeTextureCache {
        fn mark_range_as_resolved(&mut self, start: u32, length: u32) {
            self.resolved.push((start, length));
        }

        fn ensure_scaled_resolve_memory_committed(&mut self, _start: u32, _length: u32) -> bool {
            true
        }

        fn scaled_resolve_descriptor_set(
            &mut self,
            _commands: &mut DeferredCommandBuffer,
            _start: u32,
            _length: u32,
        ) -> Option<vk::DescriptorSet> {
            Some(vk::DescriptorSet::null())
        }
    }

    fn cache(path: &str) -> RenderTargetCache<FakeDevice> {
        let config = RenderTargetCacheConfig {
            render_target_path_vulkan: path.into(),
            ..RenderTargetCacheConfig::default()
        };
        RenderTargetCache::initialize(&config, FakeDevice::new(capable_features()), 1).unwrap()
    }

    // 1280x720 at 1x, one 8888 color render target
    fn color_registers(color_base: u32) -> RenderTargetRegisters {
        let mut registers = RenderTargetRegisters {
            surface_info: RbSurfaceInfo::from(1280),
            mode_control: RbModeControl::default()
                .with_edram_mode_bits(ModeControl::ColorDepth as u32),
            color_mask: RbColorMask::from(0xF),
            bounds: RasterizationBounds {
                clip_disable: true,
                window_scissor_br_y: 720,
                screen_scissor_br_y: 8192,
                ..RasterizationBounds::default()
            },
            ..RenderTargetRegisters::default()
        };
        registers.color_info[0] = RbColorInfo::default()
            .with_color_base(color_base)
            .with_color_format_bits(ColorRenderTargetFormat::K8888.bits());
        registers
    }

    fn resolve_registers() -> ResolveRegisters {
        let mut registers = ResolveRegisters {
            surface_info: RbSurfaceInfo::default()
                .with_surface_pitch(1280)
                .with_msaa_samples_bits(MsaaSamples::X4.bits()),
            copy_dest_info: RbCopyDestInfo::default()
                .with_copy_dest_format_bits(ColorFormat::K8888.bits()),
            copy_dest_pitch: RbCopyDestPitch::default()
                .with_copy_dest_pitch(80)
                .with_copy_dest_height(40),
            copy_dest_base: 0x1000_0000,
            rectangle: ResolveRectangle { x0: 0, y0: 0, x1: 80, y1: 40 },
            ..ResolveRegisters::default()
        };
        registers.color_info[0] = RbColorInfo::default()
            .with_color_base(100)
            .with_color_format_bits(ColorRenderTargetFormat::K8888.bits());
        registers
    }

    fn dispatches(commands: &DeferredCommandBuffer) -> Vec<(u32, u32, u32)> {
        commands
            .commands()
            .iter()
            .filter_map(|command| match *command {
                Command::Dispatch { x, y, z } => Some((x, y, z)),
                _ => None,
            })
            .collect()
    }

    fn default_resolve_info(cache: &RenderTargetCache<FakeDevice>) -> ResolveInfo {
        ResolveInfo::from_registers(&resolve_registers(), cache.resolve_options()).unwrap()
    }

    fn resolve_to_fakes(
        cache: &mut RenderTargetCache<FakeDevice>,
        commands: &mut DeferredCommandBuffer,
        info: &ResolveInfo,
    ) -> ResolvedRange {
        let mut shared_memory = FakeSharedMemory::default();
        let mut texture_cache = FakeTextureCache::default();
        cache.resolve(commands, info, &mut shared_memory, &mut texture_cache).unwrap()
    }

    #[test]
    fn auto_path_prefers_interlock() {
        assert_eq!(cache("").path(), RenderTargetPath::PixelShaderInterlock);
        assert_eq!(cache("fbo").path(), RenderTargetPath::HostRenderTargets);

        let mut features = capable_features();
        features.fragment_shader_sample_interlock = false;
        let config = RenderTargetCacheConfig {
            render_target_path_vulkan: "fsi".into(),
            ..RenderTargetCacheConfig::default()
        };
        let cache = RenderTargetCache::initialize(&config, FakeDevice::new(features), 1).unwrap();
        assert_eq!(cache.path(), RenderTargetPath::HostRenderTargets);
    }

    #[test]
    fn unknown_path_is_a_config_error() {
        let config = RenderTargetCacheConfig {
            render_target_path_vulkan: "rov".into(),
            ..RenderTargetCacheConfig::default()
        };
        let result = RenderTargetCache::initialize(&config, FakeDevice::new(capable_features()), 1);
        assert!(matches!(result, Err(InitializationError::Config(_))));
    }

    #[test]
    fn failed_pipeline_creation_is_fatal() {
        let device = FakeDevice::new(capable_features());
        device.fail_compute_pipelines.set(true);
        let config = RenderTargetCacheConfig::default();
        let Err(err) = RenderTargetCache::initialize(&config, device, 1) else {
            panic!("initialization succeeded without compute pipelines");
        };
        assert!(matches!(err, InitializationError::Vulkan { .. }));
    }

    #[test]
    fn initializes_with_default_shader_options() {
        let mut features = capable_features();
        features.shader_stencil_export = true;
        for path in ["fsi", "fbo"] {
            for native_2x_msaa in [true, false] {
                let config = RenderTargetCacheConfig {
                    render_target_path_vulkan: path.into(),
                    native_2x_msaa,
                    ..RenderTargetCacheConfig::default()
                };
                let device = FakeDevice::new(features);
                let cache = match RenderTargetCache::initialize(&config, device, 1) {
                    Ok(cache) => cache,
                    Err(err) => panic!("{path}, native 2x {native_2x_msaa}: {err}"),
                };
                assert!(cache.native_stencil_value_output());
                assert_eq!(cache.shutdown().live_objects(), 0);
            }
        }
    }

    #[test]
    fn identical_format_move_is_one_color_group() {
        let cache = cache("fbo");
        let source = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let dest = RenderTargetKey::color(100, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        // 1280x720 is 45 rows of 16 tiles
        let item = DestinationWork {
            dest,
            transfers: vec![Transfer {
                start_tiles: 100,
                end_tiles: 100 + 16 * 45,
                source,
                host_depth_source: None,
            }],
            clear: None,
        };

        let groups = cache.transfer_groups(&item);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.shader, TransferShaderKey {
            source_format: RenderTargetFormat::Color(ColorRenderTargetFormat::K8888),
            source_msaa: MsaaSamples::X1,
            dest_format: RenderTargetFormat::Color(ColorRenderTargetFormat::K8888),
            dest_msaa: MsaaSamples::X1,
            host_depth_source: None,
            output: TransferOutput::Color,
            dest_sample: None,
        });
        assert_eq!(group.source, source);
        assert_eq!(group.rectangles, vec![Rectangle::new(0, 0, 1280, 720)]);

        // Every destination sample reads the source sample at the same EDRAM dword
        let mapping = TransferMapping {
            dest: TransferSurface { layout: dest.layout(), pitch_tiles: 16 },
            source: TransferSurface { layout: source.layout(), pitch_tiles: 16 },
            source_to_dest_tiles: 100,
            native_2x_msaa: true,
            scale: ResolutionScale::NATIVE,
        };
        for y in (0..720).step_by(7) {
            for x in 0..1280 {
                let reads = mapping.source_reads((x, y), 0);
                assert_eq!(reads.len(), 1);
                let dest_sample = pixel_to_tile_sample(
                    dest.layout(),
                    16,
                    (x, y),
                    GuestSample::default(),
                    ResolutionScale::NATIVE,
                );
                let source_sample = pixel_to_tile_sample(
                    source.layout(),
                    16,
                    reads[0].pixel,
                    GuestSample::default(),
                    ResolutionScale::NATIVE,
                );
                assert_eq!(dest_sample.tile + 100, source_sample.tile);
                assert_eq!(dest_sample.column, source_sample.column);
                assert_eq!(dest_sample.row, source_sample.row);
            }
        }
        // And 8888 goes through the host unchanged
        for _ in 0..256 {
            let packed = rand::random::<u32>();
            assert_eq!(encode_8888(decode_8888(packed)), packed);
        }
    }

    fn depth_transfer_groups(stencil_export: bool) -> Vec<TransferGroup> {
        let mut features = capable_features();
        features.shader_stencil_export = stencil_export;
        let config = RenderTargetCacheConfig {
            render_target_path_vulkan: "fbo".into(),
            ..RenderTargetCacheConfig::default()
        };
        let cache = RenderTargetCache::initialize(&config, FakeDevice::new(features), 1).unwrap();
        let source = RenderTargetKey::depth(0, 16, MsaaSamples::X4, DepthRenderTargetFormat::D24S8);
        let dest = RenderTargetKey::depth(64, 16, MsaaSamples::X4, DepthRenderTargetFormat::D24S8);
        let item = DestinationWork {
            dest,
            transfers: vec![Transfer {
                start_tiles: 64,
                end_tiles: 96,
                source,
                host_depth_source: Some(dest),
            }],
            clear: None,
        };
        cache.transfer_groups(&item)
    }

    #[test]
    fn stencil_export_replaces_the_bit_passes() {
        let exported = depth_transfer_groups(true);
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].shader.output, TransferOutput::DepthStencil);
        assert_eq!(exported[0].shader.host_depth_source, Some(HostDepthSource::Buffer));

        let outputs: Vec<_> =
            depth_transfer_groups(false).iter().map(|group| group.shader.output).collect();
        assert_eq!(outputs, [TransferOutput::Depth, TransferOutput::StencilBit]);
    }

    #[test]
    fn draw_into_overlapping_render_target_transfers_ownership() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();

        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
        assert!(commands.is_in_render_pass());
        let first = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        assert!(cache.render_target(first).is_some());
        commands.end_render_pass();
        commands.reset();

        assert!(cache.update(&mut commands, &color_registers(100), true, 0b1));
        let second =
            RenderTargetKey::color(100, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        assert!(cache.ownership().owners().any(|(_, _, owner)| owner == second));

        let expected = TransferConstants {
            dest_pitch_tiles: 16,
            source_pitch_tiles: 16,
            source_to_dest_tiles: 100,
            host_depth: None,
            stencil_mask: None,
        }
        .to_bytes();
        assert!(commands.commands().iter().any(|command| matches!(
            command,
            Command::PushConstants { data, .. } if *data == expected
        )));
        let draws: Vec<u32> = commands
            .commands()
            .iter()
            .filter_map(|command| match *command {
                Command::Draw { vertex_count, .. } => Some(vertex_count),
                _ => None,
            })
            .collect();
        assert_eq!(draws.len(), 1);
        assert!(draws[0] > 0 && draws[0] % 6 == 0);
        // The transfer pass, then the draw's pass left open
        let begins = commands
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::BeginRenderPass { .. }))
            .count();
        assert_eq!(begins, 2);
        assert!(commands.is_in_render_pass());
        assert_eq!(
            cache.render_target(second).map(VulkanRenderTarget::usage),
            Some(RenderTargetUsage::draw(false))
        );
    }

    #[test]
    fn unchanged_bindings_keep_the_render_pass() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();
        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
        let recorded = commands.commands().len();
        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
        assert_eq!(commands.commands().len(), recorded);
    }

    #[test]
    fn failed_render_target_creation_is_remembered() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();
        cache.device().fail_images.set(true);
        assert!(!cache.update(&mut commands, &color_registers(0), true, 0b1));
        cache.device().fail_images.set(false);
        assert!(!cache.update(&mut commands, &color_registers(0), true, 0b1));
        assert!(!commands.is_in_render_pass());

        // Forgotten by a cache clear, as nothing is owned by it
        cache.clear_cache(&mut commands);
        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
    }

    #[test]
    fn resolve_copies_the_area() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();
        let mut info = default_resolve_info(&cache);
        info.copy_dest_length = 12800;
        let mut shared_memory = FakeSharedMemory::default();
        let mut texture_cache = FakeTextureCache::default();

        let resolved =
            cache.resolve(&mut commands, &info, &mut shared_memory, &mut texture_cache).unwrap();
        assert_eq!(resolved, ResolvedRange { address: 0x1000_0000, length: 12800 });
        assert_eq!(dispatches(&commands), vec![(10, 5, 1)]);
        assert_eq!(shared_memory.written, vec![(0x1000_0000, 12800)]);
        assert_eq!(texture_cache.resolved, vec![(0x1000_0000, 12800)]);
    }

    #[test]
    fn resolve_dumps_owning_render_targets_first() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();
        let mut registers = color_registers(100);
        registers.surface_info = RbSurfaceInfo::default()
            .with_surface_pitch(1280)
            .with_msaa_samples_bits(MsaaSamples::X4.bits());
        assert!(cache.update(&mut commands, &registers, true, 0b1));
        commands.end_render_pass();
        commands.reset();

        let info = default_resolve_info(&cache);
        let resolved = resolve_to_fakes(&mut cache, &mut commands, &info);
        assert_eq!(resolved.length, info.copy_dest_length);
        let dispatches = dispatches(&commands);
        assert!(dispatches.len() >= 2);
        assert_eq!(dispatches.last(), Some(&(10, 5, 1)));
        let key = RenderTargetKey::color(100, 32, MsaaSamples::X4, ColorRenderTargetFormat::K8888);
        assert_eq!(
            cache.render_target(key).map(VulkanRenderTarget::usage),
            Some(RenderTargetUsage::shader_read(vk::PipelineStageFlags::COMPUTE_SHADER))
        );
    }

    #[test]
    fn interlock_clear_dispatches_after_the_copy() {
        let mut cache = cache("fsi");
        let mut commands = DeferredCommandBuffer::new();
        let mut registers = resolve_registers();
        registers.copy_control = RbCopyControl::default().with_color_clear_enable(true);
        registers.color_clear = 0x7F7F7F7F;
        let info = ResolveInfo::from_registers(&registers, cache.resolve_options()).unwrap();
        let HostColor::Float(color) = info.host_color_clear_value(ColorRenderTargetFormat::K8888)
        else {
            panic!("8888 clears to a float color");
        };
        for component in color {
            assert!((component - 127.0 / 255.0).abs() < 1e-6);
        }

        resolve_to_fakes(&mut cache, &mut commands, &info);
        assert_eq!(dispatches(&commands).len(), 2);
        let last_constants = commands.commands().iter().rev().find_map(|command| match command {
            Command::PushConstants { data, .. } => Some(data.clone()),
            _ => None,
        });
        let constants = last_constants.unwrap();
        assert_eq!(constants[..4], 0x7F7F7F7Fu32.to_ne_bytes());
    }

    #[test]
    fn clear_is_attempted_when_residency_fails() {
        let mut cache = cache("fsi");
        let mut commands = DeferredCommandBuffer::new();
        let mut registers = resolve_registers();
        registers.copy_control = RbCopyControl::default().with_color_clear_enable(true);
        let info = ResolveInfo::from_registers(&registers, cache.resolve_options()).unwrap();
        let mut shared_memory = FakeSharedMemory { fail: true, ..FakeSharedMemory::default() };

        let mut texture_cache = FakeTextureCache::default();
        let result = cache.resolve(&mut commands, &info, &mut shared_memory, &mut texture_cache);
        assert!(matches!(result, Err(ResolveError::Residency { address: 0x1000_0000, .. })));
        assert_eq!(dispatches(&commands).len(), 1);
    }

    #[test]
    fn host_clear_takes_ownership_and_clears() {
        let mut cache = cache("fbo");
        let mut commands = DeferredCommandBuffer::new();
        let mut registers = resolve_registers();
        registers.copy_control = RbCopyControl::default().with_color_clear_enable(true);
        registers.color_clear = 0xFF00_00FF;
        let mut info = ResolveInfo::from_registers(&registers, cache.resolve_options()).unwrap();
        info.copy_dest_length = 0;

        resolve_to_fakes(&mut cache, &mut commands, &info);
        let key = RenderTargetKey::color(100, 32, MsaaSamples::X4, ColorRenderTargetFormat::K8888);
        assert!(cache.render_target(key).is_some());
        assert!(cache.ownership().owners().any(|(_, _, owner)| owner == key));
        assert!(commands
            .commands()
            .iter()
            .any(|command| matches!(command, Command::ClearAttachments { .. })));
        assert!(!commands.is_in_render_pass());
    }

    #[test]
    fn interlock_barrier_on_overlapping_draws() {
        let mut cache = cache("fsi");
        let mut commands = DeferredCommandBuffer::new();
        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
        assert!(commands.is_in_render_pass());
        let begins = |commands: &DeferredCommandBuffer| {
            commands
                .commands()
                .iter()
                .filter(|command| matches!(command, Command::BeginRenderPass { .. }))
                .count()
        };
        assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
        assert_eq!(begins(&commands), 1);

        assert!(cache.update(&mut commands, &color_registers(100), true, 0b1));
        assert_eq!(begins(&commands), 2);
        assert!(commands
            .commands()
            .iter()
            .any(|command| matches!(command, Command::PipelineBarrier(_))));
    }

    #[test]
    fn shutdown_releases_everything() {
        for path in ["fbo", "fsi"] {
            let mut cache = cache(path);
            let mut commands = DeferredCommandBuffer::new();
            assert!(cache.update(&mut commands, &color_registers(0), true, 0b1));
            assert!(cache.update(&mut commands, &color_registers(100), true, 0b1));
            let info = default_resolve_info(&cache);
            resolve_to_fakes(&mut cache, &mut commands, &info);
            cache.end_submission(&mut commands);
            cache.completed_submission_updated(1);
            assert_eq!(cache.current_submission(), 2);
            let device = cache.shutdown();
            assert_eq!(device.live_objects(), 0, "{path}");
        }
    }
}
