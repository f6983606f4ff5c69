//! Render passes and framebuffers for sets of bound render targets

use crate::edram::bindings::{color_slot, DEPTH_SLOT, SLOT_COUNT};
use crate::edram::tiles::ResolutionScale;
use crate::edram::RenderTargetKey;
use crate::vulkan::device::{Device, DeviceObject};
use crate::vulkan::render_target::{
    color_transfer_vk_format, color_vk_format, depth_vk_format, render_target_extent,
    sample_count_flags, RenderTargetParameters, VulkanRenderTarget,
};
use crate::xenos::{
    ColorRenderTargetFormat, DepthRenderTargetFormat, MsaaSamples, MAX_COLOR_RENDER_TARGETS,
    TEXTURE_2D_MAX_WIDTH_HEIGHT,
};
use ash::vk;
use proc_bitfield::bitfield;
use std::collections::HashMap;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderPassKey(pub u32): Debug, FromStorage, IntoStorage {
        pub msaa_samples_bits: u32 @ 0..2,
        // Bit 0 depth, bits 1 to 4 color render targets 0 to 3
        pub depth_and_color_used: u32 @ 2..7,
        pub depth_is_float24: bool @ 7,
        // Formats of the views, 8_8_8_8_GAMMA only if drawn through an sRGB view
        pub color_0_view_format: u32 @ 8..12,
        pub color_1_view_format: u32 @ 12..16,
        pub color_2_view_format: u32 @ 16..20,
        pub color_3_view_format: u32 @ 20..24,
        // Color attachments are the integer views of formats copied as integers
        pub color_rts_use_transfer_formats: bool @ 24,
    }
}

impl RenderPassKey {
    /// Key of a render pass drawing to `keys`. Bits of `srgb_color_slots` select color render
    /// targets drawn with 8_8_8_8_GAMMA through an sRGB view.
    pub fn for_render_targets(
        msaa_samples: MsaaSamples,
        keys: &[RenderTargetKey; SLOT_COUNT],
        srgb_color_slots: u32,
        use_transfer_formats: bool,
    ) -> Self {
        let mut key = Self::default()
            .with_msaa_samples_bits(msaa_samples.bits())
            .with_color_rts_use_transfer_formats(use_transfer_formats);
        let mut used = 0;
        if let Some(format) = keys[DEPTH_SLOT].depth_format() {
            used |= 1;
            key = key.with_depth_is_float24(format == DepthRenderTargetFormat::D24FS8);
        }
        for index in 0..MAX_COLOR_RENDER_TARGETS {
            let Some(format) = keys[color_slot(index)].color_format() else { continue };
            used |= 1 << color_slot(index);
            let view_format = if srgb_color_slots & (1 << index) != 0
                && format == ColorRenderTargetFormat::K8888
                && !use_transfer_formats
            {
                ColorRenderTargetFormat::K8888Gamma
            } else {
                format
            };
            key = key.with_color_view_format(index, view_format);
        }
        key.with_depth_and_color_used(used)
    }

    pub fn msaa_samples(self) -> MsaaSamples {
        MsaaSamples::from_bits(self.msaa_samples_bits()).unwrap_or(MsaaSamples::X4)
    }

    pub fn is_depth_used(self) -> bool {
        self.depth_and_color_used() & 1 != 0
    }

    pub fn is_color_used(self, index: usize) -> bool {
        self.depth_and_color_used() & (1 << color_slot(index)) != 0
    }

    pub fn depth_format(self) -> DepthRenderTargetFormat {
        DepthRenderTargetFormat::from_bit(self.depth_is_float24())
    }

    pub fn color_view_format(self, index: usize) -> ColorRenderTargetFormat {
        let bits = match index {
            0 => self.color_0_view_format(),
            1 => self.color_1_view_format(),
            2 => self.color_2_view_format(),
            _ => self.color_3_view_format(),
        };
        ColorRenderTargetFormat::from_bits(bits).unwrap_or_default()
    }

    fn with_color_view_format(self, index: usize, format: ColorRenderTargetFormat) -> Self {
        let bits = format.bits();
        match index {
            0 => self.with_color_0_view_format(bits),
            1 => self.with_color_1_view_format(bits),
            2 => self.with_color_2_view_format(bits),
            _ => self.with_color_3_view_format(bits),
        }
    }

    fn highest_color_used(self) -> Option<usize> {
        (0..MAX_COLOR_RENDER_TARGETS).rev().find(|&index| self.is_color_used(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FramebufferKey {
    render_pass: RenderPassKey,
    pitch_tiles_at_32bpp: u32,
    base_tiles: [u32; SLOT_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

/// Memoized render passes and framebuffers, failures included.
#[derive(Debug)]
pub struct RenderPassCache {
    parameters: RenderTargetParameters,
    max_framebuffer_extent: vk::Extent2D,
    render_passes: HashMap<RenderPassKey, Option<vk::RenderPass>>,
    framebuffers: HashMap<FramebufferKey, Option<Framebuffer>>,
}

impl RenderPassCache {
    pub fn new(parameters: RenderTargetParameters, max_framebuffer_extent: vk::Extent2D) -> Self {
        Self {
            parameters,
            max_framebuffer_extent,
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    pub fn render_pass<D: Device>(
        &mut self,
        device: &D,
        key: RenderPassKey,
    ) -> Option<vk::RenderPass> {
        if let Some(&render_pass) = self.render_passes.get(&key) {
            return render_pass;
        }
        let render_pass = self
            .create_render_pass(device, key)
            .inspect_err(|err| log::error!("Failed to create render pass {key:?}: {err}"))
            .ok();
        self.render_passes.insert(key, render_pass);
        render_pass
    }

    fn create_render_pass<D: Device>(
        &self,
        device: &D,
        key: RenderPassKey,
    ) -> Result<vk::RenderPass, vk::Result> {
        let samples = sample_count_flags(key.msaa_samples(), self.parameters.native_2x_msaa);
        let mut attachments = Vec::with_capacity(SLOT_COUNT);
        let attachment = |format: vk::Format, layout: vk::ImageLayout| {
            vk::AttachmentDescription::default()
                .format(format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                .stencil_store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(layout)
                .final_layout(layout)
        };

        let mut depth_reference = None;
        if key.is_depth_used() {
            let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
            depth_reference = Some(vk::AttachmentReference { attachment: 0, layout });
            attachments.push(attachment(
                depth_vk_format(key.depth_format(), self.parameters.depth_unorm24),
                layout,
            ));
        }

        // Indexed by the guest color render target, gaps unused
        let color_count = key.highest_color_used().map_or(0, |index| index + 1);
        let mut color_references = Vec::with_capacity(color_count);
        for index in 0..color_count {
            if !key.is_color_used(index) {
                color_references.push(vk::AttachmentReference {
                    attachment: vk::ATTACHMENT_UNUSED,
                    layout: vk::ImageLayout::UNDEFINED,
                });
                continue;
            }
            let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            let view_format = key.color_view_format(index);
            let format = if key.color_rts_use_transfer_formats() {
                color_transfer_vk_format(view_format)
            } else {
                color_vk_format(view_format, true)
            };
            color_references.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout,
            });
            attachments.push(attachment(format, layout));
        }

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_references);
        if let Some(depth_reference) = depth_reference.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_reference);
        }

        let mut stage_mask = vk::PipelineStageFlags::empty();
        let mut access_mask = vk::AccessFlags::empty();
        if key.is_depth_used() {
            stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        if color_count != 0 {
            stage_mask |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            access_mask |=
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if attachments.is_empty() {
            // Pixel shader interlock, the EDRAM buffer is accessed from fragment shaders
            stage_mask = vk::PipelineStageFlags::FRAGMENT_SHADER;
            access_mask = vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
        }
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: stage_mask,
                dst_stage_mask: stage_mask,
                src_access_mask: access_mask,
                dst_access_mask: access_mask,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: stage_mask,
                dst_stage_mask: stage_mask,
                src_access_mask: access_mask,
                dst_access_mask: access_mask,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        let subpasses = [subpass];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        device.create_render_pass(&info)
    }

    /// Framebuffer of the render targets bound to the slots of `key`. Without render targets
    /// this is an attachment-less framebuffer as large as guest textures can be.
    pub fn framebuffer<D: Device>(
        &mut self,
        device: &D,
        key: RenderPassKey,
        pitch_tiles_at_32bpp: u32,
        render_targets: &[Option<&VulkanRenderTarget>; SLOT_COUNT],
    ) -> Option<Framebuffer> {
        let framebuffer_key = FramebufferKey {
            render_pass: key,
            pitch_tiles_at_32bpp,
            base_tiles: render_targets.map(|rt| rt.map_or(0, |rt| rt.key().base_tiles())),
        };
        if let Some(&framebuffer) = self.framebuffers.get(&framebuffer_key) {
            return framebuffer;
        }
        let framebuffer = self.render_pass(device, key).and_then(|render_pass| {
            self.create_framebuffer(device, key, render_pass, render_targets)
                .inspect_err(|err| log::error!("Failed to create framebuffer for {key:?}: {err}"))
                .ok()
        });
        self.framebuffers.insert(framebuffer_key, framebuffer);
        framebuffer
    }

    fn create_framebuffer<D: Device>(
        &self,
        device: &D,
        key: RenderPassKey,
        render_pass: vk::RenderPass,
        render_targets: &[Option<&VulkanRenderTarget>; SLOT_COUNT],
    ) -> Result<Framebuffer, vk::Result> {
        let mut views = Vec::with_capacity(SLOT_COUNT);
        let mut extent: Option<vk::Extent2D> = None;
        for (slot, render_target) in render_targets.iter().enumerate() {
            let used =
                if slot == DEPTH_SLOT { key.is_depth_used() } else { key.is_color_used(slot - 1) };
            let Some(render_target) = render_target.filter(|_| used) else { continue };
            let srgb = slot != DEPTH_SLOT
                && key.color_view_format(slot - 1) == ColorRenderTargetFormat::K8888Gamma;
            views.push(render_target.attachment_view(srgb, key.color_rts_use_transfer_formats()));
            let rt_extent = render_target_extent(render_target.key(), &self.parameters);
            extent = Some(match extent {
                Some(extent) => vk::Extent2D {
                    width: extent.width.min(rt_extent.width),
                    height: extent.height.min(rt_extent.height),
                },
                None => rt_extent,
            });
        }

        let extent =
            extent.unwrap_or_else(|| null_framebuffer_extent(self.parameters.resolution_scale));
        let extent = vk::Extent2D {
            width: extent.width.min(self.max_framebuffer_extent.width),
            height: extent.height.min(self.max_framebuffer_extent.height),
        };
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = device.create_framebuffer(&info)?;
        Ok(Framebuffer { framebuffer, extent })
    }

    /// Framebuffers reference render target views and must go before the render targets.
    pub fn destroy_framebuffers<D: Device>(&mut self, device: &D) {
        for framebuffer in self.framebuffers.drain().filter_map(|(_, framebuffer)| framebuffer) {
            device.destroy(DeviceObject::Framebuffer(framebuffer.framebuffer));
        }
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        self.destroy_framebuffers(device);
        for render_pass in self.render_passes.drain().filter_map(|(_, render_pass)| render_pass) {
            device.destroy(DeviceObject::RenderPass(render_pass));
        }
    }
}

fn null_framebuffer_extent(scale: ResolutionScale) -> vk::Extent2D {
    vk::Extent2D {
        width: TEXTURE_2D_MAX_WIDTH_HEIGHT * scale.x,
        height: TEXTURE_2D_MAX_WIDTH_HEIGHT * scale.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::descriptors::DescriptorSetPool;
    use crate::vulkan::device::fake::{capable_features, FakeDevice};
    use ash::vk::Handle;

    const PARAMETERS: RenderTargetParameters = RenderTargetParameters {
        resolution_scale: ResolutionScale { x: 2, y: 2 },
        native_2x_msaa: true,
        gamma_as_srgb: true,
        depth_unorm24: true,
        max_host_height: 16384,
    };

    fn cache() -> RenderPassCache {
        RenderPassCache::new(PARAMETERS, vk::Extent2D { width: 16384, height: 16384 })
    }

    #[test]
    fn key_records_used_slots() {
        let mut keys = [RenderTargetKey::EMPTY; SLOT_COUNT];
        keys[DEPTH_SLOT] =
            RenderTargetKey::depth(0, 16, MsaaSamples::X2, DepthRenderTargetFormat::D24FS8);
        keys[color_slot(2)] =
            RenderTargetKey::color(300, 16, MsaaSamples::X2, ColorRenderTargetFormat::K8888);
        let key = RenderPassKey::for_render_targets(MsaaSamples::X2, &keys, 0b100, false);
        assert!(key.is_depth_used());
        assert!(key.is_color_used(2));
        assert!(!key.is_color_used(0));
        assert_eq!(key.depth_format(), DepthRenderTargetFormat::D24FS8);
        assert_eq!(key.color_view_format(2), ColorRenderTargetFormat::K8888Gamma);
        assert_eq!(key.msaa_samples(), MsaaSamples::X2);

        // Transfers write the unorm view
        let transfer = RenderPassKey::for_render_targets(MsaaSamples::X2, &keys, 0b100, true);
        assert_eq!(transfer.color_view_format(2), ColorRenderTargetFormat::K8888);
    }

    #[test]
    fn depth_only_key_has_no_color_attachments() {
        let mut keys = [RenderTargetKey::EMPTY; SLOT_COUNT];
        keys[DEPTH_SLOT] =
            RenderTargetKey::depth(64, 16, MsaaSamples::X4, DepthRenderTargetFormat::D24S8);
        let key = RenderPassKey::for_render_targets(MsaaSamples::X4, &keys, 0, true);
        assert_eq!(key.depth_and_color_used(), 1);
        assert!((0..MAX_COLOR_RENDER_TARGETS).all(|index| !key.is_color_used(index)));
    }

    #[test]
    fn render_passes_are_memoized() {
        let device = FakeDevice::new(capable_features());
        let mut cache = cache();
        let key = RenderPassKey::default().with_depth_and_color_used(0b10);
        let render_pass = cache.render_pass(&device, key).unwrap();
        assert_eq!(cache.render_pass(&device, key), Some(render_pass));
        assert_eq!(device.live_objects(), 1);
        cache.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn null_framebuffer_is_guest_texture_sized() {
        let device = FakeDevice::new(capable_features());
        let mut cache =
            RenderPassCache::new(PARAMETERS, vk::Extent2D { width: 16384, height: 12000 });
        let framebuffer = cache
            .framebuffer(&device, RenderPassKey::default(), 0, &[None; SLOT_COUNT])
            .unwrap();
        assert_eq!(framebuffer.extent, vk::Extent2D { width: 16384, height: 12000 });
        cache.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn framebuffer_covers_render_targets() {
        let device = FakeDevice::new(capable_features());
        let mut pool = DescriptorSetPool::new(
            vk::DescriptorType::SAMPLED_IMAGE,
            1,
            vk::DescriptorSetLayout::from_raw(1 << 40),
        );
        let rt_key = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let render_target =
            VulkanRenderTarget::create(&device, rt_key, &PARAMETERS, &mut pool).unwrap();

        let mut keys = [RenderTargetKey::EMPTY; SLOT_COUNT];
        keys[color_slot(0)] = rt_key;
        let key = RenderPassKey::for_render_targets(MsaaSamples::X1, &keys, 0, false);
        let mut bound = [None; SLOT_COUNT];
        bound[color_slot(0)] = Some(&render_target);

        let mut cache = cache();
        let framebuffer = cache.framebuffer(&device, key, 16, &bound).unwrap();
        // 1280 pixels wide and 2048 high at 2x2
        assert_eq!(framebuffer.extent, vk::Extent2D { width: 2560, height: 4096 });
        assert_eq!(cache.framebuffer(&device, key, 16, &bound), Some(framebuffer));
        assert_eq!(device.framebuffer_extents.borrow().len(), 1);

        cache.destroy(&device);
        render_target.destroy(&device, &mut pool);
        pool.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
