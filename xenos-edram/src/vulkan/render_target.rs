//! Host images backing EDRAM render targets

use crate::edram::tiles::ResolutionScale;
use crate::edram::{render_target_height, RenderTargetKey};
use crate::vulkan::commands::{DeferredCommandBuffer, ImageBarrier};
use crate::vulkan::descriptors::{DescriptorSetPool, PooledDescriptorSet};
use crate::vulkan::device::{Device, DeviceObject, ImageAllocation};
use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat, MsaaSamples};
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderTargetError {
    #[error("render target {0} has no host format")]
    UnknownFormat(RenderTargetKey),
    #[error("failed to create the image of render target {key}: {err}")]
    Image { key: RenderTargetKey, err: vk::Result },
    #[error("failed to create a view of render target {key}: {err}")]
    View { key: RenderTargetKey, err: vk::Result },
    #[error("failed to allocate the descriptor set of render target {key}: {err}")]
    DescriptorSet { key: RenderTargetKey, err: vk::Result },
}

/// Format of the views that color render targets are drawn with.
pub fn color_vk_format(format: ColorRenderTargetFormat, gamma_as_srgb: bool) -> vk::Format {
    use ColorRenderTargetFormat::*;

    match format {
        K8888 => vk::Format::R8G8B8A8_UNORM,
        K8888Gamma => {
            if gamma_as_srgb {
                vk::Format::R8G8B8A8_SRGB
            } else {
                vk::Format::R8G8B8A8_UNORM
            }
        }
        K2_10_10_10 | K2_10_10_10As10_10_10_10 => vk::Format::A2B10G10R10_UNORM_PACK32,
        K2_10_10_10Float | K2_10_10_10FloatAs16_16_16_16 => vk::Format::R16G16B16A16_SFLOAT,
        K16_16 => vk::Format::R16G16_SNORM,
        K16_16_16_16 => vk::Format::R16G16B16A16_SNORM,
        K16_16Float => vk::Format::R16G16_SFLOAT,
        K16_16_16_16Float => vk::Format::R16G16B16A16_SFLOAT,
        K32Float => vk::Format::R32_SFLOAT,
        K32_32Float => vk::Format::R32G32_SFLOAT,
    }
}

/// Format that color data is copied between render targets with. Formats where conversion
/// through floating point could alter the bits (NaNs, the two SNORM -1 values) are copied as
/// integers.
pub fn color_transfer_vk_format(format: ColorRenderTargetFormat) -> vk::Format {
    match format {
        ColorRenderTargetFormat::K16_16 | ColorRenderTargetFormat::K16_16Float => {
            vk::Format::R16G16_UINT
        }
        ColorRenderTargetFormat::K16_16_16_16 | ColorRenderTargetFormat::K16_16_16_16Float => {
            vk::Format::R16G16B16A16_UINT
        }
        ColorRenderTargetFormat::K32Float => vk::Format::R32_UINT,
        ColorRenderTargetFormat::K32_32Float => vk::Format::R32G32_UINT,
        _ => color_vk_format(format, false),
    }
}

pub fn depth_vk_format(format: DepthRenderTargetFormat, depth_unorm24: bool) -> vk::Format {
    match format {
        DepthRenderTargetFormat::D24S8 if depth_unorm24 => vk::Format::D24_UNORM_S8_UINT,
        _ => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Whether the host depth of the format holds values that don't round-trip through the guest
/// 24-bit representation, so host depth must be kept separately across ownership transfers.
pub fn is_host_depth_encoding_different(
    format: DepthRenderTargetFormat,
    depth_unorm24: bool,
) -> bool {
    match format {
        DepthRenderTargetFormat::D24S8 => !depth_unorm24,
        DepthRenderTargetFormat::D24FS8 => true,
    }
}

pub fn sample_count_flags(msaa_samples: MsaaSamples, native_2x_msaa: bool) -> vk::SampleCountFlags {
    match msaa_samples {
        MsaaSamples::X1 => vk::SampleCountFlags::TYPE_1,
        MsaaSamples::X2 if native_2x_msaa => vk::SampleCountFlags::TYPE_2,
        MsaaSamples::X2 | MsaaSamples::X4 => vk::SampleCountFlags::TYPE_4,
    }
}

/// Synchronization scope the image was last accessed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetUsage {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

impl RenderTargetUsage {
    pub const INITIAL: Self = Self {
        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        access: vk::AccessFlags::empty(),
        layout: vk::ImageLayout::UNDEFINED,
    };

    /// Drawing to the image as an attachment.
    pub fn draw(is_depth: bool) -> Self {
        if is_depth {
            Self {
                stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        } else {
            Self {
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }
        }
    }

    /// Sampling the image in shaders of `stage`.
    pub fn shader_read(stage: vk::PipelineStageFlags) -> Self {
        Self {
            stage,
            access: vk::AccessFlags::SHADER_READ,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Cache-wide parameters of render target creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetParameters {
    pub resolution_scale: ResolutionScale,
    pub native_2x_msaa: bool,
    pub gamma_as_srgb: bool,
    pub depth_unorm24: bool,
    pub max_host_height: u32,
}

/// Host image extent of render targets of the key.
pub fn render_target_extent(
    key: RenderTargetKey,
    parameters: &RenderTargetParameters,
) -> vk::Extent2D {
    let scale = parameters.resolution_scale;
    let height = render_target_height(
        key.pitch_tiles_at_32bpp(),
        key.msaa_samples(),
        scale.y,
        parameters.max_host_height,
    );
    vk::Extent2D { width: key.width_pixels() * scale.x, height: height * scale.y }
}

#[derive(Debug)]
pub struct VulkanRenderTarget {
    key: RenderTargetKey,
    image: ImageAllocation,
    extent: vk::Extent2D,
    // Color, or the depth aspect of depth
    view_depth_color: vk::ImageView,
    // Depth render targets only
    view_depth_stencil: vk::ImageView,
    view_stencil: vk::ImageView,
    // 8_8_8_8 with gamma drawn as sRGB
    view_srgb: vk::ImageView,
    // Color formats copied as integers
    view_color_transfer_separate: vk::ImageView,
    descriptor_set: PooledDescriptorSet,
    usage: RenderTargetUsage,
}

impl VulkanRenderTarget {
    /// Creates the image, the views and the transfer source descriptor set. Nothing is left
    /// allocated on failure.
    pub fn create<D: Device>(
        device: &D,
        key: RenderTargetKey,
        parameters: &RenderTargetParameters,
        descriptor_pool: &mut DescriptorSetPool,
    ) -> Result<Self, RenderTargetError> {
        let mut objects = Vec::new();
        let result = Self::create_objects(device, key, parameters, descriptor_pool, &mut objects);
        if result.is_err() {
            for object in objects.into_iter().rev() {
                device.destroy(object);
            }
        }
        result
    }

    fn create_objects<D: Device>(
        device: &D,
        key: RenderTargetKey,
        parameters: &RenderTargetParameters,
        descriptor_pool: &mut DescriptorSetPool,
        objects: &mut Vec<DeviceObject>,
    ) -> Result<Self, RenderTargetError> {
        let formats = (key.color_format(), key.depth_format());
        let (format, transfer_format, srgb_format, usage, aspect) = match formats {
            (Some(color_format), _) => {
                let format = color_vk_format(color_format, false);
                let srgb = (parameters.gamma_as_srgb
                    && color_format == ColorRenderTargetFormat::K8888)
                    .then_some(vk::Format::R8G8B8A8_SRGB);
                let transfer = color_transfer_vk_format(color_format);
                (
                    format,
                    Some(transfer).filter(|&transfer| transfer != format),
                    srgb,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    vk::ImageAspectFlags::COLOR,
                )
            }
            (_, Some(depth_format)) => (
                depth_vk_format(depth_format, parameters.depth_unorm24),
                None,
                None,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                vk::ImageAspectFlags::DEPTH,
            ),
            _ => return Err(RenderTargetError::UnknownFormat(key)),
        };

        let extent = render_target_extent(key, parameters);
        let flags = if transfer_format.is_some() || srgb_format.is_some() {
            vk::ImageCreateFlags::MUTABLE_FORMAT
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(sample_count_flags(key.msaa_samples(), parameters.native_2x_msaa))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = device
            .create_image(&image_info)
            .map_err(|err| RenderTargetError::Image { key, err })?;
        objects.push(DeviceObject::Image(image));

        let mut create_view = |format: vk::Format,
                               aspect: vk::ImageAspectFlags|
         -> Result<vk::ImageView, RenderTargetError> {
            let info = vk::ImageViewCreateInfo::default()
                .image(image.image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = device
                .create_image_view(&info)
                .map_err(|err| RenderTargetError::View { key, err })?;
            objects.push(DeviceObject::ImageView(view));
            Ok(view)
        };

        let view_depth_color = create_view(format, aspect)?;
        let (view_depth_stencil, view_stencil) = if key.is_depth() {
            (
                create_view(format, vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)?,
                create_view(format, vk::ImageAspectFlags::STENCIL)?,
            )
        } else {
            (vk::ImageView::null(), vk::ImageView::null())
        };
        let view_srgb = match srgb_format {
            Some(srgb_format) => create_view(srgb_format, aspect)?,
            None => vk::ImageView::null(),
        };
        let view_color_transfer_separate = match transfer_format {
            Some(transfer_format) => create_view(transfer_format, aspect)?,
            None => vk::ImageView::null(),
        };

        let descriptor_set = descriptor_pool
            .allocate(device)
            .map_err(|err| RenderTargetError::DescriptorSet { key, err })?;
        let render_target = Self {
            key,
            image,
            extent,
            view_depth_color,
            view_depth_stencil,
            view_stencil,
            view_srgb,
            view_color_transfer_separate,
            descriptor_set,
            usage: RenderTargetUsage::INITIAL,
        };
        device.write_sampled_images(descriptor_set.set, &render_target.transfer_source_views());

        log::info!("Created render target {key} ({}x{})", extent.width, extent.height);
        Ok(render_target)
    }

    /// Releases the views, the image and the descriptor set.
    pub fn destroy<D: Device>(self, device: &D, descriptor_pool: &mut DescriptorSetPool) {
        descriptor_pool.free(device, self.descriptor_set);
        for view in [
            self.view_color_transfer_separate,
            self.view_srgb,
            self.view_stencil,
            self.view_depth_stencil,
            self.view_depth_color,
        ] {
            if view != vk::ImageView::null() {
                device.destroy(DeviceObject::ImageView(view));
            }
        }
        device.destroy(DeviceObject::Image(self.image));
    }

    pub fn key(&self) -> RenderTargetKey {
        self.key
    }

    pub fn image(&self) -> vk::Image {
        self.image.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set.set
    }

    fn transfer_source_views(&self) -> Vec<vk::ImageView> {
        if self.key.is_depth() {
            vec![self.view_depth_color, self.view_stencil]
        } else {
            vec![self.transfer_color_view()]
        }
    }

    fn transfer_color_view(&self) -> vk::ImageView {
        if self.view_color_transfer_separate != vk::ImageView::null() {
            self.view_color_transfer_separate
        } else {
            self.view_depth_color
        }
    }

    /// View to bind as a framebuffer attachment. `srgb` selects the sRGB view of gamma render
    /// targets if there's one, `transfer` the integer view of formats copied as integers.
    pub fn attachment_view(&self, srgb: bool, transfer: bool) -> vk::ImageView {
        if self.key.is_depth() {
            self.view_depth_stencil
        } else if transfer {
            self.transfer_color_view()
        } else if srgb && self.view_srgb != vk::ImageView::null() {
            self.view_srgb
        } else {
            self.view_depth_color
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if self.key.is_depth() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    pub fn usage(&self) -> RenderTargetUsage {
        self.usage
    }

    /// Bookkeeping after a barrier to `usage` has been recorded.
    pub fn set_usage(&mut self, usage: RenderTargetUsage) {
        self.usage = usage;
    }

    /// Records the barrier from the current usage to `usage` and updates the usage.
    pub fn transition(&mut self, commands: &mut DeferredCommandBuffer, usage: RenderTargetUsage) {
        commands.push_image_barrier(
            self.usage.stage,
            usage.stage,
            ImageBarrier {
                image: self.image.image,
                aspect: self.aspect(),
                src_access: self.usage.access,
                dst_access: usage.access,
                old_layout: self.usage.layout,
                new_layout: usage.layout,
            },
        );
        self.set_usage(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::device::fake::{capable_features, FakeDevice};
    use ash::vk::Handle;

    const PARAMETERS: RenderTargetParameters = RenderTargetParameters {
        resolution_scale: ResolutionScale::NATIVE,
        native_2x_msaa: true,
        gamma_as_srgb: true,
        depth_unorm24: true,
        max_host_height: 16384,
    };

    fn pool(descriptors: u32) -> DescriptorSetPool {
        DescriptorSetPool::new(
            vk::DescriptorType::SAMPLED_IMAGE,
            descriptors,
            vk::DescriptorSetLayout::from_raw(1 << 40),
        )
    }

    #[test]
    fn transfer_formats_keep_bits() {
        assert_eq!(
            color_transfer_vk_format(ColorRenderTargetFormat::K16_16),
            vk::Format::R16G16_UINT
        );
        assert_eq!(
            color_transfer_vk_format(ColorRenderTargetFormat::K32_32Float),
            vk::Format::R32G32_UINT
        );
        assert_eq!(
            color_transfer_vk_format(ColorRenderTargetFormat::K8888),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            color_vk_format(ColorRenderTargetFormat::K8888Gamma, true),
            vk::Format::R8G8B8A8_SRGB
        );
    }

    #[test]
    fn depth_formats() {
        use DepthRenderTargetFormat::{D24FS8, D24S8};
        assert_eq!(depth_vk_format(D24S8, true), vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(depth_vk_format(D24S8, false), vk::Format::D32_SFLOAT_S8_UINT);
        assert_eq!(depth_vk_format(D24FS8, true), vk::Format::D32_SFLOAT_S8_UINT);
        assert!(!is_host_depth_encoding_different(DepthRenderTargetFormat::D24S8, true));
        assert!(is_host_depth_encoding_different(DepthRenderTargetFormat::D24S8, false));
        assert!(is_host_depth_encoding_different(DepthRenderTargetFormat::D24FS8, true));
    }

    #[test]
    fn emulated_2x_uses_4x_images() {
        assert_eq!(sample_count_flags(MsaaSamples::X2, true), vk::SampleCountFlags::TYPE_2);
        assert_eq!(sample_count_flags(MsaaSamples::X2, false), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn color_render_target_objects() {
        let device = FakeDevice::new(capable_features());
        let mut pool = pool(1);
        // 1280 pixels at 1x is 16 tiles
        let key =
            RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K16_16_16_16);
        let render_target =
            VulkanRenderTarget::create(&device, key, &PARAMETERS, &mut pool).unwrap();
        // Pool, image, drawing and transfer views
        assert_eq!(device.live_objects(), 4);
        let image = device.images.borrow()[0];
        assert_eq!(image.format, vk::Format::R16G16B16A16_SNORM);
        assert_eq!(image.extent.width, 1280);
        // 2048 tiles at 16 tiles per row is 128 rows of 16
        assert_eq!(image.extent.height, 2048);
        assert_ne!(
            render_target.attachment_view(false, true),
            render_target.attachment_view(false, false)
        );

        render_target.destroy(&device, &mut pool);
        pool.destroy(&device);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.freed_descriptor_sets.borrow().len(), 1);
    }

    #[test]
    fn depth_render_target_views() {
        let device = FakeDevice::new(capable_features());
        let mut pool = pool(2);
        let key = RenderTargetKey::depth(100, 10, MsaaSamples::X4, DepthRenderTargetFormat::D24FS8);
        let render_target =
            VulkanRenderTarget::create(&device, key, &PARAMETERS, &mut pool).unwrap();
        // Pool, image, depth, depth-stencil and stencil views
        assert_eq!(device.live_objects(), 5);
        assert_eq!(device.images.borrow()[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(
            render_target.aspect(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        render_target.destroy(&device, &mut pool);
        pool.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn failed_creation_leaves_nothing() {
        let device = FakeDevice::new(capable_features());
        device.fail_images.set(true);
        let mut pool = pool(1);
        let key = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        assert!(matches!(
            VulkanRenderTarget::create(&device, key, &PARAMETERS, &mut pool),
            Err(RenderTargetError::Image { .. })
        ));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn transitions_update_usage() {
        let device = FakeDevice::new(capable_features());
        let mut pool = pool(1);
        let key = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let mut render_target =
            VulkanRenderTarget::create(&device, key, &PARAMETERS, &mut pool).unwrap();
        let mut commands = DeferredCommandBuffer::new();
        render_target.transition(&mut commands, RenderTargetUsage::draw(false));
        assert_eq!(render_target.usage(), RenderTargetUsage::draw(false));
        commands.submit_barriers();
        assert_eq!(commands.commands().len(), 1);
        render_target.destroy(&device, &mut pool);
    }
}
