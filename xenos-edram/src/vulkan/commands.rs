//! Commands recorded by the render target cache, replayed into a Vulkan command buffer when the
//! submission is built

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BarrierBatch {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

/// Viewport with the full depth range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    ColorFloat([f32; 4]),
    ColorUint([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearAttachment {
    pub aspect: vk::ImageAspectFlags,
    pub color_attachment: u32,
    pub value: ClearValue,
}

impl ClearAttachment {
    fn to_vk(self) -> vk::ClearAttachment {
        let clear_value = match self.value {
            ClearValue::ColorFloat(float32) => {
                vk::ClearValue { color: vk::ClearColorValue { float32 } }
            }
            ClearValue::ColorUint(uint32) => {
                vk::ClearValue { color: vk::ClearColorValue { uint32 } }
            }
            ClearValue::DepthStencil { depth, stencil } => {
                vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth, stencil } }
            }
        };
        vk::ClearAttachment {
            aspect_mask: self.aspect,
            color_attachment: self.color_attachment,
            clear_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    PipelineBarrier(BarrierBatch),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(vk::Rect2D),
    SetStencilCompareMask(u32),
    SetStencilWriteMask(u32),
    SetStencilReference(u32),
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    ClearAttachments {
        attachments: Vec<ClearAttachment>,
        rect: vk::Rect2D,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// An ordered command list. Barriers are held back and merged per pair of source and
/// destination stages until the next command that depends on them is recorded.
#[derive(Debug, Default)]
pub struct DeferredCommandBuffer {
    commands: Vec<Command>,
    pending_barriers: Vec<BarrierBatch>,
    in_render_pass: bool,
}

impl DeferredCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Drops the recorded commands after they have been executed.
    pub fn reset(&mut self) {
        debug_assert!(!self.in_render_pass);
        self.commands.clear();
        self.pending_barriers.clear();
    }

    fn pending_batch(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> &mut BarrierBatch {
        let index = match self
            .pending_barriers
            .iter()
            .position(|batch| batch.src_stage == src_stage && batch.dst_stage == dst_stage)
        {
            Some(index) => index,
            None => {
                self.pending_barriers.push(BarrierBatch {
                    src_stage,
                    dst_stage,
                    ..BarrierBatch::default()
                });
                self.pending_barriers.len() - 1
            }
        };
        &mut self.pending_barriers[index]
    }

    /// Returns whether a barrier is needed, nothing is recorded for a read-after-read with the
    /// same stages and access.
    pub fn push_buffer_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: BufferBarrier,
    ) -> bool {
        if src_stage == dst_stage
            && barrier.src_access == barrier.dst_access
            && !has_writes(barrier.src_access)
        {
            return false;
        }
        let batch = self.pending_batch(src_stage, dst_stage);
        match batch.buffers.iter_mut().find(|pending| {
            pending.buffer == barrier.buffer
                && pending.offset == barrier.offset
                && pending.size == barrier.size
        }) {
            Some(pending) => {
                pending.src_access |= barrier.src_access;
                pending.dst_access |= barrier.dst_access;
            }
            None => batch.buffers.push(barrier),
        }
        true
    }

    pub fn push_image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: ImageBarrier,
    ) -> bool {
        if src_stage == dst_stage
            && barrier.src_access == barrier.dst_access
            && barrier.old_layout == barrier.new_layout
            && !has_writes(barrier.src_access)
        {
            return false;
        }
        self.pending_batch(src_stage, dst_stage).images.push(barrier);
        true
    }

    /// Records the pending barriers.
    pub fn submit_barriers(&mut self) {
        for batch in self.pending_barriers.drain(..) {
            self.commands.push(Command::PipelineBarrier(batch));
        }
    }

    fn record(&mut self, command: Command) {
        self.submit_barriers();
        self.commands.push(command);
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.record(Command::BindPipeline { bind_point, pipeline });
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(Command::PushConstants { layout, stages, offset, data: data.to_vec() });
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        debug_assert!(!self.in_render_pass);
        self.record(Command::BeginRenderPass { render_pass, framebuffer, extent });
        self.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self) {
        debug_assert!(self.in_render_pass);
        self.commands.push(Command::EndRenderPass);
        self.in_render_pass = false;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.commands.push(Command::SetScissor(scissor));
    }

    pub fn set_stencil_compare_mask(&mut self, mask: u32) {
        self.commands.push(Command::SetStencilCompareMask(mask));
    }

    pub fn set_stencil_write_mask(&mut self, mask: u32) {
        self.commands.push(Command::SetStencilWriteMask(mask));
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.commands.push(Command::SetStencilReference(reference));
    }

    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.record(Command::BindVertexBuffer { buffer, offset });
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        debug_assert!(self.in_render_pass);
        self.record(Command::Draw { vertex_count, first_vertex });
    }

    pub fn clear_attachments(&mut self, attachments: &[ClearAttachment], rect: vk::Rect2D) {
        debug_assert!(self.in_render_pass);
        self.record(Command::ClearAttachments { attachments: attachments.to_vec(), rect });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(!self.in_render_pass);
        self.record(Command::Dispatch { x, y, z });
    }

    /// Replays the commands into `command_buffer`, which must be in the recording state.
    ///
    /// # Safety
    ///
    /// Every handle referenced by the commands must be alive and belong to `device`.
    pub unsafe fn execute(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        self.submit_barriers();
        for command in &self.commands {
            match command {
                Command::BindPipeline { bind_point, pipeline } => {
                    device.cmd_bind_pipeline(command_buffer, *bind_point, *pipeline);
                }
                Command::BindDescriptorSets { bind_point, layout, first_set, sets } => {
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        *bind_point,
                        *layout,
                        *first_set,
                        sets,
                        &[],
                    );
                }
                Command::PushConstants { layout, stages, offset, data } => {
                    device.cmd_push_constants(command_buffer, *layout, *stages, *offset, data);
                }
                Command::PipelineBarrier(batch) => {
                    let buffers: Vec<_> = batch
                        .buffers
                        .iter()
                        .map(|barrier| {
                            vk::BufferMemoryBarrier::default()
                                .buffer(barrier.buffer)
                                .src_access_mask(barrier.src_access)
                                .dst_access_mask(barrier.dst_access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .offset(barrier.offset)
                                .size(barrier.size)
                        })
                        .collect();
                    let images: Vec<_> = batch
                        .images
                        .iter()
                        .map(|barrier| {
                            vk::ImageMemoryBarrier::default()
                                .image(barrier.image)
                                .src_access_mask(barrier.src_access)
                                .dst_access_mask(barrier.dst_access)
                                .old_layout(barrier.old_layout)
                                .new_layout(barrier.new_layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .subresource_range(
                                    vk::ImageSubresourceRange::default()
                                        .aspect_mask(barrier.aspect)
                                        .level_count(1)
                                        .layer_count(1),
                                )
                        })
                        .collect();
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        batch.src_stage,
                        batch.dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &buffers,
                        &images,
                    );
                }
                Command::BeginRenderPass { render_pass, framebuffer, extent } => {
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: *extent,
                        });
                    device.cmd_begin_render_pass(
                        command_buffer,
                        &info,
                        vk::SubpassContents::INLINE,
                    );
                }
                Command::EndRenderPass => device.cmd_end_render_pass(command_buffer),
                Command::SetViewport(viewport) => {
                    let viewport = vk::Viewport {
                        x: viewport.x,
                        y: viewport.y,
                        width: viewport.width,
                        height: viewport.height,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    device.cmd_set_viewport(command_buffer, 0, &[viewport]);
                }
                Command::SetScissor(scissor) => {
                    device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(scissor));
                }
                Command::SetStencilCompareMask(mask) => {
                    device.cmd_set_stencil_compare_mask(
                        command_buffer,
                        vk::StencilFaceFlags::FRONT_AND_BACK,
                        *mask,
                    );
                }
                Command::SetStencilWriteMask(mask) => {
                    device.cmd_set_stencil_write_mask(
                        command_buffer,
                        vk::StencilFaceFlags::FRONT_AND_BACK,
                        *mask,
                    );
                }
                Command::SetStencilReference(reference) => {
                    device.cmd_set_stencil_reference(
                        command_buffer,
                        vk::StencilFaceFlags::FRONT_AND_BACK,
                        *reference,
                    );
                }
                Command::BindVertexBuffer { buffer, offset } => {
                    device.cmd_bind_vertex_buffers(command_buffer, 0, &[*buffer], &[*offset]);
                }
                Command::Draw { vertex_count, first_vertex } => {
                    device.cmd_draw(command_buffer, *vertex_count, 1, *first_vertex, 0);
                }
                Command::ClearAttachments { attachments, rect } => {
                    let attachments: Vec<_> =
                        attachments.iter().map(|attachment| attachment.to_vk()).collect();
                    let rects =
                        [vk::ClearRect { rect: *rect, base_array_layer: 0, layer_count: 1 }];
                    device.cmd_clear_attachments(command_buffer, &attachments, &rects);
                }
                Command::Dispatch { x, y, z } => device.cmd_dispatch(command_buffer, *x, *y, *z),
            }
        }
    }
}

fn has_writes(access: vk::AccessFlags) -> bool {
    access.intersects(
        vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags::TRANSFER_WRITE
            | vk::AccessFlags::HOST_WRITE
            | vk::AccessFlags::MEMORY_WRITE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer_barrier(
        buffer: u64,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> BufferBarrier {
        BufferBarrier {
            buffer: vk::Buffer::from_raw(buffer),
            src_access,
            dst_access,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }

    #[test]
    fn barriers_merge_per_stage_pair() {
        let mut commands = DeferredCommandBuffer::new();
        let compute = vk::PipelineStageFlags::COMPUTE_SHADER;
        let fragment = vk::PipelineStageFlags::FRAGMENT_SHADER;
        assert!(commands.push_buffer_barrier(
            compute,
            fragment,
            buffer_barrier(1, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ),
        ));
        assert!(commands.push_buffer_barrier(
            compute,
            fragment,
            buffer_barrier(2, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ),
        ));
        assert!(commands.push_buffer_barrier(
            fragment,
            compute,
            buffer_barrier(3, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ),
        ));
        assert!(commands.commands().is_empty());

        commands.dispatch(1, 1, 1);
        let recorded = commands.commands();
        assert_eq!(recorded.len(), 3);
        match &recorded[0] {
            Command::PipelineBarrier(batch) => {
                assert_eq!(batch.src_stage, compute);
                assert_eq!(batch.buffers.len(), 2);
            }
            command => panic!("expected a barrier, got {command:?}"),
        }
        assert!(matches!(
            &recorded[1],
            Command::PipelineBarrier(batch) if batch.buffers.len() == 1
        ));
        assert_eq!(recorded[2], Command::Dispatch { x: 1, y: 1, z: 1 });
    }

    #[test]
    fn same_buffer_access_is_combined() {
        let mut commands = DeferredCommandBuffer::new();
        let stage = vk::PipelineStageFlags::COMPUTE_SHADER;
        commands.push_buffer_barrier(
            stage,
            stage,
            buffer_barrier(1, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ),
        );
        commands.push_buffer_barrier(
            stage,
            stage,
            buffer_barrier(1, vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_WRITE),
        );
        commands.submit_barriers();
        let [Command::PipelineBarrier(batch)] = commands.commands() else {
            panic!("expected one barrier");
        };
        assert_eq!(batch.buffers.len(), 1);
        assert_eq!(
            batch.buffers[0].dst_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
    }

    #[test]
    fn read_after_read_needs_no_barrier() {
        let mut commands = DeferredCommandBuffer::new();
        let stage = vk::PipelineStageFlags::FRAGMENT_SHADER;
        assert!(!commands.push_buffer_barrier(
            stage,
            stage,
            buffer_barrier(1, vk::AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_READ),
        ));
        commands.submit_barriers();
        assert!(commands.commands().is_empty());
    }

    #[test]
    fn dynamic_state_does_not_flush_barriers() {
        let mut commands = DeferredCommandBuffer::new();
        commands.push_image_barrier(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageBarrier {
                image: vk::Image::from_raw(5),
                aspect: vk::ImageAspectFlags::COLOR,
                src_access: vk::AccessFlags::SHADER_READ,
                dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        );
        commands.set_stencil_reference(0xFF);
        assert_eq!(commands.commands(), [Command::SetStencilReference(0xFF)]);
        commands.begin_render_pass(
            vk::RenderPass::from_raw(1),
            vk::Framebuffer::from_raw(2),
            vk::Extent2D { width: 16, height: 16 },
        );
        assert!(matches!(commands.commands()[1], Command::PipelineBarrier(_)));
        assert!(commands.is_in_render_pass());
        commands.end_render_pass();
        assert!(!commands.is_in_render_pass());
    }
}
