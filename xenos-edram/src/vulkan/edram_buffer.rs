//! Usage tracking of the EDRAM buffer: which kind of access it was last used for, and whether
//! shader writes since the last barrier are outstanding

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdramBufferUsage {
    FragmentRead,
    FragmentReadWrite,
    ComputeRead,
    ComputeWrite,
    TransferRead,
    TransferWrite,
}

impl EdramBufferUsage {
    pub fn masks(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        use vk::{AccessFlags, PipelineStageFlags};
        match self {
            Self::FragmentRead => (PipelineStageFlags::FRAGMENT_SHADER, AccessFlags::SHADER_READ),
            Self::FragmentReadWrite => (
                PipelineStageFlags::FRAGMENT_SHADER,
                AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            ),
            Self::ComputeRead => (PipelineStageFlags::COMPUTE_SHADER, AccessFlags::SHADER_READ),
            Self::ComputeWrite => (PipelineStageFlags::COMPUTE_SHADER, AccessFlags::SHADER_WRITE),
            Self::TransferRead => (PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_READ),
            Self::TransferWrite => (PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_WRITE),
        }
    }
}

/// Writes made since the last barrier covering the buffer, ordered by how much synchronization
/// they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdramBufferModification {
    Unmodified,
    // Compute shaders or fragment shaders outside an interlock
    ViaUnordered,
    ViaPixelShaderInterlock,
}

/// The full-buffer memory barrier that must be recorded before the next access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdramBufferBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdramBufferState {
    usage: EdramBufferUsage,
    modification: EdramBufferModification,
}

impl Default for EdramBufferState {
    fn default() -> Self {
        Self::new()
    }
}

impl EdramBufferState {
    pub fn new() -> Self {
        // Like after the initial clear
        Self {
            usage: EdramBufferUsage::FragmentReadWrite,
            modification: EdramBufferModification::Unmodified,
        }
    }

    pub fn usage(&self) -> EdramBufferUsage {
        self.usage
    }

    pub fn modification(&self) -> EdramBufferModification {
        self.modification
    }

    /// Switches to `new_usage`, returning the barrier to record if the usage changes. The
    /// barrier covers all earlier writes.
    #[must_use]
    pub fn use_as(&mut self, new_usage: EdramBufferUsage) -> Option<EdramBufferBarrier> {
        if self.usage == new_usage {
            return None;
        }
        let (src_stage, src_access) = self.usage.masks();
        let (dst_stage, dst_access) = new_usage.masks();
        self.usage = new_usage;
        self.modification = EdramBufferModification::Unmodified;
        Some(EdramBufferBarrier { src_stage, src_access, dst_stage, dst_access })
    }

    /// Records that writes were made with the current usage.
    pub fn mark_modified(&mut self, modification: EdramBufferModification) {
        match self.usage {
            EdramBufferUsage::FragmentReadWrite => debug_assert!(
                modification == EdramBufferModification::ViaPixelShaderInterlock,
                "fragment writes to the EDRAM buffer are only made within the interlock"
            ),
            EdramBufferUsage::ComputeWrite => debug_assert!(
                modification == EdramBufferModification::ViaUnordered,
                "compute writes to the EDRAM buffer are unordered"
            ),
            usage => {
                debug_assert!(false, "EDRAM buffer marked as modified while used as {usage:?}")
            }
        }
        self.modification = self.modification.max(modification);
    }

    /// Makes writes at or above `threshold` visible to later accesses of the same usage. Returns
    /// the barrier to record, `None` if no such writes are outstanding.
    #[must_use]
    pub fn commit_shader_writes(
        &mut self,
        threshold: EdramBufferModification,
    ) -> Option<EdramBufferBarrier> {
        debug_assert_ne!(threshold, EdramBufferModification::Unmodified);
        if self.modification < threshold {
            return None;
        }
        let (stage, access) = self.usage.masks();
        self.modification = EdramBufferModification::Unmodified;
        Some(EdramBufferBarrier {
            src_stage: stage,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_stage: stage,
            dst_access: access,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_usage_needs_no_barrier() {
        let mut state = EdramBufferState::new();
        assert_eq!(state.use_as(EdramBufferUsage::FragmentReadWrite), None);
        let barrier = state.use_as(EdramBufferUsage::ComputeRead).unwrap();
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(state.use_as(EdramBufferUsage::ComputeRead), None);
    }

    #[test]
    fn usage_barrier_resets_modification() {
        let mut state = EdramBufferState::new();
        let _ = state.use_as(EdramBufferUsage::ComputeWrite);
        state.mark_modified(EdramBufferModification::ViaUnordered);
        assert_eq!(state.modification(), EdramBufferModification::ViaUnordered);
        assert!(state.use_as(EdramBufferUsage::FragmentReadWrite).is_some());
        assert_eq!(state.modification(), EdramBufferModification::Unmodified);
        assert_eq!(state.commit_shader_writes(EdramBufferModification::ViaUnordered), None);
    }

    #[test]
    fn commit_respects_threshold() {
        let mut state = EdramBufferState::new();
        state.mark_modified(EdramBufferModification::ViaPixelShaderInterlock);
        assert!(state.commit_shader_writes(EdramBufferModification::ViaUnordered).is_some());
        assert_eq!(state.modification(), EdramBufferModification::Unmodified);

        let _ = state.use_as(EdramBufferUsage::ComputeWrite);
        state.mark_modified(EdramBufferModification::ViaUnordered);
        assert_eq!(
            state.commit_shader_writes(EdramBufferModification::ViaPixelShaderInterlock),
            None
        );
        let barrier = state.commit_shader_writes(EdramBufferModification::ViaUnordered).unwrap();
        assert_eq!(barrier.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(barrier.src_stage, barrier.dst_stage);
    }

    #[test]
    fn modification_only_grows() {
        let mut state = EdramBufferState::new();
        state.mark_modified(EdramBufferModification::ViaPixelShaderInterlock);
        state.mark_modified(EdramBufferModification::ViaPixelShaderInterlock);
        assert_eq!(state.modification(), EdramBufferModification::ViaPixelShaderInterlock);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "marked as modified")]
    fn modifying_while_reading_is_a_bug() {
        let mut state = EdramBufferState::new();
        let _ = state.use_as(EdramBufferUsage::ComputeRead);
        state.mark_modified(EdramBufferModification::ViaUnordered);
    }
}
