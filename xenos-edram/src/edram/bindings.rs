//! Render targets bound for a draw, and the EDRAM tiles the draw may write in each of them

use crate::edram::{render_target_height, surface_pitch_tiles, RenderTargetKey};
use crate::registers::RenderTargetRegisters;
use crate::xenos::{
    ModeControl, MsaaSamples, EDRAM_TILE_COUNT, EDRAM_TILE_COUNT_MASK, EDRAM_TILE_HEIGHT_SAMPLES,
    MAX_COLOR_RENDER_TARGETS,
};

pub const DEPTH_SLOT: usize = 0;
// Depth followed by the color render targets
pub const SLOT_COUNT: usize = 1 + MAX_COLOR_RENDER_TARGETS;

pub fn color_slot(index: usize) -> usize {
    1 + index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundRenderTarget {
    pub key: RenderTargetKey,
    // Tiles from the base that the draw may modify
    pub length_tiles: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLimits {
    pub resolution_scale_y: u32,
    pub max_host_height: u32,
    pub mrt_edram_used_range_clamp_to_min: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawBindings {
    pub slots: [Option<BoundRenderTarget>; SLOT_COUNT],
    pub msaa_samples: MsaaSamples,
    pub pitch_tiles_at_32bpp: u32,
    // Guest pixel rows the draw may touch
    pub height_used: u32,
}

impl DrawBindings {
    /// Decodes the render targets of a draw. `shader_color_targets_written` has a bit for every
    /// color render target the pixel shader exports.
    pub fn from_registers(
        registers: &RenderTargetRegisters,
        shader_color_targets_written: u32,
        limits: &BindingLimits,
    ) -> Self {
        let surface_pitch = registers.surface_info.surface_pitch();
        let edram_mode = registers.mode_control.edram_mode();
        if surface_pitch == 0 || !matches!(edram_mode, ModeControl::ColorDepth | ModeControl::Depth)
        {
            return Self::default();
        }

        let msaa_samples = registers.surface_info.msaa_samples().unwrap_or_else(|| {
            log::warn!(
                "Invalid MSAA mode {}, drawing with 4x",
                registers.surface_info.msaa_samples_bits()
            );
            MsaaSamples::X4
        });
        let pitch_tiles_at_32bpp = surface_pitch_tiles(surface_pitch, msaa_samples, false);

        let mut keys = [RenderTargetKey::EMPTY; SLOT_COUNT];
        let depth_control = registers.depth_control;
        if depth_control.z_enable() || depth_control.stencil_enable() {
            keys[DEPTH_SLOT] = RenderTargetKey::depth(
                registers.depth_info.depth_base() & EDRAM_TILE_COUNT_MASK,
                pitch_tiles_at_32bpp,
                msaa_samples,
                registers.depth_info.depth_format(),
            );
        }

        if edram_mode == ModeControl::ColorDepth {
            for (index, color_info) in registers.color_info.iter().enumerate() {
                if shader_color_targets_written & (1 << index) == 0 {
                    continue;
                }
                let Some(format) = color_info.color_format() else {
                    log::warn!(
                        "Invalid color format {} in render target {index}",
                        color_info.color_format_bits()
                    );
                    continue;
                };
                let components = (1 << format.component_count()) - 1;
                if registers.color_mask.write_mask(index) & components == 0 {
                    continue;
                }
                keys[color_slot(index)] = RenderTargetKey::color(
                    color_info.color_base() & EDRAM_TILE_COUNT_MASK,
                    pitch_tiles_at_32bpp,
                    msaa_samples,
                    format,
                );
            }
        }

        eliminate_duplicate_bases(&mut keys);

        let render_target_height = render_target_height(
            pitch_tiles_at_32bpp,
            msaa_samples,
            limits.resolution_scale_y,
            limits.max_host_height,
        );
        let height_used = registers.bounds.height_limit(render_target_height);
        let rows_used = (height_used << msaa_samples.y_log2()).div_ceil(EDRAM_TILE_HEIGHT_SAMPLES);

        let mut slots = [None; SLOT_COUNT];
        for (slot, &key) in slots.iter_mut().zip(&keys) {
            if !key.is_empty() {
                let length_tiles =
                    (rows_used * key.pitch_tiles()).min(EDRAM_TILE_COUNT - key.base_tiles());
                *slot = Some(BoundRenderTarget { key, length_tiles });
            }
        }
        clamp_to_next_bases(&mut slots, limits.mrt_edram_used_range_clamp_to_min);

        Self { slots, msaa_samples, pitch_tiles_at_32bpp, height_used }
    }

    pub fn keys(&self) -> [RenderTargetKey; SLOT_COUNT] {
        self.slots.map(|slot| slot.map_or(RenderTargetKey::EMPTY, |bound| bound.key))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn bound(&self) -> impl Iterator<Item = BoundRenderTarget> + '_ {
        self.slots.iter().flatten().copied()
    }
}

// Only one render target may be bound at each base: the lowest color slot, and color over depth
fn eliminate_duplicate_bases(keys: &mut [RenderTargetKey; SLOT_COUNT]) {
    for slot in color_slot(1)..SLOT_COUNT {
        let base = keys[slot].base_tiles();
        if !keys[slot].is_empty()
            && keys[color_slot(0)..slot]
                .iter()
                .any(|key| !key.is_empty() && key.base_tiles() == base)
        {
            keys[slot] = RenderTargetKey::EMPTY;
        }
    }
    let depth = keys[DEPTH_SLOT];
    if !depth.is_empty()
        && keys[color_slot(0)..]
            .iter()
            .any(|key| !key.is_empty() && key.base_tiles() == depth.base_tiles())
    {
        keys[DEPTH_SLOT] = RenderTargetKey::EMPTY;
    }
}

// A draw can't write past the next render target's base without overwriting its data
fn clamp_to_next_bases(slots: &mut [Option<BoundRenderTarget>; SLOT_COUNT], clamp_to_min: bool) {
    let bases: Vec<u32> = slots.iter().flatten().map(|bound| bound.key.base_tiles()).collect();
    let distance_to_next = |base: u32| {
        bases.iter().filter(|&&other| other > base).map(|&other| other - base).min()
    };

    let min_distance = bases.iter().filter_map(|&base| distance_to_next(base)).min();
    for bound in slots.iter_mut().flatten() {
        if let Some(distance) = distance_to_next(bound.key.base_tiles()) {
            bound.length_tiles = bound.length_tiles.min(distance);
        }
        if let Some(distance) = min_distance.filter(|_| clamp_to_min) {
            bound.length_tiles = bound.length_tiles.min(distance);
        }
    }
}

/// Render targets bound across consecutive draws. Draws that bind a subset of the accumulated
/// render targets keep the accumulated set, so the render pass can stay the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindingAccumulator {
    keys: [RenderTargetKey; SLOT_COUNT],
    valid: bool,
}

impl BindingAccumulator {
    pub fn keys(&self) -> Option<&[RenderTargetKey; SLOT_COUNT]> {
        self.valid.then_some(&self.keys)
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Returns whether the previously accumulated render targets are kept.
    pub fn accumulate(&mut self, bound: &[RenderTargetKey; SLOT_COUNT]) -> bool {
        if self.valid && self.is_compatible(bound) {
            for (accumulated, &key) in self.keys.iter_mut().zip(bound) {
                if !key.is_empty() {
                    *accumulated = key;
                }
            }
            return true;
        }
        self.keys = *bound;
        self.valid = true;
        false
    }

    fn is_compatible(&self, bound: &[RenderTargetKey; SLOT_COUNT]) -> bool {
        let accumulated_shape = self.keys.iter().find(|key| !key.is_empty()).map(|key| shape(*key));
        for (slot, &key) in bound.iter().enumerate() {
            if key.is_empty() {
                continue;
            }
            if accumulated_shape.is_some_and(|accumulated| accumulated != shape(key)) {
                return false;
            }
            let accumulated = self.keys[slot];
            if !accumulated.is_empty() {
                if accumulated != key {
                    return false;
                }
                continue;
            }
            // Newly bound at a base that another accumulated render target occupies
            let collides = self.keys.iter().enumerate().any(|(other_slot, other)| {
                other_slot != slot && !other.is_empty() && other.base_tiles() == key.base_tiles()
            });
            if collides {
                return false;
            }
        }
        true
    }
}

// All attachments of a render pass share the sample count and the dimensions
fn shape(key: RenderTargetKey) -> (u32, MsaaSamples) {
    (key.pitch_tiles_at_32bpp(), key.msaa_samples())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{
        RasterizationBounds, RbColorInfo, RbColorMask, RbDepthControl, RbDepthInfo, RbModeControl,
        RbSurfaceInfo,
    };
    use crate::xenos::{ColorRenderTargetFormat, DepthRenderTargetFormat};

    const LIMITS: BindingLimits = BindingLimits {
        resolution_scale_y: 1,
        max_host_height: 16384,
        mrt_edram_used_range_clamp_to_min: false,
    };

    fn registers(color_bases: [u32; 4], depth_base: u32) -> RenderTargetRegisters {
        RenderTargetRegisters {
            surface_info: RbSurfaceInfo::from(1280),
            mode_control: RbModeControl::default()
                .with_edram_mode_bits(ModeControl::ColorDepth as u32),
            color_info: color_bases.map(|base| {
                RbColorInfo::default()
                    .with_color_base(base)
                    .with_color_format_bits(ColorRenderTargetFormat::K8888.bits())
            }),
            depth_info: RbDepthInfo::default().with_depth_base(depth_base),
            depth_control: RbDepthControl::default().with_z_enable(true),
            color_mask: RbColorMask::from(0xFFFF),
            bounds: RasterizationBounds {
                clip_disable: true,
                window_scissor_br_y: 720,
                screen_scissor_br_y: 8192,
                ..RasterizationBounds::default()
            },
        }
    }

    #[test]
    fn color_and_depth_bound() {
        let bindings = DrawBindings::from_registers(&registers([0, 0, 0, 0], 1000), 0b1, &LIMITS);
        let keys = bindings.keys();
        assert_eq!(
            keys[DEPTH_SLOT],
            RenderTargetKey::depth(1000, 16, MsaaSamples::X1, DepthRenderTargetFormat::D24S8)
        );
        assert_eq!(
            keys[color_slot(0)],
            RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888)
        );
        assert!(keys[color_slot(1)..].iter().all(|key| key.is_empty()));
        assert_eq!(bindings.height_used, 720);
        // 45 rows of 16 tiles
        assert_eq!(bindings.slots[color_slot(0)].map(|bound| bound.length_tiles), Some(720));
        assert_eq!(bindings.slots[DEPTH_SLOT].map(|bound| bound.length_tiles), Some(720));
    }

    #[test]
    fn depth_needs_depth_or_stencil_test() {
        let mut registers = registers([0, 0, 0, 0], 1000);
        registers.depth_control = RbDepthControl::default();
        let bindings = DrawBindings::from_registers(&registers, 0b1, &LIMITS);
        assert!(bindings.slots[DEPTH_SLOT].is_none());

        registers.depth_control = RbDepthControl::default().with_stencil_enable(true);
        let bindings = DrawBindings::from_registers(&registers, 0b1, &LIMITS);
        assert!(bindings.slots[DEPTH_SLOT].is_some());
    }

    #[test]
    fn depth_mode_binds_no_colors() {
        let mut registers = registers([0, 100, 200, 300], 1000);
        registers.mode_control =
            RbModeControl::default().with_edram_mode_bits(ModeControl::Depth as u32);
        let bindings = DrawBindings::from_registers(&registers, 0b1111, &LIMITS);
        assert!(bindings.slots[DEPTH_SLOT].is_some());
        assert!(bindings.slots[color_slot(0)..].iter().all(Option::is_none));

        registers.mode_control =
            RbModeControl::default().with_edram_mode_bits(ModeControl::Copy as u32);
        assert!(DrawBindings::from_registers(&registers, 0b1111, &LIMITS).is_empty());
    }

    #[test]
    fn masked_colors_not_bound() {
        let mut registers = registers([0, 100, 200, 300], 1000);
        registers.color_info[3] = registers.color_info[3]
            .with_color_format_bits(ColorRenderTargetFormat::K32Float.bits());
        // Only green written to a single-component format
        registers.color_mask = RbColorMask::from(0x2F0F);
        let bindings = DrawBindings::from_registers(&registers, 0b1011, &LIMITS);
        assert!(bindings.slots[color_slot(0)].is_some());
        assert!(bindings.slots[color_slot(1)].is_none());
        assert!(bindings.slots[color_slot(2)].is_none());
        assert!(bindings.slots[color_slot(3)].is_none());
    }

    #[test]
    fn duplicate_bases_eliminated() {
        let bindings =
            DrawBindings::from_registers(&registers([500, 0, 500, 0], 0), 0b1111, &LIMITS);
        let keys = bindings.keys();
        assert!(keys[DEPTH_SLOT].is_empty());
        assert_eq!(keys[color_slot(0)].base_tiles(), 500);
        assert_eq!(keys[color_slot(1)].base_tiles(), 0);
        assert!(keys[color_slot(2)].is_empty());
        assert!(keys[color_slot(3)].is_empty());
    }

    #[test]
    fn lengths_clamped_to_next_base() {
        let bindings =
            DrawBindings::from_registers(&registers([0, 300, 0, 0], 1000), 0b11, &LIMITS);
        let lengths = bindings.slots.map(|slot| slot.map(|bound| bound.length_tiles));
        assert_eq!(lengths[color_slot(0)], Some(300));
        assert_eq!(lengths[color_slot(1)], Some(700));
        assert_eq!(lengths[DEPTH_SLOT], Some(720));

        let clamp_to_min = BindingLimits { mrt_edram_used_range_clamp_to_min: true, ..LIMITS };
        let bindings =
            DrawBindings::from_registers(&registers([0, 300, 0, 0], 1000), 0b11, &clamp_to_min);
        assert!(bindings.bound().all(|bound| bound.length_tiles == 300));
    }

    #[test]
    fn lengths_end_at_edram_end() {
        let bindings = DrawBindings::from_registers(&registers([2000, 0, 0, 0], 0), 0b1, &LIMITS);
        let color = bindings.slots[color_slot(0)].map(|bound| bound.length_tiles);
        assert_eq!(color, Some(EDRAM_TILE_COUNT - 2000));
    }

    #[test]
    fn zero_pitch_binds_nothing() {
        let mut registers = registers([0, 0, 0, 0], 1000);
        registers.surface_info = RbSurfaceInfo::from(0);
        assert!(DrawBindings::from_registers(&registers, 0b1, &LIMITS).is_empty());
    }

    #[test]
    fn accumulation_keeps_subsets() {
        let color = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let depth =
            RenderTargetKey::depth(1000, 16, MsaaSamples::X1, DepthRenderTargetFormat::D24S8);
        let other =
            RenderTargetKey::color(300, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let mut first = [RenderTargetKey::EMPTY; SLOT_COUNT];
        first[DEPTH_SLOT] = depth;
        first[color_slot(0)] = color;

        let mut accumulator = BindingAccumulator::default();
        assert!(accumulator.keys().is_none());
        assert!(!accumulator.accumulate(&first));

        let mut depth_only = [RenderTargetKey::EMPTY; SLOT_COUNT];
        depth_only[DEPTH_SLOT] = depth;
        assert!(accumulator.accumulate(&depth_only));
        assert_eq!(accumulator.keys(), Some(&first));

        // Another slot added
        let mut with_other = depth_only;
        with_other[color_slot(1)] = other;
        assert!(accumulator.accumulate(&with_other));
        assert_eq!(accumulator.keys().map(|keys| keys[color_slot(1)]), Some(other));

        // A different render target in an accumulated slot restarts
        let mut replaced = [RenderTargetKey::EMPTY; SLOT_COUNT];
        replaced[color_slot(0)] = other.with_base_tiles(600);
        assert!(!accumulator.accumulate(&replaced));
        assert_eq!(accumulator.keys(), Some(&replaced));

        accumulator.invalidate();
        assert!(accumulator.keys().is_none());
    }

    #[test]
    fn accumulation_restarts_on_base_collision_or_shape_change() {
        let color = RenderTargetKey::color(0, 16, MsaaSamples::X1, ColorRenderTargetFormat::K8888);
        let mut first = [RenderTargetKey::EMPTY; SLOT_COUNT];
        first[color_slot(0)] = color;
        let mut accumulator = BindingAccumulator::default();
        accumulator.accumulate(&first);

        let mut colliding = [RenderTargetKey::EMPTY; SLOT_COUNT];
        colliding[color_slot(1)] = color;
        assert!(!accumulator.accumulate(&colliding));

        let mut other_msaa = [RenderTargetKey::EMPTY; SLOT_COUNT];
        other_msaa[color_slot(1)] =
            RenderTargetKey::color(300, 16, MsaaSamples::X4, ColorRenderTargetFormat::K8888);
        assert!(!accumulator.accumulate(&other_msaa));
    }
}
