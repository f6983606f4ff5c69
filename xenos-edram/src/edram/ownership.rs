//! Tracking of which render target holds the latest data of every EDRAM tile
//!
//! The map always covers all 2048 tiles with consecutive ranges, and adjacent ranges with the
//! same owners are always merged. When a render target claims tiles owned by another one, the
//! data has to be transferred between them, described by [`Transfer`]s.

use crate::edram::RenderTargetKey;
use crate::xenos::{
    DepthRenderTargetFormat, MsaaSamples, EDRAM_TILE_COUNT, EDRAM_TILE_HEIGHT_SAMPLES,
    EDRAM_TILE_WIDTH_SAMPLES,
};
use std::collections::{BTreeMap, HashSet};

pub const MAX_RECTANGLES_WITHOUT_CUTOUT: usize = 3;
pub const MAX_CUTOUT_BORDER_RECTANGLES: usize = 4;
pub const MAX_RECTANGLES_WITH_CUTOUT: usize =
    MAX_RECTANGLES_WITHOUT_CUTOUT * MAX_CUTOUT_BORDER_RECTANGLES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    pub x_pixels: u32,
    pub y_pixels: u32,
    pub width_pixels: u32,
    pub height_pixels: u32,
}

impl Rectangle {
    pub fn new(x_pixels: u32, y_pixels: u32, width_pixels: u32, height_pixels: u32) -> Self {
        Self { x_pixels, y_pixels, width_pixels, height_pixels }
    }

    pub fn right(&self) -> u32 {
        self.x_pixels + self.width_pixels
    }

    pub fn bottom(&self) -> u32 {
        self.y_pixels + self.height_pixels
    }

    pub fn is_empty(&self) -> bool {
        self.width_pixels == 0 || self.height_pixels == 0
    }
}

/// Copying of a range of tiles from `source` into the render target that the transfer was
/// produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub start_tiles: u32,
    pub end_tiles: u32,
    pub source: RenderTargetKey,
    // Render target with the latest host depth for the destination's depth format, if that's
    // not the source. Equal to the destination if the host depth must be read from the EDRAM
    // buffer after a host depth store.
    pub host_depth_source: Option<RenderTargetKey>,
}

impl Transfer {
    pub fn rectangles(&self, dest: RenderTargetKey, cutout: Option<&Rectangle>) -> Vec<Rectangle> {
        range_rectangles(
            self.start_tiles,
            self.end_tiles,
            dest.base_tiles(),
            dest.pitch_tiles(),
            dest.msaa_samples(),
            dest.is_64bpp(),
            cutout,
        )
    }

    pub fn are_sources_same(&self, other: &Self) -> bool {
        self.source == other.source && self.host_depth_source == other.host_depth_source
    }
}

/// Pixel rectangles of a render target covering the tiles `[start_tiles, end_tiles)`: the
/// partial first row, the full middle rows and the partial last row, merged where the spans
/// match. Rectangles are additionally split around the cutout, excluding it.
pub fn range_rectangles(
    start_tiles: u32,
    end_tiles: u32,
    base_tiles: u32,
    pitch_tiles: u32,
    msaa_samples: MsaaSamples,
    is_64bpp: bool,
    cutout: Option<&Rectangle>,
) -> Vec<Rectangle> {
    debug_assert!(start_tiles <= end_tiles);
    debug_assert!(base_tiles <= start_tiles);
    debug_assert_ne!(pitch_tiles, 0);

    let mut rectangles = Vec::new();
    if start_tiles == end_tiles {
        return rectangles;
    }

    let tile_width =
        EDRAM_TILE_WIDTH_SAMPLES >> (msaa_samples.x_log2() + u32::from(is_64bpp));
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES >> msaa_samples.y_log2();

    let local_start = start_tiles - base_tiles;
    let local_end = end_tiles - base_tiles;
    let rows_start = local_start / pitch_tiles;
    let rows_end = local_end.div_ceil(pitch_tiles);
    let row_first_start = local_start - rows_start * pitch_tiles;
    let row_last_end = pitch_tiles - (rows_end * pitch_tiles - local_end);
    let rows = rows_end - rows_start;

    if rows == 1 || row_first_start != 0 {
        let row_end = if rows == 1 { row_last_end } else { pitch_tiles };
        let first = Rectangle::new(
            row_first_start * tile_width,
            rows_start * tile_height,
            (row_end - row_first_start) * tile_width,
            tile_height,
        );
        add_rectangle(first, cutout, &mut rectangles);
        if rows == 1 {
            return rectangles;
        }
    }

    let mut mid_rows_start = rows_start + 1;
    let mut mid_rows = rows - 2;
    if row_first_start == 0 {
        mid_rows_start -= 1;
        mid_rows += 1;
    }
    if row_last_end == pitch_tiles {
        mid_rows += 1;
    }
    if mid_rows != 0 {
        let middle = Rectangle::new(
            0,
            mid_rows_start * tile_height,
            pitch_tiles * tile_width,
            mid_rows * tile_height,
        );
        add_rectangle(middle, cutout, &mut rectangles);
    }

    if row_last_end != pitch_tiles {
        let last = Rectangle::new(
            0,
            (rows_end - 1) * tile_height,
            row_last_end * tile_width,
            tile_height,
        );
        add_rectangle(last, cutout, &mut rectangles);
    }

    debug_assert!(
        rectangles.len()
            <= if cutout.is_some() {
                MAX_RECTANGLES_WITH_CUTOUT
            } else {
                MAX_RECTANGLES_WITHOUT_CUTOUT
            }
    );
    rectangles
}

fn add_rectangle(rectangle: Rectangle, cutout: Option<&Rectangle>, out: &mut Vec<Rectangle>) {
    let Some(cutout) = cutout.filter(|cutout| {
        !cutout.is_empty()
            && cutout.x_pixels < rectangle.right()
            && cutout.right() > rectangle.x_pixels
            && cutout.y_pixels < rectangle.bottom()
            && cutout.bottom() > rectangle.y_pixels
    }) else {
        // Nothing intersecting to cut out
        out.push(rectangle);
        return;
    };

    let old_len = out.len();

    if cutout.y_pixels > rectangle.y_pixels {
        out.push(Rectangle::new(
            rectangle.x_pixels,
            rectangle.y_pixels,
            rectangle.width_pixels,
            cutout.y_pixels - rectangle.y_pixels,
        ));
    }

    let middle_top = cutout.y_pixels.max(rectangle.y_pixels);
    let middle_height = cutout.bottom().min(rectangle.bottom()) - middle_top;
    if cutout.x_pixels > rectangle.x_pixels {
        out.push(Rectangle::new(
            rectangle.x_pixels,
            middle_top,
            cutout.x_pixels - rectangle.x_pixels,
            middle_height,
        ));
    }
    if cutout.right() < rectangle.right() {
        out.push(Rectangle::new(
            cutout.right(),
            middle_top,
            rectangle.right() - cutout.right(),
            middle_height,
        ));
    }

    if cutout.bottom() < rectangle.bottom() {
        out.push(Rectangle::new(
            rectangle.x_pixels,
            cutout.bottom(),
            rectangle.width_pixels,
            rectangle.bottom() - cutout.bottom(),
        ));
    }

    debug_assert!(out.len() - old_len <= MAX_CUTOUT_BORDER_RECTANGLES);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnershipRange {
    end_tiles: u32,
    // Latest owner
    render_target: RenderTargetKey,
    // Latest owners of the host depth for each guest depth format, when the host stores depth
    // with a different encoding than the guest.
    host_depth_render_target_unorm24: RenderTargetKey,
    host_depth_render_target_float24: RenderTargetKey,
}

impl OwnershipRange {
    fn empty(end_tiles: u32) -> Self {
        Self {
            end_tiles,
            render_target: RenderTargetKey::EMPTY,
            host_depth_render_target_unorm24: RenderTargetKey::EMPTY,
            host_depth_render_target_float24: RenderTargetKey::EMPTY,
        }
    }

    fn host_depth_render_target(&self, format: DepthRenderTargetFormat) -> RenderTargetKey {
        match format {
            DepthRenderTargetFormat::D24S8 => self.host_depth_render_target_unorm24,
            DepthRenderTargetFormat::D24FS8 => self.host_depth_render_target_float24,
        }
    }

    fn set_host_depth_render_target(
        &mut self,
        format: DepthRenderTargetFormat,
        key: RenderTargetKey,
    ) {
        match format {
            DepthRenderTargetFormat::D24S8 => self.host_depth_render_target_unorm24 = key,
            DepthRenderTargetFormat::D24FS8 => self.host_depth_render_target_float24 = key,
        }
    }

    // host_depth_format is the destination's depth format if its host encoding differs
    fn is_owned_by(
        &self,
        key: RenderTargetKey,
        host_depth_format: Option<DepthRenderTargetFormat>,
    ) -> bool {
        if self.render_target != key {
            return false;
        }
        // The depth may have been last written through a render target with another format
        host_depth_format.is_none_or(|format| self.host_depth_render_target(format) == key)
    }

    fn are_owners_same(&self, other: &Self) -> bool {
        self.render_target == other.render_target
            && self.host_depth_render_target_unorm24 == other.host_depth_render_target_unorm24
            && self.host_depth_render_target_float24 == other.host_depth_render_target_float24
    }
}

/// Part of a resolve area owned by one render target, in tile rows of the resolve area.
///
/// With `rows == 1` it covers `[row_first_start, row_last_end)` of row `row_first`. Otherwise
/// the first row starts at `row_first_start`, the last row ends at `row_last_end`, and rows in
/// between are fully covered up to the used row length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveCopyDumpRectangle {
    pub render_target: RenderTargetKey,
    pub row_first: u32,
    pub rows: u32,
    pub row_first_start: u32,
    pub row_last_end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpDispatch {
    // Relative to the resolve area base, base plus offset may exceed the tile count because of
    // EDRAM wrapping
    pub offset: u32,
    pub width_tiles: u32,
    pub height_tiles: u32,
}

pub const MAX_DUMP_DISPATCHES: usize = 3;

impl ResolveCopyDumpRectangle {
    pub fn dispatches(&self, pitch_tiles: u32, row_length_used: u32) -> Vec<DumpDispatch> {
        let mut dispatches = Vec::with_capacity(MAX_DUMP_DISPATCHES);
        if self.rows == 0 {
            return dispatches;
        }

        if self.rows == 1 || self.row_first_start != 0 {
            let row_end = if self.rows == 1 { self.row_last_end } else { row_length_used };
            dispatches.push(DumpDispatch {
                offset: self.row_first * pitch_tiles + self.row_first_start,
                width_tiles: row_end - self.row_first_start,
                height_tiles: 1,
            });
            if self.rows == 1 {
                return dispatches;
            }
        }

        let mut mid_row_first = self.row_first + 1;
        let mut mid_rows = self.rows - 2;
        if self.row_first_start == 0 {
            mid_row_first -= 1;
            mid_rows += 1;
        }
        if self.row_last_end == row_length_used {
            mid_rows += 1;
        }
        if mid_rows != 0 {
            dispatches.push(DumpDispatch {
                offset: mid_row_first * pitch_tiles,
                width_tiles: row_length_used,
                height_tiles: mid_rows,
            });
        }

        if self.row_last_end != row_length_used {
            dispatches.push(DumpDispatch {
                offset: (self.row_first + self.rows - 1) * pitch_tiles,
                width_tiles: self.row_last_end,
                height_tiles: 1,
            });
        }

        dispatches
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipMap {
    // Range start tile -> range
    ranges: BTreeMap<u32, OwnershipRange>,
}

impl Default for OwnershipMap {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipMap {
    pub fn new() -> Self {
        Self { ranges: BTreeMap::from([(0, OwnershipRange::empty(EDRAM_TILE_COUNT))]) }
    }

    /// Forgets all owners, for when the whole EDRAM is known to be synchronized.
    pub fn reset(&mut self) {
        if self.ranges.len() == 1 {
            if let Some(range) = self.ranges.get_mut(&0) {
                *range = OwnershipRange::empty(EDRAM_TILE_COUNT);
                return;
            }
        }
        *self = Self::new();
    }

    /// `(start, end, owner)` of every range, in order.
    pub fn owners(&self) -> impl Iterator<Item = (u32, u32, RenderTargetKey)> + '_ {
        self.ranges.iter().map(|(&start, range)| (start, range.end_tiles, range.render_target))
    }

    /// Every render target holding the latest data or host depth of some tiles.
    pub fn render_targets_in_use(&self) -> HashSet<RenderTargetKey> {
        self.ranges
            .values()
            .flat_map(|range| {
                [
                    range.render_target,
                    range.host_depth_render_target_unorm24,
                    range.host_depth_render_target_float24,
                ]
            })
            .filter(|key| !key.is_empty())
            .collect()
    }

    // Start of the range containing the tile
    fn range_start_containing(&self, tile: u32) -> u32 {
        self.ranges.range(..=tile).next_back().map_or(0, |(&start, _)| start)
    }

    /// Whether claiming the tiles would require copying data from another render target.
    pub fn would_ownership_change_require_transfers(
        &self,
        dest: RenderTargetKey,
        start_tiles: u32,
        length_tiles: u32,
        host_depth_encoding_different: bool,
    ) -> bool {
        debug_assert!(start_tiles >= dest.base_tiles());
        debug_assert!(length_tiles <= EDRAM_TILE_COUNT - start_tiles);
        if length_tiles == 0 {
            return false;
        }
        let host_depth_format = dest.depth_format().filter(|_| host_depth_encoding_different);
        let end_tiles = start_tiles + length_tiles;
        self.ranges
            .range(self.range_start_containing(start_tiles)..end_tiles)
            .filter(|(_, range)| !range.is_owned_by(dest, host_depth_format))
            .any(|(_, range)| !range.render_target.is_empty() && range.render_target != dest)
    }

    /// Makes `dest` the owner of the tiles, appending the transfers needed to preserve the data
    /// currently in other render targets. Ranges fully inside the cutout (being cleared) don't
    /// need a transfer. `exists` reports whether a render target is available as a source.
    #[allow(clippy::too_many_arguments)]
    pub fn change_ownership(
        &mut self,
        dest: RenderTargetKey,
        start_tiles: u32,
        length_tiles: u32,
        host_depth_encoding_different: bool,
        mut transfers_out: Option<&mut Vec<Transfer>>,
        cutout: Option<&Rectangle>,
        exists: impl Fn(RenderTargetKey) -> bool,
    ) {
        debug_assert!(start_tiles >= dest.base_tiles());
        debug_assert!(length_tiles <= EDRAM_TILE_COUNT - start_tiles);
        if length_tiles == 0 {
            return;
        }
        let host_depth_format = dest.depth_format().filter(|_| host_depth_encoding_different);
        let end_tiles = start_tiles + length_tiles;

        // Split the head if a different owner's range overlaps the start
        let head_start = self.range_start_containing(start_tiles);
        if head_start < start_tiles {
            if let Some(head) = self.ranges.get_mut(&head_start) {
                if head.end_tiles > start_tiles && !head.is_owned_by(dest, host_depth_format) {
                    let tail = *head;
                    head.end_tiles = start_tiles;
                    self.ranges.insert(start_tiles, tail);
                }
            }
        }

        let mut cursor = start_tiles;
        while let Some((&range_start, &range)) = self.ranges.range(cursor..).next() {
            if range_start >= end_tiles {
                break;
            }
            if range.is_owned_by(dest, host_depth_format) {
                cursor = range.end_tiles;
                continue;
            }

            let mut claimed = range;
            if claimed.end_tiles > end_tiles {
                // Split the tail
                self.ranges.insert(end_tiles, range);
                claimed.end_tiles = end_tiles;
            }

            if let Some(transfers) = transfers_out.as_deref_mut() {
                Self::add_transfer(
                    transfers,
                    dest,
                    range_start,
                    &claimed,
                    host_depth_format,
                    cutout,
                    &exists,
                );
            }

            claimed.render_target = dest;
            if let Some(format) = host_depth_format {
                claimed.set_host_depth_render_target(format, dest);
            }

            // Merge with the next range
            if let Some(next) = self.ranges.get(&claimed.end_tiles).copied() {
                if next.are_owners_same(&claimed) {
                    self.ranges.remove(&claimed.end_tiles);
                    claimed.end_tiles = next.end_tiles;
                }
            }
            cursor = claimed.end_tiles;

            // Merge with the previous range
            let previous = self.ranges.range_mut(..range_start).next_back();
            match previous {
                Some((_, previous)) if previous.are_owners_same(&claimed) => {
                    previous.end_tiles = claimed.end_tiles;
                    self.ranges.remove(&range_start);
                }
                _ => {
                    self.ranges.insert(range_start, claimed);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_transfer(
        transfers: &mut Vec<Transfer>,
        dest: RenderTargetKey,
        range_start: u32,
        range: &OwnershipRange,
        host_depth_format: Option<DepthRenderTargetFormat>,
        cutout: Option<&Rectangle>,
        exists: &impl Fn(RenderTargetKey) -> bool,
    ) {
        let source = range.render_target;
        // Only copy when the latest owner changes, not just the latest host depth owner
        if source.is_empty() || source == dest {
            return;
        }

        if cutout.is_some()
            && range_rectangles(
                range_start,
                range.end_tiles,
                dest.base_tiles(),
                dest.pitch_tiles(),
                dest.msaa_samples(),
                dest.is_64bpp(),
                cutout,
            )
            .is_empty()
        {
            return;
        }

        let host_depth_source = host_depth_format
            .map(|format| range.host_depth_render_target(format))
            .filter(|&key| !key.is_empty() && key != source);

        if let Some(last) = transfers.last_mut() {
            if last.end_tiles == range_start
                && last.source == source
                && last.host_depth_source == host_depth_source
            {
                last.end_tiles = range.end_tiles;
                return;
            }
        }

        if exists(source) && host_depth_source.is_none_or(exists) {
            transfers.push(Transfer {
                start_tiles: range_start,
                end_tiles: range.end_tiles,
                source,
                host_depth_source,
            });
        }
    }

    /// Parts of the resolve area, `rows` tile rows of `row_length` tiles with `pitch`, owned by
    /// render targets, which need to be dumped to the EDRAM buffer before resolving.
    pub fn resolve_copy_rectangles_to_dump(
        &self,
        base: u32,
        row_length: u32,
        rows: u32,
        pitch: u32,
    ) -> Vec<ResolveCopyDumpRectangle> {
        debug_assert!(row_length <= pitch);
        let row_length = row_length.min(pitch);
        let mut rectangles = Vec::new();
        if row_length == 0 || rows == 0 {
            return rectangles;
        }
        let resolve_area_end = base + (rows - 1) * pitch + row_length;

        let mut iter = self.ranges.range(self.range_start_containing(base)..).peekable();
        while let Some((&start, range)) = iter.next() {
            let range_global_start = start.max(base);
            if range_global_start >= resolve_area_end {
                break;
            }
            let key = range.render_target;
            if key.is_empty() {
                continue;
            }
            // Ranges differing only by host depth ownership don't matter for resolving
            let mut range_end = range.end_tiles;
            while let Some(&(&next_start, next)) = iter.peek() {
                if next_start >= resolve_area_end || next.render_target != key {
                    break;
                }
                range_end = next.end_tiles;
                iter.next();
            }

            let local_start = range_global_start - base;
            let local_end = range_end.min(resolve_area_end) - base;
            debug_assert!(local_start < local_end);

            let mut rows_start = local_start / pitch;
            let rows_end = local_end.div_ceil(pitch);
            let mut row_first_start = local_start - rows_start * pitch;
            if row_first_start >= row_length {
                // The first row starts in the pitch padding
                if rows_start + 1 < rows_end {
                    rows_start += 1;
                    row_first_start = 0;
                } else {
                    continue;
                }
            }

            rectangles.push(ResolveCopyDumpRectangle {
                render_target: key,
                row_first: rows_start,
                rows: rows_end - rows_start,
                row_first_start,
                // Without the pitch padding in the last row
                row_last_end: (pitch - (rows_end * pitch - local_end)).min(row_length),
            });
        }

        rectangles
    }
}
