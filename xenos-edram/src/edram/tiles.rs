//! EDRAM tile addressing and the sample mapping between render targets sharing EDRAM tiles
//!
//! A tile is 80x16 dwords. At 32bpp each dword is one sample, at 64bpp sample `c` of a row spans
//! dwords `2c` (low half) and `2c + 1` (high half). 4x MSAA doubles the sample count
//! horizontally and 2x/4x double it vertically, so a tile covers fewer pixels. Depth render
//! targets store the left and the right 40-dword halves of their tiles swapped compared to color.
//!
//! With resolution scaling every dimension of a tile is multiplied by the scale along that axis,
//! the tile count stays the same.

use crate::xenos::{
    MsaaSamples, EDRAM_TILE_COUNT_MASK, EDRAM_TILE_HALF_WIDTH_SAMPLES, EDRAM_TILE_HEIGHT_SAMPLES,
    EDRAM_TILE_WIDTH_SAMPLES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolutionScale {
    pub x: u32,
    pub y: u32,
}

impl Default for ResolutionScale {
    fn default() -> Self {
        Self::NATIVE
    }
}

impl ResolutionScale {
    pub const NATIVE: Self = Self { x: 1, y: 1 };

    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }

    pub fn tile_dwords(self) -> u32 {
        EDRAM_TILE_WIDTH_SAMPLES * self.x * EDRAM_TILE_HEIGHT_SAMPLES * self.y
    }
}

/// How a render target's samples are laid out in its tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SurfaceLayout {
    pub msaa_samples: MsaaSamples,
    pub is_64bpp: bool,
    pub is_depth: bool,
}

impl SurfaceLayout {
    pub fn new(msaa_samples: MsaaSamples, is_64bpp: bool, is_depth: bool) -> Self {
        Self { msaa_samples, is_64bpp, is_depth }
    }

    pub fn tile_width_samples(self) -> u32 {
        EDRAM_TILE_WIDTH_SAMPLES >> u32::from(self.is_64bpp)
    }

    pub fn tile_width_pixels(self) -> u32 {
        self.tile_width_samples() >> self.msaa_samples.x_log2()
    }

    pub fn tile_height_pixels(self) -> u32 {
        EDRAM_TILE_HEIGHT_SAMPLES >> self.msaa_samples.y_log2()
    }

    /// Dword columns holding the sample in sample column `column` of a tile.
    pub fn dword_columns(self, column: u32, scale: ResolutionScale) -> DwordColumns {
        if self.is_64bpp {
            // 64bpp depth doesn't exist, no swapping
            DwordColumns::Two(column * 2)
        } else {
            DwordColumns::One(swap_depth_columns(column, self.is_depth, scale))
        }
    }

    /// Sample column and the half of the sample stored in dword column `dword_column`.
    pub fn sample_column(self, dword_column: u32, scale: ResolutionScale) -> (u32, SampleHalf) {
        if self.is_64bpp {
            (dword_column >> 1, SampleHalf::from_bit(dword_column & 1))
        } else {
            (swap_depth_columns(dword_column, self.is_depth, scale), SampleHalf::Low)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwordColumns {
    One(u32),
    // Low half in the first column, high half in the next
    Two(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleHalf {
    Low,
    High,
}

impl SampleHalf {
    pub fn from_bit(bit: u32) -> Self {
        if bit & 1 != 0 {
            Self::High
        } else {
            Self::Low
        }
    }
}

/// Swaps the two 40-sample halves of a 32bpp tile row for depth render targets. Applying it
/// twice is the identity, so one function converts in both directions.
pub fn swap_depth_columns(dword_column: u32, is_depth: bool, scale: ResolutionScale) -> u32 {
    if is_depth {
        let half = EDRAM_TILE_HALF_WIDTH_SAMPLES * scale.x;
        (dword_column + half) % (half * 2)
    } else {
        dword_column
    }
}

/// Wraps a tile index into the EDRAM. EDRAM addressing is circular.
pub fn wrap_tile(tile: i64) -> u32 {
    (tile as u32) & EDRAM_TILE_COUNT_MASK
}

/// Index of a dword in the EDRAM buffer. The buffer stores tiles contiguously, rows of a tile
/// contiguously within it.
pub fn edram_dword_index(tile: u32, row: u32, dword_column: u32, scale: ResolutionScale) -> u32 {
    (tile & EDRAM_TILE_COUNT_MASK) * scale.tile_dwords()
        + row * EDRAM_TILE_WIDTH_SAMPLES * scale.x
        + dword_column
}

/// Guest MSAA sample ordinate within a pixel, x is only used at 4x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuestSample {
    pub x: u32,
    pub y: u32,
}

/// Number of samples in host images of the given guest MSAA mode.
pub fn host_sample_count(msaa_samples: MsaaSamples, native_2x_msaa: bool) -> u32 {
    match msaa_samples {
        MsaaSamples::X1 => 1,
        MsaaSamples::X2 if native_2x_msaa => 2,
        MsaaSamples::X2 | MsaaSamples::X4 => 4,
    }
}

/// Host sample index storing a guest sample, for the standard Vulkan sample locations.
///
/// At 4x the guest and the host both number samples left to right, top to bottom. At 2x the
/// guest numbers the top sample 0 while Vulkan places sample 0 at the bottom. Without native 2x
/// support, 2x is emulated with the top-left and bottom-right samples of 4x.
pub fn guest_sample_to_host(
    msaa_samples: MsaaSamples,
    sample: GuestSample,
    native_2x_msaa: bool,
) -> u32 {
    match msaa_samples {
        MsaaSamples::X1 => 0,
        MsaaSamples::X2 if native_2x_msaa => sample.y ^ 1,
        MsaaSamples::X2 => sample.y * 3,
        MsaaSamples::X4 => sample.x | (sample.y << 1),
    }
}

/// Inverse of [`guest_sample_to_host`]. The unused 4x samples of emulated 2x map to the guest
/// sample of their row.
pub fn host_sample_to_guest(
    msaa_samples: MsaaSamples,
    host_sample: u32,
    native_2x_msaa: bool,
) -> GuestSample {
    match msaa_samples {
        MsaaSamples::X1 => GuestSample::default(),
        MsaaSamples::X2 if native_2x_msaa => GuestSample { x: 0, y: (host_sample & 1) ^ 1 },
        MsaaSamples::X2 => GuestSample { x: 0, y: (host_sample >> 1) & 1 },
        MsaaSamples::X4 => GuestSample { x: host_sample & 1, y: (host_sample >> 1) & 1 },
    }
}

/// Position of a sample within the tiles of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileSample {
    // Tile index relative to the render target base, row-major with the render target's pitch
    pub tile: u32,
    // Sample column within the tile, scaled
    pub column: u32,
    // Sample row within the tile, scaled
    pub row: u32,
}

/// Maps a host pixel and guest sample of a render target to its position in the tiles.
pub fn pixel_to_tile_sample(
    layout: SurfaceLayout,
    pitch_tiles: u32,
    pixel: (u32, u32),
    sample: GuestSample,
    scale: ResolutionScale,
) -> TileSample {
    let msaa = layout.msaa_samples;
    let sample_x = (pixel.0 << msaa.x_log2()) | sample.x;
    let sample_y = (pixel.1 << msaa.y_log2()) | sample.y;
    let tile_width = layout.tile_width_samples() * scale.x;
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES * scale.y;
    TileSample {
        tile: (sample_y / tile_height) * pitch_tiles + sample_x / tile_width,
        column: sample_x % tile_width,
        row: sample_y % tile_height,
    }
}

/// Inverse of [`pixel_to_tile_sample`].
pub fn tile_sample_to_pixel(
    layout: SurfaceLayout,
    pitch_tiles: u32,
    tile_sample: TileSample,
    scale: ResolutionScale,
) -> ((u32, u32), GuestSample) {
    let msaa = layout.msaa_samples;
    let tile_width = layout.tile_width_samples() * scale.x;
    let tile_height = EDRAM_TILE_HEIGHT_SAMPLES * scale.y;
    let sample_x = (tile_sample.tile % pitch_tiles) * tile_width + tile_sample.column;
    let sample_y = (tile_sample.tile / pitch_tiles) * tile_height + tile_sample.row;
    let x_mask = (1 << msaa.x_log2()) - 1;
    let y_mask = (1 << msaa.y_log2()) - 1;
    (
        (sample_x >> msaa.x_log2(), sample_y >> msaa.y_log2()),
        GuestSample { x: sample_x & x_mask, y: sample_y & y_mask },
    )
}

/// One side of an ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferSurface {
    pub layout: SurfaceLayout,
    // Pitch in tiles of the surface's own bits per pixel
    pub pitch_tiles: u32,
}

/// A source sample read needed to produce one dword of a destination sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceRead {
    pub pixel: (u32, u32),
    pub host_sample: u32,
    pub half: SampleHalf,
}

/// Tile and sample arithmetic shared by the transfer shaders, on the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMapping {
    pub dest: TransferSurface,
    pub source: TransferSurface,
    // Destination base tile minus the source base tile
    pub source_to_dest_tiles: i32,
    pub native_2x_msaa: bool,
    pub scale: ResolutionScale,
}

impl TransferMapping {
    /// Source reads producing the destination sample at a host pixel and host sample. The result
    /// has one read per dword of the destination sample, low dword first.
    pub fn source_reads(&self, dest_pixel: (u32, u32), dest_host_sample: u32) -> Vec<SourceRead> {
        let dest = self.dest;
        let source = self.source;
        let guest_sample =
            host_sample_to_guest(dest.layout.msaa_samples, dest_host_sample, self.native_2x_msaa);
        let dest_tile_sample = pixel_to_tile_sample(
            dest.layout,
            dest.pitch_tiles,
            dest_pixel,
            guest_sample,
            self.scale,
        );

        let source_tile = wrap_tile(
            i64::from(dest_tile_sample.tile) + i64::from(self.source_to_dest_tiles),
        );

        let dword_columns = match dest.layout.dword_columns(dest_tile_sample.column, self.scale) {
            DwordColumns::One(column) => vec![column],
            DwordColumns::Two(column) => vec![column, column + 1],
        };

        dword_columns
            .into_iter()
            .map(|dword_column| {
                let (source_column, half) = source.layout.sample_column(dword_column, self.scale);
                let (pixel, sample) = tile_sample_to_pixel(
                    source.layout,
                    source.pitch_tiles,
                    TileSample {
                        tile: source_tile,
                        column: source_column,
                        row: dest_tile_sample.row,
                    },
                    self.scale,
                );
                SourceRead {
                    pixel,
                    host_sample: guest_sample_to_host(
                        source.layout.msaa_samples,
                        sample,
                        self.native_2x_msaa,
                    ),
                    half,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xenos::EDRAM_TILE_COUNT;
    use std::collections::HashSet;

    const SCALES: [ResolutionScale; 3] = [
        ResolutionScale::NATIVE,
        ResolutionScale { x: 2, y: 2 },
        ResolutionScale { x: 3, y: 1 },
    ];

    fn layouts() -> Vec<SurfaceLayout> {
        let mut layouts = Vec::new();
        for msaa_samples in MsaaSamples::ALL {
            layouts.push(SurfaceLayout::new(msaa_samples, false, false));
            layouts.push(SurfaceLayout::new(msaa_samples, true, false));
            layouts.push(SurfaceLayout::new(msaa_samples, false, true));
        }
        layouts
    }

    #[test]
    fn tile_pixel_sizes() {
        let color_4x_64bpp = SurfaceLayout::new(MsaaSamples::X4, true, false);
        assert_eq!(color_4x_64bpp.tile_width_pixels(), 20);
        assert_eq!(color_4x_64bpp.tile_height_pixels(), 8);
        let depth_2x = SurfaceLayout::new(MsaaSamples::X2, false, true);
        assert_eq!(depth_2x.tile_width_pixels(), 80);
        assert_eq!(depth_2x.tile_height_pixels(), 8);
    }

    #[test]
    fn tile_address_bijection() {
        for scale in SCALES {
            for layout in layouts() {
                let msaa = layout.msaa_samples;
                let width = layout.tile_width_pixels() * scale.x;
                let height = layout.tile_height_pixels() * scale.y;
                let mut offsets = HashSet::new();
                for y in 0..height {
                    for x in 0..width {
                        for sample_y in 0..(1 << msaa.y_log2()) {
                            for sample_x in 0..(1 << msaa.x_log2()) {
                                let sample = GuestSample { x: sample_x, y: sample_y };
                                let tile_sample =
                                    pixel_to_tile_sample(layout, 1, (x, y), sample, scale);
                                assert_eq!(tile_sample.tile, 0);
                                assert_eq!(
                                    tile_sample_to_pixel(layout, 1, tile_sample, scale),
                                    ((x, y), sample)
                                );
                                let columns = layout.dword_columns(tile_sample.column, scale);
                                let columns = match columns {
                                    DwordColumns::One(column) => vec![column],
                                    DwordColumns::Two(column) => vec![column, column + 1],
                                };
                                for column in columns {
                                    let offset =
                                        edram_dword_index(0, tile_sample.row, column, scale);
                                    assert!(offset < scale.tile_dwords());
                                    assert!(
                                        offsets.insert(offset),
                                        "{layout:?} {x} {y} {sample:?}"
                                    );
                                }
                            }
                        }
                    }
                }
                assert_eq!(offsets.len() as u32, scale.tile_dwords(), "{layout:?} {scale:?}");
            }
        }
    }

    #[test]
    fn wraparound_matches_euclidean_modulo() {
        let count = i64::from(EDRAM_TILE_COUNT);
        for tile in (0..count).step_by(7) {
            for offset in -2 * count..=2 * count {
                let wrapped = wrap_tile(tile + offset);
                assert!(wrapped < EDRAM_TILE_COUNT);
                assert_eq!(i64::from(wrapped), (tile + offset).rem_euclid(count));
            }
        }
    }

    #[test]
    fn msaa_2x_mapping_is_self_inverse() {
        for native_2x_msaa in [false, true] {
            let host_samples: HashSet<_> = (0..2)
                .map(|y| {
                    let sample = GuestSample { x: 0, y };
                    let host = guest_sample_to_host(MsaaSamples::X2, sample, native_2x_msaa);
                    assert!(host < host_sample_count(MsaaSamples::X2, native_2x_msaa));
                    assert_eq!(host_sample_to_guest(MsaaSamples::X2, host, native_2x_msaa), sample);
                    host
                })
                .collect();
            assert_eq!(host_samples.len(), 2);
        }
        // Emulated 2x uses the top-left and the bottom-right samples of 4x
        assert_eq!(guest_sample_to_host(MsaaSamples::X2, GuestSample { x: 0, y: 1 }, false), 3);
        // Vulkan's 2x sample 0 is the bottom one
        assert_eq!(guest_sample_to_host(MsaaSamples::X2, GuestSample { x: 0, y: 0 }, true), 1);
    }

    #[test]
    fn msaa_4x_mapping_round_trip() {
        for host in 0..4 {
            let sample = host_sample_to_guest(MsaaSamples::X4, host, true);
            assert_eq!(guest_sample_to_host(MsaaSamples::X4, sample, false), host);
        }
    }

    #[test]
    fn depth_column_swap_is_involution() {
        for scale in SCALES {
            for column in 0..EDRAM_TILE_WIDTH_SAMPLES * scale.x {
                let swapped = swap_depth_columns(column, true, scale);
                assert_ne!(swapped, column);
                assert_eq!(swap_depth_columns(swapped, true, scale), column);
                assert_eq!(swap_depth_columns(column, false, scale), column);
            }
        }
    }

    fn surface(msaa_samples: MsaaSamples, is_64bpp: bool, is_depth: bool) -> TransferSurface {
        // 8 tiles at 32bpp
        TransferSurface {
            layout: SurfaceLayout::new(msaa_samples, is_64bpp, is_depth),
            pitch_tiles: 8 << u32::from(is_64bpp),
        }
    }

    // Emulated 2x only stores the top-left and the bottom-right 4x samples
    fn used_host_samples(msaa_samples: MsaaSamples, native_2x_msaa: bool) -> Vec<u32> {
        if msaa_samples == MsaaSamples::X2 && !native_2x_msaa {
            vec![0, 3]
        } else {
            (0..host_sample_count(msaa_samples, native_2x_msaa)).collect()
        }
    }

    #[test]
    fn cross_bpp_halves_cover_dest_sample() {
        for native_2x_msaa in [false, true] {
            for dest_msaa in MsaaSamples::ALL {
                for source_msaa in MsaaSamples::ALL {
                    for (dest_64bpp, source_64bpp) in [(true, false), (false, true), (true, true)] {
                        let mapping = TransferMapping {
                            dest: surface(dest_msaa, dest_64bpp, false),
                            source: surface(source_msaa, source_64bpp, false),
                            source_to_dest_tiles: 0,
                            native_2x_msaa,
                            scale: ResolutionScale::NATIVE,
                        };
                        let dest_layout = mapping.dest.layout;
                        for y in 0..dest_layout.tile_height_pixels() {
                            for x in 0..dest_layout.tile_width_pixels() {
                                for host_sample in used_host_samples(dest_msaa, native_2x_msaa) {
                                    check_halves(&mapping, (x, y), host_sample);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn check_halves(mapping: &TransferMapping, pixel: (u32, u32), host_sample: u32) {
        let reads = mapping.source_reads(pixel, host_sample);
        let dest = mapping.dest.layout;
        let source = mapping.source.layout;

        let guest_sample =
            host_sample_to_guest(dest.msaa_samples, host_sample, mapping.native_2x_msaa);
        let tile_sample = pixel_to_tile_sample(
            dest,
            mapping.dest.pitch_tiles,
            pixel,
            guest_sample,
            mapping.scale,
        );
        let expected_columns = match dest.dword_columns(tile_sample.column, mapping.scale) {
            DwordColumns::One(column) => vec![column],
            DwordColumns::Two(column) => vec![column, column + 1],
        };
        assert_eq!(reads.len(), expected_columns.len());

        // Each read must address exactly the dword the destination expects, and no dword twice
        let mut covered = HashSet::new();
        for (read, column) in reads.iter().zip(expected_columns) {
            let source_guest_sample = host_sample_to_guest(
                source.msaa_samples,
                read.host_sample,
                mapping.native_2x_msaa,
            );
            let source_tile_sample = pixel_to_tile_sample(
                source,
                mapping.source.pitch_tiles,
                read.pixel,
                source_guest_sample,
                mapping.scale,
            );
            let columns = source.dword_columns(source_tile_sample.column, mapping.scale);
            let source_column = match columns {
                DwordColumns::One(column) => column,
                DwordColumns::Two(column) => {
                    column + u32::from(read.half == SampleHalf::High)
                }
            };
            assert_eq!(source_column, column);
            assert_eq!(source_tile_sample.row, tile_sample.row);
            assert!(covered.insert(source_column));
        }

        if dest.is_64bpp && !source.is_64bpp {
            assert!(reads.iter().all(|read| read.half == SampleHalf::Low));
            assert_ne!(reads[0], reads[1]);
        }
        if dest.is_64bpp && source.is_64bpp {
            assert_eq!(
                (reads[0].pixel, reads[0].host_sample),
                (reads[1].pixel, reads[1].host_sample)
            );
            assert_eq!((reads[0].half, reads[1].half), (SampleHalf::Low, SampleHalf::High));
        }
    }

    #[test]
    fn emulated_2x_rows_map_to_their_guest_row() {
        let mapping = TransferMapping {
            dest: surface(MsaaSamples::X2, false, false),
            source: surface(MsaaSamples::X1, false, false),
            source_to_dest_tiles: 0,
            native_2x_msaa: false,
            scale: ResolutionScale::NATIVE,
        };
        let layout = mapping.dest.layout;
        for y in 0..layout.tile_height_pixels() {
            for x in 0..layout.tile_width_pixels() {
                // Host sample 0 is the top guest sample, 3 the bottom one
                assert_eq!(mapping.source_reads((x, y), 0)[0].pixel, (x, 2 * y));
                assert_eq!(mapping.source_reads((x, y), 3)[0].pixel, (x, 2 * y + 1));
            }
        }
    }

    #[test]
    fn color_depth_transfer_swaps_halves_once() {
        let mapping = TransferMapping {
            dest: surface(MsaaSamples::X1, false, true),
            source: surface(MsaaSamples::X1, false, false),
            source_to_dest_tiles: 0,
            native_2x_msaa: true,
            scale: ResolutionScale::NATIVE,
        };
        // Depth pixel 0 is stored in the right half of the tile
        assert_eq!(mapping.source_reads((0, 0), 0)[0].pixel, (40, 0));
        assert_eq!(mapping.source_reads((45, 3), 0)[0].pixel, (5, 3));

        let same_kind = TransferMapping {
            dest: surface(MsaaSamples::X1, false, true),
            source: surface(MsaaSamples::X1, false, true),
            ..mapping
        };
        assert_eq!(same_kind.source_reads((45, 3), 0)[0].pixel, (45, 3));
    }

    #[test]
    fn transfer_source_tile_wraps() {
        let mapping = TransferMapping {
            dest: surface(MsaaSamples::X1, false, false),
            source: surface(MsaaSamples::X1, false, false),
            // Destination at tile 0, source at tile 2040: destination tile 0 is source tile 8
            source_to_dest_tiles: -2040,
            native_2x_msaa: true,
            scale: ResolutionScale::NATIVE,
        };
        assert_eq!(mapping.source_reads((0, 0), 0)[0].pixel, (0, 16));
    }

    #[test]
    fn msaa_change_remaps_samples() {
        // 1x source, 4x destination: destination pixel (x, y) sample (sx, sy) is EDRAM sample
        // (2x + sx, 2y + sy), which is a source pixel
        let mapping = TransferMapping {
            dest: surface(MsaaSamples::X4, false, false),
            source: surface(MsaaSamples::X1, false, false),
            source_to_dest_tiles: 0,
            native_2x_msaa: true,
            scale: ResolutionScale::NATIVE,
        };
        assert_eq!(mapping.source_reads((3, 2), 3)[0], SourceRead {
            pixel: (7, 5),
            host_sample: 0,
            half: SampleHalf::Low,
        });
    }
}
