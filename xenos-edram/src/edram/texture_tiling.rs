//! Guest tiled texture addressing, used to place resolved pixels in guest memory
//!
//! Textures are stored in 32x32 (2D) or 32x16x4 (3D) macro tiles. Within 256-byte groups the
//! address bits are interleaved with pipe and bank bits derived from the coordinates.

pub const MACRO_TILE_WIDTH_LOG2: u32 = 5;
pub const MACRO_TILE_HEIGHT_2D_LOG2: u32 = 5;
pub const MACRO_TILE_HEIGHT_3D_LOG2: u32 = 4;
pub const MACRO_TILE_DEPTH_LOG2: u32 = 2;

// Pitch and height of tiled textures are stored aligned to this many blocks
pub const STORAGE_PITCH_HEIGHT_ALIGNMENT: u32 = 32;
pub const STORAGE_DEPTH_ALIGNMENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiledLayout {
    TwoD { pitch_aligned: u32 },
    ThreeD { pitch_aligned: u32, height_aligned: u32 },
}

impl TiledLayout {
    pub fn offset(self, x: i32, y: i32, z: i32, bytes_per_block_log2: u32) -> i64 {
        match self {
            Self::TwoD { pitch_aligned } => {
                i64::from(tiled_2d(x, y, pitch_aligned, bytes_per_block_log2))
            }
            Self::ThreeD { pitch_aligned, height_aligned } => {
                tiled_3d(x, y, z, pitch_aligned, height_aligned, bytes_per_block_log2)
            }
        }
    }
}

fn tiled_combine(outer_inner_bytes: i64, bank: u32, pipe: u32, y_lsb: u32) -> i64 {
    debug_assert!(bank <= 1 && pipe <= 3 && y_lsb <= 1);
    i64::from((y_lsb << 4) | (pipe << 6) | (bank << 11))
        | (outer_inner_bytes & 0b1111)
        | (((outer_inner_bytes >> 4) & 0b1) << 5)
        | (((outer_inner_bytes >> 5) & 0b111) << 8)
        | ((outer_inner_bytes >> 8) << 12)
}

/// Byte offset of a block in a 2D tiled texture. `pitch_aligned` must be a multiple of 32.
pub fn tiled_2d(x: i32, y: i32, pitch_aligned: u32, bytes_per_block_log2: u32) -> i32 {
    debug_assert_eq!(pitch_aligned % STORAGE_PITCH_HEIGHT_ALIGNMENT, 0);
    let outer_blocks = ((y >> MACRO_TILE_HEIGHT_2D_LOG2)
        * (pitch_aligned >> MACRO_TILE_WIDTH_LOG2) as i32
        + (x >> MACRO_TILE_WIDTH_LOG2))
        << 6;
    let inner_blocks = (((y >> 1) & 0b111) << 3) | (x & 0b111);
    let outer_inner_bytes = (outer_blocks | inner_blocks) << bytes_per_block_log2;
    let bank = ((y >> 4) & 0b1) as u32;
    let pipe = (((x >> 3) & 0b11) ^ (((y >> 3) & 0b1) << 1)) as u32;
    tiled_combine(i64::from(outer_inner_bytes), bank, pipe, (y & 1) as u32) as i32
}

/// Byte offset of a block in a 3D tiled texture. Pitch and height must be multiples of 32.
pub fn tiled_3d(
    x: i32,
    y: i32,
    z: i32,
    pitch_aligned: u32,
    height_aligned: u32,
    bytes_per_block_log2: u32,
) -> i64 {
    debug_assert_eq!(pitch_aligned % STORAGE_PITCH_HEIGHT_ALIGNMENT, 0);
    debug_assert_eq!(height_aligned % STORAGE_PITCH_HEIGHT_ALIGNMENT, 0);
    let outer_blocks = (((z >> MACRO_TILE_DEPTH_LOG2)
        * (height_aligned >> MACRO_TILE_HEIGHT_3D_LOG2) as i32
        + (y >> MACRO_TILE_HEIGHT_3D_LOG2))
        * (pitch_aligned >> MACRO_TILE_WIDTH_LOG2) as i32
        + (x >> MACRO_TILE_WIDTH_LOG2))
        << 7;
    let inner_blocks = ((z & 0b11) << 5) | (((y >> 1) & 0b11) << 3) | (x & 0b111);
    let outer_inner_bytes = i64::from(outer_blocks | inner_blocks) << bytes_per_block_log2;
    let bank = (((y >> 3) ^ (z >> 2)) & 0b1) as u32;
    let pipe = (((x >> 3) & 0b11) as u32) ^ (bank << 1);
    tiled_combine(outer_inner_bytes, bank, pipe, (y & 1) as u32)
}

pub fn align_storage_pitch_height(value: u32) -> u32 {
    value.next_multiple_of(STORAGE_PITCH_HEIGHT_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn known_offsets() {
        assert_eq!(tiled_2d(5, 3, 32, 2), 308);
        assert_eq!(tiled_2d(40, 17, 64, 2), 6224);
        assert_eq!(tiled_3d(9, 20, 5, 32, 32, 2), 28356);
    }

    #[test]
    fn tiled_2d_is_injective() {
        for bytes_per_block_log2 in 0..5 {
            let offsets: HashSet<_> = (0..32)
                .flat_map(|y| (0..64).map(move |x| (x, y)))
                .map(|(x, y)| tiled_2d(x, y, 64, bytes_per_block_log2))
                .collect();
            assert_eq!(offsets.len(), 64 * 32);
            if bytes_per_block_log2 >= 1 {
                // Exactly fills the two macro tiles
                let block_size = 1 << bytes_per_block_log2;
                assert!(offsets.iter().all(|&offset| offset % block_size == 0));
                assert_eq!(*offsets.iter().max().unwrap(), (64 * 32 - 1) * block_size);
            }
        }
    }

    #[test]
    fn tiled_3d_fills_macro_tiles() {
        for bytes_per_block_log2 in 0..5 {
            let mut offsets = HashSet::new();
            for z in 0..8 {
                for y in 0..32 {
                    for x in 0..32 {
                        offsets.insert(tiled_3d(x, y, z, 32, 32, bytes_per_block_log2));
                    }
                }
            }
            let block_size = 1_i64 << bytes_per_block_log2;
            assert_eq!(offsets.len(), 32 * 32 * 8);
            assert!(offsets.iter().all(|&offset| offset % block_size == 0));
            assert_eq!(*offsets.iter().max().unwrap(), (32 * 32 * 8 - 1) * block_size);
        }
    }

    #[test]
    fn layout_dispatch() {
        let two_d = TiledLayout::TwoD { pitch_aligned: 64 };
        assert_eq!(two_d.offset(40, 17, 3, 2), 6224);
        let three_d = TiledLayout::ThreeD { pitch_aligned: 32, height_aligned: 32 };
        assert_eq!(three_d.offset(9, 20, 5, 2), 28356);
        assert_eq!(align_storage_pitch_height(1280), 1280);
        assert_eq!(align_storage_pitch_height(1281), 1312);
    }
}
