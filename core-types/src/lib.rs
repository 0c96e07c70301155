mod work;

use std::fmt;

pub use work::{split_work, WorkSplit};

/// Marker‐trait so we can go from T to DataFormat
pub trait Element: bytemuck::Pod {
    const FORMAT: DataFormat;
}

include!(concat!(env!("OUT_DIR"), "/generated_data_formats.rs"));

/// Tile geometry is fixed by the hardware.
pub const TILE_WIDTH: usize = 32;
pub const TILE_HEIGHT: usize = 32;
/// Number of elements in one tile
pub const TILE_ELEMENTS: usize = TILE_WIDTH * TILE_HEIGHT;

/// Maximum number of ports per direction on a kernel (one circular buffer each)
pub const MAX_PORTS: usize = 8;

impl DataFormat {
    /// Bytes occupied by one tile of this format
    pub const fn tile_size(self) -> usize {
        self.size_in_bytes() * TILE_ELEMENTS
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.vendor_name())
    }
}

/// Number of whole tiles needed to hold `elements` elements.
pub fn tile_count(elements: usize) -> usize {
    elements.div_ceil(TILE_ELEMENTS)
}

/// Type alias for a buffer identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);
impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

/// Handle of a circular buffer allocation (one channel on a set of cores)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CbHandle(pub u64);
impl fmt::Display for CbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CbHandle({})", self.0)
    }
}

/// Memory tier a buffer lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// on-chip SRAM, small and fast
    L1,
    /// off-chip DRAM, large
    Dram,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::L1 => f.write_str("L1"),
            MemoryTier::Dram => f.write_str("DRAM"),
        }
    }
}

/// Logical circular-buffer channel on a core.
///
/// Inputs use ids `0..8` (`c_in0..c_in7`), outputs `16..24` (`c_out0..c_out7`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    const OUTPUT_BASE: u8 = 16;

    pub fn input(index: usize) -> Self {
        debug_assert!(index < MAX_PORTS);
        ChannelId(index as u8)
    }

    pub fn output(index: usize) -> Self {
        debug_assert!(index < MAX_PORTS);
        ChannelId(Self::OUTPUT_BASE + index as u8)
    }

    pub fn is_output(self) -> bool {
        self.0 >= Self::OUTPUT_BASE
    }

    /// Position within its direction
    pub fn index(self) -> usize {
        if self.is_output() { (self.0 - Self::OUTPUT_BASE) as usize } else { self.0 as usize }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_output() {
            write!(f, "c_out{}", self.index())
        } else {
            write!(f, "c_in{}", self.index())
        }
    }
}

/// Physical core on the grid
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreCoord {
    pub x: u32,
    pub y: u32,
}

impl CoreCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Size of the compute grid
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GridSize {
    pub x: u32,
    pub y: u32,
}

impl GridSize {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn num_cores(self) -> usize {
        self.x as usize * self.y as usize
    }

    /// Row-major core lookup, `None` past the end of the grid
    pub fn core_at(self, index: usize) -> Option<CoreCoord> {
        if index >= self.num_cores() {
            return None;
        }
        let x = (index % self.x as usize) as u32;
        let y = (index / self.x as usize) as u32;
        Some(CoreCoord { x, y })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bf16_tile_is_2048_bytes() {
        assert_eq!(DataFormat::Float16B.size_in_bytes(), 2);
        assert_eq!(DataFormat::Float16B.tile_size(), 2048);
        assert_eq!(<half::bf16 as Element>::FORMAT, DataFormat::Float16B);
        assert_eq!(DataFormat::Float16B.to_string(), "Float16_b");
    }

    #[test]
    fn tile_count_edges() {
        assert_eq!(tile_count(0), 0);
        assert_eq!(tile_count(1), 1);
        assert_eq!(tile_count(1024), 1);
        assert_eq!(tile_count(1025), 2);
        assert_eq!(tile_count(2048), 2);
    }

    #[test]
    fn channel_names() {
        assert_eq!(ChannelId::input(2).to_string(), "c_in2");
        assert_eq!(ChannelId::output(0).to_string(), "c_out0");
        assert_eq!(ChannelId::output(0).0, 16);
        assert!(ChannelId::output(3).is_output());
        assert_eq!(ChannelId::output(3).index(), 3);
    }

    #[test]
    fn grid_is_row_major() {
        let grid = GridSize::new(4, 2);
        assert_eq!(grid.num_cores(), 8);
        assert_eq!(grid.core_at(0), Some(CoreCoord::new(0, 0)));
        assert_eq!(grid.core_at(5), Some(CoreCoord::new(1, 1)));
        assert_eq!(grid.core_at(8), None);
    }

    proptest! {
        #[test]
        fn tile_count_is_ceiling(n in 0usize..10_000_000) {
            let t = tile_count(n);
            prop_assert!(t * TILE_ELEMENTS >= n);
            prop_assert!(t == 0 || (t - 1) * TILE_ELEMENTS < n);
        }

        #[test]
        fn exact_multiples_need_no_padding(tiles in 0usize..10_000) {
            prop_assert_eq!(tile_count(tiles * TILE_ELEMENTS), tiles);
        }
    }
}
