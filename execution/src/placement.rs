use core_types::{split_work, CoreCoord, GridSize};
use tracing::info;
use ts_core::CoreWork;

use crate::MapError;

/// Cores of one kernel and the tile range each of them works on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPlacement {
    pub cores: Vec<CoreCoord>,
    pub work: Vec<CoreWork>,
}

/// Hands out consecutive cores of a grid in row-major order
pub(crate) struct CoreAllocator {
    grid: GridSize,
    next: usize,
}

impl CoreAllocator {
    pub(crate) fn new(grid: GridSize) -> Self {
        Self { grid, next: 0 }
    }

    /// Place a kernel of `tiles` tiles on up to `cores_per_kernel` cores.
    ///
    /// A kernel never takes more cores than it has tiles, and always at
    /// least one.
    pub(crate) fn place(&mut self, kernel: &str, tiles: usize, cores_per_kernel: usize) -> Result<KernelPlacement, MapError> {
        let needed = cores_per_kernel.min(tiles).max(1);
        let available = self.grid.num_cores() - self.next;
        if needed > available {
            return Err(MapError::GridExhausted { kernel: kernel.into(), needed, available });
        }
        let cores: Vec<CoreCoord> = (self.next..self.next + needed)
            .filter_map(|i| self.grid.core_at(i))
            .collect();
        self.next += needed;

        let work: Vec<CoreWork> = cores
            .iter()
            .zip(split_work(tiles, needed))
            .map(|(&core, split)| CoreWork { core, start_tile: split.start_tile, num_tiles: split.num_tiles })
            .collect();

        info!(kernel, tiles, cores = needed, "kernel placed");
        for w in &work {
            info!(kernel, core = %w.core, start = w.start_tile, tiles = w.num_tiles, "core work");
        }
        Ok(KernelPlacement { cores, work })
    }
}
