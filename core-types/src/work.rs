/// Tiles assigned to one core: `[start_tile, start_tile + num_tiles)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkSplit {
    pub start_tile: usize,
    pub num_tiles: usize,
}

/// Divide `total_tiles` evenly over `cores` cores.
///
/// Every core gets `total_tiles / cores`; the remainder goes to the last core.
/// Returns one entry per core, in placement order.
pub fn split_work(total_tiles: usize, cores: usize) -> Vec<WorkSplit> {
    if cores == 0 {
        return Vec::new();
    }
    let per_core = total_tiles / cores;
    let mut start = 0;
    (0..cores)
        .map(|i| {
            let num_tiles = if i + 1 == cores { total_tiles - per_core * (cores - 1) } else { per_core };
            let split = WorkSplit { start_tile: start, num_tiles };
            start += num_tiles;
            split
        })
        .collect()
}
