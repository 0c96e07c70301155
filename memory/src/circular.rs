use std::collections::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use core_types::{CbHandle, ChannelId, CoreCoord, DataFormat};
use ts_core::{CbConfig, Device, DeviceError};

use crate::MemoryError;

struct CbEntry {
    cores:   Vec<CoreCoord>,
    channel: ChannelId,
    bytes:   u64,
}

/// On-chip queues between the data-movement and compute stages of a core.
///
/// Every channel is paged one tile at a time. The per-core budget is the
/// L1 capacity the device reports for a single core.
#[derive(Default)]
pub struct CircularBufferManager {
    entries: Mutex<HashMap<CbHandle, CbEntry>>,
}

impl CircularBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `channel` on every core in `cores`, `capacity_in_tiles` deep.
    ///
    /// Either the channel is created on all cores or on none of them.
    pub fn create(
        &self,
        device:            &dyn Device,
        cores:             &[CoreCoord],
        channel:           ChannelId,
        capacity_in_tiles: usize,
        format:            DataFormat,
    ) -> Result<CbHandle, MemoryError> {
        let tile = format.tile_size() as u64;
        let total = capacity_in_tiles as u64 * tile;
        if total == 0 {
            return Err(MemoryError::Misaligned { size: 0, page_size: tile, tile_bytes: tile });
        }
        let budget = device.info().l1_capacity_per_core;

        let mut entries = self.entries.lock();
        for &core in cores {
            let on_core = entries.values().filter(|e| e.cores.contains(&core));
            let mut used = 0;
            for e in on_core {
                if e.channel == channel {
                    return Err(MemoryError::ChannelInUse { core, channel });
                }
                used += e.bytes;
            }
            if used + total > budget {
                return Err(MemoryError::InsufficientOnChipCapacity {
                    core,
                    channel,
                    requested: total,
                    available: budget.saturating_sub(used),
                });
            }
        }

        let config = CbConfig { channel, format, total_size: total, page_size: tile };
        let handle = device.create_circular_buffer(cores, &config).map_err(|e| match e {
            DeviceError::OutOfMemory { requested, available, .. } => MemoryError::InsufficientOnChipCapacity {
                core: cores.first().copied().unwrap_or_default(),
                channel,
                requested,
                available,
            },
            DeviceError::ChannelInUse { core, channel } => MemoryError::ChannelInUse { core, channel },
            other => MemoryError::Device(other),
        })?;
        entries.insert(handle, CbEntry { cores: cores.to_vec(), channel, bytes: total });
        debug!(%handle, %channel, tiles = capacity_in_tiles, cores = cores.len(), "circular buffer created");
        Ok(handle)
    }

    pub fn release(&self, device: &dyn Device, handle: CbHandle) {
        if self.entries.lock().remove(&handle).is_some() {
            device.release_circular_buffer(handle);
        }
    }

    /// Release every circular buffer this manager still holds
    pub fn release_all(&self, device: &dyn Device) {
        let handles: Vec<CbHandle> = self.entries.lock().drain().map(|(h, _)| h).collect();
        for handle in handles {
            device.release_circular_buffer(handle);
        }
    }

    /// L1 bytes taken by circular buffers on `core`
    pub fn used_on(&self, core: CoreCoord) -> u64 {
        self.entries
            .lock()
            .values()
            .filter(|e| e.cores.contains(&core))
            .map(|e| e.bytes)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
