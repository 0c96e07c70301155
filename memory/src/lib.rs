mod circular;
mod pool;

use bytemuck::{cast_slice, Pod};
use thiserror::Error;
use tracing::debug;

use core_types::{BufferId, ChannelId, CoreCoord, DataFormat, MemoryTier};
use ts_core::{BufferDesc, Device, DeviceError};

pub use circular::CircularBufferManager;
pub use pool::{BufferEntry, BufferPool};

/// Errors of the buffer and circular-buffer allocators
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("buffer of {size} bytes in pages of {page_size} is not aligned to {tile_bytes}-byte tiles")]
    Misaligned { size: u64, page_size: u64, tile_bytes: u64 },

    #[error("{tier} capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { tier: MemoryTier, requested: u64, available: u64 },

    #[error("insufficient on-chip capacity for {channel} on core {core}: requested {requested} bytes, {available} available")]
    InsufficientOnChipCapacity { core: CoreCoord, channel: ChannelId, requested: u64, available: u64 },

    #[error("{channel} is already allocated on core {core}")]
    ChannelInUse { core: CoreCoord, channel: ChannelId },

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("transfer on {buffer} failed")]
    Transfer { buffer: BufferId, #[source] source: DeviceError },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Allocates interleaved buffers on a device and remembers what it handed out.
///
/// The device is passed to every call; the manager only keeps bookkeeping,
/// so one manager can be dropped into any owner that knows its device.
pub struct MemoryManager {
    tile_bytes: u64,
    pool:       BufferPool,
}

impl MemoryManager {
    /// Manager aligning every allocation to tiles of `format`
    pub fn new(format: DataFormat) -> Self {
        Self { tile_bytes: format.tile_size() as u64, pool: BufferPool::new() }
    }

    /// Reserve `byte_size` bytes of `tier`, interleaved in `page_size` pages.
    pub fn allocate(
        &self,
        device:    &dyn Device,
        byte_size: u64,
        page_size: u64,
        tier:      MemoryTier,
    ) -> Result<BufferId, MemoryError> {
        let tile = self.tile_bytes;
        if byte_size == 0 || page_size == 0 || byte_size % tile != 0 || page_size % tile != 0 || byte_size % page_size != 0 {
            return Err(MemoryError::Misaligned { size: byte_size, page_size, tile_bytes: tile });
        }

        let id = device
            .create_buffer(&BufferDesc { size: byte_size, page_size, tier })
            .map_err(|e| match e {
                DeviceError::OutOfMemory { tier, requested, available } => {
                    MemoryError::CapacityExceeded { tier, requested, available }
                }
                other => MemoryError::Device(other),
            })?;
        self.pool.insert(id, BufferEntry { size: byte_size, page_size, tier });
        debug!(%id, byte_size, page_size, %tier, "buffer allocated");
        Ok(id)
    }

    /// Reserve room for `n_tiles` tiles of `format`.
    ///
    /// L1 buffers are paged one tile at a time; DRAM buffers use a single
    /// page covering the whole buffer.
    pub fn allocate_tiles(
        &self,
        device:  &dyn Device,
        n_tiles: usize,
        format:  DataFormat,
        tier:    MemoryTier,
    ) -> Result<BufferId, MemoryError> {
        let tile = format.tile_size() as u64;
        let size = n_tiles as u64 * tile;
        let page = match tier {
            MemoryTier::L1 => tile,
            MemoryTier::Dram => size,
        };
        self.allocate(device, size, page, tier)
    }

    /// Raw deallocation
    pub fn release(&self, device: &dyn Device, id: BufferId) {
        if self.pool.remove(id).is_some() {
            device.release_buffer(id);
        }
    }

    /// Release every buffer this manager still holds
    pub fn release_all(&self, device: &dyn Device) {
        for id in self.pool.drain() {
            device.release_buffer(id);
        }
    }

    /// Blocking upload: CPU → device.
    pub fn write<T: Pod>(&self, device: &dyn Device, id: BufferId, data: &[T]) -> Result<(), MemoryError> {
        let entry = self.pool.get(id).ok_or(MemoryError::UnknownBuffer(id))?;
        let bytes: &[u8] = cast_slice(data);
        if bytes.len() as u64 > entry.size {
            return Err(MemoryError::Transfer {
                buffer: id,
                source: DeviceError::SizeMismatch { buffer: id, buffer_size: entry.size, transfer_size: bytes.len() as u64 },
            });
        }
        device
            .write_buffer(id, bytes, true)
            .map_err(|source| MemoryError::Transfer { buffer: id, source })?;
        debug!(%id, bytes = bytes.len(), "buffer written");
        Ok(())
    }

    /// Blocking download: device → CPU into `out`.
    pub fn read(&self, device: &dyn Device, id: BufferId, out: &mut [u8]) -> Result<(), MemoryError> {
        if self.pool.get(id).is_none() {
            return Err(MemoryError::UnknownBuffer(id));
        }
        device
            .read_buffer(id, out, true)
            .map_err(|source| MemoryError::Transfer { buffer: id, source })?;
        debug!(%id, bytes = out.len(), "buffer read");
        Ok(())
    }

    /// Blocking download of a whole buffer into a `Vec<T>`
    pub fn read_to_vec<T: Pod>(&self, device: &dyn Device, id: BufferId) -> Result<Vec<T>, MemoryError> {
        let entry = self.pool.get(id).ok_or(MemoryError::UnknownBuffer(id))?;
        let mut bytes = vec![0u8; entry.size as usize];
        self.read(device, id, &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes[..]))
    }

    pub fn get(&self, id: BufferId) -> Option<BufferEntry> {
        self.pool.get(id)
    }

    /// Bytes this manager holds in `tier`
    pub fn used(&self, tier: MemoryTier) -> u64 {
        self.pool.used(tier)
    }

    /// Number of live buffers
    pub fn live(&self) -> usize {
        self.pool.len()
    }
}
