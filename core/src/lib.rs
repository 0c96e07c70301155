//! Device runtime boundary.
//!
//! Everything the graph compiler needs from an accelerator goes through the
//! [`Device`] trait: buffer and circular-buffer allocation, blocking
//! transfers, program dispatch. The device is always passed explicitly so the
//! compiler can be driven by the in-process [`SimDevice`] or by the wgpu
//! backend ([`GpuContext`]) without code changes.

pub mod gpu;
pub mod program;
pub mod sim;
pub mod types;

use core_types::{BufferId, CbHandle, ChannelId, CoreCoord, DataFormat, GridSize, MemoryTier};
use thiserror::Error;

pub use gpu::GpuContext;
pub use program::{BinaryOp, ChannelBinding, DeviceProgram, KernelBinary, KernelSources, TileExpr, UnaryOp};
pub use sim::{Fault, SimConfig, SimDevice};

/// Static description of a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub grid: GridSize,
    /// Total DRAM capacity, bytes
    pub dram_capacity: u64,
    /// L1 capacity of a single core, bytes
    pub l1_capacity_per_core: u64,
}

impl DeviceInfo {
    /// Total capacity of a memory tier (L1 is summed over the grid)
    pub fn tier_capacity(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Dram => self.dram_capacity,
            MemoryTier::L1 => self.l1_capacity_per_core * self.grid.num_cores() as u64,
        }
    }
}

/// Interleaved buffer request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub page_size: u64,
    pub tier: MemoryTier,
}

/// One circular-buffer channel, replicated on every core it is created on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CbConfig {
    pub channel: ChannelId,
    pub format: DataFormat,
    pub total_size: u64,
    pub page_size: u64,
}

/// Runtime arguments of one core: the tile range it works on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreWork {
    pub core: CoreCoord,
    pub start_tile: usize,
    pub num_tiles: usize,
}

/// Errors reported by a device backend
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of {tier} memory: requested {requested} bytes, {available} available")]
    OutOfMemory { tier: MemoryTier, requested: u64, available: u64 },

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("{channel} already exists on core {core}")]
    ChannelInUse { core: CoreCoord, channel: ChannelId },

    #[error("size mismatch on {buffer}: buffer holds {buffer_size} bytes, transfer is {transfer_size}")]
    SizeMismatch { buffer: BufferId, buffer_size: u64, transfer_size: u64 },

    #[error("transfer on {buffer} failed: {reason}")]
    Transfer { buffer: BufferId, reason: String },

    #[error("dispatch of `{kernel}` on core {core} failed: {reason}")]
    Dispatch { kernel: String, core: CoreCoord, reason: String },

    #[error("backend error: {0}")]
    Backend(String),
}

/// The accelerator runtime.
///
/// Implementations own all device-side state; handles returned here stay
/// valid until released.
pub trait Device: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Another handle to the same device state
    fn share(&self) -> Box<dyn Device>;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, DeviceError>;

    fn release_buffer(&self, id: BufferId);

    fn create_circular_buffer(&self, cores: &[CoreCoord], config: &CbConfig) -> Result<CbHandle, DeviceError>;

    fn release_circular_buffer(&self, handle: CbHandle);

    /// Host → device. `data` may be shorter than the buffer.
    fn write_buffer(&self, id: BufferId, data: &[u8], blocking: bool) -> Result<(), DeviceError>;

    /// Device → host. Fills `out` from the start of the buffer.
    fn read_buffer(&self, id: BufferId, out: &mut [u8], blocking: bool) -> Result<(), DeviceError>;

    /// Launch `program` on every core listed in `work`.
    fn run(&self, program: &DeviceProgram, work: &[CoreWork]) -> Result<(), DeviceError>;

    /// Block until all dispatched work has completed.
    fn finish(&self) -> Result<(), DeviceError>;
}
