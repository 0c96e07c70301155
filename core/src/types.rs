//! Thin owners of wgpu objects used by the GPU backend.

use wgpu::{BindGroupLayout, Buffer, BufferUsages, ComputePipeline};

/// What a wgpu buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Interleaved DRAM buffer bound to reader/writer stages
    Dram,
    /// Per-dispatch `[start_tile, num_tiles]` table, one row per core
    WorkTable,
    StagingIn,
    StagingOut,
}

impl From<BufferRole> for BufferUsages {
    fn from(role: BufferRole) -> Self {
        match role {
            BufferRole::Dram => BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            BufferRole::WorkTable => BufferUsages::STORAGE,
            BufferRole::StagingIn => BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC,
            BufferRole::StagingOut => BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        }
    }
}

#[derive(Debug)]
pub struct RawBuffer(pub(crate) Buffer);

impl RawBuffer {
    pub(crate) fn raw(&self) -> &Buffer {
        &self.0
    }

    pub fn size(&self) -> u64 {
        self.0.size()
    }
}

/// Bind group layout of a kernel: inputs, work table, outputs
#[derive(Debug)]
pub struct ChannelLayout(pub(crate) BindGroupLayout);

impl ChannelLayout {
    pub(crate) fn raw(&self) -> &BindGroupLayout {
        &self.0
    }
}

#[derive(Debug)]
pub struct TilePipeline(pub(crate) ComputePipeline);

impl TilePipeline {
    pub(crate) fn raw(&self) -> &ComputePipeline {
        &self.0
    }
}
